//! Bounds-checked view of a loaded PE image.
//!
//! All addressing goes through relative virtual addresses validated against
//! the view length, so no raw `base + rva` arithmetic escapes this module.
//! The header structs are our own `#[repr(C)]` definitions rather than the
//! `windows` crate's, which keeps the walker usable against synthetic images
//! in tests.

use std::mem;

use anyhow::{anyhow, bail, Result};

#[cfg(windows)]
use windows::Win32::Foundation::HMODULE;
#[cfg(windows)]
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
#[cfg(windows)]
use windows::Win32::System::ProcessStatus::{GetModuleInformation, MODULEINFO};
#[cfg(windows)]
use windows::Win32::System::Threading::GetCurrentProcess;

const DOS_MAGIC: u16 = 0x5A4D; // "MZ"
const NT_SIGNATURE: u32 = 0x4550; // "PE\0\0"
const OPTIONAL_MAGIC_64: u16 = 0x20B;
const IMAGE_DIRECTORY_ENTRY_IMPORT: usize = 1;
const ORDINAL_FLAG_64: u64 = 1 << 63;

pub const SCN_MEM_EXECUTE: u32 = 0x2000_0000;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ImageDosHeader {
    pub e_magic: u16,
    pub e_cblp: u16,
    pub e_cp: u16,
    pub e_crlc: u16,
    pub e_cparhdr: u16,
    pub e_minalloc: u16,
    pub e_maxalloc: u16,
    pub e_ss: u16,
    pub e_sp: u16,
    pub e_csum: u16,
    pub e_ip: u16,
    pub e_cs: u16,
    pub e_lfarlc: u16,
    pub e_ovno: u16,
    pub e_res: [u16; 4],
    pub e_oemid: u16,
    pub e_oeminfo: u16,
    pub e_res2: [u16; 10],
    pub e_lfanew: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ImageFileHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ImageDataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ImageOptionalHeader64 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub checksum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
    pub data_directory: [ImageDataDirectory; 16],
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ImageNtHeaders64 {
    pub signature: u32,
    pub file_header: ImageFileHeader,
    pub optional_header: ImageOptionalHeader64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ImageSectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: u32,
}

impl ImageSectionHeader {
    pub fn name(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(8);
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    pub fn is_executable(&self) -> bool {
        self.characteristics & SCN_MEM_EXECUTE != 0
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ImageImportDescriptor {
    pub original_first_thunk: u32,
    pub time_date_stamp: u32,
    pub forwarder_chain: u32,
    pub name: u32,
    pub first_thunk: u32,
}

/// An import thunk entry on PE32+.
#[derive(Clone, Copy, Debug)]
pub enum ImportThunk {
    Ordinal(u16),
    /// RVA of the `IMAGE_IMPORT_BY_NAME` entry (hint + NUL-terminated name).
    Name(u32),
}

impl ImportThunk {
    pub fn from_raw(raw: u64) -> Option<ImportThunk> {
        match raw {
            0 => None,
            _ if raw & ORDINAL_FLAG_64 != 0 => Some(ImportThunk::Ordinal(raw as u16)),
            _ => Some(ImportThunk::Name(raw as u32)),
        }
    }
}

/// A readable window over one loaded image.
pub struct ImageView {
    base: *mut u8,
    len: usize,
}

impl ImageView {
    /// # Safety
    /// `base..base + len` must be a readable mapping of a PE image for the
    /// lifetime of the view. Writes through [`ImageView::write`] additionally
    /// require the touched range to be writable.
    pub const unsafe fn new(base: *mut u8, len: usize) -> ImageView {
        ImageView { base, len }
    }

    /// View over a loaded module.
    #[cfg(windows)]
    pub unsafe fn module(module: HMODULE) -> Result<ImageView> {
        let mut info = MODULEINFO::default();
        GetModuleInformation(
            GetCurrentProcess(),
            module,
            &mut info,
            mem::size_of::<MODULEINFO>() as u32,
        )?;
        Ok(ImageView::new(
            info.lpBaseOfDll as *mut u8,
            info.SizeOfImage as usize,
        ))
    }

    /// View over the main executable.
    #[cfg(windows)]
    pub unsafe fn main_module() -> Result<ImageView> {
        Self::module(GetModuleHandleW(None)?)
    }

    pub fn base(&self) -> usize {
        self.base as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Absolute address of `rva`, validated for `size` bytes.
    fn check(&self, rva: u32, size: usize) -> Result<usize> {
        (rva as usize)
            .checked_add(size)
            .filter(|&end| end <= self.len)
            .ok_or_else(|| anyhow!("rva {:#x}+{:#x} outside image of {:#x} bytes", rva, size, self.len))?;
        Ok(self.base as usize + rva as usize)
    }

    pub fn read<T: Copy>(&self, rva: u32) -> Result<T> {
        let addr = self.check(rva, mem::size_of::<T>())?;
        Ok(unsafe { (addr as *const T).read_unaligned() })
    }

    pub fn write<T: Copy>(&self, rva: u32, value: T) -> Result<()> {
        let addr = self.check(rva, mem::size_of::<T>())?;
        unsafe { (addr as *mut T).write_unaligned(value) };
        Ok(())
    }

    pub fn bytes(&self, rva: u32, len: usize) -> Result<&[u8]> {
        let addr = self.check(rva, len)?;
        Ok(unsafe { std::slice::from_raw_parts(addr as *const u8, len) })
    }

    /// NUL-terminated ASCII string at `rva`, bounded by the view end.
    pub fn cstr(&self, rva: u32) -> Result<&str> {
        if rva as usize >= self.len {
            bail!("rva {:#x} outside image of {:#x} bytes", rva, self.len);
        }
        let tail = self.bytes(rva, self.len - rva as usize)?;
        let end = memchr::memchr(0, tail)
            .ok_or_else(|| anyhow!("unterminated string at rva {:#x}", rva))?;
        std::str::from_utf8(&tail[..end])
            .map_err(|_| anyhow!("non-ASCII string at rva {:#x}", rva))
    }

    pub fn dos_header(&self) -> Result<ImageDosHeader> {
        let dos: ImageDosHeader = self.read(0)?;
        if dos.e_magic != DOS_MAGIC {
            bail!("bad DOS magic {:#x}", dos.e_magic);
        }
        Ok(dos)
    }

    fn nt_offset(&self) -> Result<u32> {
        let dos = self.dos_header()?;
        if dos.e_lfanew <= 0 {
            bail!("bad e_lfanew {:#x}", dos.e_lfanew);
        }
        Ok(dos.e_lfanew as u32)
    }

    pub fn nt_headers(&self) -> Result<ImageNtHeaders64> {
        let nt: ImageNtHeaders64 = self.read(self.nt_offset()?)?;
        if nt.signature != NT_SIGNATURE {
            bail!("bad NT signature {:#x}", nt.signature);
        }
        if nt.optional_header.magic != OPTIONAL_MAGIC_64 {
            bail!("not a PE32+ image (optional magic {:#x})", nt.optional_header.magic);
        }
        Ok(nt)
    }

    pub fn sections(&self) -> Result<Vec<ImageSectionHeader>> {
        let nt_offset = self.nt_offset()?;
        let nt = self.nt_headers()?;
        let first = nt_offset
            + 4
            + mem::size_of::<ImageFileHeader>() as u32
            + nt.file_header.size_of_optional_header as u32;
        (0..nt.file_header.number_of_sections as u32)
            .map(|i| self.read(first + i * mem::size_of::<ImageSectionHeader>() as u32))
            .collect()
    }

    pub fn section(&self, name: &str) -> Result<Option<ImageSectionHeader>> {
        Ok(self.sections()?.into_iter().find(|s| s.name() == name))
    }

    /// Absolute address and length of the first executable section, the
    /// default range for signature scans.
    pub fn code_section(&self) -> Result<(usize, usize)> {
        let section = self
            .sections()?
            .into_iter()
            .find(ImageSectionHeader::is_executable)
            .ok_or_else(|| anyhow!("image has no executable section"))?;
        Ok((
            self.base() + section.virtual_address as usize,
            section.virtual_size as usize,
        ))
    }

    /// The import descriptor chain, ended by its all-zero terminator.
    pub fn import_descriptors(&self) -> Result<Vec<ImageImportDescriptor>> {
        let nt = self.nt_headers()?;
        let dir = nt.optional_header.data_directory[IMAGE_DIRECTORY_ENTRY_IMPORT];
        if dir.virtual_address == 0 {
            bail!("image has no import directory");
        }
        let mut descriptors = Vec::new();
        let mut rva = dir.virtual_address;
        loop {
            let desc: ImageImportDescriptor = self.read(rva)?;
            if desc.name == 0 && desc.first_thunk == 0 {
                break;
            }
            descriptors.push(desc);
            rva += mem::size_of::<ImageImportDescriptor>() as u32;
        }
        Ok(descriptors)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn view(buf: &mut [u8]) -> ImageView {
        unsafe { ImageView::new(buf.as_mut_ptr(), buf.len()) }
    }

    #[test]
    fn rejects_garbage() {
        let mut buf = vec![0u8; 0x200];
        assert!(view(&mut buf).dos_header().is_err());
        // reversed magic is still not MZ
        buf[0] = 0x5A;
        buf[1] = 0x4D;
        assert!(view(&mut buf).dos_header().is_err());
        buf[0] = 0x4D;
        buf[1] = 0x5A;
        assert!(view(&mut buf).dos_header().is_ok());
        // e_lfanew of zero never points at NT headers
        assert!(view(&mut buf).nt_headers().is_err());
    }

    #[test]
    fn rejects_truncated_nt_headers() {
        let mut buf = testimg::build();
        buf.truncate(0x90);
        assert!(view(&mut buf).nt_headers().is_err());
    }

    #[test]
    fn header_round_trip() {
        let mut buf = testimg::build();
        let view = view(&mut buf);
        let nt = view.nt_headers().unwrap();
        assert_eq!(nt.file_header.machine, 0x8664);
        assert_eq!(nt.file_header.number_of_sections, 2);
        assert_eq!(nt.optional_header.size_of_image as usize, testimg::IMAGE_SIZE);
    }

    #[test]
    fn section_lookup() {
        let mut buf = testimg::build();
        let view = view(&mut buf);
        let sections = view.sections().unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].name(), ".text");
        assert!(sections[0].is_executable());
        assert_eq!(sections[1].name(), ".idata");
        assert!(!sections[1].is_executable());
        assert!(view.section(".idata").unwrap().is_some());
        assert!(view.section(".data").unwrap().is_none());
    }

    #[test]
    fn code_section_bounds() {
        let mut buf = testimg::build();
        let base = buf.as_ptr() as usize;
        let (addr, len) = view(&mut buf).code_section().unwrap();
        assert_eq!(addr, base + testimg::TEXT_RVA as usize);
        assert_eq!(len, testimg::TEXT_SIZE as usize);
    }

    #[test]
    fn bounds_checked_access() {
        let mut buf = testimg::build();
        let view = view(&mut buf);
        assert!(view.read::<u64>(testimg::IMAGE_SIZE as u32 - 4).is_err());
        assert!(view.bytes(0, testimg::IMAGE_SIZE + 1).is_err());
        assert!(view.write(testimg::IMAGE_SIZE as u32, 0u8).is_err());
        assert_eq!(view.read::<u16>(0).unwrap(), 0x5A4D);
    }

    #[test]
    fn strings_and_imports() {
        let mut buf = testimg::build();
        let view = view(&mut buf);
        let descriptors = view.import_descriptors().unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(view.cstr(descriptors[0].name).unwrap(), "KERNEL32.dll");

        let thunks: Vec<u64> = (0..3)
            .map(|i| view.read(testimg::NAME_THUNKS_RVA + i * 8).unwrap())
            .collect();
        assert!(matches!(ImportThunk::from_raw(thunks[0]), Some(ImportThunk::Name(0x4A0))));
        assert!(matches!(ImportThunk::from_raw(thunks[1]), Some(ImportThunk::Ordinal(5))));
        assert!(ImportThunk::from_raw(0).is_none());
    }

    #[test]
    fn scans_synthetic_code_section() {
        use crate::pattern::{Pattern, Region};

        let mut buf = testimg::build();
        let (addr, len) = view(&mut buf).code_section().unwrap();
        let region = unsafe { Region::new(addr, len) };
        let pat = Pattern::in_region("FF 15 ? ? ? ?", region)
            .unwrap()
            .count(1)
            .unwrap();
        assert_eq!(pat.get_one().addr(), addr);
    }
}
