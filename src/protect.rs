//! Scoped write access to image memory.
//!
//! A scope walks the covered range region by region, remaps each committed
//! region to its writable counterpart, and restores the protections it
//! recorded, in reverse order, when dropped. Because every scope restores to
//! the value it observed at acquisition, nested scopes over overlapping
//! ranges unwind correctly as long as they drop in reverse order of creation.

use std::ffi::c_void;
use std::mem;

use anyhow::{bail, Result};
use windows::Win32::Foundation::HMODULE;
use windows::Win32::System::Memory::{
    VirtualProtect, VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT, PAGE_EXECUTE,
    PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_GUARD, PAGE_NOACCESS,
    PAGE_PROTECTION_FLAGS, PAGE_READWRITE, PAGE_WRITECOPY,
};

use crate::image::ImageView;

struct RegionProtect {
    addr: *mut c_void,
    size: usize,
    previous: PAGE_PROTECTION_FLAGS,
}

/// Write access over a range of the process image, held for the lexical
/// lifetime of the value.
pub struct ScopedUnprotect {
    regions: Vec<RegionProtect>,
}

impl Drop for ScopedUnprotect {
    fn drop(&mut self) {
        let mut scratch = PAGE_PROTECTION_FLAGS::default();
        for region in self.regions.iter().rev() {
            unsafe {
                if let Err(e) = VirtualProtect(region.addr, region.size, region.previous, &mut scratch)
                {
                    log::error!("failed to restore protection at {:p}: {:?}", region.addr, e);
                }
            }
        }
    }
}

/// The writable protection equivalent to `protect`, or `None` if the region
/// is already writable or should not be touched (guard and no-access pages).
fn writable_counterpart(protect: PAGE_PROTECTION_FLAGS) -> Option<PAGE_PROTECTION_FLAGS> {
    if protect.contains(PAGE_GUARD) || protect == PAGE_NOACCESS {
        return None;
    }
    let already_writable = [
        PAGE_READWRITE,
        PAGE_WRITECOPY,
        PAGE_EXECUTE_READWRITE,
        PAGE_EXECUTE_WRITECOPY,
    ];
    if already_writable.iter().any(|&w| protect.contains(w)) {
        return None;
    }
    let executable = [PAGE_EXECUTE, PAGE_EXECUTE_READ];
    if executable.iter().any(|&x| protect.contains(x)) {
        Some(PAGE_EXECUTE_READWRITE)
    } else {
        Some(PAGE_READWRITE)
    }
}

/// Makes `start..start + len` writable until the returned scope drops.
///
/// # Safety
/// The range must belong to this process's address space and stay mapped for
/// the scope's lifetime.
pub unsafe fn unprotect_range(start: usize, len: usize) -> Result<ScopedUnprotect> {
    let mut regions = Vec::new();
    let end = start + len;
    let mut addr = start;
    while addr < end {
        let mut info = MEMORY_BASIC_INFORMATION::default();
        let written = VirtualQuery(
            Some(addr as *const c_void),
            &mut info,
            mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        );
        if written < mem::size_of::<MEMORY_BASIC_INFORMATION>() {
            bail!("VirtualQuery failed at {:#x}", addr);
        }
        let region_end = info.BaseAddress as usize + info.RegionSize;
        if info.State == MEM_COMMIT {
            if let Some(new_protect) = writable_counterpart(info.Protect) {
                let mut previous = PAGE_PROTECTION_FLAGS::default();
                VirtualProtect(info.BaseAddress, info.RegionSize, new_protect, &mut previous)?;
                regions.push(RegionProtect {
                    addr: info.BaseAddress,
                    size: info.RegionSize,
                    previous,
                });
            }
        }
        addr = region_end;
    }
    Ok(ScopedUnprotect { regions })
}

/// Makes the named section of `module` writable, or the whole module if no
/// section of that name exists.
///
/// # Safety
/// `module` must be a loaded module of this process.
pub unsafe fn unprotect_section_or_module(
    module: HMODULE,
    section_name: &str,
) -> Result<ScopedUnprotect> {
    let view = ImageView::module(module)?;
    let (start, len) = match view.section(section_name)? {
        Some(section) => (
            view.base() + section.virtual_address as usize,
            section.virtual_size as usize,
        ),
        None => (view.base(), view.len()),
    };
    unprotect_range(start, len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use windows::Win32::System::Memory::{VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READONLY};

    unsafe fn protection_of(addr: usize) -> PAGE_PROTECTION_FLAGS {
        let mut info = MEMORY_BASIC_INFORMATION::default();
        let written = VirtualQuery(
            Some(addr as *const c_void),
            &mut info,
            mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        );
        assert!(written >= mem::size_of::<MEMORY_BASIC_INFORMATION>());
        info.Protect
    }

    #[test]
    fn round_trips_protection() {
        unsafe {
            let page = VirtualAlloc(None, 0x1000, MEM_RESERVE | MEM_COMMIT, PAGE_READONLY);
            assert!(!page.is_null());
            let addr = page as usize;
            assert_eq!(protection_of(addr), PAGE_READONLY);
            {
                let _scope = unprotect_range(addr, 0x1000).unwrap();
                assert_eq!(protection_of(addr), PAGE_READWRITE);
                *(addr as *mut u8) = 0xCC;
            }
            assert_eq!(protection_of(addr), PAGE_READONLY);
        }
    }

    #[test]
    fn nested_scopes_restore_in_order() {
        unsafe {
            let page = VirtualAlloc(None, 0x1000, MEM_RESERVE | MEM_COMMIT, PAGE_READONLY);
            assert!(!page.is_null());
            let addr = page as usize;
            {
                let _outer = unprotect_range(addr, 0x1000).unwrap();
                {
                    // already writable: the inner scope records nothing and
                    // its drop cannot fight the outer scope
                    let _inner = unprotect_range(addr, 0x1000).unwrap();
                    assert_eq!(protection_of(addr), PAGE_READWRITE);
                }
                assert_eq!(protection_of(addr), PAGE_READWRITE);
            }
            assert_eq!(protection_of(addr), PAGE_READONLY);
        }
    }

    #[test]
    fn writable_mapping() {
        assert_eq!(writable_counterpart(PAGE_READONLY), Some(PAGE_READWRITE));
        assert_eq!(
            writable_counterpart(PAGE_EXECUTE_READ),
            Some(PAGE_EXECUTE_READWRITE)
        );
        assert_eq!(writable_counterpart(PAGE_READWRITE), None);
        assert_eq!(writable_counterpart(PAGE_EXECUTE_READWRITE), None);
        assert_eq!(writable_counterpart(PAGE_NOACCESS), None);
        assert_eq!(
            writable_counterpart(PAGE_GUARD | PAGE_READONLY),
            None
        );
    }
}
