//! Executable scratch memory near a patch site.
//!
//! A 5-byte near branch only reaches ±2GB, so hook targets living in this
//! DLL are usually out of range of code in the host image. A trampoline is a
//! page of executable memory allocated within rel32 reach of an anchor
//! address; patch sites branch into it, and it forwards to the real target
//! with a 14-byte absolute jump.
//!
//! Trampolines are never freed. Once code branches into one it must stay
//! mapped for the life of the process, so allocations are leaked by design
//! of the API: [`make_trampoline`] hands out `&'static mut`.

use std::ffi::c_void;
use std::mem;

use anyhow::{bail, Result};
use windows::Win32::System::Memory::{
    VirtualAlloc, VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT, MEM_FREE, MEM_RESERVE,
    PAGE_EXECUTE_READWRITE,
};
use windows::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

use crate::stub;

// Leave headroom below the full 2GB so anything placed inside the page is
// still reachable from the anchor.
const REACH: usize = 0x7FFF_0000;

/// One leaked page of executable memory, handed out sequentially.
pub struct Trampoline {
    base: *mut u8,
    size: usize,
    used: usize,
}

unsafe impl Send for Trampoline {}

impl Trampoline {
    /// Claims the next `size` bytes of the page. The memory is zeroed, as
    /// freshly committed pages are.
    pub fn raw_space(&mut self, size: usize) -> Result<*mut u8> {
        if self.used + size > self.size {
            bail!(
                "trampoline exhausted: {} bytes requested, {} left",
                size,
                self.size - self.used
            );
        }
        let ptr = unsafe { self.base.add(self.used) };
        self.used += size;
        Ok(ptr)
    }

    /// Claims space for one `T`, aligned for `T`.
    pub fn pointer<T>(&mut self) -> Result<*mut T> {
        let align = mem::align_of::<T>();
        let misalign = (self.base as usize + self.used) % align;
        if misalign != 0 {
            self.raw_space(align - misalign)?;
        }
        Ok(self.raw_space(mem::size_of::<T>())?.cast())
    }

    /// Writes an absolute jump to `target` into the page and returns its
    /// address. Patch sites reach `target` by near-branching here.
    pub fn jump(&mut self, target: usize) -> Result<usize> {
        let space = self.raw_space(stub::JMP_INDIRECT_LEN)?;
        let bytes = stub::jmp_indirect(target);
        unsafe { space.copy_from(bytes.as_ptr(), bytes.len()) };
        Ok(space as usize)
    }
}

fn system_info() -> SYSTEM_INFO {
    let mut info = SYSTEM_INFO::default();
    unsafe { GetSystemInfo(&mut info) };
    info
}

/// Searches for a free region within rel32 reach of `anchor`, below it first
/// and then above, and commits one allocation-granularity block there.
unsafe fn alloc_near(anchor: usize, size: usize, granularity: usize) -> Result<*mut u8> {
    let min = anchor.saturating_sub(REACH);
    let max = anchor.saturating_add(REACH);

    let try_alloc = |addr: usize| -> Option<*mut u8> {
        let ptr = VirtualAlloc(
            Some(addr as *const c_void),
            size,
            MEM_RESERVE | MEM_COMMIT,
            PAGE_EXECUTE_READWRITE,
        );
        (!ptr.is_null()).then(|| ptr.cast())
    };

    let query = |addr: usize| -> Option<MEMORY_BASIC_INFORMATION> {
        let mut info = MEMORY_BASIC_INFORMATION::default();
        let written = VirtualQuery(
            Some(addr as *const c_void),
            &mut info,
            mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        );
        (written >= mem::size_of::<MEMORY_BASIC_INFORMATION>()).then_some(info)
    };

    // downward: closer addresses tried first keeps the page tight to the
    // anchor in the common case
    let mut addr = anchor & !(granularity - 1);
    while addr >= min.max(granularity) {
        addr -= granularity;
        let Some(info) = query(addr) else { break };
        if info.State == MEM_FREE && info.RegionSize >= size {
            if let Some(ptr) = try_alloc(addr) {
                return Ok(ptr);
            }
        }
    }

    let mut addr = (anchor & !(granularity - 1)) + granularity;
    while addr + size <= max {
        let Some(info) = query(addr) else { break };
        if info.State == MEM_FREE && info.RegionSize >= size {
            if let Some(ptr) = try_alloc(addr) {
                return Ok(ptr);
            }
        }
        addr = (info.BaseAddress as usize + info.RegionSize + granularity - 1) & !(granularity - 1);
    }

    bail!("no free region within reach of {:#x}", anchor)
}

/// Allocates a trampoline page within near-branch reach of `anchor`.
///
/// # Safety
/// Calls into the virtual memory APIs of the current process. The returned
/// reference is leaked and valid for the rest of the process lifetime.
pub unsafe fn make_trampoline(anchor: usize) -> Result<&'static mut Trampoline> {
    let info = system_info();
    let granularity = info.dwAllocationGranularity as usize;
    let size = info.dwPageSize as usize;
    let base = alloc_near(anchor, size, granularity)?;
    log::debug!("trampoline page at {:p}, anchor {:#x}", base, anchor);
    Ok(Box::leak(Box::new(Trampoline {
        base,
        size,
        used: 0,
    })))
}
