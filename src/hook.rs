//! Control-flow splicing at patch sites.
//!
//! Everything here writes straight into process memory and expects the caller
//! to hold an active [`crate::protect::ScopedUnprotect`] over the patch site.
//! Hooks are apply-only: once written there is no unhook.

use anyhow::Result;

use crate::stub;

/// How control leaves the patch site.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PatchMode {
    /// Unconditional transfer. Execution does not resume after the patched
    /// bytes unless the target jumps back explicitly.
    Jump,
    /// Transfer with call semantics; the target returns to the instruction
    /// following the patched site.
    Call,
}

/// Copies `bytes` over the instruction(s) at `addr`.
///
/// # Safety
/// `addr` must be writable for `bytes.len()` bytes, and the caller must have
/// reserved at least that many instruction bytes at the site.
pub unsafe fn patch(addr: usize, bytes: &[u8]) {
    (addr as *mut u8).copy_from(bytes.as_ptr(), bytes.len());
}

/// Overwrites the 5 bytes at `addr` with a near jump or call to `target`.
/// Fails if `target` is out of rel32 reach; route through a trampoline in
/// that case.
///
/// # Safety
/// Same as [`patch`]; the engine does not check how many bytes the caller
/// actually has available at `addr`.
pub unsafe fn inject_hook(addr: usize, target: usize, mode: PatchMode) -> Result<()> {
    let bytes = match mode {
        PatchMode::Jump => stub::jmp(addr, target)?,
        PatchMode::Call => stub::call(addr, target)?,
    };
    patch(addr, &bytes);
    Ok(())
}

/// Blanks `count` instruction bytes with NOPs, preserving code size so
/// surrounding relative offsets stay valid.
///
/// # Safety
/// `addr` must be writable for `count` bytes.
pub unsafe fn nop(addr: usize, count: usize) {
    std::ptr::write_bytes(addr as *mut u8, stub::NOP, count);
}

/// Resolves the rel32 operand at `addr` to the absolute address it refers to
/// (`addr + 4 + displacement`).
///
/// # Safety
/// `addr` must point at 4 readable bytes holding a rel32 operand.
pub unsafe fn read_offset_value(addr: usize) -> usize {
    let disp = (addr as *const u8).cast::<i32>().read_unaligned();
    addr.wrapping_add(4).wrapping_add_signed(disp as isize)
}

/// Patches the rel32 operand at `addr` to refer to `target`.
///
/// # Safety
/// `addr` must point at 4 writable bytes holding a rel32 operand.
pub unsafe fn write_offset_value(addr: usize, target: usize) -> Result<()> {
    let disp = stub::rel32(addr, target, 4)?;
    patch(addr, &disp);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_hook_bytes() {
        let mut site = [0xCCu8; 8];
        let addr = site.as_mut_ptr() as usize;
        let target = addr + 0x20;
        unsafe { inject_hook(addr, target, PatchMode::Jump).unwrap() };
        // E9, disp to addr+0x20 from a 5-byte instruction, untouched tail
        assert_eq!(site, [0xE9, 0x1B, 0x00, 0x00, 0x00, 0xCC, 0xCC, 0xCC]);
    }

    #[test]
    fn call_hook_bytes() {
        let mut site = [0u8; 5];
        let addr = site.as_mut_ptr() as usize;
        unsafe { inject_hook(addr, addr, PatchMode::Call).unwrap() };
        // call back to the patch site itself: disp = -5
        assert_eq!(site, [0xE8, 0xFB, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn nop_fill() {
        let mut site = [0xCCu8; 6];
        unsafe { nop(site.as_mut_ptr() as usize + 1, 4) };
        assert_eq!(site, [0xCC, 0x90, 0x90, 0x90, 0x90, 0xCC]);
    }

    #[test]
    fn offset_value_round_trip() {
        let mut operand = [0u8; 4];
        let addr = operand.as_mut_ptr() as usize;
        let target = addr + 0x1234;
        unsafe {
            write_offset_value(addr, target).unwrap();
            assert_eq!(read_offset_value(addr), target);
        }
        assert_eq!(i32::from_le_bytes(operand), 0x1230);
    }
}
