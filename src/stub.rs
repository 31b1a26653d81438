use anyhow::{bail, Result};

/// Single-byte x86 no-op.
pub const NOP: u8 = 0x90;

/// Length of a near jump/call written by the hook injector.
pub const BRANCH_LEN: usize = 5;

/// Length of the absolute-jump-through-pointer stub emitted into trampolines.
pub const JMP_INDIRECT_LEN: usize = 14;

/// Little-endian rel32 displacement for a branch of `inst_len` bytes at `from`
/// targeting `to`. Fails if the displacement doesn't fit in an i32.
pub fn rel32(from: usize, to: usize, inst_len: usize) -> Result<[u8; 4]> {
    let disp = (to as i64).wrapping_sub(from as i64 + inst_len as i64);
    if i32::try_from(disp).is_err() {
        bail!(
            "displacement from {:#x} to {:#x} does not fit in a rel32 branch",
            from,
            to
        );
    }
    Ok((disp as i32).to_le_bytes())
}

/// E9 rel32 near jump.
pub fn jmp(from: usize, to: usize) -> Result<[u8; BRANCH_LEN]> {
    let bytes = rel32(from, to, BRANCH_LEN)?;
    Ok([0xE9, bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// E8 rel32 near call.
pub fn call(from: usize, to: usize) -> Result<[u8; BRANCH_LEN]> {
    let bytes = rel32(from, to, BRANCH_LEN)?;
    Ok([0xE8, bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// `jmp qword ptr [rip+0]` followed by the 64-bit target, the standard shape
/// for reaching an arbitrary address from a site limited to short branches.
/// Position-independent, so it can be assembled before its final address is
/// known.
pub fn jmp_indirect(target: usize) -> [u8; JMP_INDIRECT_LEN] {
    let mut stub = [0u8; JMP_INDIRECT_LEN];
    stub[..6].copy_from_slice(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
    stub[6..].copy_from_slice(&(target as u64).to_le_bytes());
    stub
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jmp_forward() {
        // jmp +0xFFB: E9 FB 0F 00 00
        assert_eq!(jmp(0x1000, 0x2000).unwrap(), [0xE9, 0xFB, 0x0F, 0x00, 0x00]);
    }

    #[test]
    fn jmp_backward() {
        // jmp -0x1005: E9 FB EF FF FF
        assert_eq!(jmp(0x2000, 0x1000).unwrap(), [0xE9, 0xFB, 0xEF, 0xFF, 0xFF]);
    }

    #[test]
    fn call_next_instruction() {
        // call with a zero displacement targets the following instruction
        assert_eq!(call(0x1000, 0x1005).unwrap(), [0xE8, 0x00, 0x00, 0x00, 0x00]);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn branch_out_of_reach() {
        assert!(jmp(0x1000, 0x1_0000_2000).is_err());
        assert!(call(0x1_0000_2000, 0x1000).is_err());
    }

    #[test]
    fn indirect_stub_layout() {
        let stub = jmp_indirect(0x1122_3344);
        assert_eq!(&stub[..6], &[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(u64::from_le_bytes(stub[6..].try_into().unwrap()), 0x1122_3344);
    }
}
