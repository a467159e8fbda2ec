//! x86-64 instruction forms the linker emits or patches: RIP-relative
//! displacements, the `jmp *disp(%rip)` stub, and the stub-helper pair
//! that funnels first calls into `dyld_stub_binder`.

use crate::error::{Error, Result};

pub const STUB_SIZE: u64 = 6;
pub const STUB_HELPER_PREAMBLE_SIZE: u64 = 15;
pub const STUB_HELPER_ENTRY_SIZE: u64 = 10;

/// RIP-relative displacement from the patched field at `source` to
/// `target`. RIP points past the 4 displacement bytes plus `correction`
/// trailing immediate bytes (the `_1`/`_2`/`_4` of `SIGNED_N`).
pub fn calc_pcrel_displacement(source: u64, target: u64, correction: u64) -> Result<i32> {
    let disp = target as i64 - (source as i64 + 4 + correction as i64);
    i32::try_from(disp).map_err(|_| {
        Error::Overflow(format!(
            "pc-relative displacement {disp:#x} from {source:#x} to {target:#x} exceeds 32 bits"
        ))
    })
}

/// `jmp *disp(%rip)` through the lazy pointer.
pub fn write_stub(buf: &mut [u8], disp: i32) {
    buf[0] = 0xff;
    buf[1] = 0x25;
    buf[2..6].copy_from_slice(&disp.to_le_bytes());
}

/// The stub-helper preamble: load `dyld_private`, push it, and tail-call
/// `dyld_stub_binder` through its GOT slot.
///
/// ```text
/// lea  r11, [rip + dyld_private]
/// push r11
/// jmp  qword ptr [rip + got(dyld_stub_binder)]
/// ```
pub fn write_stub_helper_preamble(buf: &mut [u8], dyld_private_disp: i32, binder_got_disp: i32) {
    buf[0] = 0x4c;
    buf[1] = 0x8d;
    buf[2] = 0x1d;
    buf[3..7].copy_from_slice(&dyld_private_disp.to_le_bytes());
    buf[7] = 0x41;
    buf[8] = 0x53;
    buf[9] = 0xff;
    buf[10] = 0x25;
    buf[11..15].copy_from_slice(&binder_got_disp.to_le_bytes());
}

/// One per-symbol helper: push the lazy-bind stream offset (patched in
/// after the stream is laid down) and jump to the preamble.
pub fn write_stub_helper_entry(buf: &mut [u8], lazy_bind_offset: u32, preamble_disp: i32) {
    buf[0] = 0x68;
    buf[1..5].copy_from_slice(&lazy_bind_offset.to_le_bytes());
    buf[5] = 0xe9;
    buf[6..10].copy_from_slice(&preamble_disp.to_le_bytes());
}

/// Byte offset of the lazy-bind immediate within a helper entry.
pub const STUB_HELPER_ENTRY_OFFSET_IMM: u64 = 1;

/// A `GOT_LOAD` whose target turned out local: rewrite
/// `mov r, [rip+disp]` (8B) into `lea r, [rip+disp]` (8D), eliding the
/// indirection. The opcode byte sits two bytes before the displacement.
pub fn relax_got_load(opcode: &mut u8) -> bool {
    if *opcode == 0x8b {
        *opcode = 0x8d;
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displacement_math() {
        assert_eq!(calc_pcrel_displacement(0x1000, 0x2000, 0).unwrap(), 0xffc);
        assert_eq!(calc_pcrel_displacement(0x2000, 0x1000, 0).unwrap(), -0x1004);
        // the SIGNED_4 correction shifts RIP four bytes further
        assert_eq!(calc_pcrel_displacement(0x1000, 0x2000, 4).unwrap(), 0xff8);
        assert!(calc_pcrel_displacement(0, 0x8000_0000_0000, 0).is_err());
    }

    #[test]
    fn stub_bytes() {
        let mut stub = [0u8; STUB_SIZE as usize];
        write_stub(&mut stub, 0x1234);
        assert_eq!(stub, [0xff, 0x25, 0x34, 0x12, 0x00, 0x00]);
    }

    #[test]
    fn helper_entry_bytes() {
        let mut entry = [0u8; STUB_HELPER_ENTRY_SIZE as usize];
        write_stub_helper_entry(&mut entry, 0x42, -32);
        assert_eq!(entry[0], 0x68);
        assert_eq!(&entry[1..5], &0x42u32.to_le_bytes());
        assert_eq!(entry[5], 0xe9);
        assert_eq!(&entry[6..10], &(-32i32).to_le_bytes());
    }

    #[test]
    fn mov_relaxes_to_lea() {
        let mut opcode = 0x8b;
        assert!(relax_got_load(&mut opcode));
        assert_eq!(opcode, 0x8d);
        let mut not_mov = 0xff;
        assert!(!relax_got_load(&mut not_mov));
        assert_eq!(not_mov, 0xff);
    }
}
