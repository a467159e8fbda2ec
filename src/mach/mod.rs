//! The on-disk Mach-O surface this linker reads and writes: raw struct
//! definitions, constants, and the dyld opcode vocabulary.

pub mod constants;
pub mod fat;
pub mod header;
pub mod load_command;
pub mod opcodes;
pub mod relocation;
pub mod symbols;

use scroll::Pread;

use crate::error;

/// Peek the leading little-endian magic of `bytes` at `offset`.
pub fn peek_magic(bytes: &[u8], offset: usize) -> error::Result<u32> {
    if bytes.len() < offset + 4 {
        return Err(error::Error::EndOfStream);
    }
    Ok(bytes.pread_with::<u32>(offset, scroll::LE)?)
}
