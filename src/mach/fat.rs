//! A Mach-o fat binary is a multi-architecture binary container. Archives
//! and dylibs routinely arrive wrapped in one; the linker selects the slice
//! matching the target CPU and parses at its offset.

use core::fmt;

use scroll::{Pread, Pwrite, SizeWith};

use crate::error;
use crate::mach::constants::cputype;

pub const FAT_MAGIC: u32 = 0xcafebabe;
pub const FAT_CIGAM: u32 = 0xbebafeca;

/// The Mach-o `FatHeader` always has its data bigendian
#[repr(C)]
#[derive(Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct FatHeader {
    /// The magic number, `cafebabe`
    pub magic: u32,
    /// How many fat architecture headers there are
    pub nfat_arch: u32,
}

pub const SIZEOF_FAT_HEADER: usize = 8;

impl fmt::Debug for FatHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x} nfat_arch: {}", self.magic, self.nfat_arch)
    }
}

/// The Mach-o `FatArch` always has its data bigendian
#[repr(C)]
#[derive(Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct FatArch {
    /// What kind of CPU this binary is
    pub cputype: u32,
    pub cpusubtype: u32,
    /// Where in the fat binary it starts
    pub offset: u32,
    /// How big the binary is
    pub size: u32,
    pub align: u32,
}

pub const SIZEOF_FAT_ARCH: usize = 20;

impl fmt::Debug for FatArch {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("FatArch")
            .field("cputype", &cputype::cpu_type_to_str(self.cputype))
            .field("cpusubtype", &self.cpusubtype)
            .field("offset", &format_args!("{:#x}", &self.offset))
            .field("size", &self.size)
            .field("align", &self.align)
            .finish()
    }
}

impl FatHeader {
    /// Parse a mach-o fat header from `bytes`
    pub fn parse(bytes: &[u8]) -> error::Result<FatHeader> {
        if bytes.len() < SIZEOF_FAT_HEADER {
            return Err(error::Error::EndOfStream);
        }
        Ok(bytes.pread_with(0, scroll::BE)?)
    }
}

impl FatArch {
    pub fn parse(bytes: &[u8]) -> error::Result<Vec<FatArch>> {
        let header = FatHeader::parse(bytes)?;
        let mut arches = Vec::with_capacity(header.nfat_arch as usize);
        let mut offset = SIZEOF_FAT_HEADER;
        for _ in 0..header.nfat_arch {
            arches.push(bytes.gread_with::<FatArch>(&mut offset, scroll::BE)?);
        }
        Ok(arches)
    }

    pub fn find_cputype(arches: &[Self], cputype: u32) -> Option<&Self> {
        arches.iter().find(|arch| arch.cputype == cputype)
    }
}

/// If `bytes` is a universal container, return the offset of the slice for
/// `cputype`; plain files pass through at offset 0. A container without a
/// matching slice is malformed from this link's point of view.
pub fn arch_offset(bytes: &[u8], cputype: u32) -> error::Result<usize> {
    let magic = crate::mach::peek_magic(bytes, 0)?;
    // fat headers are big-endian, so a little-endian peek sees the swap
    if magic != FAT_CIGAM {
        return Ok(0);
    }
    let arches = FatArch::parse(bytes)?;
    match FatArch::find_cputype(&arches, cputype) {
        Some(arch) => {
            if (arch.offset as usize) >= bytes.len() {
                return Err(error::Error::Malformed(format!(
                    "fat arch slice at {:#x} is outside the file",
                    arch.offset
                )));
            }
            Ok(arch.offset as usize)
        }
        None => Err(error::Error::Malformed(format!(
            "universal file has no slice for cputype {cputype:#x}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scroll::Pwrite;

    #[test]
    fn slice_selection() {
        let mut buf = vec![0u8; SIZEOF_FAT_HEADER + 2 * SIZEOF_FAT_ARCH + 8];
        buf.pwrite_with(FatHeader { magic: FAT_MAGIC, nfat_arch: 2 }, 0, scroll::BE).unwrap();
        buf.pwrite_with(
            FatArch { cputype: cputype::CPU_TYPE_X86_64, cpusubtype: 3, offset: 0x30, size: 8, align: 3 },
            SIZEOF_FAT_HEADER,
            scroll::BE,
        )
        .unwrap();
        buf.pwrite_with(
            FatArch { cputype: cputype::CPU_TYPE_ARM64, cpusubtype: 0, offset: 0x38, size: 8, align: 3 },
            SIZEOF_FAT_HEADER + SIZEOF_FAT_ARCH,
            scroll::BE,
        )
        .unwrap();
        assert_eq!(arch_offset(&buf, cputype::CPU_TYPE_ARM64).unwrap(), 0x38);
        assert!(arch_offset(&buf, cputype::CPU_TYPE_X86).is_err());
        // a non-fat buffer passes through untouched
        assert_eq!(arch_offset(&[0xcf, 0xfa, 0xed, 0xfe, 0, 0, 0, 0], cputype::CPU_TYPE_ARM64).unwrap(), 0);
    }
}
