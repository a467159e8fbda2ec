//! Parsing of 64-bit relocatable Mach-O objects into the linker's working
//! form: section headers, the nlist table partitioned into locals then
//! globals, a per-section sorted relocation pool, data-in-code entries and
//! an optional DWARF summary.

use std::path::PathBuf;

use log::warn;
use scroll::Pread;

use crate::atom::{AtomId, SymbolId, NONE};
use crate::dwarf::{self, CompileUnitSummary};
use crate::error::{Error, Result};
use crate::mach::constants::{
    S_ATTR_DEBUG, SECT_DEBUG_ABBREV, SECT_DEBUG_INFO, SECT_DEBUG_STR, SECT_EH_FRAME,
};
use crate::mach::header::{Header64, MH_MAGIC_64, MH_OBJECT, MH_SUBSECTIONS_VIA_SYMBOLS};
use crate::mach::load_command::{
    self, DataInCodeEntry, DysymtabCommand, LinkeditDataCommand, Section64, SegmentCommand64,
    SymtabCommand,
};
use crate::mach::relocation::{RelocationInfo, ARM64_RELOC_ADDEND, SIZEOF_RELOCATION_INFO};
use crate::mach::symbols::Nlist64;
use crate::mach::{self, peek_magic};
use crate::options::Target;

/// What a relocation is against: an nlist by index, or an input section by
/// 1-based ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocTarget {
    Symbol(u32),
    Section(u8),
}

/// One decoded relocation from the per-object pool. Sorted ascending by
/// `offset` within each section slice; `ARM64_RELOC_ADDEND` entries keep
/// their position immediately before the relocation they qualify.
#[derive(Debug, Clone, Copy)]
pub struct Reloc {
    /// offset within the input section
    pub offset: u32,
    pub target: RelocTarget,
    pub r_type: u8,
    /// log2 of the patched width
    pub length: u8,
    pub pcrel: bool,
    /// only meaningful on ARM64_RELOC_ADDEND entries
    pub addend: i64,
}

/// A parsed relocatable object, possibly an archive member.
#[derive(Debug)]
pub struct Object {
    pub path: PathBuf,
    /// member name when the object came out of an archive
    pub member: Option<String>,
    pub data: Vec<u8>,
    pub header: Header64,
    pub sections: Vec<Section64>,
    pub nlists: Vec<Nlist64>,
    strtab_off: usize,
    strtab_len: usize,
    /// nlists[..first_global] are locals, the rest are externals
    pub first_global: usize,
    /// all relocations, grouped by section, each group sorted by offset
    pub relocs: Vec<Reloc>,
    /// per-section (start, len) into `relocs`
    pub section_relocs: Vec<(u32, u32)>,
    pub dice: Vec<DataInCodeEntry>,
    pub dwarf: Option<CompileUnitSummary>,
    /// (platform, minos, sdk) from LC_BUILD_VERSION or LC_VERSION_MIN_*
    pub platform: Option<(u32, u32, u32)>,
    pub subsections_via_symbols: bool,
    pub mtime: u64,
    /// nlist index -> linker symbol id, filled during resolution
    pub symbols: Vec<SymbolId>,
    /// every atom this object owns
    pub atoms: Vec<AtomId>,
    /// section index -> primary atom (0 for debug/eh_frame sections)
    pub section_atoms: Vec<AtomId>,
}

impl Object {
    /// Parse `data` as a relocatable object for `target`. A wrong leading
    /// magic or filetype rejects with `NotObject` and leaves no residual
    /// state; malformed contents after acceptance are fatal.
    pub fn parse(
        path: PathBuf,
        member: Option<String>,
        data: Vec<u8>,
        target: &Target,
        mtime: u64,
    ) -> Result<Object> {
        let magic = peek_magic(&data, 0).map_err(|_| Error::NotObject)?;
        if magic != MH_MAGIC_64 {
            return Err(Error::NotObject);
        }
        let header: Header64 = data.pread_with(0, scroll::LE)?;
        if header.filetype != MH_OBJECT {
            return Err(Error::NotObject);
        }
        if header.cputype != target.cputype() {
            return Err(Error::MismatchedCpuArchitecture {
                path: path.display().to_string(),
                cputype: header.cputype,
            });
        }

        let mut sections: Vec<Section64> = Vec::new();
        let mut symtab: Option<SymtabCommand> = None;
        let mut dysymtab: Option<DysymtabCommand> = None;
        let mut dice_cmd: Option<LinkeditDataCommand> = None;
        let mut platform = None;

        let mut offset = mach::header::SIZEOF_HEADER_64;
        for _ in 0..header.ncmds {
            let lc = load_command::peek_command(&data, offset)?;
            match lc.cmd {
                load_command::LC_SEGMENT_64 => {
                    let seg: SegmentCommand64 = data.pread_with(offset, scroll::LE)?;
                    let mut sect_offset = offset + load_command::SIZEOF_SEGMENT_COMMAND_64;
                    for _ in 0..seg.nsects {
                        let sect: Section64 = data.pread_with(sect_offset, scroll::LE)?;
                        sections.push(sect);
                        sect_offset += load_command::SIZEOF_SECTION_64;
                    }
                }
                load_command::LC_SYMTAB => {
                    symtab = Some(data.pread_with(offset, scroll::LE)?);
                }
                load_command::LC_DYSYMTAB => {
                    dysymtab = Some(data.pread_with(offset, scroll::LE)?);
                }
                load_command::LC_DATA_IN_CODE => {
                    dice_cmd = Some(data.pread_with(offset, scroll::LE)?);
                }
                load_command::LC_BUILD_VERSION => {
                    let bv: load_command::BuildVersionCommand =
                        data.pread_with(offset, scroll::LE)?;
                    platform = Some((bv.platform, bv.minos, bv.sdk));
                }
                load_command::LC_VERSION_MIN_MACOSX | load_command::LC_VERSION_MIN_IPHONEOS => {
                    let vm: load_command::VersionMinCommand =
                        data.pread_with(offset, scroll::LE)?;
                    let plat = if lc.cmd == load_command::LC_VERSION_MIN_MACOSX {
                        crate::mach::constants::PLATFORM_MACOS
                    } else {
                        crate::mach::constants::PLATFORM_IOS
                    };
                    platform = Some((plat, vm.version, vm.sdk));
                }
                _ => {}
            }
            offset += lc.cmdsize as usize;
        }

        // symbol table
        let (mut nlists, strtab_off, strtab_len) = match symtab {
            Some(cmd) => {
                let mut nlists = Vec::with_capacity(cmd.nsyms as usize);
                let mut off = cmd.symoff as usize;
                for _ in 0..cmd.nsyms {
                    nlists.push(data.gread_with::<Nlist64>(&mut off, scroll::LE)?);
                }
                (nlists, cmd.stroff as usize, cmd.strsize as usize)
            }
            None => (Vec::new(), 0, 0),
        };
        if strtab_off + strtab_len > data.len() {
            return Err(Error::Malformed(format!(
                "{}: string table runs past the end of the file",
                path.display()
            )));
        }

        // relocation pool, grouped by section and sorted by address
        let mut relocs: Vec<Reloc> = Vec::new();
        let mut section_relocs: Vec<(u32, u32)> = Vec::with_capacity(sections.len());
        for sect in &sections {
            let start = relocs.len();
            let mut off = sect.reloff as usize;
            let mut decoded: Vec<Reloc> = Vec::with_capacity(sect.nreloc as usize);
            for _ in 0..sect.nreloc {
                if off + SIZEOF_RELOCATION_INFO > data.len() {
                    return Err(Error::EndOfStream);
                }
                let info: RelocationInfo = data.gread_with(&mut off, scroll::LE)?;
                decoded.push(decode_reloc(&info, target));
            }
            // stable: ADDEND entries stay glued to the reloc they prefix
            decoded.sort_by_key(|r| r.offset);
            relocs.extend(decoded);
            section_relocs.push((start as u32, (relocs.len() - start) as u32));
        }

        // data-in-code entries, sorted by offset
        let mut dice = Vec::new();
        if let Some(cmd) = dice_cmd {
            let mut off = cmd.dataoff as usize;
            let count = cmd.datasize as usize / load_command::SIZEOF_DATA_IN_CODE_ENTRY;
            for _ in 0..count {
                dice.push(data.gread_with::<DataInCodeEntry>(&mut off, scroll::LE)?);
            }
            dice.sort_by_key(|d| d.offset);
        }

        // partition point between locals and globals
        let first_global = match dysymtab {
            Some(cmd) => (cmd.ilocalsym + cmd.nlocalsym) as usize,
            None => sort_nlists(&mut nlists, &mut relocs),
        };

        let dwarf = parse_dwarf_summary(&data, &sections);
        let n_nlists = nlists.len();
        let n_sections = sections.len();

        Ok(Object {
            path,
            member,
            subsections_via_symbols: header.flags & MH_SUBSECTIONS_VIA_SYMBOLS != 0,
            header,
            sections,
            nlists,
            strtab_off,
            strtab_len,
            first_global,
            relocs,
            section_relocs,
            dice,
            dwarf,
            platform,
            mtime,
            data,
            symbols: vec![NONE; n_nlists],
            atoms: Vec::new(),
            section_atoms: vec![NONE; n_sections],
        })
    }

    /// The name of an nlist, out of this object's string table.
    pub fn nlist_name(&self, nlist: &Nlist64) -> Result<&str> {
        let off = self.strtab_off + nlist.n_strx as usize;
        if nlist.n_strx as usize >= self.strtab_len {
            return Err(Error::Malformed(format!(
                "{}: n_strx {:#x} outside string table",
                self.path.display(),
                nlist.n_strx
            )));
        }
        Ok(self.data.pread::<&str>(off)?)
    }

    /// The sorted relocation slice of section `i` (0-based).
    pub fn sect_relocs(&self, i: usize) -> &[Reloc] {
        let (start, len) = self.section_relocs[i];
        &self.relocs[start as usize..(start + len) as usize]
    }

    /// Raw input bytes of section `i`, empty for zerofill.
    pub fn sect_bytes(&self, i: usize) -> &[u8] {
        let sect = &self.sections[i];
        if sect.offset == 0 || is_zerofill(sect.flags) {
            return &[];
        }
        let start = sect.offset as usize;
        &self.data[start..start + sect.size as usize]
    }

    /// Display name for diagnostics: `path` or `path(member)`.
    pub fn display_name(&self) -> String {
        match &self.member {
            Some(member) => format!("{}({})", self.path.display(), member),
            None => self.path.display().to_string(),
        }
    }

    /// Sections that never become atoms: DWARF debug info and, for now,
    /// `__eh_frame`.
    pub fn is_non_atom_section(sect: &Section64) -> bool {
        if sect.flags & S_ATTR_DEBUG != 0 {
            return true;
        }
        let name = sect.sect_name();
        name == SECT_DEBUG_INFO
            || name == SECT_DEBUG_ABBREV
            || name == SECT_DEBUG_STR
            || name.starts_with("__debug_")
            || name == SECT_EH_FRAME
    }
}

pub fn is_zerofill(flags: u32) -> bool {
    use crate::mach::constants::*;
    let typ = flags & SECTION_TYPE;
    typ == S_ZEROFILL || typ == S_GB_ZEROFILL || typ == S_THREAD_LOCAL_ZEROFILL
}

fn decode_reloc(info: &RelocationInfo, target: &Target) -> Reloc {
    use crate::options::CpuArch;
    let addend = if target.cpu_arch == CpuArch::Aarch64 && info.r_type() == ARM64_RELOC_ADDEND {
        // the addend rides in the 24-bit symbolnum field, sign-extended
        ((info.r_symbolnum() << 8) as i32 >> 8) as i64
    } else {
        0
    };
    Reloc {
        offset: info.r_address as u32,
        target: if info.is_extern() {
            RelocTarget::Symbol(info.r_symbolnum())
        } else {
            RelocTarget::Section(info.r_symbolnum() as u8)
        },
        r_type: info.r_type(),
        length: info.r_length(),
        pcrel: info.r_pcrel(),
        addend,
    }
}

/// Without `LC_DYSYMTAB` there is no trustworthy local/global partition:
/// re-sort the nlists (defined before undefined; locals before externals;
/// then section, value, name offset), rewrite every relocation's symbol
/// index through the backlink table, and return the new first external.
fn sort_nlists(nlists: &mut Vec<Nlist64>, relocs: &mut [Reloc]) -> usize {
    let mut order: Vec<usize> = (0..nlists.len()).collect();
    order.sort_by_key(|&i| {
        let n = &nlists[i];
        (n.is_undf(), n.is_ext(), n.n_sect, n.n_value, n.n_strx)
    });

    // backlink: old index -> new index
    let mut backlinks = vec![0u32; nlists.len()];
    for (new, &old) in order.iter().enumerate() {
        backlinks[old] = new as u32;
    }
    let sorted: Vec<Nlist64> = order.iter().map(|&i| nlists[i]).collect();
    *nlists = sorted;

    for reloc in relocs.iter_mut() {
        if let RelocTarget::Symbol(old) = reloc.target {
            reloc.target = RelocTarget::Symbol(backlinks[old as usize]);
        }
    }

    nlists
        .iter()
        .position(|n| n.is_ext())
        .unwrap_or(nlists.len())
}

fn parse_dwarf_summary(data: &[u8], sections: &[Section64]) -> Option<CompileUnitSummary> {
    let find = |name: &str| -> Option<&[u8]> {
        sections
            .iter()
            .find(|s| s.sect_name() == name)
            .filter(|s| s.offset != 0)
            .map(|s| &data[s.offset as usize..(s.offset as u64 + s.size) as usize])
    };
    let info = find(SECT_DEBUG_INFO)?;
    let abbrev = find(SECT_DEBUG_ABBREV)?;
    let strs = find(SECT_DEBUG_STR).unwrap_or(&[]);
    let summary = dwarf::parse_summary(info, abbrev, strs);
    if summary.is_none() {
        warn!("unreadable __debug_info, no stabs for this object");
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mach::symbols::{N_EXT, N_SECT, N_UNDF};

    fn nlist(n_strx: u32, n_type: u8, n_sect: u8, n_value: u64) -> Nlist64 {
        Nlist64 { n_strx, n_type, n_sect, n_desc: 0, n_value }
    }

    #[test]
    fn sort_partitions_and_rewrites_backlinks() {
        // out of order: undef global, defined global, defined local
        let mut nlists = vec![
            nlist(10, N_UNDF | N_EXT, 0, 0),
            nlist(20, N_SECT | N_EXT, 1, 0x20),
            nlist(30, N_SECT, 1, 0x10),
        ];
        let mut relocs = vec![
            Reloc { offset: 0, target: RelocTarget::Symbol(0), r_type: 0, length: 2, pcrel: true, addend: 0 },
            Reloc { offset: 4, target: RelocTarget::Symbol(2), r_type: 0, length: 2, pcrel: true, addend: 0 },
        ];
        let first_global = sort_nlists(&mut nlists, &mut relocs);
        // local first, then defined global, then undef
        assert_eq!(nlists[0].n_strx, 30);
        assert_eq!(nlists[1].n_strx, 20);
        assert_eq!(nlists[2].n_strx, 10);
        assert_eq!(first_global, 1);
        assert_eq!(relocs[0].target, RelocTarget::Symbol(2));
        assert_eq!(relocs[1].target, RelocTarget::Symbol(0));
    }
}
