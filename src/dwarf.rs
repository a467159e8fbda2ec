//! A compilation-unit-level DWARF summary: just enough of `__debug_info`
//! to recover the comp dir and translation unit name feeding the `N_SO`/
//! `N_OSO` stabs. Anything malformed or newer than this reader understands
//! degrades to `None`; debug info never fails a link.

use crate::mach::opcodes::{read_sleb, read_uleb};

const DW_TAG_COMPILE_UNIT: u64 = 0x11;

const DW_AT_NAME: u64 = 0x03;
const DW_AT_COMP_DIR: u64 = 0x1b;

const DW_FORM_ADDR: u64 = 0x01;
const DW_FORM_BLOCK2: u64 = 0x03;
const DW_FORM_BLOCK4: u64 = 0x04;
const DW_FORM_DATA2: u64 = 0x05;
const DW_FORM_DATA4: u64 = 0x06;
const DW_FORM_DATA8: u64 = 0x07;
const DW_FORM_STRING: u64 = 0x08;
const DW_FORM_BLOCK: u64 = 0x09;
const DW_FORM_BLOCK1: u64 = 0x0a;
const DW_FORM_DATA1: u64 = 0x0b;
const DW_FORM_FLAG: u64 = 0x0c;
const DW_FORM_SDATA: u64 = 0x0d;
const DW_FORM_STRP: u64 = 0x0e;
const DW_FORM_UDATA: u64 = 0x0f;
const DW_FORM_REF_ADDR: u64 = 0x10;
const DW_FORM_REF1: u64 = 0x11;
const DW_FORM_REF2: u64 = 0x12;
const DW_FORM_REF4: u64 = 0x13;
const DW_FORM_REF8: u64 = 0x14;
const DW_FORM_REF_UDATA: u64 = 0x15;
const DW_FORM_SEC_OFFSET: u64 = 0x17;
const DW_FORM_FLAG_PRESENT: u64 = 0x19;
const DW_FORM_STRX: u64 = 0x1a;
const DW_FORM_ADDRX: u64 = 0x1b;
const DW_FORM_STRX1: u64 = 0x25;
const DW_FORM_STRX2: u64 = 0x26;
const DW_FORM_STRX3: u64 = 0x27;
const DW_FORM_STRX4: u64 = 0x28;

/// What the debug map needs from a translation unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileUnitSummary {
    pub comp_dir: String,
    pub name: String,
}

struct AbbrevAttr {
    at: u64,
    form: u64,
}

/// Decode the abbreviation declaration with the given code, returning its
/// tag and attribute list.
fn find_abbrev(abbrev: &[u8], code: u64) -> Option<(u64, Vec<AbbrevAttr>)> {
    let mut off = 0;
    loop {
        let decl_code = read_uleb(abbrev, &mut off).ok()?;
        if decl_code == 0 {
            return None;
        }
        let tag = read_uleb(abbrev, &mut off).ok()?;
        let _has_children = *abbrev.get(off)?;
        off += 1;
        let mut attrs = Vec::new();
        loop {
            let at = read_uleb(abbrev, &mut off).ok()?;
            let form = read_uleb(abbrev, &mut off).ok()?;
            if at == 0 && form == 0 {
                break;
            }
            attrs.push(AbbrevAttr { at, form });
        }
        if decl_code == code {
            return Some((tag, attrs));
        }
    }
}

fn read_fixed(info: &[u8], off: &mut usize, width: usize) -> Option<u64> {
    let bytes = info.get(*off..*off + width)?;
    *off += width;
    let mut value = 0u64;
    for (i, b) in bytes.iter().enumerate() {
        value |= u64::from(*b) << (8 * i);
    }
    Some(value)
}

fn read_cstr(bytes: &[u8], start: usize) -> Option<String> {
    let rest = bytes.get(start..)?;
    let end = rest.iter().position(|&b| b == 0)?;
    core::str::from_utf8(&rest[..end]).ok().map(str::to_string)
}

/// Extract the compile-unit name and comp dir from a 32-bit DWARF unit.
pub fn parse_summary(info: &[u8], abbrev: &[u8], strs: &[u8]) -> Option<CompileUnitSummary> {
    let mut off = 0;
    let unit_length = read_fixed(info, &mut off, 4)?;
    if unit_length == 0xffff_ffff {
        // 64-bit DWARF, not summarized
        return None;
    }
    let version = read_fixed(info, &mut off, 2)?;
    let (abbrev_offset, address_size) = match version {
        2..=4 => {
            let abbrev_offset = read_fixed(info, &mut off, 4)?;
            let address_size = read_fixed(info, &mut off, 1)?;
            (abbrev_offset, address_size as usize)
        }
        5 => {
            let unit_type = read_fixed(info, &mut off, 1)?;
            if unit_type != 0x01 {
                return None;
            }
            let address_size = read_fixed(info, &mut off, 1)?;
            let abbrev_offset = read_fixed(info, &mut off, 4)?;
            (abbrev_offset, address_size as usize)
        }
        _ => return None,
    };

    let abbrev = abbrev.get(abbrev_offset as usize..)?;
    let code = read_uleb(info, &mut off).ok()?;
    let (tag, attrs) = find_abbrev(abbrev, code)?;
    if tag != DW_TAG_COMPILE_UNIT {
        return None;
    }

    let mut name = None;
    let mut comp_dir = None;
    for attr in &attrs {
        let value = match attr.form {
            DW_FORM_ADDR => {
                read_fixed(info, &mut off, address_size)?;
                None
            }
            DW_FORM_DATA1 | DW_FORM_REF1 | DW_FORM_FLAG | DW_FORM_STRX1 => {
                read_fixed(info, &mut off, 1)?;
                None
            }
            DW_FORM_DATA2 | DW_FORM_REF2 | DW_FORM_STRX2 => {
                read_fixed(info, &mut off, 2)?;
                None
            }
            DW_FORM_STRX3 => {
                read_fixed(info, &mut off, 3)?;
                None
            }
            DW_FORM_DATA4 | DW_FORM_REF4 | DW_FORM_REF_ADDR | DW_FORM_SEC_OFFSET
            | DW_FORM_STRX4 => {
                read_fixed(info, &mut off, 4)?;
                None
            }
            DW_FORM_DATA8 | DW_FORM_REF8 => {
                read_fixed(info, &mut off, 8)?;
                None
            }
            DW_FORM_SDATA => {
                read_sleb(info, &mut off).ok()?;
                None
            }
            DW_FORM_UDATA | DW_FORM_REF_UDATA | DW_FORM_STRX | DW_FORM_ADDRX => {
                read_uleb(info, &mut off).ok()?;
                None
            }
            DW_FORM_FLAG_PRESENT => None,
            DW_FORM_BLOCK1 => {
                let len = read_fixed(info, &mut off, 1)? as usize;
                off += len;
                None
            }
            DW_FORM_BLOCK2 => {
                let len = read_fixed(info, &mut off, 2)? as usize;
                off += len;
                None
            }
            DW_FORM_BLOCK4 => {
                let len = read_fixed(info, &mut off, 4)? as usize;
                off += len;
                None
            }
            DW_FORM_BLOCK => {
                let len = read_uleb(info, &mut off).ok()? as usize;
                off += len;
                None
            }
            DW_FORM_STRING => {
                let s = read_cstr(info, off)?;
                off += s.len() + 1;
                Some(s)
            }
            DW_FORM_STRP => {
                let strp = read_fixed(info, &mut off, 4)? as usize;
                read_cstr(strs, strp)
            }
            _ => return None,
        };
        match attr.at {
            DW_AT_NAME => name = value,
            DW_AT_COMP_DIR => comp_dir = value,
            _ => {}
        }
    }

    Some(CompileUnitSummary {
        comp_dir: comp_dir.unwrap_or_default(),
        name: name.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Assemble a v4 unit: one abbrev (compile_unit with name/comp_dir as
    /// strp), a header, and a single DIE.
    #[test]
    fn summary_from_minimal_unit() {
        let mut abbrev = Vec::new();
        abbrev.push(1); // code
        abbrev.push(DW_TAG_COMPILE_UNIT as u8);
        abbrev.push(0); // no children
        abbrev.extend_from_slice(&[DW_AT_NAME as u8, DW_FORM_STRP as u8]);
        abbrev.extend_from_slice(&[DW_AT_COMP_DIR as u8, DW_FORM_STRP as u8]);
        abbrev.extend_from_slice(&[0, 0]);
        abbrev.push(0); // terminator decl

        let strs = b"\0hello.c\0/tmp/build\0";

        let mut info = Vec::new();
        info.extend_from_slice(&20u32.to_le_bytes()); // unit_length (unchecked tail)
        info.extend_from_slice(&4u16.to_le_bytes()); // version
        info.extend_from_slice(&0u32.to_le_bytes()); // abbrev offset
        info.push(8); // address size
        info.push(1); // abbrev code of the root DIE
        info.extend_from_slice(&1u32.to_le_bytes()); // strp -> "hello.c"
        info.extend_from_slice(&9u32.to_le_bytes()); // strp -> "/tmp/build"

        let summary = parse_summary(&info, &abbrev, strs).unwrap();
        assert_eq!(summary.name, "hello.c");
        assert_eq!(summary.comp_dir, "/tmp/build");
    }

    #[test]
    fn garbage_degrades_to_none() {
        assert_eq!(parse_summary(&[1, 2, 3], &[], &[]), None);
    }
}
