//! A BSD-flavored Unix archive reader: the `ar` format Apple toolchains
//! produce, with `#1/<len>` extended member names and a `__.SYMDEF` ranlib
//! directory mapping symbol names to member offsets.
//!
//! Members are parsed lazily: the table of contents is read up front, the
//! member objects only when symbol resolution first reaches into them
//! (unless the archive was force-loaded).

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use scroll::Pread;

use crate::error::{Error, Result};

pub const SIZEOF_MAGIC: usize = 8;
/// The magic number of a Unix Archive
pub const MAGIC: &[u8; SIZEOF_MAGIC] = b"!<arch>\x0A";

const SIZEOF_MEMBER_HEADER: usize = 60;
/// BSD extended-name sigil: the real name, of the given length, follows the
/// header and is counted in the member size
const BSD_NAME_PREFIX: &str = "#1/";

const SYMDEF: &str = "__.SYMDEF";
const SYMDEF_SORTED: &str = "__.SYMDEF SORTED";
const SYMDEF_64: &str = "__.SYMDEF_64";

/// An archive member: its name and the span of its data within the archive
/// buffer.
#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    /// offset of the member header from the start of the archive
    pub header_offset: u64,
    /// offset of the member's data
    pub offset: u64,
    pub size: u64,
    /// modification timestamp, seconds since the epoch
    pub mtime: u64,
}

/// An opened archive with its table of contents.
#[derive(Debug)]
pub struct Archive {
    pub path: PathBuf,
    pub data: Vec<u8>,
    /// members keyed by header offset, in file order
    pub members: BTreeMap<u64, Member>,
    /// symbol name -> offsets of the member headers defining it
    pub toc: BTreeMap<String, Vec<u64>>,
    /// member header offsets already handed to the linker
    pub parsed: HashSet<u64>,
    pub force_load: bool,
}

fn trimmed(field: &[u8]) -> &str {
    core::str::from_utf8(field).unwrap_or("").trim_end_matches([' ', '\0'])
}

fn parse_decimal(field: &[u8]) -> Result<u64> {
    let text = trimmed(field);
    if text.is_empty() {
        return Ok(0);
    }
    text.parse::<u64>()
        .map_err(|_| Error::Malformed(format!("bad decimal field {text:?} in archive header")))
}

fn parse_member(data: &[u8], header_offset: usize) -> Result<Member> {
    if header_offset + SIZEOF_MEMBER_HEADER > data.len() {
        return Err(Error::EndOfStream);
    }
    let header = &data[header_offset..header_offset + SIZEOF_MEMBER_HEADER];
    if &header[58..60] != b"\x60\x0A" {
        return Err(Error::Malformed(format!(
            "archive member header at {header_offset:#x} missing terminator"
        )));
    }
    let raw_name = trimmed(&header[0..16]);
    let mtime = parse_decimal(&header[16..28])?;
    let mut size = parse_decimal(&header[48..58])?;
    let mut data_offset = header_offset + SIZEOF_MEMBER_HEADER;

    let name = if let Some(len) = raw_name.strip_prefix(BSD_NAME_PREFIX) {
        let len: usize = len
            .parse()
            .map_err(|_| Error::Malformed(format!("bad extended name length {raw_name:?}")))?;
        if data_offset + len > data.len() || len as u64 > size {
            return Err(Error::EndOfStream);
        }
        let name = trimmed(&data[data_offset..data_offset + len]).to_string();
        data_offset += len;
        size -= len as u64;
        name
    } else {
        raw_name.trim_end_matches('/').to_string()
    };

    if data_offset as u64 + size > data.len() as u64 {
        return Err(Error::EndOfStream);
    }
    Ok(Member {
        name,
        header_offset: header_offset as u64,
        offset: data_offset as u64,
        size,
        mtime,
    })
}

impl Archive {
    /// Parse the member headers and symbol directory of `data`. Rejects
    /// with `NotArchive` when the magic does not match.
    pub fn parse(path: PathBuf, data: Vec<u8>, force_load: bool) -> Result<Archive> {
        if data.len() < SIZEOF_MAGIC || &data[..SIZEOF_MAGIC] != MAGIC {
            return Err(Error::NotArchive);
        }
        let mut members = BTreeMap::new();
        let mut pos = SIZEOF_MAGIC;
        while pos + SIZEOF_MEMBER_HEADER <= data.len() {
            let member = parse_member(&data, pos)?;
            let end = member.offset + member.size;
            members.insert(member.header_offset, member);
            // members start on even byte boundaries
            pos = (end + (end & 1)) as usize;
        }

        let mut archive = Archive {
            path,
            data,
            members,
            toc: BTreeMap::new(),
            parsed: HashSet::new(),
            force_load,
        };
        archive.parse_symdef()?;
        Ok(archive)
    }

    /// Decode the `__.SYMDEF` ranlib directory into the symbol multimap.
    fn parse_symdef(&mut self) -> Result<()> {
        let symdef = self.members.values().find(|m| {
            m.name == SYMDEF || m.name == SYMDEF_SORTED || m.name == SYMDEF_64
        });
        let Some(symdef) = symdef.cloned() else {
            // an archive without a directory contributes nothing to
            // resolution, which matches what ld does with ranlib-less inputs
            return Ok(());
        };
        if symdef.name == SYMDEF_64 {
            return Err(Error::Malformed(format!(
                "{}: 64-bit ranlib directories are not supported",
                self.path.display()
            )));
        }
        let bytes = &self.data[symdef.offset as usize..(symdef.offset + symdef.size) as usize];
        let ranlib_len: u32 = bytes.pread_with(0, scroll::LE)?;
        let nentries = ranlib_len as usize / 8;
        let strtab_base = 4 + ranlib_len as usize + 4;
        let strtab_len: u32 = bytes.pread_with(4 + ranlib_len as usize, scroll::LE)?;
        if strtab_base + strtab_len as usize > bytes.len() {
            return Err(Error::EndOfStream);
        }
        for i in 0..nentries {
            let ran_strx: u32 = bytes.pread_with(4 + i * 8, scroll::LE)?;
            let ran_off: u32 = bytes.pread_with(4 + i * 8 + 4, scroll::LE)?;
            let name: &str = bytes.pread(strtab_base + ran_strx as usize)?;
            self.toc
                .entry(name.to_string())
                .or_insert_with(Vec::new)
                .push(ran_off as u64);
        }
        Ok(())
    }

    /// Member header offsets defining `name`, if any.
    pub fn lookup(&self, name: &str) -> Option<&[u64]> {
        self.toc.get(name).map(|v| v.as_slice())
    }

    /// The member at `header_offset`, with its data slice.
    pub fn member_data(&self, header_offset: u64) -> Result<(&Member, &[u8])> {
        let member = self.members.get(&header_offset).ok_or_else(|| {
            Error::Malformed(format!(
                "{}: ranlib offset {header_offset:#x} does not name a member",
                self.path.display()
            ))
        })?;
        let bytes = &self.data[member.offset as usize..(member.offset + member.size) as usize];
        Ok((member, bytes))
    }

    /// Every real member (the symbol directory excluded), in file order.
    pub fn object_members(&self) -> impl Iterator<Item = &Member> {
        self.members
            .values()
            .filter(|m| !m.name.starts_with("__.SYMDEF"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pad_even(buf: &mut Vec<u8>) {
        if buf.len() & 1 == 1 {
            buf.push(b'\n');
        }
    }

    fn push_header(buf: &mut Vec<u8>, name: &str, size: usize) {
        let mut header = vec![b' '; SIZEOF_MEMBER_HEADER];
        header[..name.len()].copy_from_slice(name.as_bytes());
        let ascii = |field: &mut [u8], text: &str| {
            field[..text.len()].copy_from_slice(text.as_bytes());
        };
        ascii(&mut header[16..28], "0");
        ascii(&mut header[28..34], "0");
        ascii(&mut header[34..40], "0");
        ascii(&mut header[40..48], "644");
        ascii(&mut header[48..58], &size.to_string());
        header[58] = 0x60;
        header[59] = 0x0A;
        buf.extend_from_slice(&header);
    }

    /// An archive with one ranlib entry (`_foo` -> the sole member) and one
    /// member carrying an extended name.
    fn build_archive() -> Vec<u8> {
        // member payload and its extended name
        let member_name = b"foo.o\0\0\0"; // padded to 8
        let payload = b"not really an object";

        // symdef content references the member's header offset, computed
        // below once the directory size is known
        let symdef_name = b"__.SYMDEF\0\0\0"; // padded to 12
        let strtab = b"_foo\0\0\0\0";
        let symdef_size = 4 + 8 + 4 + strtab.len();

        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        let symdef_total = symdef_name.len() + symdef_size;
        push_header(&mut buf, &format!("#1/{}", symdef_name.len()), symdef_total);
        let member_header_offset =
            (SIZEOF_MAGIC + SIZEOF_MEMBER_HEADER + symdef_total + (symdef_total & 1)) as u32;
        buf.extend_from_slice(symdef_name);
        buf.extend_from_slice(&8u32.to_le_bytes()); // ranlib bytes
        buf.extend_from_slice(&0u32.to_le_bytes()); // ran_strx
        buf.extend_from_slice(&member_header_offset.to_le_bytes()); // ran_off
        buf.extend_from_slice(&(strtab.len() as u32).to_le_bytes());
        buf.extend_from_slice(strtab);
        pad_even(&mut buf);

        assert_eq!(buf.len(), member_header_offset as usize);
        push_header(&mut buf, &format!("#1/{}", member_name.len()), member_name.len() + payload.len());
        buf.extend_from_slice(member_name);
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn toc_and_lazy_member_lookup() {
        let data = build_archive();
        let archive = Archive::parse(PathBuf::from("libfoo.a"), data, false).unwrap();
        let offsets = archive.lookup("_foo").expect("toc entry");
        assert_eq!(offsets.len(), 1);
        let (member, bytes) = archive.member_data(offsets[0]).unwrap();
        assert_eq!(member.name, "foo.o");
        assert_eq!(bytes, b"not really an object");
        assert!(archive.lookup("_bar").is_none());
        assert_eq!(archive.object_members().count(), 1);
    }

    #[test]
    fn wrong_magic_is_a_clean_rejection() {
        let err = Archive::parse(PathBuf::from("x"), b"\x7fELF".to_vec(), false).unwrap_err();
        assert!(matches!(err, Error::NotArchive));
    }
}
