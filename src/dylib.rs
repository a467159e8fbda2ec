//! Dynamic library inputs, in both of their on-disk shapes: real Mach-O
//! dylibs, and the text-based stubs (`.tbd`) SDKs ship instead. Either way
//! the linker only needs the install name, the version pair, and the export
//! set; members stay dead until a symbol actually resolves against them.

use std::collections::BTreeSet;
use std::path::PathBuf;

use scroll::Pread;

use crate::error::{Error, Result};
use crate::mach::header::{Header64, MH_DYLIB, MH_MAGIC_64, SIZEOF_HEADER_64};
use crate::mach::load_command::{
    self, DyldInfoCommand, DylibCommand, LinkeditDataCommand, SymtabCommand,
};
use crate::mach::opcodes::{read_uleb, EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION};
use crate::mach::peek_magic;
use crate::mach::symbols::Nlist64;
use crate::options::{Abi, CpuArch, OsTag, Target};

#[derive(Debug)]
pub struct Dylib {
    pub path: PathBuf,
    pub install_name: String,
    pub timestamp: u32,
    pub current_version: u32,
    pub compatibility_version: u32,
    pub exports: BTreeSet<String>,
    pub weak_exports: BTreeSet<String>,
    /// linked as a weak dylib (missing at runtime is tolerated)
    pub weak: bool,
    /// emit a load command even when nothing binds against it
    pub needed: bool,
    /// assigned at first reference
    pub ordinal: Option<u16>,
}

impl Dylib {
    /// Parse `data` as a dylib: binary first, and on a clean rejection
    /// (`NotDylib`/`EndOfStream`) retry it as a text-based stub.
    pub fn parse(path: PathBuf, data: &[u8], target: &Target) -> Result<Dylib> {
        match Self::parse_binary(path.clone(), data) {
            Ok(dylib) => Ok(dylib),
            Err(err) if err.is_rejection() => {
                let text = core::str::from_utf8(data).map_err(|_| Error::NotDylib)?;
                Self::parse_tbd(path, text, target)
            }
            Err(err) => Err(err),
        }
    }

    pub fn exports_symbol(&self, name: &str) -> bool {
        self.exports.contains(name) || self.weak_exports.contains(name)
    }

    /// Parse a binary `MH_DYLIB`. The export set comes from the export
    /// trie when a `LC_DYLD_INFO`/`LC_DYLD_EXPORTS_TRIE` is present, else
    /// from the defined external nlists.
    pub fn parse_binary(path: PathBuf, data: &[u8]) -> Result<Dylib> {
        let magic = peek_magic(data, 0).map_err(|_| Error::NotDylib)?;
        if magic != MH_MAGIC_64 {
            return Err(Error::NotDylib);
        }
        let header: Header64 = data.pread_with(0, scroll::LE)?;
        if header.filetype != MH_DYLIB {
            return Err(Error::NotDylib);
        }

        let mut install_name = String::new();
        let mut timestamp = 0;
        let mut current_version = 0x10000;
        let mut compatibility_version = 0x10000;
        let mut trie: Option<(usize, usize)> = None;
        let mut symtab: Option<SymtabCommand> = None;

        let mut offset = SIZEOF_HEADER_64;
        for _ in 0..header.ncmds {
            let lc = load_command::peek_command(data, offset)?;
            match lc.cmd {
                load_command::LC_ID_DYLIB => {
                    let cmd: DylibCommand = data.pread_with(offset, scroll::LE)?;
                    install_name = data.pread::<&str>(offset + cmd.dylib.name as usize)?.to_string();
                    timestamp = cmd.dylib.timestamp;
                    current_version = cmd.dylib.current_version;
                    compatibility_version = cmd.dylib.compatibility_version;
                }
                load_command::LC_DYLD_INFO | load_command::LC_DYLD_INFO_ONLY => {
                    let cmd: DyldInfoCommand = data.pread_with(offset, scroll::LE)?;
                    if cmd.export_size > 0 {
                        trie = Some((cmd.export_off as usize, cmd.export_size as usize));
                    }
                }
                load_command::LC_DYLD_EXPORTS_TRIE => {
                    let cmd: LinkeditDataCommand = data.pread_with(offset, scroll::LE)?;
                    if cmd.datasize > 0 {
                        trie = Some((cmd.dataoff as usize, cmd.datasize as usize));
                    }
                }
                load_command::LC_SYMTAB => {
                    symtab = Some(data.pread_with(offset, scroll::LE)?);
                }
                _ => {}
            }
            offset += lc.cmdsize as usize;
        }

        let mut exports = BTreeSet::new();
        let mut weak_exports = BTreeSet::new();
        if let Some((off, size)) = trie {
            if off + size > data.len() {
                return Err(Error::EndOfStream);
            }
            for export in parse_export_trie(&data[off..off + size])? {
                if export.flags & EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION != 0 {
                    weak_exports.insert(export.name);
                } else {
                    exports.insert(export.name);
                }
            }
        } else if let Some(cmd) = symtab {
            let mut off = cmd.symoff as usize;
            for _ in 0..cmd.nsyms {
                let nlist: Nlist64 = data.gread_with(&mut off, scroll::LE)?;
                if nlist.is_ext() && (nlist.is_sect() || nlist.is_abs()) && !nlist.is_pext() {
                    let name: &str = data.pread(cmd.stroff as usize + nlist.n_strx as usize)?;
                    if nlist.is_weak_def() {
                        weak_exports.insert(name.to_string());
                    } else {
                        exports.insert(name.to_string());
                    }
                }
            }
        }

        Ok(Dylib {
            path,
            install_name,
            timestamp,
            current_version,
            compatibility_version,
            exports,
            weak_exports,
            weak: false,
            needed: false,
            ordinal: None,
        })
    }

    /// Parse a text-based stub. Handles the YAML-shaped v4 documents and
    /// the JSON-shaped v5 ones with a deliberately narrow reader: install
    /// name, versions, and the export/reexport symbol lists for the slice
    /// matching `target`.
    pub fn parse_tbd(path: PathBuf, text: &str, target: &Target) -> Result<Dylib> {
        let trimmed = text.trim_start();
        if trimmed.starts_with('{') {
            parse_tbd_v5(path, text)
        } else if trimmed.starts_with("--- !tapi-tbd") || trimmed.contains("tbd-version") {
            parse_tbd_v4(path, text, target)
        } else {
            Err(Error::NotDylib)
        }
    }
}

/// One terminal of an export trie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrieExport {
    pub name: String,
    pub flags: u64,
    pub offset: u64,
}

/// Decode every terminal of an export trie, depth-first in edge order.
/// Doubles as the reference interpreter the writer's tests round-trip
/// against.
pub fn parse_export_trie(bytes: &[u8]) -> Result<Vec<TrieExport>> {
    let mut exports = Vec::new();
    if bytes.is_empty() {
        return Ok(exports);
    }
    walk_trie_node(bytes, 0, String::new(), &mut exports, 0)?;
    Ok(exports)
}

fn walk_trie_node(
    bytes: &[u8],
    node_offset: usize,
    prefix: String,
    exports: &mut Vec<TrieExport>,
    depth: usize,
) -> Result<()> {
    if depth > 128 {
        return Err(Error::Malformed("export trie deeper than any real name".into()));
    }
    let mut offset = node_offset;
    let terminal_size = read_uleb(bytes, &mut offset)?;
    if terminal_size > 0 {
        let mut terminal = offset;
        let flags = read_uleb(bytes, &mut terminal)?;
        let value = read_uleb(bytes, &mut terminal)?;
        exports.push(TrieExport { name: prefix.clone(), flags, offset: value });
    }
    offset += terminal_size as usize;
    let nedges = *bytes.get(offset).ok_or(Error::EndOfStream)?;
    offset += 1;
    for _ in 0..nedges {
        let rest = bytes.get(offset..).ok_or(Error::EndOfStream)?;
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(Error::EndOfStream)?;
        let label = core::str::from_utf8(&rest[..end])
            .map_err(|_| Error::Malformed("non-UTF8 trie edge".into()))?;
        offset += end + 1;
        let child = read_uleb(bytes, &mut offset)? as usize;
        walk_trie_node(bytes, child, format!("{prefix}{label}"), exports, depth + 1)?;
    }
    Ok(())
}

/// The tbd target string for this link target, e.g. `arm64-macos`.
fn tbd_target(target: &Target) -> String {
    let arch = match target.cpu_arch {
        CpuArch::X86_64 => "x86_64",
        CpuArch::Aarch64 => "arm64",
    };
    let os = match (target.os, target.abi) {
        (OsTag::Macos, _) => "macos".to_string(),
        (OsTag::Ios, Abi::Simulator) => "ios-simulator".to_string(),
        (OsTag::Ios, Abi::None) => "ios".to_string(),
        (OsTag::Tvos, Abi::Simulator) => "tvos-simulator".to_string(),
        (OsTag::Tvos, Abi::None) => "tvos".to_string(),
        (OsTag::Watchos, Abi::Simulator) => "watchos-simulator".to_string(),
        (OsTag::Watchos, Abi::None) => "watchos".to_string(),
    };
    format!("{arch}-{os}")
}

/// `"1319.100.3"` -> nibble-packed `xxxx.yy.zz`.
fn pack_version(text: &str) -> u32 {
    let mut parts = text.trim().trim_matches(['\'', '"']).split('.');
    let major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let patch: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (major << 16) | ((minor & 0xff) << 8) | (patch & 0xff)
}

fn unquote(text: &str) -> &str {
    text.trim().trim_matches(['\'', '"'])
}

/// Collect the comma-separated entries of a `[ ... ]` list that may span
/// lines; `acc` receives each unquoted entry.
struct ListCollector {
    open: bool,
}

impl ListCollector {
    fn feed(&mut self, text: &str, acc: &mut Vec<String>) {
        let mut rest = text;
        if !self.open {
            match rest.find('[') {
                Some(i) => {
                    rest = &rest[i + 1..];
                    self.open = true;
                }
                None => return,
            }
        }
        let closed = rest.find(']');
        let body = match closed {
            Some(i) => &rest[..i],
            None => rest,
        };
        for entry in body.split(',') {
            let entry = unquote(entry);
            if !entry.is_empty() {
                acc.push(entry.to_string());
            }
        }
        if closed.is_some() {
            self.open = false;
        }
    }
}

fn parse_tbd_v4(path: PathBuf, text: &str, target: &Target) -> Result<Dylib> {
    let wanted = tbd_target(target);
    let mut install_name = String::new();
    let mut current_version = 0x10000;
    let mut compatibility_version = 0x10000;
    let mut exports = BTreeSet::new();
    let mut weak_exports = BTreeSet::new();

    #[derive(PartialEq, Clone, Copy)]
    enum Section {
        Top,
        Exports,
        Other,
    }
    let mut section = Section::Top;
    // block state within an exports/reexports section
    let mut block_targets: Vec<String> = Vec::new();
    let mut block_matches = true;
    let mut collector = ListCollector { open: false };
    let mut collecting: Option<&'static str> = None;
    let mut scratch: Vec<String> = Vec::new();

    let mut flush = |key: Option<&'static str>,
                     scratch: &mut Vec<String>,
                     block_targets: &mut Vec<String>,
                     block_matches: &mut bool,
                     exports: &mut BTreeSet<String>,
                     weak_exports: &mut BTreeSet<String>| {
        match key {
            Some("targets") => {
                *block_targets = scratch.clone();
                *block_matches =
                    block_targets.is_empty() || block_targets.iter().any(|t| t == &wanted);
            }
            Some("symbols") if *block_matches => {
                exports.extend(scratch.iter().cloned());
            }
            Some("weak-symbols") if *block_matches => {
                weak_exports.extend(scratch.iter().cloned());
            }
            _ => {}
        }
        scratch.clear();
    };

    for raw_line in text.lines() {
        let line = raw_line.trim_end();
        if line.starts_with("...") {
            break;
        }
        let stripped = line.trim_start();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }

        if collector.open {
            collector.feed(stripped, &mut scratch);
            if !collector.open {
                flush(
                    collecting.take(),
                    &mut scratch,
                    &mut block_targets,
                    &mut block_matches,
                    &mut exports,
                    &mut weak_exports,
                );
            }
            continue;
        }

        // a new list item starts a fresh block within the section
        let stripped = if let Some(rest) = stripped.strip_prefix("- ") {
            if section == Section::Exports {
                block_targets.clear();
                block_matches = true;
            }
            rest
        } else {
            stripped
        };

        let Some((key, value)) = stripped.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        if !line.starts_with(' ') && !line.starts_with('-') {
            // top-level key
            section = match key {
                "exports" | "reexports" => Section::Exports,
                "install-name" | "current-version" | "compatibility-version" | "tbd-version"
                | "targets" => Section::Top,
                _ => Section::Other,
            };
        }

        match key {
            "install-name" => install_name = unquote(value).to_string(),
            "current-version" => current_version = pack_version(value),
            "compatibility-version" => compatibility_version = pack_version(value),
            "targets" | "symbols" | "weak-symbols" if section == Section::Exports || key == "targets" => {
                collecting = Some(match key {
                    "targets" => "targets",
                    "symbols" => "symbols",
                    _ => "weak-symbols",
                });
                collector.feed(value, &mut scratch);
                if !collector.open {
                    flush(
                        collecting.take(),
                        &mut scratch,
                        &mut block_targets,
                        &mut block_matches,
                        &mut exports,
                        &mut weak_exports,
                    );
                }
            }
            _ => {}
        }
    }

    if install_name.is_empty() {
        return Err(Error::Malformed(format!(
            "{}: text stub has no install-name",
            path.display()
        )));
    }
    Ok(Dylib {
        path,
        install_name,
        timestamp: 0,
        current_version,
        compatibility_version,
        exports,
        weak_exports,
        weak: false,
        needed: false,
        ordinal: None,
    })
}

/// The v5 documents are JSON; this reads just the fields the linker uses.
fn parse_tbd_v5(path: PathBuf, text: &str) -> Result<Dylib> {
    fn quoted_strings_after(text: &str, key: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut search = 0;
        while let Some(pos) = text[search..].find(key) {
            let start = search + pos + key.len();
            let Some(open) = text[start..].find('[') else { break };
            let Some(close) = text[start + open..].find(']') else { break };
            let body = &text[start + open + 1..start + open + close];
            let mut rest = body;
            while let Some(q) = rest.find('"') {
                let tail = &rest[q + 1..];
                let Some(end) = tail.find('"') else { break };
                // a string immediately followed by ':' is an object key
                let after = tail[end + 1..].trim_start();
                if !after.starts_with(':') {
                    out.push(tail[..end].to_string());
                }
                rest = &tail[end + 1..];
            }
            search = start + open + close;
        }
        out
    }

    let install_name = quoted_strings_after(text, "\"install_names\"")
        .into_iter()
        .next()
        .ok_or_else(|| {
            Error::Malformed(format!("{}: text stub has no install name", path.display()))
        })?;
    let exports: BTreeSet<String> = quoted_strings_after(text, "\"global\"").into_iter().collect();
    let weak_exports: BTreeSet<String> =
        quoted_strings_after(text, "\"weak\"").into_iter().collect();

    Ok(Dylib {
        path,
        install_name,
        timestamp: 0,
        current_version: 0x10000,
        compatibility_version: 0x10000,
        exports,
        weak_exports,
        weak: false,
        needed: false,
        ordinal: None,
    })
}
