//! The `__LINKEDIT` writer: rebase/bind/lazy-bind opcode streams, the
//! export trie, function starts, data-in-code, the symbol/string tables
//! and the indirect symbol table, each written 8-byte aligned and recorded
//! in its load command.
//!
//! The module also carries reference interpreters for the rebase and bind
//! streams; the tests run them over emitted bytes to prove the opcode
//! round trip.

use std::collections::BTreeMap;

use log::debug;

use crate::atom::{SymbolId, NONE};
use crate::error::{Error, Result};
use crate::linker::{BindEntry, FileData, Linker};
use crate::mach::constants::*;
use crate::mach::load_command::{
    DyldInfoCommand, DysymtabCommand, LinkeditDataCommand, SymtabCommand, LC_DATA_IN_CODE,
    LC_DYLD_INFO_ONLY, LC_DYSYMTAB, LC_FUNCTION_STARTS, LC_SYMTAB,
};
use crate::mach::opcodes::*;
use crate::mach::symbols::{Nlist64, N_BNSYM, N_ENSYM, N_EXT, N_FUN, N_GSYM, N_OSO, N_SECT, N_SO,
    N_STSYM, N_UNDF};
use crate::mach::symbols::SIZEOF_NLIST_64;

/// Everything the header writer needs to finish the load commands.
#[derive(Debug, Default)]
pub struct LinkeditData {
    pub dyld_info: DyldInfoCommand,
    pub function_starts: LinkeditDataCommand,
    pub data_in_code: LinkeditDataCommand,
    pub symtab: SymtabCommand,
    pub dysymtab: DysymtabCommand,
    /// per-stub starting offset of its lazy-bind sub-program
    pub lazy_bind_offsets: Vec<u32>,
}

fn align8(out: &mut Vec<u8>) {
    while out.len() % 8 != 0 {
        out.push(0);
    }
}

/// Serialize every LINKEDIT block onto the end of `out` (which must end at
/// the `__LINKEDIT` file offset).
pub fn write(linker: &mut Linker, out: &mut Vec<u8>) -> Result<LinkeditData> {
    let mut data = LinkeditData::default();

    align8(out);
    let rebase_off = out.len();
    write_rebase_stream(linker, out);
    data.dyld_info.rebase_off = rebase_off as u32;
    data.dyld_info.rebase_size = (out.len() - rebase_off) as u32;

    align8(out);
    let bind_off = out.len();
    write_bind_stream(linker, out);
    data.dyld_info.bind_off = bind_off as u32;
    data.dyld_info.bind_size = (out.len() - bind_off) as u32;

    align8(out);
    let lazy_off = out.len();
    data.lazy_bind_offsets = write_lazy_bind_stream(linker, out);
    data.dyld_info.lazy_bind_off = lazy_off as u32;
    data.dyld_info.lazy_bind_size = (out.len() - lazy_off) as u32;

    align8(out);
    let export_off = out.len();
    write_export_trie(linker, out);
    data.dyld_info.export_off = export_off as u32;
    data.dyld_info.export_size = (out.len() - export_off) as u32;
    data.dyld_info.cmd = LC_DYLD_INFO_ONLY;
    data.dyld_info.cmdsize = crate::mach::load_command::SIZEOF_DYLD_INFO_COMMAND as u32;
    if data.dyld_info.rebase_size == 0 {
        data.dyld_info.rebase_off = 0;
    }
    if data.dyld_info.bind_size == 0 {
        data.dyld_info.bind_off = 0;
    }
    if data.dyld_info.lazy_bind_size == 0 {
        data.dyld_info.lazy_bind_off = 0;
    }
    if data.dyld_info.export_size == 0 {
        data.dyld_info.export_off = 0;
    }

    align8(out);
    let fstarts_off = out.len();
    write_function_starts(linker, out);
    data.function_starts = LinkeditDataCommand {
        cmd: LC_FUNCTION_STARTS,
        cmdsize: crate::mach::load_command::SIZEOF_LINKEDIT_DATA_COMMAND as u32,
        dataoff: fstarts_off as u32,
        datasize: (out.len() - fstarts_off) as u32,
    };

    align8(out);
    let dice_off = out.len();
    write_data_in_code(linker, out);
    data.data_in_code = LinkeditDataCommand {
        cmd: LC_DATA_IN_CODE,
        cmdsize: crate::mach::load_command::SIZEOF_LINKEDIT_DATA_COMMAND as u32,
        dataoff: dice_off as u32,
        datasize: (out.len() - dice_off) as u32,
    };

    align8(out);
    let (symtab, dysymtab) = write_symtab(linker, out)?;
    data.symtab = symtab;
    data.dysymtab = dysymtab;

    debug!(
        "LINKEDIT: rebase {} bind {} lazy {} export {} symtab {} syms",
        data.dyld_info.rebase_size,
        data.dyld_info.bind_size,
        data.dyld_info.lazy_bind_size,
        data.dyld_info.export_size,
        data.symtab.nsyms
    );
    Ok(data)
}

// ----------------------------------------------------------------------
// rebase
// ----------------------------------------------------------------------

fn write_rebase_stream(linker: &mut Linker, out: &mut Vec<u8>) {
    let mut entries = std::mem::take(&mut linker.rebase_entries);
    entries.sort_unstable();
    entries.dedup();
    linker.rebase_entries = entries.clone();
    if entries.is_empty() {
        return;
    }

    out.push(REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER);
    let mut segment = u32::MAX;
    let mut cursor = 0u64;
    let mut i = 0;
    while i < entries.len() {
        let (seg, off) = entries[i];
        if seg != segment {
            out.push(REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | (seg as u8 & 0x0f));
            write_uleb(out, off);
            segment = seg;
            cursor = off;
        } else if off != cursor {
            out.push(REBASE_OPCODE_ADD_ADDR_ULEB);
            write_uleb(out, off - cursor);
            cursor = off;
        }

        // count consecutive 8-byte strides in this segment
        let mut run = 1;
        while i + run < entries.len()
            && entries[i + run].0 == seg
            && entries[i + run].1 == off + 8 * run as u64
        {
            run += 1;
        }
        if run > 1 {
            out.push(REBASE_OPCODE_DO_REBASE_ULEB_TIMES);
            write_uleb(out, run as u64);
            cursor += 8 * run as u64;
            i += run;
            continue;
        }

        // uniform wider stride gets the skipping form
        if i + 2 < entries.len() && entries[i + 1].0 == seg && entries[i + 2].0 == seg {
            let stride = entries[i + 1].1.wrapping_sub(off);
            if stride > 8 && entries[i + 2].1.wrapping_sub(entries[i + 1].1) == stride {
                let mut count = 2;
                while i + count < entries.len()
                    && entries[i + count].0 == seg
                    && entries[i + count].1 == off + stride * count as u64
                {
                    count += 1;
                }
                out.push(REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB);
                write_uleb(out, count as u64);
                write_uleb(out, stride - 8);
                cursor += stride * count as u64;
                i += count;
                continue;
            }
        }

        out.push(REBASE_OPCODE_DO_REBASE_IMM_TIMES | 1);
        cursor += 8;
        i += 1;
    }
    out.push(REBASE_OPCODE_DONE);
}

// ----------------------------------------------------------------------
// bind
// ----------------------------------------------------------------------

fn emit_ordinal(out: &mut Vec<u8>, ordinal: i16) {
    if ordinal < 0 {
        out.push(BIND_OPCODE_SET_DYLIB_SPECIAL_IMM | (ordinal as u8 & BIND_IMMEDIATE_MASK));
    } else if ordinal <= 15 {
        out.push(BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | ordinal as u8);
    } else {
        out.push(BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB);
        write_uleb(out, ordinal as u64);
    }
}

fn emit_symbol(out: &mut Vec<u8>, name: &str, flags: u8) {
    out.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM | (flags & BIND_IMMEDIATE_MASK));
    out.extend_from_slice(name.as_bytes());
    out.push(0);
}

/// The non-lazy bind stream: sorted by `(segment, name, offset)` so the
/// output is byte-identical across runs, with consecutive slots coalesced.
fn write_bind_stream(linker: &mut Linker, out: &mut Vec<u8>) {
    let mut entries: Vec<(String, BindEntry)> = linker
        .bind_entries
        .iter()
        .filter(|e| !e.lazy)
        .map(|e| (linker.sym_name(e.target).to_string(), *e))
        .collect();
    entries.sort_by(|a, b| {
        (a.1.segment, &a.0, a.1.offset).cmp(&(b.1.segment, &b.0, b.1.offset))
    });
    if entries.is_empty() {
        return;
    }

    let mut segment = u32::MAX;
    let mut cursor = 0u64;
    let mut bound_name: Option<String> = None;
    let mut bound_ordinal: Option<i16> = None;
    let mut bound_addend = 0i64;
    let mut type_set = false;

    let mut i = 0;
    while i < entries.len() {
        let (name, entry) = &entries[i];
        if entry.segment != segment {
            out.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | (entry.segment as u8 & 0x0f));
            write_uleb(out, entry.offset);
            segment = entry.segment;
            cursor = entry.offset;
        }
        if bound_name.as_deref() != Some(name.as_str()) {
            let sym = &linker.symbols[entry.target as usize];
            let flags = if sym.flags.weak_ref { BIND_SYMBOL_FLAGS_WEAK_IMPORT } else { 0 };
            emit_symbol(out, name, flags);
            bound_name = Some(name.clone());
            if !type_set {
                out.push(BIND_OPCODE_SET_TYPE_IMM | BIND_TYPE_POINTER);
                type_set = true;
            }
            let ordinal = linker.ordinals.get(&entry.target).copied().unwrap_or(0);
            if bound_ordinal != Some(ordinal) {
                emit_ordinal(out, ordinal);
                bound_ordinal = Some(ordinal);
            }
        }
        if entry.addend != bound_addend {
            out.push(BIND_OPCODE_SET_ADDEND_SLEB);
            write_sleb(out, entry.addend);
            bound_addend = entry.addend;
        }
        if entry.offset != cursor {
            out.push(BIND_OPCODE_ADD_ADDR_ULEB);
            write_uleb(out, entry.offset.wrapping_sub(cursor));
            cursor = entry.offset;
        }

        // coalesce runs of this symbol's slots
        let same = |e: &(String, BindEntry)| {
            e.0 == *name && e.1.segment == segment && e.1.addend == entry.addend
        };
        let mut run = 1;
        while i + run < entries.len() && same(&entries[i + run]) {
            run += 1;
        }
        if run > 2 {
            let stride = entries[i + 1].1.offset.wrapping_sub(entry.offset);
            let uniform = stride >= 8
                && (1..run).all(|k| {
                    entries[i + k].1.offset == entry.offset + stride * k as u64
                });
            if uniform {
                out.push(BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB);
                write_uleb(out, run as u64);
                write_uleb(out, stride - 8);
                cursor = entry.offset + stride * run as u64;
                i += run;
                continue;
            }
        }
        if run == 2 {
            let stride = entries[i + 1].1.offset.wrapping_sub(entry.offset);
            let scale = (stride.wrapping_sub(8)) / 8;
            if stride > 8 && stride % 8 == 0 && scale <= 15 {
                out.push(BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED | scale as u8);
                cursor = entry.offset + stride;
                i += 1;
                continue;
            }
        }
        out.push(BIND_OPCODE_DO_BIND);
        cursor = entry.offset + 8;
        i += 1;
    }
    out.push(BIND_OPCODE_DONE);
}

/// One self-contained sub-program per lazy pointer, in stub order. Returns
/// the byte offset of each sub-program; the stub helpers carry them as
/// immediates.
fn write_lazy_bind_stream(linker: &mut Linker, out: &mut Vec<u8>) -> Vec<u32> {
    let base = out.len();
    let mut offsets = Vec::with_capacity(linker.stubs.len());
    let lazies: Vec<BindEntry> = linker.bind_entries.iter().filter(|e| e.lazy).copied().collect();
    for entry in lazies {
        offsets.push((out.len() - base) as u32);
        out.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | (entry.segment as u8 & 0x0f));
        write_uleb(out, entry.offset);
        let ordinal = linker.ordinals.get(&entry.target).copied().unwrap_or(0);
        emit_ordinal(out, ordinal);
        let sym = &linker.symbols[entry.target as usize];
        let flags = if sym.flags.weak_ref { BIND_SYMBOL_FLAGS_WEAK_IMPORT } else { 0 };
        let name = linker.sym_name(entry.target).to_string();
        emit_symbol(out, &name, flags);
        out.push(BIND_OPCODE_DO_BIND);
        out.push(BIND_OPCODE_DONE);
    }
    offsets
}

// ----------------------------------------------------------------------
// export trie
// ----------------------------------------------------------------------

#[derive(Debug, Default)]
struct TrieNode {
    /// edge label -> child node index, ordered for deterministic output
    edges: BTreeMap<String, usize>,
    terminal: Option<(u64, u64)>,
    offset: u64,
}

fn trie_insert(nodes: &mut Vec<TrieNode>, name: &str, flags: u64, offset: u64) {
    let mut current = 0usize;
    let mut rest = name;
    'outer: loop {
        if rest.is_empty() {
            nodes[current].terminal = Some((flags, offset));
            return;
        }
        let labels: Vec<String> = nodes[current].edges.keys().cloned().collect();
        for label in labels {
            let common = common_prefix_len(&label, rest);
            if common == 0 {
                continue;
            }
            if common == label.len() {
                // follow the edge
                current = nodes[current].edges[&label];
                rest = &rest[common..];
                continue 'outer;
            }
            // split the edge
            let existing_child = nodes[current].edges.remove(&label).unwrap();
            let mid = nodes.len();
            nodes.push(TrieNode::default());
            nodes[mid]
                .edges
                .insert(label[common..].to_string(), existing_child);
            nodes[current].edges.insert(label[..common].to_string(), mid);
            current = mid;
            rest = &rest[common..];
            continue 'outer;
        }
        // no shared prefix with any edge: new leaf
        let leaf = nodes.len();
        nodes.push(TrieNode::default());
        nodes[leaf].terminal = Some((flags, offset));
        nodes[current].edges.insert(rest.to_string(), leaf);
        return;
    }
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}

fn trie_node_size(nodes: &[TrieNode], index: usize) -> u64 {
    let node = &nodes[index];
    let terminal_size = match node.terminal {
        Some((flags, offset)) => (uleb_len(flags) + uleb_len(offset)) as u64,
        None => 0,
    };
    let mut size = uleb_len(terminal_size) as u64 + terminal_size + 1;
    for (label, &child) in &node.edges {
        size += label.len() as u64 + 1 + uleb_len(nodes[child].offset) as u64;
    }
    size
}

/// Names exported from this image, with their trie flags and their offset
/// from the image base.
pub fn exported_symbols(linker: &Linker) -> Vec<(String, u64, u64)> {
    let image_base = linker
        .segments
        .iter()
        .find(|s| s.name() == SEG_TEXT)
        .map(|s| s.header.vmaddr)
        .unwrap_or(0);
    let mut exports: Vec<(String, u64, u64)> = linker
        .symbols
        .iter()
        .skip(1)
        .filter(|sym| {
            sym.is_defined()
                && !sym.flags.local
                && !sym.flags.pext
                && !sym.flags.import
                && !sym.flags.boundary
                && (sym.atom == NONE || linker.atoms[sym.atom as usize].alive)
        })
        .map(|sym| {
            let flags = if sym.flags.weak {
                EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION
            } else {
                EXPORT_SYMBOL_FLAGS_KIND_REGULAR
            };
            (
                linker.strings.get(sym.name).to_string(),
                flags,
                sym.value - image_base,
            )
        })
        .collect();
    exports.sort();
    exports.dedup();
    exports
}

fn write_export_trie(linker: &mut Linker, out: &mut Vec<u8>) {
    let exports = exported_symbols(linker);
    if exports.is_empty() {
        return;
    }
    let bytes = build_export_trie(&exports);
    out.extend_from_slice(&bytes);
}

/// Build the serialized trie: insert every name, then iterate offset
/// assignment to a fixpoint (ULEB child offsets change node sizes), then
/// emit.
pub fn build_export_trie(exports: &[(String, u64, u64)]) -> Vec<u8> {
    let mut nodes = vec![TrieNode::default()];
    for (name, flags, offset) in exports {
        trie_insert(&mut nodes, name, *flags, *offset);
    }

    // nodes are emitted in creation order (root first); offsets settle
    // after a few rounds since they only ever shrink or grow by ULEB width
    loop {
        let mut changed = false;
        let mut offset = 0u64;
        for index in 0..nodes.len() {
            if nodes[index].offset != offset {
                nodes[index].offset = offset;
                changed = true;
            }
            offset += trie_node_size(&nodes, index);
        }
        if !changed {
            break;
        }
    }

    let mut out = Vec::new();
    for index in 0..nodes.len() {
        debug_assert_eq!(nodes[index].offset, out.len() as u64);
        let node = &nodes[index];
        match node.terminal {
            Some((flags, value)) => {
                let terminal_size = (uleb_len(flags) + uleb_len(value)) as u64;
                write_uleb(&mut out, terminal_size);
                write_uleb(&mut out, flags);
                write_uleb(&mut out, value);
            }
            None => out.push(0),
        }
        out.push(node.edges.len() as u8);
        for (label, &child) in &node.edges {
            out.extend_from_slice(label.as_bytes());
            out.push(0);
            write_uleb(&mut out, nodes[child].offset);
        }
    }
    out
}

// ----------------------------------------------------------------------
// function starts, data-in-code
// ----------------------------------------------------------------------

fn is_code_section(linker: &Linker, sect_id: u32) -> bool {
    let sect = &linker.out_sections[sect_id as usize];
    sect.seg_name() == SEG_TEXT
        && sect.header.flags & (S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS) != 0
}

/// Addresses of function symbols in text sections, as ULEB deltas from the
/// `__TEXT` base.
fn write_function_starts(linker: &Linker, out: &mut Vec<u8>) {
    let text_base = linker
        .segments
        .iter()
        .find(|s| s.name() == SEG_TEXT)
        .map(|s| s.header.vmaddr)
        .unwrap_or(0);
    let mut addrs: Vec<u64> = linker
        .symbols
        .iter()
        .skip(1)
        .filter(|sym| {
            sym.atom != NONE
                && linker.atoms[sym.atom as usize].alive
                // stubs, helpers and thunks are not functions
                && linker.atoms[sym.atom as usize].file != NONE
                && !sym.flags.import
                && is_code_section(linker, linker.atoms[sym.atom as usize].out_sect)
        })
        .map(|sym| sym.value)
        .collect();
    addrs.sort_unstable();
    addrs.dedup();
    if addrs.is_empty() {
        return;
    }
    let mut previous = text_base;
    for addr in addrs {
        write_uleb(out, addr - previous);
        previous = addr;
    }
    out.push(0);
    align8(out);
}

/// Data-in-code ranges, rebased from input file offsets to output ones.
fn write_data_in_code(linker: &Linker, out: &mut Vec<u8>) {
    use scroll::Pwrite;
    let mut entries: Vec<crate::mach::load_command::DataInCodeEntry> = Vec::new();
    for file in linker.files.iter().skip(1) {
        let FileData::Object(object) = &file.data else { continue };
        for (i, &aid) in object.section_atoms.iter().enumerate() {
            if aid == NONE || !linker.atoms[aid as usize].alive {
                continue;
            }
            let atom = &linker.atoms[aid as usize];
            let sect = &object.sections[i];
            if atom.dice.is_empty() {
                continue;
            }
            let out_base = linker.atom_file_offset(aid);
            for dice in &object.dice[atom.dice.range()] {
                entries.push(crate::mach::load_command::DataInCodeEntry {
                    offset: (out_base + (dice.offset as u64 - sect.offset as u64)) as u32,
                    length: dice.length,
                    kind: dice.kind,
                });
            }
        }
    }
    entries.sort_by_key(|e| e.offset);
    for entry in entries {
        let mut buf = [0u8; 8];
        buf.pwrite_with(entry, 0, scroll::LE).unwrap();
        out.extend_from_slice(&buf);
    }
}

// ----------------------------------------------------------------------
// symtab
// ----------------------------------------------------------------------

fn push_nlist(out: &mut Vec<u8>, nlist: Nlist64) {
    use scroll::Pwrite;
    let mut buf = [0u8; SIZEOF_NLIST_64];
    buf.pwrite_with(nlist, 0, scroll::LE).unwrap();
    out.extend_from_slice(&buf);
}

fn atom_is_code(linker: &Linker, sid: SymbolId) -> bool {
    let atom = linker.symbols[sid as usize].atom;
    atom != NONE && is_code_section(linker, linker.atoms[atom as usize].out_sect)
}

fn output_section_ordinal(linker: &Linker, sid: SymbolId) -> u8 {
    let atom = linker.symbols[sid as usize].atom;
    if atom == NONE {
        return 0;
    }
    // out_sections are already in final order, 1-based past the placeholder
    linker.atoms[atom as usize].out_sect as u8
}

/// Locals (with stabs) first, then exports, then imports; returns the two
/// commands. Import symtab positions are recorded for the indirect table.
fn write_symtab(linker: &mut Linker, out: &mut Vec<u8>) -> Result<(SymtabCommand, DysymtabCommand)> {
    let mut nlists: Vec<u8> = Vec::new();
    let mut count = 0u32;

    // ---- locals, stabs interleaved per object
    let object_files: Vec<u32> = linker
        .files
        .iter()
        .filter(|f| f.alive && matches!(f.data, FileData::Object(_)))
        .map(|f| f.index)
        .collect();
    for fid in object_files {
        if !linker.options.strip {
            count += write_stabs_for(linker, fid, &mut nlists);
        }
        // regular locals of this object
        let locals: Vec<SymbolId> = {
            let object = linker.object(fid);
            (0..object.first_global)
                .filter_map(|idx| {
                    let sid = object.symbols[idx];
                    if sid == NONE { None } else { Some(sid) }
                })
                .collect()
        };
        for sid in locals {
            let sym = linker.symbols[sid as usize];
            if !sym.flags.output_symtab || !sym.flags.local {
                continue;
            }
            if sym.atom != NONE && !linker.atoms[sym.atom as usize].alive {
                continue;
            }
            linker.symtab_pos.insert(sid, count);
            push_nlist(
                &mut nlists,
                Nlist64 {
                    n_strx: sym.name,
                    n_type: N_SECT,
                    n_sect: output_section_ordinal(linker, sid),
                    n_desc: sym.desc,
                    n_value: sym.value,
                },
            );
            count += 1;
        }
    }
    // private externs demote to locals in the output
    let pext_globals: Vec<SymbolId> = (1..linker.symbols.len() as SymbolId)
        .filter(|&sid| {
            let sym = &linker.symbols[sid as usize];
            sym.flags.pext
                && sym.flags.output_symtab
                && !sym.flags.local
                && sym.is_defined()
                && (sym.atom == NONE || linker.atoms[sym.atom as usize].alive)
        })
        .collect();
    for sid in pext_globals {
        let sym = linker.symbols[sid as usize];
        linker.symtab_pos.insert(sid, count);
        push_nlist(
            &mut nlists,
            Nlist64 {
                n_strx: sym.name,
                n_type: N_SECT,
                n_sect: output_section_ordinal(linker, sid),
                n_desc: sym.desc,
                n_value: sym.value,
            },
        );
        count += 1;
    }
    let nlocalsym = count;

    // ---- defined externals, sorted by name
    let mut exports: Vec<SymbolId> = (1..linker.symbols.len() as SymbolId)
        .filter(|&sid| {
            let sym = &linker.symbols[sid as usize];
            !sym.flags.local
                && !sym.flags.pext
                && !sym.flags.import
                && sym.flags.output_symtab
                && sym.is_defined()
                && (sym.atom == NONE || linker.atoms[sym.atom as usize].alive)
        })
        .collect();
    exports.sort_by(|&a, &b| linker.sym_name(a).cmp(linker.sym_name(b)));
    let iextdefsym = count;
    for sid in exports {
        let sym = linker.symbols[sid as usize];
        linker.symtab_pos.insert(sid, count);
        // atom-less synthetics (the header marker) belong to the first
        // section as far as nm is concerned
        let n_sect = output_section_ordinal(linker, sid).max(1);
        push_nlist(
            &mut nlists,
            Nlist64 {
                n_strx: sym.name,
                n_type: N_SECT | N_EXT,
                n_sect,
                n_desc: sym.desc,
                n_value: sym.value,
            },
        );
        count += 1;
    }
    let nextdefsym = count - iextdefsym;

    // ---- imports, sorted by name
    let mut imports: Vec<SymbolId> = (1..linker.symbols.len() as SymbolId)
        .filter(|&sid| linker.symbols[sid as usize].flags.import)
        .collect();
    imports.sort_by(|&a, &b| linker.sym_name(a).cmp(linker.sym_name(b)));
    let iundefsym = count;
    for sid in imports {
        let sym = linker.symbols[sid as usize];
        linker.symtab_pos.insert(sid, count);
        push_nlist(
            &mut nlists,
            Nlist64 {
                n_strx: sym.name,
                n_type: N_UNDF | N_EXT,
                n_sect: 0,
                n_desc: sym.desc,
                n_value: 0,
            },
        );
        count += 1;
    }
    let nundefsym = count - iundefsym;

    let symoff = out.len();
    out.extend_from_slice(&nlists);

    // ---- string table: the interner is the string table
    align8(out);
    let stroff = out.len();
    out.extend_from_slice(linker.strings.as_bytes());
    let strsize = (out.len() - stroff) as u32;

    // ---- indirect symbol table: one u32 per stub, per GOT slot, per lazy
    // pointer
    align8(out);
    let indirectsymoff = out.len();
    let mut indirect: Vec<u32> = Vec::new();
    let stub_targets: Vec<SymbolId> =
        linker.stubs.entries.iter().map(|e| e.target).collect();
    let got_targets: Vec<SymbolId> = linker.got.entries.iter().map(|e| e.target).collect();
    for &target in &stub_targets {
        indirect.push(linker.symtab_pos.get(&target).copied().unwrap_or(0));
    }
    let stubs_base = 0u32;
    let got_base = indirect.len() as u32;
    for &target in &got_targets {
        if linker.symbols[target as usize].flags.import {
            indirect.push(linker.symtab_pos.get(&target).copied().unwrap_or(0));
        } else {
            indirect.push(INDIRECT_SYMBOL_LOCAL);
        }
    }
    let la_base = indirect.len() as u32;
    for &target in &stub_targets {
        indirect.push(linker.symtab_pos.get(&target).copied().unwrap_or(0));
    }
    for value in &indirect {
        out.extend_from_slice(&value.to_le_bytes());
    }

    // stamp reserved1 on the synthetic sections
    for sect_id in 1..linker.out_sections.len() {
        let sect = &mut linker.out_sections[sect_id];
        match sect.header.flags & SECTION_TYPE {
            S_SYMBOL_STUBS => sect.header.reserved1 = stubs_base,
            S_NON_LAZY_SYMBOL_POINTERS => sect.header.reserved1 = got_base,
            S_LAZY_SYMBOL_POINTERS => sect.header.reserved1 = la_base,
            _ => {}
        }
    }

    let symtab = SymtabCommand {
        cmd: LC_SYMTAB,
        cmdsize: crate::mach::load_command::SIZEOF_SYMTAB_COMMAND as u32,
        symoff: symoff as u32,
        nsyms: count,
        stroff: stroff as u32,
        strsize,
    };
    let mut dysymtab = DysymtabCommand::default();
    dysymtab.cmd = LC_DYSYMTAB;
    dysymtab.cmdsize = crate::mach::load_command::SIZEOF_DYSYMTAB_COMMAND as u32;
    dysymtab.ilocalsym = 0;
    dysymtab.nlocalsym = nlocalsym;
    dysymtab.iextdefsym = iextdefsym;
    dysymtab.nextdefsym = nextdefsym;
    dysymtab.iundefsym = iundefsym;
    dysymtab.nundefsym = nundefsym;
    dysymtab.indirectsymoff = indirectsymoff as u32;
    dysymtab.nindirectsyms = indirect.len() as u32;
    Ok((symtab, dysymtab))
}

/// The debug map for one object: `N_SO` comp dir and name, `N_OSO` with
/// the object's mtime, a `BNSYM/FUN/FUN/ENSYM` quad per function symbol,
/// `N_GSYM`/`N_STSYM` per data symbol, and a closing `N_SO`.
fn write_stabs_for(linker: &mut Linker, fid: u32, nlists: &mut Vec<u8>) -> u32 {
    let Some(dwarf) = linker.object(fid).dwarf.clone() else {
        return 0;
    };
    let mut count = 0u32;

    let comp_dir = if dwarf.comp_dir.ends_with('/') || dwarf.comp_dir.is_empty() {
        dwarf.comp_dir.clone()
    } else {
        format!("{}/", dwarf.comp_dir)
    };
    let comp_dir_strx = linker.intern(&comp_dir);
    let name_strx = linker.intern(&dwarf.name);
    let oso_name = linker.object(fid).display_name();
    let oso_strx = linker.intern(&oso_name);
    let mtime = linker.object(fid).mtime;

    push_nlist(nlists, Nlist64 { n_strx: comp_dir_strx, n_type: N_SO, n_sect: 0, n_desc: 0, n_value: 0 });
    push_nlist(nlists, Nlist64 { n_strx: name_strx, n_type: N_SO, n_sect: 0, n_desc: 0, n_value: 0 });
    push_nlist(nlists, Nlist64 { n_strx: oso_strx, n_type: N_OSO, n_sect: 0, n_desc: 1, n_value: mtime });
    count += 3;

    // every defined symbol this object still owns
    let owned: Vec<SymbolId> = {
        let object = linker.object(fid);
        object
            .symbols
            .iter()
            .enumerate()
            .filter_map(|(idx, &sid)| {
                if sid == NONE {
                    return None;
                }
                let sym = &linker.symbols[sid as usize];
                if sym.atom == NONE || !linker.atoms[sym.atom as usize].alive {
                    return None;
                }
                if !sym.flags.local && (sym.file != fid || sym.nlist_idx != idx as u32) {
                    return None;
                }
                if object.nlists[idx].is_stab() || !object.nlists[idx].is_sect() {
                    return None;
                }
                Some(sid)
            })
            .collect()
    };
    for sid in owned {
        let sym = linker.symbols[sid as usize];
        let sect = output_section_ordinal(linker, sid);
        if atom_is_code(linker, sid) {
            let size = stab_function_size(linker, sid);
            push_nlist(nlists, Nlist64 { n_strx: 0, n_type: N_BNSYM, n_sect: sect, n_desc: 0, n_value: sym.value });
            push_nlist(nlists, Nlist64 { n_strx: sym.name, n_type: N_FUN, n_sect: sect, n_desc: 0, n_value: sym.value });
            push_nlist(nlists, Nlist64 { n_strx: 0, n_type: N_FUN, n_sect: 0, n_desc: 0, n_value: size });
            push_nlist(nlists, Nlist64 { n_strx: 0, n_type: N_ENSYM, n_sect: sect, n_desc: 0, n_value: size });
            count += 4;
        } else if sym.flags.local || sym.flags.pext {
            push_nlist(nlists, Nlist64 { n_strx: sym.name, n_type: N_STSYM, n_sect: sect, n_desc: 0, n_value: sym.value });
            count += 1;
        } else {
            push_nlist(nlists, Nlist64 { n_strx: sym.name, n_type: N_GSYM, n_sect: 0, n_desc: 0, n_value: 0 });
            count += 1;
        }
    }

    push_nlist(nlists, Nlist64 { n_strx: 0, n_type: N_SO, n_sect: 1, n_desc: 0, n_value: 0 });
    count += 1;
    count
}

/// A function's extent: up to the next function symbol in the same atom,
/// else the end of the atom.
fn stab_function_size(linker: &Linker, sid: SymbolId) -> u64 {
    let sym = &linker.symbols[sid as usize];
    let atom = &linker.atoms[sym.atom as usize];
    let atom_end = linker.atom_addr(sym.atom) + atom.size;
    let mut end = atom_end;
    for other in linker.symbols.iter().skip(1) {
        if other.atom == sym.atom && other.value > sym.value && other.value < end {
            end = other.value;
        }
    }
    end - sym.value
}

// ----------------------------------------------------------------------
// reference interpreters (used by the round-trip tests)
// ----------------------------------------------------------------------

/// Run the rebase opcodes, producing the `(segment, offset)` set.
pub fn interpret_rebase_stream(bytes: &[u8]) -> Result<Vec<(u32, u64)>> {
    let mut result = Vec::new();
    let mut segment = 0u32;
    let mut offset = 0u64;
    let mut i = 0usize;
    while i < bytes.len() {
        let byte = bytes[i];
        i += 1;
        let opcode = byte & REBASE_OPCODE_MASK;
        let imm = byte & REBASE_IMMEDIATE_MASK;
        match opcode {
            REBASE_OPCODE_DONE => break,
            REBASE_OPCODE_SET_TYPE_IMM => {}
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                segment = imm as u32;
                offset = read_uleb(bytes, &mut i)?;
            }
            REBASE_OPCODE_ADD_ADDR_ULEB => {
                offset = offset.wrapping_add(read_uleb(bytes, &mut i)?);
            }
            REBASE_OPCODE_ADD_ADDR_IMM_SCALED => {
                offset += imm as u64 * 8;
            }
            REBASE_OPCODE_DO_REBASE_IMM_TIMES => {
                for _ in 0..imm {
                    result.push((segment, offset));
                    offset += 8;
                }
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES => {
                let times = read_uleb(bytes, &mut i)?;
                for _ in 0..times {
                    result.push((segment, offset));
                    offset += 8;
                }
            }
            REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB => {
                result.push((segment, offset));
                offset += 8 + read_uleb(bytes, &mut i)?;
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB => {
                let times = read_uleb(bytes, &mut i)?;
                let skip = read_uleb(bytes, &mut i)?;
                for _ in 0..times {
                    result.push((segment, offset));
                    offset += 8 + skip;
                }
            }
            _ => return Err(Error::Malformed(format!("rebase opcode {byte:#x}"))),
        }
    }
    Ok(result)
}

/// One decoded bind: `(segment, offset, ordinal, name, addend)`.
pub type DecodedBind = (u32, u64, i64, String, i64);

/// Run the bind opcodes, producing every bound slot.
pub fn interpret_bind_stream(bytes: &[u8]) -> Result<Vec<DecodedBind>> {
    let mut result = Vec::new();
    let mut segment = 0u32;
    let mut offset = 0u64;
    let mut ordinal = 0i64;
    let mut addend = 0i64;
    let mut name = String::new();
    let mut i = 0usize;
    while i < bytes.len() {
        let byte = bytes[i];
        i += 1;
        let opcode = byte & BIND_OPCODE_MASK;
        let imm = byte & BIND_IMMEDIATE_MASK;
        match opcode {
            BIND_OPCODE_DONE => {
                // lazy-bind streams chain sub-programs with DONE between
                continue;
            }
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => ordinal = imm as i64,
            BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => ordinal = read_uleb(bytes, &mut i)? as i64,
            BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                ordinal = if imm == 0 { 0 } else { (imm | 0xf0) as i8 as i64 };
            }
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                let start = i;
                while i < bytes.len() && bytes[i] != 0 {
                    i += 1;
                }
                name = core::str::from_utf8(&bytes[start..i])
                    .map_err(|_| Error::Malformed("non-UTF8 bind symbol".into()))?
                    .to_string();
                i += 1;
            }
            BIND_OPCODE_SET_TYPE_IMM => {}
            BIND_OPCODE_SET_ADDEND_SLEB => addend = read_sleb(bytes, &mut i)?,
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                segment = imm as u32;
                offset = read_uleb(bytes, &mut i)?;
            }
            BIND_OPCODE_ADD_ADDR_ULEB => {
                offset = offset.wrapping_add(read_uleb(bytes, &mut i)?);
            }
            BIND_OPCODE_DO_BIND => {
                result.push((segment, offset, ordinal, name.clone(), addend));
                offset += 8;
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                result.push((segment, offset, ordinal, name.clone(), addend));
                offset = offset.wrapping_add(8 + read_uleb(bytes, &mut i)?);
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                result.push((segment, offset, ordinal, name.clone(), addend));
                offset += 8 + imm as u64 * 8;
            }
            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                let times = read_uleb(bytes, &mut i)?;
                let skip = read_uleb(bytes, &mut i)?;
                for _ in 0..times {
                    result.push((segment, offset, ordinal, name.clone(), addend));
                    offset += 8 + skip;
                }
            }
            _ => return Err(Error::Malformed(format!("bind opcode {byte:#x}"))),
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dylib::parse_export_trie;

    #[test]
    fn trie_two_pass_size_matches_emission() {
        let exports = vec![
            ("__ZN3foo3barEv".to_string(), 0u64, 0x1000u64),
            ("__ZN3foo3bazEv".to_string(), 0, 0x1040),
            ("_main".to_string(), 0, 0x2000),
        ];
        let bytes = build_export_trie(&exports);
        let decoded = parse_export_trie(&bytes).unwrap();
        let mut recovered: Vec<(String, u64, u64)> =
            decoded.into_iter().map(|e| (e.name, e.flags, e.offset)).collect();
        recovered.sort();
        assert_eq!(recovered, exports);
    }

    #[test]
    fn trie_single_symbol() {
        let exports = vec![("_x".to_string(), 0u64, 8u64)];
        let bytes = build_export_trie(&exports);
        let decoded = parse_export_trie(&bytes).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].name, "_x");
        assert_eq!(decoded[0].offset, 8);
    }

    #[test]
    fn rebase_interpreter_handles_runs_and_skips() {
        let mut stream = Vec::new();
        stream.push(REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER);
        stream.push(REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 2);
        write_uleb(&mut stream, 0x10);
        stream.push(REBASE_OPCODE_DO_REBASE_ULEB_TIMES);
        write_uleb(&mut stream, 3);
        stream.push(REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB);
        write_uleb(&mut stream, 2);
        write_uleb(&mut stream, 8);
        stream.push(REBASE_OPCODE_DONE);
        let rebases = interpret_rebase_stream(&stream).unwrap();
        assert_eq!(
            rebases,
            vec![(2, 0x10), (2, 0x18), (2, 0x20), (2, 0x28), (2, 0x38)]
        );
    }

    /// A tiny multiplicative generator keeps the "arbitrary" pointer sets
    /// reproducible.
    fn lcg(state: &mut u64) -> u64 {
        *state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        *state >> 33
    }

    #[test]
    fn rebase_stream_round_trips_arbitrary_pointer_sets() {
        use crate::options::{Options, OutputMode, Target};
        let mut state = 0x5eed_u64;
        for _ in 0..8 {
            let mut linker = crate::linker::Linker::new(Options::new(
                Target::macos_x86_64(),
                OutputMode::Exe,
                "out".into(),
            ));
            let mut expected: Vec<(u32, u64)> = (0..64)
                .map(|_| {
                    let seg = (lcg(&mut state) % 3) as u32 + 1;
                    let offset = (lcg(&mut state) % 0x4000) * 8;
                    (seg, offset)
                })
                .collect();
            linker.rebase_entries = expected.clone();
            let mut stream = Vec::new();
            write_rebase_stream(&mut linker, &mut stream);
            expected.sort_unstable();
            expected.dedup();
            let mut recovered = interpret_rebase_stream(&stream).unwrap();
            recovered.sort_unstable();
            assert_eq!(recovered, expected);
        }
    }

    #[test]
    fn bind_stream_round_trips_arbitrary_pointer_sets() {
        use crate::linker::{BindEntry, Linker, Symbol};
        use crate::options::{Options, OutputMode, Target};
        let mut state = 0xfeed_u64;
        let mut linker =
            Linker::new(Options::new(Target::macos_x86_64(), OutputMode::Exe, "out".into()));
        let names = ["_malloc", "_free", "_puts", "_objc_msgSend"];
        let mut sids = Vec::new();
        for (i, name) in names.iter().enumerate() {
            let strx = linker.intern(name);
            let sid = linker.add_symbol(Symbol::new(strx));
            linker.symbols[sid as usize].flags.import = true;
            linker.ordinals.insert(sid, if i == 3 { -2 } else { i as i16 + 1 });
            sids.push(sid);
        }
        let mut expected = Vec::new();
        for _ in 0..48 {
            let sid = sids[(lcg(&mut state) % 4) as usize];
            let entry = BindEntry {
                segment: (lcg(&mut state) % 2) as u32 + 2,
                offset: (lcg(&mut state) % 0x1000) * 8,
                target: sid,
                addend: if lcg(&mut state) % 4 == 0 { 16 } else { 0 },
                lazy: false,
            };
            expected.push(entry);
        }
        linker.bind_entries = expected.clone();
        let mut stream = Vec::new();
        write_bind_stream(&mut linker, &mut stream);
        let mut want: Vec<DecodedBind> = expected
            .iter()
            .map(|e| {
                (
                    e.segment,
                    e.offset,
                    linker.ordinals[&e.target] as i64,
                    linker.sym_name(e.target).to_string(),
                    e.addend,
                )
            })
            .collect();
        want.sort();
        want.dedup();
        let mut recovered = interpret_bind_stream(&stream).unwrap();
        recovered.sort();
        recovered.dedup();
        assert_eq!(recovered, want);
    }

    #[test]
    fn bind_interpreter_decodes_special_ordinals() {
        let mut stream = Vec::new();
        stream.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1);
        write_uleb(&mut stream, 0x20);
        stream.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM);
        stream.extend_from_slice(b"_missing\0");
        stream.push(BIND_OPCODE_SET_TYPE_IMM | BIND_TYPE_POINTER);
        stream.push(BIND_OPCODE_SET_DYLIB_SPECIAL_IMM | (BIND_SPECIAL_DYLIB_FLAT_LOOKUP as u8 & 0x0f));
        stream.push(BIND_OPCODE_DO_BIND);
        stream.push(BIND_OPCODE_DONE);
        let binds = interpret_bind_stream(&stream).unwrap();
        assert_eq!(binds, vec![(1, 0x20, -2, "_missing".to_string(), 0)]);
    }
}
