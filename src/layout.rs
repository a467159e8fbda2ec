//! The section and segment allocator: prunes empty sections, orders the
//! rest by the conventional precedence, builds page-aligned segments,
//! inserts aarch64 range-extension thunks, and assigns every symbol its
//! final value.

use log::debug;

use crate::atom::{AtomId, NONE};
use crate::error::Result;
use crate::linker::{FileData, Linker};
use crate::mach::constants::*;
use crate::mach::load_command::{fixed_from_str, Section64, SegmentCommand64, LC_SEGMENT_64};
use crate::object::{is_zerofill, RelocTarget};
use crate::options::{CpuArch, OutputMode};
use crate::synthetic::{self, ThunkGroup};
use crate::writer;

/// An output section plus its atom chain cursors.
#[derive(Debug, Clone)]
pub struct OutputSection {
    pub header: Section64,
    /// index into `linker.segments`, assigned when segments are built
    pub segment: u32,
    pub first_atom: AtomId,
    pub last_atom: AtomId,
}

impl OutputSection {
    pub fn placeholder() -> OutputSection {
        OutputSection {
            header: Section64::default(),
            segment: 0,
            first_atom: NONE,
            last_atom: NONE,
        }
    }

    pub fn seg_name(&self) -> &str {
        self.header.seg_name()
    }

    pub fn sect_name(&self) -> &str {
        self.header.sect_name()
    }

    pub fn is_zerofill(&self) -> bool {
        is_zerofill(self.header.flags)
    }
}

#[derive(Debug, Clone)]
pub struct OutputSegment {
    pub header: SegmentCommand64,
    /// output-section ids owned by this segment, in final order
    pub sections: Vec<u32>,
}

impl OutputSegment {
    pub fn name(&self) -> &str {
        self.header.name()
    }

    pub fn is_writable(&self) -> bool {
        self.header.initprot & VM_PROT_WRITE != 0
    }
}

/// Find or create the output section for `(segname, sectname)`.
pub fn get_or_create_section(linker: &mut Linker, segname: &str, sectname: &str, flags: u32) -> u32 {
    let key = (segname.to_string(), sectname.to_string());
    if let Some(&id) = linker.section_lookup.get(&key) {
        return id;
    }
    let id = linker.out_sections.len() as u32;
    let mut header = Section64::default();
    header.segname = fixed_from_str(segname);
    header.sectname = fixed_from_str(sectname);
    header.flags = flags;
    linker.out_sections.push(OutputSection {
        header,
        segment: 0,
        first_atom: NONE,
        last_atom: NONE,
    });
    linker.section_lookup.insert(key, id);
    id
}

/// Append `aid` to the section's atom chain.
pub fn append_atom(linker: &mut Linker, sect_id: u32, aid: AtomId) {
    let last = linker.out_sections[sect_id as usize].last_atom;
    {
        let atom = &mut linker.atoms[aid as usize];
        atom.out_sect = sect_id;
        atom.prev = last;
        atom.next = NONE;
    }
    if last != NONE {
        linker.atoms[last as usize].next = aid;
    } else {
        linker.out_sections[sect_id as usize].first_atom = aid;
    }
    linker.out_sections[sect_id as usize].last_atom = aid;
}

/// Insert `aid` into the chain right after `after`.
fn insert_atom_after(linker: &mut Linker, sect_id: u32, after: AtomId, aid: AtomId) {
    let next = linker.atoms[after as usize].next;
    {
        let atom = &mut linker.atoms[aid as usize];
        atom.out_sect = sect_id;
        atom.prev = after;
        atom.next = next;
    }
    linker.atoms[after as usize].next = aid;
    if next != NONE {
        linker.atoms[next as usize].prev = aid;
    } else {
        linker.out_sections[sect_id as usize].last_atom = aid;
    }
}

/// The live atoms of a section in chain order.
pub fn section_atoms(linker: &Linker, sect_id: u32) -> Vec<AtomId> {
    let mut atoms = Vec::new();
    let mut cursor = linker.out_sections[sect_id as usize].first_atom;
    while cursor != NONE {
        if linker.atoms[cursor as usize].alive {
            atoms.push(cursor);
        }
        cursor = linker.atoms[cursor as usize].next;
    }
    atoms
}

fn align_to(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Segment precedence occupies the high nibble of the composite sort key.
fn segment_rank(name: &str) -> u8 {
    match name {
        SEG_PAGEZERO => 0x0,
        SEG_TEXT => 0x1,
        SEG_DATA_CONST => 0x2,
        SEG_DATA => 0x3,
        SEG_LINKEDIT => 0xf,
        _ => 0x4,
    }
}

/// Section precedence within a segment: text first, then stubs, then other
/// code; non-lazy pointers before lazy pointers before mod_init/term, and
/// zerofill at the very end so it never occupies file space mid-segment.
fn section_rank(sect: &Section64) -> u8 {
    let name = sect.sect_name();
    if sect.seg_name() == SEG_TEXT {
        match name {
            SECT_TEXT => return 0x0,
            SECT_STUBS => return 0x1,
            SECT_STUB_HELPER => return 0x2,
            _ => {
                if sect.flags & (S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS) != 0 {
                    return 0x3;
                }
            }
        }
    }
    match sect.flags & SECTION_TYPE {
        S_NON_LAZY_SYMBOL_POINTERS => 0x4,
        S_LAZY_SYMBOL_POINTERS => 0x5,
        S_MOD_INIT_FUNC_POINTERS => 0x6,
        S_MOD_TERM_FUNC_POINTERS => 0x7,
        S_THREAD_LOCAL_VARIABLES => 0x9,
        S_THREAD_LOCAL_REGULAR => 0xa,
        S_THREAD_LOCAL_VARIABLE_POINTERS => 0x8,
        S_THREAD_LOCAL_ZEROFILL => 0xd,
        S_ZEROFILL | S_GB_ZEROFILL => {
            if name == SECT_COMMON { 0xf } else { 0xe }
        }
        _ => 0xb,
    }
}

fn composite_rank(sect: &Section64) -> u8 {
    (segment_rank(sect.seg_name()) << 4) | section_rank(sect)
}

/// Route every parsed input-section atom into its output section. Synthetic
/// atoms were appended at creation; input atoms wait until here so dead
/// ones never register.
fn register_input_atoms(linker: &mut Linker) {
    let object_files: Vec<u32> = linker
        .files
        .iter()
        .filter(|f| matches!(f.data, FileData::Object(_)))
        .map(|f| f.index)
        .collect();
    for fid in object_files {
        let pairs: Vec<(AtomId, String, String, u32)> = {
            let object = linker.object(fid);
            object
                .section_atoms
                .iter()
                .enumerate()
                .filter(|&(_, &aid)| aid != NONE)
                .map(|(i, &aid)| {
                    let sect = &object.sections[i];
                    (
                        aid,
                        sect.seg_name().to_string(),
                        output_section_name(sect).to_string(),
                        output_section_flags(sect),
                    )
                })
                .collect()
        };
        for (aid, seg, name, flags) in pairs {
            if !linker.atoms[aid as usize].alive {
                continue;
            }
            let sect_id = get_or_create_section(linker, &seg, &name, flags);
            append_atom(linker, sect_id, aid);
        }
    }
}

/// Input sections fold into conventional output names: compiler-emitted
/// literal sections merge into `__text`/`__data` peers by keeping their own
/// names, but `__bss` stays `__bss` and so on. Identity mapping except for
/// the literal coalescing the output format expects.
fn output_section_name(sect: &Section64) -> &str {
    match sect.flags & SECTION_TYPE {
        S_CSTRING_LITERALS => "__cstring",
        S_4BYTE_LITERALS | S_8BYTE_LITERALS | S_16BYTE_LITERALS => "__const",
        _ => sect.sect_name(),
    }
}

fn output_section_flags(sect: &Section64) -> u32 {
    // strip the per-object relocation attributes; they are meaningless in
    // a linked image
    sect.flags & !(S_ATTR_EXT_RELOC | S_ATTR_LOC_RELOC)
}

/// Walk a section chain assigning atom offsets, returning the section size.
fn assign_offsets(linker: &mut Linker, sect_id: u32) -> u64 {
    let atoms = section_atoms(linker, sect_id);
    let mut offset = 0u64;
    let mut max_align = linker.out_sections[sect_id as usize].header.align;
    for aid in atoms {
        let atom = &mut linker.atoms[aid as usize];
        offset = align_to(offset, atom.alignment());
        atom.off = offset;
        offset += atom.size;
        max_align = max_align.max(atom.align);
    }
    linker.out_sections[sect_id as usize].header.align = max_align;
    offset
}

/// Branches cannot span more than +-128 MiB; keep a comfortable margin so
/// thunk insertion itself cannot push an estimated-near branch out of
/// range.
const THUNK_RUN_LIMIT: u64 = 100 * 1024 * 1024;
const THUNK_FAR: u64 = (1 << 27) - 8 * 1024 * 1024;

/// Split an oversized aarch64 code section into runs of at most 100 MiB
/// and plant a trampoline after each run for every far target its atoms
/// branch to. The relocation engine finds them through the atom's thunk
/// group.
fn insert_thunks(linker: &mut Linker, sect_id: u32) {
    let atoms = section_atoms(linker, sect_id);
    if atoms.is_empty() {
        return;
    }
    // naive offsets, as if no thunks existed
    let mut naive = std::collections::HashMap::new();
    let mut offset = 0u64;
    for &aid in &atoms {
        let atom = &linker.atoms[aid as usize];
        offset = align_to(offset, atom.alignment());
        naive.insert(aid, offset);
        offset += atom.size;
    }
    let total = offset;
    if total <= THUNK_FAR {
        return;
    }
    debug!(
        "section {} is {total:#x} bytes, inserting branch thunks",
        linker.out_sections[sect_id as usize].sect_name()
    );

    let mut run_start_off = 0u64;
    let mut run: Vec<AtomId> = Vec::new();
    let mut runs: Vec<Vec<AtomId>> = Vec::new();
    for &aid in &atoms {
        let off = naive[&aid];
        if off - run_start_off > THUNK_RUN_LIMIT && !run.is_empty() {
            runs.push(std::mem::take(&mut run));
            run_start_off = off;
        }
        run.push(aid);
    }
    if !run.is_empty() {
        runs.push(run);
    }

    for run in runs {
        let group_index = linker.thunks.len() as u32;
        let mut group = ThunkGroup { section: sect_id, targets: Default::default() };
        let last_in_run = *run.last().unwrap();
        for &aid in &run {
            linker.atoms[aid as usize].thunk = group_index + 1;
            let atom = linker.atoms[aid as usize];
            if atom.file == NONE || atom.relocs.is_empty() {
                continue;
            }
            let src_off = naive[&aid];
            let far_targets: Vec<u32> = {
                let object = linker.object(atom.file);
                object.relocs[atom.relocs.range()]
                    .iter()
                    .filter(|r| r.r_type == crate::mach::relocation::ARM64_RELOC_BRANCH26)
                    .filter_map(|r| match r.target {
                        RelocTarget::Symbol(idx) => {
                            let sid = object.symbols[idx as usize];
                            if sid == NONE {
                                return None;
                            }
                            let sym = &linker.symbols[sid as usize];
                            let target_off = if sym.atom != NONE
                                && linker.atoms[sym.atom as usize].out_sect == sect_id
                            {
                                naive.get(&sym.atom).copied().unwrap_or(total)
                            } else {
                                // another section (or a stub to come):
                                // assume the far end of this one
                                total
                            };
                            let distance = target_off.abs_diff(src_off);
                            if distance > THUNK_FAR { Some(sid) } else { None }
                        }
                        RelocTarget::Section(_) => None,
                    })
                    .collect()
            };
            for sid in far_targets {
                if group.targets.contains_key(&sid) {
                    continue;
                }
                let thunk = synthetic::create_thunk_atom(linker, sid);
                insert_atom_after(linker, sect_id, last_in_run, thunk);
                group.targets.insert(sid, thunk);
            }
        }
        linker.thunks.push(group);
    }
}

/// The allocator entry point: build and order sections, attach them to
/// segments, and hand out final addresses and symbol values.
pub fn allocate(linker: &mut Linker) -> Result<()> {
    register_input_atoms(linker);

    // size every section; oversized aarch64 code gets thunks first
    let section_count = linker.out_sections.len();
    for sect_id in 1..section_count as u32 {
        let sect = &linker.out_sections[sect_id as usize];
        let is_code = sect.seg_name() == SEG_TEXT
            && sect.header.flags & (S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS) != 0;
        if is_code && linker.options.target.cpu_arch == CpuArch::Aarch64 {
            insert_thunks(linker, sect_id);
        }
        let size = assign_offsets(linker, sect_id);
        linker.out_sections[sect_id as usize].header.size = size;
    }

    prune_and_sort_sections(linker);
    build_segments(linker);

    // min header pad: everything in front of the first section's bytes
    let commands_size = writer::load_commands_size(linker);
    let mut header_pad = (crate::mach::header::SIZEOF_HEADER_64 + commands_size) as u64;
    header_pad = align_to(header_pad + linker.options.headerpad as u64, 8);
    if linker.options.headerpad_max_install_names {
        let dylib_slack: u64 = linker
            .files
            .iter()
            .filter_map(|f| match &f.data {
                FileData::Dylib(d) if d.ordinal.is_some() => {
                    Some(1024u64.saturating_sub(d.install_name.len() as u64))
                }
                _ => None,
            })
            .sum();
        header_pad = align_to(header_pad + dylib_slack, 8);
    }

    assign_addresses(linker, header_pad);
    assign_symbol_values(linker);
    place_boundary_symbols(linker);
    Ok(())
}

fn prune_and_sort_sections(linker: &mut Linker) {
    // collect surviving sections with their old ids
    let mut order: Vec<u32> = (1..linker.out_sections.len() as u32)
        .filter(|&id| linker.out_sections[id as usize].header.size > 0)
        .collect();
    order.sort_by_key(|&id| {
        (composite_rank(&linker.out_sections[id as usize].header), id)
    });

    let mut remap = vec![0u32; linker.out_sections.len()];
    let mut new_sections = vec![OutputSection::placeholder()];
    for &old in &order {
        remap[old as usize] = new_sections.len() as u32;
        new_sections.push(linker.out_sections[old as usize].clone());
    }
    linker.out_sections = new_sections;

    for atom in linker.atoms.iter_mut().skip(1) {
        atom.out_sect = remap[atom.out_sect as usize];
    }
    let lookup = std::mem::take(&mut linker.section_lookup);
    linker.section_lookup = lookup
        .into_iter()
        .filter_map(|(key, id)| {
            let new = remap[id as usize];
            if new == 0 { None } else { Some((key, new)) }
        })
        .collect();
    for group in &mut linker.thunks {
        group.section = remap[group.section as usize];
    }
}

fn protections(segname: &str) -> (u32, u32) {
    match segname {
        SEG_PAGEZERO => (VM_PROT_NONE, VM_PROT_NONE),
        SEG_TEXT => (VM_PROT_READ | VM_PROT_EXECUTE, VM_PROT_READ | VM_PROT_EXECUTE),
        SEG_LINKEDIT => (VM_PROT_READ, VM_PROT_READ),
        _ => (VM_PROT_READ | VM_PROT_WRITE, VM_PROT_READ | VM_PROT_WRITE),
    }
}

fn new_segment(name: &str) -> OutputSegment {
    let (maxprot, initprot) = protections(name);
    let mut header = SegmentCommand64::default();
    header.cmd = LC_SEGMENT_64;
    header.segname = fixed_from_str(name);
    header.maxprot = maxprot;
    header.initprot = initprot;
    OutputSegment { header, sections: Vec::new() }
}

fn build_segments(linker: &mut Linker) {
    let mut segments: Vec<OutputSegment> = Vec::new();
    if linker.options.output_mode == OutputMode::Exe {
        segments.push(new_segment(SEG_PAGEZERO));
    }
    // __TEXT always exists: it carries the header even in a data-only image
    segments.push(new_segment(SEG_TEXT));

    for sect_id in 1..linker.out_sections.len() as u32 {
        let segname = linker.out_sections[sect_id as usize].seg_name().to_string();
        let seg_index = match segments.iter().position(|s| s.name() == segname) {
            Some(i) => i,
            None => {
                segments.push(new_segment(&segname));
                segments.len() - 1
            }
        };
        segments[seg_index].sections.push(sect_id);
        segments[seg_index].header.nsects += 1;
        linker.out_sections[sect_id as usize].segment = seg_index as u32;
    }

    segments.push(new_segment(SEG_LINKEDIT));
    linker.segments = segments;
}

fn assign_addresses(linker: &mut Linker, header_pad: u64) {
    let page = linker.options.target.page_size();
    let pagezero_size = match linker.options.output_mode {
        OutputMode::Exe => linker.options.pagezero_size.unwrap_or(0x1_0000_0000),
        OutputMode::Lib => 0,
    };

    let mut vmaddr = 0u64;
    let mut fileoff = 0u64;
    for seg_index in 0..linker.segments.len() {
        let name = linker.segments[seg_index].name().to_string();
        if name == SEG_PAGEZERO {
            let header = &mut linker.segments[seg_index].header;
            header.vmaddr = 0;
            header.vmsize = pagezero_size;
            header.fileoff = 0;
            header.filesize = 0;
            vmaddr = pagezero_size;
            continue;
        }

        let sections = linker.segments[seg_index].sections.clone();
        let mut offset = if name == SEG_TEXT { header_pad } else { 0 };
        let mut file_end = 0u64;
        for &sect_id in &sections {
            let align = 1u64 << linker.out_sections[sect_id as usize].header.align;
            offset = align_to(offset, align);
            let zerofill = linker.out_sections[sect_id as usize].is_zerofill();
            {
                let header = &mut linker.out_sections[sect_id as usize].header;
                header.addr = vmaddr + offset;
                header.offset = if zerofill { 0 } else { (fileoff + offset) as u32 };
            }
            offset += linker.out_sections[sect_id as usize].header.size;
            if !zerofill {
                file_end = offset;
            }
        }

        let vmsize = align_to(offset.max(if name == SEG_TEXT { header_pad } else { 0 }), page);
        let filesize = align_to(file_end, page).min(vmsize);
        let header = &mut linker.segments[seg_index].header;
        header.vmaddr = vmaddr;
        header.vmsize = vmsize;
        header.fileoff = fileoff;
        header.filesize = if name == SEG_TEXT { filesize.max(page) } else { filesize };
        if name == SEG_LINKEDIT {
            // sized later, once the LINKEDIT payload exists
            header.vmsize = 0;
            header.filesize = 0;
        }
        vmaddr += header.vmsize;
        fileoff += header.filesize;
    }
}

/// Every atom's owning symbol takes `section.addr + atom.off`; every
/// defined nlist symbol takes its section-relative translation.
fn assign_symbol_values(linker: &mut Linker) {
    for aid in 1..linker.atoms.len() as AtomId {
        let atom = linker.atoms[aid as usize];
        if atom.out_sect == NONE {
            continue;
        }
        let addr = linker.atom_addr(aid);
        if atom.sym != NONE {
            linker.symbols[atom.sym as usize].value = addr;
        }
    }

    let object_files: Vec<u32> = linker
        .files
        .iter()
        .filter(|f| matches!(f.data, FileData::Object(_)))
        .map(|f| f.index)
        .collect();
    for fid in object_files {
        let updates: Vec<(u32, u64)> = {
            let object = linker.object(fid);
            object
                .nlists
                .iter()
                .enumerate()
                .filter(|(_, n)| n.is_sect() && !n.is_stab())
                .filter_map(|(idx, nlist)| {
                    let sid = object.symbols[idx];
                    if sid == NONE {
                        return None;
                    }
                    // only while this occurrence owns the global
                    let sym = &linker.symbols[sid as usize];
                    if !sym.flags.local && (sym.file != fid || sym.nlist_idx != idx as u32) {
                        return None;
                    }
                    let aid = object.section_atoms.get(nlist.n_sect as usize - 1).copied()?;
                    if aid == NONE || !linker.atoms[aid as usize].alive {
                        return None;
                    }
                    let in_sect = &object.sections[nlist.n_sect as usize - 1];
                    let value = linker.atom_addr(aid) + (nlist.n_value - in_sect.addr);
                    Some((sid, value))
                })
                .collect()
        };
        for (sid, value) in updates {
            linker.symbols[sid as usize].value = value;
        }
    }

    // the header markers live at the start of __TEXT
    let text_vmaddr = linker
        .segments
        .iter()
        .find(|s| s.name() == SEG_TEXT)
        .map(|s| s.header.vmaddr)
        .unwrap_or(0);
    if linker.mh_header_sym != NONE {
        linker.symbols[linker.mh_header_sym as usize].value = text_vmaddr;
    }
    if linker.dso_handle_sym != NONE {
        linker.symbols[linker.dso_handle_sym as usize].value = text_vmaddr;
    }
}

fn place_boundary_symbols(linker: &mut Linker) {
    let boundaries: Vec<(u32, crate::linker::Boundary)> = linker
        .boundaries
        .iter()
        .map(|(&sid, b)| (sid, b.clone()))
        .collect();
    for (sid, boundary) in boundaries {
        let value = match &boundary.section {
            Some(section) => linker
                .out_sections
                .iter()
                .skip(1)
                .find(|s| s.seg_name() == boundary.segment && s.sect_name() == *section)
                .map(|s| {
                    if boundary.start { s.header.addr } else { s.header.addr + s.header.size }
                }),
            None => linker
                .segments
                .iter()
                .find(|s| s.name() == boundary.segment)
                .map(|s| {
                    if boundary.start {
                        s.header.vmaddr
                    } else {
                        s.header.vmaddr + s.header.vmsize
                    }
                }),
        };
        // an unmatched boundary name pins to zero rather than failing the
        // link; nothing was going to be there anyway
        linker.symbols[sid as usize].value = value.unwrap_or(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sect(seg: &str, name: &str, flags: u32) -> Section64 {
        let mut s = Section64::default();
        s.segname = fixed_from_str(seg);
        s.sectname = fixed_from_str(name);
        s.flags = flags;
        s
    }

    #[test]
    fn precedence_orders_conventionally() {
        let text = sect(SEG_TEXT, SECT_TEXT, S_ATTR_PURE_INSTRUCTIONS);
        let stubs = sect(SEG_TEXT, SECT_STUBS, S_SYMBOL_STUBS | S_ATTR_PURE_INSTRUCTIONS);
        let got = sect(SEG_DATA_CONST, SECT_GOT, S_NON_LAZY_SYMBOL_POINTERS);
        let la = sect(SEG_DATA, SECT_LA_SYMBOL_PTR, S_LAZY_SYMBOL_POINTERS);
        let data = sect(SEG_DATA, SECT_DATA, S_REGULAR);
        let common = sect(SEG_DATA, SECT_COMMON, S_ZEROFILL);
        let mut ranks = [&text, &stubs, &got, &la, &data, &common]
            .map(composite_rank);
        let sorted = {
            let mut s = ranks;
            s.sort();
            s
        };
        assert_eq!(ranks, sorted, "conventional order is already sorted");
        ranks.reverse();
        assert_ne!(ranks, sorted);
        // lazy pointers after non-lazy, common at the very end of __DATA
        assert!(composite_rank(&got) < composite_rank(&la));
        assert!(composite_rank(&data) < composite_rank(&common));
    }

    #[test]
    fn alignment_rounding() {
        assert_eq!(align_to(0, 8), 0);
        assert_eq!(align_to(1, 8), 8);
        assert_eq!(align_to(0x3fff, 0x4000), 0x4000);
        assert_eq!(align_to(0x4000, 0x4000), 0x4000);
    }
}
