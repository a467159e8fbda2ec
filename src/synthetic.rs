//! Linker-synthesized atoms: GOT slots, lazy pointers, stubs and their
//! helpers, TLV pointers, merged tentative definitions, boundary markers
//! and aarch64 range-extension thunks.

use std::collections::{BTreeMap, HashMap};

use log::debug;

use crate::arch::{aarch64, x86_64};
use crate::atom::{Atom, AtomId, SymbolId, NONE};
use crate::layout;
use crate::linker::{Linker, Symbol};
use crate::mach::constants::*;
use crate::options::CpuArch;

/// One slot of a synthetic pointer section: the imported (or local) symbol
/// it resolves, and the atom that carries its bytes.
#[derive(Debug, Clone, Copy)]
pub struct IndirectEntry {
    pub target: SymbolId,
    pub atom: AtomId,
}

/// `(target symbol, synthetic atom)` pairs with a reverse index, one table
/// each for the GOT, the stubs and the TLV pointers.
#[derive(Debug, Default)]
pub struct IndirectTable {
    pub entries: Vec<IndirectEntry>,
    lookup: HashMap<SymbolId, u32>,
}

impl IndirectTable {
    pub fn index_of(&self, target: SymbolId) -> Option<u32> {
        self.lookup.get(&target).copied()
    }

    pub fn insert(&mut self, target: SymbolId, atom: AtomId) -> u32 {
        debug_assert!(!self.lookup.contains_key(&target));
        let index = self.entries.len() as u32;
        self.entries.push(IndirectEntry { target, atom });
        self.lookup.insert(target, index);
        index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The thunks serving one run of a code section: far target -> trampoline.
#[derive(Debug)]
pub struct ThunkGroup {
    pub section: u32,
    pub targets: BTreeMap<SymbolId, AtomId>,
}

fn new_synthetic_atom(linker: &mut Linker, name: &str, size: u64, align: u32) -> AtomId {
    let name = linker.intern(name);
    let mut atom = Atom::new(name, NONE, 0);
    atom.size = size;
    atom.align = align;
    let sym = linker.add_symbol({
        let mut s = Symbol::new(name);
        s.flags.local = true;
        s
    });
    atom.sym = sym;
    let aid = linker.add_atom(atom);
    linker.symbols[sym as usize].atom = aid;
    aid
}

/// Merged `__DATA,__common` zerofill atoms for every tentative global that
/// survived resolution, sized and aligned by the winning occurrences.
pub fn create_tentative_atoms(linker: &mut Linker) {
    let tentatives: Vec<SymbolId> = (1..linker.symbols.len() as SymbolId)
        .filter(|&sid| {
            let sym = &linker.symbols[sid as usize];
            sym.flags.tentative && !sym.flags.import && sym.atom == NONE
        })
        .collect();
    if tentatives.is_empty() {
        return;
    }
    let sect = layout::get_or_create_section(linker, SEG_DATA, SECT_COMMON, S_ZEROFILL);
    for sid in tentatives {
        let size = linker.symbols[sid as usize].value;
        let align = match linker.common_aligns.get(&sid).copied().unwrap_or(0) {
            0 => (size.max(1).trailing_zeros()).min(4),
            a => a,
        };
        let name = linker.symbols[sid as usize].name;
        let mut atom = Atom::new(name, linker.symbols[sid as usize].file, 0);
        atom.size = size;
        atom.align = align;
        atom.sym = sid;
        let aid = linker.add_atom(atom);
        layout::append_atom(linker, sect, aid);
        let sym = &mut linker.symbols[sid as usize];
        sym.atom = aid;
        sym.value = 0;
        debug!(
            "tentative {} -> __common atom {aid} (size {size:#x}, align {align})",
            linker.strings.get(name)
        );
    }
}

/// Zero-size marker atoms for `segment$start$`-style symbols; layout pins
/// their values to the requested edges.
pub fn create_boundary_atoms(linker: &mut Linker) {
    let boundary_syms: Vec<SymbolId> = linker.boundaries.keys().copied().collect();
    for sid in boundary_syms {
        let name = linker.symbols[sid as usize].name;
        let mut atom = Atom::new(name, NONE, 0);
        atom.sym = sid;
        let aid = linker.add_atom(atom);
        linker.symbols[sid as usize].atom = aid;
    }
}

/// The non-lazy pointer slot for `target`, created on first demand.
pub fn got_entry(linker: &mut Linker, target: SymbolId) -> u32 {
    if let Some(index) = linker.got.index_of(target) {
        return index;
    }
    let sect = layout::get_or_create_section(
        linker,
        SEG_DATA_CONST,
        SECT_GOT,
        S_NON_LAZY_SYMBOL_POINTERS,
    );
    let name = format!("__got${}", linker.sym_name(target));
    let aid = new_synthetic_atom(linker, &name, 8, 3);
    layout::append_atom(linker, sect, aid);
    linker.got.insert(target, aid)
}

/// The TLV pointer slot for `target`.
pub fn tlv_entry(linker: &mut Linker, target: SymbolId) -> u32 {
    if let Some(index) = linker.tlv.index_of(target) {
        return index;
    }
    let sect = layout::get_or_create_section(
        linker,
        SEG_DATA,
        SECT_THREAD_PTRS,
        S_THREAD_LOCAL_VARIABLE_POINTERS,
    );
    let name = format!("__tlv${}", linker.sym_name(target));
    let aid = new_synthetic_atom(linker, &name, 8, 3);
    layout::append_atom(linker, sect, aid);
    linker.tlv.insert(target, aid)
}

/// The stub for `target`, plus its lazy pointer and stub-helper entry.
/// First use also materializes the shared preamble, `dyld_private`, and
/// the binder's GOT slot.
pub fn stub_entry(linker: &mut Linker, target: SymbolId) -> u32 {
    if let Some(index) = linker.stubs.index_of(target) {
        return index;
    }
    ensure_stub_preamble(linker);

    let (stub_size, stub_align, helper_size) = match linker.options.target.cpu_arch {
        CpuArch::X86_64 => (x86_64::STUB_SIZE, 1, x86_64::STUB_HELPER_ENTRY_SIZE),
        CpuArch::Aarch64 => (aarch64::STUB_SIZE, 2, aarch64::STUB_HELPER_ENTRY_SIZE),
    };

    let stubs_sect = layout::get_or_create_section(
        linker,
        SEG_TEXT,
        SECT_STUBS,
        S_SYMBOL_STUBS | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
    );
    linker.out_sections[stubs_sect as usize].header.reserved2 = stub_size as u32;

    let target_name = linker.sym_name(target).to_string();
    let stub = new_synthetic_atom(linker, &format!("__stub${target_name}"), stub_size, stub_align);
    layout::append_atom(linker, stubs_sect, stub);

    let la_sect = layout::get_or_create_section(
        linker,
        SEG_DATA,
        SECT_LA_SYMBOL_PTR,
        S_LAZY_SYMBOL_POINTERS,
    );
    let lazy = new_synthetic_atom(linker, &format!("__la_ptr${target_name}"), 8, 3);
    layout::append_atom(linker, la_sect, lazy);

    let helper_sect = stub_helper_section(linker);
    let helper =
        new_synthetic_atom(linker, &format!("__stub_helper${target_name}"), helper_size, 2);
    layout::append_atom(linker, helper_sect, helper);

    linker.lazy_ptrs.push(lazy);
    linker.stub_helpers.push(helper);
    linker.stubs.insert(target, stub)
}

fn stub_helper_section(linker: &mut Linker) -> u32 {
    layout::get_or_create_section(
        linker,
        SEG_TEXT,
        SECT_STUB_HELPER,
        S_REGULAR | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
    )
}

/// The shared pieces every stub rides on: the helper preamble, the
/// `dyld_private` placeholder, and `dyld_stub_binder`'s GOT slot.
fn ensure_stub_preamble(linker: &mut Linker) {
    if linker.stub_helper_preamble_atom != NONE {
        return;
    }
    let preamble_size = match linker.options.target.cpu_arch {
        CpuArch::X86_64 => x86_64::STUB_HELPER_PREAMBLE_SIZE,
        CpuArch::Aarch64 => aarch64::STUB_HELPER_PREAMBLE_SIZE,
    };
    let helper_sect = stub_helper_section(linker);
    let preamble = new_synthetic_atom(linker, "__stub_helper$preamble", preamble_size, 2);
    layout::append_atom(linker, helper_sect, preamble);
    linker.stub_helper_preamble_atom = preamble;

    let data_sect = layout::get_or_create_section(linker, SEG_DATA, SECT_DATA, S_REGULAR);
    let private = new_synthetic_atom(linker, "__dyld_private", 8, 3);
    layout::append_atom(linker, data_sect, private);
    linker.dyld_private_atom = private;

    let binder = linker.stub_binder_sym;
    debug_assert!(binder != NONE, "stub machinery without dyld_stub_binder");
    got_entry(linker, binder);
}

/// A 12-byte `adrp/add/br` trampoline for one far target; the caller wires
/// it into the section chain.
pub fn create_thunk_atom(linker: &mut Linker, target: SymbolId) -> AtomId {
    let name = format!("__thunk${}", linker.sym_name(target));
    new_synthetic_atom(linker, &name, aarch64::THUNK_SIZE, 2)
}
