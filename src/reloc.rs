//! The relocation engine. Two passes: a scan before layout that creates
//! GOT/stub/TLV entries on demand, and a resolve after layout that copies
//! every live atom's bytes into the output and patches them, recording the
//! rebase and bind work dyld will finish at load time.

use log::debug;

use crate::arch::{aarch64, x86_64, PageOffsetKind};
use crate::atom::{AtomId, SymbolId, NONE};
use crate::error::{Error, Result};
use crate::linker::{BindEntry, FileData, Linker};
use crate::mach::relocation::*;
use crate::object::{Reloc, RelocTarget};
use crate::options::CpuArch;
use crate::synthetic;

/// Pre-layout scan: walk every live atom's relocations and allocate the
/// synthetic entries they will need.
pub fn scan(linker: &mut Linker) -> Result<()> {
    let arch = linker.options.target.cpu_arch;
    for aid in 1..linker.atoms.len() as AtomId {
        let atom = linker.atoms[aid as usize];
        if !atom.alive || atom.file == NONE || atom.relocs.is_empty() {
            continue;
        }
        let relocs: Vec<(u8, SymbolId)> = {
            let object = linker.object(atom.file);
            object.relocs[atom.relocs.range()]
                .iter()
                .filter_map(|r| match r.target {
                    RelocTarget::Symbol(idx) => {
                        let sid = object.symbols[idx as usize];
                        if sid == NONE { None } else { Some((r.r_type, sid)) }
                    }
                    RelocTarget::Section(_) => None,
                })
                .collect()
        };
        for (r_type, sid) in relocs {
            let sym = &linker.symbols[sid as usize];
            let import = sym.flags.import;
            let weak_undef = sym.flags.weak_ref && !sym.is_defined() && !import;
            match arch {
                CpuArch::X86_64 => match r_type {
                    X86_64_RELOC_GOT => {
                        synthetic::got_entry(linker, sid);
                    }
                    X86_64_RELOC_GOT_LOAD => {
                        if import {
                            synthetic::got_entry(linker, sid);
                        }
                    }
                    X86_64_RELOC_TLV => {
                        if import {
                            synthetic::tlv_entry(linker, sid);
                        }
                    }
                    X86_64_RELOC_BRANCH => {
                        if import || weak_undef {
                            synthetic::stub_entry(linker, sid);
                        }
                    }
                    _ => {}
                },
                CpuArch::Aarch64 => match r_type {
                    ARM64_RELOC_POINTER_TO_GOT => {
                        synthetic::got_entry(linker, sid);
                    }
                    ARM64_RELOC_GOT_LOAD_PAGE21 | ARM64_RELOC_GOT_LOAD_PAGEOFF12 => {
                        if import {
                            synthetic::got_entry(linker, sid);
                        }
                    }
                    ARM64_RELOC_TLVP_LOAD_PAGE21 | ARM64_RELOC_TLVP_LOAD_PAGEOFF12 => {
                        if import {
                            synthetic::tlv_entry(linker, sid);
                        }
                    }
                    ARM64_RELOC_BRANCH26 => {
                        if import || weak_undef {
                            synthetic::stub_entry(linker, sid);
                        }
                    }
                    _ => {}
                },
            }
        }
    }
    debug!(
        "scan: {} got, {} stubs, {} tlv entries",
        linker.got.len(),
        linker.stubs.len(),
        linker.tlv.len()
    );
    Ok(())
}

/// The address a code reference to `sid` lands on: imports route through
/// their stub, everything else is the symbol's value.
fn branch_target_addr(linker: &Linker, sid: SymbolId) -> u64 {
    let sym = &linker.symbols[sid as usize];
    if sym.flags.import || !sym.is_defined() {
        if let Some(index) = linker.stubs.index_of(sid) {
            let stub = linker.stubs.entries[index as usize].atom;
            return linker.atom_addr(stub);
        }
    }
    sym.value
}

fn got_slot_addr(linker: &Linker, sid: SymbolId) -> u64 {
    let index = linker.got.index_of(sid).expect("GOT entry allocated during scan");
    linker.atom_addr(linker.got.entries[index as usize].atom)
}

fn tlv_slot_addr(linker: &Linker, sid: SymbolId) -> u64 {
    let index = linker.tlv.index_of(sid).expect("TLV entry allocated during scan");
    linker.atom_addr(linker.tlv.entries[index as usize].atom)
}

/// Translate an input-file virtual address in section `ordinal` into its
/// output address.
fn map_input_va(linker: &Linker, fid: u32, ordinal: u8, va: u64) -> u64 {
    let object = linker.object(fid);
    let sect = &object.sections[ordinal as usize - 1];
    let aid = object.section_atoms[ordinal as usize - 1];
    if aid == NONE {
        return 0;
    }
    linker.atom_addr(aid) + va.wrapping_sub(sect.addr)
}

fn read_i32(out: &[u8], p: usize) -> i32 {
    i32::from_le_bytes(out[p..p + 4].try_into().unwrap())
}

fn read_i64(out: &[u8], p: usize) -> i64 {
    i64::from_le_bytes(out[p..p + 8].try_into().unwrap())
}

fn read_u32(out: &[u8], p: usize) -> u32 {
    u32::from_le_bytes(out[p..p + 4].try_into().unwrap())
}

fn write_i32(out: &mut [u8], p: usize, v: i32) {
    out[p..p + 4].copy_from_slice(&v.to_le_bytes());
}

fn write_u32(out: &mut [u8], p: usize, v: u32) {
    out[p..p + 4].copy_from_slice(&v.to_le_bytes());
}

fn write_u64(out: &mut [u8], p: usize, v: u64) {
    out[p..p + 8].copy_from_slice(&v.to_le_bytes());
}

/// The writable-segment test deciding whether a resolved pointer needs a
/// rebase entry.
fn segment_is_writable(linker: &Linker, seg_index: u32) -> bool {
    linker.segments[seg_index as usize].is_writable()
}

fn pointer_location(linker: &Linker, aid: AtomId, offset_in_atom: u64) -> (u32, u64) {
    let atom = &linker.atoms[aid as usize];
    let seg_index = linker.out_sections[atom.out_sect as usize].segment;
    let seg_vmaddr = linker.segments[seg_index as usize].header.vmaddr;
    let addr = linker.atom_addr(aid) + offset_in_atom;
    (seg_index, addr - seg_vmaddr)
}

/// Post-layout resolve: copy every live atom's input bytes into `out`, then
/// apply its relocations in address order.
pub fn resolve_all(linker: &mut Linker, out: &mut [u8]) -> Result<()> {
    let atom_count = linker.atoms.len() as AtomId;
    for aid in 1..atom_count {
        let atom = linker.atoms[aid as usize];
        if !atom.alive || atom.file == NONE || atom.out_sect == NONE {
            continue;
        }
        if linker.out_sections[atom.out_sect as usize].is_zerofill() {
            continue;
        }
        copy_atom_bytes(linker, aid, out);
        if !atom.relocs.is_empty() {
            resolve_atom(linker, aid, out)?;
        }
    }
    write_synthetic_atoms(linker, out)?;
    Ok(())
}

fn copy_atom_bytes(linker: &Linker, aid: AtomId, out: &mut [u8]) {
    let atom = &linker.atoms[aid as usize];
    let object = linker.object(atom.file);
    let bytes = object.sect_bytes(atom.n_sect as usize - 1);
    if bytes.is_empty() {
        return;
    }
    let dst = linker.atom_file_offset(aid) as usize;
    out[dst..dst + bytes.len()].copy_from_slice(bytes);
}

fn resolve_atom(linker: &mut Linker, aid: AtomId, out: &mut [u8]) -> Result<()> {
    let atom = linker.atoms[aid as usize];
    let relocs: Vec<Reloc> = linker.object(atom.file).relocs[atom.relocs.range()].to_vec();
    let in_sect_addr = linker.object(atom.file).sections[atom.n_sect as usize - 1].addr;
    let atom_addr = linker.atom_addr(aid);
    let atom_file_off = linker.atom_file_offset(aid) as usize;

    let mut pending_addend: i64 = 0;
    let mut subtractor: Option<u64> = None;

    for reloc in &relocs {
        let source = atom_addr + reloc.offset as u64;
        let p = atom_file_off + reloc.offset as usize;

        // where the reloc's symbol (if any) resolves
        let target_sym: Option<SymbolId> = match reloc.target {
            RelocTarget::Symbol(idx) => {
                let sid = linker.object(atom.file).symbols[idx as usize];
                if sid == NONE { None } else { Some(sid) }
            }
            RelocTarget::Section(_) => None,
        };

        match linker.options.target.cpu_arch {
            CpuArch::X86_64 => resolve_x86_64(
                linker,
                aid,
                reloc,
                target_sym,
                source,
                p,
                in_sect_addr,
                &mut subtractor,
                out,
            )?,
            CpuArch::Aarch64 => resolve_aarch64(
                linker,
                aid,
                reloc,
                target_sym,
                source,
                p,
                &mut pending_addend,
                &mut subtractor,
                out,
            )?,
        }
    }
    Ok(())
}

fn unsigned_pointer(
    linker: &mut Linker,
    aid: AtomId,
    reloc: &Reloc,
    target_sym: Option<SymbolId>,
    p: usize,
    extra_addend: i64,
    subtractor: &mut Option<u64>,
    out: &mut [u8],
) -> Result<()> {
    let atom = linker.atoms[aid as usize];
    if reloc.length == 3 {
        let embedded = read_i64(out, p);
        let addend = embedded.wrapping_add(extra_addend);
        if let Some(subtrahend) = subtractor.take() {
            // SUBTRACTOR, then UNSIGNED: result = target + addend - sub.
            // For a section target the embedded value already names the
            // target input VA.
            let minuend = match target_sym {
                Some(sid) => linker.symbols[sid as usize].value.wrapping_add(addend as u64),
                None => match reloc.target {
                    RelocTarget::Section(ord) => {
                        map_input_va(linker, atom.file, ord, embedded as u64)
                            .wrapping_add(extra_addend as u64)
                    }
                    _ => 0,
                },
            };
            write_u64(out, p, minuend.wrapping_sub(subtrahend));
            return Ok(());
        }
        match target_sym {
            Some(sid) if linker.symbols[sid as usize].flags.import => {
                let (segment, offset) = pointer_location(linker, aid, reloc.offset as u64);
                linker.bind_entries.push(BindEntry {
                    segment,
                    offset,
                    target: sid,
                    addend,
                    lazy: false,
                });
                write_u64(out, p, 0);
            }
            Some(sid) => {
                let value = linker.symbols[sid as usize].value.wrapping_add(addend as u64);
                write_u64(out, p, value);
                let (segment, offset) = pointer_location(linker, aid, reloc.offset as u64);
                if segment_is_writable(linker, segment) {
                    linker.rebase_entries.push((segment, offset));
                }
            }
            None => {
                if let RelocTarget::Section(ord) = reloc.target {
                    let value = map_input_va(linker, atom.file, ord, embedded as u64)
                        .wrapping_add(extra_addend as u64);
                    write_u64(out, p, value);
                    let (segment, offset) = pointer_location(linker, aid, reloc.offset as u64);
                    if segment_is_writable(linker, segment) {
                        linker.rebase_entries.push((segment, offset));
                    }
                }
            }
        }
    } else {
        // 32-bit absolute: legal only when the value fits
        let embedded = read_i32(out, p) as i64;
        let value = match target_sym {
            Some(sid) => linker.symbols[sid as usize].value as i64 + embedded + extra_addend,
            None => match reloc.target {
                RelocTarget::Section(ord) => {
                    map_input_va(linker, atom.file, ord, embedded as u64) as i64 + extra_addend
                }
                _ => embedded,
            },
        };
        let value = u32::try_from(value)
            .map_err(|_| Error::Overflow(format!("32-bit absolute value {value:#x}")))?;
        write_u32(out, p, value);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn resolve_x86_64(
    linker: &mut Linker,
    aid: AtomId,
    reloc: &Reloc,
    target_sym: Option<SymbolId>,
    source: u64,
    p: usize,
    in_sect_addr: u64,
    subtractor: &mut Option<u64>,
    out: &mut [u8],
) -> Result<()> {
    match reloc.r_type {
        X86_64_RELOC_SUBTRACTOR => {
            let sid = target_sym.ok_or_else(|| {
                Error::Malformed("SUBTRACTOR relocation without a symbol".into())
            })?;
            *subtractor = Some(linker.symbols[sid as usize].value);
            Ok(())
        }
        X86_64_RELOC_UNSIGNED => {
            unsigned_pointer(linker, aid, reloc, target_sym, p, 0, subtractor, out)
        }
        X86_64_RELOC_BRANCH => {
            let sid = target_sym
                .ok_or_else(|| Error::Malformed("branch relocation without a symbol".into()))?;
            let addend = read_i32(out, p) as i64;
            let target = (branch_target_addr(linker, sid) as i64 + addend) as u64;
            let disp = x86_64::calc_pcrel_displacement(source, target, 0)?;
            write_i32(out, p, disp);
            Ok(())
        }
        X86_64_RELOC_GOT_LOAD | X86_64_RELOC_GOT => {
            let sid = target_sym
                .ok_or_else(|| Error::Malformed("GOT relocation without a symbol".into()))?;
            let addend = read_i32(out, p) as i64;
            let import = linker.symbols[sid as usize].flags.import;
            let target = if reloc.r_type == X86_64_RELOC_GOT_LOAD && !import {
                // locally-resolved GOT load: mov becomes lea, indirection
                // goes away
                x86_64::relax_got_load(&mut out[p - 2]);
                linker.symbols[sid as usize].value
            } else {
                got_slot_addr(linker, sid)
            };
            let disp = x86_64::calc_pcrel_displacement(source, (target as i64 + addend) as u64, 0)?;
            write_i32(out, p, disp);
            Ok(())
        }
        X86_64_RELOC_TLV => {
            let sid = target_sym
                .ok_or_else(|| Error::Malformed("TLV relocation without a symbol".into()))?;
            let import = linker.symbols[sid as usize].flags.import;
            let target = if import {
                tlv_slot_addr(linker, sid)
            } else {
                x86_64::relax_got_load(&mut out[p - 2]);
                linker.symbols[sid as usize].value
            };
            let disp = x86_64::calc_pcrel_displacement(source, target, 0)?;
            write_i32(out, p, disp);
            Ok(())
        }
        X86_64_RELOC_SIGNED | X86_64_RELOC_SIGNED_1 | X86_64_RELOC_SIGNED_2
        | X86_64_RELOC_SIGNED_4 => {
            let correction: u64 = match reloc.r_type {
                X86_64_RELOC_SIGNED_1 => 1,
                X86_64_RELOC_SIGNED_2 => 2,
                X86_64_RELOC_SIGNED_4 => 4,
                _ => 0,
            };
            let embedded = read_i32(out, p) as i64;
            let target = match target_sym {
                Some(sid) => (linker.symbols[sid as usize].value as i64 + embedded) as u64,
                None => match reloc.target {
                    RelocTarget::Section(ord) => {
                        // the embedded displacement points at the input VA
                        let target_input = (in_sect_addr as i64
                            + reloc.offset as i64
                            + 4
                            + correction as i64
                            + embedded) as u64;
                        let atom = linker.atoms[aid as usize];
                        map_input_va(linker, atom.file, ord, target_input)
                    }
                    _ => unreachable!(),
                },
            };
            let disp = x86_64::calc_pcrel_displacement(source, target, correction)?;
            write_i32(out, p, disp);
            Ok(())
        }
        other => Err(Error::Malformed(format!(
            "unexpected x86_64 relocation {}",
            x86_64_reloc_to_str(other)
        ))),
    }
}

#[allow(clippy::too_many_arguments)]
fn resolve_aarch64(
    linker: &mut Linker,
    aid: AtomId,
    reloc: &Reloc,
    target_sym: Option<SymbolId>,
    source: u64,
    p: usize,
    pending_addend: &mut i64,
    subtractor: &mut Option<u64>,
    out: &mut [u8],
) -> Result<()> {
    let addend = std::mem::take(pending_addend);
    match reloc.r_type {
        ARM64_RELOC_ADDEND => {
            *pending_addend = reloc.addend;
            Ok(())
        }
        ARM64_RELOC_SUBTRACTOR => {
            let sid = target_sym.ok_or_else(|| {
                Error::Malformed("SUBTRACTOR relocation without a symbol".into())
            })?;
            *subtractor = Some(linker.symbols[sid as usize].value);
            Ok(())
        }
        ARM64_RELOC_UNSIGNED => {
            unsigned_pointer(linker, aid, reloc, target_sym, p, addend, subtractor, out)
        }
        ARM64_RELOC_BRANCH26 => {
            let sid = target_sym
                .ok_or_else(|| Error::Malformed("branch relocation without a symbol".into()))?;
            let target = branch_target_addr(linker, sid);
            let mut disp = target as i64 - source as i64;
            if !aarch64::branch_in_range(disp) {
                let atom = linker.atoms[aid as usize];
                let thunk_addr = (atom.thunk != 0)
                    .then(|| {
                        linker.thunks[atom.thunk as usize - 1]
                            .targets
                            .get(&sid)
                            .map(|&t| linker.atom_addr(t))
                    })
                    .flatten();
                match thunk_addr {
                    Some(thunk) => disp = thunk as i64 - source as i64,
                    None => {
                        return Err(Error::Overflow(format!(
                            "branch to {} spans {disp:#x} with no thunk in reach",
                            linker.sym_name(sid)
                        )));
                    }
                }
            }
            let inst = read_u32(out, p);
            write_u32(out, p, aarch64::set_branch26(inst, disp)?);
            Ok(())
        }
        ARM64_RELOC_PAGE21 => {
            let target = aarch64_target(linker, aid, reloc, target_sym, addend)?;
            let pages = aarch64::calc_number_of_pages(source, target)?;
            let inst = read_u32(out, p);
            write_u32(out, p, aarch64::set_adrp_imm(inst, pages));
            Ok(())
        }
        ARM64_RELOC_PAGEOFF12 => {
            let target = aarch64_target(linker, aid, reloc, target_sym, addend)?;
            let inst = read_u32(out, p);
            let kind = aarch64::page_offset_kind(inst);
            let imm = aarch64::calc_page_offset(target, kind)?;
            write_u32(out, p, aarch64::set_imm12(inst, imm));
            Ok(())
        }
        ARM64_RELOC_GOT_LOAD_PAGE21 | ARM64_RELOC_TLVP_LOAD_PAGE21 => {
            let sid = target_sym
                .ok_or_else(|| Error::Malformed("GOT page relocation without a symbol".into()))?;
            let target = slot_or_value(linker, sid, reloc.r_type == ARM64_RELOC_TLVP_LOAD_PAGE21);
            let pages = aarch64::calc_number_of_pages(source, target)?;
            let inst = read_u32(out, p);
            write_u32(out, p, aarch64::set_adrp_imm(inst, pages));
            Ok(())
        }
        ARM64_RELOC_GOT_LOAD_PAGEOFF12 | ARM64_RELOC_TLVP_LOAD_PAGEOFF12 => {
            let sid = target_sym
                .ok_or_else(|| Error::Malformed("GOT pageoff relocation without a symbol".into()))?;
            let tlv = reloc.r_type == ARM64_RELOC_TLVP_LOAD_PAGEOFF12;
            let import = linker.symbols[sid as usize].flags.import;
            let inst = read_u32(out, p);
            if import {
                let slot = slot_or_value(linker, sid, tlv);
                let imm = aarch64::calc_page_offset(slot, PageOffsetKind::LoadStore64)?;
                write_u32(out, p, aarch64::set_imm12(inst, imm));
            } else {
                // local target: the load of the slot becomes address
                // arithmetic on the value itself
                let value = linker.symbols[sid as usize].value;
                let imm = aarch64::calc_page_offset(value, PageOffsetKind::Arithmetic)?;
                write_u32(out, p, aarch64::ldr_to_add(inst, imm));
            }
            Ok(())
        }
        ARM64_RELOC_POINTER_TO_GOT => {
            let sid = target_sym
                .ok_or_else(|| Error::Malformed("GOT pointer relocation without a symbol".into()))?;
            let slot = got_slot_addr(linker, sid);
            if reloc.pcrel {
                let disp = slot as i64 - source as i64;
                let disp = i32::try_from(disp).map_err(|_| {
                    Error::Overflow(format!("GOT-relative pointer {disp:#x} exceeds 32 bits"))
                })?;
                write_i32(out, p, disp);
            } else {
                write_u64(out, p, slot);
                let (segment, offset) = pointer_location(linker, aid, reloc.offset as u64);
                if segment_is_writable(linker, segment) {
                    linker.rebase_entries.push((segment, offset));
                }
            }
            Ok(())
        }
        other => Err(Error::Malformed(format!(
            "unexpected arm64 relocation {}",
            arm64_reloc_to_str(other)
        ))),
    }
}

fn aarch64_target(
    linker: &Linker,
    aid: AtomId,
    reloc: &Reloc,
    target_sym: Option<SymbolId>,
    addend: i64,
) -> Result<u64> {
    match target_sym {
        Some(sid) => Ok((linker.symbols[sid as usize].value as i64 + addend) as u64),
        None => match reloc.target {
            // section-relative page relocs carry the target input VA in
            // their ADDEND prefix
            RelocTarget::Section(ord) => {
                let atom = linker.atoms[aid as usize];
                Ok(map_input_va(linker, atom.file, ord, addend as u64))
            }
            _ => Err(Error::Malformed("page relocation without a target".into())),
        },
    }
}

fn slot_or_value(linker: &Linker, sid: SymbolId, tlv: bool) -> u64 {
    let sym = &linker.symbols[sid as usize];
    if sym.flags.import {
        if tlv { tlv_slot_addr(linker, sid) } else { got_slot_addr(linker, sid) }
    } else if !tlv && linker.got.index_of(sid).is_some() {
        got_slot_addr(linker, sid)
    } else {
        sym.value
    }
}

/// Fill in the bytes of every synthetic atom: GOT and TLV slots, lazy
/// pointers, stubs, the helper preamble and entries, and thunks. Pointer
/// slots contribute their rebase/bind entries here.
fn write_synthetic_atoms(linker: &mut Linker, out: &mut [u8]) -> Result<()> {
    // GOT slots
    for i in 0..linker.got.len() {
        let entry = linker.got.entries[i];
        let (segment, offset) = pointer_location(linker, entry.atom, 0);
        let p = linker.atom_file_offset(entry.atom) as usize;
        if linker.symbols[entry.target as usize].flags.import {
            write_u64(out, p, 0);
            linker.bind_entries.push(BindEntry {
                segment,
                offset,
                target: entry.target,
                addend: 0,
                lazy: false,
            });
        } else {
            write_u64(out, p, linker.symbols[entry.target as usize].value);
            linker.rebase_entries.push((segment, offset));
        }
    }

    // TLV pointer slots
    for i in 0..linker.tlv.len() {
        let entry = linker.tlv.entries[i];
        let (segment, offset) = pointer_location(linker, entry.atom, 0);
        let p = linker.atom_file_offset(entry.atom) as usize;
        if linker.symbols[entry.target as usize].flags.import {
            write_u64(out, p, 0);
            linker.bind_entries.push(BindEntry {
                segment,
                offset,
                target: entry.target,
                addend: 0,
                lazy: false,
            });
        } else {
            write_u64(out, p, linker.symbols[entry.target as usize].value);
            linker.rebase_entries.push((segment, offset));
        }
    }

    if linker.stubs.is_empty() {
        write_thunks(linker, out)?;
        return Ok(());
    }

    // lazy pointers start out aimed at their helper entries, and every
    // slot both rebases (the helper address is image-relative) and lazily
    // binds
    for i in 0..linker.stubs.len() {
        let lazy = linker.lazy_ptrs[i];
        let helper = linker.stub_helpers[i];
        let target = linker.stubs.entries[i].target;
        let p = linker.atom_file_offset(lazy) as usize;
        write_u64(out, p, linker.atom_addr(helper));
        let (segment, offset) = pointer_location(linker, lazy, 0);
        linker.rebase_entries.push((segment, offset));
        linker.bind_entries.push(BindEntry {
            segment,
            offset,
            target,
            addend: 0,
            lazy: true,
        });
    }

    // stubs jump through their lazy pointer
    for i in 0..linker.stubs.len() {
        let stub = linker.stubs.entries[i].atom;
        let lazy_addr = linker.atom_addr(linker.lazy_ptrs[i]);
        let stub_addr = linker.atom_addr(stub);
        let p = linker.atom_file_offset(stub) as usize;
        match linker.options.target.cpu_arch {
            CpuArch::X86_64 => {
                let disp = x86_64::calc_pcrel_displacement(stub_addr + 2, lazy_addr, 0)?;
                x86_64::write_stub(&mut out[p..p + x86_64::STUB_SIZE as usize], disp);
            }
            CpuArch::Aarch64 => {
                let pages = aarch64::calc_number_of_pages(stub_addr, lazy_addr)?;
                let imm = aarch64::calc_page_offset(lazy_addr, PageOffsetKind::LoadStore64)?;
                aarch64::write_stub(&mut out[p..p + aarch64::STUB_SIZE as usize], pages, imm);
            }
        }
    }

    // the preamble and one helper entry per stub; the lazy-bind immediates
    // are patched once the stream exists
    let preamble = linker.stub_helper_preamble_atom;
    let preamble_addr = linker.atom_addr(preamble);
    let private_addr = linker.atom_addr(linker.dyld_private_atom);
    let binder_got = got_slot_addr(linker, linker.stub_binder_sym);
    let p = linker.atom_file_offset(preamble) as usize;
    match linker.options.target.cpu_arch {
        CpuArch::X86_64 => {
            let private_disp =
                x86_64::calc_pcrel_displacement(preamble_addr + 3, private_addr, 0)?;
            let binder_disp = x86_64::calc_pcrel_displacement(preamble_addr + 11, binder_got, 0)?;
            x86_64::write_stub_helper_preamble(
                &mut out[p..p + x86_64::STUB_HELPER_PREAMBLE_SIZE as usize],
                private_disp,
                binder_disp,
            );
        }
        CpuArch::Aarch64 => {
            let private_pages = aarch64::calc_number_of_pages(preamble_addr, private_addr)?;
            let private_off = aarch64::calc_page_offset(private_addr, PageOffsetKind::Arithmetic)?;
            let binder_pages = aarch64::calc_number_of_pages(preamble_addr + 12, binder_got)?;
            let binder_off = aarch64::calc_page_offset(binder_got, PageOffsetKind::LoadStore64)?;
            aarch64::write_stub_helper_preamble(
                &mut out[p..p + aarch64::STUB_HELPER_PREAMBLE_SIZE as usize],
                private_pages,
                private_off,
                binder_pages,
                binder_off,
            );
        }
    }

    for i in 0..linker.stubs.len() {
        let helper = linker.stub_helpers[i];
        let helper_addr = linker.atom_addr(helper);
        let p = linker.atom_file_offset(helper) as usize;
        match linker.options.target.cpu_arch {
            CpuArch::X86_64 => {
                let jmp_disp =
                    x86_64::calc_pcrel_displacement(helper_addr + 6, preamble_addr, 0)?;
                x86_64::write_stub_helper_entry(
                    &mut out[p..p + x86_64::STUB_HELPER_ENTRY_SIZE as usize],
                    0,
                    jmp_disp,
                );
            }
            CpuArch::Aarch64 => {
                let disp = preamble_addr as i64 - helper_addr as i64;
                aarch64::write_stub_helper_entry(
                    &mut out[p..p + aarch64::STUB_HELPER_ENTRY_SIZE as usize],
                    0,
                    disp,
                );
            }
        }
    }

    write_thunks(linker, out)?;
    Ok(())
}

fn write_thunks(linker: &Linker, out: &mut [u8]) -> Result<()> {
    for group in &linker.thunks {
        for (&sid, &thunk) in &group.targets {
            let thunk_addr = linker.atom_addr(thunk);
            let target = branch_target_addr(linker, sid);
            let pages = aarch64::calc_number_of_pages(thunk_addr, target)?;
            let off = aarch64::calc_page_offset(target, PageOffsetKind::Arithmetic)?;
            let p = linker.atom_file_offset(thunk) as usize;
            aarch64::write_thunk(&mut out[p..p + aarch64::THUNK_SIZE as usize], pages, off);
        }
    }
    Ok(())
}

/// Patch the lazy-bind stream offsets into the stub-helper entries, after
/// the LINKEDIT writer has produced the stream.
pub fn patch_lazy_bind_offsets(linker: &Linker, offsets: &[u32], out: &mut [u8]) {
    let imm_off = match linker.options.target.cpu_arch {
        CpuArch::X86_64 => x86_64::STUB_HELPER_ENTRY_OFFSET_IMM,
        CpuArch::Aarch64 => aarch64::STUB_HELPER_ENTRY_OFFSET_IMM,
    };
    for (i, &stream_off) in offsets.iter().enumerate() {
        let helper = linker.stub_helpers[i];
        let p = (linker.atom_file_offset(helper) + imm_off) as usize;
        write_u32(out, p, stream_off);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_helpers_round_trip() {
        let mut buf = vec![0u8; 16];
        write_u64(&mut buf, 0, 0xdead_beef_cafe_f00d);
        assert_eq!(read_i64(&buf, 0) as u64, 0xdead_beef_cafe_f00d);
        write_i32(&mut buf, 8, -42);
        assert_eq!(read_i32(&buf, 8), -42);
        write_u32(&mut buf, 12, 0x1234_5678);
        assert_eq!(read_u32(&buf, 12), 0x1234_5678);
    }
}
