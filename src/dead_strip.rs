//! Mark-live dead stripping: a work-list traversal from the roots through
//! atom-to-atom relocation edges. Dead atoms stay in the arena but every
//! later pass skips them, and their symbols are stamped `N_DESC_GCED`.

use log::debug;

use crate::atom::{AtomId, NONE};
use crate::linker::{FileData, Linker};
use crate::mach::constants::S_ATTR_NO_DEAD_STRIP;
use crate::mach::symbols::{N_DESC_GCED, N_NO_DEAD_STRIP, REFERENCED_DYNAMICALLY};
use crate::object::RelocTarget;
use crate::options::OutputMode;

pub fn prune(linker: &mut Linker) {
    for atom in linker.atoms.iter_mut().skip(1) {
        atom.alive = false;
    }
    for file in linker.files.iter_mut().skip(1) {
        if matches!(file.data, FileData::Object(_)) {
            file.alive = false;
        }
    }

    let mut worklist: Vec<AtomId> = Vec::new();

    // roots: the entry point, dynamically-referenced and no-dead-strip
    // symbols, and (for a library) everything exported
    if linker.options.output_mode == OutputMode::Exe {
        if let Ok(sid) = linker.entry_symbol() {
            let atom = linker.symbols[sid as usize].atom;
            if atom != NONE {
                worklist.push(atom);
            }
        }
    }
    for sym in linker.symbols.iter().skip(1) {
        if sym.atom == NONE {
            continue;
        }
        let rooted = sym.desc & (REFERENCED_DYNAMICALLY | N_NO_DEAD_STRIP) != 0
            || (linker.options.output_mode == OutputMode::Lib
                && !sym.flags.local
                && !sym.flags.pext
                && sym.is_defined());
        if rooted {
            worklist.push(sym.atom);
        }
    }
    for file in linker.files.iter().skip(1) {
        let FileData::Object(object) = &file.data else { continue };
        for (i, sect) in object.sections.iter().enumerate() {
            if sect.flags & S_ATTR_NO_DEAD_STRIP != 0 {
                let atom = object.section_atoms[i];
                if atom != NONE {
                    worklist.push(atom);
                }
            }
        }
    }

    // fixpoint
    while let Some(aid) = worklist.pop() {
        if linker.atoms[aid as usize].alive {
            continue;
        }
        linker.atoms[aid as usize].alive = true;
        let file = linker.atoms[aid as usize].file;
        let mut touched_files: Vec<u32> = Vec::new();
        if file != NONE {
            touched_files.push(file);
        }

        let atom = linker.atoms[aid as usize];
        if atom.file != NONE && !atom.relocs.is_empty() {
            let object = linker.object(atom.file);
            for reloc in &object.relocs[atom.relocs.range()] {
                match reloc.target {
                    RelocTarget::Symbol(idx) => {
                        let sid = object.symbols[idx as usize];
                        if sid == NONE {
                            continue;
                        }
                        let sym = &linker.symbols[sid as usize];
                        if sym.atom != NONE {
                            worklist.push(sym.atom);
                        } else if sym.file != NONE {
                            // an undef keeps its defining file's locals out
                            // of the N_DESC_GCED stamp
                            touched_files.push(sym.file);
                        }
                    }
                    RelocTarget::Section(ordinal) => {
                        let target = object
                            .section_atoms
                            .get(ordinal as usize - 1)
                            .copied()
                            .unwrap_or(NONE);
                        if target != NONE {
                            worklist.push(target);
                        }
                    }
                }
            }
        }
        for fid in touched_files {
            linker.files[fid as usize].alive = true;
        }
    }

    // stamp symbols whose atoms died
    let mut stripped = 0usize;
    for sym in linker.symbols.iter_mut().skip(1) {
        if sym.atom != NONE && !linker.atoms[sym.atom as usize].alive {
            sym.desc = N_DESC_GCED;
            sym.flags.export = false;
            stripped += 1;
        }
    }
    debug!("dead-strip: {stripped} symbols on dead atoms");
}
