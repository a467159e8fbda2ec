//! The linker itself: one value owning every arena of the link, the
//! resolution machinery across objects, archives and dylibs, and the
//! pipeline driver from input parsing to the signed output file.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::atom::{Atom, AtomId, FileId, SymbolId, NONE};
use crate::archive::Archive;
use crate::dylib::Dylib;
use crate::error::{DuplicateDefinition, Error, Result, UndefinedReference};
use crate::layout::{OutputSection, OutputSegment};
use crate::mach::fat;
use crate::mach::symbols::{
    common_align, Nlist64, N_WEAK_DEF, N_WEAK_REF, REFERENCED_DYNAMICALLY,
};
use crate::object::Object;
use crate::options::{
    LibSpec, Namespace, Options, OutputMode, SearchStrategy, UndefinedTreatment,
};
use crate::strtab::StringTable;
use crate::synthetic::{IndirectTable, ThunkGroup};
use crate::{dead_strip, layout, reloc, synthetic, writer};

/// The special name dyld resolves lazy binds through.
pub const DYLD_STUB_BINDER: &str = "dyld_stub_binder";
pub const MH_EXECUTE_HEADER: &str = "__mh_execute_header";
pub const DSO_HANDLE: &str = "___dso_handle";

#[derive(Debug, Clone, Copy, Default)]
pub struct SymbolFlags {
    /// resolved to a dylib export
    pub import: bool,
    /// appears in the export trie
    pub export: bool,
    /// N_WEAK_DEF or private-extern definition
    pub weak: bool,
    /// weak reference: tolerated missing at runtime
    pub weak_ref: bool,
    /// private extern: kept out of the export set
    pub pext: bool,
    /// segment$start$-style synthetic marker
    pub boundary: bool,
    pub tentative: bool,
    /// goes into the output symbol table
    pub output_symtab: bool,
    /// per-object local, never entered into the global table
    pub local: bool,
    /// linker-synthesized (header marker, dso handle, stub binder)
    pub synthetic: bool,
}

/// A linker-internal symbol. Externally-visible names are unique across the
/// link; locals are per-object.
#[derive(Debug, Clone, Copy)]
pub struct Symbol {
    /// interned name
    pub name: u32,
    pub value: u64,
    /// defining atom, 0 when none (imports, absolutes)
    pub atom: AtomId,
    /// owning file, 0 for synthetics
    pub file: FileId,
    /// index of the source nlist within its file
    pub nlist_idx: u32,
    /// accumulated n_desc bits for the output symtab
    pub desc: u16,
    pub flags: SymbolFlags,
}

impl Symbol {
    pub fn new(name: u32) -> Symbol {
        Symbol {
            name,
            value: 0,
            atom: NONE,
            file: NONE,
            nlist_idx: 0,
            desc: 0,
            flags: SymbolFlags::default(),
        }
    }

    pub fn is_defined(&self) -> bool {
        self.atom != NONE || self.flags.boundary || self.flags.synthetic
    }
}

#[derive(Debug)]
pub enum FileData {
    Object(Object),
    Archive(Archive),
    Dylib(Dylib),
}

/// A loaded input with the shared prefix every variant carries.
#[derive(Debug)]
pub struct InputFile {
    pub index: FileId,
    /// archives and dylibs default dead until referenced
    pub alive: bool,
    pub data: FileData,
}

impl InputFile {
    pub fn path(&self) -> &Path {
        match &self.data {
            FileData::Object(o) => &o.path,
            FileData::Archive(a) => &a.path,
            FileData::Dylib(d) => &d.path,
        }
    }

    pub fn display_name(&self) -> String {
        match &self.data {
            FileData::Object(o) => o.display_name(),
            FileData::Archive(a) => a.path.display().to_string(),
            FileData::Dylib(d) => d.path.display().to_string(),
        }
    }
}

/// Placement request of a `segment$start$`-style symbol.
#[derive(Debug, Clone)]
pub struct Boundary {
    pub segment: String,
    /// section boundary when present, else the whole segment
    pub section: Option<String>,
    pub start: bool,
}

/// A bind-stream entry collected during relocation resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindEntry {
    pub segment: u32,
    /// offset within the segment
    pub offset: u64,
    pub target: SymbolId,
    pub addend: i64,
    pub lazy: bool,
}

pub struct Linker {
    pub options: Options,
    pub strings: StringTable,
    /// all inputs; index 0 reserved so real files are >= 1
    pub files: Vec<InputFile>,
    /// every atom of the link; index 0 is the null atom
    pub atoms: Vec<Atom>,
    /// every symbol of the link; index 0 is the null symbol
    pub symbols: Vec<Symbol>,
    /// interned name -> global symbol id
    pub globals: HashMap<u32, SymbolId>,
    /// globals whose definition is still outstanding, in creation order
    pub unresolved: BTreeSet<SymbolId>,
    /// import symbol -> dylib ordinal (negative values are the special
    /// BIND_SPECIAL_DYLIB_* ordinals)
    pub ordinals: HashMap<SymbolId, i16>,
    /// boundary-symbol placement requests
    pub boundaries: HashMap<SymbolId, Boundary>,
    /// max common-alignment nibble seen per tentative global
    pub common_aligns: HashMap<SymbolId, u32>,
    /// output symtab position, assigned by the LINKEDIT writer
    pub symtab_pos: HashMap<SymbolId, u32>,

    pub got: IndirectTable,
    pub stubs: IndirectTable,
    pub tlv: IndirectTable,
    /// lazy pointer and stub-helper atoms, parallel to `stubs.entries`
    pub lazy_ptrs: Vec<AtomId>,
    pub stub_helpers: Vec<AtomId>,
    pub thunks: Vec<ThunkGroup>,

    /// output sections; index 0 is a placeholder so atom.out_sect == 0
    /// means unplaced
    pub out_sections: Vec<OutputSection>,
    pub section_lookup: HashMap<(String, String), u32>,
    pub segments: Vec<OutputSegment>,

    /// pointers to rebase: (segment index, offset within segment)
    pub rebase_entries: Vec<(u32, u64)>,
    pub bind_entries: Vec<BindEntry>,

    pub mh_header_sym: SymbolId,
    pub dso_handle_sym: SymbolId,
    pub stub_binder_sym: SymbolId,
    pub dyld_private_atom: AtomId,
    pub stub_helper_preamble_atom: AtomId,

    /// duplicate definitions are collected so users see them all at once
    dup_errors: Vec<DuplicateDefinition>,
}

impl Linker {
    pub fn new(options: Options) -> Linker {
        let mut strings = StringTable::new();
        let null_sym = Symbol::new(strings.insert(""));
        Linker {
            options,
            strings,
            files: vec![InputFile { index: 0, alive: false, data: FileData::Archive(placeholder_archive()) }],
            atoms: vec![Atom::new(0, NONE, 0)],
            symbols: vec![null_sym],
            globals: HashMap::new(),
            unresolved: BTreeSet::new(),
            ordinals: HashMap::new(),
            boundaries: HashMap::new(),
            common_aligns: HashMap::new(),
            symtab_pos: HashMap::new(),
            got: IndirectTable::default(),
            stubs: IndirectTable::default(),
            tlv: IndirectTable::default(),
            lazy_ptrs: Vec::new(),
            stub_helpers: Vec::new(),
            thunks: Vec::new(),
            out_sections: vec![OutputSection::placeholder()],
            section_lookup: HashMap::new(),
            segments: Vec::new(),
            rebase_entries: Vec::new(),
            bind_entries: Vec::new(),
            mh_header_sym: NONE,
            dso_handle_sym: NONE,
            stub_binder_sym: NONE,
            dyld_private_atom: NONE,
            stub_helper_preamble_atom: NONE,
            dup_errors: Vec::new(),
        }
    }

    /// Run the whole pipeline: parse, resolve, dead-strip, synthesize,
    /// scan, allocate, resolve relocations, and write the output file.
    pub fn link(&mut self) -> Result<()> {
        self.parse_inputs()?;
        self.resolve()?;
        if self.options.dead_strip {
            dead_strip::prune(self);
        }
        synthetic::create_tentative_atoms(self);
        synthetic::create_boundary_atoms(self);
        reloc::scan(self)?;
        layout::allocate(self)?;
        writer::flush(self)
    }

    // ------------------------------------------------------------------
    // arena accessors
    // ------------------------------------------------------------------

    pub fn intern(&mut self, name: &str) -> u32 {
        self.strings.insert(name)
    }

    pub fn add_atom(&mut self, atom: Atom) -> AtomId {
        let id = self.atoms.len() as AtomId;
        self.atoms.push(atom);
        id
    }

    pub fn add_symbol(&mut self, symbol: Symbol) -> SymbolId {
        let id = self.symbols.len() as SymbolId;
        self.symbols.push(symbol);
        id
    }

    pub fn sym_name(&self, sid: SymbolId) -> &str {
        self.strings.get(self.symbols[sid as usize].name)
    }

    pub fn object(&self, fid: FileId) -> &Object {
        match &self.files[fid as usize].data {
            FileData::Object(o) => o,
            _ => unreachable!("file {fid} is not an object"),
        }
    }

    pub fn object_mut(&mut self, fid: FileId) -> &mut Object {
        match &mut self.files[fid as usize].data {
            FileData::Object(o) => o,
            _ => unreachable!("file {fid} is not an object"),
        }
    }

    pub fn global_by_name(&self, name: &str) -> Option<SymbolId> {
        self.globals.iter().find_map(|(&strx, &sid)| {
            if self.strings.get(strx) == name { Some(sid) } else { None }
        })
    }

    /// The final virtual address of an atom.
    pub fn atom_addr(&self, aid: AtomId) -> u64 {
        let atom = &self.atoms[aid as usize];
        self.out_sections[atom.out_sect as usize].header.addr + atom.off
    }

    /// The file offset an atom's bytes land at (zerofill atoms have none).
    pub fn atom_file_offset(&self, aid: AtomId) -> u64 {
        let atom = &self.atoms[aid as usize];
        self.out_sections[atom.out_sect as usize].header.offset as u64 + atom.off
    }

    // ------------------------------------------------------------------
    // input ingestion
    // ------------------------------------------------------------------

    fn parse_inputs(&mut self) -> Result<()> {
        let positionals = self.options.positionals.clone();
        for input in &positionals {
            self.add_path(&input.path, input.must_link)?;
        }
        let libs: Vec<(String, LibSpec)> =
            self.options.libs.iter().map(|(n, s)| (n.clone(), *s)).collect();
        for (name, spec) in libs {
            let path = self.find_library(&name)?;
            self.add_library_path(&path, spec)?;
        }
        let frameworks: Vec<(String, LibSpec)> =
            self.options.frameworks.iter().map(|(n, s)| (n.clone(), *s)).collect();
        for (name, spec) in frameworks {
            let path = self.find_framework(&name)?;
            self.add_library_path(&path, spec)?;
        }
        Ok(())
    }

    fn apply_syslibroot(&self, dir: &Path) -> PathBuf {
        match (&self.options.syslibroot, dir.is_absolute()) {
            (Some(root), true) => {
                root.join(dir.strip_prefix("/").unwrap_or(dir))
            }
            _ => dir.to_path_buf(),
        }
    }

    fn find_library(&self, name: &str) -> Result<PathBuf> {
        let dylib_names = [format!("lib{name}.tbd"), format!("lib{name}.dylib")];
        let archive_name = format!("lib{name}.a");
        match self.options.search_strategy {
            SearchStrategy::PathsFirst => {
                for dir in &self.options.lib_dirs {
                    let dir = self.apply_syslibroot(dir);
                    for candidate in dylib_names.iter().chain([&archive_name]) {
                        let path = dir.join(candidate);
                        if path.is_file() {
                            return Ok(path);
                        }
                    }
                }
            }
            SearchStrategy::DylibsFirst => {
                for dir in &self.options.lib_dirs {
                    let dir = self.apply_syslibroot(dir);
                    for candidate in &dylib_names {
                        let path = dir.join(candidate);
                        if path.is_file() {
                            return Ok(path);
                        }
                    }
                }
                for dir in &self.options.lib_dirs {
                    let path = self.apply_syslibroot(dir).join(&archive_name);
                    if path.is_file() {
                        return Ok(path);
                    }
                }
            }
        }
        Err(Error::LibraryNotFound(name.to_string()))
    }

    fn find_framework(&self, name: &str) -> Result<PathBuf> {
        for dir in &self.options.framework_dirs {
            let dir = self.apply_syslibroot(dir).join(format!("{name}.framework"));
            for candidate in [format!("{name}.tbd"), name.to_string()] {
                let path = dir.join(candidate);
                if path.is_file() {
                    return Ok(path);
                }
            }
        }
        Err(Error::FrameworkNotFound(name.to_string()))
    }

    /// Classify and ingest one positional input.
    pub fn add_path(&mut self, path: &Path, must_link: bool) -> Result<()> {
        let data = std::fs::read(path)?;
        let mtime = file_mtime(path);
        let slice_off = fat::arch_offset(&data, self.options.target.cputype())?;
        let slice = data[slice_off..].to_vec();

        // archives first: their magic is unambiguous
        match Archive::parse(path.to_path_buf(), slice, must_link) {
            Ok(archive) => return self.add_archive(archive),
            Err(err) if err.is_rejection() => {}
            Err(err) => return Err(err),
        }
        let slice = data[slice_off..].to_vec();
        match Object::parse(path.to_path_buf(), None, slice, &self.options.target, mtime) {
            Ok(object) => {
                self.add_object(object)?;
                return Ok(());
            }
            Err(err) if err.is_rejection() => {}
            Err(err) => return Err(err),
        }
        let dylib = Dylib::parse(path.to_path_buf(), &data[slice_off..], &self.options.target)?;
        self.add_dylib(dylib, LibSpec::default());
        Ok(())
    }

    fn add_library_path(&mut self, path: &Path, spec: LibSpec) -> Result<()> {
        let data = std::fs::read(path)?;
        let slice_off = fat::arch_offset(&data, self.options.target.cputype())?;
        match Archive::parse(path.to_path_buf(), data[slice_off..].to_vec(), false) {
            Ok(archive) => return self.add_archive(archive),
            Err(err) if err.is_rejection() => {}
            Err(err) => return Err(err),
        }
        let mut dylib = Dylib::parse(path.to_path_buf(), &data[slice_off..], &self.options.target)?;
        dylib.weak = spec.weak;
        dylib.needed = spec.needed;
        self.add_dylib(dylib, spec);
        Ok(())
    }

    /// Attach a parsed object to the file vector and materialize one atom
    /// per non-debug section, plus a local symbol per local nlist.
    /// Successful attachment returns the new file index (always >= 1).
    pub fn add_object(&mut self, mut object: Object) -> Result<FileId> {
        let fid = self.files.len() as FileId;
        debug!("object {} -> file {fid}", object.display_name());

        for (i, sect) in object.sections.clone().iter().enumerate() {
            if Object::is_non_atom_section(sect) {
                continue;
            }
            let name = self.intern(&format!("{}${}", sect.seg_name(), sect.sect_name()));
            let mut atom = Atom::new(name, fid, (i + 1) as u8);
            atom.size = sect.size;
            atom.align = sect.align;
            let (start, len) = object.section_relocs[i];
            atom.relocs = crate::atom::Slice { start, len };
            atom.dice = dice_slice_for(&object, sect);
            let sym = self.add_symbol({
                let mut s = Symbol::new(name);
                s.file = fid;
                s.flags.local = true;
                s
            });
            atom.sym = sym;
            let aid = self.add_atom(atom);
            self.symbols[sym as usize].atom = aid;
            object.section_atoms[i] = aid;
            object.atoms.push(aid);
        }

        // local symbols (non-stab, defined) get linker-side twins up front;
        // externals are wired up during resolution
        for idx in 0..object.first_global.min(object.nlists.len()) {
            let nlist = object.nlists[idx];
            if nlist.is_stab() || !nlist.is_sect() {
                continue;
            }
            let name = {
                let name = object.nlist_name(&nlist)?;
                self.intern(name)
            };
            let atom = object
                .section_atoms
                .get(nlist.n_sect as usize - 1)
                .copied()
                .unwrap_or(NONE);
            let sid = self.add_symbol({
                let mut s = Symbol::new(name);
                s.value = nlist.n_value;
                s.atom = atom;
                s.file = fid;
                s.nlist_idx = idx as u32;
                s.desc = nlist.n_desc;
                s.flags.local = true;
                s.flags.output_symtab = true;
                s
            });
            object.symbols[idx] = sid;
        }

        self.files.push(InputFile { index: fid, alive: true, data: FileData::Object(object) });
        Ok(fid)
    }

    fn add_archive(&mut self, archive: Archive) -> Result<()> {
        let fid = self.files.len() as FileId;
        let force = archive.force_load;
        self.files.push(InputFile { index: fid, alive: false, data: FileData::Archive(archive) });
        if force {
            self.force_load_archive(fid)?;
        }
        Ok(())
    }

    fn force_load_archive(&mut self, fid: FileId) -> Result<()> {
        let members: Vec<u64> = match &self.files[fid as usize].data {
            FileData::Archive(a) => a.object_members().map(|m| m.header_offset).collect(),
            _ => unreachable!(),
        };
        for offset in members {
            self.parse_archive_member(fid, offset)?;
        }
        Ok(())
    }

    fn add_dylib(&mut self, dylib: Dylib, _spec: LibSpec) {
        let fid = self.files.len() as FileId;
        self.files.push(InputFile { index: fid, alive: false, data: FileData::Dylib(dylib) });
    }

    /// Parse one archive member as an object (if it has not been already)
    /// and resolve its externals.
    fn parse_archive_member(&mut self, fid: FileId, header_offset: u64) -> Result<Option<FileId>> {
        let (path, member_name, bytes, mtime) = {
            let FileData::Archive(archive) = &mut self.files[fid as usize].data else {
                unreachable!()
            };
            if !archive.parsed.insert(header_offset) {
                return Ok(None);
            }
            let (member, bytes) = archive.member_data(header_offset)?;
            (archive.path.clone(), member.name.clone(), bytes.to_vec(), member.mtime)
        };
        self.files[fid as usize].alive = true;
        let object = Object::parse(
            path,
            Some(member_name),
            bytes,
            &self.options.target,
            mtime,
        )?;
        let new_fid = self.add_object(object)?;
        self.resolve_object_symbols(new_fid)?;
        Ok(Some(new_fid))
    }

    // ------------------------------------------------------------------
    // resolution
    // ------------------------------------------------------------------

    /// Resolve global names across every input under the precedence
    /// lattice, then drain archives, scan dylib exports, create synthetic
    /// globals and apply the undefined-treatment policy.
    pub fn resolve(&mut self) -> Result<()> {
        let object_files: Vec<FileId> = self
            .files
            .iter()
            .filter(|f| matches!(f.data, FileData::Object(_)))
            .map(|f| f.index)
            .collect();
        for fid in object_files {
            self.resolve_object_symbols(fid)?;
        }

        self.drain_archives()?;
        self.scan_dylibs();
        self.create_synthetic_globals();
        self.apply_undefined_treatment()?;
        self.create_stub_binder()?;

        // dylibs flagged needed keep their load command with or without a
        // binding against them
        let needed: Vec<FileId> = self
            .files
            .iter()
            .filter(|f| match &f.data {
                FileData::Dylib(d) => d.needed && d.ordinal.is_none(),
                _ => false,
            })
            .map(|f| f.index)
            .collect();
        for fid in needed {
            self.reference_dylib(fid);
        }

        if !self.dup_errors.is_empty() {
            return Err(Error::MultipleSymbolDefinitions(std::mem::take(&mut self.dup_errors)));
        }
        Ok(())
    }

    /// Walk the external nlists of one object through the lattice.
    pub fn resolve_object_symbols(&mut self, fid: FileId) -> Result<()> {
        let (first_global, count) = {
            let obj = self.object(fid);
            (obj.first_global, obj.nlists.len())
        };
        for idx in first_global..count {
            let nlist = self.object(fid).nlists[idx];
            if nlist.is_stab() {
                continue;
            }
            if nlist.is_indr() || (nlist.is_abs() && nlist.is_ext()) {
                let name = self.object(fid).nlist_name(&nlist)?.to_string();
                return Err(Error::UnhandledSymbolType { name, n_type: nlist.n_type });
            }
            if !nlist.is_ext() {
                continue;
            }
            let name = {
                let name = self.object(fid).nlist_name(&nlist)?.to_string();
                self.intern(&name)
            };
            self.resolve_one(fid, idx as u32, name, nlist);
        }
        Ok(())
    }

    fn resolve_one(&mut self, fid: FileId, nlist_idx: u32, name: u32, nlist: Nlist64) {
        let new_rank = rank(&nlist);
        let gid = match self.globals.get(&name).copied() {
            None => {
                let sid = self.add_symbol(Symbol::new(name));
                self.globals.insert(name, sid);
                self.take_occurrence(sid, fid, nlist_idx, &nlist);
                if new_rank == Rank::Undef && !nlist.is_tentative() {
                    self.unresolved.insert(sid);
                }
                sid
            }
            Some(sid) => {
                let existing = self.symbols[sid as usize];
                let existing_rank = existing_rank(&existing);
                match (new_rank, existing_rank) {
                    (Rank::Strong, Rank::Strong) => {
                        let first = self.occurrence_name(sid);
                        let second = self.files[fid as usize].display_name();
                        let name = self.strings.get(name).to_string();
                        self.dup_errors.push(DuplicateDefinition { name, first, second });
                    }
                    (_, Rank::Strong) => {}
                    (Rank::Weak, Rank::Weak) => {}
                    (Rank::Tentative, Rank::Tentative) => {
                        // keep the larger size, merge the alignment
                        let align = common_align(nlist.n_desc);
                        let entry = self.common_aligns.entry(sid).or_insert(0);
                        *entry = (*entry).max(align);
                        if nlist.n_value > existing.value {
                            self.take_occurrence(sid, fid, nlist_idx, &nlist);
                        }
                    }
                    (Rank::Undef, _) => {
                        // a weak reference only stays weak if every
                        // reference agrees
                        if !nlist.is_weak_ref() {
                            self.symbols[sid as usize].flags.weak_ref = false;
                        }
                    }
                    _ => {
                        self.take_occurrence(sid, fid, nlist_idx, &nlist);
                        self.unresolved.remove(&sid);
                    }
                }
                sid
            }
        };
        self.object_mut(fid).symbols[nlist_idx as usize] = gid;
    }

    /// Point a global at a new owning occurrence.
    fn take_occurrence(&mut self, sid: SymbolId, fid: FileId, nlist_idx: u32, nlist: &Nlist64) {
        let atom = if nlist.is_sect() {
            self.object(fid)
                .section_atoms
                .get(nlist.n_sect as usize - 1)
                .copied()
                .unwrap_or(NONE)
        } else {
            NONE
        };
        let sym = &mut self.symbols[sid as usize];
        sym.value = nlist.n_value;
        sym.atom = atom;
        sym.file = fid;
        sym.nlist_idx = nlist_idx;
        sym.desc = nlist.n_desc & (N_WEAK_DEF | N_NO_DEAD_STRIP_DESC | REFERENCED_DYNAMICALLY);
        sym.flags.weak = nlist.is_sect() && (nlist.is_weak_def() || nlist.is_pext());
        sym.flags.pext = nlist.is_pext();
        sym.flags.tentative = nlist.is_tentative();
        sym.flags.weak_ref = nlist.is_undf() && nlist.is_weak_ref();
        sym.flags.import = false;
        sym.flags.output_symtab = true;
        if nlist.is_tentative() {
            let align = common_align(nlist.n_desc);
            let entry = self.common_aligns.entry(sid).or_insert(0);
            *entry = (*entry).max(align);
        }
        if nlist.is_sect() {
            self.unresolved.remove(&sid);
        }
    }

    fn occurrence_name(&self, sid: SymbolId) -> String {
        let fid = self.symbols[sid as usize].file;
        if fid == NONE {
            "<synthetic>".to_string()
        } else {
            self.files[fid as usize].display_name()
        }
    }

    /// For each unresolved name, scan archive tables of contents and parse
    /// the defining members, repeating until a pass makes no progress.
    fn drain_archives(&mut self) -> Result<()> {
        let archive_files: Vec<FileId> = self
            .files
            .iter()
            .filter(|f| matches!(f.data, FileData::Archive(_)))
            .map(|f| f.index)
            .collect();
        if archive_files.is_empty() {
            return Ok(());
        }
        loop {
            let pending: Vec<SymbolId> = self.unresolved.iter().copied().collect();
            let mut progressed = false;
            for sid in pending {
                if !self.unresolved.contains(&sid) {
                    continue;
                }
                let name = self.sym_name(sid).to_string();
                for &fid in &archive_files {
                    let offsets: Vec<u64> = match &self.files[fid as usize].data {
                        FileData::Archive(a) => {
                            a.lookup(&name).map(|o| o.to_vec()).unwrap_or_default()
                        }
                        _ => unreachable!(),
                    };
                    for offset in offsets {
                        if self.parse_archive_member(fid, offset)?.is_some() {
                            progressed = true;
                        }
                    }
                    if !self.unresolved.contains(&sid) {
                        break;
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        Ok(())
    }

    /// Resolve what remains against dylib export sets, assigning ordinals
    /// at first reference.
    fn scan_dylibs(&mut self) {
        let dylib_files: Vec<FileId> = self
            .files
            .iter()
            .filter(|f| matches!(f.data, FileData::Dylib(_)))
            .map(|f| f.index)
            .collect();
        let pending: Vec<SymbolId> = self.unresolved.iter().copied().collect();
        for sid in pending {
            let name = self.sym_name(sid).to_string();
            for &fid in &dylib_files {
                let (exports, weak_export, dylib_weak) = {
                    let FileData::Dylib(d) = &self.files[fid as usize].data else {
                        unreachable!()
                    };
                    (d.exports_symbol(&name), d.weak_exports.contains(&name), d.weak)
                };
                if !exports {
                    continue;
                }
                let ordinal = self.reference_dylib(fid);
                let sym = &mut self.symbols[sid as usize];
                sym.flags.import = true;
                sym.file = fid;
                if weak_export || dylib_weak {
                    sym.flags.weak_ref = true;
                    sym.desc |= N_WEAK_REF;
                }
                sym.desc = crate::mach::symbols::set_ordinal(sym.desc, ordinal as u8);
                self.set_import_ordinal(sid, ordinal as i16);
                self.unresolved.remove(&sid);
                break;
            }
        }
    }

    fn set_import_ordinal(&mut self, sid: SymbolId, ordinal: i16) {
        let ordinal = match self.options.namespace {
            Namespace::Flat => {
                crate::mach::opcodes::BIND_SPECIAL_DYLIB_FLAT_LOOKUP as i16
            }
            Namespace::TwoLevel => ordinal,
        };
        self.ordinals.insert(sid, ordinal);
    }

    /// Mark a dylib referenced, assigning its load-command ordinal on the
    /// first reference.
    pub fn reference_dylib(&mut self, fid: FileId) -> u16 {
        self.files[fid as usize].alive = true;
        let next = self
            .files
            .iter()
            .filter_map(|f| match &f.data {
                FileData::Dylib(d) => d.ordinal,
                _ => None,
            })
            .max()
            .unwrap_or(0)
            + 1;
        let FileData::Dylib(dylib) = &mut self.files[fid as usize].data else {
            unreachable!()
        };
        *dylib.ordinal.get_or_insert(next)
    }

    /// `__mh_execute_header` and `___dso_handle`.
    fn create_synthetic_globals(&mut self) {
        if self.options.output_mode == OutputMode::Exe {
            let name = self.intern(MH_EXECUTE_HEADER);
            let sid = match self.globals.get(&name).copied() {
                Some(sid) => sid,
                None => {
                    let sid = self.add_symbol(Symbol::new(name));
                    self.globals.insert(name, sid);
                    sid
                }
            };
            let sym = &mut self.symbols[sid as usize];
            sym.flags.synthetic = true;
            sym.flags.output_symtab = true;
            sym.desc |= REFERENCED_DYNAMICALLY;
            self.unresolved.remove(&sid);
            self.mh_header_sym = sid;
        }

        let dso = self.intern(DSO_HANDLE);
        if let Some(&sid) = self.globals.get(&dso) {
            if self.unresolved.contains(&sid) {
                let sym = &mut self.symbols[sid as usize];
                sym.flags.synthetic = true;
                sym.flags.weak = true;
                sym.flags.pext = true;
                sym.flags.output_symtab = false;
                self.unresolved.remove(&sid);
                self.dso_handle_sym = sid;
            }
        }
    }

    /// Lazy binding funnels through `dyld_stub_binder`, so once anything
    /// imports, some dylib must export it.
    fn create_stub_binder(&mut self) -> Result<()> {
        let any_import = self.symbols.iter().any(|s| s.flags.import);
        if any_import {
            let name = self.intern(DYLD_STUB_BINDER);
            let sid = match self.globals.get(&name).copied() {
                Some(sid) => sid,
                None => {
                    let sid = self.add_symbol(Symbol::new(name));
                    self.globals.insert(name, sid);
                    sid
                }
            };
            if !self.symbols[sid as usize].flags.import {
                let dylib_files: Vec<FileId> = self
                    .files
                    .iter()
                    .filter(|f| matches!(f.data, FileData::Dylib(_)))
                    .map(|f| f.index)
                    .collect();
                let provider = dylib_files.into_iter().find(|&fid| {
                    let FileData::Dylib(d) = &self.files[fid as usize].data else {
                        unreachable!()
                    };
                    d.exports_symbol(DYLD_STUB_BINDER)
                });
                match provider {
                    Some(fid) => {
                        let ordinal = self.reference_dylib(fid);
                        let sym = &mut self.symbols[sid as usize];
                        sym.flags.import = true;
                        sym.flags.synthetic = true;
                        sym.file = fid;
                        sym.desc = crate::mach::symbols::set_ordinal(sym.desc, ordinal as u8);
                        self.set_import_ordinal(sid, ordinal as i16);
                        self.unresolved.remove(&sid);
                    }
                    None => {
                        return Err(Error::UndefinedSymbolReference(vec![UndefinedReference {
                            name: DYLD_STUB_BINDER.to_string(),
                            referenced_in: "<synthetic lazy-binding machinery>".to_string(),
                        }]));
                    }
                }
            }
            self.stub_binder_sym = sid;
        }
        Ok(())
    }

    fn apply_undefined_treatment(&mut self) -> Result<()> {
        // boundary names resolve to zero-size markers, never to errors
        let pending: Vec<SymbolId> = self.unresolved.iter().copied().collect();
        for sid in pending {
            let name = self.sym_name(sid).to_string();
            if let Some(boundary) = parse_boundary_name(&name) {
                let sym = &mut self.symbols[sid as usize];
                sym.flags.boundary = true;
                sym.flags.pext = true;
                sym.flags.output_symtab = false;
                self.boundaries.insert(sid, boundary);
                self.unresolved.remove(&sid);
            }
        }

        if self.unresolved.is_empty() {
            return Ok(());
        }
        match self.options.undefined_treatment {
            UndefinedTreatment::Error => {
                let refs = self.undefined_references();
                Err(Error::UndefinedSymbolReference(refs))
            }
            UndefinedTreatment::Warn | UndefinedTreatment::Suppress => {
                let pending: Vec<SymbolId> = self.unresolved.iter().copied().collect();
                for sid in pending {
                    let sym = &mut self.symbols[sid as usize];
                    if sym.flags.weak_ref {
                        sym.flags.import = true;
                        self.ordinals.insert(
                            sid,
                            crate::mach::opcodes::BIND_SPECIAL_DYLIB_FLAT_LOOKUP as i16,
                        );
                        self.unresolved.remove(&sid);
                    } else if self.options.undefined_treatment == UndefinedTreatment::Warn {
                        warn!("undefined symbol {}", self.strings.get(sym.name));
                    }
                }
                Ok(())
            }
            UndefinedTreatment::DynamicLookup => {
                let pending: Vec<SymbolId> = self.unresolved.iter().copied().collect();
                for sid in pending {
                    let sym = &mut self.symbols[sid as usize];
                    sym.flags.import = true;
                    self.ordinals.insert(
                        sid,
                        crate::mach::opcodes::BIND_SPECIAL_DYLIB_FLAT_LOOKUP as i16,
                    );
                    self.unresolved.remove(&sid);
                }
                Ok(())
            }
        }
    }

    pub fn undefined_references(&self) -> Vec<UndefinedReference> {
        self.unresolved
            .iter()
            .map(|&sid| {
                let sym = &self.symbols[sid as usize];
                let referenced_in = if sym.file != NONE {
                    self.files[sym.file as usize].display_name()
                } else {
                    "<unknown>".to_string()
                };
                UndefinedReference {
                    name: self.strings.get(sym.name).to_string(),
                    referenced_in,
                }
            })
            .collect()
    }

    /// The entry-point symbol for an executable, checked late so layout
    /// can stamp `LC_MAIN` with its final value.
    pub fn entry_symbol(&self) -> Result<SymbolId> {
        let entry = &self.options.entry;
        for (&strx, &sid) in &self.globals {
            if self.strings.get(strx) == entry {
                let sym = &self.symbols[sid as usize];
                if sym.is_defined() && !sym.flags.import {
                    return Ok(sid);
                }
            }
        }
        Err(Error::MissingMainEntrypoint(entry.clone()))
    }
}

const N_NO_DEAD_STRIP_DESC: u16 = crate::mach::symbols::N_NO_DEAD_STRIP;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rank {
    Strong,
    Weak,
    Tentative,
    Undef,
}

/// strong = defined section symbol that is neither weak-def nor
/// private-extern; weak = defined section symbol that is either.
fn rank(nlist: &Nlist64) -> Rank {
    if nlist.is_sect() {
        if nlist.is_weak_def() || nlist.is_pext() {
            Rank::Weak
        } else {
            Rank::Strong
        }
    } else if nlist.is_tentative() {
        Rank::Tentative
    } else {
        Rank::Undef
    }
}

fn existing_rank(sym: &Symbol) -> Rank {
    if sym.atom != NONE || sym.flags.synthetic || sym.flags.boundary {
        if sym.flags.weak { Rank::Weak } else { Rank::Strong }
    } else if sym.flags.tentative {
        Rank::Tentative
    } else {
        Rank::Undef
    }
}

/// `segment$start$<seg>`, `segment$stop$<seg>`, `section$start$<seg>$<sect>`,
/// `section$stop$<seg>$<sect>`.
pub fn parse_boundary_name(name: &str) -> Option<Boundary> {
    let mut parts = name.split('$');
    let kind = parts.next()?;
    let edge = parts.next()?;
    let start = match edge {
        "start" => true,
        "stop" => false,
        _ => return None,
    };
    let segment = parts.next()?.to_string();
    match kind {
        "segment" => {
            if parts.next().is_some() {
                return None;
            }
            Some(Boundary { segment, section: None, start })
        }
        "section" => {
            let section = parts.next()?.to_string();
            if parts.next().is_some() {
                return None;
            }
            Some(Boundary { segment, section: Some(section), start })
        }
        _ => None,
    }
}

fn dice_slice_for(object: &Object, sect: &crate::mach::load_command::Section64) -> crate::atom::Slice {
    // data-in-code offsets are from the start of the file's __TEXT content,
    // which for MH_OBJECT is the section's file offset range
    let lo = object
        .dice
        .iter()
        .position(|d| (d.offset as u64) >= sect.offset as u64 && (d.offset as u64) < sect.offset as u64 + sect.size)
        .unwrap_or(object.dice.len());
    let hi = object.dice[lo..]
        .iter()
        .position(|d| (d.offset as u64) >= sect.offset as u64 + sect.size)
        .map(|p| lo + p)
        .unwrap_or(object.dice.len());
    crate::atom::Slice::new(lo, hi - lo)
}

fn file_mtime(path: &Path) -> u64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn placeholder_archive() -> Archive {
    Archive {
        path: PathBuf::new(),
        data: Vec::new(),
        members: Default::default(),
        toc: Default::default(),
        parsed: Default::default(),
        force_load: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mach::symbols::{N_EXT, N_PEXT, N_SECT, N_UNDF};

    fn nlist(n_type: u8, n_desc: u16, n_value: u64) -> Nlist64 {
        Nlist64 { n_strx: 0, n_type, n_sect: 0, n_desc, n_value }
    }

    #[test]
    fn rank_lattice() {
        assert_eq!(rank(&Nlist64 { n_strx: 0, n_type: N_SECT | N_EXT, n_sect: 1, n_desc: 0, n_value: 0 }), Rank::Strong);
        assert_eq!(
            rank(&Nlist64 { n_strx: 0, n_type: N_SECT | N_EXT, n_sect: 1, n_desc: N_WEAK_DEF, n_value: 0 }),
            Rank::Weak
        );
        assert_eq!(
            rank(&Nlist64 { n_strx: 0, n_type: N_SECT | N_EXT | N_PEXT, n_sect: 1, n_desc: 0, n_value: 0 }),
            Rank::Weak
        );
        assert_eq!(rank(&nlist(N_UNDF | N_EXT, 0, 16)), Rank::Tentative);
        assert_eq!(rank(&nlist(N_UNDF | N_EXT, 0, 0)), Rank::Undef);
    }

    #[test]
    fn boundary_names() {
        let b = parse_boundary_name("segment$start$__DATA").unwrap();
        assert_eq!(b.segment, "__DATA");
        assert!(b.start && b.section.is_none());
        let b = parse_boundary_name("section$stop$__DATA$__mystuff").unwrap();
        assert_eq!(b.section.as_deref(), Some("__mystuff"));
        assert!(!b.start);
        assert!(parse_boundary_name("_main").is_none());
        assert!(parse_boundary_name("segment$middle$__DATA").is_none());
    }
}
