//! End-to-end links over hand-assembled inputs: a relocatable object
//! builder, text-stub dylibs, and an output reader round-trip the whole
//! pipeline without any toolchain on the machine.

use std::path::PathBuf;

use scroll::{Pread, Pwrite};

use boggart::dylib::parse_export_trie;
use boggart::linkedit::{interpret_bind_stream, interpret_rebase_stream};
use boggart::mach::header::{Header64, MH_EXECUTE, MH_MAGIC_64, SIZEOF_HEADER_64};
use boggart::mach::load_command as lc;
use boggart::mach::relocation::*;
use boggart::mach::symbols::{Nlist64, N_EXT, N_SECT, N_UNDF, N_WEAK_DEF};
use boggart::mach::constants::*;
use boggart::options::{LinkInput, UndefinedTreatment};
use boggart::{Linker, Options, OutputMode, Target};

// ----------------------------------------------------------------------
// test-object builder
// ----------------------------------------------------------------------

struct SectSpec {
    segname: &'static str,
    sectname: &'static str,
    flags: u32,
    align: u32,
    bytes: Vec<u8>,
    /// claimed size for sections whose bytes stay off-disk (layout-only
    /// tests); 0 means "use bytes.len()"
    claimed_size: u64,
    relocs: Vec<RelocSpec>,
}

struct RelocSpec {
    offset: i32,
    /// index into the symbol list below
    symbol: u32,
    pcrel: bool,
    length: u8,
    r_type: u8,
}

struct SymSpec {
    name: &'static str,
    n_type: u8,
    n_sect: u8,
    n_desc: u16,
    n_value: u64,
}

fn defined(name: &'static str, n_sect: u8, n_value: u64) -> SymSpec {
    SymSpec { name, n_type: N_SECT | N_EXT, n_sect, n_desc: 0, n_value }
}

fn undef(name: &'static str) -> SymSpec {
    SymSpec { name, n_type: N_UNDF | N_EXT, n_sect: 0, n_desc: 0, n_value: 0 }
}

/// Serialize a minimal MH_OBJECT: one LC_SEGMENT_64 with the given
/// sections, one LC_SYMTAB.
fn build_object(cputype: u32, sections: &[SectSpec], symbols: &[SymSpec]) -> Vec<u8> {
    let seg_cmd_size = lc::SIZEOF_SEGMENT_COMMAND_64 + sections.len() * lc::SIZEOF_SECTION_64;
    let sizeofcmds = seg_cmd_size + lc::SIZEOF_SYMTAB_COMMAND;
    let data_start = SIZEOF_HEADER_64 + sizeofcmds;

    // place section contents, then relocations, then the symtab
    let mut cursor = data_start;
    let mut sect_offsets = Vec::new();
    let mut sect_addrs = Vec::new();
    let mut addr = 0u64;
    for sect in sections {
        let align = 1u64 << sect.align;
        addr = (addr + align - 1) & !(align - 1);
        sect_addrs.push(addr);
        let size = if sect.claimed_size != 0 { sect.claimed_size } else { sect.bytes.len() as u64 };
        if sect.bytes.is_empty() {
            sect_offsets.push(0u32);
        } else {
            cursor = (cursor + 7) & !7;
            sect_offsets.push(cursor as u32);
            cursor += sect.bytes.len();
        }
        addr += size;
    }
    let mut reloc_offsets = Vec::new();
    for sect in sections {
        cursor = (cursor + 7) & !7;
        reloc_offsets.push(cursor as u32);
        cursor += sect.relocs.len() * SIZEOF_RELOCATION_INFO;
    }
    let symoff = (cursor + 7) & !7;
    let stroff = symoff + symbols.len() * 16;

    let mut strtab: Vec<u8> = vec![0];
    let strx: Vec<u32> = symbols
        .iter()
        .map(|s| {
            let off = strtab.len() as u32;
            strtab.extend_from_slice(s.name.as_bytes());
            strtab.push(0);
            off
        })
        .collect();

    let mut out = vec![0u8; stroff + strtab.len()];

    let header = Header64 {
        magic: MH_MAGIC_64,
        cputype,
        cpusubtype: 0,
        filetype: boggart::mach::header::MH_OBJECT,
        ncmds: 2,
        sizeofcmds: sizeofcmds as u32,
        flags: 0,
        reserved: 0,
    };
    out.pwrite_with(header, 0, scroll::LE).unwrap();

    let segment = lc::SegmentCommand64 {
        cmd: lc::LC_SEGMENT_64,
        cmdsize: seg_cmd_size as u32,
        segname: lc::fixed_from_str(""),
        vmaddr: 0,
        vmsize: addr,
        fileoff: data_start as u64,
        filesize: (symoff - data_start) as u64,
        maxprot: 7,
        initprot: 7,
        nsects: sections.len() as u32,
        flags: 0,
    };
    out.pwrite_with(segment, SIZEOF_HEADER_64, scroll::LE).unwrap();

    let mut lc_off = SIZEOF_HEADER_64 + lc::SIZEOF_SEGMENT_COMMAND_64;
    for (i, sect) in sections.iter().enumerate() {
        let size = if sect.claimed_size != 0 { sect.claimed_size } else { sect.bytes.len() as u64 };
        let header = lc::Section64 {
            sectname: lc::fixed_from_str(sect.sectname),
            segname: lc::fixed_from_str(sect.segname),
            addr: sect_addrs[i],
            size,
            offset: sect_offsets[i],
            align: sect.align,
            reloff: if sect.relocs.is_empty() { 0 } else { reloc_offsets[i] },
            nreloc: sect.relocs.len() as u32,
            flags: sect.flags,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
        };
        out.pwrite_with(header, lc_off, scroll::LE).unwrap();
        lc_off += lc::SIZEOF_SECTION_64;
    }
    let symtab = lc::SymtabCommand {
        cmd: lc::LC_SYMTAB,
        cmdsize: lc::SIZEOF_SYMTAB_COMMAND as u32,
        symoff: symoff as u32,
        nsyms: symbols.len() as u32,
        stroff: stroff as u32,
        strsize: strtab.len() as u32,
    };
    out.pwrite_with(symtab, lc_off, scroll::LE).unwrap();

    for (i, sect) in sections.iter().enumerate() {
        if !sect.bytes.is_empty() {
            let off = sect_offsets[i] as usize;
            out[off..off + sect.bytes.len()].copy_from_slice(&sect.bytes);
        }
        let mut reloc_off = reloc_offsets[i] as usize;
        for reloc in &sect.relocs {
            let info = RelocationInfo {
                r_address: reloc.offset,
                r_info: RelocationInfo::pack(reloc.symbol, reloc.pcrel, reloc.length, true, reloc.r_type),
            };
            out.pwrite_with(info, reloc_off, scroll::LE).unwrap();
            reloc_off += SIZEOF_RELOCATION_INFO;
        }
    }
    for (i, sym) in symbols.iter().enumerate() {
        let nlist = Nlist64 {
            n_strx: strx[i],
            n_type: sym.n_type,
            n_sect: sym.n_sect,
            n_desc: sym.n_desc,
            n_value: sym.n_value,
        };
        out.pwrite_with(nlist, symoff + i * 16, scroll::LE).unwrap();
    }
    out[stroff..stroff + strtab.len()].copy_from_slice(&strtab);
    out
}

const LIBSYSTEM_TBD: &str = "--- !tapi-tbd
tbd-version:     4
targets:         [ x86_64-macos, arm64-macos ]
install-name:    '/usr/lib/libSystem.B.dylib'
current-version: 1319
compatibility-version: 1
exports:
  - targets:   [ x86_64-macos, arm64-macos ]
    symbols:   [ _puts, _printf, dyld_stub_binder ]
...
";

// ----------------------------------------------------------------------
// output reader
// ----------------------------------------------------------------------

struct Output {
    data: Vec<u8>,
    header: Header64,
    segments: Vec<lc::SegmentCommand64>,
    sections: Vec<lc::Section64>,
    dyld_info: Option<lc::DyldInfoCommand>,
    symtab: Option<lc::SymtabCommand>,
    dysymtab: Option<lc::DysymtabCommand>,
    main: Option<lc::EntryPointCommand>,
    codesig: Option<lc::LinkeditDataCommand>,
    uuid_offset: Option<usize>,
}

impl Output {
    fn parse(data: Vec<u8>) -> Output {
        let header: Header64 = data.pread_with(0, scroll::LE).unwrap();
        assert_eq!(header.magic, MH_MAGIC_64);
        let mut segments = Vec::new();
        let mut sections = Vec::new();
        let mut dyld_info = None;
        let mut symtab = None;
        let mut dysymtab = None;
        let mut main = None;
        let mut codesig = None;
        let mut uuid_offset = None;
        let mut offset = SIZEOF_HEADER_64;
        for _ in 0..header.ncmds {
            let cmd: u32 = data.pread_with(offset, scroll::LE).unwrap();
            let cmdsize: u32 = data.pread_with(offset + 4, scroll::LE).unwrap();
            match cmd {
                lc::LC_SEGMENT_64 => {
                    let seg: lc::SegmentCommand64 = data.pread_with(offset, scroll::LE).unwrap();
                    let mut sect_off = offset + lc::SIZEOF_SEGMENT_COMMAND_64;
                    for _ in 0..seg.nsects {
                        sections.push(data.pread_with(sect_off, scroll::LE).unwrap());
                        sect_off += lc::SIZEOF_SECTION_64;
                    }
                    segments.push(seg);
                }
                lc::LC_DYLD_INFO_ONLY => {
                    dyld_info = Some(data.pread_with(offset, scroll::LE).unwrap());
                }
                lc::LC_SYMTAB => symtab = Some(data.pread_with(offset, scroll::LE).unwrap()),
                lc::LC_DYSYMTAB => dysymtab = Some(data.pread_with(offset, scroll::LE).unwrap()),
                lc::LC_MAIN => main = Some(data.pread_with(offset, scroll::LE).unwrap()),
                lc::LC_CODE_SIGNATURE => {
                    codesig = Some(data.pread_with(offset, scroll::LE).unwrap());
                }
                lc::LC_UUID => uuid_offset = Some(offset + 8),
                _ => {}
            }
            offset += cmdsize as usize;
        }
        Output {
            data,
            header,
            segments,
            sections,
            dyld_info,
            symtab,
            dysymtab,
            main,
            codesig,
            uuid_offset,
        }
    }

    fn section(&self, segname: &str, sectname: &str) -> Option<&lc::Section64> {
        self.sections
            .iter()
            .find(|s| s.seg_name() == segname && s.sect_name() == sectname)
    }

    fn segment(&self, name: &str) -> Option<&lc::SegmentCommand64> {
        self.segments.iter().find(|s| s.name() == name)
    }

    fn symbols(&self) -> Vec<(String, Nlist64)> {
        let Some(symtab) = self.symtab else { return Vec::new() };
        (0..symtab.nsyms as usize)
            .map(|i| {
                let nlist: Nlist64 = self
                    .data
                    .pread_with(symtab.symoff as usize + i * 16, scroll::LE)
                    .unwrap();
                let name: &str = self
                    .data
                    .pread(symtab.stroff as usize + nlist.n_strx as usize)
                    .unwrap();
                (name.to_string(), nlist)
            })
            .collect()
    }

    fn symbol(&self, name: &str) -> Option<Nlist64> {
        self.symbols().into_iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    fn rebases(&self) -> Vec<(u32, u64)> {
        let info = self.dyld_info.unwrap();
        let bytes =
            &self.data[info.rebase_off as usize..(info.rebase_off + info.rebase_size) as usize];
        interpret_rebase_stream(bytes).unwrap()
    }

    fn binds(&self) -> Vec<(u32, u64, i64, String, i64)> {
        let info = self.dyld_info.unwrap();
        let bytes = &self.data[info.bind_off as usize..(info.bind_off + info.bind_size) as usize];
        interpret_bind_stream(bytes).unwrap()
    }

    fn lazy_binds(&self) -> Vec<(u32, u64, i64, String, i64)> {
        let info = self.dyld_info.unwrap();
        let bytes = &self.data
            [info.lazy_bind_off as usize..(info.lazy_bind_off + info.lazy_bind_size) as usize];
        interpret_bind_stream(bytes).unwrap()
    }

    fn exports(&self) -> Vec<(String, u64, u64)> {
        let info = self.dyld_info.unwrap();
        if info.export_size == 0 {
            return Vec::new();
        }
        let bytes =
            &self.data[info.export_off as usize..(info.export_off + info.export_size) as usize];
        parse_export_trie(bytes)
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.flags, e.offset))
            .collect()
    }
}

// ----------------------------------------------------------------------
// harness plumbing
// ----------------------------------------------------------------------

fn temp_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("boggart-tests-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(name)
}

fn write_input(name: &str, bytes: &[u8]) -> PathBuf {
    let path = temp_path(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

fn x86_options(out: &str) -> Options {
    Options::new(Target::macos_x86_64(), OutputMode::Exe, temp_path(out))
}

fn hello_object() -> Vec<u8> {
    // _main: push %rbp; call _puts; xor %eax,%eax; pop %rbp; ret
    let text = vec![0x55, 0xe8, 0, 0, 0, 0, 0x31, 0xc0, 0x5d, 0xc3];
    build_object(
        boggart::mach::constants::cputype::CPU_TYPE_X86_64,
        &[SectSpec {
            segname: SEG_TEXT,
            sectname: SECT_TEXT,
            flags: S_REGULAR | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
            align: 4,
            bytes: text,
            claimed_size: 0,
            relocs: vec![RelocSpec {
                offset: 2,
                symbol: 1,
                pcrel: true,
                length: 2,
                r_type: X86_64_RELOC_BRANCH,
            }],
        }],
        &[defined("_main", 1, 0), undef("_puts")],
    )
}

// ----------------------------------------------------------------------
// scenarios
// ----------------------------------------------------------------------

#[test]
fn hello_world_x86_64() {
    let obj = write_input("hello.o", &hello_object());
    let tbd = write_input("libSystem.tbd", LIBSYSTEM_TBD.as_bytes());

    let mut options = x86_options("hello");
    options.positionals.push(LinkInput::new(obj));
    options.positionals.push(LinkInput::new(tbd));
    Linker::new(options.clone()).link().unwrap();

    let out = Output::parse(std::fs::read(&options.emit).unwrap());
    assert_eq!(out.header.filetype, MH_EXECUTE);

    // one stub, one lazy pointer, one lazy-bind program
    let stubs = out.section(SEG_TEXT, SECT_STUBS).expect("__stubs");
    assert_eq!(stubs.size, 6);
    assert_eq!(stubs.reserved2, 6);
    let la = out.section(SEG_DATA, SECT_LA_SYMBOL_PTR).expect("__la_symbol_ptr");
    assert_eq!(la.size, 8);
    let lazy = out.lazy_binds();
    assert_eq!(lazy.len(), 1);
    assert_eq!(lazy[0].3, "_puts");
    assert_eq!(lazy[0].2, 1, "libSystem is ordinal 1");

    // entryoff points at _main
    let text_seg = out.segment(SEG_TEXT).unwrap();
    let main_sym = out.symbol("_main").expect("_main in symtab");
    assert_eq!(out.main.unwrap().entryoff, main_sym.n_value - text_seg.vmaddr);

    // the call displacement lands on the stub
    let text = out.section(SEG_TEXT, SECT_TEXT).unwrap();
    let call_field = text.offset as usize + 2;
    let disp = i32::from_le_bytes(out.data[call_field..call_field + 4].try_into().unwrap());
    let source = text.addr + 2;
    assert_eq!((source as i64 + 4 + disp as i64) as u64, stubs.addr);

    // the stub jumps through the lazy pointer
    let stub_field = stubs.offset as usize + 2;
    let stub_disp = i32::from_le_bytes(out.data[stub_field..stub_field + 4].try_into().unwrap());
    assert_eq!((stubs.addr as i64 + 6 + stub_disp as i64) as u64, la.addr);

    // the lazy pointer starts out pointing into __stub_helper, and is both
    // rebased and lazily bound
    let helper = out.section(SEG_TEXT, SECT_STUB_HELPER).unwrap();
    let la_value = u64::from_le_bytes(
        out.data[la.offset as usize..la.offset as usize + 8].try_into().unwrap(),
    );
    assert!(la_value >= helper.addr && la_value < helper.addr + helper.size);
    let data_seg = out.segment(SEG_DATA).unwrap();
    assert!(out.rebases().contains(&(
        out.segments.iter().position(|s| s.name() == SEG_DATA).unwrap() as u32,
        la.addr - data_seg.vmaddr
    )));

    // dyld_stub_binder came in through the GOT, eagerly bound
    let binds = out.binds();
    assert_eq!(binds.len(), 1);
    assert_eq!(binds[0].3, "dyld_stub_binder");

    // symtab invariants
    let dysymtab = out.dysymtab.unwrap();
    let symtab = out.symtab.unwrap();
    assert_eq!(
        dysymtab.nlocalsym + dysymtab.nextdefsym + dysymtab.nundefsym,
        symtab.nsyms
    );
    assert_eq!(dysymtab.nindirectsyms, 2 * 1 + 1);

    // segments page-aligned, ascending
    for pair in out.segments.windows(2) {
        assert!(pair[1].vmaddr >= pair[0].vmaddr + pair[0].vmsize);
    }
    for seg in &out.segments {
        if seg.name() != SEG_PAGEZERO {
            assert_eq!(seg.fileoff % 0x1000, 0);
            assert_eq!(seg.filesize % 0x1000, 0);
        }
    }

    // exports cover _main and the header marker
    let exports = out.exports();
    assert!(exports.iter().any(|(n, _, off)| {
        n == "_main" && text_seg.vmaddr + off == main_sym.n_value
    }));
    assert!(exports.iter().any(|(n, _, _)| n == "__mh_execute_header"));
}

#[test]
fn common_symbols_merge_to_largest() {
    // two tentative definitions of _x: sizes 4 and 16, both align 2^2
    let obj_a = build_object(
        cputype::CPU_TYPE_X86_64,
        &[SectSpec {
            segname: SEG_TEXT,
            sectname: SECT_TEXT,
            flags: S_REGULAR | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
            align: 4,
            bytes: vec![0xc3],
            claimed_size: 0,
            relocs: vec![],
        }],
        &[
            defined("_main", 1, 0),
            SymSpec { name: "_x", n_type: N_UNDF | N_EXT, n_sect: 0, n_desc: 2 << 8, n_value: 4 },
        ],
    );
    let obj_b = build_object(
        cputype::CPU_TYPE_X86_64,
        &[],
        &[SymSpec { name: "_x", n_type: N_UNDF | N_EXT, n_sect: 0, n_desc: 2 << 8, n_value: 16 }],
    );
    let a = write_input("common_a.o", &obj_a);
    let b = write_input("common_b.o", &obj_b);

    let mut options = x86_options("common");
    options.positionals.push(LinkInput::new(a));
    options.positionals.push(LinkInput::new(b));
    Linker::new(options.clone()).link().unwrap();

    let out = Output::parse(std::fs::read(&options.emit).unwrap());
    let common = out.section(SEG_DATA, SECT_COMMON).expect("__common");
    assert_eq!(common.size, 16);
    assert_eq!(common.align, 2);
    assert_eq!(common.flags & SECTION_TYPE, S_ZEROFILL);
    let x = out.symbol("_x").expect("_x resolved");
    assert_eq!(x.n_value, common.addr);
    assert!(x.is_ext() && x.is_sect());
}

#[test]
fn weak_definitions_coalesce_to_first() {
    let weak_foo = |with_main: bool| {
        let mut syms = vec![SymSpec {
            name: "__Z3foov",
            n_type: N_SECT | N_EXT,
            n_sect: 1,
            n_desc: N_WEAK_DEF,
            n_value: if with_main { 1 } else { 0 },
        }];
        if with_main {
            syms.insert(0, defined("_main", 1, 0));
        }
        build_object(
            cputype::CPU_TYPE_X86_64,
            &[SectSpec {
                segname: SEG_TEXT,
                sectname: SECT_TEXT,
                flags: S_REGULAR | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
                align: 4,
                bytes: vec![0xc3, 0xc3],
                claimed_size: 0,
                relocs: vec![],
            }],
            &syms,
        )
    };
    let a = write_input("weak_a.o", &weak_foo(true));
    let b = write_input("weak_b.o", &weak_foo(false));

    let mut options = x86_options("weak");
    options.positionals.push(LinkInput::new(a));
    options.positionals.push(LinkInput::new(b));
    options.dead_strip = true;
    Linker::new(options.clone()).link().unwrap();

    let out = Output::parse(std::fs::read(&options.emit).unwrap());
    let symbols = out.symbols();
    let foos: Vec<_> = symbols.iter().filter(|(n, _)| n == "__Z3foov").collect();
    assert_eq!(foos.len(), 1, "one surviving weak definition");
    assert!(foos[0].1.is_weak_def());
    assert_ne!(out.header.flags & boggart::mach::header::MH_WEAK_DEFINES, 0);
    // the first object's copy won: its __Z3foov sits one byte into __text
    let text = out.section(SEG_TEXT, SECT_TEXT).unwrap();
    assert_eq!(foos[0].1.n_value, text.addr + 1);
    // no dyld fixups for a coalesced weak def
    assert!(out.binds().iter().all(|(_, _, _, name, _)| name != "__Z3foov"));
    assert!(out.lazy_binds().is_empty());
    // dead-strip dropped the losing copy: __text holds only object A's atom
    assert_eq!(text.size, 2);
}

#[test]
fn dynamic_lookup_binds_with_flat_ordinal() {
    // _main calls _missing, which no dylib exports
    let text = vec![0x55, 0xe8, 0, 0, 0, 0, 0x5d, 0xc3];
    let obj = build_object(
        cputype::CPU_TYPE_X86_64,
        &[SectSpec {
            segname: SEG_TEXT,
            sectname: SECT_TEXT,
            flags: S_REGULAR | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
            align: 4,
            bytes: text,
            claimed_size: 0,
            relocs: vec![RelocSpec {
                offset: 2,
                symbol: 1,
                pcrel: true,
                length: 2,
                r_type: X86_64_RELOC_BRANCH,
            }],
        }],
        &[defined("_main", 1, 0), undef("_missing")],
    );
    let obj = write_input("flat.o", &obj);
    let tbd = write_input("libSystem_flat.tbd", LIBSYSTEM_TBD.as_bytes());

    let mut options = x86_options("flat");
    options.positionals.push(LinkInput::new(obj));
    options.positionals.push(LinkInput::new(tbd));
    options.undefined_treatment = UndefinedTreatment::DynamicLookup;
    Linker::new(options.clone()).link().unwrap();

    let out = Output::parse(std::fs::read(&options.emit).unwrap());
    let lazy = out.lazy_binds();
    let missing: Vec<_> = lazy.iter().filter(|(_, _, _, n, _)| n == "_missing").collect();
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].2, -2, "BIND_SPECIAL_DYLIB_FLAT_LOOKUP");
}

#[test]
fn got_load_relaxes_to_lea_for_local_targets() {
    // _main: mov _val@GOTPCREL(%rip), %rax ; ret
    let text = vec![0x48, 0x8b, 0x05, 0, 0, 0, 0, 0xc3];
    let obj = build_object(
        cputype::CPU_TYPE_X86_64,
        &[
            SectSpec {
                segname: SEG_TEXT,
                sectname: SECT_TEXT,
                flags: S_REGULAR | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
                align: 4,
                bytes: text,
                claimed_size: 0,
                relocs: vec![RelocSpec {
                    offset: 3,
                    symbol: 1,
                    pcrel: true,
                    length: 2,
                    r_type: X86_64_RELOC_GOT_LOAD,
                }],
            },
            SectSpec {
                segname: SEG_DATA,
                sectname: SECT_DATA,
                flags: S_REGULAR,
                align: 3,
                bytes: vec![0x2a, 0, 0, 0, 0, 0, 0, 0],
                claimed_size: 0,
                relocs: vec![],
            },
        ],
        &[defined("_main", 1, 0), defined("_val", 2, 8)],
    );
    let obj = write_input("gotload.o", &obj);

    let mut options = x86_options("gotload");
    options.positionals.push(LinkInput::new(obj));
    Linker::new(options.clone()).link().unwrap();

    let out = Output::parse(std::fs::read(&options.emit).unwrap());
    let text = out.section(SEG_TEXT, SECT_TEXT).unwrap();
    // mov became lea
    assert_eq!(out.data[text.offset as usize + 1], 0x8d);
    // and the displacement reaches _val directly, with no GOT in sight
    let disp = i32::from_le_bytes(
        out.data[text.offset as usize + 3..text.offset as usize + 7].try_into().unwrap(),
    );
    let val = out.symbol("_val").unwrap();
    assert_eq!((text.addr + 3 + 4).wrapping_add(disp as u64), val.n_value);
    assert!(out.section(SEG_DATA_CONST, SECT_GOT).is_none());
}

#[test]
fn aarch64_hello_is_signed_and_stubbed() {
    // _main: bl _puts ; ret
    let mut text = Vec::new();
    text.extend_from_slice(&0x9400_0000u32.to_le_bytes());
    text.extend_from_slice(&0xd65f_03c0u32.to_le_bytes());
    let obj = build_object(
        cputype::CPU_TYPE_ARM64,
        &[SectSpec {
            segname: SEG_TEXT,
            sectname: SECT_TEXT,
            flags: S_REGULAR | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
            align: 2,
            bytes: text,
            claimed_size: 0,
            relocs: vec![RelocSpec {
                offset: 0,
                symbol: 1,
                pcrel: true,
                length: 2,
                r_type: ARM64_RELOC_BRANCH26,
            }],
        }],
        &[defined("_main", 1, 0), undef("_puts")],
    );
    let obj = write_input("hello_arm.o", &obj);
    let tbd = write_input("libSystem_arm.tbd", LIBSYSTEM_TBD.as_bytes());

    let mut options = Options::new(Target::macos_aarch64(), OutputMode::Exe, temp_path("hello_arm"));
    options.positionals.push(LinkInput::new(obj));
    options.positionals.push(LinkInput::new(tbd));
    Linker::new(options.clone()).link().unwrap();

    let out = Output::parse(std::fs::read(&options.emit).unwrap());

    // 16K pages
    for seg in &out.segments {
        if seg.name() != SEG_PAGEZERO {
            assert_eq!(seg.fileoff % 0x4000, 0);
        }
    }

    // the bl displacement lands on the stub, which is an adrp/ldr/br triple
    let text = out.section(SEG_TEXT, SECT_TEXT).unwrap();
    let stubs = out.section(SEG_TEXT, SECT_STUBS).unwrap();
    assert_eq!(stubs.size, 12);
    assert_eq!(stubs.reserved2, 12);
    let bl = u32::from_le_bytes(
        out.data[text.offset as usize..text.offset as usize + 4].try_into().unwrap(),
    );
    assert_eq!(bl & 0xfc00_0000, 0x9400_0000, "still a bl");
    let disp = (((bl & 0x03ff_ffff) << 6) as i32 >> 6) as i64 * 4;
    assert_eq!((text.addr as i64 + disp) as u64, stubs.addr);
    let stub_adrp = u32::from_le_bytes(
        out.data[stubs.offset as usize..stubs.offset as usize + 4].try_into().unwrap(),
    );
    assert_eq!(stub_adrp & 0x9f00_001f, 0x9000_0010, "adrp x16");

    // arm64 macOS output is ad-hoc signed
    let codesig = out.codesig.expect("LC_CODE_SIGNATURE");
    let magic = u32::from_be_bytes(
        out.data[codesig.dataoff as usize..codesig.dataoff as usize + 4].try_into().unwrap(),
    );
    assert_eq!(magic, 0xfade0cc0);
    // the signature closes out __LINKEDIT, with only page padding after it
    let sig_end = codesig.dataoff as usize + codesig.datasize as usize;
    assert!(sig_end <= out.data.len());
    assert!(out.data.len() - sig_end < 0x4000);
    assert!(out.data[sig_end..].iter().all(|&b| b == 0));
}

#[test]
fn aarch64_long_branches_get_thunks() {
    // 20 objects of 10 MiB of claimed code; the first branches to a symbol
    // defined in the last, ~190 MiB away
    let mut options = Options::new(Target::macos_aarch64(), OutputMode::Exe, temp_path("thunks"));
    options.entry = "_start".to_string();
    let mut linker = Linker::new(options);

    const CHUNK: u64 = 10 * 1024 * 1024;
    for i in 0..20 {
        let mut syms = Vec::new();
        let mut relocs = Vec::new();
        if i == 0 {
            syms.push(defined("_start", 1, 0));
            relocs.push(RelocSpec {
                offset: 0,
                symbol: 1,
                pcrel: true,
                length: 2,
                r_type: ARM64_RELOC_BRANCH26,
            });
            syms.push(undef("_far"));
        } else if i == 19 {
            syms.push(defined("_far", 1, 0));
        }
        let bytes = build_object(
            cputype::CPU_TYPE_ARM64,
            &[SectSpec {
                segname: SEG_TEXT,
                sectname: SECT_TEXT,
                flags: S_REGULAR | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
                align: 2,
                bytes: Vec::new(),
                claimed_size: CHUNK,
                relocs,
            }],
            &syms,
        );
        let object = boggart::object::Object::parse(
            PathBuf::from(format!("chunk{i}.o")),
            None,
            bytes,
            &Target::macos_aarch64(),
            0,
        )
        .unwrap();
        linker.add_object(object).unwrap();
    }

    linker.resolve().unwrap();
    boggart::synthetic::create_tentative_atoms(&mut linker);
    boggart::synthetic::create_boundary_atoms(&mut linker);
    boggart::reloc::scan(&mut linker).unwrap();
    boggart::layout::allocate(&mut linker).unwrap();

    assert!(!linker.thunks.is_empty(), "a 200 MiB text section needs thunks");
    let far = linker.global_by_name("_far").unwrap();
    let thunk = linker
        .thunks
        .iter()
        .find_map(|group| group.targets.get(&far))
        .copied()
        .expect("a thunk for the far target");

    // the branch site reaches its thunk, even though the real target is out
    // of range
    let start = linker.global_by_name("_start").unwrap();
    let source = linker.symbols[start as usize].value;
    let target = linker.symbols[far as usize].value;
    let direct = target as i64 - source as i64;
    assert!(direct >= 1 << 27, "the direct branch really is out of range");
    let thunk_addr = linker.atom_addr(thunk);
    let via_thunk = thunk_addr as i64 - source as i64;
    assert!((-(1 << 27)..(1 << 27)).contains(&via_thunk));
}

#[test]
fn dylib_exports_round_trip_through_the_trie() {
    let obj = build_object(
        cputype::CPU_TYPE_X86_64,
        &[SectSpec {
            segname: SEG_TEXT,
            sectname: SECT_TEXT,
            flags: S_REGULAR | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
            align: 4,
            bytes: vec![0xc3, 0xc3, 0xc3],
            claimed_size: 0,
            relocs: vec![],
        }],
        &[
            defined("__ZN3foo3barEv", 1, 0),
            defined("__ZN3foo3bazEv", 1, 1),
            defined("_frob", 1, 2),
        ],
    );
    let obj = write_input("lib.o", &obj);

    let mut options = Options::new(
        Target::macos_x86_64(),
        OutputMode::Lib,
        temp_path("libfoo.dylib"),
    );
    options.install_name = Some("/usr/local/lib/libfoo.dylib".to_string());
    options.positionals.push(LinkInput::new(obj));
    Linker::new(options.clone()).link().unwrap();

    let out = Output::parse(std::fs::read(&options.emit).unwrap());
    assert_eq!(out.header.filetype, boggart::mach::header::MH_DYLIB);
    assert!(out.segment(SEG_PAGEZERO).is_none(), "libraries have no page zero");

    let text_seg = out.segment(SEG_TEXT).unwrap();
    let mut exports = out.exports();
    exports.sort();
    let names: Vec<&str> = exports.iter().map(|(n, _, _)| n.as_str()).collect();
    assert_eq!(names, vec!["__ZN3foo3barEv", "__ZN3foo3bazEv", "_frob"]);
    for (name, _, offset) in &exports {
        let sym = out.symbol(name).unwrap();
        assert_eq!(text_seg.vmaddr + offset, sym.n_value);
    }

    // the output parses back as a dylib input, exports intact
    let reparsed = boggart::dylib::Dylib::parse_binary(options.emit.clone(), &out.data).unwrap();
    assert_eq!(reparsed.install_name, "/usr/local/lib/libfoo.dylib");
    assert!(reparsed.exports_symbol("_frob"));
}

#[test]
fn identical_links_differ_only_in_uuid() {
    let obj = write_input("det.o", &hello_object());
    let tbd = write_input("libSystem_det.tbd", LIBSYSTEM_TBD.as_bytes());

    let run = |out_name: &str| {
        let mut options = x86_options(out_name);
        options.positionals.push(LinkInput::new(obj.clone()));
        options.positionals.push(LinkInput::new(tbd.clone()));
        Linker::new(options.clone()).link().unwrap();
        Output::parse(std::fs::read(&options.emit).unwrap())
    };
    let mut first = run("det1");
    let mut second = run("det2");

    let off1 = first.uuid_offset.unwrap();
    let off2 = second.uuid_offset.unwrap();
    assert_eq!(off1, off2);
    first.data[off1..off1 + 16].fill(0);
    second.data[off2..off2 + 16].fill(0);
    assert_eq!(first.data, second.data, "byte-identical outside the UUID");
}

#[test]
fn duplicate_strong_definitions_are_collected() {
    let make = |name: &'static str| {
        build_object(
            cputype::CPU_TYPE_X86_64,
            &[SectSpec {
                segname: SEG_TEXT,
                sectname: SECT_TEXT,
                flags: S_REGULAR | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
                align: 4,
                bytes: vec![0xc3],
                claimed_size: 0,
                relocs: vec![],
            }],
            &[defined("_main", 1, 0), defined(name, 1, 0)],
        )
    };
    let a = write_input("dup_a.o", &make("_clash"));
    let b = write_input("dup_b.o", &make("_clash"));

    let mut options = x86_options("dup");
    options.positionals.push(LinkInput::new(a));
    options.positionals.push(LinkInput::new(b));
    let err = Linker::new(options).link().unwrap_err();
    match err {
        boggart::Error::MultipleSymbolDefinitions(dups) => {
            // _main and _clash both collide, reported together
            assert_eq!(dups.len(), 2);
            assert!(dups.iter().any(|d| d.name == "_clash"));
            assert!(dups.iter().any(|d| d.name == "_main"));
        }
        other => panic!("expected duplicate-definition error, got {other}"),
    }
}

#[test]
fn undefined_reference_reports_the_referencing_object() {
    let obj = write_input("undef.o", &hello_object());
    let mut options = x86_options("undef");
    options.positionals.push(LinkInput::new(obj));
    let err = Linker::new(options).link().unwrap_err();
    match err {
        boggart::Error::UndefinedSymbolReference(refs) => {
            assert!(refs.iter().any(|r| r.name == "_puts"));
        }
        other => panic!("expected undefined-symbol error, got {other}"),
    }
}

#[test]
fn archive_members_load_lazily_on_reference() {
    // libputs.a defines _puts in a member; only referenced members load
    let puts_obj = build_object(
        cputype::CPU_TYPE_X86_64,
        &[SectSpec {
            segname: SEG_TEXT,
            sectname: SECT_TEXT,
            flags: S_REGULAR | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
            align: 4,
            bytes: vec![0x31, 0xc0, 0xc3],
            claimed_size: 0,
            relocs: vec![],
        }],
        &[defined("_puts", 1, 0)],
    );
    let unused_obj = build_object(
        cputype::CPU_TYPE_X86_64,
        &[SectSpec {
            segname: SEG_TEXT,
            sectname: SECT_TEXT,
            flags: S_REGULAR | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
            align: 4,
            bytes: vec![0xcc],
            claimed_size: 0,
            relocs: vec![],
        }],
        &[defined("_unused", 1, 0)],
    );
    let archive = build_archive(&[("puts.o", &puts_obj, &["_puts"]), ("unused.o", &unused_obj, &["_unused"])]);
    let lib = write_input("libputs.a", &archive);
    let obj = write_input("uses_puts.o", &hello_object());

    let mut options = x86_options("static_puts");
    options.positionals.push(LinkInput::new(obj));
    options.positionals.push(LinkInput::new(lib));
    Linker::new(options.clone()).link().unwrap();

    let out = Output::parse(std::fs::read(&options.emit).unwrap());
    // _puts resolved statically: no stubs, no imports
    assert!(out.section(SEG_TEXT, SECT_STUBS).is_none());
    assert!(out.symbol("_puts").unwrap().is_sect());
    assert!(out.symbol("_unused").is_none(), "unreferenced member stays out");
    assert!(out.binds().is_empty());
}

/// A BSD archive with a `__.SYMDEF` directory, enough for the linker's
/// lazy member machinery.
fn build_archive(members: &[(&str, &[u8], &[&str])]) -> Vec<u8> {
    fn push_header(buf: &mut Vec<u8>, name_field: &str, size: usize) {
        let mut header = vec![b' '; 60];
        header[..name_field.len()].copy_from_slice(name_field.as_bytes());
        for (range, text) in [(16..28, "0"), (28..34, "0"), (34..40, "0"), (40..48, "644")] {
            header[range][..text.len()].copy_from_slice(text.as_bytes());
        }
        let size_text = size.to_string();
        header[48..48 + size_text.len()].copy_from_slice(size_text.as_bytes());
        header[58] = 0x60;
        header[59] = 0x0a;
        buf.extend_from_slice(&header);
    }
    fn pad_name(name: &str) -> Vec<u8> {
        let mut padded = name.as_bytes().to_vec();
        while padded.len() % 8 != 0 {
            padded.push(0);
        }
        padded
    }

    // compute member layout after the symdef member
    let symdef_name = pad_name("__.SYMDEF");
    let mut strtab = Vec::new();
    let mut ranlib_strx: Vec<(u32, usize)> = Vec::new(); // (strx, member index)
    for (index, (_, _, syms)) in members.iter().enumerate() {
        for sym in *syms {
            ranlib_strx.push((strtab.len() as u32, index));
            strtab.extend_from_slice(sym.as_bytes());
            strtab.push(0);
        }
    }
    let ranlib_bytes = ranlib_strx.len() * 8;
    let symdef_size = symdef_name.len() + 4 + ranlib_bytes + 4 + strtab.len();

    let mut member_offsets = Vec::new();
    let mut cursor = 8 + 60 + symdef_size;
    cursor += cursor & 1;
    for (name, bytes, _) in members {
        member_offsets.push(cursor);
        let padded = pad_name(name);
        cursor += 60 + padded.len() + bytes.len();
        cursor += cursor & 1;
    }

    let mut out = Vec::new();
    out.extend_from_slice(b"!<arch>\x0A");
    push_header(&mut out, &format!("#1/{}", symdef_name.len()), symdef_size);
    out.extend_from_slice(&symdef_name);
    out.extend_from_slice(&(ranlib_bytes as u32).to_le_bytes());
    for (strx, member_index) in &ranlib_strx {
        out.extend_from_slice(&strx.to_le_bytes());
        out.extend_from_slice(&(member_offsets[*member_index] as u32).to_le_bytes());
    }
    out.extend_from_slice(&(strtab.len() as u32).to_le_bytes());
    out.extend_from_slice(&strtab);
    if out.len() & 1 == 1 {
        out.push(b'\n');
    }

    for (i, (name, bytes, _)) in members.iter().enumerate() {
        assert_eq!(out.len(), member_offsets[i]);
        let padded = pad_name(name);
        push_header(&mut out, &format!("#1/{}", padded.len()), padded.len() + bytes.len());
        out.extend_from_slice(&padded);
        out.extend_from_slice(bytes);
        if out.len() & 1 == 1 {
            out.push(b'\n');
        }
    }
    out
}
