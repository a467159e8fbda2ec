//! The output writer: assembles the mach header and load commands over the
//! resolved section bytes, sizes `__LINKEDIT`, applies the ad-hoc
//! signature when the target demands one, and puts the file on disk.

use log::debug;
use scroll::Pwrite;

use crate::codesign::CodeSignature;
use crate::error::{Error, Result};
use crate::linker::{FileData, Linker};
use crate::linkedit::{self, LinkeditData};
use crate::mach::constants::*;
use crate::mach::header::{Header64, MH_DYLIB, MH_EXECUTE, MH_MAGIC_64, SIZEOF_HEADER_64};
use crate::mach::header::{
    MH_BINDS_TO_WEAK, MH_DYLDLINK, MH_HAS_TLV_DESCRIPTORS, MH_NOUNDEFS, MH_NO_REEXPORTED_DYLIBS,
    MH_PIE, MH_TWOLEVEL, MH_WEAK_DEFINES,
};
use crate::mach::load_command::*;
use crate::options::{Namespace, OutputMode};
use crate::reloc;

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

fn str_command_size(fixed: usize, s: &str) -> usize {
    align8(fixed + s.len() + 1)
}

/// Dylibs that earned a load command, in ordinal order.
fn referenced_dylibs(linker: &Linker) -> Vec<u32> {
    let mut dylibs: Vec<(u16, u32)> = linker
        .files
        .iter()
        .filter_map(|f| match &f.data {
            FileData::Dylib(d) => d.ordinal.map(|ord| (ord, f.index)),
            _ => None,
        })
        .collect();
    dylibs.sort_unstable();
    dylibs.into_iter().map(|(_, fid)| fid).collect()
}

fn signing_required(linker: &Linker) -> bool {
    linker.options.target.requires_code_signature() || linker.options.entitlements.is_some()
}

/// The serialized size of the load commands; layout uses it for the
/// minimum header pad before any section content.
pub fn load_commands_size(linker: &Linker) -> usize {
    let mut size = 0usize;
    for segment in &linker.segments {
        size += SIZEOF_SEGMENT_COMMAND_64 + segment.sections.len() * SIZEOF_SECTION_64;
    }
    size += SIZEOF_DYLD_INFO_COMMAND;
    size += SIZEOF_LINKEDIT_DATA_COMMAND * 2; // function starts, data-in-code
    size += SIZEOF_SYMTAB_COMMAND + SIZEOF_DYSYMTAB_COMMAND;
    match linker.options.output_mode {
        OutputMode::Exe => {
            size += str_command_size(SIZEOF_DYLINKER_COMMAND, DYLD_PATH);
            size += SIZEOF_ENTRY_POINT_COMMAND;
        }
        OutputMode::Lib => {
            size += str_command_size(SIZEOF_DYLIB_COMMAND, &install_name(linker));
        }
    }
    for rpath in &linker.options.rpath_list {
        size += str_command_size(SIZEOF_RPATH_COMMAND, rpath);
    }
    size += SIZEOF_SOURCE_VERSION_COMMAND;
    size += SIZEOF_BUILD_VERSION_COMMAND + SIZEOF_BUILD_TOOL_VERSION;
    size += SIZEOF_UUID_COMMAND;
    for &fid in &referenced_dylibs(linker) {
        let FileData::Dylib(dylib) = &linker.files[fid as usize].data else {
            unreachable!()
        };
        size += str_command_size(SIZEOF_DYLIB_COMMAND, &dylib.install_name);
    }
    if signing_required(linker) {
        size += SIZEOF_LINKEDIT_DATA_COMMAND;
    }
    size
}

const DYLD_PATH: &str = "/usr/lib/dyld";

fn install_name(linker: &Linker) -> String {
    linker
        .options
        .install_name
        .clone()
        .unwrap_or_else(|| linker.options.emit.display().to_string())
}

fn header_flags(linker: &Linker) -> u32 {
    let mut flags = MH_NOUNDEFS | MH_DYLDLINK | MH_PIE;
    if linker.options.namespace == Namespace::TwoLevel {
        flags |= MH_TWOLEVEL;
    }
    let has_tlv = linker
        .out_sections
        .iter()
        .skip(1)
        .any(|s| s.header.flags & SECTION_TYPE == S_THREAD_LOCAL_VARIABLES);
    if has_tlv {
        flags |= MH_HAS_TLV_DESCRIPTORS;
    }
    let weak_defines = linker
        .symbols
        .iter()
        .skip(1)
        .any(|s| s.flags.weak && s.is_defined() && !s.flags.local);
    if weak_defines {
        flags |= MH_WEAK_DEFINES;
    }
    let binds_to_weak = linker
        .symbols
        .iter()
        .skip(1)
        .any(|s| s.flags.import && s.flags.weak_ref);
    if binds_to_weak {
        flags |= MH_BINDS_TO_WEAK;
    }
    if linker.options.output_mode == OutputMode::Lib {
        flags |= MH_NO_REEXPORTED_DYLIBS;
    }
    flags
}

struct CommandPayload {
    linkedit: LinkeditData,
    codesig: Option<LinkeditDataCommand>,
    uuid: [u8; 16],
    entryoff: u64,
}

fn push_str_command(out: &mut Vec<u8>, fixed: &[u8], s: &str, total: usize) {
    let start = out.len();
    out.extend_from_slice(fixed);
    out.extend_from_slice(s.as_bytes());
    out.push(0);
    out.resize(start + total, 0);
}

fn build_load_commands(linker: &Linker, payload: &CommandPayload) -> Result<(Vec<u8>, u32)> {
    let mut out: Vec<u8> = Vec::new();
    let mut ncmds = 0u32;

    for segment in &linker.segments {
        let mut header = segment.header;
        header.cmdsize =
            (SIZEOF_SEGMENT_COMMAND_64 + segment.sections.len() * SIZEOF_SECTION_64) as u32;
        let mut buf = vec![0u8; header.cmdsize as usize];
        buf.pwrite_with(header, 0, scroll::LE)?;
        let mut offset = SIZEOF_SEGMENT_COMMAND_64;
        for &sect_id in &segment.sections {
            buf.pwrite_with(linker.out_sections[sect_id as usize].header, offset, scroll::LE)?;
            offset += SIZEOF_SECTION_64;
        }
        out.extend_from_slice(&buf);
        ncmds += 1;
    }

    let mut fixed = [0u8; SIZEOF_DYLD_INFO_COMMAND];
    fixed.pwrite_with(payload.linkedit.dyld_info, 0, scroll::LE)?;
    out.extend_from_slice(&fixed);
    ncmds += 1;

    let mut fixed = [0u8; SIZEOF_LINKEDIT_DATA_COMMAND];
    fixed.pwrite_with(payload.linkedit.function_starts, 0, scroll::LE)?;
    out.extend_from_slice(&fixed);
    ncmds += 1;
    let mut fixed = [0u8; SIZEOF_LINKEDIT_DATA_COMMAND];
    fixed.pwrite_with(payload.linkedit.data_in_code, 0, scroll::LE)?;
    out.extend_from_slice(&fixed);
    ncmds += 1;

    let mut fixed = [0u8; SIZEOF_SYMTAB_COMMAND];
    fixed.pwrite_with(payload.linkedit.symtab, 0, scroll::LE)?;
    out.extend_from_slice(&fixed);
    ncmds += 1;
    let mut fixed = [0u8; SIZEOF_DYSYMTAB_COMMAND];
    fixed.pwrite_with(payload.linkedit.dysymtab, 0, scroll::LE)?;
    out.extend_from_slice(&fixed);
    ncmds += 1;

    match linker.options.output_mode {
        OutputMode::Exe => {
            let cmdsize = str_command_size(SIZEOF_DYLINKER_COMMAND, DYLD_PATH);
            let dylinker = DylinkerCommand {
                cmd: LC_LOAD_DYLINKER,
                cmdsize: cmdsize as u32,
                name: SIZEOF_DYLINKER_COMMAND as u32,
            };
            let mut fixed = [0u8; SIZEOF_DYLINKER_COMMAND];
            fixed.pwrite_with(dylinker, 0, scroll::LE)?;
            push_str_command(&mut out, &fixed, DYLD_PATH, cmdsize);
            ncmds += 1;

            let main = EntryPointCommand {
                cmd: LC_MAIN,
                cmdsize: SIZEOF_ENTRY_POINT_COMMAND as u32,
                entryoff: payload.entryoff,
                stacksize: linker.options.stack_size.unwrap_or(0),
            };
            let mut fixed = [0u8; SIZEOF_ENTRY_POINT_COMMAND];
            fixed.pwrite_with(main, 0, scroll::LE)?;
            out.extend_from_slice(&fixed);
            ncmds += 1;
        }
        OutputMode::Lib => {
            let name = install_name(linker);
            let cmdsize = str_command_size(SIZEOF_DYLIB_COMMAND, &name);
            let id = DylibCommand {
                cmd: LC_ID_DYLIB,
                cmdsize: cmdsize as u32,
                dylib: Dylib {
                    name: SIZEOF_DYLIB_COMMAND as u32,
                    timestamp: 1,
                    current_version: linker.options.current_version,
                    compatibility_version: linker.options.compatibility_version,
                },
            };
            let mut fixed = [0u8; SIZEOF_DYLIB_COMMAND];
            fixed.pwrite_with(id, 0, scroll::LE)?;
            push_str_command(&mut out, &fixed, &name, cmdsize);
            ncmds += 1;
        }
    }

    for rpath in &linker.options.rpath_list {
        let cmdsize = str_command_size(SIZEOF_RPATH_COMMAND, rpath);
        let command = RpathCommand {
            cmd: LC_RPATH,
            cmdsize: cmdsize as u32,
            path: SIZEOF_RPATH_COMMAND as u32,
        };
        let mut fixed = [0u8; SIZEOF_RPATH_COMMAND];
        fixed.pwrite_with(command, 0, scroll::LE)?;
        push_str_command(&mut out, &fixed, rpath, cmdsize);
        ncmds += 1;
    }

    let source_version = SourceVersionCommand {
        cmd: LC_SOURCE_VERSION,
        cmdsize: SIZEOF_SOURCE_VERSION_COMMAND as u32,
        version: 0,
    };
    let mut fixed = [0u8; SIZEOF_SOURCE_VERSION_COMMAND];
    fixed.pwrite_with(source_version, 0, scroll::LE)?;
    out.extend_from_slice(&fixed);
    ncmds += 1;

    let build_version = BuildVersionCommand {
        cmd: LC_BUILD_VERSION,
        cmdsize: (SIZEOF_BUILD_VERSION_COMMAND + SIZEOF_BUILD_TOOL_VERSION) as u32,
        platform: linker.options.target.platform(),
        minos: linker.options.platform_version,
        sdk: linker.options.sdk_version,
        ntools: 1,
    };
    let mut buf = [0u8; SIZEOF_BUILD_VERSION_COMMAND + SIZEOF_BUILD_TOOL_VERSION];
    buf.pwrite_with(build_version, 0, scroll::LE)?;
    buf.pwrite_with(
        BuildToolVersion { tool: TOOL_LD, version: 0x0001_0000 },
        SIZEOF_BUILD_VERSION_COMMAND,
        scroll::LE,
    )?;
    out.extend_from_slice(&buf);
    ncmds += 1;

    let uuid = UuidCommand {
        cmd: LC_UUID,
        cmdsize: SIZEOF_UUID_COMMAND as u32,
        uuid: payload.uuid,
    };
    let mut fixed = [0u8; SIZEOF_UUID_COMMAND];
    fixed.pwrite_with(uuid, 0, scroll::LE)?;
    out.extend_from_slice(&fixed);
    ncmds += 1;

    for &fid in &referenced_dylibs(linker) {
        let FileData::Dylib(dylib) = &linker.files[fid as usize].data else {
            unreachable!()
        };
        let cmdsize = str_command_size(SIZEOF_DYLIB_COMMAND, &dylib.install_name);
        let command = DylibCommand {
            cmd: if dylib.weak { LC_LOAD_WEAK_DYLIB } else { LC_LOAD_DYLIB },
            cmdsize: cmdsize as u32,
            dylib: Dylib {
                name: SIZEOF_DYLIB_COMMAND as u32,
                timestamp: 2,
                current_version: dylib.current_version,
                compatibility_version: dylib.compatibility_version,
            },
        };
        let mut fixed = [0u8; SIZEOF_DYLIB_COMMAND];
        fixed.pwrite_with(command, 0, scroll::LE)?;
        push_str_command(&mut out, &fixed, &dylib.install_name, cmdsize);
        ncmds += 1;
    }

    if let Some(codesig) = payload.codesig {
        let mut fixed = [0u8; SIZEOF_LINKEDIT_DATA_COMMAND];
        fixed.pwrite_with(codesig, 0, scroll::LE)?;
        out.extend_from_slice(&fixed);
        ncmds += 1;
    }

    Ok((out, ncmds))
}

/// Resolve relocations into the output buffer, lay down LINKEDIT, emit the
/// header and load commands, sign if required, and write the file.
pub fn flush(linker: &mut Linker) -> Result<()> {
    let entryoff = match linker.options.output_mode {
        OutputMode::Exe => {
            let sid = linker.entry_symbol()?;
            let text_vmaddr = linker
                .segments
                .iter()
                .find(|s| s.name() == SEG_TEXT)
                .map(|s| s.header.vmaddr)
                .unwrap_or(0);
            linker.symbols[sid as usize].value - text_vmaddr
        }
        OutputMode::Lib => 0,
    };

    let linkedit_index = linker.segments.len() - 1;
    let linkedit_fileoff = linker.segments[linkedit_index].header.fileoff;
    let mut buffer = vec![0u8; linkedit_fileoff as usize];
    reloc::resolve_all(linker, &mut buffer)?;

    let linkedit = linkedit::write(linker, &mut buffer)?;
    reloc::patch_lazy_bind_offsets(linker, &linkedit.lazy_bind_offsets, &mut buffer);

    // reserve the signature at the 16-byte aligned LINKEDIT tail
    let signature = if signing_required(linker) {
        while buffer.len() % 16 != 0 {
            buffer.push(0);
        }
        let sig_off = buffer.len();
        let entitlements = match &linker.options.entitlements {
            Some(path) => Some(std::fs::read(path)?),
            None => None,
        };
        let text = linker
            .segments
            .iter()
            .find(|s| s.name() == SEG_TEXT)
            .map(|s| (s.header.fileoff, s.header.filesize))
            .unwrap_or((0, 0));
        let identifier = linker
            .options
            .emit
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "a.out".to_string());
        let signer = CodeSignature {
            identifier,
            entitlements,
            der_entitlements: None,
            text_fileoff: text.0,
            text_filesize: text.1,
            is_executable: linker.options.output_mode == OutputMode::Exe,
        };
        let size = signer.estimate_size(sig_off);
        let command = LinkeditDataCommand {
            cmd: LC_CODE_SIGNATURE,
            cmdsize: SIZEOF_LINKEDIT_DATA_COMMAND as u32,
            dataoff: sig_off as u32,
            datasize: size as u32,
        };
        Some((signer, command))
    } else {
        None
    };

    // final __LINKEDIT extent, padded out to the page boundary
    let end = buffer.len() as u64
        + signature.as_ref().map(|(_, cmd)| cmd.datasize as u64).unwrap_or(0);
    let page = linker.options.target.page_size();
    let total_size;
    {
        let header = &mut linker.segments[linkedit_index].header;
        header.filesize = (end - header.fileoff + page - 1) & !(page - 1);
        header.vmsize = header.filesize;
        total_size = (header.fileoff + header.filesize) as usize;
    }

    let payload = CommandPayload {
        linkedit,
        codesig: signature.as_ref().map(|(_, cmd)| *cmd),
        uuid: rand::random(),
        entryoff,
    };
    let (commands, ncmds) = build_load_commands(linker, &payload)?;

    let filetype = match linker.options.output_mode {
        OutputMode::Exe => MH_EXECUTE,
        OutputMode::Lib => MH_DYLIB,
    };
    let header = Header64 {
        magic: MH_MAGIC_64,
        cputype: linker.options.target.cputype(),
        cpusubtype: linker.options.target.cpusubtype(),
        filetype,
        ncmds,
        sizeofcmds: commands.len() as u32,
        flags: header_flags(linker),
        reserved: 0,
    };
    buffer.pwrite_with(header, 0, scroll::LE)?;
    buffer[SIZEOF_HEADER_64..SIZEOF_HEADER_64 + commands.len()].copy_from_slice(&commands);

    if let Some((signer, command)) = signature {
        let sig_off = command.dataoff as usize;
        let blob = signer.write(&buffer, sig_off);
        buffer.extend_from_slice(&blob);
    }
    buffer.resize(total_size, 0);

    debug!(
        "writing {} ({} bytes, {} load commands)",
        linker.options.emit.display(),
        buffer.len(),
        ncmds
    );
    std::fs::write(&linker.options.emit, &buffer)?;
    set_executable(&linker.options.emit)?;
    Ok(())
}

#[cfg(unix)]
fn set_executable(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).map_err(Error::Io)
}

#[cfg(not(unix))]
fn set_executable(_path: &std::path::Path) -> Result<()> {
    Ok(())
}
