//! Link options, as handed over by a front-end.
//!
//! Flag parsing itself lives outside this crate; a front-end builds an
//! [`Options`] value and hands it to [`crate::Linker`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::mach::constants::cputype::{
    CPU_SUBTYPE_ARM64_ALL, CPU_SUBTYPE_X86_64_ALL, CPU_TYPE_ARM64, CPU_TYPE_X86_64,
};
use crate::mach::constants::{
    PLATFORM_IOS, PLATFORM_IOSSIMULATOR, PLATFORM_MACOS, PLATFORM_TVOS, PLATFORM_WATCHOS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuArch {
    X86_64,
    Aarch64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsTag {
    Macos,
    Ios,
    Tvos,
    Watchos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abi {
    None,
    Simulator,
}

/// The link target: selects page size, instruction encoders, and whether the
/// output must carry an ad-hoc code signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub cpu_arch: CpuArch,
    pub os: OsTag,
    pub abi: Abi,
}

impl Target {
    pub fn macos_x86_64() -> Target {
        Target { cpu_arch: CpuArch::X86_64, os: OsTag::Macos, abi: Abi::None }
    }

    pub fn macos_aarch64() -> Target {
        Target { cpu_arch: CpuArch::Aarch64, os: OsTag::Macos, abi: Abi::None }
    }

    /// The VM page granule used for segment alignment.
    pub fn page_size(&self) -> u64 {
        match self.cpu_arch {
            CpuArch::Aarch64 => 0x4000,
            CpuArch::X86_64 => 0x1000,
        }
    }

    pub fn cputype(&self) -> u32 {
        match self.cpu_arch {
            CpuArch::X86_64 => CPU_TYPE_X86_64,
            CpuArch::Aarch64 => CPU_TYPE_ARM64,
        }
    }

    pub fn cpusubtype(&self) -> u32 {
        match self.cpu_arch {
            CpuArch::X86_64 => CPU_SUBTYPE_X86_64_ALL,
            CpuArch::Aarch64 => CPU_SUBTYPE_ARM64_ALL,
        }
    }

    /// The `LC_BUILD_VERSION` platform value.
    pub fn platform(&self) -> u32 {
        match (self.os, self.abi) {
            (OsTag::Macos, _) => PLATFORM_MACOS,
            (OsTag::Ios, Abi::Simulator) => PLATFORM_IOSSIMULATOR,
            (OsTag::Ios, Abi::None) => PLATFORM_IOS,
            (OsTag::Tvos, _) => PLATFORM_TVOS,
            (OsTag::Watchos, _) => PLATFORM_WATCHOS,
        }
    }

    /// Apple Silicon and the arm64 simulators refuse unsigned images, so a
    /// signature is mandatory there; elsewhere it only appears when
    /// entitlements are supplied.
    pub fn requires_code_signature(&self) -> bool {
        self.cpu_arch == CpuArch::Aarch64
            && (self.os == OsTag::Macos || self.abi == Abi::Simulator)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Exe,
    Lib,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UndefinedTreatment {
    #[default]
    Error,
    Warn,
    Suppress,
    DynamicLookup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchStrategy {
    /// For each search dir, prefer a dylib/tbd over an archive before moving
    /// to the next dir
    #[default]
    PathsFirst,
    /// Scan every dir for a dylib/tbd first, then rescan for archives
    DylibsFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Namespace {
    #[default]
    TwoLevel,
    Flat,
}

/// An ordered positional input. `must_link` forces every member of an
/// archive into the link, referenced or not.
#[derive(Debug, Clone)]
pub struct LinkInput {
    pub path: PathBuf,
    pub must_link: bool,
}

impl LinkInput {
    pub fn new<P: Into<PathBuf>>(path: P) -> LinkInput {
        LinkInput { path: path.into(), must_link: false }
    }
}

/// `-lX` / `-framework X` modifiers.
#[derive(Debug, Clone, Copy, Default)]
pub struct LibSpec {
    /// Emit a load command even if nothing binds against it
    pub needed: bool,
    /// `LC_LOAD_WEAK_DYLIB` plus weak-import binds
    pub weak: bool,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub target: Target,
    pub output_mode: OutputMode,
    /// Output path; its basename doubles as the code-signature identifier
    pub emit: PathBuf,
    pub positionals: Vec<LinkInput>,
    pub libs: BTreeMap<String, LibSpec>,
    pub lib_dirs: Vec<PathBuf>,
    pub frameworks: BTreeMap<String, LibSpec>,
    pub framework_dirs: Vec<PathBuf>,
    /// Prefix applied to absolute search paths
    pub syslibroot: Option<PathBuf>,
    pub search_strategy: SearchStrategy,
    pub rpath_list: Vec<String>,
    pub entry: String,
    pub stack_size: Option<u64>,
    pub pagezero_size: Option<u64>,
    pub headerpad: u32,
    pub headerpad_max_install_names: bool,
    pub dead_strip: bool,
    /// Suppress stab emission
    pub strip: bool,
    pub undefined_treatment: UndefinedTreatment,
    pub namespace: Namespace,
    pub install_name: Option<String>,
    pub current_version: u32,
    pub compatibility_version: u32,
    /// Path to an entitlements plist injected into the code signature
    pub entitlements: Option<PathBuf>,
    /// Minimum OS, `xxxx.yy.zz` nibble-packed
    pub platform_version: u32,
    pub sdk_version: u32,
}

impl Options {
    pub fn new(target: Target, output_mode: OutputMode, emit: PathBuf) -> Options {
        Options {
            target,
            output_mode,
            emit,
            positionals: Vec::new(),
            libs: BTreeMap::new(),
            lib_dirs: Vec::new(),
            frameworks: BTreeMap::new(),
            framework_dirs: Vec::new(),
            syslibroot: None,
            search_strategy: SearchStrategy::default(),
            rpath_list: Vec::new(),
            entry: "_main".to_string(),
            stack_size: None,
            pagezero_size: None,
            headerpad: 0,
            headerpad_max_install_names: false,
            dead_strip: false,
            strip: false,
            undefined_treatment: UndefinedTreatment::default(),
            namespace: Namespace::default(),
            install_name: None,
            current_version: 0x10000,
            compatibility_version: 0x10000,
            entitlements: None,
            platform_version: 0x000d_0000,
            sdk_version: 0x000d_0000,
        }
    }
}
