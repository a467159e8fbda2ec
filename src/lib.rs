//! # boggart
//!
//! An impish Mach-O static linker.
//!
//! `boggart` consumes 64-bit relocatable Mach-O objects, BSD `ar` archives
//! (optionally wrapped in universal containers), and dynamic libraries in
//! both binary and text-stub (TBD) form, and produces a dyld-loadable
//! executable or dylib on disk, ad-hoc code-signed where the target demands
//! it.
//!
//! The whole link is one [`Linker`] value: it owns the file vector, the atom
//! and symbol arenas, the interned string table, and the synthetic-pointer
//! tables. Every cross-entity reference is an integer index into one of
//! those vectors, so two links can run in the same process without sharing
//! anything.
//!
//! ```no_run
//! use boggart::{Linker, Options, OutputMode, Target};
//!
//! let mut options = Options::new(Target::macos_aarch64(), OutputMode::Exe, "a.out".into());
//! options.positionals.push(boggart::options::LinkInput::new("main.o"));
//! Linker::new(options).link().unwrap();
//! ```

pub mod arch;
pub mod archive;
pub mod atom;
pub mod codesign;
pub mod dead_strip;
pub mod dwarf;
pub mod dylib;
pub mod error;
pub mod layout;
pub mod linkedit;
pub mod linker;
pub mod mach;
pub mod object;
pub mod options;
pub mod reloc;
pub mod strtab;
pub mod synthetic;
pub mod writer;

pub use crate::error::{Error, Result};
pub use crate::linker::Linker;
pub use crate::options::{Options, OutputMode, Target};
