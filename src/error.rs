use core::fmt;
use core::result;
use std::error;
use std::io;

/// An unresolved reference, reported with the first file that asked for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndefinedReference {
    pub name: String,
    pub referenced_in: String,
}

/// A strong/strong clash between two definitions of the same global.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateDefinition {
    pub name: String,
    pub first: String,
    pub second: String,
}

#[derive(Debug)]
pub enum Error {
    /// Generic IO error from reading an input or writing the output
    Io(io::Error),
    /// Buffer read/write error from scroll
    Scroll(scroll::Error),
    /// Entity is structurally invalid after its format was accepted
    Malformed(String),
    /// Input ended before a complete header/record could be read.
    /// Recoverable: the caller may retry the buffer as a different format.
    EndOfStream,
    /// The leading magic is not `MH_MAGIC_64`. Recoverable.
    NotObject,
    /// The leading magic is not `!<arch>\n`. Recoverable.
    NotArchive,
    /// Not a binary dylib; the caller may retry as a text stub. Recoverable.
    NotDylib,
    /// Unresolved imports under the `error` policy, or a missing
    /// `dyld_stub_binder` provider
    UndefinedSymbolReference(Vec<UndefinedReference>),
    /// Two strong definitions of the same global
    MultipleSymbolDefinitions(Vec<DuplicateDefinition>),
    /// Executable output, but the entry symbol never resolved
    MissingMainEntrypoint(String),
    /// `-lX` could not be resolved against the library search path
    LibraryNotFound(String),
    /// `-framework X` could not be resolved against the framework search path
    FrameworkNotFound(String),
    /// Stab, indirect or absolute symbol in input where none is supported
    UnhandledSymbolType { name: String, n_type: u8 },
    /// An input object was built for a different CPU than the link target
    MismatchedCpuArchitecture { path: String, cputype: u32 },
    /// A 32-bit displacement left the i32 range with no thunk to take up the
    /// slack, or a page offset was not aligned for its load/store width
    Overflow(String),
    /// The link target is neither x86-64 nor aarch64
    UnsupportedCpuArchitecture(u32),
}

impl Error {
    /// Parser-rejection errors are recovered locally as "try the next
    /// format"; everything else surfaces out of `link`.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::EndOfStream | Error::NotObject | Error::NotArchive | Error::NotDylib
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(fmt, "IO error: {err}"),
            Error::Scroll(err) => write!(fmt, "{err}"),
            Error::Malformed(msg) => write!(fmt, "Malformed entity: {msg}"),
            Error::EndOfStream => write!(fmt, "Unexpected end of stream"),
            Error::NotObject => write!(fmt, "Not a 64-bit Mach-O object"),
            Error::NotArchive => write!(fmt, "Not an archive"),
            Error::NotDylib => write!(fmt, "Not a dylib"),
            Error::UndefinedSymbolReference(refs) => {
                writeln!(fmt, "undefined symbols:")?;
                for r in refs {
                    writeln!(fmt, "  {}, referenced from {}", r.name, r.referenced_in)?;
                }
                Ok(())
            }
            Error::MultipleSymbolDefinitions(dups) => {
                writeln!(fmt, "duplicate symbols:")?;
                for d in dups {
                    writeln!(fmt, "  {} defined in both {} and {}", d.name, d.first, d.second)?;
                }
                Ok(())
            }
            Error::MissingMainEntrypoint(entry) => {
                write!(fmt, "entry point {entry} undefined")
            }
            Error::LibraryNotFound(name) => write!(fmt, "library not found: -l{name}"),
            Error::FrameworkNotFound(name) => {
                write!(fmt, "framework not found: -framework {name}")
            }
            Error::UnhandledSymbolType { name, n_type } => {
                write!(fmt, "unhandled symbol type {n_type:#x} for {name}")
            }
            Error::MismatchedCpuArchitecture { path, cputype } => {
                write!(fmt, "{path}: cputype {cputype:#x} does not match the link target")
            }
            Error::Overflow(msg) => write!(fmt, "relocation overflow: {msg}"),
            Error::UnsupportedCpuArchitecture(cputype) => {
                write!(fmt, "unsupported cputype {cputype:#x}")
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Scroll(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl From<scroll::Error> for Error {
    fn from(err: scroll::Error) -> Error {
        Error::Scroll(err)
    }
}

pub type Result<T> = result::Result<T, Error>;
