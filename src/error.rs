use std::{path::PathBuf, process::ExitStatus};

use thiserror::Error;

use crate::layout::SpaceId;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// # Error Categories
///
/// ## Address space errors
/// - [`Error::SpaceMapping`] - A space could not be reserved at its fixed address (fatal at startup)
/// - [`Error::Vm`] - A protect/unmap request on an already mapped range failed
/// - [`Error::NotMapped`] - An access outside every mapped space
/// - [`Error::ProtectionViolation`] - A simulated access the page protection forbids
/// - [`Error::AlreadyValidated`] - [`crate::validate`] ran twice
///
/// ## Fault handling errors
/// - [`Error::Fault`] - A protection fault no known trap explains
/// - [`Error::RegisterIndex`] - Register index outside the machine context
/// - [`Error::NotSupported`] - The host has no register map for fault contexts
///
/// ## Image errors
/// - [`Error::FileError`] - Filesystem I/O errors
/// - [`Error::GoblinErr`] - ELF parsing errors from the goblin crate
/// - [`Error::Malformed`] - A core image that does not fit the space layout
/// - [`Error::OutOfBounds`] - Encoding past the end of a buffer
/// - [`Error::LinkFailed`] / [`Error::LinkerSpawn`] - External linker failures
/// - [`Error::WriteMmapFailed`] / [`Error::WriteFinalizationFailed`] - Object output failures
#[derive(Error, Debug)]
pub enum Error {
    /// A space could not be mapped at its fixed address.
    ///
    /// Nothing downstream can run without every space in place, so [`crate::validate`] treats
    /// this as fatal and exits.
    #[error("Failed to validate {size:#x} bytes of {space} space at {address:#x}: {}", .source.kind)]
    SpaceMapping {
        /// The space whose mapping failed
        space: SpaceId,
        /// Base address of the space
        address: usize,
        /// Size of the space in bytes
        size: usize,
        /// The failure reported by the OS shim
        #[source]
        source: MappingError,
    },

    /// A protection change or unmap on an existing range failed.
    #[error("{0}")]
    Vm(#[from] MappingError),

    /// An access touched memory outside every mapped space.
    #[error("Range {address:#x}+{len:#x} is not inside a mapped space")]
    NotMapped {
        /// Start of the offending access
        address: usize,
        /// Length of the offending access
        len: usize,
    },

    /// A simulated access violated the page protection.
    #[error("Protection violation at {address:#x}")]
    ProtectionViolation {
        /// The first address whose protection forbids the access
        address: usize,
    },

    /// The process-wide space table has already been published.
    #[error("Spaces have already been validated")]
    AlreadyValidated,

    /// A protection fault that no known trap explains.
    #[error("{0}")]
    Fault(#[from] FaultDeliveryError),

    /// Register index outside the faulting machine context.
    #[error("Register index {index} out of range (context has {count} registers)")]
    RegisterIndex {
        /// The requested index
        index: usize,
        /// Number of registers the context exposes
        count: usize,
    },

    /// This operation is not supported on the current host.
    #[error("This operation is not supported on this host")]
    NotSupported,

    /// The input is damaged or does not fit the space layout.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while encoding or decoding.
    #[error("Out of Bound access would have occurred!")]
    OutOfBounds,

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Error from the goblin crate during ELF parsing.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),

    /// The external linker ran and exited unsuccessfully.
    ///
    /// Recoverable by the caller of the image build, e.g. retry with different flags. The
    /// intermediate objects are already gone when this is returned.
    #[error("Linker {} failed with {status}", .program.display())]
    LinkFailed {
        /// The linker program that was run
        program: PathBuf,
        /// Its exit status
        status: ExitStatus,
    },

    /// The external linker could not be started.
    #[error("Failed to run linker {}: {source}", .program.display())]
    LinkerSpawn {
        /// The linker program that was attempted
        program: PathBuf,
        /// The spawn failure
        #[source]
        source: std::io::Error,
    },

    /// Memory-mapped output file creation or writing failed.
    #[error("Memory-mapped output failed: {message}")]
    WriteMmapFailed {
        /// Description of the failure
        message: String,
    },

    /// Flushing a finished output file failed.
    #[error("Output finalization failed: {message}")]
    WriteFinalizationFailed {
        /// Description of the failure
        message: String,
    },
}

/// Why the OS refused a fixed-address mapping request.
#[derive(Error, Debug)]
pub enum MappingErrorKind {
    /// Part of the range is already mapped by something else.
    #[error("address range already in use")]
    InUse,

    /// The kernel ignored the fixed placement and picked another address.
    #[error("mapping was placed at {actual:#x} instead")]
    Relocated {
        /// Where the kernel put the mapping
        actual: usize,
    },

    /// The range is not page aligned.
    #[error("range is not aligned to the {page_size:#x} byte page size")]
    Unaligned {
        /// The page size the range was checked against
        page_size: usize,
    },

    /// The operation targets a range that is not mapped.
    #[error("range is not mapped")]
    NotMapped,

    /// Any other OS failure, e.g. insufficient resources.
    #[error("{0}")]
    Os(#[from] std::io::Error),
}

/// A fixed-address mapping request the OS shim could not satisfy.
///
/// The shim reports; deciding whether this is fatal is up to the caller.
#[derive(Error, Debug)]
#[error("{kind} ({size:#x} bytes at {address:#x})")]
pub struct MappingError {
    /// Start of the requested range
    pub address: usize,
    /// Size of the requested range
    pub size: usize,
    /// What went wrong
    #[source]
    pub kind: MappingErrorKind,
}

impl MappingError {
    /// Creates a new mapping error for the given range.
    #[must_use]
    pub fn new(address: usize, size: usize, kind: MappingErrorKind) -> Self {
        MappingError {
            address,
            size,
            kind,
        }
    }
}

/// A protection fault the installed handler could not classify.
///
/// Distinct from ordinary Lisp-level error conditions: this means memory outside the known
/// traps was touched and the runtime cannot continue safely.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unhandled protection fault at {address:#x}{}", containing(.space))]
pub struct FaultDeliveryError {
    /// The faulting address
    pub address: usize,
    /// The space containing the address, if any
    pub space: Option<SpaceId>,
}

fn containing(space: &Option<SpaceId>) -> String {
    match space {
        Some(space) => format!(" in {space} space"),
        None => " outside every space".to_string(),
    }
}
