//! The operating system shim.
//!
//! Everything that differs between host operating systems sits behind this module:
//!
//! - [`page_size`] and [`DEFAULT_PAGE_SIZE`]
//! - [`Protection`], mapped to the host's native `PROT_*` bits
//! - [`VmBackend`], the fixed-address mapping primitive, with the [`HostVm`] and
//!   [`SimulatedVm`] implementations
//! - the fault handler calling convention ([`FaultHandler`], [`install_fault_handler`]) and
//!   the register accessor for the faulting machine state ([`FaultContext`])
//! - [`PROTECTION_VIOLATION_SIGNAL`], the hardware event the runtime must intercept
//!
//! # Backends
//!
//! The [`VmBackend`] trait abstracts over where the address space lives, in the same way a
//! file backend abstracts over disk and memory:
//!
//! - [`HostVm`] - the real process address space through `mmap`/`mprotect`/`munmap`
//! - [`SimulatedVm`] - an in-process model with lazily allocated pages, used by tests and
//!   dry runs
//!
//! # Failure semantics
//!
//! The shim never aborts. Every refused request comes back as a [`crate::MappingError`]
//! naming the range; whether that is fatal is decided by the caller (see [`crate::validate`]).
//!
//! # Examples
//!
//! ```rust
//! use corespace::os::{Protection, SimulatedVm, VmBackend};
//!
//! let vm = SimulatedVm::new();
//! vm.map(0x1000_0000, 0x4000, Protection::ALL)?;
//! vm.write(0x1000_0010, &[1, 2, 3])?;
//!
//! let mut buf = [0u8; 3];
//! vm.read(0x1000_0010, &mut buf)?;
//! assert_eq!(buf, [1, 2, 3]);
//!
//! // Never silently relocated
//! assert!(vm.map(0x1000_2000, 0x1000, Protection::ALL).is_err());
//! # Ok::<(), corespace::Error>(())
//! ```

mod fault;
mod host;
mod simulated;

pub use fault::{
    install_fault_handler, register, restore_default_handler, set_register, FaultAction,
    FaultContext, FaultHandler, HostContext, Signal, SyntheticContext,
    PROTECTION_VIOLATION_SIGNAL,
};
pub use host::HostVm;
pub use simulated::SimulatedVm;

use std::{fmt, sync::OnceLock};

use bitflags::bitflags;

use crate::{MappingError, Result};

/// Page size assumed when the host does not report one.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// Page protection of a mapped range
    pub struct Protection: u8 {
        /// Pages may be read
        const READ = 0x1;
        /// Pages may be written
        const WRITE = 0x2;
        /// Pages may be executed
        const EXECUTE = 0x4;
        /// Every permission; what heaps holding compiled code are mapped with
        const ALL = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

impl Protection {
    /// No access at all; any touch faults.
    pub const NONE: Protection = Protection::empty();

    /// The host's native `PROT_*` bits for this protection.
    #[must_use]
    pub fn to_native(self) -> libc::c_int {
        let mut native = libc::PROT_NONE;
        if self.contains(Protection::READ) {
            native |= libc::PROT_READ;
        }
        if self.contains(Protection::WRITE) {
            native |= libc::PROT_WRITE;
        }
        if self.contains(Protection::EXECUTE) {
            native |= libc::PROT_EXEC;
        }
        native
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(self.contains(Protection::READ), 'r'),
            flag(self.contains(Protection::WRITE), 'w'),
            flag(self.contains(Protection::EXECUTE), 'x')
        )
    }
}

/// The host page size, queried once.
///
/// Falls back to [`DEFAULT_PAGE_SIZE`] if the host does not report a sane value.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

    *PAGE_SIZE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        match usize::try_from(size) {
            Ok(size) if size.is_power_of_two() => size,
            _ => DEFAULT_PAGE_SIZE,
        }
    })
}

/// Rounds `value` up to the next multiple of `page_size` (a power of two).
#[must_use]
pub const fn round_up(value: usize, page_size: usize) -> usize {
    (value + page_size - 1) & !(page_size - 1)
}

/// Rounds `value` down to a multiple of `page_size` (a power of two).
#[must_use]
pub const fn round_down(value: usize, page_size: usize) -> usize {
    value & !(page_size - 1)
}

/// Backend trait for the address space the spaces are mapped into.
///
/// All implementations must be thread-safe: the live space table is shared process-wide.
///
/// The mapping primitives return [`MappingError`] and never relocate: a range that cannot be
/// placed exactly at `address` is an error. `read` and `write` copy between the caller and an
/// already mapped range.
pub trait VmBackend: Send + Sync {
    /// The page size of this address space.
    fn page_size(&self) -> usize {
        DEFAULT_PAGE_SIZE
    }

    /// Reserves and backs `[address, address + size)` with `protection`.
    ///
    /// # Errors
    ///
    /// Returns a [`MappingError`] if the range is unaligned, already in use, could not be
    /// placed at `address`, or the host ran out of resources.
    fn map(
        &self,
        address: usize,
        size: usize,
        protection: Protection,
    ) -> std::result::Result<(), MappingError>;

    /// Releases `[address, address + size)`.
    ///
    /// # Errors
    ///
    /// Returns a [`MappingError`] if the host refuses.
    fn unmap(&self, address: usize, size: usize) -> std::result::Result<(), MappingError>;

    /// Changes the protection of `[address, address + size)`.
    ///
    /// # Errors
    ///
    /// Returns a [`MappingError`] if the range is unaligned or not mapped.
    fn protect(
        &self,
        address: usize,
        size: usize,
        protection: Protection,
    ) -> std::result::Result<(), MappingError>;

    /// Changes the protection of `[address, address + size)` without consulting any
    /// bookkeeping.
    ///
    /// This is the path taken from inside a fault handler: implementations must not lock,
    /// allocate or log. The default forwards to [`VmBackend::protect`], which is fine for
    /// backends that never run under a signal.
    ///
    /// # Errors
    ///
    /// Returns a [`MappingError`] if the host refuses the change.
    fn protect_unchecked(
        &self,
        address: usize,
        size: usize,
        protection: Protection,
    ) -> std::result::Result<(), MappingError> {
        self.protect(address, size, protection)
    }

    /// Copies `buf.len()` bytes starting at `address` into `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NotMapped`] if the range is not mapped.
    fn read(&self, address: usize, buf: &mut [u8]) -> Result<()>;

    /// Copies `data` to `address`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NotMapped`] if the range is not mapped.
    fn write(&self, address: usize, data: &[u8]) -> Result<()>;
}
