//! The space validator and the live space table.
//!
//! Before the runtime allocates anything, every space of the host layout has to be mapped at
//! its fixed address. [`validate`] does that once per process and publishes the resulting
//! [`SpaceTable`]; a space that cannot be placed is fatal, the process exits with a diagnostic
//! naming it.
//!
//! [`SpaceTable::validate_with`] is the recoverable core underneath: it maps in table order
//! through any [`VmBackend`], stops at the first failure, releases what it already mapped and
//! returns [`Error::SpaceMapping`]. Tests and the CLI dry-run use it with
//! [`crate::os::SimulatedVm`].
//!
//! # The live table
//!
//! Beyond the mapping itself the table tracks the runtime state of the spaces:
//!
//! - which dynamic space is current, flipped by the collector after each copy
//! - whether read-only space is frozen
//! - the guard pages at the overflow end of the stacks
//! - the automatic GC trigger, a protected watermark in the current dynamic space
//!
//! The current space and the trigger address are atomics, so a fault handler can read them
//! without taking a lock.

mod protect;

pub use protect::{install_protection_handler, FaultKind};

use std::{
    process,
    sync::{
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
        OnceLock,
    },
};

use log::{debug, error, info, warn};

use crate::{
    layout::{layout, Architecture, LayoutTable, SpaceDescriptor, SpaceId},
    os::{HostVm, Protection, VmBackend},
    Error, Result,
};

/// Every space of one layout, mapped.
///
/// Dropping the table unmaps all spaces. The process-wide table published by [`validate`]
/// lives until exit.
pub struct SpaceTable {
    layout: LayoutTable,
    vm: Box<dyn VmBackend>,
    current: AtomicU8,
    frozen: AtomicBool,
    trigger: AtomicUsize,
    gc_pending: AtomicBool,
}

impl std::fmt::Debug for SpaceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceTable")
            .field("layout", &self.layout)
            .field("current", &self.current_dynamic_space())
            .field("frozen", &self.frozen.load(Ordering::Relaxed))
            .field("trigger", &self.auto_gc_trigger())
            .finish_non_exhaustive()
    }
}

impl SpaceTable {
    /// Maps every space of `layout` through `vm`, in table order.
    ///
    /// On success `Dynamic0` is the current dynamic space.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SpaceMapping`] for the first space that could not be mapped. Spaces
    /// after it are not attempted and the ones before it are unmapped again.
    pub fn validate_with(layout: LayoutTable, vm: Box<dyn VmBackend>) -> Result<SpaceTable> {
        let mut mapped: Vec<&SpaceDescriptor> = Vec::with_capacity(layout.spaces().len());

        for space in &layout {
            if let Err(source) = vm.map(space.base, space.size, space.protection) {
                for done in mapped.iter().rev() {
                    if let Err(error) = vm.unmap(done.base, done.size) {
                        warn!("Failed to release {} space: {error}", done.id);
                    }
                }

                return Err(Error::SpaceMapping {
                    space: space.id,
                    address: space.base,
                    size: space.size,
                    source,
                });
            }

            debug!("Validated {space}");
            mapped.push(space);
        }

        info!(
            "Validated {} spaces for {}",
            layout.spaces().len(),
            layout.architecture()
        );

        Ok(SpaceTable {
            layout,
            vm,
            current: AtomicU8::new(SpaceId::Dynamic0 as u8),
            frozen: AtomicBool::new(false),
            trigger: AtomicUsize::new(0),
            gc_pending: AtomicBool::new(false),
        })
    }

    /// The layout this table was validated from.
    #[must_use]
    pub fn layout(&self) -> &LayoutTable {
        &self.layout
    }

    /// The architecture of the layout.
    #[must_use]
    pub fn architecture(&self) -> Architecture {
        self.layout.architecture()
    }

    /// The backend the spaces are mapped in.
    #[must_use]
    pub fn vm(&self) -> &dyn VmBackend {
        self.vm.as_ref()
    }

    /// The descriptor of `id`, if the layout has that space.
    #[must_use]
    pub fn descriptor(&self, id: SpaceId) -> Option<&SpaceDescriptor> {
        self.layout.get(id)
    }

    /// The space containing `address`.
    #[must_use]
    pub fn space_containing(&self, address: usize) -> Option<&SpaceDescriptor> {
        self.layout.space_containing(address)
    }

    /// The dynamic space new objects are allocated in.
    #[must_use]
    pub fn current_dynamic_space(&self) -> SpaceId {
        SpaceId::from_repr(self.current.load(Ordering::Acquire)).unwrap_or(SpaceId::Dynamic0)
    }

    /// The dynamic space the next collection copies into.
    #[must_use]
    pub fn other_dynamic_space(&self) -> SpaceId {
        self.current_dynamic_space()
            .dynamic_partner()
            .unwrap_or(SpaceId::Dynamic1)
    }

    /// Makes the other dynamic space current and returns it.
    ///
    /// Called by the collector once it has copied the live objects. An armed GC trigger is
    /// cleared first so the watermark never ends up in the space being evacuated. The bytes of
    /// the previous space stay readable until the collector reuses it.
    pub fn flip_dynamic_space(&self) -> SpaceId {
        if let Err(error) = self.clear_auto_gc_trigger() {
            warn!("Failed to clear the GC trigger before the flip: {error}");
        }

        let next = self.other_dynamic_space();
        self.current.store(next as u8, Ordering::Release);
        debug!("Current dynamic space is now {next}");
        next
    }

    /// Makes `id` the current dynamic space; non-dynamic ids are ignored.
    pub(crate) fn set_current_dynamic_space(&self, id: SpaceId) {
        if id.is_dynamic() {
            self.current.store(id as u8, Ordering::Release);
        }
    }

    fn space_for_range(&self, address: usize, len: usize) -> Result<&SpaceDescriptor> {
        self.layout
            .iter()
            .find(|space| space.contains_range(address, len))
            .ok_or(Error::NotMapped { address, len })
    }

    /// Copies bytes out of a space.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotMapped`] if the range does not lie inside a single space.
    pub fn read(&self, address: usize, buf: &mut [u8]) -> Result<()> {
        self.space_for_range(address, buf.len())?;
        self.vm.read(address, buf)
    }

    /// Copies bytes into a space.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotMapped`] if the range does not lie inside a single space, and
    /// [`Error::ProtectionViolation`] for a write into frozen read-only space.
    pub fn write(&self, address: usize, data: &[u8]) -> Result<()> {
        let space = self.space_for_range(address, data.len())?;
        if space.id == SpaceId::ReadOnly && self.is_read_only_frozen() {
            return Err(Error::ProtectionViolation { address });
        }
        self.vm.write(address, data)
    }

    /// Write-protects read-only space once the image is in place.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Vm`] if the protection change is refused.
    pub fn freeze_read_only(&self) -> Result<()> {
        let Some(space) = self.layout.get(SpaceId::ReadOnly) else {
            return Ok(());
        };

        self.vm.protect(
            space.base,
            space.size,
            Protection::READ | Protection::EXECUTE,
        )?;
        self.frozen.store(true, Ordering::Release);
        debug!("Froze read-only space");
        Ok(())
    }

    /// Returns `true` once [`SpaceTable::freeze_read_only`] has run.
    #[must_use]
    pub fn is_read_only_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }
}

impl Drop for SpaceTable {
    fn drop(&mut self) {
        for space in self.layout.iter().rev() {
            if let Err(error) = self.vm.unmap(space.base, space.size) {
                warn!("Failed to unmap {} space: {error}", space.id);
            }
        }
    }
}

static SPACES: OnceLock<SpaceTable> = OnceLock::new();

/// Maps every space of the host layout and publishes the process-wide table.
///
/// # Errors
///
/// Returns [`Error::AlreadyValidated`] on a second call and [`Error::SpaceMapping`] if a space
/// could not be placed (nothing stays mapped in that case).
pub fn try_validate() -> Result<&'static SpaceTable> {
    if SPACES.get().is_some() {
        return Err(Error::AlreadyValidated);
    }

    let table = SpaceTable::validate_with(layout(Architecture::host()), Box::new(HostVm::new()))?;
    SPACES.set(table).map_err(|_| Error::AlreadyValidated)?;
    SPACES.get().ok_or(Error::AlreadyValidated)
}

/// Maps every space of the host layout, or terminates the process.
///
/// Must run once, before the runtime allocates anything. A space that cannot be placed at
/// its fixed address leaves the runtime unable to run, so this prints
/// `Failed to validate <size> bytes of <space> space at <address>` and exits with status 1.
/// A repeated call is logged and otherwise ignored.
pub fn validate() {
    match try_validate() {
        Ok(_) => {}
        Err(Error::AlreadyValidated) => warn!("Spaces have already been validated"),
        Err(error) => {
            error!("{error}");
            eprintln!("{error}");
            process::exit(1);
        }
    }
}

/// The process-wide table published by [`validate`].
#[must_use]
pub fn spaces() -> Option<&'static SpaceTable> {
    SPACES.get()
}

/// The current dynamic space of the process-wide table.
#[must_use]
pub fn current_dynamic_space() -> Option<SpaceId> {
    spaces().map(SpaceTable::current_dynamic_space)
}
