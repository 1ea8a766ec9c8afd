//! Deliberate protection traps: stack guard pages and the automatic GC trigger.
//!
//! Both traps are write protections the runtime sets up itself and expects to hit. When a
//! protection fault arrives, [`SpaceTable::classify_fault`] decides which trap (if any) it was
//! by looking at address-range membership first, then at the trap state:
//!
//! | Fault address                                  | Result                         |
//! |------------------------------------------------|--------------------------------|
//! | guard page of the control or binding stack     | [`FaultKind::GuardPage`]       |
//! | above the armed watermark of the current space | [`FaultKind::GcTrigger`]       |
//! | anywhere else                                  | [`crate::Error::Fault`]        |

use std::sync::atomic::Ordering;

use log::debug;

use super::{spaces, SpaceTable};
use crate::{
    layout::SpaceId,
    os::{
        install_fault_handler, round_up, FaultAction, FaultContext, Protection, Signal,
        PROTECTION_VIOLATION_SIGNAL,
    },
    Error, FaultDeliveryError, Result,
};

/// Protection of the dynamic space above an armed GC trigger.
const TRIGGERED: Protection = Protection::READ.union(Protection::EXECUTE);

/// A protection fault the runtime set up on purpose.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// The overflow guard of a stack was hit.
    GuardPage(SpaceId),
    /// Allocation crossed the watermark armed by [`SpaceTable::set_auto_gc_trigger`].
    GcTrigger,
}

impl SpaceTable {
    fn guard_range(&self, id: SpaceId) -> Option<std::ops::Range<usize>> {
        self.layout.get(id)?.guard_page(self.vm.page_size())
    }

    /// Protects the guard page of every guarded stack, so an overflow faults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Vm`] if a protection change is refused.
    pub fn arm_guard_pages(&self) -> Result<()> {
        for space in self.layout.iter().filter(|space| space.id.is_guarded_stack()) {
            if let Some(guard) = self.guard_range(space.id) {
                self.vm.protect(guard.start, guard.len(), Protection::NONE)?;
                debug!("Armed {} guard page at {:#x}", space.id, guard.start);
            }
        }
        Ok(())
    }

    /// Lifts the guard page of `id`, giving the overflowing code room to unwind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Vm`] if the protection change is refused.
    pub fn disarm_guard_page(&self, id: SpaceId) -> Result<()> {
        let (Some(space), Some(guard)) = (self.layout.get(id), self.guard_range(id)) else {
            return Ok(());
        };

        self.vm.protect(guard.start, guard.len(), space.protection)?;
        Ok(())
    }

    /// Lifts the guard page of `id` from inside a fault handler: no locks, no logging.
    fn release_guard_page(&self, id: SpaceId) -> Result<()> {
        let (Some(space), Some(guard)) = (self.layout.get(id), self.guard_range(id)) else {
            return Ok(());
        };

        self.vm
            .protect_unchecked(guard.start, guard.len(), space.protection)?;
        Ok(())
    }

    /// Disarms the GC trigger from inside a fault handler: no locks, no logging.
    fn release_gc_trigger(&self) -> Result<()> {
        let watermark = self.trigger.swap(0, Ordering::AcqRel);
        if watermark == 0 {
            return Ok(());
        }

        if let Some(space) = self.layout.space_containing(watermark) {
            self.vm
                .protect_unchecked(watermark, space.end() - watermark, space.protection)?;
        }
        Ok(())
    }

    /// Arms the automatic GC trigger `usage` bytes into the current dynamic space.
    ///
    /// Everything from the watermark (rounded up to a page) to the end of the space becomes
    /// read-only, so the first allocation that writes past it faults and is classified as
    /// [`FaultKind::GcTrigger`]. A previously armed trigger is cleared first; a watermark at
    /// or past the end of the space arms nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Vm`] if the protection change is refused.
    pub fn set_auto_gc_trigger(&self, usage: usize) -> Result<()> {
        self.clear_auto_gc_trigger()?;

        let Some(space) = self.layout.get(self.current_dynamic_space()) else {
            return Ok(());
        };

        let watermark = round_up(
            space.base.saturating_add(usage).min(space.end()),
            self.vm.page_size(),
        );
        if watermark >= space.end() {
            return Ok(());
        }

        self.vm
            .protect(watermark, space.end() - watermark, TRIGGERED)?;
        self.trigger.store(watermark, Ordering::Release);
        debug!("Armed GC trigger at {watermark:#x} in {} space", space.id);
        Ok(())
    }

    /// Disarms the automatic GC trigger, restoring the space's protection above it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Vm`] if the protection change is refused.
    pub fn clear_auto_gc_trigger(&self) -> Result<()> {
        let watermark = self.trigger.swap(0, Ordering::AcqRel);
        if watermark == 0 {
            return Ok(());
        }

        if let Some(space) = self.layout.space_containing(watermark) {
            self.vm
                .protect(watermark, space.end() - watermark, space.protection)?;
        }
        Ok(())
    }

    /// The armed GC trigger address, if any.
    #[must_use]
    pub fn auto_gc_trigger(&self) -> Option<usize> {
        match self.trigger.load(Ordering::Acquire) {
            0 => None,
            watermark => Some(watermark),
        }
    }

    /// Works out which trap a protection fault at `address` hit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fault`] with the address and its containing space if no trap explains
    /// the fault.
    pub fn classify_fault(&self, address: usize) -> Result<FaultKind> {
        let space = self.layout.space_containing(address);

        if let Some(space) = space {
            if let Some(guard) = self.guard_range(space.id) {
                if guard.contains(&address) {
                    return Ok(FaultKind::GuardPage(space.id));
                }
            }

            if let Some(watermark) = self.auto_gc_trigger() {
                if space.id == self.current_dynamic_space() && address >= watermark {
                    return Ok(FaultKind::GcTrigger);
                }
            }
        }

        Err(Error::Fault(FaultDeliveryError {
            address,
            space: space.map(|space| space.id),
        }))
    }

    /// Reacts to a protection fault at `address`.
    ///
    /// A guard page hit lifts the guard, a GC trigger hit disarms the trigger and records a
    /// pending collection (see [`SpaceTable::take_gc_pending`]); in both cases the faulting
    /// write can be retried. Anything else is [`FaultAction::Unhandled`].
    ///
    /// Runs inside the signal handler, so protection changes go through
    /// [`crate::os::VmBackend::protect_unchecked`] and nothing is logged.
    pub fn handle_fault(&self, address: usize) -> FaultAction {
        match self.classify_fault(address) {
            Ok(FaultKind::GuardPage(id)) => match self.release_guard_page(id) {
                Ok(()) => FaultAction::Resume,
                Err(_) => FaultAction::Unhandled,
            },
            Ok(FaultKind::GcTrigger) => match self.release_gc_trigger() {
                Ok(()) => {
                    self.gc_pending.store(true, Ordering::Release);
                    FaultAction::Resume
                }
                Err(_) => FaultAction::Unhandled,
            },
            Err(_) => FaultAction::Unhandled,
        }
    }

    /// Returns `true` once if a GC trigger fired since the last call.
    pub fn take_gc_pending(&self) -> bool {
        self.gc_pending.swap(false, Ordering::AcqRel)
    }
}

fn protection_fault(_signal: Signal, _reason: i32, context: &mut dyn FaultContext) -> FaultAction {
    match spaces() {
        Some(table) => table.handle_fault(context.fault_address()),
        None => FaultAction::Unhandled,
    }
}

/// Routes [`PROTECTION_VIOLATION_SIGNAL`] to the process-wide table's
/// [`SpaceTable::handle_fault`].
///
/// # Errors
///
/// Returns [`Error::FileError`] if the handler cannot be installed.
pub fn install_protection_handler() -> Result<()> {
    install_fault_handler(PROTECTION_VIOLATION_SIGNAL, protection_fault)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{atomic::AtomicUsize, Arc};

    use crate::{
        layout::{Architecture, LayoutOptions},
        os::{SimulatedVm, VmBackend},
        MappingError,
    };

    /// Counts which protection path the table takes.
    #[derive(Default)]
    struct Counts {
        checked: AtomicUsize,
        unchecked: AtomicUsize,
    }

    struct CountingVm {
        inner: SimulatedVm,
        counts: Arc<Counts>,
    }

    impl VmBackend for CountingVm {
        fn map(
            &self,
            address: usize,
            size: usize,
            protection: Protection,
        ) -> std::result::Result<(), MappingError> {
            self.inner.map(address, size, protection)
        }

        fn unmap(&self, address: usize, size: usize) -> std::result::Result<(), MappingError> {
            self.inner.unmap(address, size)
        }

        fn protect(
            &self,
            address: usize,
            size: usize,
            protection: Protection,
        ) -> std::result::Result<(), MappingError> {
            self.counts.checked.fetch_add(1, Ordering::SeqCst);
            self.inner.protect(address, size, protection)
        }

        fn protect_unchecked(
            &self,
            address: usize,
            size: usize,
            protection: Protection,
        ) -> std::result::Result<(), MappingError> {
            self.counts.unchecked.fetch_add(1, Ordering::SeqCst);
            self.inner.protect(address, size, protection)
        }

        fn read(&self, address: usize, buf: &mut [u8]) -> Result<()> {
            self.inner.read(address, buf)
        }

        fn write(&self, address: usize, data: &[u8]) -> Result<()> {
            self.inner.write(address, data)
        }
    }

    fn simulated() -> (SpaceTable, SimulatedVm) {
        let vm = SimulatedVm::new();
        let table = SpaceTable::validate_with(
            LayoutOptions::new()
                .with_dynamic_space_size(None)
                .build(Architecture::Hppa),
            Box::new(vm.clone()),
        )
        .unwrap();
        (table, vm)
    }

    #[test]
    fn test_gc_trigger_traps_writes_past_watermark() {
        let (table, _vm) = simulated();
        let base = table.descriptor(SpaceId::Dynamic0).unwrap().base;

        table.set_auto_gc_trigger(0x1800).unwrap();
        assert_eq!(table.auto_gc_trigger(), Some(base + 0x2000));

        table.write(base + 0x1ff0, &[1u8; 16]).unwrap();
        let address = match table.write(base + 0x2000, &[1u8; 8]) {
            Err(Error::ProtectionViolation { address }) => address,
            other => panic!("expected a trap, got {other:?}"),
        };

        assert_eq!(table.classify_fault(address).unwrap(), FaultKind::GcTrigger);
        assert_eq!(table.handle_fault(address), FaultAction::Resume);
        assert!(table.take_gc_pending());
        assert!(!table.take_gc_pending());
        assert_eq!(table.auto_gc_trigger(), None);

        // Disarmed: the retried write goes through
        table.write(base + 0x2000, &[1u8; 8]).unwrap();
    }

    #[test]
    fn test_gc_trigger_past_end_arms_nothing() {
        let (table, _vm) = simulated();
        table.set_auto_gc_trigger(usize::MAX).unwrap();
        assert_eq!(table.auto_gc_trigger(), None);
    }

    #[test]
    fn test_flip_disarms_trigger() {
        let (table, vm) = simulated();
        let base = table.descriptor(SpaceId::Dynamic0).unwrap().base;

        table.set_auto_gc_trigger(0).unwrap();
        assert_eq!(vm.protection_at(base), Some(TRIGGERED));

        table.flip_dynamic_space();
        assert_eq!(table.auto_gc_trigger(), None);
        assert_eq!(vm.protection_at(base), Some(Protection::ALL));
    }

    #[test]
    fn test_trigger_in_other_space_is_not_gc() {
        let (table, _vm) = simulated();
        table.set_auto_gc_trigger(0).unwrap();

        let other = table.descriptor(SpaceId::Dynamic1).unwrap().base;
        assert!(matches!(
            table.classify_fault(other),
            Err(Error::Fault(FaultDeliveryError {
                space: Some(SpaceId::Dynamic1),
                ..
            }))
        ));
    }

    #[test]
    fn test_guard_page() {
        let (table, vm) = simulated();
        table.arm_guard_pages().unwrap();

        let control = *table.descriptor(SpaceId::ControlStack).unwrap();
        let guard = control.end() - vm.page_size();
        assert_eq!(vm.protection_at(guard), Some(Protection::NONE));

        let address = match table.write(guard + 8, &[0u8; 8]) {
            Err(Error::ProtectionViolation { address }) => address,
            other => panic!("expected a trap, got {other:?}"),
        };
        assert_eq!(
            table.classify_fault(address).unwrap(),
            FaultKind::GuardPage(SpaceId::ControlStack)
        );

        assert_eq!(table.handle_fault(address), FaultAction::Resume);
        assert_eq!(vm.protection_at(guard), Some(control.protection));
    }

    #[test]
    fn test_fault_path_uses_unchecked_protect() {
        let counts = Arc::new(Counts::default());
        let table = SpaceTable::validate_with(
            LayoutOptions::new()
                .with_dynamic_space_size(None)
                .build(Architecture::Hppa),
            Box::new(CountingVm {
                inner: SimulatedVm::new(),
                counts: counts.clone(),
            }),
        )
        .unwrap();

        table.arm_guard_pages().unwrap();
        table.set_auto_gc_trigger(0x1000).unwrap();
        let checked = counts.checked.load(Ordering::SeqCst);
        assert_eq!(counts.unchecked.load(Ordering::SeqCst), 0);

        let control = *table.descriptor(SpaceId::ControlStack).unwrap();
        let trigger = table.auto_gc_trigger().unwrap();
        assert_eq!(table.handle_fault(control.end() - 1), FaultAction::Resume);
        assert_eq!(table.handle_fault(trigger), FaultAction::Resume);

        assert_eq!(counts.checked.load(Ordering::SeqCst), checked);
        assert_eq!(counts.unchecked.load(Ordering::SeqCst), 2);
        assert!(table.take_gc_pending());
        table.write(trigger, &[1u8; 8]).unwrap();
    }

    #[test]
    fn test_unknown_fault() {
        let (table, _vm) = simulated();

        let error = table.classify_fault(0x0000_1000).unwrap_err();
        assert!(matches!(
            error,
            Error::Fault(FaultDeliveryError {
                address: 0x1000,
                space: None
            })
        ));
        assert_eq!(table.handle_fault(0x2800_0000), FaultAction::Unhandled);
    }
}
