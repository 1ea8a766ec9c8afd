//! Fault handler calling convention and the register accessor.
//!
//! The runtime traps protection faults on purpose: guard pages at the end of the stacks and
//! the write barrier behind the automatic GC trigger both work by letting the hardware fault
//! and deciding afterwards what happened. This module is the host-facing half of that:
//!
//! - [`install_fault_handler`] wires a [`FaultHandler`] to a signal with `SA_SIGINFO`
//! - [`FaultContext`] exposes the faulting address, the reason code and the general purpose
//!   registers of the interrupted thread, readable and writable
//! - [`HostContext`] is the `siginfo_t`/`ucontext_t` implementation, [`SyntheticContext`] the
//!   in-memory one used in tests
//!
//! Handlers run in signal context. They must stick to atomics and plain memory; no locks, no
//! allocation, no logging.

use std::{
    io, ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{Error, Result};

/// A host signal number.
pub type Signal = libc::c_int;

/// The signal a write to a protected page raises on this host.
#[cfg(any(target_os = "freebsd", target_os = "macos", target_os = "ios"))]
pub const PROTECTION_VIOLATION_SIGNAL: Signal = libc::SIGBUS;

/// The signal a write to a protected page raises on this host.
#[cfg(not(any(target_os = "freebsd", target_os = "macos", target_os = "ios")))]
pub const PROTECTION_VIOLATION_SIGNAL: Signal = libc::SIGSEGV;

/// What the trampoline does once the handler returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultAction {
    /// The fault was dealt with; resume the interrupted thread with the (possibly modified)
    /// register context.
    Resume,
    /// The handler does not know this fault. The default disposition is restored, so the
    /// faulting instruction re-raises and the process terminates the usual way.
    Unhandled,
}

/// A fault handler: `(signal, reason code, context) -> action`.
pub type FaultHandler = fn(Signal, i32, &mut dyn FaultContext) -> FaultAction;

/// The machine state of a thread at the time it faulted.
///
/// Register indices follow the host's context layout; [`FaultContext::pc_index`] names the
/// slot holding the program counter.
pub trait FaultContext {
    /// The address whose access faulted.
    fn fault_address(&self) -> usize;

    /// The host reason code (`si_code`).
    fn reason(&self) -> i32;

    /// Number of registers [`FaultContext::register`] can address.
    fn register_count(&self) -> usize;

    /// Reads register `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RegisterIndex`] for an index past [`FaultContext::register_count`], or
    /// [`Error::NotSupported`] if the host has no register map.
    fn register(&self, index: usize) -> Result<usize>;

    /// Overwrites register `index`; the thread resumes with the new value.
    ///
    /// # Errors
    ///
    /// Same as [`FaultContext::register`].
    fn set_register(&mut self, index: usize, value: usize) -> Result<()>;

    /// The index of the program counter, if the context exposes one.
    fn pc_index(&self) -> Option<usize>;

    /// Reads the program counter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSupported`] if the context has no program counter slot.
    fn program_counter(&self) -> Result<usize> {
        let index = self.pc_index().ok_or(Error::NotSupported)?;
        self.register(index)
    }

    /// Moves the program counter, e.g. to skip the faulting instruction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSupported`] if the context has no program counter slot.
    fn set_program_counter(&mut self, value: usize) -> Result<()> {
        let index = self.pc_index().ok_or(Error::NotSupported)?;
        self.set_register(index, value)
    }
}

/// Reads register `index` of a fault context.
///
/// # Errors
///
/// See [`FaultContext::register`].
pub fn register(context: &dyn FaultContext, index: usize) -> Result<usize> {
    context.register(index)
}

/// Writes register `index` of a fault context.
///
/// # Errors
///
/// See [`FaultContext::set_register`].
pub fn set_register(context: &mut dyn FaultContext, index: usize, value: usize) -> Result<()> {
    context.set_register(index, value)
}

fn check_index(index: usize, count: usize) -> Result<()> {
    if count == 0 {
        return Err(Error::NotSupported);
    }
    if index >= count {
        return Err(Error::RegisterIndex { index, count });
    }
    Ok(())
}

/// An in-memory fault context.
///
/// ```rust
/// use corespace::os::{register, set_register, SyntheticContext};
///
/// let mut context = SyntheticContext::new(0x2800_0000, 32);
/// set_register(&mut context, 0, 0xdead_beef)?;
/// assert_eq!(register(&context, 0)?, 0xdead_beef);
/// # Ok::<(), corespace::Error>(())
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntheticContext {
    address: usize,
    reason: i32,
    registers: Vec<usize>,
    pc_index: Option<usize>,
}

impl SyntheticContext {
    /// A context faulting at `address` with `register_count` zeroed registers.
    #[must_use]
    pub fn new(address: usize, register_count: usize) -> Self {
        SyntheticContext {
            address,
            reason: 0,
            registers: vec![0; register_count],
            pc_index: None,
        }
    }

    /// Sets the reason code.
    #[must_use]
    pub fn with_reason(mut self, reason: i32) -> Self {
        self.reason = reason;
        self
    }

    /// Designates register `index` as the program counter.
    #[must_use]
    pub fn with_pc_index(mut self, index: usize) -> Self {
        self.pc_index = Some(index);
        self
    }

    /// All registers, in index order.
    #[must_use]
    pub fn registers(&self) -> &[usize] {
        &self.registers
    }
}

impl FaultContext for SyntheticContext {
    fn fault_address(&self) -> usize {
        self.address
    }

    fn reason(&self) -> i32 {
        self.reason
    }

    fn register_count(&self) -> usize {
        self.registers.len()
    }

    fn register(&self, index: usize) -> Result<usize> {
        check_index(index, self.registers.len())?;
        Ok(self.registers[index])
    }

    fn set_register(&mut self, index: usize, value: usize) -> Result<()> {
        check_index(index, self.registers.len())?;
        self.registers[index] = value;
        Ok(())
    }

    fn pc_index(&self) -> Option<usize> {
        self.pc_index
    }
}

/// Register layouts of the supported host machine contexts.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod machine {
    pub const PC: Option<usize> = Some(libc::REG_RIP as usize);

    pub fn count(context: &libc::ucontext_t) -> usize {
        context.uc_mcontext.gregs.len()
    }

    pub fn get(context: &libc::ucontext_t, index: usize) -> usize {
        context.uc_mcontext.gregs[index] as usize
    }

    pub fn set(context: &mut libc::ucontext_t, index: usize, value: usize) {
        context.uc_mcontext.gregs[index] = value as libc::greg_t;
    }
}

// x0-x30, then sp and pc
#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
mod machine {
    const SP: usize = 31;
    pub const PC: Option<usize> = Some(32);

    pub fn count(_context: &libc::ucontext_t) -> usize {
        33
    }

    pub fn get(context: &libc::ucontext_t, index: usize) -> usize {
        let mcontext = &context.uc_mcontext;
        match index {
            SP => mcontext.sp as usize,
            32 => mcontext.pc as usize,
            _ => mcontext.regs[index] as usize,
        }
    }

    pub fn set(context: &mut libc::ucontext_t, index: usize, value: usize) {
        let mcontext = &mut context.uc_mcontext;
        match index {
            SP => mcontext.sp = value as u64,
            32 => mcontext.pc = value as u64,
            _ => mcontext.regs[index] = value as u64,
        }
    }
}

#[cfg(not(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
mod machine {
    pub const PC: Option<usize> = None;

    pub fn count(_context: &libc::ucontext_t) -> usize {
        0
    }

    pub fn get(_context: &libc::ucontext_t, _index: usize) -> usize {
        0
    }

    pub fn set(_context: &mut libc::ucontext_t, _index: usize, _value: usize) {}
}

/// The fault context the host hands to a `SA_SIGINFO` handler.
pub struct HostContext<'a> {
    info: &'a libc::siginfo_t,
    context: &'a mut libc::ucontext_t,
}

impl HostContext<'_> {
    /// Wraps the raw handler arguments, or `None` if either pointer is null.
    ///
    /// # Safety
    ///
    /// Both pointers must come from the kernel's signal delivery and stay valid for the
    /// lifetime of the returned context.
    pub unsafe fn from_raw(info: *mut libc::siginfo_t, context: *mut libc::c_void) -> Option<Self> {
        let info = unsafe { info.as_ref()? };
        let context = unsafe { context.cast::<libc::ucontext_t>().as_mut()? };
        Some(HostContext { info, context })
    }
}

impl FaultContext for HostContext<'_> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn fault_address(&self) -> usize {
        unsafe { self.info.si_addr() as usize }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn fault_address(&self) -> usize {
        self.info.si_addr as usize
    }

    fn reason(&self) -> i32 {
        self.info.si_code
    }

    fn register_count(&self) -> usize {
        machine::count(self.context)
    }

    fn register(&self, index: usize) -> Result<usize> {
        check_index(index, machine::count(self.context))?;
        Ok(machine::get(self.context, index))
    }

    fn set_register(&mut self, index: usize, value: usize) -> Result<()> {
        check_index(index, machine::count(self.context))?;
        machine::set(self.context, index, value);
        Ok(())
    }

    fn pc_index(&self) -> Option<usize> {
        machine::PC
    }
}

const MAX_SIGNAL: usize = 65;

static HANDLERS: [AtomicUsize; MAX_SIGNAL] = [const { AtomicUsize::new(0) }; MAX_SIGNAL];

fn slot(signal: Signal) -> Result<&'static AtomicUsize> {
    usize::try_from(signal)
        .ok()
        .and_then(|index| HANDLERS.get(index))
        .ok_or(Error::NotSupported)
}

extern "C" fn trampoline(signal: Signal, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    let raw = match slot(signal) {
        Ok(slot) => slot.load(Ordering::Acquire),
        Err(_) => 0,
    };

    let action = match unsafe { HostContext::from_raw(info, context) } {
        Some(mut host) if raw != 0 => {
            let handler = unsafe { std::mem::transmute::<usize, FaultHandler>(raw) };
            let reason = host.reason();
            handler(signal, reason, &mut host)
        }
        _ => FaultAction::Unhandled,
    };

    if action == FaultAction::Unhandled {
        let _ = restore_default_handler(signal);
    }
}

fn set_disposition(signal: Signal, handler: libc::sighandler_t, flags: libc::c_int) -> Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler;
        action.sa_flags = flags;
        libc::sigemptyset(&mut action.sa_mask);

        if libc::sigaction(signal, &action, ptr::null_mut()) != 0 {
            return Err(Error::FileError(io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Installs `handler` for `signal`.
///
/// The handler receives the reason code and a [`HostContext`]. Returning
/// [`FaultAction::Resume`] resumes the thread with whatever registers the handler wrote.
///
/// # Errors
///
/// Returns [`Error::NotSupported`] for a signal number outside the handler table, or
/// [`Error::FileError`] if `sigaction` fails.
pub fn install_fault_handler(signal: Signal, handler: FaultHandler) -> Result<()> {
    let slot = slot(signal)?;
    slot.store(handler as usize, Ordering::Release);

    let trampoline: extern "C" fn(Signal, *mut libc::siginfo_t, *mut libc::c_void) = trampoline;
    let result = set_disposition(
        signal,
        trampoline as libc::sighandler_t,
        libc::SA_SIGINFO | libc::SA_NODEFER,
    );

    if result.is_err() {
        slot.store(0, Ordering::Release);
    }
    result
}

/// Restores the default disposition of `signal` and forgets its handler.
///
/// # Errors
///
/// Same as [`install_fault_handler`].
pub fn restore_default_handler(signal: Signal) -> Result<()> {
    slot(signal)?.store(0, Ordering::Release);
    set_disposition(signal, libc::SIG_DFL, 0)
}
