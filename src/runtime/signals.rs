//! Deferred signal delivery.
//!
//! The latching handler never runs guest-visible logic: it records the signal in the execution
//! state of the interrupted thread and returns. The execution loop replays it at its next
//! dispatch, where guest state is consistent.

use std::cell::Cell;
use std::ffi::{c_int, c_void};
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::mem;
use std::ptr;

use transcache_abi::ExecutionState;

/// Number of signal slots, including the unused slot 0.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub const SIGNAL_COUNT: usize = 65;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub const SIGNAL_COUNT: usize = 33;

/// Original dispositions of every signal the translator took over.
#[derive(Clone)]
pub struct SignalHandlerTable {
    handlers: Vec<Option<libc::sigaction>>,
}

impl SignalHandlerTable {
    pub fn empty() -> Self {
        Self {
            handlers: vec![None; SIGNAL_COUNT],
        }
    }

    /// Records the current OS disposition of `signo`.
    pub fn capture(&mut self, signo: c_int) -> io::Result<()> {
        let index = slot(signo)?;
        // SAFETY: all-zero is a valid `sigaction` record.
        let mut current: libc::sigaction = unsafe { mem::zeroed() };
        // SAFETY: a null new action only queries the disposition.
        if unsafe { libc::sigaction(signo, ptr::null(), &raw mut current) } != 0 {
            return Err(io::Error::last_os_error());
        }
        self.handlers[index] = Some(current);
        Ok(())
    }

    pub fn get(&self, signo: c_int) -> Option<&libc::sigaction> {
        let index = slot(signo).ok()?;
        self.handlers[index].as_ref()
    }

    pub fn set(&mut self, signo: c_int, action: libc::sigaction) -> io::Result<()> {
        let index = slot(signo)?;
        self.handlers[index] = Some(action);
        Ok(())
    }

    pub fn captured(&self) -> impl Iterator<Item = c_int> + '_ {
        (0..)
            .zip(self.handlers.iter())
            .filter_map(|(signo, handler)| handler.as_ref().map(|_| signo))
    }
}

impl fmt::Debug for SignalHandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalHandlerTable")
            .field("captured", &self.captured().collect::<Vec<_>>())
            .finish()
    }
}

fn slot(signo: c_int) -> io::Result<usize> {
    usize::try_from(signo)
        .ok()
        .filter(|index| (1..SIGNAL_COUNT).contains(index))
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "signal number out of range"))
}

thread_local! {
    static ACTIVE_STATE: Cell<*const ExecutionState<()>> = const { Cell::new(ptr::null()) };
}

/// Makes a state the target of signals arriving on this thread until dropped.
pub struct ActiveStateGuard<'a> {
    previous: *const ExecutionState<()>,
    _state: PhantomData<&'a ()>,
}

impl<'a> ActiveStateGuard<'a> {
    pub fn new<S>(state: &'a ExecutionState<S>) -> Self {
        // Every instantiation shares one layout, and the handler only touches signal fields.
        let erased = ptr::from_ref(state).cast::<ExecutionState<()>>();
        let previous = ACTIVE_STATE.with(|active| active.replace(erased));
        Self {
            previous,
            _state: PhantomData,
        }
    }
}

impl Drop for ActiveStateGuard<'_> {
    fn drop(&mut self) {
        ACTIVE_STATE.with(|active| active.set(self.previous));
    }
}

/// Whether a state is active on the calling thread.
pub fn has_active_state() -> bool {
    ACTIVE_STATE.try_with(|active| !active.get().is_null()).unwrap_or(false)
}

extern "C" fn latch_handler(_signo: c_int, info: *mut libc::siginfo_t, ucontext: *mut c_void) {
    let state = ACTIVE_STATE.try_with(Cell::get).unwrap_or(ptr::null());
    if state.is_null() || info.is_null() {
        return;
    }

    // SAFETY: all-zero is a valid value for both records.
    let mut mask: libc::sigset_t = unsafe { mem::zeroed() };
    let mut altstack: libc::stack_t = unsafe { mem::zeroed() };

    // SAFETY: the kernel passes a valid ucontext for SA_SIGINFO handlers; the remaining calls are
    // async-signal-safe and only write to our locals.
    unsafe {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        if !ucontext.is_null() {
            mask = (*ucontext.cast::<libc::ucontext_t>()).uc_sigmask;
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            let _ = ucontext;
            libc::pthread_sigmask(libc::SIG_SETMASK, ptr::null(), &raw mut mask);
        }
        libc::sigaltstack(ptr::null(), &raw mut altstack);

        // The guard keeps the state alive while it is registered, and the handler is the only
        // writer on this thread.
        (*state).latch_signal(&*info, &mask, &altstack);
    }
}

/// Routes `signo` to the latching handler, saving the previous disposition in `table` unless one
/// was captured before.
pub fn install_latching_handler(signo: c_int, table: &mut SignalHandlerTable) -> io::Result<()> {
    slot(signo)?;

    // SAFETY: all-zero is a valid `sigaction` record.
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = latch_handler
        as extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void)
        as libc::sighandler_t;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_RESTART;

    // SAFETY: `action` is fully initialised and outlives the call.
    let mut previous: libc::sigaction = unsafe { mem::zeroed() };
    unsafe {
        libc::sigemptyset(&raw mut action.sa_mask);
        if libc::sigaction(signo, &raw const action, &raw mut previous) != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    if table.get(signo).is_none() {
        table.set(signo, previous)?;
    }
    Ok(())
}

/// Puts back the disposition captured for `signo`. Signals never captured are left alone.
pub fn restore_handler(signo: c_int, table: &SignalHandlerTable) -> io::Result<()> {
    let Some(original) = table.get(signo) else {
        return Ok(());
    };
    // SAFETY: `original` came from the OS and is a valid record.
    if unsafe { libc::sigaction(signo, original, ptr::null_mut()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
