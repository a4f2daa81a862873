//! Per-CPU execution state shared with generated dispatch code.
//!
//! Generated code addresses the register region and the quick dispatch table by raw byte offset
//! from the state pointer, so field order is fixed and checked at compile time below.
//!
//! Layout (bytes, 64-bit hosts):
//! - `0x000` self pointer
//! - `0x008` process context pointer
//! - `0x010` dispatch table generation
//! - `0x018` reserved
//! - `0x040` register storage (`0x400` bytes)
//! - `0x440` quick dispatch table (`1024 × 16` bytes)
//! - signal bookkeeping (not part of the generated-code contract)

use core::cell::UnsafeCell;
use core::fmt;
use core::mem::offset_of;
use core::sync::atomic::{AtomicI32, Ordering};
use std::alloc::{self, Layout};

use crate::quick_tlb::QuickTlb;

pub const REGDATA_SIZE: usize = 0x400;

pub const SELF_OFFSET: usize = 0x00;
pub const CONTEXT_OFFSET: usize = 0x08;
pub const TLB_GENERATION_OFFSET: usize = 0x10;
pub const REGDATA_OFFSET: usize = 0x40;
pub const QUICK_TLB_OFFSET: usize = 0x440;

/// Guest register storage. The layout inside is owned by the lifter.
#[derive(Clone)]
#[repr(C, align(64))]
pub struct RegData(pub [u8; REGDATA_SIZE]);

#[repr(C)]
pub struct ExecutionState<S> {
    this: *mut ExecutionState<S>,
    context: *const S,
    tlb_generation: u64,
    _reserved: [u64; 5],

    regdata: RegData,
    quick_tlb: QuickTlb,

    sigpending: AtomicI32,
    sigmask: UnsafeCell<libc::sigset_t>,
    sigaltstack: UnsafeCell<libc::stack_t>,
    siginfo: UnsafeCell<libc::siginfo_t>,
}

const _: () = {
    assert!(
        core::mem::size_of::<usize>() == 8,
        "execution state layout requires a 64-bit host"
    );

    assert!(offset_of!(ExecutionState<()>, this) == SELF_OFFSET);
    assert!(offset_of!(ExecutionState<()>, context) == CONTEXT_OFFSET);
    assert!(offset_of!(ExecutionState<()>, tlb_generation) == TLB_GENERATION_OFFSET);
    assert!(
        offset_of!(ExecutionState<()>, regdata) == REGDATA_OFFSET,
        "REGDATA_OFFSET mismatch"
    );
    assert!(
        offset_of!(ExecutionState<()>, quick_tlb) == QUICK_TLB_OFFSET,
        "QUICK_TLB_OFFSET mismatch"
    );
    // The dispatch table directly follows register storage.
    assert!(REGDATA_OFFSET + REGDATA_SIZE == QUICK_TLB_OFFSET);
    assert!(REGDATA_OFFSET % 64 == 0 && QUICK_TLB_OFFSET % 64 == 0);

    // The context pointer is only ever a thin pointer, so every instantiation shares one layout.
    assert!(
        offset_of!(ExecutionState<[u64; 32]>, quick_tlb)
            == offset_of!(ExecutionState<()>, quick_tlb)
    );
};

/// Signal state latched by the handler and replayed by the execution loop at a safe point.
#[derive(Clone, Copy)]
pub struct PendingSignal {
    pub info: libc::siginfo_t,
    pub mask: libc::sigset_t,
    pub altstack: libc::stack_t,
}

impl PendingSignal {
    pub fn signo(&self) -> i32 {
        self.info.si_signo
    }
}

impl fmt::Debug for PendingSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSignal")
            .field("signo", &self.signo())
            .field("code", &self.info.si_code)
            .finish_non_exhaustive()
    }
}

impl<S> ExecutionState<S> {
    /// Allocates a zeroed state on the heap and points it at itself and at `context`.
    ///
    /// The state is boxed so that the self pointer stays valid for its whole lifetime.
    pub fn new_boxed(context: *const S) -> Box<Self> {
        let layout = Layout::new::<Self>();
        // SAFETY: every field is valid when all-zero (null pointers, zero integers and atomics,
        // zeroed libc records), and the pointer comes from the global allocator with `Self`'s
        // layout, which is what `Box::from_raw` expects.
        let mut state = unsafe {
            let raw = alloc::alloc_zeroed(layout).cast::<Self>();
            if raw.is_null() {
                alloc::handle_alloc_error(layout);
            }
            Box::from_raw(raw)
        };
        let this: *mut Self = &mut *state;
        state.this = this;
        state.context = context;
        state
    }

    /// Recovers the state from a pointer to its register storage.
    ///
    /// # Safety
    ///
    /// `regdata` must point at the register region of a live `ExecutionState<S>`.
    pub unsafe fn from_regdata(regdata: *mut u8) -> *mut Self {
        // SAFETY: guaranteed by the caller; the region sits at a fixed offset.
        unsafe { regdata.byte_sub(REGDATA_OFFSET).cast() }
    }

    pub fn as_ptr(&self) -> *mut Self {
        self.this
    }

    pub fn context_ptr(&self) -> *const S {
        self.context
    }

    pub fn regs(&self) -> &[u8; REGDATA_SIZE] {
        &self.regdata.0
    }

    pub fn regs_mut(&mut self) -> &mut [u8; REGDATA_SIZE] {
        &mut self.regdata.0
    }

    pub fn regdata_ptr(&mut self) -> *mut u8 {
        self.regdata.0.as_mut_ptr()
    }

    pub fn quick_tlb(&self) -> &QuickTlb {
        &self.quick_tlb
    }

    pub fn quick_tlb_mut(&mut self) -> &mut QuickTlb {
        &mut self.quick_tlb
    }

    pub fn tlb_generation(&self) -> u64 {
        self.tlb_generation
    }

    /// Flushes the dispatch table if it was filled under a different generation.
    ///
    /// Returns `true` when a flush happened.
    pub fn sync_generation(&mut self, generation: u64) -> bool {
        if self.tlb_generation == generation {
            return false;
        }
        self.quick_tlb.clear();
        self.tlb_generation = generation;
        true
    }

    pub fn signal_pending(&self) -> bool {
        self.sigpending.load(Ordering::Acquire) != 0
    }

    /// Records a signal for later delivery and raises the pending flag.
    ///
    /// Only copies plain data and performs one atomic store, so it is async-signal-safe.
    ///
    /// # Safety
    ///
    /// Must only be called on the thread that owns this state (typically from its signal handler),
    /// and must not race with another `latch_signal` on the same state.
    pub unsafe fn latch_signal(
        &self,
        info: &libc::siginfo_t,
        mask: &libc::sigset_t,
        altstack: &libc::stack_t,
    ) {
        // SAFETY: single writer per the caller contract; readers only look at these fields after
        // observing the flag with acquire ordering.
        unsafe {
            *self.siginfo.get() = *info;
            *self.sigmask.get() = *mask;
            *self.sigaltstack.get() = *altstack;
        }
        self.sigpending.store(1, Ordering::Release);
    }

    /// Clears the pending flag and hands out the latched signal, if any.
    ///
    /// Signals are blocked on this thread while the flag is cleared and the records are copied,
    /// so a second signal can neither tear the copy nor be lost between the two steps; it is
    /// latched once the mask is restored.
    pub fn take_pending_signal(&self) -> Option<PendingSignal> {
        if self.sigpending.load(Ordering::Acquire) == 0 {
            return None;
        }

        let _blocked = BlockedSignals::new();
        if self.sigpending.swap(0, Ordering::AcqRel) == 0 {
            return None;
        }
        // SAFETY: the flag was set, so the latched fields are fully written, and the only writer
        // is a handler on this thread, which cannot run while signals are blocked.
        unsafe {
            Some(PendingSignal {
                info: *self.siginfo.get(),
                mask: *self.sigmask.get(),
                altstack: *self.sigaltstack.get(),
            })
        }
    }

    /// Reads a native-endian 64-bit register at `offset` into register storage.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 8` exceeds [`REGDATA_SIZE`].
    pub fn read_reg(&self, offset: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.regdata.0[offset..offset + 8]);
        u64::from_ne_bytes(bytes)
    }

    /// Writes a native-endian 64-bit register at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 8` exceeds [`REGDATA_SIZE`].
    pub fn write_reg(&mut self, offset: usize, value: u64) {
        self.regdata.0[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
    }
}

/// Blocks every blockable signal on the current thread until dropped.
struct BlockedSignals {
    previous: libc::sigset_t,
}

impl BlockedSignals {
    fn new() -> Self {
        // SAFETY: both sets are plain data initialised by sigfillset/pthread_sigmask before use.
        unsafe {
            let mut all: libc::sigset_t = core::mem::zeroed();
            let mut previous: libc::sigset_t = core::mem::zeroed();
            libc::sigfillset(&mut all);
            libc::pthread_sigmask(libc::SIG_BLOCK, &all, &mut previous);
            Self { previous }
        }
    }
}

impl Drop for BlockedSignals {
    fn drop(&mut self) {
        // SAFETY: restores the mask saved in `new` on the same thread.
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, core::ptr::null_mut());
        }
    }
}

impl<S> fmt::Debug for ExecutionState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionState")
            .field("this", &self.this)
            .field("tlb_generation", &self.tlb_generation)
            .field("quick_tlb", &self.quick_tlb)
            .field("signal_pending", &self.signal_pending())
            .finish_non_exhaustive()
    }
}
