use std::ptr;

use transcache_abi::{CodePtr, ExecutionState, PendingSignal};

use crate::runtime::context::{ProcessContext, Translator};
use crate::runtime::server::TranslateError;
use crate::runtime::signals::ActiveStateGuard;

/// Offset of the guest program counter in register storage.
pub const PC_OFFSET: usize = 0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Resolved by the quick dispatch table.
    pub fast: u64,
    /// Went to the process context.
    pub slow: u64,
    /// Slow lookups that needed a new translation.
    pub translated: u64,
}

/// What the execution loop does next.
#[derive(Debug)]
pub enum Dispatch {
    Jump(CodePtr),
    /// A signal arrived since the last dispatch and must be delivered first.
    Signal(PendingSignal),
}

/// One logical CPU: owns its execution state and borrows the process context.
pub struct ExecutionContext<'ctx, T> {
    context: &'ctx ProcessContext<T>,
    state: Box<ExecutionState<ProcessContext<T>>>,
    stats: DispatchStats,
}

impl<'ctx, T: Translator> ExecutionContext<'ctx, T> {
    pub fn new(context: &'ctx ProcessContext<T>) -> Self {
        let mut state = ExecutionState::new_boxed(ptr::from_ref(context));
        state.sync_generation(context.generation());
        Self {
            context,
            state,
            stats: DispatchStats::default(),
        }
    }

    /// Host code for `addr`: quick dispatch table first, then the process context.
    pub fn lookup(&mut self, addr: u64) -> Result<CodePtr, TranslateError> {
        self.state.sync_generation(self.context.generation());

        if let Some(code) = self.state.quick_tlb().lookup(addr) {
            self.stats.fast += 1;
            return Ok(code);
        }

        self.stats.slow += 1;
        let resolved = self.context.resolve(addr)?;
        if resolved.translated {
            self.stats.translated += 1;
        }
        // Tag the table with the generation the code belongs to; a later invalidation flushes it
        // on the next lookup.
        self.state.sync_generation(resolved.generation);
        self.state.quick_tlb_mut().insert(addr, resolved.code);
        Ok(resolved.code)
    }

    /// Delivers a latched signal or dispatches to the current guest program counter.
    pub fn next(&mut self) -> Result<Dispatch, TranslateError> {
        if let Some(signal) = self.state.take_pending_signal() {
            return Ok(Dispatch::Signal(signal));
        }
        let pc = self.state.read_reg(PC_OFFSET);
        self.lookup(pc).map(Dispatch::Jump)
    }
}

impl<'ctx, T> ExecutionContext<'ctx, T> {
    pub fn context(&self) -> &'ctx ProcessContext<T> {
        self.context
    }

    pub fn state(&self) -> &ExecutionState<ProcessContext<T>> {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ExecutionState<ProcessContext<T>> {
        &mut self.state
    }

    /// Pointer handed to generated code.
    pub fn state_ptr(&self) -> *mut ExecutionState<ProcessContext<T>> {
        self.state.as_ptr()
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.state.write_reg(PC_OFFSET, pc);
    }

    pub fn pc(&self) -> u64 {
        self.state.read_reg(PC_OFFSET)
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Routes signals arriving on this thread into this context until the guard drops.
    pub fn activate(&self) -> ActiveStateGuard<'_> {
        ActiveStateGuard::new(&*self.state)
    }
}
