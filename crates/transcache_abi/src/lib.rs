//! Fixed-layout records shared between the runtime and generated dispatch code.
//!
//! Everything in this crate is addressed by raw offset from hand-written trampolines, so the
//! layouts are asserted at compile time and must not be reordered.

pub mod quick_tlb;
pub mod state;

pub use quick_tlb::{
    CodePtr, QUICK_TLB_BITS, QUICK_TLB_ENTRIES, QUICK_TLB_ENTRY_SIZE, QUICK_TLB_INDEX_MASK,
    QuickTlb,
};
pub use state::{
    CONTEXT_OFFSET, ExecutionState, PendingSignal, QUICK_TLB_OFFSET, REGDATA_OFFSET, REGDATA_SIZE,
    RegData, SELF_OFFSET, TLB_GENERATION_OFFSET,
};
