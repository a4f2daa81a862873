pub mod callconv;
pub mod function;
#[cfg(feature = "llvm")]
pub mod llvm;
pub mod target;

pub use callconv::{
    AdaptableFunction, CallConv, HHVM_MAX_ARGS, MarshalPlan, RegSlot, change_call_conv,
};
pub use function::{FnAttribute, LiftedBody, TranslatedFunction};
#[cfg(feature = "llvm")]
pub use llvm::{AdaptError, LlvmFunction};
pub use target::Arch;
