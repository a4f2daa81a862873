//! Client-side dispatch and the translation pipeline behind it.

pub mod context;
pub mod execution;
pub mod server;
pub mod signals;

pub use context::{
    CodeLoader, LoadError, LocalTranslator, ProcessContext, Resolved, Translator,
};
pub use execution::{Dispatch, DispatchStats, ExecutionContext, PC_OFFSET};
pub use server::{
    Backend, BackendError, CodeRange, ObjectData, ServerStats, TranslateError, TranslatedObject,
    TranslationServer,
};
pub use signals::{
    ActiveStateGuard, SIGNAL_COUNT, SignalHandlerTable, install_latching_handler, restore_handler,
};
