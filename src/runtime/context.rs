use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, warn};
use transcache_abi::CodePtr;

use crate::runtime::server::{Backend, TranslateError, TranslatedObject, TranslationServer};
use crate::runtime::signals::SignalHandlerTable;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("object for {addr:#x} is malformed: {reason}")]
    Malformed { addr: u64, reason: String },
    #[error("failed to map executable memory")]
    Map(#[source] std::io::Error),
    #[error("object for {addr:#x} does not define its entry point")]
    MissingEntry { addr: u64 },
}

/// Produces host code for guest addresses.
pub trait Translator {
    fn translate(&mut self, addr: u64) -> Result<CodePtr, TranslateError>;
}

/// Links an object into executable memory and returns its entry point.
pub trait CodeLoader {
    fn load(&mut self, addr: u64, object: &[u8]) -> Result<CodePtr, LoadError>;
}

/// Server and loader living in the same process.
pub struct LocalTranslator<B, L> {
    server: TranslationServer<B>,
    loader: L,
}

impl<B: Backend, L: CodeLoader> LocalTranslator<B, L> {
    pub fn new(server: TranslationServer<B>, loader: L) -> Self {
        Self { server, loader }
    }

    pub fn server(&self) -> &TranslationServer<B> {
        &self.server
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn finish(&self) {
        self.server.finish();
    }

    fn load(&mut self, object: &TranslatedObject) -> Result<CodePtr, TranslateError> {
        let addr = object.addr;
        let bytes = object
            .bytes()
            .map_err(|source| TranslateError::CachedObject {
                addr,
                hash: object.hash,
                source,
            })?;
        self.loader
            .load(addr, &bytes)
            .map_err(|source| TranslateError::Load { addr, source })
    }
}

impl<B: Backend, L: CodeLoader> Translator for LocalTranslator<B, L> {
    fn translate(&mut self, addr: u64) -> Result<CodePtr, TranslateError> {
        let object = self.server.translate(addr)?;
        match self.load(&object) {
            Ok(code) => Ok(code),
            // A cached entry that cannot be read or linked is retranslated, never fatal.
            Err(err) if object.is_cached() => {
                warn!(
                    addr = format_args!("{addr:#x}"),
                    hash = %object.hash,
                    %err,
                    "cached translation unusable, retranslating"
                );
                let object = self.server.retranslate(addr)?;
                self.load(&object)
            }
            Err(err) => Err(err),
        }
    }
}

/// Outcome of [`ProcessContext::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub code: CodePtr,
    /// A translation was requested for this lookup.
    pub translated: bool,
    /// Generation the code was installed under.
    pub generation: u64,
}

/// Process-wide state shared by every execution context.
pub struct ProcessContext<T> {
    translator: Mutex<T>,
    code_map: RwLock<HashMap<u64, CodePtr>>,
    translation_time_ns: AtomicU64,
    generation: AtomicU64,
    signal_handlers: Mutex<SignalHandlerTable>,
}

impl<T: Translator> ProcessContext<T> {
    pub fn new(translator: T) -> Self {
        Self {
            translator: Mutex::new(translator),
            code_map: RwLock::new(HashMap::new()),
            translation_time_ns: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            signal_handlers: Mutex::new(SignalHandlerTable::empty()),
        }
    }

    /// Finds or produces host code for `addr`.
    ///
    /// A translation that raced with [`invalidate_translations`](Self::invalidate_translations)
    /// is discarded and redone, so the returned code always belongs to `generation`.
    pub fn resolve(&self, addr: u64) -> Result<Resolved, TranslateError> {
        if let Some(resolved) = self.installed(addr) {
            return Ok(resolved);
        }

        loop {
            let mut translator = self.translator.lock();
            // Another context may have translated it while we waited for the lock.
            if let Some(resolved) = self.installed(addr) {
                return Ok(resolved);
            }
            let generation = self.generation();

            let start = Instant::now();
            let result = translator.translate(addr);
            let elapsed = u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX);
            self.translation_time_ns.fetch_add(elapsed, Ordering::Relaxed);
            let code = result?;

            let mut code_map = self.code_map.write();
            if self.generation() != generation {
                debug!(
                    addr = format_args!("{addr:#x}"),
                    generation, "translations invalidated mid-flight, retranslating"
                );
                continue;
            }
            code_map.insert(addr, code);
            debug!(addr = format_args!("{addr:#x}"), %code, generation, "installed translation");
            return Ok(Resolved {
                code,
                translated: true,
                generation,
            });
        }
    }

    pub fn translator(&self) -> parking_lot::MutexGuard<'_, T> {
        self.translator.lock()
    }
}

impl<T> ProcessContext<T> {
    // The generation is read under the map lock, which invalidation holds while bumping it.
    fn installed(&self, addr: u64) -> Option<Resolved> {
        let code_map = self.code_map.read();
        code_map.get(&addr).map(|&code| Resolved {
            code,
            translated: false,
            generation: self.generation(),
        })
    }

    /// Cumulative wall time spent in the translator.
    pub fn translation_time(&self) -> Duration {
        Duration::from_nanos(self.translation_time_ns.load(Ordering::Relaxed))
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Forgets every installed translation.
    ///
    /// Dispatch tables filled under the previous generation are flushed before their next lookup.
    pub fn invalidate_translations(&self) {
        let mut code_map = self.code_map.write();
        let dropped = code_map.len();
        code_map.clear();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(dropped, generation, "invalidated translations");
    }

    pub fn translated_count(&self) -> usize {
        self.code_map.read().len()
    }

    pub fn signal_handlers(&self) -> parking_lot::MutexGuard<'_, SignalHandlerTable> {
        self.signal_handlers.lock()
    }
}
