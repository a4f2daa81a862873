//! Translation pipeline in front of the persistent cache.

use std::borrow::Cow;
use std::error::Error;
use std::io;

use thiserror::Error;
use tracing::{debug, info};

use crate::cache::{CacheController, CachedObject, TranslationHash, TranslationHasher};
use crate::codegen::{AdaptableFunction, CallConv, change_call_conv};
use crate::config::TranslatorConfig;
use crate::utils::profiler::Profiler;

pub const PHASE_PREDECODE: &str = "predecode";
pub const PHASE_LIFTING: &str = "lifting";
pub const PHASE_INSTRUMENTATION: &str = "instrumentation";
pub const PHASE_OPTIMIZATION: &str = "optimization";
pub const PHASE_CODEGEN: &str = "codegen";

/// Half-open range `[start, end)` of guest code belonging to one translation unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeRange {
    pub start: u64,
    pub end: u64,
}

impl CodeRange {
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub const fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to decode guest code at {addr:#x}: {reason}")]
    Decode { addr: u64, reason: String },
    #[error("guest memory {start:#x}..{end:#x} is not readable")]
    Memory { start: u64, end: u64 },
    #[error("failed to lift function at {addr:#x}: {reason}")]
    Lift { addr: u64, reason: String },
    #[error("code generation failed: {0}")]
    Codegen(String),
    #[error("calling convention adaptation failed")]
    Adapt(#[source] Box<dyn Error + Send + Sync>),
}

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("no guest code at {0:#x}")]
    EmptyUnit(u64),
    #[error("translation of {addr:#x} failed")]
    Backend {
        addr: u64,
        #[source]
        source: BackendError,
    },
    #[error("cached object {hash} for {addr:#x} is unreadable")]
    CachedObject {
        addr: u64,
        hash: TranslationHash,
        #[source]
        source: io::Error,
    },
    #[error("failed to load translated code for {addr:#x}")]
    Load {
        addr: u64,
        #[source]
        source: super::context::LoadError,
    },
}

/// Decoder, lifter and code generator for one guest/host pair.
pub trait Backend {
    type Function: AdaptableFunction;

    /// Discovers the code ranges that make up the unit starting at `addr`.
    fn decode(&mut self, addr: u64) -> Result<Vec<CodeRange>, BackendError>;

    /// Copies the guest bytes of `range` into `buf`, which is exactly `range.len()` long.
    fn read_code(&mut self, range: CodeRange, buf: &mut [u8]) -> Result<(), BackendError>;

    fn lift(&mut self, addr: u64, ranges: &[CodeRange]) -> Result<Self::Function, BackendError>;

    fn optimize(&mut self, _function: &mut Self::Function) -> Result<(), BackendError> {
        Ok(())
    }

    /// Emits a relocatable object for `function`.
    fn codegen(&mut self, function: Self::Function) -> Result<Vec<u8>, BackendError>;
}

#[derive(Debug)]
pub enum ObjectData {
    Cached(CachedObject),
    Compiled(Vec<u8>),
}

/// Result of translating one unit, ready to be loaded by the client.
#[derive(Debug)]
pub struct TranslatedObject {
    pub addr: u64,
    pub hash: TranslationHash,
    pub data: ObjectData,
}

impl TranslatedObject {
    pub fn is_cached(&self) -> bool {
        matches!(self.data, ObjectData::Cached(_))
    }

    pub fn bytes(&self) -> io::Result<Cow<'_, [u8]>> {
        match &self.data {
            ObjectData::Cached(object) => object.read_to_vec().map(Cow::Owned),
            ObjectData::Compiled(bytes) => Ok(Cow::Borrowed(bytes)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub cache_hits: u64,
    pub compiled: u64,
}

pub struct TranslationServer<B> {
    backend: B,
    cache: CacheController,
    config: TranslatorConfig,
    call_conv: CallConv,
    config_digest: TranslationHash,
    profiler: Profiler,
    stats: ServerStats,
    range_buffer: Vec<u8>,
}

impl<B: Backend> TranslationServer<B> {
    pub fn new(backend: B, config: TranslatorConfig) -> Self {
        let cache = CacheController::new(&config.cache);
        Self::with_cache(backend, config, cache)
    }

    pub fn with_cache(backend: B, config: TranslatorConfig, cache: CacheController) -> Self {
        let call_conv = config.call_conv();
        let config_digest = config.digest();
        debug!(
            guest = %config.guest_arch,
            host = %config.host_arch,
            ?call_conv,
            cache = cache.is_enabled(),
            "translation server ready"
        );
        Self {
            backend,
            cache,
            config,
            call_conv,
            config_digest,
            profiler: Profiler::new(),
            stats: ServerStats::default(),
            range_buffer: Vec::new(),
        }
    }

    /// Convention the client trampoline must use to call translated code.
    pub fn call_conv(&self) -> CallConv {
        self.call_conv
    }

    pub fn config(&self) -> &TranslatorConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheController {
        &self.cache
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    /// Hashes the configuration digest, the unit address and every code range.
    ///
    /// Position-independent code hashes with address 0 so identical code at different load
    /// addresses shares one entry.
    pub fn unit_hash(
        &mut self,
        addr: u64,
        ranges: &[CodeRange],
    ) -> Result<TranslationHash, BackendError> {
        let hash_addr = if self.config.pic { 0 } else { addr };

        let mut hasher = TranslationHasher::new();
        hasher.update_hash(&self.config_digest).update_u64(hash_addr);
        for range in ranges {
            let size = range.len();
            self.range_buffer.resize(size as usize, 0);
            self.backend.read_code(*range, &mut self.range_buffer)?;
            hasher
                .update_u64(range.start.wrapping_sub(hash_addr))
                .update_u64(size)
                .update(&self.range_buffer);
        }
        Ok(hasher.finish())
    }

    /// Returns the object for the unit at `addr`, from the cache when possible.
    pub fn translate(&mut self, addr: u64) -> Result<TranslatedObject, TranslateError> {
        self.translate_unit(addr, true)
    }

    /// Like [`translate`](Self::translate) but never serves the cached object, for when loading
    /// it failed on the client side.
    pub fn retranslate(&mut self, addr: u64) -> Result<TranslatedObject, TranslateError> {
        self.translate_unit(addr, false)
    }

    fn translate_unit(
        &mut self,
        addr: u64,
        use_cached: bool,
    ) -> Result<TranslatedObject, TranslateError> {
        let backend_err = |source| TranslateError::Backend { addr, source };

        let start = std::time::Instant::now();
        let ranges = self.backend.decode(addr).map_err(backend_err)?;
        if ranges.iter().all(CodeRange::is_empty) {
            return Err(TranslateError::EmptyUnit(addr));
        }
        let hash = self.unit_hash(addr, &ranges).map_err(backend_err)?;

        if use_cached {
            if let Some(object) = self.cache.get(&hash) {
                self.profiler.add(PHASE_PREDECODE, start.elapsed());
                self.stats.cache_hits += 1;
                debug!(addr = format_args!("{addr:#x}"), %hash, "served from cache");
                return Ok(TranslatedObject {
                    addr,
                    hash,
                    data: ObjectData::Cached(object),
                });
            }
        }
        self.profiler.add(PHASE_PREDECODE, start.elapsed());

        let call_conv = self.call_conv;
        let guest = self.config.guest_arch;
        let backend = &mut self.backend;
        let profiler = &mut self.profiler;

        let function = profiler
            .record_phase(PHASE_LIFTING, || backend.lift(addr, &ranges))
            .map_err(backend_err)?;
        let mut function = profiler
            .record_phase(PHASE_INSTRUMENTATION, || {
                change_call_conv(function, call_conv, guest)
            })
            .map_err(|err| backend_err(BackendError::Adapt(Box::new(err))))?;
        profiler
            .record_phase(PHASE_OPTIMIZATION, || backend.optimize(&mut function))
            .map_err(backend_err)?;
        let object = profiler
            .record_phase(PHASE_CODEGEN, || backend.codegen(function))
            .map_err(backend_err)?;

        self.cache.put(&hash, &object);
        self.stats.compiled += 1;
        debug!(
            addr = format_args!("{addr:#x}"),
            %hash,
            size = object.len(),
            "translated"
        );

        Ok(TranslatedObject {
            addr,
            hash,
            data: ObjectData::Compiled(object),
        })
    }

    /// Reports the per-phase profile when profiling is enabled.
    pub fn finish(&self) {
        if !self.config.profile {
            return;
        }
        let millis = |name| {
            self.profiler
                .get(name)
                .map_or(0, |duration| duration.as_millis())
        };
        info!(
            predecode_ms = millis(PHASE_PREDECODE),
            lifting_ms = millis(PHASE_LIFTING),
            instrumentation_ms = millis(PHASE_INSTRUMENTATION),
            optimization_ms = millis(PHASE_OPTIMIZATION),
            codegen_ms = millis(PHASE_CODEGEN),
            cache_hits = self.stats.cache_hits,
            compiled = self.stats.compiled,
            "server profile"
        );
    }
}
