//! Configuration consumed by the cache and the translation server.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{TranslationHash, TranslationHasher};
use crate::codegen::{Arch, CallConv};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown cache mode `{0}` (expected readwrite, readonly or writeonly)")]
    UnknownCacheMode(String),
    #[error("unknown architecture `{0}`")]
    UnknownArch(String),
    #[error("failed to read configuration file")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "toml-config")]
    #[error("failed to parse configuration file")]
    Toml(#[from] toml::de::Error),
}

/// Which cache accesses are allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    #[default]
    ReadWrite,
    ReadOnly,
    WriteOnly,
}

impl CacheMode {
    pub fn allows_read(self) -> bool {
        self != Self::WriteOnly
    }

    pub fn allows_write(self) -> bool {
        self != Self::ReadOnly
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadWrite => "readwrite",
            Self::ReadOnly => "readonly",
            Self::WriteOnly => "writeonly",
        }
    }
}

impl FromStr for CacheMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "readwrite" | "read-write" | "rw" => Ok(Self::ReadWrite),
            "readonly" | "read-only" | "ro" => Ok(Self::ReadOnly),
            "writeonly" | "write-only" | "wo" => Ok(Self::WriteOnly),
            _ => Err(ConfigError::UnknownCacheMode(s.to_string())),
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistent cache settings.
///
/// `mode` stays a string so that an unrecognised value can disable the cache at construction time
/// instead of rejecting the whole configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub mode: String,
    pub dir: Option<PathBuf>,
    pub verbose: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: CacheMode::ReadWrite.as_str().to_string(),
            dir: None,
            verbose: false,
        }
    }
}

impl CacheConfig {
    /// Enabled, read-write cache rooted at `dir`.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            dir: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Some(enabled) = env_flag("TRANSCACHE_CACHE") {
            self.enabled = enabled;
        }
        if let Ok(mode) = env::var("TRANSCACHE_CACHE_MODE") {
            self.mode = mode;
        }
        if let Ok(dir) = env::var("TRANSCACHE_CACHE_DIR") {
            if !dir.is_empty() {
                self.dir = Some(PathBuf::from(dir));
            }
        }
        if let Some(verbose) = env_flag("TRANSCACHE_CACHE_VERBOSE") {
            self.verbose = verbose;
        }
    }
}

/// Options of the translation server. Everything that influences generated code is part of
/// [`TranslatorConfig::digest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslatorConfig {
    pub cache: CacheConfig,
    pub guest_arch: Arch,
    pub host_arch: Arch,
    /// Use the register-heavy calling convention when the host supports one.
    pub fast_call_conv: bool,
    pub pic: bool,
    pub profile: bool,
    pub target_opt: u8,
    pub extra_instcombine: bool,
    pub safe_call_ret: bool,
    pub full_facets: bool,
    pub call_ret: bool,
    pub host_cpu_features: u32,
    pub stack_alignment: u32,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        let host = Arch::host().unwrap_or(Arch::X86_64);
        Self {
            cache: CacheConfig::default(),
            guest_arch: host,
            host_arch: host,
            fast_call_conv: true,
            pic: false,
            profile: false,
            target_opt: 2,
            extra_instcombine: false,
            safe_call_ret: false,
            full_facets: false,
            call_ret: false,
            host_cpu_features: 0,
            stack_alignment: 0,
        }
    }
}

impl TranslatorConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.cache.apply_env();
        if let Some(profile) = env_flag("TRANSCACHE_PROFILE") {
            config.profile = profile;
        }
        config
    }

    #[cfg(feature = "toml-config")]
    pub fn from_toml_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Calling convention the server adapts every translated function to.
    pub fn call_conv(&self) -> CallConv {
        if self.fast_call_conv {
            CallConv::fast_for(self.host_arch, self.guest_arch)
        } else {
            CallConv::Cdecl
        }
    }

    /// Digest over every option that changes generated code.
    pub fn digest(&self) -> TranslationHash {
        let mut hasher = TranslationHasher::new();
        hasher
            .update(&[self.target_opt])
            .update_bool(self.extra_instcombine)
            .update_bool(self.safe_call_ret)
            .update_bool(self.full_facets)
            .update_bool(self.call_ret)
            .update_bool(self.pic)
            .update_u32(u32::from(self.guest_arch.elf_machine()))
            .update_u32(u32::from(self.host_arch.elf_machine()))
            .update_u32(self.host_cpu_features)
            .update_u32(self.stack_alignment)
            .update_i32(self.call_conv().client_number());
        hasher.finish()
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let value = env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
