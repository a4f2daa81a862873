use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use directories::BaseDirs;

use super::hash::{HASH_SIZE, TranslationHash};

/// Suffix of in-flight writes. Readers never open these names.
pub const TEMP_SUFFIX: &str = ".tmp";

/// `$HOME/.cache/transcache` of the invoking user.
pub fn default_cache_root() -> Option<PathBuf> {
    let base_dirs = BaseDirs::new()?;
    Some(base_dirs.home_dir().join(".cache").join("transcache"))
}

pub fn entry_path(root: &Path, hash: &TranslationHash) -> PathBuf {
    root.join(hash.to_hex())
}

pub fn temp_path(root: &Path, hash: &TranslationHash) -> PathBuf {
    root.join(format!("{hash}{TEMP_SUFFIX}"))
}

/// Creates the cache root (and parents) readable by everyone, writable by the owner.
pub fn ensure_root(root: &Path) -> io::Result<()> {
    DirBuilder::new().recursive(true).mode(0o755).create(root)
}

/// Classification of a file name found in the cache directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryName {
    Committed(TranslationHash),
    InFlight(TranslationHash),
}

impl EntryName {
    pub fn parse(name: &str) -> Option<Self> {
        if let Some(stem) = name.strip_suffix(TEMP_SUFFIX) {
            return parse_hex_name(stem).map(Self::InFlight);
        }
        parse_hex_name(name).map(Self::Committed)
    }

    pub fn hash(self) -> TranslationHash {
        match self {
            Self::Committed(hash) | Self::InFlight(hash) => hash,
        }
    }
}

fn parse_hex_name(name: &str) -> Option<TranslationHash> {
    // Only canonical names count; uppercase variants were never written by us.
    let canonical = name.len() == HASH_SIZE * 2
        && name
            .bytes()
            .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte));
    if !canonical {
        return None;
    }
    name.parse().ok()
}
