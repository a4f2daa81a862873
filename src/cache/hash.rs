use std::fmt;
use std::str::FromStr;

use sha1::{Digest, Sha1};
use thiserror::Error;

/// Width of a [`TranslationHash`] in bytes.
pub const HASH_SIZE: usize = 20;

/// Content address of one translated unit: guest code plus translation configuration.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TranslationHash([u8; HASH_SIZE]);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HashParseError {
    #[error("expected {expected} hex characters, found {found}", expected = HASH_SIZE * 2)]
    Length { found: usize },
    #[error("invalid hex digit `{ch}` at position {index}")]
    InvalidDigit { index: usize, ch: char },
}

impl TranslationHash {
    pub const fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; HASH_SIZE]>::try_from(bytes).ok().map(Self)
    }

    pub const fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Plain SHA-1 of `data`, for callers that address raw blobs.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = TranslationHasher::new();
        hasher.update(data);
        hasher.finish()
    }

    pub fn to_hex(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TranslationHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for TranslationHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TranslationHash({self})")
    }
}

impl FromStr for TranslationHash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let found = s.chars().count();
        if found != HASH_SIZE * 2 {
            return Err(HashParseError::Length { found });
        }

        let mut bytes = [0u8; HASH_SIZE];
        let mut chars = s.chars().enumerate();
        for byte in &mut bytes {
            let mut nibble = || {
                let (index, ch) = chars.next().ok_or(HashParseError::Length { found })?;
                ch.to_digit(16)
                    .map(|digit| digit as u8)
                    .ok_or(HashParseError::InvalidDigit { index, ch })
            };
            *byte = (nibble()? << 4) | nibble()?;
        }
        Ok(Self(bytes))
    }
}

/// Incremental SHA-1 over translation inputs.
///
/// Integers are fed little-endian so the same inputs hash identically on every host.
#[derive(Clone, Default)]
pub struct TranslationHasher(Sha1);

impl TranslationHasher {
    pub fn new() -> Self {
        Self(Sha1::new())
    }

    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(bytes);
        self
    }

    pub fn update_u64(&mut self, value: u64) -> &mut Self {
        self.update(&value.to_le_bytes())
    }

    pub fn update_u32(&mut self, value: u32) -> &mut Self {
        self.update(&value.to_le_bytes())
    }

    pub fn update_i32(&mut self, value: i32) -> &mut Self {
        self.update(&value.to_le_bytes())
    }

    pub fn update_bool(&mut self, value: bool) -> &mut Self {
        self.update(&[u8::from(value)])
    }

    pub fn update_hash(&mut self, hash: &TranslationHash) -> &mut Self {
        self.update(hash.as_bytes())
    }

    pub fn finish(self) -> TranslationHash {
        let digest = self.0.finalize();
        let mut bytes = [0u8; HASH_SIZE];
        bytes.copy_from_slice(&digest);
        TranslationHash(bytes)
    }
}
