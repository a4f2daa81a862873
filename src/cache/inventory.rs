use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::hash::TranslationHash;
use crate::cache::path::EntryName;

/// Committed entry found in a cache directory.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySummary {
    #[serde(serialize_with = "serialize_hash")]
    pub hash: TranslationHash,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Snapshot of a cache directory for operators.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Inventory {
    pub entries: Vec<EntrySummary>,
    /// Temporary files left by writers that are in flight or crashed.
    pub in_flight: usize,
    /// Names that do not belong to the cache.
    pub foreign: usize,
}

impl Inventory {
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|entry| entry.size).sum()
    }
}

/// Scans `root` without opening any entry.
pub fn scan(root: &Path) -> io::Result<Inventory> {
    let mut inventory = Inventory::default();
    for dirent in fs::read_dir(root)? {
        let dirent = dirent?;
        let name = dirent.file_name();
        match name.to_str().and_then(EntryName::parse) {
            Some(EntryName::Committed(hash)) => {
                let metadata = dirent.metadata()?;
                inventory.entries.push(EntrySummary {
                    hash,
                    size: metadata.len(),
                    modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                });
            }
            Some(EntryName::InFlight(_)) => inventory.in_flight += 1,
            None => inventory.foreign += 1,
        }
    }
    inventory.entries.sort_by_key(|entry| entry.hash);
    Ok(inventory)
}

fn serialize_hash<S: serde::Serializer>(
    hash: &TranslationHash,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separates_entries_temp_files_and_strangers() {
        let dir = tempfile::tempdir().expect("temp dir");
        let a = TranslationHash::of(b"a");
        let b = TranslationHash::of(b"b");
        fs::write(dir.path().join(a.to_hex()), b"1234").expect("write a");
        fs::write(dir.path().join(b.to_hex()), b"12").expect("write b");
        fs::write(dir.path().join(format!("{a}.tmp")), b"partial").expect("write tmp");
        fs::write(dir.path().join("notes.txt"), b"").expect("write stranger");

        let inventory = scan(dir.path()).expect("scan");
        assert_eq!(inventory.entries.len(), 2);
        assert_eq!(inventory.in_flight, 1);
        assert_eq!(inventory.foreign, 1);
        assert_eq!(inventory.total_bytes(), 6);

        let json = serde_json::to_value(&inventory).expect("serialize");
        let first = json["entries"][0]["hash"].as_str().expect("hash string");
        assert_eq!(first.len(), 40);
    }
}
