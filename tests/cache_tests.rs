use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;

use anyhow::Result;
use transcache::cache::{CacheController, HASH_SIZE, ProcessIdentity, TranslationHash};
use transcache::config::CacheConfig;

const USER: ProcessIdentity = ProcessIdentity {
    real_uid: 1000,
    effective_uid: 1000,
};

fn temp_cache_dir() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("transcache-test")
        .tempdir()
        .expect("failed to create temp dir")
}

fn controller(root: &Path, mode: &str) -> CacheController {
    CacheController::with_identity(&CacheConfig::at(root).with_mode(mode), USER)
}

fn dir_listing(root: &Path) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for entry in fs::read_dir(root)? {
        names.insert(entry?.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

#[test]
fn put_then_get_across_controllers() -> Result<()> {
    let dir = temp_cache_dir();
    let hash = TranslationHash::of(b"unit at 0x401000");
    let payload = b"\x7fELF relocatable object".to_vec();

    controller(dir.path(), "readwrite").put(&hash, &payload);

    let reader = controller(dir.path(), "readonly");
    let object = reader.get(&hash).expect("entry written by another controller");
    assert_eq!(object.size(), payload.len() as u64);
    assert_eq!(object.read_to_vec()?, payload);
    assert_eq!(&object.map()?[..], &payload[..]);
    Ok(())
}

#[test]
fn fixed_hash_scenario() -> Result<()> {
    let dir = temp_cache_dir();
    let cache = controller(dir.path(), "readwrite");
    let hash = TranslationHash::from_bytes([0xAA; HASH_SIZE]);

    cache.put(&hash, &[1, 2, 3]);

    let name = "aa".repeat(HASH_SIZE);
    assert_eq!(name.len(), 40);
    assert_eq!(dir_listing(dir.path())?, BTreeSet::from([name.clone()]));
    assert_eq!(fs::read(dir.path().join(&name))?, [1, 2, 3]);

    let object = cache.get(&hash).expect("hit");
    assert_eq!(object.size(), 3);
    assert_eq!(object.read_to_vec()?, [1, 2, 3]);
    Ok(())
}

#[test]
fn get_before_put_misses() {
    let dir = temp_cache_dir();
    let cache = controller(dir.path(), "readwrite");
    assert!(cache.get(&TranslationHash::of(b"never stored")).is_none());
}

#[test]
fn write_only_never_serves_reads() {
    let dir = temp_cache_dir();
    let cache = controller(dir.path(), "wo");
    let hash = TranslationHash::of(b"write only");

    cache.put(&hash, b"object");
    assert!(dir.path().join(hash.to_hex()).exists());
    assert!(cache.get(&hash).is_none());
}

#[test]
fn read_only_leaves_directory_untouched() -> Result<()> {
    let dir = temp_cache_dir();
    let existing = TranslationHash::of(b"existing");
    controller(dir.path(), "readwrite").put(&existing, b"old");
    let before = dir_listing(dir.path())?;

    let cache = controller(dir.path(), "readonly");
    cache.put(&TranslationHash::of(b"new"), b"new object");
    cache.put(&existing, b"replacement");

    assert_eq!(dir_listing(dir.path())?, before);
    assert_eq!(fs::read(dir.path().join(existing.to_hex()))?, b"old");
    Ok(())
}

#[test]
fn privileged_process_never_touches_disk() {
    let dir = temp_cache_dir();
    let root = dir.path().join("not-yet-created");
    let setuid = ProcessIdentity {
        real_uid: 1000,
        effective_uid: 0,
    };
    let cache = CacheController::with_identity(&CacheConfig::at(&root), setuid);
    let hash = TranslationHash::of(b"setuid");

    cache.put(&hash, b"payload");
    assert!(cache.get(&hash).is_none());
    assert!(!cache.is_enabled());
    assert!(!root.exists());
}

#[test]
fn missing_root_is_created() {
    let dir = temp_cache_dir();
    let root = dir.path().join("nested").join("cache");
    let cache = controller(&root, "readwrite");
    assert!(cache.is_enabled());
    assert!(root.is_dir());
}

#[test]
fn crash_before_rename_leaves_a_miss_and_is_recoverable() -> Result<()> {
    let dir = temp_cache_dir();
    let cache = controller(dir.path(), "readwrite");
    let hash = TranslationHash::from_bytes([0x5C; HASH_SIZE]);

    // A writer that died after writing a longer payload, before the rename.
    let temp = dir.path().join(format!("{hash}.tmp"));
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp)?
        .write_all(b"stale bytes from an interrupted writer")?;

    assert!(cache.get(&hash).is_none());

    cache.put(&hash, b"fresh");
    let object = cache.get(&hash).expect("recovered entry");
    assert_eq!(object.read_to_vec()?, b"fresh");
    assert!(!temp.exists());
    Ok(())
}

#[test]
fn first_committer_wins() -> Result<()> {
    let dir = temp_cache_dir();
    let hash = TranslationHash::of(b"collision");

    controller(dir.path(), "readwrite").put(&hash, b"first");
    controller(dir.path(), "readwrite").put(&hash, b"second, longer payload");

    assert_eq!(fs::read(dir.path().join(hash.to_hex()))?, b"first");
    Ok(())
}

// Threads of one process only exclude each other with open-file-description locks.
#[cfg(target_os = "linux")]
#[test]
fn concurrent_writers_commit_exactly_one_complete_payload() -> Result<()> {
    const WRITERS: usize = 8;

    let dir = temp_cache_dir();
    let root = Arc::new(dir.path().to_path_buf());
    let hash = TranslationHash::from_bytes([0x42; HASH_SIZE]);
    let payloads: Vec<Vec<u8>> = (0..WRITERS)
        .map(|writer| vec![writer as u8; 64 * 1024 + writer * 4096])
        .collect();
    let barrier = Arc::new(Barrier::new(WRITERS + 1));

    let writers: Vec<_> = payloads
        .iter()
        .cloned()
        .map(|payload| {
            let root = Arc::clone(&root);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let cache = controller(&root, "readwrite");
                barrier.wait();
                cache.put(&hash, &payload);
            })
        })
        .collect();

    let reader = {
        let root = Arc::clone(&root);
        let barrier = Arc::clone(&barrier);
        let payloads = payloads.clone();
        thread::spawn(move || {
            let cache = controller(&root, "readonly");
            barrier.wait();
            for _ in 0..200 {
                if let Some(object) = cache.get(&hash) {
                    let bytes = object.read_to_vec().expect("read committed entry");
                    assert!(payloads.contains(&bytes), "observed a partial entry");
                }
            }
        })
    };

    for writer in writers {
        writer.join().expect("writer panicked");
    }
    reader.join().expect("reader panicked");

    let committed = fs::read(root.join(hash.to_hex()))?;
    assert!(payloads.contains(&committed));
    let finals = dir_listing(&root)?
        .into_iter()
        .filter(|name| !name.ends_with(".tmp"))
        .count();
    assert_eq!(finals, 1);
    Ok(())
}
