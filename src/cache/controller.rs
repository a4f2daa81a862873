use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::cache::hash::TranslationHash;
use crate::cache::lock::try_lock_exclusive;
use crate::cache::object::CachedObject;
use crate::cache::path::{default_cache_root, ensure_root, entry_path, temp_path};
use crate::config::{CacheConfig, CacheMode};

/// Real and effective user of the running process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub real_uid: u32,
    pub effective_uid: u32,
}

impl ProcessIdentity {
    pub fn current() -> Self {
        // SAFETY: getuid/geteuid cannot fail and have no preconditions.
        let (real_uid, effective_uid) = unsafe { (libc::getuid(), libc::geteuid()) };
        Self {
            real_uid,
            effective_uid,
        }
    }

    /// Running set-uid: a shared cache must not become an escalation or poisoning vector.
    pub fn is_elevated(self) -> bool {
        self.effective_uid != self.real_uid
    }
}

/// Content-addressed store of compiled translations, shared between processes through a
/// directory.
///
/// Every failure degrades to a miss or a dropped write; callers always fall back to translating.
#[derive(Debug, Clone)]
pub struct CacheController {
    root: PathBuf,
    allow_read: bool,
    allow_write: bool,
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PutOutcome {
    Committed,
    AlreadyPresent,
    Contended,
}

impl CacheController {
    pub fn disabled() -> Self {
        Self {
            root: PathBuf::new(),
            allow_read: false,
            allow_write: false,
            verbose: false,
        }
    }

    pub fn new(config: &CacheConfig) -> Self {
        Self::with_identity(config, ProcessIdentity::current())
    }

    pub fn with_identity(config: &CacheConfig, identity: ProcessIdentity) -> Self {
        let mut controller = Self::disabled();
        controller.verbose = config.verbose;

        if !config.enabled {
            debug!("translation cache disabled by configuration");
            return controller;
        }
        if identity.is_elevated() {
            debug!(
                uid = identity.real_uid,
                euid = identity.effective_uid,
                "translation cache disabled for privileged process"
            );
            return controller;
        }

        let mode = match config.mode.parse::<CacheMode>() {
            Ok(mode) => mode,
            Err(err) => {
                warn!("{err}, disabling translation cache");
                return controller;
            }
        };

        let Some(root) = config.dir.clone().or_else(default_cache_root) else {
            warn!("unable to determine cache directory, disabling translation cache");
            return controller;
        };
        if let Err(err) = ensure_root(&root) {
            warn!(
                root = %root.display(),
                %err,
                "unable to create cache directory, disabling translation cache"
            );
            return controller;
        }

        debug!(root = %root.display(), %mode, "translation cache initialised");
        controller.root = root;
        controller.allow_read = mode.allows_read();
        controller.allow_write = mode.allows_write();
        controller
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn allows_read(&self) -> bool {
        self.allow_read
    }

    pub fn allows_write(&self) -> bool {
        self.allow_write
    }

    pub fn is_enabled(&self) -> bool {
        self.allow_read || self.allow_write
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Opens the committed entry for `hash`.
    ///
    /// Disabled reads, a missing file and unreadable metadata are all reported as a miss.
    pub fn get(&self, hash: &TranslationHash) -> Option<CachedObject> {
        if !self.allow_read {
            return None;
        }

        let path = entry_path(&self.root, hash);
        let file = File::open(&path).ok()?;
        let size = file.metadata().ok()?.len();

        if self.verbose {
            info!(path = %path.display(), size, "cache hit");
        }
        Some(CachedObject::new(file, size, path))
    }

    /// Stores `data` under `hash` unless an entry already exists.
    ///
    /// Fire-and-forget: failures are dropped, so callers must not assume the entry exists
    /// afterwards.
    pub fn put(&self, hash: &TranslationHash, data: &[u8]) {
        if !self.allow_write {
            return;
        }

        match self.write_entry(hash, data) {
            Ok(PutOutcome::Committed) => {
                if self.verbose {
                    info!(path = %entry_path(&self.root, hash).display(), size = data.len(), "cache write");
                }
            }
            Ok(outcome) => {
                if self.verbose {
                    debug!(%hash, ?outcome, "cache write skipped");
                }
            }
            Err(err) => {
                if self.verbose {
                    debug!(%hash, %err, "cache write failed");
                }
            }
        }
    }

    fn write_entry(&self, hash: &TranslationHash, data: &[u8]) -> io::Result<PutOutcome> {
        let final_path = entry_path(&self.root, hash);
        let temp_path = temp_path(&self.root, hash);

        // No truncation here: the file may be another writer's, still holding its lock.
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(&temp_path)?;

        if try_lock_exclusive(&file).is_err() {
            return Ok(PutOutcome::Contended);
        }

        if fs::metadata(&final_path).is_ok() {
            discard(&temp_path);
            return Ok(PutOutcome::AlreadyPresent);
        }

        commit(&mut file, &temp_path, &final_path, data)?;
        Ok(PutOutcome::Committed)
    }
}

/// Fills the locked temp file and renames it into place; the temp file is removed on failure.
fn commit(file: &mut File, temp_path: &Path, final_path: &Path, data: &[u8]) -> io::Result<()> {
    // Holding the lock: drop whatever an interrupted writer left behind, then write in full.
    if let Err(err) = file.set_len(0).and_then(|()| file.write_all(data)) {
        discard(temp_path);
        return Err(err);
    }

    // The rename is the commit point; before it the final name does not exist.
    if let Err(err) = fs::rename(temp_path, final_path) {
        discard(temp_path);
        return Err(err);
    }
    Ok(())
}

fn discard(temp_path: &Path) {
    let _ = fs::remove_file(temp_path);
}
