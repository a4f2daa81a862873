use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

/// Read handle to a committed cache entry.
#[derive(Debug)]
pub struct CachedObject {
    file: File,
    size: u64,
    path: PathBuf,
}

impl CachedObject {
    pub(crate) fn new(file: File, size: u64, path: PathBuf) -> Self {
        Self { file, size, path }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn into_file(self) -> File {
        self.file
    }

    /// Reads the whole entry without moving the file cursor.
    pub fn read_to_vec(&self) -> io::Result<Vec<u8>> {
        let len = usize::try_from(self.size)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "cache entry too large"))?;
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, 0)?;
        Ok(buf)
    }

    pub fn map(&self) -> io::Result<Mmap> {
        // SAFETY: committed entries are never written again; only the rename publishes them.
        unsafe { Mmap::map(&self.file) }
    }
}
