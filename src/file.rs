//! File-based storage backend.
//!
//! One `<name>.json` blob per store under a base directory. Saves write to a
//! temp file and rename into place, so a crash mid-write never leaves a
//! truncated snapshot behind. Durable across process restarts; no sharing
//! between processes beyond what the filesystem provides.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;
use crate::persist::StorageBackend;

/// File-backed implementation of [`StorageBackend`].
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Create a backend storing blobs under the given directory.
    ///
    /// The directory is created lazily on the first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Base directory of this backend.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}

impl StorageBackend for FileBackend {
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.blob_path(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, name: &str, bytes: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let path = self.blob_path(name);
        let temp_path = self.dir.join(format!("{name}.json.tmp"));
        fs::write(&temp_path, bytes)?;
        fs::rename(&temp_path, &path)?;

        debug!(path = %path.display(), len = bytes.len(), "snapshot written");
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.blob_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
