//! In-memory storage backend.
//!
//! This backend is NOT durable - blobs are lost on process exit.
//! Use for testing and development only.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;
use crate::persist::StorageBackend;

/// In-memory implementation of [`StorageBackend`].
///
/// Uses a BTreeMap for ordered name iteration and RwLock for concurrency.
/// Clones share the same underlying blobs, which lets a test hand one copy
/// to a store and keep another for inspection.
#[derive(Clone)]
pub struct MemoryBackend {
    blobs: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    /// Create a new empty in-memory backend.
    pub fn new() -> Self {
        Self {
            blobs: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Get the number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// Check if the backend is empty.
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    /// Clear all blobs.
    pub fn clear(&self) {
        self.blobs.write().clear();
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemoryBackend {
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().get(name).cloned())
    }

    fn save(&self, name: &str, bytes: &[u8]) -> Result<()> {
        self.blobs.write().insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.blobs.write().remove(name);
        Ok(())
    }
}
