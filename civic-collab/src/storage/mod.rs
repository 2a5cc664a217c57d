//! Local persistence for the editor's text.
//!
//! ```text
//! Reconciler ── store(key, text) ──► TextCache ──► LocalCache (RocksDB, LZ4)
//!            ◄─ load(key) ─────────            └─► MemoryCache (tests, restricted hosts)
//! ```
//!
//! The cache is best-effort: a failed read is treated as an empty cache and
//! a failed write only costs the offline copy.

pub mod rocks;

use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

pub use rocks::{CacheConfig, EntryMetadata, LocalCache};

/// Bytes written by the pre-flight storage probe.
pub const PROBE_BYTES: usize = 64 * 1024;

/// One cached text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub text: String,
    /// Milliseconds since the Unix epoch
    pub last_modified: u64,
}

/// Keyed text store used by the reconciler.
pub trait TextCache: Send {
    fn load(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;
    fn store(&mut self, key: &str, text: &str) -> Result<(), StoreError>;
    fn remove(&mut self, key: &str) -> Result<(), StoreError>;
}

impl<C: TextCache + ?Sized> TextCache for Box<C> {
    fn load(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        (**self).load(key)
    }

    fn store(&mut self, key: &str, text: &str) -> Result<(), StoreError> {
        (**self).store(key, text)
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        (**self).remove(key)
    }
}

/// Volatile cache.
#[derive(Debug, Default, Clone)]
pub struct MemoryCache {
    entries: HashMap<String, CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache pre-filled with one entry.
    pub fn with_entry(key: &str, text: &str) -> Self {
        let mut cache = Self::new();
        cache.insert(key, text);
        cache
    }

    fn insert(&mut self, key: &str, text: &str) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                text: text.to_string(),
                last_modified: rocks::now_millis(),
            },
        );
    }
}

impl TextCache for MemoryCache {
    fn load(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn store(&mut self, key: &str, text: &str) -> Result<(), StoreError> {
        self.insert(key, text);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("cache could not be opened: {0}")]
    Open(String),
    #[error("cache entry {key:?} could not be read: {reason}")]
    Read { key: String, reason: String },
    #[error("cache write failed: {0}")]
    Write(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    pub(crate) fn read(key: &str, reason: impl std::fmt::Display) -> Self {
        Self::Read {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Outcome of the pre-flight storage probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageProbe {
    /// Directory is writable and accepted the probe payload
    Available,
    /// Something failed; the host is treated as restricted
    Restricted(String),
}

impl StorageProbe {
    pub fn is_restricted(&self) -> bool {
        matches!(self, StorageProbe::Restricted(_))
    }
}

/// Check that `dir` can be created and can hold `probe_bytes` of data.
pub fn probe_storage(dir: &Path, probe_bytes: usize) -> StorageProbe {
    let probe = dir.join(".civic-probe");
    let result = std::fs::create_dir_all(dir)
        .and_then(|_| std::fs::write(&probe, vec![0u8; probe_bytes]))
        .and_then(|_| std::fs::metadata(&probe))
        .and_then(|meta| {
            if meta.len() as usize == probe_bytes {
                Ok(())
            } else {
                Err(std::io::Error::other("probe file truncated"))
            }
        });
    let _ = std::fs::remove_file(&probe);

    match result {
        Ok(()) => StorageProbe::Available,
        Err(e) => {
            log::warn!("Storage probe failed in {}: {e}", dir.display());
            StorageProbe::Restricted(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_cache() {
        let mut cache = MemoryCache::new();
        assert!(cache.load("k").unwrap().is_none());
        cache.store("k", "v").unwrap();
        assert_eq!(cache.load("k").unwrap().unwrap().text, "v");
        cache.remove("k").unwrap();
        assert!(cache.load("k").unwrap().is_none());
    }

    #[test]
    fn test_boxed_cache_delegates() {
        let mut cache: Box<dyn TextCache> = Box::new(MemoryCache::with_entry("k", "v"));
        assert_eq!(cache.load("k").unwrap().unwrap().text, "v");
        cache.store("k", "w").unwrap();
        assert_eq!(cache.load("k").unwrap().unwrap().text, "w");
    }

    #[test]
    fn test_probe_writable_dir() {
        let dir = tempfile::tempdir().unwrap();
        let probe = probe_storage(&dir.path().join("nested"), PROBE_BYTES);
        assert_eq!(probe, StorageProbe::Available);
        assert!(!dir.path().join("nested").join(".civic-probe").exists());
    }

    #[test]
    fn test_probe_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();
        // A regular file cannot hold the probe directory.
        assert!(probe_storage(&file.join("cache"), PROBE_BYTES).is_restricted());
    }
}
