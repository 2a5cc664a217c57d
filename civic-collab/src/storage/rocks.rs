//! RocksDB-backed local cache of the editor's text.
//!
//! Column families:
//! - `entries` , cached text, LZ4 compressed, keyed by cache key
//! - `metadata`: bincode [`EntryMetadata`] (last modified, sizes)
//!
//! Both are written in one batch so an entry and its metadata never
//! disagree.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{CacheEntry, StoreError, TextCache};

const CF_ENTRIES: &str = "entries";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_ENTRIES, CF_METADATA];

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Database directory
    pub path: PathBuf,
    /// Block cache size in bytes
    pub block_cache_size: usize,
    /// fsync on every write
    pub sync_writes: bool,
    pub max_open_files: i32,
}

impl CacheConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Metadata stored next to each entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryMetadata {
    /// Milliseconds since the Unix epoch
    pub last_modified: u64,
    pub text_len: u64,
    pub compressed_len: u64,
}

impl EntryMetadata {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(key: &str, bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::read(key, e))?;
        Ok(meta)
    }
}

/// Durable text cache.
pub struct LocalCache {
    db: DBWithThreadMode<SingleThreaded>,
    config: CacheConfig,
}

impl LocalCache {
    /// Open (creating if missing) the cache at `config.path`.
    pub fn open(config: CacheConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(2);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )
        .map_err(|e| StoreError::Open(e.to_string()))?;

        log::info!("Local cache opened at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &CacheConfig) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        // Point lookups only: bloom filters without replacing the cache above.
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            // Values are already LZ4 framed.
            CF_ENTRIES => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Metadata for `key`, if present.
    pub fn metadata(&self, key: &str) -> Result<Option<EntryMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, key.as_bytes()).map_err(|e| StoreError::read(key, e))? {
            Some(bytes) => Ok(Some(EntryMetadata::decode(key, &bytes)?)),
            None => Ok(None),
        }
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }
}

impl TextCache for LocalCache {
    fn load(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let cf = self.cf(CF_ENTRIES)?;
        let compressed = match self
            .db
            .get_cf(cf, key.as_bytes())
            .map_err(|e| StoreError::read(key, e))?
        {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        let raw = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::read(key, e))?;
        let text = String::from_utf8(raw).map_err(|e| StoreError::read(key, e))?;
        let last_modified = self.metadata(key)?.map_or(0, |m| m.last_modified);

        Ok(Some(CacheEntry {
            key: key.to_string(),
            text,
            last_modified,
        }))
    }

    fn store(&mut self, key: &str, text: &str) -> Result<(), StoreError> {
        let cf_entries = self.cf(CF_ENTRIES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(text.as_bytes());
        let meta = EntryMetadata {
            last_modified: now_millis(),
            text_len: text.len() as u64,
            compressed_len: compressed.len() as u64,
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_entries, key.as_bytes(), &compressed);
        batch.put_cf(cf_meta, key.as_bytes(), meta.encode()?);
        self.db
            .write_opt(batch, &self.write_options())
            .map_err(|e| StoreError::Write(e.to_string()))
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        let cf_entries = self.cf(CF_ENTRIES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_entries, key.as_bytes());
        batch.delete_cf(cf_meta, key.as_bytes());
        self.db
            .write_opt(batch, &self.write_options())
            .map_err(|e| StoreError::Write(e.to_string()))
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
