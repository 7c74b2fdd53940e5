//! RocksDB-backed log store.
//!
//! Column families:
//! - `data` — every path, keyed by its UTF-8 bytes (LZ4-compressed values)
//!
//! Path keys sort lexically, so a prefix scan from `prefix/from_key` walks
//! children in key order. Conditional writes are serialized through a
//! mutex: the read-check-put sequence is not atomic in RocksDB itself.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteOptions,
};

use super::{
    direct_child, split_path, ChangeFeed, FeedEvent, LogStore, StoreError, Subscription,
    WriteOutcome,
};

const CF_DATA: &str = "data";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_data"),
            block_cache_size: 64 * 1024 * 1024, // 64MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024, // 32MB
        }
    }
}

impl RocksConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

pub struct RocksLogStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksConfig,
    feed: ChangeFeed,
    /// Serializes read-check-put for conditional writes and feed ordering.
    write_lock: Mutex<()>,
    cleanups: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl RocksLogStore {
    /// Opens (or creates) the store at the configured path.
    pub fn open(config: RocksConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let mut cf_opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        cf_opts.set_block_based_table_factory(&block_opts);
        cf_opts.set_compression_type(DBCompressionType::Lz4);
        cf_opts.set_write_buffer_size(config.write_buffer_size);

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![ColumnFamilyDescriptor::new(CF_DATA, cf_opts)],
        )?;
        log::info!("rocks log store opened at {}", config.path.display());

        Ok(Self {
            db,
            config,
            feed: ChangeFeed::new(),
            write_lock: Mutex::new(()),
            cleanups: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Runs every cleanup registered for `connection`.
    pub fn drop_connection(&self, connection: &str) -> Result<usize, StoreError> {
        let paths = self
            .cleanups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(connection)
            .unwrap_or_default();
        let _guard = self.lock_writes();
        let mut removed = 0;
        for path in paths {
            if self.remove_locked(&path)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_DATA)
            .ok_or_else(|| StoreError::Database(format!("column family '{CF_DATA}' not found")))
    }

    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf()?;
        match self.db.get_cf(cf, path.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Database(format!("decompress {path}: {e}"))),
            None => Ok(None),
        }
    }

    fn put_locked(&self, path: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let (parent, key) = split_path(path)?;
        let cf = self.cf()?;
        let existed = self.db.get_cf(cf, path.as_bytes())?.is_some();

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        let compressed = lz4_flex::compress_prepend_size(&value);
        self.db.put_cf_opt(cf, path.as_bytes(), compressed, &write_opts)?;

        let key = key.to_string();
        let event = if existed {
            FeedEvent::Changed { key, value }
        } else {
            FeedEvent::Added { key, value }
        };
        self.feed.publish(parent, event);
        Ok(())
    }

    fn remove_locked(&self, path: &str) -> Result<bool, StoreError> {
        let cf = self.cf()?;
        if self.db.get_cf(cf, path.as_bytes())?.is_none() {
            return Ok(false);
        }
        self.db.delete_cf(cf, path.as_bytes())?;
        if let Ok((parent, key)) = split_path(path) {
            self.feed.publish(parent, FeedEvent::Removed { key: key.to_string() });
        }
        Ok(true)
    }

    fn children(
        &self,
        prefix: &str,
        from_key: Option<&str>,
    ) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let cf = self.cf()?;
        let dir = format!("{prefix}/");
        let start = format!("{dir}{}", from_key.unwrap_or(""));

        let mut out = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(start.as_bytes(), Direction::Forward));
        for item in iter {
            let (raw_key, value) = item?;
            let path = std::str::from_utf8(&raw_key)
                .map_err(|_| StoreError::Database("non-UTF-8 key".into()))?;
            if !path.starts_with(&dir) {
                break;
            }
            if let Some(key) = direct_child(prefix, path) {
                let value = lz4_flex::decompress_size_prepended(&value)
                    .map_err(|e| StoreError::Database(format!("decompress {path}: {e}")))?;
                out.push((key.to_string(), value));
            }
        }
        Ok(out)
    }
}

impl LogStore for RocksLogStore {
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.get(path)
    }

    async fn conditional_write<F>(&self, path: &str, update: F) -> Result<WriteOutcome, StoreError>
    where
        F: FnOnce(Option<&[u8]>) -> Option<Vec<u8>> + Send,
    {
        let (_, key) = split_path(path)?;
        let key = key.to_string();
        let _guard = self.lock_writes();
        let current = self.get(path)?;
        let proposed = update(current.as_deref());

        match (current, proposed) {
            (None, Some(value)) => {
                self.put_locked(path, value.clone())?;
                Ok(WriteOutcome {
                    committed: true,
                    value: Some(value),
                    key,
                })
            }
            (current, _) => Ok(WriteOutcome {
                committed: false,
                value: current,
                key,
            }),
        }
    }

    async fn write(&self, path: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let _guard = self.lock_writes();
        self.put_locked(path, value)
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        let _guard = self.lock_writes();
        self.remove_locked(path).map(|_| ())
    }

    async fn read_children(
        &self,
        prefix: &str,
        from_key: Option<&str>,
    ) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.children(prefix, from_key)
    }

    async fn subscribe(
        &self,
        prefix: &str,
        from_key: Option<&str>,
    ) -> Result<Subscription, StoreError> {
        let _guard = self.lock_writes();
        let initial = self
            .children(prefix, from_key)?
            .into_iter()
            .map(|(key, value)| FeedEvent::Added { key, value })
            .collect();
        Ok(self.feed.subscribe(prefix, initial))
    }

    async fn on_disconnect_cleanup(&self, connection: &str, path: &str) -> Result<(), StoreError> {
        self.cleanups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(connection.to_string())
            .or_default()
            .insert(path.to_string());
        Ok(())
    }
}
