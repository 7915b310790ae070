// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

//! An ergonomic, multithreaded API for an embedded RocksDB datastore

use std::path::{Path, PathBuf};

use log::*;
use rocksdb::{
    checkpoint::Checkpoint,
    BlockBasedOptions,
    ColumnFamily,
    ColumnFamilyDescriptor,
    DBCompressionType,
    IteratorMode,
    Options,
    WriteBatch,
    DB,
};

use crate::rocks_store::error::StoreError;

const LOG_TARGET: &str = "storage::rocks_store";
const BYTES_PER_MB: usize = 1024 * 1024;

/// Result of a single `for_each` iteration step. Return [`IterationResult::Break`] from the
/// closure to stop the iteration early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationResult {
    Continue,
    Break,
}

/// Tuning parameters for the underlying storage engine. The defaults favour a small, predictable
/// memory footprint over raw throughput.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    write_buffer_size_bytes: usize,
    block_size_bytes: usize,
    max_open_files: i32,
    max_background_jobs: i32,
}

impl RocksConfig {
    /// Specify the engine config in bytes.
    pub fn new(write_buffer_size_bytes: usize, block_size_bytes: usize, max_open_files: i32) -> Self {
        Self {
            write_buffer_size_bytes,
            block_size_bytes,
            max_open_files,
            max_background_jobs: 1,
        }
    }

    /// Specify the write buffer size in megabytes, keeping the other defaults.
    pub fn new_from_mb(write_buffer_mb: usize) -> Self {
        Self {
            write_buffer_size_bytes: write_buffer_mb * BYTES_PER_MB,
            ..Default::default()
        }
    }

    pub fn write_buffer_size_bytes(&self) -> usize {
        self.write_buffer_size_bytes
    }
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_bytes: 16 * BYTES_PER_MB,
            block_size_bytes: 4 * 1024,
            max_open_files: 100,
            max_background_jobs: 1,
        }
    }
}

/// A builder for [`RocksStore`].
///
/// ## Example
///
/// Create a new store in the `db` directory with two named column families:
///
/// ```no_run
/// # use mktree_storage::{RocksStoreBuilder, RocksConfig};
/// # use std::env;
/// let store = RocksStoreBuilder::new()
///     .set_path(env::temp_dir())
///     .set_config(RocksConfig::default())
///     .add_column_family("cf1")
///     .add_column_family("cf2")
///     .build()
///     .unwrap();
/// ```
pub struct RocksStoreBuilder {
    path: PathBuf,
    cf_names: Vec<String>,
    config: RocksConfig,
}

impl RocksStoreBuilder {
    /// Create a new store builder. Set up the store by calling the `set_nnnn` methods and then
    /// create it with `build()`.
    pub fn new() -> RocksStoreBuilder {
        Default::default()
    }

    /// Set the directory where the store exists, or must be created.
    /// Note: the directory must exist already; it is not created for you. If it does not exist,
    /// `build()` will return `StoreError::InvalidPath`.
    pub fn set_path<P: AsRef<Path>>(mut self, path: P) -> RocksStoreBuilder {
        self.path = path.as_ref().to_owned();
        self
    }

    /// Set the engine tuning parameters. The defaults are sane for small datasets.
    pub fn set_config(mut self, config: RocksConfig) -> RocksStoreBuilder {
        self.config = config;
        self
    }

    /// Add a named column family to the store. The `default` column family always exists and
    /// does not need to be added.
    pub fn add_column_family(mut self, name: &str) -> RocksStoreBuilder {
        if !self.cf_names.iter().any(|n| n == name) {
            self.cf_names.push(name.to_string());
        }
        self
    }

    /// Open the store, creating it and any missing column families as required.
    pub fn build(mut self) -> Result<RocksStore, StoreError> {
        if !self.path.exists() {
            return Err(StoreError::InvalidPath(self.path.display().to_string()));
        }

        if !self.cf_names.iter().any(|n| n == "default") {
            self.cf_names.insert(0, "default".to_string());
        }

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(self.config.max_open_files);
        db_opts.set_max_background_jobs(self.config.max_background_jobs);

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_size(self.config.block_size_bytes);
        block_opts.disable_cache();

        let descriptors = self
            .cf_names
            .iter()
            .map(|name| {
                let mut cf_opts = Options::default();
                cf_opts.set_compression_type(DBCompressionType::None);
                cf_opts.set_write_buffer_size(self.config.write_buffer_size_bytes);
                cf_opts.set_max_write_buffer_number(1);
                cf_opts.set_block_based_table_factory(&block_opts);
                ColumnFamilyDescriptor::new(name, cf_opts)
            })
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&db_opts, &self.path, descriptors)?;
        debug!(
            target: LOG_TARGET,
            "({}) store opened with {} column families",
            self.path.display(),
            self.cf_names.len()
        );
        for name in &self.cf_names {
            trace!(target: LOG_TARGET, "({}) column family '{}' is ready", self.path.display(), name);
        }

        Ok(RocksStore {
            path: self.path,
            config: self.config,
            cf_names: self.cf_names,
            db,
        })
    }
}

impl Default for RocksStoreBuilder {
    fn default() -> Self {
        Self {
            path: "./store/".into(),
            cf_names: Vec::new(),
            config: RocksConfig::default(),
        }
    }
}

/// A handle to an open embedded store. Column families are key-value tables stored within one
/// set of files under a single directory. All operations address a column family by name;
/// addressing a name that was not registered at build time returns
/// `StoreError::UnknownColumnFamily`.
///
/// The store is thread-safe: reads and writes may be issued from any thread. Atomicity across
/// several operations is available through [`StoreBatch`].
pub struct RocksStore {
    path: PathBuf,
    config: RocksConfig,
    cf_names: Vec<String>,
    db: DB,
}

impl RocksStore {
    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::UnknownColumnFamily(name.to_string()))
    }

    /// Get the raw value at `key`, or `None` if the key does not exist.
    pub fn get(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(cf)?;
        Ok(self.db.get_cf(cf, key)?)
    }

    /// Write a single record. This is an atomic operation; for writing several records atomically
    /// use [`RocksStore::batch`].
    pub fn put(&self, cf: &str, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(cf)?;
        Ok(self.db.put_cf(cf, key, value)?)
    }

    /// Delete the record at `key`. Deleting a missing key is not an error.
    pub fn delete(&self, cf: &str, key: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(cf)?;
        Ok(self.db.delete_cf(cf, key)?)
    }

    /// Check whether `key` exists in the given column family.
    pub fn contains_key(&self, cf: &str, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(cf, key)?.is_some())
    }

    /// Execute `f` for each `(key, value)` pair in a column family, in key order.
    ///
    /// `f` is a closure of form `|pair: Result<(Vec<u8>, Vec<u8>), StoreError>| -> IterationResult`.
    /// If [`IterationResult::Break`] is returned the closure will not be called again and
    /// `for_each` returns.
    pub fn for_each<F>(&self, cf: &str, mut f: F) -> Result<(), StoreError>
    where F: FnMut(Result<(Vec<u8>, Vec<u8>), StoreError>) -> IterationResult {
        let cf = self.cf(cf)?;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let pair = item
                .map(|(k, v)| (k.into_vec(), v.into_vec()))
                .map_err(StoreError::from);
            match f(pair) {
                IterationResult::Break => break,
                IterationResult::Continue => {},
            }
        }
        Ok(())
    }

    /// Start a new atomic write batch. Puts and deletes recorded on the batch become visible
    /// all-or-nothing when `commit` is called.
    pub fn batch(&self) -> StoreBatch<'_> {
        StoreBatch {
            store: self,
            batch: WriteBatch::default(),
        }
    }

    /// Delete every key in `[from, to)` from a column family.
    pub fn delete_range(&self, cf: &str, from: &[u8], to: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(cf)?;
        Ok(self.db.delete_range_cf(cf, from, to)?)
    }

    /// Compact the full key range of a column family, reclaiming space from deleted rows.
    pub fn compact(&self, cf: &str) -> Result<(), StoreError> {
        let cf = self.cf(cf)?;
        self.db.compact_range_cf(cf, None::<&[u8]>, None::<&[u8]>);
        Ok(())
    }

    /// Materialize a point-in-time copy of the full store at `dest`. The destination directory
    /// must not exist; parent directories are created as required.
    pub fn checkpoint<P: AsRef<Path>>(&self, dest: P) -> Result<(), StoreError> {
        let dest = dest.as_ref();
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let checkpoint = Checkpoint::new(&self.db)?;
        checkpoint.create_checkpoint(dest)?;
        debug!(
            target: LOG_TARGET,
            "({}) checkpoint created at {}",
            self.path.display(),
            dest.display()
        );
        Ok(())
    }

    /// Force a flush of the engine's in-memory buffers to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        trace!(target: LOG_TARGET, "Forcing flush of buffers to disk");
        self.db.flush()?;
        debug!(target: LOG_TARGET, "({}) buffers have been flushed", self.path.display());
        Ok(())
    }

    /// The directory this store lives in.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &RocksConfig {
        &self.config
    }

    /// The column family names this store was opened with.
    pub fn column_families(&self) -> &[String] {
        &self.cf_names
    }

    /// Log some pretty printed per-column-family statistics.
    pub fn log_info(&self) {
        for name in &self.cf_names {
            let cf = match self.cf(name) {
                Ok(cf) => cf,
                Err(e) => {
                    warn!(target: LOG_TARGET, "Could not retrieve statistics for '{}': {}", name, e);
                    continue;
                },
            };
            match self.db.property_int_value_cf(cf, "rocksdb.estimate-num-keys") {
                Ok(Some(n)) => {
                    debug!(
                        target: LOG_TARGET,
                        "({}) column family '{}': ~{} entries",
                        self.path.display(),
                        name,
                        n
                    );
                },
                Ok(None) => {},
                Err(e) => warn!(target: LOG_TARGET, "Could not retrieve statistics for '{}': {}", name, e),
            }
        }
    }
}

/// A set of puts and deletes that commit atomically, across any subset of column families.
pub struct StoreBatch<'a> {
    store: &'a RocksStore,
    batch: WriteBatch,
}

impl StoreBatch<'_> {
    /// Record a put in the batch. Existing values are overwritten at commit time.
    pub fn put(&mut self, cf: &str, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let cf = self.store.cf(cf)?;
        self.batch.put_cf(cf, key, value);
        Ok(())
    }

    /// Record a delete in the batch.
    pub fn delete(&mut self, cf: &str, key: &[u8]) -> Result<(), StoreError> {
        let cf = self.store.cf(cf)?;
        self.batch.delete_cf(cf, key);
        Ok(())
    }

    /// The number of operations recorded so far.
    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Atomically commit every recorded operation to the store.
    pub fn commit(self) -> Result<(), StoreError> {
        Ok(self.store.db.write(self.batch)?)
    }
}
