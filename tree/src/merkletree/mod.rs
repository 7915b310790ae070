// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

//! A persistent Merkle tree keyed by arbitrary byte strings.
//!
//! Each record `(key, value)` becomes a leaf hashed over both key and value; the tree exposes a
//! root hash that changes deterministically whenever any record changes, and a key-value map for
//! retrieving the stored payloads. All state lives in one directory per tree, managed by an
//! embedded column-family store, with write-back caches flushed in atomic batches.
//!
//! At most one instance per tree name may be open in a process; [`MerkleTree::open`] registers
//! the instance and [`MerkleTree::close`] (or [`close_all`]) retires it.

mod engine;
mod persist;
mod state;

use std::{
    cell::UnsafeCell,
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use log::*;
use mktree_storage::{IterationResult, RocksConfig};
use once_cell::sync::Lazy;
use serde::Serialize;

use crate::{
    error::MerkleTreeError,
    merklenode::{Node, NodeHash},
    priority_lock::{Priority, PriorityRwLock},
};
pub(crate) use state::TreeInner;
use state::{CF_KEYDATA, CF_NODES, LOG_TARGET};

/// Process-wide registry enforcing at most one open instance per tree name.
static OPEN_TREES: Lazy<Mutex<HashMap<String, Arc<MerkleTree>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn registry() -> std::sync::MutexGuard<'static, HashMap<String, Arc<MerkleTree>>> {
    OPEN_TREES.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Close every open tree. Intended to be called from the host process' shutdown path; failures
/// are logged and do not stop the remaining trees from closing.
pub fn close_all() {
    let trees: Vec<Arc<MerkleTree>> = registry().values().cloned().collect();
    for tree in trees {
        if let Err(e) = tree.close() {
            warn!(target: LOG_TARGET, "({}) close failed during shutdown: {}", tree.name(), e);
        }
    }
}

/// Configuration for a tree instance.
#[derive(Debug, Clone)]
pub struct TreeConfig {
    pub(crate) base_dir: PathBuf,
    pub(crate) store_config: RocksConfig,
    pub(crate) unhealthy_lock_wait: Duration,
    pub(crate) slow_op_warn: Duration,
}

impl TreeConfig {
    pub fn new() -> TreeConfig {
        Default::default()
    }

    /// The directory under which each tree gets its own subdirectory.
    pub fn with_base_dir<P: AsRef<Path>>(mut self, base_dir: P) -> TreeConfig {
        self.base_dir = base_dir.as_ref().to_owned();
        self
    }

    pub fn with_store_config(mut self, store_config: RocksConfig) -> TreeConfig {
        self.store_config = store_config;
        self
    }

    /// A lock acquisition that blocks longer than this is logged as unhealthy.
    pub fn with_unhealthy_lock_wait(mut self, threshold: Duration) -> TreeConfig {
        self.unhealthy_lock_wait = threshold;
        self
    }

    /// A public operation that takes longer than this is logged as slow.
    pub fn with_slow_op_warn(mut self, threshold: Duration) -> TreeConfig {
        self.slow_op_warn = threshold;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            base_dir: "./merkle_trees".into(),
            store_config: RocksConfig::default(),
            unhealthy_lock_wait: Duration::from_secs(1),
            slow_op_warn: Duration::from_millis(500),
        }
    }
}

/// A snapshot of a tree's in-memory footprint, for diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RamInfo {
    pub tree_name: String,
    pub num_leaves: u32,
    pub depth: u32,
    pub node_cache_size: usize,
    pub key_data_cache_size: usize,
    pub hanging_nodes: usize,
}

/// A persistent Merkle tree. See the module docs.
///
/// All operations are mediated by a priority read-write lock: reads run shared, every mutation
/// runs exclusive. Handles are shared via `Arc` and may be used from any thread.
pub struct MerkleTree {
    name: String,
    path: PathBuf,
    config: TreeConfig,
    lock: PriorityRwLock,
    inner: UnsafeCell<TreeInner>,
}

// SAFETY: `inner` is only ever dereferenced while `lock` is held: shared references under at
// least the shared mode, exclusive references only under the exclusive mode. The lock itself is
// Sync and the contained state is Send.
unsafe impl Send for MerkleTree {}
unsafe impl Sync for MerkleTree {}

impl MerkleTree {
    /// Open the tree named `name` with default configuration, creating it on first use.
    pub fn open(name: &str) -> Result<Arc<MerkleTree>, MerkleTreeError> {
        Self::open_with_config(name, TreeConfig::default())
    }

    /// Open the tree named `name`, creating its directory under the configured base dir on
    /// first use. Fails with `DuplicateInstance` if an instance with this name is already open
    /// in the process.
    pub fn open_with_config(name: &str, config: TreeConfig) -> Result<Arc<MerkleTree>, MerkleTreeError> {
        if name.is_empty() {
            return Err(MerkleTreeError::InvalidArgument("tree name cannot be empty".to_string()));
        }
        let mut registry = registry();
        if registry.contains_key(name) {
            return Err(MerkleTreeError::DuplicateInstance(name.to_string()));
        }

        let path = config.base_dir.join(name);
        let mut inner = TreeInner::new(name, path.clone(), config.clone());
        inner.ensure_store()?;
        inner.load_metadata()?;
        inner.compact_on_open();

        let tree = Arc::new(MerkleTree {
            name: name.to_string(),
            path,
            lock: PriorityRwLock::new(name, config.unhealthy_lock_wait),
            config,
            inner: UnsafeCell::new(inner),
        });
        registry.insert(name.to_string(), tree.clone());
        info!(target: LOG_TARGET, "({}) tree opened at {}", name, tree.path().display());
        Ok(tree)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The directory holding this tree's storage files.
    pub fn path(&self) -> &Path {
        &self.path
    }

    // SAFETY: callers must hold `self.lock` in at least shared mode.
    fn inner_read(&self) -> &TreeInner {
        unsafe { &*self.inner.get() }
    }

    // SAFETY: callers must hold `self.lock` in exclusive mode.
    #[allow(clippy::mut_from_ref)]
    fn inner_write(&self) -> &mut TreeInner {
        unsafe { &mut *self.inner.get() }
    }

    /// Run a read-only operation that needs the storage handle. Runs under the shared mode when
    /// the handle is open; reopening a dormant handle mutates state and is serialized through
    /// the exclusive mode.
    fn with_storage_read<R>(
        &self,
        op: impl Fn(&TreeInner) -> Result<R, MerkleTreeError>,
    ) -> Result<R, MerkleTreeError> {
        {
            let _guard = self.lock.read(Priority::MEDIUM)?;
            let inner = self.inner_read();
            if inner.closed {
                return Err(MerkleTreeError::TreeClosed);
            }
            if inner.store_is_open() {
                return op(inner);
            }
        }
        let _guard = self.lock.write(Priority::MEDIUM)?;
        let inner = self.inner_write();
        inner.ensure_store()?;
        op(inner)
    }

    fn warn_if_slow(&self, op: &str, started: Instant) {
        let elapsed = started.elapsed();
        if elapsed >= self.config.slow_op_warn {
            warn!(
                target: LOG_TARGET,
                "({}) {} completed in {} ms",
                self.name,
                op,
                elapsed.as_millis()
            );
        }
    }

    /// The current root hash, reflecting unsaved changes. `None` for an empty tree.
    pub fn root_hash(&self) -> Result<Option<NodeHash>, MerkleTreeError> {
        let _guard = self.lock.read(Priority::MEDIUM)?;
        let inner = self.inner_read();
        if inner.closed {
            return Err(MerkleTreeError::TreeClosed);
        }
        Ok(inner.root_hash)
    }

    /// The root hash as currently persisted, ignoring unsaved changes.
    pub fn root_hash_on_disk(&self) -> Result<Option<NodeHash>, MerkleTreeError> {
        self.with_storage_read(|inner| inner.root_hash_on_disk())
    }

    pub fn num_leaves(&self) -> Result<u32, MerkleTreeError> {
        let _guard = self.lock.read(Priority::MEDIUM)?;
        let inner = self.inner_read();
        if inner.closed {
            return Err(MerkleTreeError::TreeClosed);
        }
        Ok(inner.num_leaves)
    }

    pub fn depth(&self) -> Result<u32, MerkleTreeError> {
        let _guard = self.lock.read(Priority::MEDIUM)?;
        let inner = self.inner_read();
        if inner.closed {
            return Err(MerkleTreeError::TreeClosed);
        }
        Ok(inner.depth)
    }

    /// The stored value for `key`, or `None` if the key does not exist.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MerkleTreeError> {
        check_key(key)?;
        self.with_storage_read(|inner| inner.lookup_data_readonly(key))
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool, MerkleTreeError> {
        check_key(key)?;
        self.with_storage_read(|inner| Ok(inner.lookup_data_readonly(key)?.is_some()))
    }

    /// All persisted keys, in key order.
    pub fn keys(&self) -> Result<Vec<Vec<u8>>, MerkleTreeError> {
        self.with_storage_read(|inner| {
            let mut keys = Vec::new();
            inner.store()?.for_each(CF_KEYDATA, |pair| {
                if let Ok((key, _)) = pair {
                    keys.push(key);
                }
                IterationResult::Continue
            })?;
            Ok(keys)
        })
    }

    /// All persisted values, in key order.
    pub fn values(&self) -> Result<Vec<Vec<u8>>, MerkleTreeError> {
        self.with_storage_read(|inner| {
            let mut values = Vec::new();
            inner.store()?.for_each(CF_KEYDATA, |pair| {
                if let Ok((_, value)) = pair {
                    values.push(value);
                }
                IterationResult::Continue
            })?;
            Ok(values)
        })
    }

    /// All persisted keys and their values, in key order.
    pub fn entries(&self) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>), MerkleTreeError> {
        self.with_storage_read(|inner| {
            let mut keys = Vec::new();
            let mut values = Vec::new();
            inner.store()?.for_each(CF_KEYDATA, |pair| {
                if let Ok((key, value)) = pair {
                    keys.push(key);
                    values.push(value);
                }
                IterationResult::Continue
            })?;
            Ok((keys, values))
        })
    }

    /// Insert or update the record for `key`. Storing a value identical to the current one is a
    /// no-op and leaves the root hash unchanged.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), MerkleTreeError> {
        let started = Instant::now();
        check_key(key)?;
        check_value(value)?;
        let result = {
            let _guard = self.lock.write(Priority::MEDIUM)?;
            let inner = self.inner_write();
            if inner.closed {
                return Err(MerkleTreeError::TreeClosed);
            }
            inner.put_record(key, value)
        };
        self.warn_if_slow("put", started);
        result
    }

    /// Throw away all unsaved changes and restore the state last flushed to disk.
    pub fn revert_unsaved_changes(&self) -> Result<(), MerkleTreeError> {
        let _guard = self.lock.write(Priority::MEDIUM)?;
        let inner = self.inner_write();
        if inner.closed {
            return Err(MerkleTreeError::TreeClosed);
        }
        inner.revert()
    }

    /// Persist all in-memory changes in one atomic batch. With `release_storage`, the storage
    /// handles are dropped afterwards and transparently reopened by the next operation that
    /// needs them.
    pub fn flush_to_disk(&self, release_storage: bool) -> Result<(), MerkleTreeError> {
        let started = Instant::now();
        let result = {
            let _guard = self.lock.write(Priority::MEDIUM)?;
            let inner = self.inner_write();
            if inner.closed {
                return Err(MerkleTreeError::TreeClosed);
            }
            inner.flush(release_storage)
        };
        self.warn_if_slow("flush_to_disk", started);
        result
    }

    /// Remove every record and node, leaving an empty open tree.
    pub fn clear(&self) -> Result<(), MerkleTreeError> {
        let started = Instant::now();
        let result = {
            let _guard = self.lock.write(Priority::MEDIUM)?;
            let inner = self.inner_write();
            if inner.closed {
                return Err(MerkleTreeError::TreeClosed);
            }
            inner.clear()
        };
        self.warn_if_slow("clear", started);
        result
    }

    /// Flush this tree and materialize a full copy of it under `new_name`, returning the open
    /// copy. An already-open tree with that name is closed first and its directory replaced.
    pub fn clone_to(&self, new_name: &str) -> Result<Arc<MerkleTree>, MerkleTreeError> {
        let started = Instant::now();
        if new_name.is_empty() {
            return Err(MerkleTreeError::InvalidArgument("new tree name cannot be empty".to_string()));
        }
        if new_name == self.name {
            return Err(MerkleTreeError::InvalidArgument(
                "a tree cannot be cloned onto itself".to_string(),
            ));
        }
        let existing = registry().get(new_name).cloned();
        if let Some(existing) = existing {
            existing.close()?;
        }
        let dest = self.config.base_dir.join(new_name);
        if dest.exists() {
            std::fs::remove_dir_all(&dest)?;
        }

        {
            let _guard = self.lock.write(Priority::MEDIUM)?;
            let inner = self.inner_write();
            if inner.closed {
                return Err(MerkleTreeError::TreeClosed);
            }
            inner.flush(false)?;
            inner.ensure_store()?;
            inner.store()?.checkpoint(&dest)?;
        }

        let clone = Self::open_with_config(new_name, self.config.clone())?;
        self.warn_if_slow("clone_to", started);
        Ok(clone)
    }

    /// Resynchronize this tree to mirror `source`. When both trees' persisted roots already
    /// match, only the in-memory caches are copied over; otherwise this tree's directory is
    /// rebuilt from a checkpoint of the flushed source.
    pub fn sync_from(&self, source: &MerkleTree) -> Result<(), MerkleTreeError> {
        let started = Instant::now();
        if std::ptr::eq(self, source) {
            return Err(MerkleTreeError::InvalidArgument(
                "a tree cannot be synced from itself".to_string(),
            ));
        }

        let _guard = self.lock.write(Priority::MEDIUM)?;
        let _source_guard = source.lock.write(Priority::MEDIUM)?;
        let inner = self.inner_write();
        let source_inner = source.inner_write();
        if inner.closed || source_inner.closed {
            return Err(MerkleTreeError::TreeClosed);
        }

        inner.ensure_store()?;
        source_inner.ensure_store()?;
        let ours = inner.root_hash_on_disk()?;
        let theirs = source_inner.root_hash_on_disk()?;

        if ours == theirs {
            // already a persistent copy of the source; only the caches differ
            inner.copy_cache_from(source_inner);
        } else {
            inner.release_store();
            source_inner.flush(false)?;
            source_inner.ensure_store()?;
            if inner.path().exists() {
                std::fs::remove_dir_all(inner.path())?;
            }
            source_inner.store()?.checkpoint(inner.path())?;
            inner.nodes.clear();
            inner.key_data.clear();
            inner.load_metadata()?;
            inner.has_unsaved_changes = false;
        }
        info!(
            target: LOG_TARGET,
            "({}) synced from '{}', root now {:?}",
            self.name,
            source.name(),
            inner.root_hash.map(hex::encode)
        );
        self.warn_if_slow("sync_from", started);
        Ok(())
    }

    /// Flush, release the storage handles and retire this instance from the process-wide
    /// registry. Idempotent; any further operation fails with `TreeClosed`.
    pub fn close(&self) -> Result<(), MerkleTreeError> {
        let started = Instant::now();
        {
            let _guard = self.lock.write(Priority::MEDIUM)?;
            let inner = self.inner_write();
            if inner.closed {
                return Ok(());
            }
            inner.flush(true)?;
            inner.closed = true;
            registry().remove(&self.name);
        }
        info!(target: LOG_TARGET, "({}) tree closed", self.name);
        self.warn_if_slow("close", started);
        Ok(())
    }

    /// Every node currently persisted. Unsaved changes are flushed first so the result reflects
    /// the live tree.
    pub fn all_nodes(&self) -> Result<HashSet<Node>, MerkleTreeError> {
        let _guard = self.lock.write(Priority::MEDIUM)?;
        let inner = self.inner_write();
        if inner.closed {
            return Err(MerkleTreeError::TreeClosed);
        }
        inner.flush(false)?;
        inner.ensure_store()?;

        let mut nodes = HashSet::new();
        let mut failure: Option<MerkleTreeError> = None;
        inner.store()?.for_each(CF_NODES, |pair| match pair {
            Ok((_, value)) => match Node::decode(&value) {
                Ok(node) => {
                    nodes.insert(node);
                    IterationResult::Continue
                },
                Err(e) => {
                    failure = Some(e);
                    IterationResult::Break
                },
            },
            Err(e) => {
                failure = Some(e.into());
                IterationResult::Break
            },
        })?;
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(nodes)
    }

    /// A diagnostic snapshot of this tree's in-memory footprint.
    pub fn ram_info(&self) -> Result<RamInfo, MerkleTreeError> {
        let _guard = self.lock.read(Priority::MEDIUM)?;
        let inner = self.inner_read();
        if inner.closed {
            return Err(MerkleTreeError::TreeClosed);
        }
        Ok(RamInfo {
            tree_name: self.name.clone(),
            num_leaves: inner.num_leaves,
            depth: inner.depth,
            node_cache_size: inner.nodes.len(),
            key_data_cache_size: inner.key_data.len(),
            hanging_nodes: inner.hanging.len(),
        })
    }
}

fn check_key(key: &[u8]) -> Result<(), MerkleTreeError> {
    if key.is_empty() {
        return Err(MerkleTreeError::InvalidArgument("key cannot be empty".to_string()));
    }
    Ok(())
}

fn check_value(value: &[u8]) -> Result<(), MerkleTreeError> {
    if value.is_empty() {
        return Err(MerkleTreeError::InvalidArgument("value cannot be empty".to_string()));
    }
    Ok(())
}
