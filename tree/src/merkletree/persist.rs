// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

//! Flush, revert and clear: moving the write-back caches to and from the column families.

use log::*;
use mktree_storage::IterationResult;

use crate::{
    error::MerkleTreeError,
    merkletree::{
        state::{hanging_node_key, CF_KEYDATA, CF_METADATA, CF_NODES, KEY_DEPTH, KEY_NUM_LEAVES, KEY_ROOT_HASH, LOG_TARGET},
        TreeInner,
    },
};

impl TreeInner {
    /// Persist every in-memory change in one atomic batch: the metadata column family is
    /// rewritten wholesale, every cached node is stored (and its superseded row deleted), and
    /// all pending key-data records are written. Afterwards the caches are empty.
    ///
    /// With `release_storage`, the storage handles are dropped after the flush and reopened on
    /// demand by the next operation that needs them.
    pub(crate) fn flush(&mut self, release_storage: bool) -> Result<(), MerkleTreeError> {
        if self.has_unsaved_changes {
            self.ensure_store()?;
            let store = self.store()?;
            let mut batch = store.batch();

            // the metadata column family is rebuilt from scratch on every flush
            let mut stale_metadata = Vec::new();
            store.for_each(CF_METADATA, |pair| {
                if let Ok((key, _)) = pair {
                    stale_metadata.push(key);
                }
                IterationResult::Continue
            })?;
            for key in stale_metadata {
                batch.delete(CF_METADATA, &key)?;
            }

            match &self.root_hash {
                Some(root) => batch.put(CF_METADATA, KEY_ROOT_HASH, root)?,
                None => batch.delete(CF_METADATA, KEY_ROOT_HASH)?,
            }
            batch.put(CF_METADATA, KEY_NUM_LEAVES, &self.num_leaves.to_be_bytes())?;
            batch.put(CF_METADATA, KEY_DEPTH, &self.depth.to_be_bytes())?;
            for (level, hash) in &self.hanging {
                batch.put(CF_METADATA, &hanging_node_key(*level), hash)?;
            }

            // deletes of superseded node rows go first; a rename can land on a hash another
            // cached node still occupies, and a live row must never be deleted
            for node in self.nodes.values() {
                if let Some(old_hash) = node.old_hash_on_disk() {
                    if !self.nodes.contains_key(&old_hash) {
                        batch.delete(CF_NODES, &old_hash)?;
                    }
                }
            }
            for node in self.nodes.values() {
                batch.put(CF_NODES, &node.hash(), &node.encode())?;
            }

            for (key, value) in &self.key_data {
                batch.put(CF_KEYDATA, key, value)?;
            }

            let ops = batch.len();
            batch.commit()?;
            debug!(
                target: LOG_TARGET,
                "({}) flushed {} batched operations ({} nodes, {} records)",
                self.name(),
                ops,
                self.nodes.len(),
                self.key_data.len()
            );

            self.nodes.clear();
            self.key_data.clear();
            self.has_unsaved_changes = false;
        }

        if release_storage {
            self.release_store();
        }
        Ok(())
    }

    /// Throw away every unsaved change and restore the in-memory state from storage.
    pub(crate) fn revert(&mut self) -> Result<(), MerkleTreeError> {
        if !self.has_unsaved_changes {
            return Ok(());
        }
        self.nodes.clear();
        self.hanging.clear();
        self.key_data.clear();
        self.load_metadata()?;
        self.has_unsaved_changes = false;
        debug!(target: LOG_TARGET, "({}) unsaved changes reverted", self.name());
        Ok(())
    }

    /// Empty the tree: range-delete all three live column families, compact them, and zero the
    /// in-memory state.
    pub(crate) fn clear(&mut self) -> Result<(), MerkleTreeError> {
        self.ensure_store()?;
        let store = self.store()?;
        for cf in [CF_METADATA, CF_NODES, CF_KEYDATA] {
            store.delete_range(cf, &[], &[0xff])?;
            store.compact(cf)?;
        }

        self.nodes.clear();
        self.key_data.clear();
        self.hanging.clear();
        self.root_hash = None;
        self.num_leaves = 0;
        self.depth = 0;
        self.has_unsaved_changes = false;
        info!(target: LOG_TARGET, "({}) tree cleared", self.name());
        Ok(())
    }

    /// Best-effort full compaction, run once at open to shrink the on-disk footprint.
    pub(crate) fn compact_on_open(&mut self) {
        let store = match self.store() {
            Ok(store) => store,
            Err(_) => return,
        };
        for cf in [CF_METADATA, CF_NODES, CF_KEYDATA] {
            if let Err(e) = store.compact(cf) {
                warn!(target: LOG_TARGET, "({}) startup compaction of '{}' failed: {}", self.name(), cf, e);
            }
        }
    }
}
