// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

//! In-memory state of an open tree: the storage handle, the write-back caches, the hanging-node
//! registry and the scalar metadata. Everything here is guarded by the owning facade's lock.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
};

use log::*;
use mktree_storage::{RocksStore, RocksStoreBuilder};

use crate::{
    error::MerkleTreeError,
    merklenode::{Node, NodeHash, HASH_LENGTH},
    merkletree::TreeConfig,
};

pub(crate) const LOG_TARGET: &str = "mktree::tree";

pub(crate) const CF_METADATA: &str = "metadata";
pub(crate) const CF_NODES: &str = "nodes";
pub(crate) const CF_KEYDATA: &str = "keydata";

pub(crate) const KEY_ROOT_HASH: &[u8] = b"rootHash";
pub(crate) const KEY_NUM_LEAVES: &[u8] = b"numLeaves";
pub(crate) const KEY_DEPTH: &[u8] = b"depth";
const HANGING_NODE_PREFIX: &str = "hangingNode";

pub(crate) fn hanging_node_key(level: u32) -> Vec<u8> {
    format!("{}{}", HANGING_NODE_PREFIX, level).into_bytes()
}

fn hash_from_row(row: Vec<u8>, what: &str) -> Result<NodeHash, MerkleTreeError> {
    NodeHash::try_from(row.as_slice()).map_err(|_| {
        MerkleTreeError::CorruptedTree(format!("{} row holds {} bytes, expected {}", what, row.len(), HASH_LENGTH))
    })
}

fn u32_from_row(row: Vec<u8>, what: &str) -> Result<u32, MerkleTreeError> {
    let bytes: [u8; 4] = row.as_slice().try_into().map_err(|_| {
        MerkleTreeError::CorruptedTree(format!("{} row holds {} bytes, expected 4", what, row.len()))
    })?;
    Ok(u32::from_be_bytes(bytes))
}

pub(crate) struct TreeInner {
    name: String,
    path: PathBuf,
    config: TreeConfig,
    /// `None` while the tree is dormant (storage handles released) or closed.
    store: Option<RocksStore>,
    /// Cache of loaded and newly created nodes, keyed by their current hash.
    pub(crate) nodes: HashMap<NodeHash, Node>,
    /// One unpaired node per occupied level. The deepest entry is the root.
    pub(crate) hanging: BTreeMap<u32, NodeHash>,
    /// Records written since the last flush.
    pub(crate) key_data: HashMap<Vec<u8>, Vec<u8>>,
    pub(crate) num_leaves: u32,
    pub(crate) depth: u32,
    pub(crate) root_hash: Option<NodeHash>,
    pub(crate) has_unsaved_changes: bool,
    pub(crate) closed: bool,
}

impl TreeInner {
    pub(crate) fn new(name: &str, path: PathBuf, config: TreeConfig) -> TreeInner {
        TreeInner {
            name: name.to_string(),
            path,
            config,
            store: None,
            nodes: HashMap::new(),
            hanging: BTreeMap::new(),
            key_data: HashMap::new(),
            num_leaves: 0,
            depth: 0,
            root_hash: None,
            has_unsaved_changes: false,
            closed: false,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn store_is_open(&self) -> bool {
        self.store.is_some()
    }

    fn open_store(path: &Path, config: &TreeConfig) -> Result<RocksStore, MerkleTreeError> {
        std::fs::create_dir_all(path)?;
        let store = RocksStoreBuilder::new()
            .set_path(path)
            .set_config(config.store_config.clone())
            .add_column_family(CF_METADATA)
            .add_column_family(CF_NODES)
            .add_column_family(CF_KEYDATA)
            .build()?;
        Ok(store)
    }

    /// Open the storage handle if the tree is dormant. Fails with `TreeClosed` after `close()`.
    pub(crate) fn ensure_store(&mut self) -> Result<(), MerkleTreeError> {
        if self.closed {
            return Err(MerkleTreeError::TreeClosed);
        }
        if self.store.is_none() {
            debug!(target: LOG_TARGET, "({}) reopening storage handles", self.name);
            self.store = Some(Self::open_store(&self.path, &self.config)?);
        }
        Ok(())
    }

    /// The open storage handle. Callers must have called `ensure_store` on this mutation path.
    pub(crate) fn store(&self) -> Result<&RocksStore, MerkleTreeError> {
        self.store.as_ref().ok_or(MerkleTreeError::TreeClosed)
    }

    /// Drop the storage handles, leaving the in-memory state intact (the dormant state).
    pub(crate) fn release_store(&mut self) {
        if self.store.take().is_some() {
            debug!(target: LOG_TARGET, "({}) storage handles released", self.name);
        }
    }

    pub(crate) fn insert_node(&mut self, node: Node) {
        self.nodes.insert(node.hash(), node);
    }

    /// Make sure the node for `hash` is in the cache, loading and decoding it from storage on a
    /// miss. Returns `false` when the node exists neither in the cache nor in storage.
    pub(crate) fn ensure_cached(&mut self, hash: &NodeHash) -> Result<bool, MerkleTreeError> {
        if self.nodes.contains_key(hash) {
            return Ok(true);
        }
        self.ensure_store()?;
        match self.store()?.get(CF_NODES, hash)? {
            Some(buf) => {
                let node = Node::decode(&buf)?;
                self.nodes.insert(*hash, node);
                Ok(true)
            },
            None => Ok(false),
        }
    }

    pub(crate) fn node_cloned(&mut self, hash: &NodeHash) -> Result<Option<Node>, MerkleTreeError> {
        if self.ensure_cached(hash)? {
            Ok(self.nodes.get(hash).cloned())
        } else {
            Ok(None)
        }
    }

    pub(crate) fn node_mut(&mut self, hash: &NodeHash) -> Result<Option<&mut Node>, MerkleTreeError> {
        if self.ensure_cached(hash)? {
            Ok(self.nodes.get_mut(hash))
        } else {
            Ok(None)
        }
    }

    /// Update a node's parent pointer, if the node is still present.
    pub(crate) fn set_parent_if_present(
        &mut self,
        hash: &NodeHash,
        parent: NodeHash,
    ) -> Result<(), MerkleTreeError> {
        if let Some(node) = self.node_mut(hash)? {
            node.set_parent(Some(parent));
        }
        Ok(())
    }

    /// The stored value for `key`: the write-back cache first, then the keydata column family.
    pub(crate) fn lookup_data(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, MerkleTreeError> {
        if let Some(value) = self.key_data.get(key) {
            return Ok(Some(value.clone()));
        }
        self.ensure_store()?;
        Ok(self.store()?.get(CF_KEYDATA, key)?)
    }

    /// Read-only variant of [`TreeInner::lookup_data`] for use under the shared lock; requires
    /// the storage handle to already be open.
    pub(crate) fn lookup_data_readonly(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MerkleTreeError> {
        if let Some(value) = self.key_data.get(key) {
            return Ok(Some(value.clone()));
        }
        Ok(self.store()?.get(CF_KEYDATA, key)?)
    }

    /// The root hash as currently persisted, ignoring unsaved in-memory changes.
    pub(crate) fn root_hash_on_disk(&self) -> Result<Option<NodeHash>, MerkleTreeError> {
        match self.store()?.get(CF_METADATA, KEY_ROOT_HASH)? {
            Some(row) => Ok(Some(hash_from_row(row, "rootHash")?)),
            None => Ok(None),
        }
    }

    /// Load `root_hash`, `num_leaves`, `depth` and the hanging-node registry from storage,
    /// replacing the current scalar state. A hanging-node row that references a hash absent
    /// from storage is a corruption of the tree.
    pub(crate) fn load_metadata(&mut self) -> Result<(), MerkleTreeError> {
        self.ensure_store()?;

        self.root_hash = match self.store()?.get(CF_METADATA, KEY_ROOT_HASH)? {
            Some(row) => Some(hash_from_row(row, "rootHash")?),
            None => None,
        };
        self.num_leaves = match self.store()?.get(CF_METADATA, KEY_NUM_LEAVES)? {
            Some(row) => u32_from_row(row, "numLeaves")?,
            None => 0,
        };
        self.depth = match self.store()?.get(CF_METADATA, KEY_DEPTH)? {
            Some(row) => u32_from_row(row, "depth")?,
            None => 0,
        };

        self.hanging.clear();
        for level in 0..=self.depth {
            let row = self.store()?.get(CF_METADATA, &hanging_node_key(level))?;
            if let Some(row) = row {
                let hash = hash_from_row(row, "hangingNode")?;
                if !self.ensure_cached(&hash)? {
                    return Err(MerkleTreeError::CorruptedTree(format!(
                        "hanging node {} at level {} is not present in storage",
                        hex::encode(hash),
                        level
                    )));
                }
                self.hanging.insert(level, hash);
            }
        }
        trace!(
            target: LOG_TARGET,
            "({}) metadata loaded: {} leaves, depth {}, {} hanging nodes",
            self.name,
            self.num_leaves,
            self.depth,
            self.hanging.len()
        );
        Ok(())
    }

    /// Replace this tree's in-memory state with a deep copy of `source`'s. Used when both trees
    /// already share identical persistent state.
    pub(crate) fn copy_cache_from(&mut self, source: &TreeInner) {
        self.nodes = source.nodes.clone();
        self.key_data = source.key_data.clone();
        self.hanging = source.hanging.clone();
        self.root_hash = source.root_hash;
        self.num_leaves = source.num_leaves;
        self.depth = source.depth;
        self.has_unsaved_changes = source.has_unsaved_changes;
    }
}
