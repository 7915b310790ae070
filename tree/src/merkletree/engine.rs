// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

//! The incremental "hanging node" construction of the tree.
//!
//! Leaves are appended one at a time. A level with an odd population keeps its unpaired node in
//! the hanging registry; the next arrival at that level either pairs with it under a fresh
//! parent or is adopted into the parent's open child slot. A node's identity is its hash, so
//! updating a leaf means renaming the node and rippling the rename through every ancestor up to
//! the root.

use log::*;

use crate::{
    error::MerkleTreeError,
    hashing,
    merklenode::{Node, NodeHash},
    merkletree::{state::LOG_TARGET, TreeInner},
};

impl TreeInner {
    /// Insert or update one `(key, value)` record and fold the resulting leaf hash into the
    /// tree. Re-inserting an identical record is a no-op.
    pub(crate) fn put_record(&mut self, key: &[u8], value: &[u8]) -> Result<(), MerkleTreeError> {
        let existing = self.lookup_data(key)?;
        let new_leaf = hashing::leaf_hash(key, value);
        let old_leaf = existing.as_deref().map(|data| hashing::leaf_hash(key, data));

        if old_leaf == Some(new_leaf) {
            return Ok(());
        }

        self.key_data.insert(key.to_vec(), value.to_vec());
        self.has_unsaved_changes = true;

        match old_leaf {
            None => self.add_leaf(Node::leaf(new_leaf)),
            Some(old_leaf) => self.update_leaf(old_leaf, new_leaf),
        }
    }

    /// Append a fresh leaf to the tree.
    pub(crate) fn add_leaf(&mut self, leaf: Node) -> Result<(), MerkleTreeError> {
        let leaf_hash = leaf.hash();
        self.insert_node(leaf);

        if self.num_leaves == 0 {
            self.hanging.insert(0, leaf_hash);
            self.root_hash = Some(leaf_hash);
        } else {
            let hanging_leaf = match self.hanging.get(&0).copied() {
                Some(hash) => self.node_cloned(&hash)?.map(|node| (hash, node)),
                None => None,
            };
            match hanging_leaf {
                // No leaf is hanging at level 0, so this one hangs and sprouts a single-child
                // parent one level up.
                None => {
                    self.hanging.insert(0, leaf_hash);
                    let parent = Node::internal(leaf_hash, None);
                    let parent_hash = parent.hash();
                    self.set_parent_if_present(&leaf_hash, parent_hash)?;
                    self.insert_node(parent);
                    self.add_node(1, parent_hash)?;
                },
                // The hanging leaf is the root of a single-leaf tree; pair the two under a new
                // parent.
                Some((hanging_hash, hanging_node)) if hanging_node.parent().is_none() => {
                    let parent = Node::internal(hanging_hash, Some(leaf_hash));
                    let parent_hash = parent.hash();
                    self.set_parent_if_present(&hanging_hash, parent_hash)?;
                    self.set_parent_if_present(&leaf_hash, parent_hash)?;
                    self.insert_node(parent);
                    self.add_node(1, parent_hash)?;
                    self.hanging.remove(&0);
                },
                // The hanging leaf's parent has an open child slot; adopt the new leaf there.
                Some((_, hanging_node)) => {
                    if let Some(parent_hash) = hanging_node.parent() {
                        self.attach_child(parent_hash, leaf_hash)?;
                    }
                    self.hanging.remove(&0);
                },
            }
        }

        self.num_leaves += 1;
        trace!(target: LOG_TARGET, "({}) leaf {} added", self.name(), hex::encode(leaf_hash));
        Ok(())
    }

    /// Hang `node_hash` at `level`, pairing it with an already-hanging node where one exists.
    /// Recurses upward until a level takes the node without pairing.
    fn add_node(&mut self, level: u32, node_hash: NodeHash) -> Result<(), MerkleTreeError> {
        if level > self.depth {
            self.depth = level;
        }

        let hanging_hash = self.hanging.get(&level).copied();
        match hanging_hash {
            None => {
                self.hanging.insert(level, node_hash);
                if level >= self.depth {
                    self.root_hash = Some(node_hash);
                } else {
                    let parent = Node::internal(node_hash, None);
                    let parent_hash = parent.hash();
                    self.set_parent_if_present(&node_hash, parent_hash)?;
                    self.insert_node(parent);
                    self.add_node(level + 1, parent_hash)?;
                }
            },
            Some(hanging_hash) => {
                let hanging_node = self.node_cloned(&hanging_hash)?.ok_or_else(|| {
                    MerkleTreeError::CorruptedTree(format!(
                        "hanging node {} at level {} is not present in storage",
                        hex::encode(hanging_hash),
                        level
                    ))
                })?;
                match hanging_node.parent() {
                    None => {
                        let parent = Node::internal(hanging_hash, Some(node_hash));
                        let parent_hash = parent.hash();
                        self.set_parent_if_present(&hanging_hash, parent_hash)?;
                        self.set_parent_if_present(&node_hash, parent_hash)?;
                        self.insert_node(parent);
                        self.hanging.remove(&level);
                        self.add_node(level + 1, parent_hash)?;
                    },
                    Some(parent_hash) => {
                        // The parent's hash change propagates on its own; no recursion needed.
                        self.attach_child(parent_hash, node_hash)?;
                        self.hanging.remove(&level);
                    },
                }
            },
        }
        Ok(())
    }

    /// Let the node at `parent_hash` adopt `child_hash` into its open child slot, then rename
    /// the parent to its recomputed hash.
    fn attach_child(&mut self, parent_hash: NodeHash, child_hash: NodeHash) -> Result<(), MerkleTreeError> {
        if self.node_cloned(&child_hash)?.is_none() {
            return Err(MerkleTreeError::CorruptedTree(format!(
                "child node {} is not present in storage",
                hex::encode(child_hash)
            )));
        }
        let parent = self.node_mut(&parent_hash)?.ok_or_else(|| {
            MerkleTreeError::CorruptedTree(format!(
                "parent node {} of hanging node is not present in storage",
                hex::encode(parent_hash)
            ))
        })?;
        parent.add_child(child_hash)?;
        let new_hash = parent.calculate_hash().ok_or_else(|| {
            MerkleTreeError::CorruptedTree(format!(
                "node {} has no children after adopting one",
                hex::encode(parent_hash)
            ))
        })?;
        self.update_node_hash(parent_hash, new_hash)
    }

    /// Rename the leaf currently hashed `old_leaf` to `new_leaf` and propagate the change.
    pub(crate) fn update_leaf(&mut self, old_leaf: NodeHash, new_leaf: NodeHash) -> Result<(), MerkleTreeError> {
        if old_leaf == new_leaf {
            return Err(MerkleTreeError::InvalidArgument(
                "old and new leaf hashes cannot be the same".to_string(),
            ));
        }
        if self.node_cloned(&old_leaf)?.is_none() {
            return Err(MerkleTreeError::LeafNotFound(hex::encode(old_leaf)));
        }
        self.update_node_hash(old_leaf, new_leaf)
    }

    /// Replace a node's identity throughout the in-memory structures and ripple the change to
    /// its neighbours: children re-point their parent edge, the parent swaps its child edge and
    /// is renamed to its own recomputed hash in turn, up to the root.
    pub(crate) fn update_node_hash(&mut self, old_hash: NodeHash, new_hash: NodeHash) -> Result<(), MerkleTreeError> {
        let mut node = self.nodes.remove(&old_hash).ok_or_else(|| {
            MerkleTreeError::CorruptedTree(format!(
                "node {} disappeared from the cache during an update",
                hex::encode(old_hash)
            ))
        })?;
        node.rename(new_hash);
        let left = node.left();
        let right = node.right();
        let parent = node.parent();
        self.nodes.insert(new_hash, node);

        // if the old hash hangs somewhere, the registry entry follows the rename
        if let Some(level) = self
            .hanging
            .iter()
            .find(|(_, hash)| **hash == old_hash)
            .map(|(level, _)| *level)
        {
            self.hanging.insert(level, new_hash);
        }

        let is_leaf = left.is_none() && right.is_none();

        match parent {
            None => {
                self.root_hash = Some(new_hash);
                if let Some(left) = left {
                    self.set_parent_if_present(&left, new_hash)?;
                }
                if let Some(right) = right {
                    self.set_parent_if_present(&right, new_hash)?;
                }
            },
            Some(parent_hash) => {
                if !is_leaf {
                    if let Some(left) = left {
                        self.set_parent_if_present(&left, new_hash)?;
                    }
                    if let Some(right) = right {
                        self.set_parent_if_present(&right, new_hash)?;
                    }
                }
                self.propagate_to_parent(parent_hash, old_hash, new_hash)?;
            },
        }
        Ok(())
    }

    fn propagate_to_parent(
        &mut self,
        parent_hash: NodeHash,
        old_child: NodeHash,
        new_child: NodeHash,
    ) -> Result<(), MerkleTreeError> {
        let parent = self.node_mut(&parent_hash)?.ok_or_else(|| {
            MerkleTreeError::CorruptedTree(format!(
                "parent node {} is not present in storage",
                hex::encode(parent_hash)
            ))
        })?;
        parent.replace_child(old_child, new_child)?;
        let new_parent_hash = parent.calculate_hash().ok_or_else(|| {
            MerkleTreeError::CorruptedTree(format!(
                "internal node {} has no children",
                hex::encode(parent_hash)
            ))
        })?;
        self.update_node_hash(parent_hash, new_parent_hash)
    }
}
