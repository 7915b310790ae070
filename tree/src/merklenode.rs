// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

//! The structural unit of the tree and its fixed-layout binary codec.
//!
//! A node is identified by its hash; edges to neighbours are stored as hashes, never as
//! references. The encoded layout is:
//!
//! ```text
//! [hash : 32]
//! [flag_left : 1] [flag_right : 1] [flag_parent : 1]
//! [left   : 32 if flag_left]
//! [right  : 32 if flag_right]
//! [parent : 32 if flag_parent]
//! ```

use std::hash::{Hash, Hasher};

use crate::{error::MerkleTreeError, hashing};

/// The length in bytes of every hash handled by the tree.
pub const HASH_LENGTH: usize = 32;

/// A 32-byte node identifier, which doubles as the node's Merkle value.
pub type NodeHash = [u8; HASH_LENGTH];

const FLAGS_LENGTH: usize = 3;

/// A single node of the tree. A leaf has no children; an internal node has at least one child,
/// and hashes to `H(left ?? right, right ?? left)`.
#[derive(Debug, Clone)]
pub struct Node {
    hash: NodeHash,
    left: Option<NodeHash>,
    right: Option<NodeHash>,
    parent: Option<NodeHash>,
    /// The hash this node was persisted under before its last rename. Set on the first rename
    /// after load so the stale row can be deleted at the next flush. Never persisted.
    old_hash_on_disk: Option<NodeHash>,
}

impl Node {
    /// Construct a leaf node with a known hash.
    pub fn leaf(hash: NodeHash) -> Node {
        Node {
            hash,
            left: None,
            right: None,
            parent: None,
            old_hash_on_disk: None,
        }
    }

    /// Construct an internal node from its children, deriving the node hash. A missing right
    /// child is duplicated from the left.
    pub fn internal(left: NodeHash, right: Option<NodeHash>) -> Node {
        let hash = hashing::node_hash(&left, &right.unwrap_or(left));
        Node {
            hash,
            left: Some(left),
            right,
            parent: None,
            old_hash_on_disk: None,
        }
    }

    pub fn hash(&self) -> NodeHash {
        self.hash
    }

    pub fn left(&self) -> Option<NodeHash> {
        self.left
    }

    pub fn right(&self) -> Option<NodeHash> {
        self.right
    }

    pub fn parent(&self) -> Option<NodeHash> {
        self.parent
    }

    pub fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }

    pub(crate) fn old_hash_on_disk(&self) -> Option<NodeHash> {
        self.old_hash_on_disk
    }

    pub(crate) fn set_parent(&mut self, parent: Option<NodeHash>) {
        self.parent = parent;
    }

    /// Recompute this node's hash from its children. Returns `None` for a leaf, whose hash is
    /// not derived from the structure.
    pub fn calculate_hash(&self) -> Option<NodeHash> {
        let left = self.left.or(self.right)?;
        let right = self.right.or(self.left)?;
        Some(hashing::node_hash(&left, &right))
    }

    /// Replace this node's identity. The hash it is still persisted under is recorded once so
    /// the stale row can be removed at the next flush.
    pub(crate) fn rename(&mut self, new_hash: NodeHash) {
        if self.old_hash_on_disk.is_none() {
            self.old_hash_on_disk = Some(self.hash);
        }
        self.hash = new_hash;
    }

    /// Fill the missing child slot with `child`. Fails with `NodeFull` when both slots are
    /// already occupied.
    pub(crate) fn add_child(&mut self, child: NodeHash) -> Result<(), MerkleTreeError> {
        if self.left.is_none() {
            self.left = Some(child);
        } else if self.right.is_none() {
            self.right = Some(child);
        } else {
            return Err(MerkleTreeError::NodeFull);
        }
        Ok(())
    }

    /// Swap the child slot currently holding `old` over to `new`.
    pub(crate) fn replace_child(&mut self, old: NodeHash, new: NodeHash) -> Result<(), MerkleTreeError> {
        if self.left == Some(old) {
            self.left = Some(new);
        } else if self.right == Some(old) {
            self.right = Some(new);
        } else {
            return Err(MerkleTreeError::CorruptedTree(format!(
                "hash {} not found among the children of node {}",
                hex::encode(old),
                hex::encode(self.hash)
            )));
        }
        Ok(())
    }

    /// Encode the node for storage.
    pub fn encode(&self) -> Vec<u8> {
        let length = HASH_LENGTH +
            FLAGS_LENGTH +
            self.left.map_or(0, |_| HASH_LENGTH) +
            self.right.map_or(0, |_| HASH_LENGTH) +
            self.parent.map_or(0, |_| HASH_LENGTH);
        let mut buf = Vec::with_capacity(length);
        buf.extend_from_slice(&self.hash);
        buf.push(u8::from(self.left.is_some()));
        buf.push(u8::from(self.right.is_some()));
        buf.push(u8::from(self.parent.is_some()));
        if let Some(left) = &self.left {
            buf.extend_from_slice(left);
        }
        if let Some(right) = &self.right {
            buf.extend_from_slice(right);
        }
        if let Some(parent) = &self.parent {
            buf.extend_from_slice(parent);
        }
        buf
    }

    /// Decode a node from its stored representation. The buffer length must match the declared
    /// flag bits exactly.
    pub fn decode(buf: &[u8]) -> Result<Node, MerkleTreeError> {
        if buf.len() < HASH_LENGTH + FLAGS_LENGTH {
            return Err(MerkleTreeError::CorruptedNode(format!(
                "buffer of {} bytes is too short for a node header",
                buf.len()
            )));
        }
        let mut hash = [0u8; HASH_LENGTH];
        hash.copy_from_slice(&buf[..HASH_LENGTH]);

        let mut flags = [false; 3];
        for (i, flag) in flags.iter_mut().enumerate() {
            *flag = match buf[HASH_LENGTH + i] {
                0 => false,
                1 => true,
                b => {
                    return Err(MerkleTreeError::CorruptedNode(format!(
                        "invalid flag byte 0x{:02x} at offset {}",
                        b,
                        HASH_LENGTH + i
                    )))
                },
            };
        }

        let expected = HASH_LENGTH + FLAGS_LENGTH + flags.iter().filter(|f| **f).count() * HASH_LENGTH;
        if buf.len() != expected {
            return Err(MerkleTreeError::CorruptedNode(format!(
                "buffer of {} bytes does not match its flags (expected {})",
                buf.len(),
                expected
            )));
        }

        let mut offset = HASH_LENGTH + FLAGS_LENGTH;
        let mut take = |present: bool| {
            if !present {
                return None;
            }
            let mut field = [0u8; HASH_LENGTH];
            field.copy_from_slice(&buf[offset..offset + HASH_LENGTH]);
            offset += HASH_LENGTH;
            Some(field)
        };

        Ok(Node {
            hash,
            left: take(flags[0]),
            right: take(flags[1]),
            parent: take(flags[2]),
            old_hash_on_disk: None,
        })
    }
}

// Equality and hashing cover the persisted fields only; the transient rename marker can
// legitimately differ between otherwise identical nodes.
impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash &&
            self.left == other.left &&
            self.right == other.right &&
            self.parent == other.parent
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
        self.left.hash(state);
        self.right.hash(state);
        self.parent.hash(state);
    }
}
