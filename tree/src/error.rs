// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

use mktree_storage::StoreError;
use thiserror::Error;

use crate::priority_lock::LockError;

/// Errors surfaced by the tree. `InvalidArgument` always indicates a programming error at the
/// call site; `Storage` may be retried by the caller; `CorruptedNode` and `CorruptedTree` are
/// fatal for the instance.
#[derive(Debug, Error)]
pub enum MerkleTreeError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("The tree has been closed")]
    TreeClosed,
    #[error("There is already an open instance of tree '{0}'")]
    DuplicateInstance(String),
    #[error("Leaf not found: {0}")]
    LeafNotFound(String),
    #[error("Node already has both left and right children")]
    NodeFull,
    #[error("Corrupted node encoding: {0}")]
    CorruptedNode(String),
    #[error("Corrupted tree: {0}")]
    CorruptedTree(String),
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
