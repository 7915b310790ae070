// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

//! `close_all` is process-wide, so this test lives in its own binary.

use mktree::{close_all, MerkleTree, MerkleTreeError, TreeConfig};
use tempfile::tempdir;

#[test]
fn close_all_flushes_and_retires_every_open_tree() {
    let dir = tempdir().unwrap();
    let config = TreeConfig::new().with_base_dir(dir.path());

    let a = MerkleTree::open_with_config("shutdown_a", config.clone()).unwrap();
    let b = MerkleTree::open_with_config("shutdown_b", config.clone()).unwrap();
    a.put(b"k", b"va").unwrap();
    b.put(b"k", b"vb").unwrap();
    let root_a = a.root_hash().unwrap();

    close_all();
    assert!(matches!(a.put(b"k", b"w"), Err(MerkleTreeError::TreeClosed)));
    assert!(matches!(b.root_hash(), Err(MerkleTreeError::TreeClosed)));

    // the names are free again and the data was flushed on the way out
    let a = MerkleTree::open_with_config("shutdown_a", config).unwrap();
    assert_eq!(a.root_hash().unwrap(), root_a);
    assert_eq!(a.get(b"k").unwrap().unwrap(), b"va");
    a.close().unwrap();
}
