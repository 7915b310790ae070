// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

//! Populate a tree, clone it, diverge the original, then resynchronize the clone.
//!
//! Run with `cargo run --example clone_and_sync`.

use mktree::{close_all, MerkleTree, MerkleTreeError, TreeConfig};

fn main() -> Result<(), MerkleTreeError> {
    env_logger::init();
    let base_dir = std::env::temp_dir().join(format!("mktree-demo-{}", std::process::id()));
    let config = TreeConfig::new().with_base_dir(&base_dir);

    let tree = MerkleTree::open_with_config("ledger", config.clone())?;
    tree.put(b"alice", b"100")?;
    tree.put(b"bob", b"250")?;
    tree.flush_to_disk(false)?;
    println!("ledger root:  {}", hex::encode(tree.root_hash()?.unwrap_or_default()));

    let replica = tree.clone_to("replica")?;
    println!("replica root: {}", hex::encode(replica.root_hash()?.unwrap_or_default()));

    // diverge the original, then bring the replica back in line
    tree.put(b"carol", b"75")?;
    tree.flush_to_disk(false)?;
    replica.sync_from(&tree)?;

    let (keys, values) = replica.entries()?;
    println!("replica after sync:");
    for (key, value) in keys.iter().zip(&values) {
        println!("  {} = {}", String::from_utf8_lossy(key), String::from_utf8_lossy(value));
    }
    assert_eq!(tree.root_hash()?, replica.root_hash()?);
    println!("roots match:  {}", hex::encode(tree.root_hash()?.unwrap_or_default()));

    close_all();
    std::fs::remove_dir_all(&base_dir)?;
    Ok(())
}
