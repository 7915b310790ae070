// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

//! The keyed digest combining two byte strings into a 32-byte node hash. Every hash in the tree,
//! leaf or internal, is produced here.

use sha2::{Digest, Sha256};

use crate::merklenode::NodeHash;

/// `H(a, b)`: deterministic, position-sensitive 32-byte digest of two byte strings.
pub fn node_hash(a: &[u8], b: &[u8]) -> NodeHash {
    Sha256::new().chain_update(a).chain_update(b).finalize().into()
}

/// The hash of a `(key, value)` record. This is the leaf hash for the record's node.
pub fn leaf_hash(key: &[u8], value: &[u8]) -> NodeHash {
    node_hash(key, value)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(node_hash(b"a", b"b"), node_hash(b"a", b"b"));
    }

    #[test]
    fn position_sensitive() {
        assert_ne!(node_hash(b"a", b"b"), node_hash(b"b", b"a"));
    }

    #[test]
    fn leaf_hash_is_the_record_digest() {
        assert_eq!(leaf_hash(b"key", b"value"), node_hash(b"key", b"value"));
    }
}
