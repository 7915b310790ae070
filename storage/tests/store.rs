// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

use std::thread;

use mktree_storage::{IterationResult, RocksStoreBuilder, StoreError};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tempfile::{tempdir, TempDir};

fn init(cfs: &[&str]) -> (TempDir, mktree_storage::RocksStore) {
    let dir = tempdir().unwrap();
    let mut builder = RocksStoreBuilder::new().set_path(dir.path());
    for cf in cfs {
        builder = builder.add_column_family(cf);
    }
    (dir, builder.build().unwrap())
}

#[test]
fn test_put_get_delete() {
    let (_dir, store) = init(&["data"]);
    store.put("data", b"alpha", b"1").unwrap();
    assert_eq!(store.get("data", b"alpha").unwrap().unwrap(), b"1");
    assert!(store.contains_key("data", b"alpha").unwrap());
    assert!(store.get("data", b"beta").unwrap().is_none());

    store.delete("data", b"alpha").unwrap();
    assert!(!store.contains_key("data", b"alpha").unwrap());
    // deleting a missing key is not an error
    store.delete("data", b"alpha").unwrap();
}

#[test]
fn test_column_families_are_disjoint() {
    let (_dir, store) = init(&["a", "b"]);
    store.put("a", b"k", b"in-a").unwrap();
    store.put("b", b"k", b"in-b").unwrap();
    assert_eq!(store.get("a", b"k").unwrap().unwrap(), b"in-a");
    assert_eq!(store.get("b", b"k").unwrap().unwrap(), b"in-b");
    assert!(store.get("default", b"k").unwrap().is_none());
}

#[test]
fn test_batch_commits_atomically_across_cfs() {
    let (_dir, store) = init(&["a", "b"]);
    store.put("a", b"stale", b"x").unwrap();

    let mut batch = store.batch();
    batch.put("a", b"k1", b"v1").unwrap();
    batch.put("b", b"k2", b"v2").unwrap();
    batch.delete("a", b"stale").unwrap();
    assert_eq!(batch.len(), 3);

    // nothing is visible before commit
    assert!(store.get("a", b"k1").unwrap().is_none());
    assert!(store.contains_key("a", b"stale").unwrap());

    batch.commit().unwrap();
    assert_eq!(store.get("a", b"k1").unwrap().unwrap(), b"v1");
    assert_eq!(store.get("b", b"k2").unwrap().unwrap(), b"v2");
    assert!(!store.contains_key("a", b"stale").unwrap());
}

#[test]
fn test_for_each_iterates_in_key_order() {
    let (_dir, store) = init(&["data"]);
    for i in (0u8..10).rev() {
        store.put("data", &[i], &[i * 2]).unwrap();
    }

    let mut seen = Vec::new();
    store
        .for_each("data", |pair| {
            let (k, v) = pair.unwrap();
            seen.push((k, v));
            IterationResult::Continue
        })
        .unwrap();
    assert_eq!(seen.len(), 10);
    for (i, (k, v)) in seen.iter().enumerate() {
        assert_eq!(k, &[i as u8]);
        assert_eq!(v, &[i as u8 * 2]);
    }

    // early break stops the scan
    let mut count = 0;
    store
        .for_each("data", |_| {
            count += 1;
            if count == 3 {
                IterationResult::Break
            } else {
                IterationResult::Continue
            }
        })
        .unwrap();
    assert_eq!(count, 3);
}

#[test]
fn test_delete_range() {
    let (_dir, store) = init(&["data"]);
    for i in 0u8..20 {
        store.put("data", &[i], b"v").unwrap();
    }
    store.delete_range("data", &[5], &[15]).unwrap();
    for i in 0u8..20 {
        let present = store.contains_key("data", &[i]).unwrap();
        assert_eq!(present, !(5..15).contains(&i), "key {}", i);
    }
    store.compact("data").unwrap();
    assert!(store.contains_key("data", &[4]).unwrap());
}

#[test]
fn test_checkpoint_is_a_full_copy() {
    let (_dir, store) = init(&["data"]);
    let mut rng = StdRng::seed_from_u64(42);
    let mut records = Vec::new();
    for i in 0u32..100 {
        let value: [u8; 16] = rng.gen();
        store.put("data", &i.to_be_bytes(), &value).unwrap();
        records.push((i, value));
    }

    let dest_root = tempdir().unwrap();
    let dest = dest_root.path().join("copy");
    store.checkpoint(&dest).unwrap();

    let copy = RocksStoreBuilder::new()
        .set_path(&dest)
        .add_column_family("data")
        .build()
        .unwrap();
    for (i, value) in records {
        assert_eq!(copy.get("data", &i.to_be_bytes()).unwrap().unwrap(), value);
    }
}

#[test]
fn test_reopen_sees_committed_data() {
    let dir = tempdir().unwrap();
    {
        let store = RocksStoreBuilder::new()
            .set_path(dir.path())
            .add_column_family("data")
            .build()
            .unwrap();
        let mut batch = store.batch();
        batch.put("data", b"k", b"v").unwrap();
        batch.commit().unwrap();
        store.flush().unwrap();
    }
    let store = RocksStoreBuilder::new()
        .set_path(dir.path())
        .add_column_family("data")
        .build()
        .unwrap();
    assert_eq!(store.get("data", b"k").unwrap().unwrap(), b"v");
}

#[test]
fn test_multi_thread_reads() {
    let (_dir, store) = init(&["data"]);
    for i in 0u32..1000 {
        store.put("data", &i.to_be_bytes(), &i.to_le_bytes()).unwrap();
    }
    let store = std::sync::Arc::new(store);
    let mut threads = Vec::new();
    for t in 0..4 {
        let store = store.clone();
        threads.push(thread::spawn(move || {
            for i in (t..1000u32).step_by(4) {
                let v = store.get("data", &i.to_be_bytes()).unwrap().unwrap();
                assert_eq!(v, i.to_le_bytes());
            }
        }));
    }
    for t in threads {
        t.join().unwrap();
    }
}

#[test]
fn test_error_display_includes_cf_name() {
    let (_dir, store) = init(&[]);
    let err = store.put("ghost", b"k", b"v").unwrap_err();
    assert!(matches!(&err, StoreError::UnknownColumnFamily(n) if n == "ghost"));
    assert!(err.to_string().contains("ghost"));
}
