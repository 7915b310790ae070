// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

//! An abstraction layer over an embedded, ordered key-value store with named column families.
//! Domain crates should only make use of [`RocksStore`] and its companions and let the underlying
//! engine handle the details.

pub mod rocks_store;

pub use rocks_store::{IterationResult, RocksConfig, RocksStore, RocksStoreBuilder, StoreBatch, StoreError};
