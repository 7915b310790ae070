// Copyright 2024 The Tari Project
// SPDX-License-Identifier: BSD-3-Clause

mod error;
mod store;

pub use error::StoreError;
pub use store::{IterationResult, RocksConfig, RocksStore, RocksStoreBuilder, StoreBatch};
