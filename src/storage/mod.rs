// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage backends.
//!
//! | Backend | Type | Counter increment |
//! |---------|------|-------------------|
//! | Filesystem | [`FsStore`] | read-then-write (optionally under an advisory lock) |
//! | SQLite / MySQL | [`SqlStore`] | transactional, never loses an update |
//! | In-process | [`InMemoryStore`] | atomic per key |
//!
//! The backend is chosen once at startup from [`StorageConfig`] via [`open`].

pub mod fs;
pub mod memory;
pub mod sql;
pub mod traits;

pub use fs::{CounterLocking, FsStore};
pub use memory::InMemoryStore;
pub use sql::{Dialect, SqlStore};
pub use traits::{CounterOutcome, Document, DocumentMeta, DocumentStore, StorageError};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::clock::TimeSource;
use crate::config::StorageConfig;
use crate::metrics;

/// Open the backend described by `config`. Document timestamps are taken
/// from `clock`, the same clock retention later compares them against.
pub async fn open(
    config: &StorageConfig,
    clock: Arc<dyn TimeSource>,
) -> Result<Arc<dyn DocumentStore>, StorageError> {
    let store: Arc<dyn DocumentStore> = match config {
        StorageConfig::File { path, counter_locking } => {
            Arc::new(FsStore::with_locking(path, *counter_locking)?.with_clock(clock))
        }
        StorageConfig::Sqlite { url } | StorageConfig::Mysql { url } => {
            Arc::new(SqlStore::new(url).await?.with_clock(clock))
        }
        StorageConfig::Memory => Arc::new(InMemoryStore::new().with_clock(clock)),
    };
    info!(backend = store.backend_name(), "storage backend ready");
    Ok(store)
}

/// Run a storage call under a deadline. Expiry is reported as
/// [`StorageError::Timeout`], never swallowed.
pub async fn bounded<T, F>(
    timeout: Duration,
    operation: &'static str,
    fut: F,
) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            metrics::record_timeout(operation);
            Err(StorageError::Timeout { operation })
        }
    }
}

/// Longest rate key every backend can hold. The filesystem backend names the
/// counter `rate_limit_<key>.rate` (and `.lock`), and a file name is capped
/// at 255 bytes.
pub const MAX_COUNTER_KEY_LEN: usize = 255 - "rate_limit_".len() - ".rate".len();

/// Rate keys end up in file names, so all backends accept the same narrow
/// character set and length.
pub(crate) fn check_counter_key(key: &str) -> Result<(), StorageError> {
    let ok = !key.is_empty()
        && key.len() <= MAX_COUNTER_KEY_LEN
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}
