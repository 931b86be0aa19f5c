// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use thiserror::Error;

use crate::udi::Udi;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage operation '{operation}' timed out")]
    Timeout { operation: &'static str },
    #[error("Invalid counter key '{0}'")]
    InvalidKey(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

/// A stored blob. `updated_at` is epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub udi: Udi,
    pub data: Vec<u8>,
    pub updated_at: i64,
}

/// Listing record used by maintenance tooling; never exposed to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentMeta {
    pub udi: Udi,
    pub size: u64,
    pub updated_at: i64,
}

/// Result of a counter increment attempt. `count` is the value after the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterOutcome {
    Admitted { count: u64 },
    Denied { count: u64 },
}

/// Storage capability shared by every backend.
///
/// Documents are addressed by [`Udi`] only, so nothing unvalidated can reach a
/// path or a query. Counters are keyed by rate key and bucketed by
/// `window_start` (epoch seconds): a counter recorded for an earlier window
/// reads as zero.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Short backend label for logs and metrics.
    fn backend_name(&self) -> &'static str;

    async fn exists(&self, udi: &Udi) -> Result<bool, StorageError>;
    async fn get(&self, udi: &Udi) -> Result<Option<Document>, StorageError>;

    /// Insert or overwrite. Either the whole payload lands or the previous
    /// state stays visible.
    async fn store(&self, udi: &Udi, data: &[u8]) -> Result<(), StorageError>;

    /// Returns false if there was nothing to delete.
    async fn delete(&self, udi: &Udi) -> Result<bool, StorageError>;

    async fn get_counter(&self, key: &str, window_start: i64) -> Result<u64, StorageError>;
    async fn set_counter(&self, key: &str, window_start: i64, count: u64) -> Result<(), StorageError>;

    /// Admit one more request for `key` in the window if fewer than `limit`
    /// have been admitted so far.
    ///
    /// Default implementation is a plain read-then-write and is NOT atomic
    /// across concurrent callers. Backends that can do better override it.
    async fn increment_counter(
        &self,
        key: &str,
        window_start: i64,
        limit: u64,
    ) -> Result<CounterOutcome, StorageError> {
        let count = self.get_counter(key, window_start).await?;
        if count >= limit {
            return Ok(CounterOutcome::Denied { count });
        }
        self.set_counter(key, window_start, count + 1).await?;
        Ok(CounterOutcome::Admitted { count: count + 1 })
    }

    /// Every stored document with its size and last update.
    async fn list_documents(&self) -> Result<Vec<DocumentMeta>, StorageError>;
}
