use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::check_counter_key;
use super::traits::{CounterOutcome, Document, DocumentMeta, DocumentStore, StorageError};
use crate::clock::{SystemTimeSource, TimeSource};
use crate::udi::Udi;

/// Process-local backend. Nothing survives a restart.
pub struct InMemoryStore {
    documents: DashMap<Udi, Document>,
    /// key -> (window_start, count)
    counters: DashMap<String, (i64, u64)>,
    clock: Arc<dyn TimeSource>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            documents: DashMap::new(),
            counters: DashMap::new(),
            clock: Arc::new(SystemTimeSource),
        }
    }

    /// Stamp `updated_at` from `clock` instead of the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Get current document count
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Backdate a document, for retention tests.
    pub fn set_updated_at(&self, udi: &Udi, updated_at: i64) -> bool {
        match self.documents.get_mut(udi) {
            Some(mut doc) => {
                doc.updated_at = updated_at;
                true
            }
            None => false,
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn exists(&self, udi: &Udi) -> Result<bool, StorageError> {
        Ok(self.documents.contains_key(udi))
    }

    async fn get(&self, udi: &Udi) -> Result<Option<Document>, StorageError> {
        Ok(self.documents.get(udi).map(|r| r.value().clone()))
    }

    async fn store(&self, udi: &Udi, data: &[u8]) -> Result<(), StorageError> {
        let doc = Document {
            udi: udi.clone(),
            data: data.to_vec(),
            updated_at: self.clock.now().timestamp_millis(),
        };
        self.documents.insert(udi.clone(), doc);
        Ok(())
    }

    async fn delete(&self, udi: &Udi) -> Result<bool, StorageError> {
        Ok(self.documents.remove(udi).is_some())
    }

    async fn get_counter(&self, key: &str, window_start: i64) -> Result<u64, StorageError> {
        check_counter_key(key)?;
        Ok(match self.counters.get(key) {
            Some(entry) if entry.0 >= window_start => entry.1,
            _ => 0,
        })
    }

    async fn set_counter(&self, key: &str, window_start: i64, count: u64) -> Result<(), StorageError> {
        check_counter_key(key)?;
        self.counters.insert(key.to_string(), (window_start, count));
        Ok(())
    }

    async fn increment_counter(
        &self,
        key: &str,
        window_start: i64,
        limit: u64,
    ) -> Result<CounterOutcome, StorageError> {
        check_counter_key(key)?;
        // The entry guard holds the shard lock for the whole read-modify-write.
        let mut entry = self.counters.entry(key.to_string()).or_insert((window_start, 0));
        if entry.0 < window_start {
            *entry = (window_start, 0);
        }
        if entry.1 >= limit {
            return Ok(CounterOutcome::Denied { count: entry.1 });
        }
        entry.1 += 1;
        Ok(CounterOutcome::Admitted { count: entry.1 })
    }

    async fn list_documents(&self) -> Result<Vec<DocumentMeta>, StorageError> {
        Ok(self
            .documents
            .iter()
            .map(|r| DocumentMeta {
                udi: r.key().clone(),
                size: r.value().data.len() as u64,
                updated_at: r.value().updated_at,
            })
            .collect())
    }
}
