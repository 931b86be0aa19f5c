// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document operations: create, read, update and delete of opaque blobs.
//!
//! The service owns no state beyond its backend handle. Every storage call is
//! bounded by the configured operation timeout, and every outcome is counted
//! and logged once here: internal faults at `error!`, client rejections at
//! `debug!`. A UDI is the only credential for its document, so spans and
//! events carry at most its first group.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use blob_vault::clock::SystemTimeSource;
//! use blob_vault::service::DocumentService;
//! use blob_vault::storage::InMemoryStore;
//!
//! # async fn example() -> Result<(), blob_vault::ServiceError> {
//! let service = DocumentService::new(
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(SystemTimeSource),
//!     Duration::from_secs(5),
//! );
//! let udi = service.create(b"hello", 1024).await?;
//! assert_eq!(service.read(udi.as_str()).await?, b"hello");
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::clock::TimeSource;
use crate::error::ServiceError;
use crate::metrics::{self, LatencyTimer};
use crate::storage::{bounded, Document, DocumentMeta, DocumentStore};
use crate::udi::{self, Udi};

pub struct DocumentService {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn TimeSource>,
    timeout: Duration,
}

fn check_size(payload: &[u8], max_size: usize) -> Result<(), ServiceError> {
    if payload.len() > max_size {
        return Err(ServiceError::PayloadTooLarge {
            size: payload.len(),
            limit: max_size,
        });
    }
    Ok(())
}

impl DocumentService {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn TimeSource>, timeout: Duration) -> Self {
        Self { store, clock, timeout }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn TimeSource> {
        &self.clock
    }

    /// Store a new document under a freshly generated identifier.
    #[tracing::instrument(skip(self, payload), fields(size = payload.len()))]
    pub async fn create(&self, payload: &[u8], max_size: usize) -> Result<Udi, ServiceError> {
        let _timer = LatencyTimer::new(self.store.backend_name(), "create");
        let result = self.create_inner(payload, max_size).await;
        self.finish("create", result)
    }

    async fn create_inner(&self, payload: &[u8], max_size: usize) -> Result<Udi, ServiceError> {
        check_size(payload, max_size)?;

        let udi = udi::generate(self.clock.now(), |candidate| async move {
            bounded(self.timeout, "exists", self.store.exists(&candidate)).await
        })
        .await?;

        bounded(self.timeout, "store", self.store.store(&udi, payload)).await?;
        metrics::record_bytes_written(self.store.backend_name(), payload.len());
        debug!(udi_prefix = udi.prefix(), "document created");
        Ok(udi)
    }

    /// Payload of an existing document, byte for byte.
    #[tracing::instrument(skip(self, udi))]
    pub async fn read(&self, udi: &str) -> Result<Vec<u8>, ServiceError> {
        self.read_document(udi).await.map(|doc| doc.data)
    }

    /// Payload plus metadata.
    #[tracing::instrument(skip(self, udi))]
    pub async fn read_document(&self, udi: &str) -> Result<Document, ServiceError> {
        let _timer = LatencyTimer::new(self.store.backend_name(), "read");
        let result = self.read_inner(udi).await;
        self.finish("read", result)
    }

    async fn read_inner(&self, udi: &str) -> Result<Document, ServiceError> {
        let udi = Udi::parse(udi)?;
        let doc = bounded(self.timeout, "get", self.store.get(&udi))
            .await?
            .ok_or(ServiceError::NotFound)?;
        metrics::record_bytes_read(self.store.backend_name(), doc.data.len());
        Ok(doc)
    }

    /// Overwrite an existing document. Never creates one.
    #[tracing::instrument(skip(self, udi, payload), fields(size = payload.len()))]
    pub async fn update(&self, udi: &str, payload: &[u8], max_size: usize) -> Result<Udi, ServiceError> {
        let _timer = LatencyTimer::new(self.store.backend_name(), "update");
        let result = self.update_inner(udi, payload, max_size).await;
        self.finish("update", result)
    }

    async fn update_inner(&self, udi: &str, payload: &[u8], max_size: usize) -> Result<Udi, ServiceError> {
        let udi = Udi::parse(udi)?;
        check_size(payload, max_size)?;

        if !bounded(self.timeout, "exists", self.store.exists(&udi)).await? {
            return Err(ServiceError::NotFound);
        }
        bounded(self.timeout, "store", self.store.store(&udi, payload)).await?;
        metrics::record_bytes_written(self.store.backend_name(), payload.len());
        debug!(udi_prefix = udi.prefix(), "document updated");
        Ok(udi)
    }

    /// Remove a document. Returns false if it was already gone.
    #[tracing::instrument(skip(self, udi), fields(udi_prefix = udi.prefix()))]
    pub async fn delete(&self, udi: &Udi) -> Result<bool, ServiceError> {
        let _timer = LatencyTimer::new(self.store.backend_name(), "delete");
        let result = bounded(self.timeout, "delete", self.store.delete(udi))
            .await
            .map_err(ServiceError::from);
        self.finish("delete", result)
    }

    /// Every stored document's metadata, for maintenance only.
    pub async fn list_documents(&self) -> Result<Vec<DocumentMeta>, ServiceError> {
        let _timer = LatencyTimer::new(self.store.backend_name(), "list");
        let result = bounded(self.timeout, "list_documents", self.store.list_documents())
            .await
            .map_err(ServiceError::from);
        self.finish("list", result)
    }

    fn finish<T>(&self, operation: &'static str, result: Result<T, ServiceError>) -> Result<T, ServiceError> {
        let backend = self.store.backend_name();
        match &result {
            Ok(_) => metrics::record_operation(backend, operation, "success"),
            Err(e) => {
                metrics::record_operation(backend, operation, "error");
                metrics::record_error(operation, e.kind());
                if e.is_internal() {
                    error!(operation, backend, error = %e, "document operation failed");
                } else {
                    debug!(operation, error = %e, "document operation rejected");
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::test_support::FailingStore;
    use crate::storage::InMemoryStore;

    fn service() -> DocumentService {
        DocumentService::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(ManualClock::at_secs(1_750_000_000)),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_create_then_read() {
        let service = service();
        let udi = service.create(b"\x00\x01binary\xff", 64).await.unwrap();
        assert!(udi::validate(udi.as_str()));
        assert_eq!(service.read(udi.as_str()).await.unwrap(), b"\x00\x01binary\xff");
    }

    #[tokio::test]
    async fn test_create_empty_payload() {
        let service = service();
        let udi = service.create(b"", 64).await.unwrap();
        assert!(service.read(udi.as_str()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_too_large_touches_nothing() {
        let service = DocumentService::new(
            Arc::new(FailingStore),
            Arc::new(ManualClock::at_secs(0)),
            Duration::from_secs(1),
        );
        let err = service.create(&[0u8; 11], 10).await.unwrap_err();
        assert!(matches!(err, ServiceError::PayloadTooLarge { size: 11, limit: 10 }));
    }

    #[tokio::test]
    async fn test_create_at_exact_limit() {
        let service = service();
        let payload = vec![7u8; 10];
        let udi = service.create(&payload, 10).await.unwrap();
        assert_eq!(service.read(udi.as_str()).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_read_invalid_and_missing() {
        let service = service();
        assert!(matches!(
            service.read("../../etc/passwd").await,
            Err(ServiceError::InvalidIdentifier)
        ));
        assert!(matches!(
            service.read("ABC-DEF-GHJ-KLM").await,
            Err(ServiceError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_update_never_creates() {
        let service = service();
        let err = service.update("ABC-DEF-GHJ-KLM", b"x", 10).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound));
        assert!(matches!(
            service.read("ABC-DEF-GHJ-KLM").await,
            Err(ServiceError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_update_replaces_and_advances_timestamp() {
        let service = service();
        let udi = service.create(b"first", 64).await.unwrap();
        let before = service.read_document(udi.as_str()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let updated = service.update(udi.as_str(), b"second", 64).await.unwrap();
        assert_eq!(updated, udi);

        let after = service.read_document(udi.as_str()).await.unwrap();
        assert_eq!(after.data, b"second");
        assert!(after.updated_at > before.updated_at);
    }

    #[tokio::test]
    async fn test_update_checks_size_and_format() {
        let service = service();
        let udi = service.create(b"x", 4).await.unwrap();
        assert!(matches!(
            service.update(udi.as_str(), b"12345", 4).await,
            Err(ServiceError::PayloadTooLarge { .. })
        ));
        assert!(matches!(
            service.update("abc-def-ghj-klm", b"1", 4).await,
            Err(ServiceError::InvalidIdentifier)
        ));
    }

    #[tokio::test]
    async fn test_delete() {
        let service = service();
        let udi = service.create(b"bye", 64).await.unwrap();
        assert!(service.delete(&udi).await.unwrap());
        assert!(!service.delete(&udi).await.unwrap());
        assert!(matches!(service.read(udi.as_str()).await, Err(ServiceError::NotFound)));
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn test_logs_never_carry_full_udi() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(logs.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let service = service();
        let udi = service.create(b"secret", 64).await.unwrap();
        service.read(udi.as_str()).await.unwrap();
        service.update(udi.as_str(), b"still secret", 64).await.unwrap();
        assert!(service.delete(&udi).await.unwrap());
        assert!(service.read(udi.as_str()).await.is_err());

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("document created"), "{output}");
        assert!(output.contains("document updated"), "{output}");
        assert!(output.contains("document operation rejected"), "{output}");
        assert!(output.contains(udi.prefix()));
        assert!(!output.contains(udi.as_str()), "{output}");
        let [_, second, third, fourth] = udi.groups();
        assert!(!output.contains(&format!("{second}-{third}-{fourth}")));
    }

    #[tokio::test]
    async fn test_storage_fault_maps_to_500() {
        let service = DocumentService::new(
            Arc::new(FailingStore),
            Arc::new(ManualClock::at_secs(0)),
            Duration::from_secs(1),
        );
        let err = service.create(b"x", 10).await.unwrap_err();
        assert!(matches!(err, ServiceError::StorageFault(_)));
        assert_eq!(err.status_code(), 500);
    }
}
