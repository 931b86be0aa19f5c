// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for blob-vault.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `blob_vault_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for size histograms
//!
//! # Labels
//! - `backend`: file, sqlite, mysql, memory
//! - `operation`: create, read, update, delete
//! - `status`: success, error
//!
//! No label ever carries a UDI, client address or payload.

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a document operation outcome
pub fn record_operation(backend: &str, operation: &str, status: &str) {
    counter!(
        "blob_vault_operations_total",
        "backend" => backend.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(backend: &str, operation: &str, duration: Duration) {
    histogram!(
        "blob_vault_operation_seconds",
        "backend" => backend.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a rejected or failed request by error kind
pub fn record_error(operation: &str, kind: &str) {
    counter!(
        "blob_vault_errors_total",
        "operation" => operation.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a storage call that exceeded its deadline
pub fn record_timeout(operation: &str) {
    counter!(
        "blob_vault_timeouts_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a generated identifier that already existed
pub fn record_udi_collision() {
    counter!("blob_vault_udi_collisions_total").increment(1);
}

/// Record a failed backend bootstrap step that will be retried
pub fn record_startup_retry(operation: &str) {
    counter!(
        "blob_vault_startup_retries_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a rate limiter verdict (unlimited, admitted, denied, unavailable)
pub fn record_rate_limit(decision: &str) {
    counter!(
        "blob_vault_rate_limit_decisions_total",
        "decision" => decision.to_string()
    )
    .increment(1);
}

/// Record payload bytes written
pub fn record_bytes_written(backend: &str, bytes: usize) {
    histogram!(
        "blob_vault_write_bytes",
        "backend" => backend.to_string()
    )
    .record(bytes as f64);
}

/// Record payload bytes read
pub fn record_bytes_read(backend: &str, bytes: usize) {
    histogram!(
        "blob_vault_read_bytes",
        "backend" => backend.to_string()
    )
    .record(bytes as f64);
}

/// Set stored document count, as seen by the last stats scan
pub fn set_stored_documents(count: usize) {
    gauge!("blob_vault_stored_documents").set(count as f64);
}

/// Set stored payload bytes, as seen by the last stats scan
pub fn set_stored_bytes(bytes: u64) {
    gauge!("blob_vault_stored_bytes").set(bytes as f64);
}

/// Record a retention sweep that actually deleted documents
pub fn record_retention_sweep(deleted: usize, bytes: u64) {
    counter!("blob_vault_retention_deleted_total").increment(deleted as u64);
    counter!("blob_vault_retention_deleted_bytes_total").increment(bytes);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    backend: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(backend: &'static str, operation: &'static str) -> Self {
        Self {
            backend,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.backend, self.operation, self.start.elapsed());
    }
}
