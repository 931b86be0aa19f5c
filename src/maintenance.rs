// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Operator tooling: storage statistics and the retention sweep.
//!
//! Nothing here is reachable from the request path. Listing walks every
//! stored document, so expect it to be slow on large stores.

use std::fmt;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tracing::info;

use crate::error::ServiceError;
use crate::metrics;
use crate::service::DocumentService;
use crate::storage::DocumentMeta;

const BUCKETS: usize = 10;
const BAR_WIDTH: usize = 40;

/// Human-readable size: `0 B`, `512 B`, `1.5 KB`, `2 MB`, ... up to GB,
/// rounded to two decimals.
#[must_use]
pub fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    if bytes < 1.0 {
        return "0 B".to_string();
    }
    let mut scaled = bytes;
    let mut pow = 0;
    while scaled >= 1024.0 && pow < UNITS.len() - 1 {
        scaled /= 1024.0;
        pow += 1;
    }
    let rounded = (scaled * 100.0).round() / 100.0;
    format!("{rounded} {}", UNITS[pow])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeBucket {
    /// Percent of the largest document size, e.g. 0, 10, ... 90.
    pub lower_percent: u8,
    pub upper_percent: u8,
    pub count: usize,
}

/// Document counts in ten equal slices of `[0, max_size]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeDistribution {
    pub buckets: Vec<SizeBucket>,
}

impl SizeDistribution {
    #[must_use]
    pub fn from_sizes(sizes: &[u64], max_size: u64) -> Self {
        let max = max_size as f64;
        let buckets = (0..BUCKETS)
            .map(|i| {
                let lower = i as f64 / BUCKETS as f64 * max;
                // Last slice is closed so the largest document lands in it
                let upper = if i == BUCKETS - 1 {
                    max + 1.0
                } else {
                    (i + 1) as f64 / BUCKETS as f64 * max
                };
                let count = sizes
                    .iter()
                    .filter(|&&size| {
                        let size = size as f64;
                        size >= lower && size < upper
                    })
                    .count();
                SizeBucket {
                    lower_percent: (i * 10) as u8,
                    upper_percent: ((i + 1) * 10) as u8,
                    count,
                }
            })
            .collect();
        Self { buckets }
    }
}

impl fmt::Display for SizeDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let peak = self.buckets.iter().map(|b| b.count).max().unwrap_or(0);
        for bucket in &self.buckets {
            let bar = if peak == 0 { 0 } else { bucket.count * BAR_WIDTH / peak };
            writeln!(
                f,
                " {:>3}% - {:>3}% : {} {} documents",
                bucket.lower_percent,
                bucket.upper_percent,
                "█".repeat(bar),
                bucket.count
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageStats {
    pub total_documents: usize,
    pub total_bytes: u64,
    pub average_bytes: f64,
    pub max_bytes: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub retention_days: u32,
    /// Documents past retention, i.e. what a sweep would delete now.
    pub expired_documents: usize,
    pub expired_bytes: u64,
    pub distribution: SizeDistribution,
}

fn format_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

impl fmt::Display for StorageStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total documents    : {}", self.total_documents)?;
        writeln!(
            f,
            "  Documents older than {} days : {}",
            self.retention_days, self.expired_documents
        )?;
        writeln!(
            f,
            "  Size of old documents     : {} ({})",
            self.expired_bytes,
            format_bytes(self.expired_bytes as f64)
        )?;
        writeln!(f, "Total size         : {} ({})", self.total_bytes, format_bytes(self.total_bytes as f64))?;
        writeln!(f, "Average size       : {:.2} ({})", self.average_bytes, format_bytes(self.average_bytes))?;
        writeln!(f, "Max size           : {} ({})", self.max_bytes, format_bytes(self.max_bytes as f64))?;
        writeln!(f, "Oldest document    : {}", format_time(self.oldest))?;
        writeln!(f, "Newest document    : {}", format_time(self.newest))?;
        writeln!(f, "Document size distribution (from 0% to 100% of max size):")?;
        write!(f, "{}", self.distribution)
    }
}

/// Outcome of a retention sweep. In a dry run `deleted` stays 0 and
/// `candidates` lists what would go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub dry_run: bool,
    pub candidates: Vec<DocumentMeta>,
    pub candidate_bytes: u64,
    pub deleted: usize,
}

pub struct Maintenance<'a> {
    service: &'a DocumentService,
    retention_days: u32,
}

impl<'a> Maintenance<'a> {
    pub fn new(service: &'a DocumentService, retention_days: u32) -> Self {
        Self { service, retention_days }
    }

    fn is_expired(&self, doc: &DocumentMeta, now: DateTime<Utc>) -> bool {
        let cutoff = now - Duration::days(i64::from(self.retention_days));
        doc.updated_at < cutoff.timestamp_millis()
    }

    pub async fn stats(&self) -> Result<StorageStats, ServiceError> {
        let docs = self.service.list_documents().await?;
        let now = self.service.clock().now();

        let total_documents = docs.len();
        let total_bytes: u64 = docs.iter().map(|d| d.size).sum();
        let max_bytes = docs.iter().map(|d| d.size).max().unwrap_or(0);
        let average_bytes = if total_documents == 0 {
            0.0
        } else {
            total_bytes as f64 / total_documents as f64
        };
        let to_time = |millis: i64| Utc.timestamp_millis_opt(millis).single();
        let oldest = docs.iter().map(|d| d.updated_at).min().and_then(to_time);
        let newest = docs.iter().map(|d| d.updated_at).max().and_then(to_time);

        let (expired_documents, expired_bytes) = docs
            .iter()
            .filter(|d| self.is_expired(d, now))
            .fold((0, 0), |(n, bytes), d| (n + 1, bytes + d.size));

        let sizes: Vec<u64> = docs.iter().map(|d| d.size).collect();

        metrics::set_stored_documents(total_documents);
        metrics::set_stored_bytes(total_bytes);

        Ok(StorageStats {
            total_documents,
            total_bytes,
            average_bytes,
            max_bytes,
            oldest,
            newest,
            retention_days: self.retention_days,
            expired_documents,
            expired_bytes,
            distribution: SizeDistribution::from_sizes(&sizes, max_bytes),
        })
    }

    /// Find documents past retention and, unless `dry_run`, delete them.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_expired(&self, dry_run: bool) -> Result<SweepReport, ServiceError> {
        let now = self.service.clock().now();
        let docs = self.service.list_documents().await?;
        info!(evaluated = docs.len(), retention_days = self.retention_days, "retention sweep");

        let candidates: Vec<DocumentMeta> = docs
            .into_iter()
            .filter(|d| self.is_expired(d, now))
            .collect();
        let candidate_bytes = candidates.iter().map(|d| d.size).sum();

        let mut deleted = 0;
        if !dry_run {
            for doc in &candidates {
                if self.service.delete(&doc.udi).await? {
                    deleted += 1;
                }
            }
            metrics::record_retention_sweep(deleted, candidate_bytes);
            info!(deleted, freed = %format_bytes(candidate_bytes as f64), "retention sweep done");
        } else {
            info!(
                found = candidates.len(),
                total = %format_bytes(candidate_bytes as f64),
                "retention dry run, nothing deleted"
            );
        }

        Ok(SweepReport {
            dry_run,
            candidates,
            candidate_bytes,
            deleted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::clock::ManualClock;
    use crate::storage::InMemoryStore;

    const NOW: i64 = 1_750_000_000;
    const DAY_MS: i64 = 86_400_000;

    fn setup() -> (Arc<InMemoryStore>, DocumentService) {
        let store = Arc::new(InMemoryStore::new());
        let service = DocumentService::new(
            store.clone(),
            Arc::new(ManualClock::at_secs(NOW)),
            std::time::Duration::from_secs(1),
        );
        (store, service)
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0.0), "0 B");
        assert_eq!(format_bytes(0.5), "0 B");
        assert_eq!(format_bytes(512.0), "512 B");
        assert_eq!(format_bytes(1024.0), "1 KB");
        assert_eq!(format_bytes(1536.0), "1.5 KB");
        assert_eq!(format_bytes(1_048_576.0), "1 MB");
        assert_eq!(format_bytes(1_234_567.0), "1.18 MB");
        assert_eq!(format_bytes(5.0 * 1024f64.powi(4)), "5120 GB");
    }

    #[test]
    fn test_distribution_buckets() {
        let dist = SizeDistribution::from_sizes(&[0, 5, 10, 50, 99, 100], 100);
        let counts: Vec<usize> = dist.buckets.iter().map(|b| b.count).collect();
        assert_eq!(counts, vec![2, 1, 0, 0, 0, 1, 0, 0, 0, 2]);
        assert_eq!(dist.buckets[9].lower_percent, 90);
        assert_eq!(dist.buckets[9].upper_percent, 100);
    }

    #[test]
    fn test_distribution_all_empty_documents() {
        let dist = SizeDistribution::from_sizes(&[0, 0], 0);
        assert_eq!(dist.buckets[9].count, 2);
        assert_eq!(dist.buckets.iter().map(|b| b.count).sum::<usize>(), 2);
    }

    #[test]
    fn test_distribution_bars() {
        let dist = SizeDistribution::from_sizes(&[1, 1, 10], 10);
        let rendered = dist.to_string();
        let second = rendered.lines().nth(1).unwrap();
        assert!(second.starts_with("  10% -  20% : "));
        assert_eq!(second.matches('█').count(), 40);
        assert!(second.ends_with("2 documents"));
        let last = rendered.lines().last().unwrap();
        assert_eq!(last.matches('█').count(), 20);
        assert!(last.ends_with("1 documents"));
    }

    #[tokio::test]
    async fn test_stats_empty_store() {
        let (_store, service) = setup();
        let stats = Maintenance::new(&service, 730).stats().await.unwrap();
        assert_eq!(stats.total_documents, 0);
        assert_eq!(stats.average_bytes, 0.0);
        assert!(stats.oldest.is_none());
        assert!(stats.to_string().contains("Oldest document    : -"));
    }

    #[tokio::test]
    async fn test_stats_aggregates() {
        let (store, service) = setup();
        let a = service.create(&[1u8; 100], 1024).await.unwrap();
        let b = service.create(&[2u8; 300], 1024).await.unwrap();
        store.set_updated_at(&a, NOW * 1000 - 800 * DAY_MS);
        store.set_updated_at(&b, NOW * 1000 - DAY_MS);

        let stats = Maintenance::new(&service, 730).stats().await.unwrap();
        assert_eq!(stats.total_documents, 2);
        assert_eq!(stats.total_bytes, 400);
        assert_eq!(stats.average_bytes, 200.0);
        assert_eq!(stats.max_bytes, 300);
        assert_eq!(stats.expired_documents, 1);
        assert_eq!(stats.expired_bytes, 100);
        assert!(stats.oldest < stats.newest);
        assert_eq!(stats.distribution.buckets.iter().map(|b| b.count).sum::<usize>(), 2);
    }

    #[tokio::test]
    async fn test_sweep_dry_run_then_confirm() {
        let (store, service) = setup();
        let old = service.create(b"old", 64).await.unwrap();
        let fresh = service.create(b"fresh", 64).await.unwrap();
        store.set_updated_at(&old, NOW * 1000 - 31 * DAY_MS);
        store.set_updated_at(&fresh, NOW * 1000 - 29 * DAY_MS);

        let maintenance = Maintenance::new(&service, 30);

        let dry = maintenance.sweep_expired(true).await.unwrap();
        assert!(dry.dry_run);
        assert_eq!(dry.deleted, 0);
        assert_eq!(dry.candidates.len(), 1);
        assert_eq!(dry.candidates[0].udi, old);
        assert_eq!(dry.candidate_bytes, 3);
        assert_eq!(store.len(), 2);

        let done = maintenance.sweep_expired(false).await.unwrap();
        assert_eq!(done.deleted, 1);
        assert_eq!(store.len(), 1);
        assert!(service.read(fresh.as_str()).await.is_ok());
        assert!(matches!(service.read(old.as_str()).await, Err(ServiceError::NotFound)));
    }

    #[tokio::test]
    async fn test_sweep_ages_documents_on_shared_clock() {
        let clock = Arc::new(ManualClock::at_secs(NOW));
        let store = Arc::new(InMemoryStore::new().with_clock(clock.clone()));
        let service =
            DocumentService::new(store.clone(), clock.clone(), std::time::Duration::from_secs(1));
        let udi = service.create(b"ages", 64).await.unwrap();
        let maintenance = Maintenance::new(&service, 30);

        clock.advance(Duration::days(29));
        assert!(maintenance.sweep_expired(false).await.unwrap().candidates.is_empty());
        assert_eq!(maintenance.stats().await.unwrap().expired_documents, 0);

        clock.advance(Duration::days(2));
        assert_eq!(maintenance.stats().await.unwrap().expired_documents, 1);
        let report = maintenance.sweep_expired(false).await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.candidates[0].udi, udi);
        assert!(store.is_empty());
    }
}
