// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fixed-window request rate limiting.
//!
//! Time is cut into windows of `window_seconds` aligned to the epoch. Each
//! rate key gets one counter per window; a counter left over from an earlier
//! window reads as zero. The read-modify-write goes through
//! [`DocumentStore::increment_counter`], so its atomicity is whatever the
//! backend provides (see [`crate::storage`]).
//!
//! ```text
//!   window_start = floor(now / window) * window
//!
//!   |---- window N ----|---- window N+1 ----|
//!    A A A D D           A ...
//!          ^ count == limit, denied without mutation
//! ```

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::clock::TimeSource;
use crate::config::ClientPolicy;
use crate::metrics;
use crate::storage::{bounded, CounterOutcome, DocumentStore, StorageError};

#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Rate limiter unavailable: {0}")]
    Unavailable(#[from] StorageError),
}

/// Outcome of one rate check. `reset_at` is the epoch second the current
/// window ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Unlimited,
    Admitted { count: u64, limit: u64, reset_at: i64 },
    Denied { count: u64, limit: u64, reset_at: i64 },
}

impl RateDecision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Denied { .. })
    }

    /// Seconds until the window resets, at least 1 for a denial.
    #[must_use]
    pub fn retry_after_secs(&self, now_secs: i64) -> u64 {
        match self {
            Self::Denied { reset_at, .. } => (reset_at - now_secs).max(1) as u64,
            _ => 0,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Unlimited => "unlimited",
            Self::Admitted { .. } => "admitted",
            Self::Denied { .. } => "denied",
        }
    }
}

/// Start of the window containing `now_secs`.
#[must_use]
pub fn window_start(now_secs: i64, window_seconds: i64) -> i64 {
    now_secs.div_euclid(window_seconds) * window_seconds
}

/// Length of a [`hash_address`] digest.
pub const ADDRESS_HASH_LEN: usize = 64;

/// Salted SHA-256 of a caller address, hex encoded. The raw address must not
/// outlive this call.
#[must_use]
pub fn hash_address(salt: &str, address: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(address.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

/// Counter key for a client: the client id, suffixed with the address hash
/// when the policy is IP-locked.
#[must_use]
pub fn rate_key(client_id: &str, ip_hash: Option<&str>, policy: &ClientPolicy) -> String {
    match ip_hash {
        Some(hash) if policy.ip_locked => format!("{client_id}_{hash}"),
        _ => client_id.to_string(),
    }
}

pub struct RateLimiter {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn TimeSource>,
    timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn TimeSource>, timeout: Duration) -> Self {
        Self { store, clock, timeout }
    }

    /// Admit or deny one request, recording it when admitted.
    #[tracing::instrument(skip(self, ip_hash, policy))]
    pub async fn check(
        &self,
        client_id: &str,
        ip_hash: Option<&str>,
        policy: &ClientPolicy,
    ) -> Result<RateDecision, RateLimitError> {
        let Some(limit) = policy.limit() else {
            metrics::record_rate_limit("unlimited");
            return Ok(RateDecision::Unlimited);
        };

        let start = window_start(self.clock.now_secs(), limit.window_seconds);
        let reset_at = start + limit.window_seconds;
        let key = rate_key(client_id, ip_hash, policy);

        let outcome = bounded(
            self.timeout,
            "increment_counter",
            self.store.increment_counter(&key, start, limit.max_requests),
        )
        .await
        .map_err(|e| {
            metrics::record_rate_limit("unavailable");
            RateLimitError::Unavailable(e)
        })?;

        let decision = match outcome {
            CounterOutcome::Admitted { count } => RateDecision::Admitted {
                count,
                limit: limit.max_requests,
                reset_at,
            },
            CounterOutcome::Denied { count } => RateDecision::Denied {
                count,
                limit: limit.max_requests,
                reset_at,
            },
        };
        metrics::record_rate_limit(decision.label());
        debug!(decision = decision.label(), window_start = start, "rate check");
        Ok(decision)
    }

    /// Requests counted so far in the current window. Read-only; unlimited
    /// policies always report 0.
    pub async fn usage(
        &self,
        client_id: &str,
        ip_hash: Option<&str>,
        policy: &ClientPolicy,
    ) -> Result<u64, RateLimitError> {
        let Some(limit) = policy.limit() else {
            return Ok(0);
        };
        let start = window_start(self.clock.now_secs(), limit.window_seconds);
        let key = rate_key(client_id, ip_hash, policy);
        let count = bounded(self.timeout, "get_counter", self.store.get_counter(&key, start)).await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::test_support::FailingStore;
    use crate::storage::InMemoryStore;

    fn policy(window_seconds: i64, max: i64, ip_locked: bool) -> ClientPolicy {
        ClientPolicy {
            window_seconds,
            max_requests_per_window: max,
            ip_locked,
            ..Default::default()
        }
    }

    fn limiter(store: Arc<dyn DocumentStore>, clock: Arc<ManualClock>) -> RateLimiter {
        RateLimiter::new(store, clock, Duration::from_secs(1))
    }

    #[test]
    fn test_window_start_alignment() {
        assert_eq!(window_start(1_005, 10), 1_000);
        assert_eq!(window_start(1_000, 10), 1_000);
        assert_eq!(window_start(1_009, 10), 1_000);
        assert_eq!(window_start(59, 60), 0);
    }

    #[test]
    fn test_hash_address_hides_raw_address() {
        let hash = hash_address("salt", "203.0.113.7");
        assert_eq!(hash.len(), 64);
        assert!(!hash.contains("203.0.113.7"));
        assert_ne!(hash, hash_address("other-salt", "203.0.113.7"));
        assert_eq!(hash, hash_address("salt", "203.0.113.7"));
    }

    #[test]
    fn test_rate_key() {
        let locked = policy(60, 10, true);
        let open = policy(60, 10, false);
        assert_eq!(rate_key("client1", Some("abc"), &locked), "client1_abc");
        assert_eq!(rate_key("client1", Some("abc"), &open), "client1");
        assert_eq!(rate_key("client1", None, &locked), "client1");
    }

    #[tokio::test]
    async fn test_fixed_window_admits_then_denies_then_resets() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::at_secs(1_000));
        let limiter = limiter(store.clone(), clock.clone());
        let policy = policy(10, 3, false);

        for expected in 1..=3 {
            let decision = limiter.check("client1", None, &policy).await.unwrap();
            assert_eq!(
                decision,
                RateDecision::Admitted { count: expected, limit: 3, reset_at: 1_010 }
            );
        }

        let denied = limiter.check("client1", None, &policy).await.unwrap();
        assert!(!denied.is_allowed());
        assert_eq!(denied.retry_after_secs(1_000), 10);
        // Denial does not mutate the counter
        assert_eq!(limiter.usage("client1", None, &policy).await.unwrap(), 3);

        clock.advance(chrono::Duration::seconds(10));
        let decision = limiter.check("client1", None, &policy).await.unwrap();
        assert_eq!(
            decision,
            RateDecision::Admitted { count: 1, limit: 3, reset_at: 1_020 }
        );
    }

    #[tokio::test]
    async fn test_unlimited_never_touches_storage() {
        let limiter = limiter(Arc::new(FailingStore), Arc::new(ManualClock::at_secs(0)));
        let policy = policy(-1, -1, false);
        for _ in 0..50 {
            let decision = limiter.check("client2", None, &policy).await.unwrap();
            assert_eq!(decision, RateDecision::Unlimited);
        }
        assert_eq!(limiter.usage("client2", None, &policy).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ip_locked_counts_per_address() {
        let store = Arc::new(InMemoryStore::new());
        let limiter = limiter(store, Arc::new(ManualClock::at_secs(500)));
        let policy = policy(60, 1, true);
        let a = hash_address("s", "198.51.100.1");
        let b = hash_address("s", "198.51.100.2");

        assert!(limiter.check("client1", Some(&a), &policy).await.unwrap().is_allowed());
        assert!(!limiter.check("client1", Some(&a), &policy).await.unwrap().is_allowed());
        assert!(limiter.check("client1", Some(&b), &policy).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_zero_budget_denies() {
        let limiter = limiter(Arc::new(InMemoryStore::new()), Arc::new(ManualClock::at_secs(0)));
        let decision = limiter.check("c", None, &policy(60, 0, false)).await.unwrap();
        assert_eq!(decision, RateDecision::Denied { count: 0, limit: 0, reset_at: 60 });
    }

    #[tokio::test]
    async fn test_storage_fault_is_unavailable() {
        let limiter = limiter(Arc::new(FailingStore), Arc::new(ManualClock::at_secs(0)));
        let result = limiter.check("client1", None, &policy(60, 5, false)).await;
        assert!(matches!(result, Err(RateLimitError::Unavailable(StorageError::Backend(_)))));
    }
}
