// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backend bootstrap retry with exponential backoff.
//!
//! Only connecting and schema creation go through here. Request-path storage
//! calls fail once and surface as a storage fault.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use blob_vault::resilience::retry::RetryConfig;
//!
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_attempts, 5);
//! assert_eq!(startup.delay_before(1), Duration::from_millis(200));
//! assert_eq!(startup.delay_before(3), Duration::from_millis(800));
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::metrics;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total tries, the first one included.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::startup()
    }
}

impl RetryConfig {
    /// Backend bootstrap: five tries over roughly three seconds, so a wrong
    /// URL or password fails the process quickly.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            factor: 2.0,
        }
    }

    /// Pause after the `failed`-th failed attempt (1-based), capped at
    /// `max_delay`.
    #[must_use]
    pub fn delay_before(&self, failed: u32) -> Duration {
        let exponent = i32::try_from(failed.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled)
    }
}

/// Run `operation` until it succeeds or `config.max_attempts` tries have
/// failed, returning the last error.
pub async fn retry<F, Fut, T, E>(
    operation_name: &'static str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut failed = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if failed > 0 {
                    info!(operation = operation_name, failed, "bootstrap step recovered");
                }
                return Ok(value);
            }
            Err(err) => {
                failed += 1;
                if failed >= config.max_attempts {
                    warn!(operation = operation_name, failed, error = %err, "bootstrap step gave up");
                    return Err(err);
                }
                let delay = config.delay_before(failed);
                metrics::record_startup_retry(operation_name);
                warn!(
                    operation = operation_name,
                    attempt = failed,
                    max_attempts = config.max_attempts,
                    error = %err,
                    ?delay,
                    "bootstrap step failed, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::storage::StorageError;

    #[tokio::test]
    async fn test_first_success_needs_no_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<&str, StorageError> = retry("connect", &RetryConfig::test(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok("pool") }
        })
        .await;

        assert_eq!(result.unwrap(), "pool");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_when_database_comes_up() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, StorageError> = retry("connect", &RetryConfig::test(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(StorageError::Backend(format!("connection refused ({n})")))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_with_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), StorageError> = retry("init_schema", &RetryConfig::test(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(StorageError::Backend(format!("attempt {n}"))) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(result.unwrap_err().to_string().contains("attempt 3"));
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let config = RetryConfig::startup();
        let delays: Vec<Duration> = (1..=5).map(|n| config.delay_before(n)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(1600),
                Duration::from_secs(2),
            ]
        );
        assert_eq!(config.delay_before(u32::MAX), Duration::from_secs(2));
    }
}
