// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the blob vault.
//!
//! Loading (file, env, CLI) is left to the embedding binary; everything here
//! is plain `Deserialize` with defaults.
//!
//! # Example
//!
//! ```
//! use blob_vault::config::{ServiceConfig, StorageConfig};
//!
//! // Minimal config (uses defaults)
//! let config = ServiceConfig::default();
//! assert_eq!(config.max_retention_days, 2 * 365);
//! assert!(matches!(config.storage, StorageConfig::File { .. }));
//!
//! // From JSON, as an embedding daemon might
//! let config: ServiceConfig = serde_json::from_str(r#"{
//!     "storage": { "type": "sqlite", "url": "sqlite://vault.db?mode=rwc" },
//!     "salt": "5f1d0c",
//!     "clients": {
//!         "client1": { "window_seconds": 60, "max_requests_per_window": 100, "ip_locked": true },
//!         "client2": { "window_seconds": -1, "max_requests_per_window": -1 }
//!     }
//! }"#).unwrap();
//! config.validate().unwrap();
//! assert!(config.client("client2").unwrap().limit().is_none());
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::rate_limit::ADDRESS_HASH_LEN;
use crate::storage::{CounterLocking, Dialect, MAX_COUNTER_KEY_LEN};

const PLACEHOLDER_SALT: &str = "please_change_this_salt_value";

/// Longest client id whose IP-locked rate key (`<id>_<hash>`) still fits
/// every backend.
pub const MAX_CLIENT_ID_LEN: usize = MAX_COUNTER_KEY_LEN - 1 - ADDRESS_HASH_LEN;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("client id '{0}' must be 1 to 174 ASCII letters, digits, '_' or '-'")]
    InvalidClientId(String),
    #[error("client '{client}': {reason}")]
    InvalidPolicy { client: String, reason: &'static str },
    #[error("storage: {0}")]
    InvalidStorage(String),
    #[error("{0}")]
    Invalid(&'static str),
}

/// Where documents and counters live.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    File {
        path: PathBuf,
        #[serde(default)]
        counter_locking: CounterLocking,
    },
    Sqlite {
        url: String,
    },
    Mysql {
        url: String,
    },
    /// Process-local, for tests and embedding.
    Memory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::File {
            path: PathBuf::from("data"),
            counter_locking: CounterLocking::default(),
        }
    }
}

/// Per-client limits. A negative `window_seconds` or
/// `max_requests_per_window` disables rate limiting for the client.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ClientPolicy {
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: i64,
    #[serde(default = "default_max_requests_per_window")]
    pub max_requests_per_window: i64,
    /// Count requests per (client, caller address) instead of per client.
    #[serde(default)]
    pub ip_locked: bool,
}

/// An effective (non-unlimited) rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimit {
    pub window_seconds: i64,
    pub max_requests: u64,
}

impl ClientPolicy {
    /// `None` means unlimited.
    #[must_use]
    pub fn limit(&self) -> Option<WindowLimit> {
        if self.window_seconds < 0 || self.max_requests_per_window < 0 {
            return None;
        }
        Some(WindowLimit {
            window_seconds: self.window_seconds,
            max_requests: self.max_requests_per_window as u64,
        })
    }
}

impl Default for ClientPolicy {
    fn default() -> Self {
        Self {
            max_payload_size: default_max_payload_size(),
            window_seconds: default_window_seconds(),
            max_requests_per_window: default_max_requests_per_window(),
            ip_locked: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    /// Server secret mixed into caller-address hashes.
    #[serde(default = "default_salt")]
    pub salt: String,

    /// Documents not updated for this many days are swept by retention.
    #[serde(default = "default_max_retention_days")]
    pub max_retention_days: u32,

    /// Deadline for every individual storage call.
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Admit requests when the rate limiter cannot reach storage.
    /// Off by default: a broken counter store must not lift the limits.
    #[serde(default)]
    pub rate_limit_fail_open: bool,

    /// Allow-list of client ids.
    #[serde(default)]
    pub clients: HashMap<String, ClientPolicy>,
}

fn default_salt() -> String { PLACEHOLDER_SALT.to_string() }
fn default_max_retention_days() -> u32 { 2 * 365 }
fn default_operation_timeout_ms() -> u64 { 5_000 }
fn default_max_payload_size() -> usize { 1024 * 1024 } // 1 MB
fn default_window_seconds() -> i64 { 60 }
fn default_max_requests_per_window() -> i64 { 100 }

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            salt: default_salt(),
            max_retention_days: default_max_retention_days(),
            operation_timeout_ms: default_operation_timeout_ms(),
            rate_limit_fail_open: false,
            clients: HashMap::new(),
        }
    }
}

impl ServiceConfig {
    #[must_use]
    pub fn client(&self, client_id: &str) -> Option<&ClientPolicy> {
        self.clients.get(client_id)
    }

    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.salt.is_empty() {
            return Err(ConfigError::Invalid("salt must not be empty"));
        }
        if self.salt == PLACEHOLDER_SALT {
            warn!("using the placeholder salt; caller address hashes are predictable");
        }
        if self.operation_timeout_ms == 0 {
            return Err(ConfigError::Invalid("operation_timeout_ms must be positive"));
        }

        match &self.storage {
            StorageConfig::Sqlite { url } => {
                if url.parse::<Dialect>().ok() != Some(Dialect::Sqlite) {
                    return Err(ConfigError::InvalidStorage(format!("not a sqlite url: {url}")));
                }
            }
            StorageConfig::Mysql { url } => {
                if url.parse::<Dialect>().ok() != Some(Dialect::Mysql) {
                    return Err(ConfigError::InvalidStorage("not a mysql url".into()));
                }
            }
            StorageConfig::File { path, .. } => {
                if path.as_os_str().is_empty() {
                    return Err(ConfigError::InvalidStorage("file path must not be empty".into()));
                }
            }
            StorageConfig::Memory => {}
        }

        for (client, policy) in &self.clients {
            let id_ok = !client.is_empty()
                && client.len() <= MAX_CLIENT_ID_LEN
                && client
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
            if !id_ok {
                return Err(ConfigError::InvalidClientId(client.clone()));
            }
            if policy.max_payload_size == 0 {
                return Err(ConfigError::InvalidPolicy {
                    client: client.clone(),
                    reason: "max_payload_size must be positive",
                });
            }
            if policy.window_seconds == 0 {
                return Err(ConfigError::InvalidPolicy {
                    client: client.clone(),
                    reason: "window_seconds must be positive, or -1 for unlimited",
                });
            }
        }
        Ok(())
    }
}
