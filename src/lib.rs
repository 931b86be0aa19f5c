//! # Blob Vault
//!
//! Anonymous blob storage: clients drop opaque documents, get back an opaque
//! identifier (UDI), and later fetch or overwrite the document by that
//! identifier, under a per-client request-rate gate.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Gateway                            │
//! │  • client allow-list, caller address hashing               │
//! │  • PUT create / POST update / GET read, status mapping     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        RateLimiter                          │
//! │  • fixed windows aligned to the epoch                      │
//! │  • one counter per client (or client + address hash)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      DocumentService                        │
//! │  • UDI generation (collision-checked) and validation        │
//! │  • size limits, per-call timeouts                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  DocumentStore (one of)                     │
//! │  • FsStore: sharded files, tmp + rename                    │
//! │  • SqlStore: SQLite / MySQL, transactional counters        │
//! │  • InMemoryStore                                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use blob_vault::{ApiRequest, ClientPolicy, Gateway, ServiceConfig, StorageConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut config = ServiceConfig {
//!         storage: StorageConfig::Sqlite { url: "sqlite://vault.db?mode=rwc".into() },
//!         salt: "change-me".into(),
//!         ..Default::default()
//!     };
//!     config.clients.insert("client1".into(), ClientPolicy::default());
//!
//!     let gateway = Gateway::open(config).await.expect("Failed to start");
//!
//!     let response = gateway
//!         .handle(ApiRequest::new("PUT", "client1").with_remote_addr("10.0.0.1").with_body("hello"))
//!         .await;
//!     println!("{} {}", response.status, response.text());
//! }
//! ```
//!
//! ## Modules
//!
//! - [`gateway`]: request rules and status mapping
//! - [`service`]: create/read/update/delete of documents
//! - [`rate_limit`]: fixed-window limiter
//! - [`udi`]: identifier generation and validation
//! - [`storage`]: backends (filesystem, SQL, memory)
//! - [`maintenance`]: statistics and the retention sweep
//! - [`resilience`]: startup retry

pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod maintenance;
pub mod metrics;
pub mod rate_limit;
pub mod resilience;
pub mod service;
pub mod storage;
pub mod udi;

pub use clock::{ManualClock, SystemTimeSource, TimeSource};
pub use config::{ClientPolicy, ConfigError, ServiceConfig, StorageConfig};
pub use error::ServiceError;
pub use gateway::{ApiRequest, ApiResponse, Gateway, Method, StartupError};
pub use maintenance::{format_bytes, Maintenance, StorageStats, SweepReport};
pub use metrics::LatencyTimer;
pub use rate_limit::{RateDecision, RateLimitError, RateLimiter};
pub use resilience::retry::RetryConfig;
pub use service::DocumentService;
pub use storage::traits::{Document, DocumentMeta, DocumentStore, StorageError};
pub use udi::Udi;
