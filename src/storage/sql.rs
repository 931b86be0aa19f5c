// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL storage backend (SQLite and MySQL/MariaDB).
//!
//! Both dialects share one schema; only the upsert syntax and column types
//! differ:
//!
//! ```sql
//! CREATE TABLE documents (
//!   udi VARCHAR(15) PRIMARY KEY,
//!   data LONGBLOB NOT NULL,
//!   updated_at BIGINT NOT NULL,   -- epoch millis
//!   created_at BIGINT NOT NULL    -- epoch millis, kept across updates
//! );
//! CREATE TABLE rate_limit (
//!   client_rate_key VARCHAR(255) PRIMARY KEY,
//!   window_start BIGINT NOT NULL, -- epoch seconds
//!   count BIGINT NOT NULL
//! );
//! ```
//!
//! Timestamps are integers rather than DATETIME so window comparisons are
//! plain integer comparisons on both databases.
//!
//! The `Any` driver decodes SQLite integers through a 32-bit value, which
//! would cut epoch milliseconds down to their low bits. On SQLite every wide
//! column is therefore selected as `CAST(.. AS TEXT)` and parsed back into an
//! `i64` (see [`SqlStore::wide`]).
//!
//! ## Counter increments
//!
//! [`DocumentStore::increment_counter`] runs in one transaction:
//!
//! 1. upsert the row, zeroing `count` if the stored window is older;
//! 2. `UPDATE ... SET count = count + 1 WHERE ... AND count < limit`;
//!    one affected row means the request was admitted;
//! 3. read the resulting count back.
//!
//! Step 1 is a write, so the row lock (InnoDB) or database write lock
//! (SQLite) is taken before anything is read. Concurrent increments on the
//! same key queue behind it and never lose an update.

use std::str::FromStr;
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::{debug, info};

use super::traits::{CounterOutcome, Document, DocumentMeta, DocumentStore, StorageError};
use super::check_counter_key;
use crate::clock::{SystemTimeSource, TimeSource};
use crate::resilience::retry::{retry, RetryConfig};
use crate::udi::Udi;

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// SQL flavour, picked from the connection URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Mysql,
}

impl FromStr for Dialect {
    type Err = StorageError;

    fn from_str(url: &str) -> Result<Self, Self::Err> {
        if url.starts_with("sqlite:") {
            Ok(Self::Sqlite)
        } else if url.starts_with("mysql:") || url.starts_with("mariadb:") {
            Ok(Self::Mysql)
        } else {
            Err(StorageError::Backend(format!(
                "unsupported SQL url scheme: {}",
                url.split(':').next().unwrap_or_default()
            )))
        }
    }
}

pub struct SqlStore {
    pool: AnyPool,
    dialect: Dialect,
    clock: Arc<dyn TimeSource>,
}

impl SqlStore {
    /// Connect and create the schema, with startup-mode retry (fails fast if
    /// the URL or credentials are wrong).
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let dialect: Dialect = connection_string.parse()?;

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(20)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(StorageError::from)
        })
        .await?;

        let store = Self {
            pool,
            dialect,
            clock: Arc::new(SystemTimeSource),
        };

        if dialect == Dialect::Sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        info!(?dialect, "SQL store connected");
        Ok(store)
    }

    /// Stamp `updated_at`/`created_at` from `clock` instead of the system
    /// clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Select expression for an integer that may not fit in 32 bits.
    fn wide(&self, expr: &str, alias: &str) -> String {
        match self.dialect {
            Dialect::Sqlite => format!("CAST({expr} AS TEXT) AS {alias}"),
            Dialect::Mysql => format!("{expr} AS {alias}"),
        }
    }

    /// Read back a column selected through [`Self::wide`].
    fn read_wide(&self, row: &AnyRow, column: &str) -> Result<i64, StorageError> {
        match self.dialect {
            Dialect::Sqlite => {
                let text: String = row.try_get(column)?;
                text.trim().parse().map_err(|_| {
                    StorageError::Backend(format!("column {column} is not an integer: {text:?}"))
                })
            }
            Dialect::Mysql => Ok(row.try_get(column)?),
        }
    }

    /// WAL lets readers proceed while a counter transaction holds the write
    /// lock.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: &[&str] = match self.dialect {
            Dialect::Sqlite => &[
                r#"
                CREATE TABLE IF NOT EXISTS documents (
                    udi TEXT PRIMARY KEY,
                    data BLOB NOT NULL,
                    updated_at INTEGER NOT NULL,
                    created_at INTEGER NOT NULL
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_documents_updated_at ON documents (updated_at)",
                r#"
                CREATE TABLE IF NOT EXISTS rate_limit (
                    client_rate_key TEXT PRIMARY KEY,
                    window_start INTEGER NOT NULL,
                    count INTEGER NOT NULL
                )
                "#,
            ],
            Dialect::Mysql => &[
                r#"
                CREATE TABLE IF NOT EXISTS documents (
                    udi VARCHAR(15) PRIMARY KEY,
                    data LONGBLOB NOT NULL,
                    updated_at BIGINT NOT NULL,
                    created_at BIGINT NOT NULL,
                    INDEX idx_updated_at (updated_at)
                ) ENGINE=InnoDB
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS rate_limit (
                    client_rate_key VARCHAR(255) PRIMARY KEY,
                    window_start BIGINT NOT NULL,
                    count BIGINT NOT NULL,
                    INDEX idx_window_start (window_start)
                ) ENGINE=InnoDB
                "#,
            ],
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(StorageError::from)
            })
            .await?;
        }
        Ok(())
    }

    fn document_upsert(&self) -> &'static str {
        match self.dialect {
            Dialect::Sqlite => {
                "INSERT INTO documents (udi, data, updated_at, created_at) VALUES (?, ?, ?, ?) \
                 ON CONFLICT(udi) DO UPDATE SET \
                    data = excluded.data, \
                    updated_at = excluded.updated_at"
            }
            Dialect::Mysql => {
                "INSERT INTO documents (udi, data, updated_at, created_at) VALUES (?, ?, ?, ?) \
                 ON DUPLICATE KEY UPDATE \
                    data = VALUES(data), \
                    updated_at = VALUES(updated_at)"
            }
        }
    }

    fn counter_upsert(&self) -> &'static str {
        match self.dialect {
            Dialect::Sqlite => {
                "INSERT INTO rate_limit (client_rate_key, window_start, count) VALUES (?, ?, ?) \
                 ON CONFLICT(client_rate_key) DO UPDATE SET \
                    window_start = excluded.window_start, \
                    count = excluded.count"
            }
            Dialect::Mysql => {
                "INSERT INTO rate_limit (client_rate_key, window_start, count) VALUES (?, ?, ?) \
                 ON DUPLICATE KEY UPDATE \
                    window_start = VALUES(window_start), \
                    count = VALUES(count)"
            }
        }
    }

    /// Create the row or roll a stale window over to the current one.
    /// MySQL applies assignments left to right, so `count` must be computed
    /// before `window_start` changes.
    fn counter_roll_window(&self) -> &'static str {
        match self.dialect {
            Dialect::Sqlite => {
                "INSERT INTO rate_limit (client_rate_key, window_start, count) VALUES (?, ?, 0) \
                 ON CONFLICT(client_rate_key) DO UPDATE SET \
                    count = CASE WHEN rate_limit.window_start < excluded.window_start \
                                 THEN 0 ELSE rate_limit.count END, \
                    window_start = MAX(rate_limit.window_start, excluded.window_start)"
            }
            Dialect::Mysql => {
                "INSERT INTO rate_limit (client_rate_key, window_start, count) VALUES (?, ?, 0) \
                 ON DUPLICATE KEY UPDATE \
                    count = IF(window_start < VALUES(window_start), 0, count), \
                    window_start = GREATEST(window_start, VALUES(window_start))"
            }
        }
    }
}

fn to_i64(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

fn to_u64(count: i64) -> u64 {
    u64::try_from(count).unwrap_or(0)
}

#[async_trait]
impl DocumentStore for SqlStore {
    fn backend_name(&self) -> &'static str {
        match self.dialect {
            Dialect::Sqlite => "sqlite",
            Dialect::Mysql => "mysql",
        }
    }

    async fn exists(&self, udi: &Udi) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT 1 FROM documents WHERE udi = ? LIMIT 1")
            .bind(udi.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn get(&self, udi: &Udi) -> Result<Option<Document>, StorageError> {
        let sql = format!(
            "SELECT data, {} FROM documents WHERE udi = ? LIMIT 1",
            self.wide("updated_at", "updated_at")
        );
        let row = sqlx::query(&sql)
            .bind(udi.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let data: Vec<u8> = row.try_get("data")?;
                let updated_at = self.read_wide(&row, "updated_at")?;
                Ok(Some(Document {
                    udi: udi.clone(),
                    data,
                    updated_at,
                }))
            }
            None => Ok(None),
        }
    }

    async fn store(&self, udi: &Udi, data: &[u8]) -> Result<(), StorageError> {
        let now = self.clock.now().timestamp_millis();
        sqlx::query(self.document_upsert())
            .bind(udi.as_str())
            .bind(data.to_vec())
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
        debug!(udi_prefix = udi.prefix(), bytes = data.len(), dialect = ?self.dialect, "document upserted");
        Ok(())
    }

    async fn delete(&self, udi: &Udi) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM documents WHERE udi = ?")
            .bind(udi.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_counter(&self, key: &str, window_start: i64) -> Result<u64, StorageError> {
        check_counter_key(key)?;
        let sql = format!(
            "SELECT {}, {} FROM rate_limit WHERE client_rate_key = ? LIMIT 1",
            self.wide("window_start", "window_start"),
            self.wide("count", "count")
        );
        let row = sqlx::query(&sql).bind(key).fetch_optional(&self.pool).await?;

        let Some(row) = row else {
            return Ok(0);
        };
        if self.read_wide(&row, "window_start")? < window_start {
            return Ok(0);
        }
        Ok(to_u64(self.read_wide(&row, "count")?))
    }

    async fn set_counter(&self, key: &str, window_start: i64, count: u64) -> Result<(), StorageError> {
        check_counter_key(key)?;
        sqlx::query(self.counter_upsert())
            .bind(key)
            .bind(window_start)
            .bind(to_i64(count))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn increment_counter(
        &self,
        key: &str,
        window_start: i64,
        limit: u64,
    ) -> Result<CounterOutcome, StorageError> {
        check_counter_key(key)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(self.counter_roll_window())
            .bind(key)
            .bind(window_start)
            .execute(&mut *tx)
            .await?;

        let bumped = sqlx::query(
            "UPDATE rate_limit SET count = count + 1 WHERE client_rate_key = ? AND count < ?",
        )
        .bind(key)
        .bind(to_i64(limit))
        .execute(&mut *tx)
        .await?;

        let sql = format!(
            "SELECT {} FROM rate_limit WHERE client_rate_key = ?",
            self.wide("count", "count")
        );
        let row = sqlx::query(&sql).bind(key).fetch_one(&mut *tx).await?;
        let count = to_u64(self.read_wide(&row, "count")?);

        tx.commit().await?;

        if bumped.rows_affected() > 0 {
            Ok(CounterOutcome::Admitted { count })
        } else {
            Ok(CounterOutcome::Denied { count })
        }
    }

    async fn list_documents(&self) -> Result<Vec<DocumentMeta>, StorageError> {
        let sql = format!(
            "SELECT udi, {}, {} FROM documents",
            self.wide("LENGTH(data)", "size"),
            self.wide("updated_at", "updated_at")
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.try_get("udi")?;
            // Rows not written through this crate are ignored, not trusted.
            let Ok(udi) = Udi::parse(&raw) else {
                continue;
            };
            let size = self.read_wide(&row, "size")?;
            let updated_at = self.read_wide(&row, "updated_at")?;
            documents.push(DocumentMeta {
                udi,
                size: to_u64(size),
                updated_at,
            });
        }
        Ok(documents)
    }
}
