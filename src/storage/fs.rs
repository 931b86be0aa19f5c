// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Filesystem backend.
//!
//! The UDI is not the file name the caller sees: documents are sharded into
//! two directory levels taken from the first two UDI groups.
//!
//! ```text
//! root/
//! ├── 26A/
//! │   └── XK4/
//! │       └── 26A-XK4-9PB-TTM.data     ← raw payload
//! ├── rate_limit_client1.rate          ← decimal count, mtime = window start
//! └── rate_limit_client1.lock          ← advisory lock (CounterLocking::Advisory)
//! ```
//!
//! Every write goes to a uniquely named `.tmp` sibling first and is renamed
//! into place, so readers see either the old or the new content. A document's
//! mtime is its `updated_at` and is stamped from the store's [`TimeSource`].
//!
//! ## Counter race
//!
//! With [`CounterLocking::BestEffort`] (the default) the counter update is an
//! unlocked read-modify-write: two processes hitting the same key at the same
//! instant can both read N and both write N+1. The limiter then lets one extra
//! request through. [`CounterLocking::Advisory`] serialises the update behind
//! an `fs2` exclusive lock instead.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::check_counter_key;
use super::traits::{CounterOutcome, Document, DocumentMeta, DocumentStore, StorageError};
use crate::clock::{SystemTimeSource, TimeSource};
use crate::udi::Udi;

const DATA_EXT: &str = "data";
const COUNTER_PREFIX: &str = "rate_limit_";
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const SHARD_ATTEMPTS: u32 = 5;

/// How counter read-modify-write is protected on the filesystem backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterLocking {
    /// Unlocked read-then-write; concurrent requests may over-admit slightly.
    #[default]
    BestEffort,
    /// Exclusive per-key `flock` around the read-modify-write.
    Advisory,
}

#[derive(Clone)]
pub struct FsStore {
    root: PathBuf,
    locking: CounterLocking,
    clock: Arc<dyn TimeSource>,
}

impl std::fmt::Debug for FsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsStore")
            .field("root", &self.root)
            .field("locking", &self.locking)
            .finish_non_exhaustive()
    }
}

impl FsStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Self::with_locking(root, CounterLocking::default())
    }

    pub fn with_locking(root: impl Into<PathBuf>, locking: CounterLocking) -> Result<Self, StorageError> {
        let root = root.into();
        create_private_dir(&root)?;
        Ok(Self {
            root,
            locking,
            clock: Arc::new(SystemTimeSource),
        })
    }

    /// Stamp document mtimes from `clock` instead of the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, udi: &Udi) -> Result<PathBuf, StorageError> {
        let [g1, g2, _, _] = udi.groups();
        // Udi already excludes separators and dots; this is the last check
        // before the string becomes a path.
        for part in [g1, g2, udi.as_str()] {
            let mut components = Path::new(part).components();
            let single = matches!(components.next(), Some(Component::Normal(_)))
                && components.next().is_none();
            if !single {
                return Err(StorageError::Backend(format!(
                    "unsafe path component in {}-...",
                    udi.prefix()
                )));
            }
        }
        Ok(self
            .root
            .join(g1)
            .join(g2)
            .join(format!("{udi}.{DATA_EXT}")))
    }

    fn counter_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{COUNTER_PREFIX}{key}.rate"))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{COUNTER_PREFIX}{key}.lock"))
    }

    async fn write_document(&self, dir: &Path, tmp: &Path, data: &[u8]) -> std::io::Result<()> {
        let modified = SystemTime::from(self.clock.now());
        // A concurrent delete may prune either shard level at any point until
        // the tmp file exists, including halfway through create_dir_all.
        let mut attempt = 1;
        let mut file = loop {
            let created = match tokio::fs::create_dir_all(dir).await {
                Ok(()) => tokio::fs::File::create(tmp).await,
                Err(e) => Err(e),
            };
            match created {
                Ok(file) => break file,
                Err(e) if e.kind() == ErrorKind::NotFound && attempt < SHARD_ATTEMPTS => {
                    debug!(attempt, "shard directory pruned under us, recreating");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };
        file.write_all(data).await?;
        file.flush().await?;
        let file = file.into_std().await;
        file.set_modified(modified)?;
        file.sync_all()
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, StorageError> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| StorageError::Backend(format!("blocking task failed: {e}")))?
    }
}

fn create_private_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{name}.{}.tmp", uuid::Uuid::new_v4().simple()))
}

fn epoch_millis(time: SystemTime) -> i64 {
    DateTime::<Utc>::from(time).timestamp_millis()
}

fn epoch_secs(time: SystemTime) -> i64 {
    DateTime::<Utc>::from(time).timestamp()
}

/// Counter files: content is the count, mtime is the window start.
fn read_counter(path: &Path, window_start: i64) -> Result<u64, StorageError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let stored_window = epoch_secs(file.metadata()?.modified()?);
    if stored_window < window_start {
        return Ok(0);
    }
    let mut content = Vec::new();
    file.read_to_end(&mut content)?;
    let parsed = std::str::from_utf8(&content)
        .ok()
        .and_then(|text| text.trim().parse::<u64>().ok());
    match parsed {
        Some(count) => Ok(count),
        None => {
            // Overwritten by the next admitted request.
            warn!(path = %path.display(), "unreadable rate counter, treating as zero");
            Ok(0)
        }
    }
}

fn write_counter(path: &Path, window_start: i64, count: u64) -> Result<(), StorageError> {
    let tmp = tmp_sibling(path);
    let mtime = UNIX_EPOCH + Duration::from_secs(window_start.max(0) as u64);

    let result = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(count.to_string().as_bytes())?;
        file.set_modified(mtime)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, path)
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Exclusive advisory lock on a counter, released when dropped.
struct CounterLock {
    file: File,
}

impl CounterLock {
    fn acquire(path: &Path, timeout: Duration) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        let deadline = Instant::now() + timeout;
        let mut delay = Duration::from_millis(1);
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(Self { file }),
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(Duration::from_millis(50));
                }
                Err(_) => return Err(StorageError::Timeout { operation: "counter_lock" }),
            }
        }
    }
}

impl Drop for CounterLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[async_trait]
impl DocumentStore for FsStore {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    async fn exists(&self, udi: &Udi) -> Result<bool, StorageError> {
        let path = self.document_path(udi)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, udi: &Udi) -> Result<Option<Document>, StorageError> {
        let path = self.document_path(udi)?;
        let udi = udi.clone();
        // Metadata and content come from the same handle, so a concurrent
        // rename cannot pair old bytes with a new timestamp.
        self.blocking(move || {
            let mut file = match File::open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let updated_at = epoch_millis(file.metadata()?.modified()?);
            let mut data = Vec::new();
            file.read_to_end(&mut data)?;
            Ok(Some(Document { udi, data, updated_at }))
        })
        .await
    }

    async fn store(&self, udi: &Udi, data: &[u8]) -> Result<(), StorageError> {
        let path = self.document_path(udi)?;
        let dir = path
            .parent()
            .ok_or_else(|| StorageError::Backend("document path has no parent".into()))?
            .to_path_buf();
        let tmp = tmp_sibling(&path);

        if let Err(e) = self.write_document(&dir, &tmp, data).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!(udi_prefix = udi.prefix(), bytes = data.len(), "document written");
        Ok(())
    }

    async fn delete(&self, udi: &Udi) -> Result<bool, StorageError> {
        let path = self.document_path(udi)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        // Prune the shard directories if this was their last document.
        // remove_dir refuses non-empty directories, which is what we want.
        if let Some(shard) = path.parent() {
            if tokio::fs::remove_dir(shard).await.is_ok() {
                if let Some(outer) = shard.parent() {
                    let _ = tokio::fs::remove_dir(outer).await;
                }
            }
        }
        Ok(true)
    }

    async fn get_counter(&self, key: &str, window_start: i64) -> Result<u64, StorageError> {
        check_counter_key(key)?;
        let path = self.counter_path(key);
        self.blocking(move || read_counter(&path, window_start)).await
    }

    async fn set_counter(&self, key: &str, window_start: i64, count: u64) -> Result<(), StorageError> {
        check_counter_key(key)?;
        let path = self.counter_path(key);
        self.blocking(move || write_counter(&path, window_start, count)).await
    }

    async fn increment_counter(
        &self,
        key: &str,
        window_start: i64,
        limit: u64,
    ) -> Result<CounterOutcome, StorageError> {
        check_counter_key(key)?;
        let counter = self.counter_path(key);
        let lock = match self.locking {
            CounterLocking::BestEffort => None,
            CounterLocking::Advisory => Some(self.lock_path(key)),
        };

        self.blocking(move || {
            let _guard = match lock {
                Some(ref path) => Some(CounterLock::acquire(path, LOCK_TIMEOUT)?),
                None => None,
            };
            let count = read_counter(&counter, window_start)?;
            if count >= limit {
                return Ok(CounterOutcome::Denied { count });
            }
            write_counter(&counter, window_start, count + 1)?;
            Ok(CounterOutcome::Admitted { count: count + 1 })
        })
        .await
    }

    async fn list_documents(&self) -> Result<Vec<DocumentMeta>, StorageError> {
        let root = self.root.clone();
        self.blocking(move || {
            let mut documents = Vec::new();
            for outer in std::fs::read_dir(&root)? {
                let outer = outer?;
                if !outer.file_type()?.is_dir() {
                    continue;
                }
                for shard in std::fs::read_dir(outer.path())? {
                    let shard = shard?;
                    if !shard.file_type()?.is_dir() {
                        continue;
                    }
                    for entry in std::fs::read_dir(shard.path())? {
                        let entry = entry?;
                        let name = entry.file_name();
                        let Some(stem) = name
                            .to_str()
                            .and_then(|n| n.strip_suffix(".data"))
                        else {
                            continue;
                        };
                        let Ok(udi) = Udi::parse(stem) else {
                            continue;
                        };
                        let meta = entry.metadata()?;
                        documents.push(DocumentMeta {
                            udi,
                            size: meta.len(),
                            updated_at: epoch_millis(meta.modified()?),
                        });
                    }
                }
            }
            Ok(documents)
        })
        .await
    }
}
