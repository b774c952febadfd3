//! # Checkpointing
//!
//! Persistent replication positions for resumable tasks.
//!
//! A checkpoint records which phase a task is in and where to resume:
//! during the snapshot scan it holds the largest document id that has
//! not been fully processed yet, during tailing it holds an oplog
//! timestamp. Checkpoints are written after each committed batch, so a
//! restart replays at most one batch plus the tail safety lag.
//!
//! ## Usage
//!
//! ```ignore
//! use oxbow::checkpoint::{Checkpoint, CheckpointManager, FileCheckpointStore};
//!
//! let store = FileCheckpointStore::new("/var/oxbow/checkpoints").await?;
//! let manager = CheckpointManager::new(Arc::new(store));
//!
//! let cp = manager.load("db0.users___users.user").await;
//! manager.save("db0.users___users.user", &Checkpoint::tail_with_lag()).await;
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};

/// Largest possible hex ObjectId. A fresh scan starts here and walks
/// descending, so every document sorts at or below the cursor.
pub const MAX_OBJECT_ID: &str = "ffffffffffffffffffffffff";

/// Safety lag subtracted from the tail cursor so that a restart
/// re-reads events that were in flight when the checkpoint was taken.
pub const TAIL_SAFETY_LAG_SECS: i64 = 10;

/// A task's replication position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "phase", rename_all = "lowercase")]
pub enum Checkpoint {
    /// Snapshot scan in progress. `id` is the largest hex document id
    /// that has not yet been processed; the scan resumes with
    /// `_id <= id` descending.
    Scan {
        #[serde(default = "default_scan_id")]
        id: String,
    },
    /// Oplog tail in progress. `time` is a unix timestamp (seconds);
    /// the tail resumes from oplog entries at or after it.
    Tail { time: i64 },
}

fn default_scan_id() -> String {
    MAX_OBJECT_ID.to_string()
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::Scan {
            id: default_scan_id(),
        }
    }
}

impl Checkpoint {
    /// Fresh scan checkpoint covering the whole collection.
    pub fn scan_start() -> Self {
        Self::default()
    }

    /// Scan checkpoint at a specific cursor id.
    pub fn scan(id: impl Into<String>) -> Self {
        Self::Scan { id: id.into() }
    }

    /// Tail checkpoint at a specific unix time.
    pub fn tail(time: i64) -> Self {
        Self::Tail { time }
    }

    /// Tail checkpoint at the current time minus the safety lag.
    pub fn tail_with_lag() -> Self {
        Self::Tail {
            time: unix_now() - TAIL_SAFETY_LAG_SECS,
        }
    }

    pub fn phase(&self) -> &'static str {
        match self {
            Self::Scan { .. } => "scan",
            Self::Tail { .. } => "tail",
        }
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Trait for checkpoint storage backends.
///
/// Hosting applications can inject their own backend; `oxbowd` uses
/// [`FileCheckpointStore`].
#[async_trait::async_trait]
pub trait CheckpointBackend: Send + Sync {
    async fn save(&self, key: &str, checkpoint: Checkpoint) -> Result<()>;
    async fn load(&self, key: &str) -> Result<Option<Checkpoint>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Shared checkpoint backend.
pub type SharedCheckpointBackend = Arc<dyn CheckpointBackend>;

/// Persistent checkpoint storage.
///
/// Stores one JSON file per task with atomic tmp-then-rename writes.
pub struct FileCheckpointStore {
    base_dir: PathBuf,
    cache: RwLock<HashMap<String, Checkpoint>>,
    fsync: bool,
}

impl FileCheckpointStore {
    /// Create a new store, creating the directory if needed.
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await.map_err(SyncError::Io)?;

        Ok(Self {
            base_dir,
            cache: RwLock::new(HashMap::new()),
            fsync: true,
        })
    }

    /// Save a checkpoint.
    pub async fn save(&self, key: &str, checkpoint: Checkpoint) -> Result<()> {
        if key.is_empty() || key.contains('/') || key.contains('\\') {
            return Err(SyncError::checkpoint(format!(
                "invalid checkpoint key: {:?}",
                key
            )));
        }

        let file_path = self.file_path(key);
        let temp_path = file_path.with_extension("tmp");

        let json = serde_json::to_string_pretty(&checkpoint)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await
            .map_err(SyncError::Io)?;

        file.write_all(json.as_bytes()).await.map_err(SyncError::Io)?;

        if self.fsync {
            file.sync_all().await.map_err(SyncError::Io)?;
        }

        // Atomic rename
        fs::rename(&temp_path, &file_path)
            .await
            .map_err(SyncError::Io)?;

        {
            let mut cache = self.cache.write().await;
            cache.insert(key.to_string(), checkpoint);
        }

        debug!(key, "saved checkpoint");
        Ok(())
    }

    /// Load a checkpoint, or None if the task has never run.
    pub async fn load(&self, key: &str) -> Result<Option<Checkpoint>> {
        {
            let cache = self.cache.read().await;
            if let Some(cp) = cache.get(key) {
                return Ok(Some(cp.clone()));
            }
        }

        let file_path = self.file_path(key);
        if !file_path.exists() {
            return Ok(None);
        }

        let mut file = File::open(&file_path).await.map_err(SyncError::Io)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .await
            .map_err(SyncError::Io)?;

        let checkpoint: Checkpoint = serde_json::from_str(&contents)?;

        {
            let mut cache = self.cache.write().await;
            cache.insert(key.to_string(), checkpoint.clone());
        }

        Ok(Some(checkpoint))
    }

    /// Delete a checkpoint.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let file_path = self.file_path(key);

        if file_path.exists() {
            fs::remove_file(&file_path).await.map_err(SyncError::Io)?;
        }

        {
            let mut cache = self.cache.write().await;
            cache.remove(key);
        }

        info!(key, "deleted checkpoint");
        Ok(())
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", key))
    }
}

/// In-memory checkpoint store (for testing or when persistence isn't
/// needed).
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn save(&self, key: &str, checkpoint: Checkpoint) -> Result<()> {
        let mut checkpoints = self.checkpoints.write().await;
        checkpoints.insert(key.to_string(), checkpoint);
        Ok(())
    }

    pub async fn load(&self, key: &str) -> Result<Option<Checkpoint>> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints.get(key).cloned())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut checkpoints = self.checkpoints.write().await;
        checkpoints.remove(key);
        Ok(())
    }
}

#[async_trait::async_trait]
impl CheckpointBackend for FileCheckpointStore {
    async fn save(&self, key: &str, checkpoint: Checkpoint) -> Result<()> {
        FileCheckpointStore::save(self, key, checkpoint).await
    }

    async fn load(&self, key: &str) -> Result<Option<Checkpoint>> {
        FileCheckpointStore::load(self, key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        FileCheckpointStore::delete(self, key).await
    }
}

#[async_trait::async_trait]
impl CheckpointBackend for MemoryCheckpointStore {
    async fn save(&self, key: &str, checkpoint: Checkpoint) -> Result<()> {
        MemoryCheckpointStore::save(self, key, checkpoint).await
    }

    async fn load(&self, key: &str) -> Result<Option<Checkpoint>> {
        MemoryCheckpointStore::load(self, key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        MemoryCheckpointStore::delete(self, key).await
    }
}

/// Stateless façade over an injected backend.
///
/// Persistence failures are logged and swallowed: a missed checkpoint
/// costs a replay on restart, never the running pipeline.
#[derive(Clone)]
pub struct CheckpointManager {
    backend: SharedCheckpointBackend,
}

impl CheckpointManager {
    pub fn new(backend: SharedCheckpointBackend) -> Self {
        Self { backend }
    }

    /// Save a checkpoint, logging on failure.
    pub async fn save(&self, key: &str, checkpoint: &Checkpoint) {
        if let Err(e) = self.backend.save(key, checkpoint.clone()).await {
            warn!(key, error = %e, "failed to save checkpoint");
        }
    }

    /// Load a checkpoint. Missing or unreadable checkpoints resolve to
    /// None, which callers treat as a fresh scan.
    pub async fn load(&self, key: &str) -> Option<Checkpoint> {
        match self.backend.load(key).await {
            Ok(cp) => cp,
            Err(e) => {
                warn!(key, error = %e, "failed to load checkpoint, starting fresh");
                None
            }
        }
    }

    /// Delete a task's checkpoint so its next run starts with a fresh
    /// scan.
    pub async fn reset(&self, key: &str) {
        if let Err(e) = self.backend.delete(key).await {
            warn!(key, error = %e, "failed to delete checkpoint");
        }
    }
}
