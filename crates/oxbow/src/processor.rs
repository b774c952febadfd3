//! # Task processor
//!
//! Drives one task through its two phases:
//!
//! ```text
//!   ┌──────────┐  scan complete   ┌─────────┐
//!   │ SCANNING │ ───────────────> │ TAILING │ ──┐
//!   └──────────┘                  └─────────┘   │ restart from
//!        │                             ^────────┘ now - 60s on error
//!        │ fatal error: task aborts,
//!        v checkpoint retained
//! ```
//!
//! The transition is one-way: once a task tails, it never rescans
//! unless its checkpoint is deleted. Each committed batch advances the
//! checkpoint; a batch whose load fails is dropped with a warning and
//! leaves the checkpoint untouched, so the gap is bounded by what a
//! restart replays.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::batch::{self, BatchConfig};
use crate::checkpoint::{unix_now, Checkpoint, CheckpointManager};
use crate::config::{Controls, Task};
use crate::error::{Result, SyncError};
use crate::es::EsSink;
use crate::extract::Extractor;
use crate::load::{BulkLoader, Loader};
use crate::merge;
use crate::mongo::MongoSource;
use crate::transform::{Ir, Transformer};

/// Tail batches are kept small so sink lookups stay bounded per batch.
const TAIL_BATCH_SIZE: usize = 500;
/// How far back the tail restarts after a recoverable error.
const TAIL_RESTART_LAG_SECS: i64 = 60;
/// Pause before reopening a broken tail cursor.
const TAIL_RESTART_DELAY: Duration = Duration::from_secs(1);

pub struct Processor {
    task: Arc<Task>,
    controls: Controls,
    extractor: Extractor,
    transformer: Transformer,
    loader: Arc<dyn BulkLoader>,
    checkpoints: CheckpointManager,
}

impl Processor {
    pub fn new(
        task: Arc<Task>,
        controls: Controls,
        mongo: MongoSource,
        es: EsSink,
        checkpoints: CheckpointManager,
    ) -> Self {
        let extractor = Extractor::new(mongo.clone(), task.clone(), controls.mongodb_read_capacity);
        let lookup = mongo.lookup(&task);
        let transformer = Transformer::new(task.clone(), Arc::new(es.clone()), Arc::new(lookup));
        let loader: Arc<dyn BulkLoader> = Arc::new(Loader::new(es));

        Self {
            task,
            controls,
            extractor,
            transformer,
            loader,
            checkpoints,
        }
    }

    /// Run the task to completion. Only a fatal scan error or an
    /// unrecoverable tail error returns; a healthy task runs forever.
    pub async fn run(self) -> Result<()> {
        let name = self.task.name();
        let mut checkpoint = self
            .checkpoints
            .load(&name)
            .await
            .unwrap_or_else(|| self.task.from.clone());
        info!(task = %name, phase = checkpoint.phase(), "starting task");

        if let Checkpoint::Scan { id } = &checkpoint {
            // Everything written during the scan is replayed by the
            // tail, so the tail cursor is the scan's start time.
            let scan_started = unix_now();
            if let Err(e) = self.run_scan(&name, id.clone()).await {
                error!(task = %name, error = %e, category = ?e.category(), "scan failed, aborting task");
                return Err(e);
            }
            checkpoint = Checkpoint::tail(scan_started);
            self.checkpoints.save(&name, &checkpoint).await;
            info!(task = %name, "scan complete, switching to tail");
        }

        let Checkpoint::Tail { time } = checkpoint else {
            return Err(SyncError::other("scan finished without a tail checkpoint"));
        };

        let mut from = time;
        loop {
            let err = match self.run_tail(&name, from).await {
                Ok(()) => SyncError::oplog("tail stream ended unexpectedly"),
                Err(e) => e,
            };
            if !err.is_recoverable() {
                error!(task = %name, error = %err, category = ?err.category(), "tail failed, aborting task");
                return Err(err);
            }
            from = unix_now() - TAIL_RESTART_LAG_SECS;
            warn!(task = %name, error = %err, restart_from = from, "tail error, restarting");
            tokio::time::sleep(TAIL_RESTART_DELAY).await;
        }
    }

    async fn run_scan(&self, name: &str, max_id: String) -> Result<()> {
        let rx = self.extractor.scan(&max_id).await?;
        let config = BatchConfig::new(
            self.controls.elasticsearch_bulk_size,
            Duration::from_millis(self.controls.flush_interval_ms),
        );
        let mut batches = batch::batches(rx, config);

        while let Some(batch) = batches.recv().await {
            // An extraction error inside a scan batch is fatal
            let docs = collect_batch(batch)?;
            let irs: Vec<Ir> = docs
                .iter()
                .filter_map(|doc| self.transformer.document(doc))
                .collect();

            // The stream is descending, so the first item of the batch
            // is the largest id not yet committed
            let Some(cursor_id) = irs.first().map(|ir| ir.id().to_string()) else {
                continue;
            };

            if self
                .commit_batch(name, &irs, Checkpoint::scan(cursor_id))
                .await
            {
                info!(task = %name, items = irs.len(), "scan batch committed");
            }
        }
        Ok(())
    }

    async fn run_tail(&self, name: &str, from: i64) -> Result<()> {
        info!(task = %name, from, "tailing oplog");
        let rx = self.extractor.tail(from).await?;
        let config = BatchConfig::new(
            TAIL_BATCH_SIZE,
            Duration::from_millis(self.controls.flush_interval_ms),
        );
        let mut batches = batch::batches(rx, config);

        while let Some(batch) = batches.recv().await {
            let events = collect_batch(batch)?;
            let merged = merge::merge(events);

            let mut irs = Vec::with_capacity(merged.len());
            for event in &merged {
                if let Some(ir) = self.transformer.change(event).await {
                    irs.push(ir);
                }
            }

            if self
                .commit_batch(name, &irs, Checkpoint::tail_with_lag())
                .await
            {
                debug!(task = %name, events = merged.len(), items = irs.len(), "tail batch committed");
            }
        }
        Ok(())
    }

    /// Load a batch and advance the checkpoint only if the load
    /// succeeded. A failed batch is dropped with a warning and leaves
    /// the checkpoint untouched, so a restart replays it.
    async fn commit_batch(&self, name: &str, irs: &[Ir], checkpoint: Checkpoint) -> bool {
        match self.loader.load(&self.task, irs).await {
            Ok(()) => {
                self.checkpoints.save(name, &checkpoint).await;
                true
            }
            Err(e) => {
                warn!(
                    task = %name,
                    error = %e,
                    category = ?e.category(),
                    dropped = irs.len(),
                    "batch load failed, dropping batch"
                );
                false
            }
        }
    }
}

/// Unwrap a batch of in-band results, failing on the first error.
fn collect_batch<T>(batch: Vec<Result<T>>) -> Result<Vec<T>> {
    batch.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::config::{ExtractTask, LoadTask, TransformTask};
    use async_trait::async_trait;
    use mongodb::bson::Document;
    use serde_json::{json, Map};
    use std::collections::BTreeMap;

    const ID: &str = "aaaaaaaaaaaaaaaaaaaaaaaa";

    fn test_task() -> Arc<Task> {
        Arc::new(Task {
            from: Default::default(),
            extract: ExtractTask {
                db: "db0".into(),
                collection: "users".into(),
                query: Document::new(),
                projection: None,
            },
            transform: TransformTask {
                mapping: BTreeMap::from([("name".to_string(), "name".to_string())]),
                parent: None,
                static_fields: Map::new(),
            },
            load: LoadTask {
                index: "users".into(),
                doc_type: "user".into(),
                mapping: None,
            },
        })
    }

    struct FailingLoader;

    #[async_trait]
    impl BulkLoader for FailingLoader {
        async fn load(&self, _task: &Task, _irs: &[Ir]) -> Result<()> {
            Err(SyncError::other("sink down"))
        }
    }

    struct NoopLoader;

    #[async_trait]
    impl BulkLoader for NoopLoader {
        async fn load(&self, _task: &Task, _irs: &[Ir]) -> Result<()> {
            Ok(())
        }
    }

    /// Build a processor around an in-memory checkpoint store and an
    /// injected loader. Both clients are lazy, so nothing here talks
    /// to a live server.
    async fn processor_with(
        loader: Arc<dyn BulkLoader>,
        backend: Arc<MemoryCheckpointStore>,
    ) -> Processor {
        let mongo = MongoSource::connect("mongodb://localhost:27017")
            .await
            .unwrap();
        let es = EsSink::connect("http://localhost:9200", "").unwrap();
        let mut processor = Processor::new(
            test_task(),
            Controls::default(),
            mongo,
            es,
            CheckpointManager::new(backend),
        );
        processor.loader = loader;
        processor
    }

    fn upsert() -> Ir {
        Ir::Upsert {
            id: ID.to_string(),
            parent: None,
            data: json!({"name": "n"}),
            ts: None,
        }
    }

    #[tokio::test]
    async fn test_failed_load_drops_batch_and_skips_checkpoint() {
        let backend = Arc::new(MemoryCheckpointStore::new());
        let processor = processor_with(Arc::new(FailingLoader), backend.clone()).await;

        let committed = processor
            .commit_batch("db0.users___users.user", &[upsert()], Checkpoint::scan(ID))
            .await;

        assert!(!committed);
        // The batch is gone, but the cursor did not advance past it
        assert_eq!(backend.load("db0.users___users.user").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_successful_load_advances_checkpoint() {
        let backend = Arc::new(MemoryCheckpointStore::new());
        let processor = processor_with(Arc::new(NoopLoader), backend.clone()).await;

        let committed = processor
            .commit_batch("db0.users___users.user", &[upsert()], Checkpoint::scan(ID))
            .await;

        assert!(committed);
        assert_eq!(
            backend.load("db0.users___users.user").await.unwrap(),
            Some(Checkpoint::scan(ID))
        );
    }

    #[tokio::test]
    async fn test_checkpoint_survives_later_failed_batch() {
        let backend = Arc::new(MemoryCheckpointStore::new());
        let ok = processor_with(Arc::new(NoopLoader), backend.clone()).await;
        ok.commit_batch("k", &[upsert()], Checkpoint::scan(ID)).await;

        let failing = processor_with(Arc::new(FailingLoader), backend.clone()).await;
        let committed = failing
            .commit_batch("k", &[upsert()], Checkpoint::tail(1_700_000_000))
            .await;

        assert!(!committed);
        // Still the last committed position, not the failed one
        assert_eq!(
            backend.load("k").await.unwrap(),
            Some(Checkpoint::scan(ID))
        );
    }

    #[test]
    fn test_collect_batch_ok() {
        let batch: Vec<Result<u32>> = vec![Ok(1), Ok(2), Ok(3)];
        assert_eq!(collect_batch(batch).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_collect_batch_fails_on_first_error() {
        let batch: Vec<Result<u32>> = vec![Ok(1), Err(SyncError::oplog("broken")), Ok(3)];
        assert!(collect_batch(batch).is_err());
    }
}
