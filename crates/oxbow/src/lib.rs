//! # oxbow - MongoDB to Elasticsearch replication
//!
//! Continuous, resumable replication of MongoDB collections into
//! Elasticsearch indices: a one-time snapshot scan followed by
//! unbounded oplog tailing, with declarative field mappings and
//! per-task checkpoints.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐        ┌───────────────┐
//! │ MongoDB       │        │ local.oplog.rs│
//! │ collection    │        │ (tailable)    │
//! └───────┬───────┘        └───────┬───────┘
//!         │ scan (desc _id)        │ tail (ts >= cursor)
//!         ▼                        ▼
//! ┌──────────────────────────────────────────┐
//! │ Extractor ── RateLimiter ── Batcher      │
//! └───────┬──────────────────────────────────┘
//!         │ batches                │ + OplogMerger (tail only)
//!         ▼                        ▼
//! ┌──────────────────────────────────────────┐
//! │ Transformer { mapping, parent, lookups } │
//! └───────┬──────────────────────────────────┘
//!         │ upserts / deletes
//!         ▼
//! ┌──────────────────────────────────────────┐
//! │ Loader ── bulk ──> Elasticsearch         │
//! └───────┬──────────────────────────────────┘
//!         │ per committed batch
//!         ▼
//!   CheckpointManager { phase, cursor }
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> oxbow::Result<()> {
//! use std::sync::Arc;
//! use oxbow::{
//!     CheckpointManager, Config, EsSink, FileCheckpointStore, MongoSource, Processor,
//! };
//!
//! let config = Config::from_json(&std::fs::read_to_string("config.json")?)?;
//!
//! let mongo = MongoSource::connect(&config.mongodb.url).await?;
//! let es = EsSink::connect(
//!     &config.elasticsearch.url,
//!     config.controls.index_name_suffix.clone(),
//! )?;
//! let checkpoints = CheckpointManager::new(Arc::new(
//!     FileCheckpointStore::new("./checkpoints").await?,
//! ));
//!
//! for task in config.tasks {
//!     let processor = Processor::new(
//!         Arc::new(task),
//!         config.controls.clone(),
//!         mongo.clone(),
//!         es.clone(),
//!         checkpoints.clone(),
//!     );
//!     tokio::spawn(processor.run());
//! }
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod es;
pub mod event;
pub mod extract;
pub mod load;
pub mod merge;
pub mod mongo;
pub mod path;
pub mod processor;
pub mod throttle;
pub mod transform;

pub use batch::BatchConfig;
pub use checkpoint::{
    Checkpoint, CheckpointBackend, CheckpointManager, FileCheckpointStore, MemoryCheckpointStore,
    SharedCheckpointBackend,
};
pub use config::{Config, Controls, ExtractTask, LoadTask, Task, TransformTask};
pub use error::{ErrorCategory, Result, SyncError};
pub use es::EsSink;
pub use event::{ChangeEvent, ChangeOp, OplogTime, UpdateSpec};
pub use extract::Extractor;
pub use load::{BulkLoader, Loader};
pub use mongo::{BatchedLookup, MongoSource};
pub use processor::Processor;
pub use throttle::RateLimiter;
pub use transform::{Ir, SinkHit, SinkReader, SourceReader, Transformer};
