//! Extraction pumps
//!
//! Bridges the driver cursors onto bounded channels the batcher can
//! consume. Two pumps: the finite snapshot scan (throttled by the
//! read-capacity limiter) and the infinite oplog tail, which decodes
//! raw entries into [`ChangeEvent`]s as they arrive. Errors travel
//! in-band as items so the processor observes them in batch order.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use mongodb::bson::Document;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::Task;
use crate::error::{Result, SyncError};
use crate::event::ChangeEvent;
use crate::mongo::MongoSource;
use crate::throttle::RateLimiter;

const PUMP_BUFFER: usize = 1024;

pub struct Extractor {
    mongo: MongoSource,
    task: Arc<Task>,
    read_capacity: u32,
}

impl Extractor {
    pub fn new(mongo: MongoSource, task: Arc<Task>, read_capacity: u32) -> Self {
        Self {
            mongo,
            task,
            read_capacity,
        }
    }

    /// Start the snapshot scan from `max_id` downward. The channel
    /// closes when the scan completes; an in-band error ends it early.
    pub async fn scan(&self, max_id: &str) -> Result<mpsc::Receiver<Result<Document>>> {
        let cursor = self.mongo.scan(&self.task, max_id).await?;
        Ok(spawn_scan_pump(cursor, self.read_capacity))
    }

    /// Start tailing the oplog from `from` (unix seconds). The stream
    /// never completes normally; completion or breakage surfaces as an
    /// in-band error the processor recovers from.
    pub async fn tail(&self, from: i64) -> Result<mpsc::Receiver<Result<ChangeEvent>>> {
        let cursor = self.mongo.tail_oplog(&self.task, from).await?;
        Ok(spawn_tail_pump(cursor, self.task.name()))
    }
}

fn spawn_scan_pump<S, E>(mut stream: S, read_capacity: u32) -> mpsc::Receiver<Result<Document>>
where
    S: Stream<Item = std::result::Result<Document, E>> + Send + Unpin + 'static,
    E: Into<SyncError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(PUMP_BUFFER);
    let mut limiter = RateLimiter::new(read_capacity);

    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            match item {
                Ok(doc) => {
                    limiter.acquire().await;
                    if tx.send(Ok(doc)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            }
        }
        // Stream end closes the channel, which flushes the batcher
    });

    rx
}

fn spawn_tail_pump<S, E>(mut stream: S, task_name: String) -> mpsc::Receiver<Result<ChangeEvent>>
where
    S: Stream<Item = std::result::Result<Document, E>> + Send + Unpin + 'static,
    E: Into<SyncError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(PUMP_BUFFER);

    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            match item {
                Ok(entry) => match ChangeEvent::from_oplog(&entry) {
                    Ok(Some(event)) => {
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(task = %task_name, error = %e, "dropping malformed oplog entry");
                    }
                },
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            }
        }
        // A tailable cursor completing means it was invalidated
        let _ = tx
            .send(Err(SyncError::oplog("tail cursor completed unexpectedly")))
            .await;
    });

    rx
}
