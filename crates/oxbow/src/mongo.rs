//! MongoDB source access
//!
//! Query construction for the two read paths (snapshot scan, oplog
//! tail) plus a batched point-lookup used by the transformer's source
//! re-fetch strategy. Lookups are coalesced because a busy tail window
//! can demand hundreds of single-document reads per second.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, oid::ObjectId, Bson, Document, Timestamp};
use mongodb::options::{CursorType, FindOptions};
use mongodb::{Client, Collection, Cursor};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::config::Task;
use crate::error::{Result, SyncError};
use crate::event::{document_to_json, id_to_string};
use crate::transform::SourceReader;

/// Max ids coalesced into one `$in` lookup.
const LOOKUP_BATCH_SIZE: usize = 1024;
/// How long a lookup batch collects ids before it is issued.
const LOOKUP_WINDOW: Duration = Duration::from_secs(1);

/// Handle to the source deployment. Cheap to clone; the driver pools
/// connections internally.
#[derive(Clone)]
pub struct MongoSource {
    client: Client,
}

impl MongoSource {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::with_uri_str(url).await?;
        Ok(Self { client })
    }

    pub fn collection(&self, task: &Task) -> Collection<Document> {
        self.client
            .database(&task.extract.db)
            .collection(&task.extract.collection)
    }

    /// Open the snapshot scan cursor: the task's query bounded by
    /// `_id <= max_id`, newest documents first.
    pub async fn scan(&self, task: &Task, max_id: &str) -> Result<Cursor<Document>> {
        let filter = scan_filter(task, max_id)?;
        let options = FindOptions::builder()
            .projection(task.projection())
            .sort(doc! { "$natural": -1 })
            .build();
        Ok(self.collection(task).find(filter, options).await?)
    }

    /// Open a tailable await-data cursor over the oplog from `from`
    /// (unix seconds) onward. The cursor blocks server-side waiting
    /// for new entries and never completes normally.
    pub async fn tail_oplog(&self, task: &Task, from: i64) -> Result<Cursor<Document>> {
        let filter = oplog_filter(task, from);
        let options = FindOptions::builder()
            .cursor_type(CursorType::TailableAwait)
            .no_cursor_timeout(true)
            .build();
        let oplog: Collection<Document> = self.client.database("local").collection("oplog.rs");
        Ok(oplog.find(filter, options).await?)
    }

    /// Spawn a batched lookup worker for a task's collection.
    pub fn lookup(&self, task: &Task) -> BatchedLookup {
        BatchedLookup::spawn(self.collection(task), task.projection())
    }
}

fn scan_filter(task: &Task, max_id: &str) -> Result<Document> {
    let oid = ObjectId::parse_str(max_id)
        .map_err(|_| SyncError::checkpoint(format!("invalid scan cursor id: {:?}", max_id)))?;
    let mut filter = task.extract.query.clone();
    filter.insert("_id", doc! { "$lte": oid });
    Ok(filter)
}

fn oplog_filter(task: &Task, from: i64) -> Document {
    let ts = Timestamp {
        time: from.max(0) as u32,
        increment: 0,
    };
    doc! {
        "ns": task.namespace(),
        "ts": { "$gte": ts },
        // Entries replayed by chunk migration are not real writes
        "fromMigrate": { "$ne": true },
    }
}

fn id_to_bson(id: &str) -> Bson {
    match ObjectId::parse_str(id) {
        Ok(oid) => Bson::ObjectId(oid),
        Err(_) => Bson::String(id.to_string()),
    }
}

type Waiter = oneshot::Sender<Option<Document>>;

/// Coalesces point lookups into periodic `$in` queries.
///
/// Requests queue for up to [`LOOKUP_WINDOW`] or [`LOOKUP_BATCH_SIZE`]
/// ids, whichever comes first, then one query answers all waiters. A
/// failed batch resolves every waiter to None rather than erroring;
/// the transformer treats a miss as "document gone".
#[derive(Clone)]
pub struct BatchedLookup {
    tx: mpsc::Sender<(String, Waiter)>,
}

impl BatchedLookup {
    pub fn spawn(collection: Collection<Document>, projection: Document) -> Self {
        let (tx, mut rx) = mpsc::channel::<(String, Waiter)>(LOOKUP_BATCH_SIZE * 4);

        tokio::spawn(async move {
            while let Some(first) = rx.recv().await {
                let mut pending = vec![first];
                let deadline = Instant::now() + LOOKUP_WINDOW;

                while pending.len() < LOOKUP_BATCH_SIZE {
                    match timeout_at(deadline, rx.recv()).await {
                        Ok(Some(request)) => pending.push(request),
                        // Window elapsed or channel closed
                        _ => break,
                    }
                }

                let ids: Vec<Bson> = pending.iter().map(|(id, _)| id_to_bson(id)).collect();
                let found = match fetch_batch(&collection, ids, projection.clone()).await {
                    Ok(found) => found,
                    Err(e) => {
                        warn!(error = %e, "batched lookup failed, resolving waiters to miss");
                        HashMap::new()
                    }
                };

                debug!(
                    requested = pending.len(),
                    found = found.len(),
                    "resolved lookup batch"
                );
                for (id, waiter) in pending {
                    let _ = waiter.send(found.get(&id).cloned());
                }
            }
        });

        Self { tx }
    }

    /// Look up one document, waiting for the batch it joins.
    pub async fn retrieve(&self, id: &str) -> Option<Document> {
        let (tx, rx) = oneshot::channel();
        self.tx.send((id.to_string(), tx)).await.ok()?;
        rx.await.ok().flatten()
    }
}

async fn fetch_batch(
    collection: &Collection<Document>,
    ids: Vec<Bson>,
    projection: Document,
) -> Result<HashMap<String, Document>> {
    let options = FindOptions::builder().projection(projection).build();
    let mut cursor = collection
        .find(doc! { "_id": { "$in": ids } }, options)
        .await?;

    let mut found = HashMap::new();
    while let Some(doc) = cursor.try_next().await? {
        if let Some(id) = doc.get("_id").and_then(id_to_string) {
            found.insert(id, doc);
        }
    }
    Ok(found)
}

#[async_trait]
impl SourceReader for BatchedLookup {
    async fn fetch_by_id(&self, _task: &Task, id: &str) -> Option<Value> {
        self.retrieve(id).await.map(|doc| document_to_json(&doc))
    }
}
