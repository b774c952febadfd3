//! # Document transformation
//!
//! Reshapes source documents and change events into sink operations
//! according to a task's declarative field mapping. Only mapped fields
//! ever reach the sink; everything else is dropped here.
//!
//! Partial updates are the interesting case: the oplog entry carries
//! only the changed fields, but the sink needs a full document. The
//! transformer resolves a pre-image through an ordered chain of
//! strategies, cheapest first:
//!
//! 1. the sink itself (search-by-id when the task routes by parent,
//!    get-by-id otherwise), patching the stored document in place;
//! 2. re-fetching the document from the source and mapping it fresh.
//!
//! If every strategy misses the document is gone on both ends and the
//! update is dropped.
//!
//! Sink and source lookups go through the [`SinkReader`] and
//! [`SourceReader`] traits so the chain can be exercised with
//! in-memory fakes.

use std::sync::Arc;

use async_trait::async_trait;
use mongodb::bson::Document;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::Task;
use crate::event::{document_to_json, id_to_string, ChangeEvent, ChangeOp, OplogTime, UpdateSpec};
use crate::path;

/// A sink operation ready for bulk loading.
#[derive(Debug, Clone, PartialEq)]
pub enum Ir {
    Upsert {
        id: String,
        parent: Option<String>,
        data: Value,
        ts: Option<OplogTime>,
    },
    Delete {
        id: String,
        parent: Option<String>,
        ts: Option<OplogTime>,
    },
}

impl Ir {
    pub fn id(&self) -> &str {
        match self {
            Self::Upsert { id, .. } | Self::Delete { id, .. } => id,
        }
    }
}

/// A document read back from the sink, with its routing parent if the
/// index stores one.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkHit {
    pub data: Value,
    pub parent: Option<String>,
}

/// Read access to already-loaded sink documents.
#[async_trait]
pub trait SinkReader: Send + Sync {
    /// Point lookup by document id.
    async fn get_by_id(&self, task: &Task, id: &str) -> Option<Value>;

    /// Lookup by id without knowing the routing, returning the parent
    /// alongside the document.
    async fn search_by_id(&self, task: &Task, id: &str) -> Option<SinkHit>;
}

/// Read access to current source documents.
#[async_trait]
pub trait SourceReader: Send + Sync {
    async fn fetch_by_id(&self, task: &Task, id: &str) -> Option<Value>;
}

/// Per-task transformer. Stateless apart from its lookup handles.
pub struct Transformer {
    task: Arc<Task>,
    sink: Arc<dyn SinkReader>,
    source: Arc<dyn SourceReader>,
}

impl Transformer {
    pub fn new(task: Arc<Task>, sink: Arc<dyn SinkReader>, source: Arc<dyn SourceReader>) -> Self {
        Self { task, sink, source }
    }

    /// Transform a scanned source document into an upsert.
    ///
    /// Documents without a usable id, or with none of the mapped
    /// fields, produce nothing.
    pub fn document(&self, doc: &Document) -> Option<Ir> {
        let id = match doc.get("_id").and_then(id_to_string) {
            Some(id) => id,
            None => {
                warn!(task = %self.task.name(), "scanned document without usable _id, skipping");
                return None;
            }
        };
        let doc = document_to_json(doc);
        let (data, parent) = self.map_document(&doc)?;
        Some(Ir::Upsert {
            id,
            parent,
            data,
            ts: None,
        })
    }

    /// Transform a merged change event into a sink operation, resolving
    /// pre-images as needed. None means the event is a no-op for this
    /// task.
    pub async fn change(&self, event: &ChangeEvent) -> Option<Ir> {
        let id = &event.id;
        let ts = Some(event.ts);

        match &event.op {
            ChangeOp::Insert(doc) => {
                let (data, parent) = self.map_document(doc)?;
                Some(Ir::Upsert {
                    id: id.clone(),
                    parent,
                    data,
                    ts,
                })
            }

            ChangeOp::Delete => {
                // Parent-routed indices need the routing value to
                // address the document; recover it from the sink.
                let parent = if self.task.transform.parent.is_some() {
                    match self.sink.search_by_id(&self.task, id).await {
                        Some(hit) => hit.parent,
                        None => {
                            debug!(
                                task = %self.task.name(),
                                id, "delete for document absent from sink, dropping"
                            );
                            return None;
                        }
                    }
                } else {
                    None
                };
                Some(Ir::Delete {
                    id: id.clone(),
                    parent,
                    ts,
                })
            }

            ChangeOp::Update(spec) => {
                if self.ignore_update(spec) {
                    debug!(
                        task = %self.task.name(),
                        id, "update touches no mapped field, ignoring"
                    );
                    return None;
                }

                if let Some(replacement) = &spec.replacement {
                    let (data, parent) = self.map_document(replacement)?;
                    return Some(Ir::Upsert {
                        id: id.clone(),
                        parent,
                        data,
                        ts,
                    });
                }

                // Strategy 1: patch the document already in the sink
                if let Some(hit) = self.sink_preimage(id).await {
                    let data = self.patch_sink_doc(hit.data, spec);
                    if data.as_object().is_some_and(|o| o.is_empty()) {
                        return None;
                    }
                    return Some(Ir::Upsert {
                        id: id.clone(),
                        parent: hit.parent,
                        data,
                        ts,
                    });
                }

                // Strategy 2: re-fetch from the source and map fresh
                if let Some(doc) = self.source.fetch_by_id(&self.task, id).await {
                    let (data, parent) = self.map_document(&doc)?;
                    return Some(Ir::Upsert {
                        id: id.clone(),
                        parent,
                        data,
                        ts,
                    });
                }

                debug!(
                    task = %self.task.name(),
                    id, "update for document absent from sink and source, dropping"
                );
                None
            }
        }
    }

    /// Whether an update touches no mapped source path and can be
    /// skipped without any lookup.
    pub fn ignore_update(&self, spec: &UpdateSpec) -> bool {
        !self.task.transform.mapping.keys().any(|src| {
            if let Some(replacement) = &spec.replacement {
                if path::has_path(replacement, src) {
                    return true;
                }
            }
            payload_has(&spec.set, src) || payload_has(&spec.unset, src)
        })
    }

    /// Sparse-copy the mapped fields of a source-shaped document.
    /// Returns the sink document and the parent value, or None when no
    /// mapped field is present.
    fn map_document(&self, doc: &Value) -> Option<(Value, Option<String>)> {
        let mut data = Value::Object(Map::new());
        for (src, dst) in &self.task.transform.mapping {
            if let Some(value) = path::get_path(doc, src) {
                path::set_path(&mut data, dst, value.clone());
            }
        }
        if data.as_object().is_some_and(|o| o.is_empty()) {
            return None;
        }
        for (key, value) in &self.task.transform.static_fields {
            path::set_path(&mut data, key, value.clone());
        }

        let parent = self
            .task
            .transform
            .parent
            .as_deref()
            .and_then(|p| path::get_path(doc, p))
            .and_then(value_to_id);

        Some((data, parent))
    }

    async fn sink_preimage(&self, id: &str) -> Option<SinkHit> {
        if self.task.transform.parent.is_some() {
            self.sink.search_by_id(&self.task, id).await
        } else {
            self.sink.get_by_id(&self.task, id).await.map(|data| SinkHit {
                data,
                parent: None,
            })
        }
    }

    /// Apply an update spec to a sink-shaped pre-image, translating
    /// each touched source path to its sink path.
    fn patch_sink_doc(&self, mut data: Value, spec: &UpdateSpec) -> Value {
        for (src, dst) in &self.task.transform.mapping {
            if let Some(value) = payload_get(&spec.set, src) {
                path::set_path(&mut data, dst, value.clone());
            }
            if payload_has(&spec.unset, src) {
                path::unset_path(&mut data, dst);
            }
        }
        data
    }
}

/// Whether an update payload touches `path`, either as a literal
/// dotted key or through nested objects.
fn payload_has(map: &Map<String, Value>, path: &str) -> bool {
    payload_get(map, path).is_some()
}

fn payload_get<'a>(map: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    if let Some(v) = map.get(path) {
        return Some(v);
    }
    let (first, rest) = path.split_once('.')?;
    path::get_path(map.get(first)?, rest)
}

fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
