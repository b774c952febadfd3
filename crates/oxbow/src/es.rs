//! Elasticsearch sink access
//!
//! Bulk writes, the two sink-side lookups the transformer uses to
//! recover pre-images, and the index provisioning calls the daemon
//! runs at startup. Lookup misses and transport hiccups on the lookup
//! path resolve to None; the transformer treats both as "document not
//! there".

use async_trait::async_trait;
use elasticsearch::http::request::JsonBody;
use elasticsearch::http::transport::Transport;
use elasticsearch::indices::{IndicesCreateParts, IndicesExistsParts, IndicesPutMappingParts};
use elasticsearch::{BulkParts, Elasticsearch, GetParts, SearchParts};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::{EsConfig, Task};
use crate::error::{Result, SyncError};
use crate::transform::{SinkHit, SinkReader};

/// Handle to the sink cluster. Cheap to clone.
#[derive(Clone)]
pub struct EsSink {
    client: Elasticsearch,
    index_suffix: String,
}

impl EsSink {
    /// Connect to a single node. `index_suffix` is appended to every
    /// index name a task addresses.
    pub fn connect(url: &str, index_suffix: impl Into<String>) -> Result<Self> {
        let transport = Transport::single_node(url)
            .map_err(|e| SyncError::config(format!("invalid elasticsearch url {:?}: {}", url, e)))?;
        Ok(Self {
            client: Elasticsearch::new(transport),
            index_suffix: index_suffix.into(),
        })
    }

    /// Effective index name for a task.
    pub fn index_for(&self, task: &Task) -> String {
        format!("{}{}", task.load.index, self.index_suffix)
    }

    /// Issue one bulk request. Transport and HTTP failures error out;
    /// item-level rejections are logged and not retried.
    pub async fn bulk(&self, body: Vec<JsonBody<Value>>) -> Result<()> {
        let response = self.client.bulk(BulkParts::None).body(body).send().await?;

        let status = response.status_code();
        if !status.is_success() {
            return Err(SyncError::other(format!(
                "bulk request failed with status {}",
                status
            )));
        }

        let body = response.json::<Value>().await?;
        if body.get("errors").and_then(Value::as_bool).unwrap_or(false) {
            let failed = body
                .get("items")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter(|item| {
                            item.as_object()
                                .and_then(|o| o.values().next())
                                .and_then(|action| action.get("error"))
                                .is_some()
                        })
                        .count()
                })
                .unwrap_or(0);
            warn!(failed, "bulk request had rejected items");
        }
        Ok(())
    }

    /// Point lookup returning the stored document source.
    pub async fn get_source(&self, task: &Task, id: &str) -> Option<Value> {
        let index = self.index_for(task);
        let response = match self
            .client
            .get(GetParts::IndexId(index.as_str(), id))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(index, id, error = %e, "sink get failed");
                return None;
            }
        };

        if !response.status_code().is_success() {
            return None;
        }
        let body = response.json::<Value>().await.ok()?;
        if !body.get("found").and_then(Value::as_bool).unwrap_or(false) {
            return None;
        }
        body.get("_source").cloned()
    }

    /// Lookup by id via search, for parent-routed indices where a get
    /// would need the unknown routing value. Returns the source plus
    /// the parent recorded with the hit.
    pub async fn search_by_id(&self, task: &Task, id: &str) -> Option<SinkHit> {
        let index = self.index_for(task);
        let query = json!({
            "query": { "term": { "_id": id } },
            "size": 1,
        });

        let response = match self
            .client
            .search(SearchParts::Index(&[index.as_str()]))
            .body(query)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(index, id, error = %e, "sink search failed");
                return None;
            }
        };

        if !response.status_code().is_success() {
            return None;
        }
        let body = response.json::<Value>().await.ok()?;
        let hit = body
            .get("hits")
            .and_then(|h| h.get("hits"))
            .and_then(Value::as_array)
            .and_then(|hits| hits.first())?;

        Some(SinkHit {
            data: hit.get("_source").cloned()?,
            parent: hit_parent(hit),
        })
    }

    /// Create configured indices that do not exist yet and apply each
    /// task's mapping. Idempotent; run once before tasks start.
    pub async fn provision(&self, es_config: &EsConfig, tasks: &[Task]) -> Result<()> {
        for spec in &es_config.indices {
            let index = format!("{}{}", spec.index, self.index_suffix);
            if self.index_exists(&index).await? {
                debug!(index, "index already exists");
                continue;
            }
            let response = self
                .client
                .indices()
                .create(IndicesCreateParts::Index(&index))
                .body(spec.body.clone())
                .send()
                .await?;
            if !response.status_code().is_success() {
                let body = response.json::<Value>().await.unwrap_or(Value::Null);
                return Err(SyncError::other(format!(
                    "failed to create index {}: {}",
                    index, body
                )));
            }
            info!(index, "created index");
        }

        for task in tasks {
            let Some(mapping) = &task.load.mapping else {
                continue;
            };
            let index = self.index_for(task);
            let response = self
                .client
                .indices()
                .put_mapping(IndicesPutMappingParts::Index(&[index.as_str()]))
                .body(mapping.clone())
                .send()
                .await?;
            if !response.status_code().is_success() {
                let body = response.json::<Value>().await.unwrap_or(Value::Null);
                return Err(SyncError::other(format!(
                    "failed to put mapping on {}: {}",
                    index, body
                )));
            }
            info!(index, task = %task.name(), "applied mapping");
        }
        Ok(())
    }

    async fn index_exists(&self, index: &str) -> Result<bool> {
        let response = self
            .client
            .indices()
            .exists(IndicesExistsParts::Index(&[index]))
            .send()
            .await?;
        Ok(response.status_code().is_success())
    }
}

/// Read the parent/routing value off a search hit. Older clusters
/// report `_parent` directly; join-field clusters expose the routing
/// field instead.
fn hit_parent(hit: &Value) -> Option<String> {
    if let Some(parent) = hit.get("_parent").and_then(Value::as_str) {
        return Some(parent.to_string());
    }
    hit.get("_routing")
        .and_then(Value::as_str)
        .map(String::from)
}

#[async_trait]
impl SinkReader for EsSink {
    async fn get_by_id(&self, task: &Task, id: &str) -> Option<Value> {
        self.get_source(task, id).await
    }

    async fn search_by_id(&self, task: &Task, id: &str) -> Option<SinkHit> {
        EsSink::search_by_id(self, task, id).await
    }
}
