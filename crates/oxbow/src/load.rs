//! Bulk loading
//!
//! Converts a batch of sink operations into one bulk request. No
//! retries and no splitting: a failed bulk call surfaces to the
//! processor, which drops the batch and withholds its checkpoint.

use async_trait::async_trait;
use elasticsearch::http::request::JsonBody;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::Task;
use crate::error::Result;
use crate::es::EsSink;
use crate::transform::Ir;

/// Seam between the processor and the sink, so batch commit behavior
/// can be exercised without a cluster.
#[async_trait]
pub trait BulkLoader: Send + Sync {
    async fn load(&self, task: &Task, irs: &[Ir]) -> Result<()>;
}

pub struct Loader {
    es: EsSink,
}

impl Loader {
    pub fn new(es: EsSink) -> Self {
        Self { es }
    }

    /// Load one batch. An empty batch is a no-op.
    pub async fn load(&self, task: &Task, irs: &[Ir]) -> Result<()> {
        if irs.is_empty() {
            return Ok(());
        }
        let index = self.es.index_for(task);
        let body = bulk_body(&index, &task.load.doc_type, irs);
        self.es.bulk(body).await?;
        debug!(task = %task.name(), items = irs.len(), "loaded batch");
        Ok(())
    }
}

#[async_trait]
impl BulkLoader for Loader {
    async fn load(&self, task: &Task, irs: &[Ir]) -> Result<()> {
        Loader::load(self, task, irs).await
    }
}

/// Build the action/data line pairs for a bulk request.
fn bulk_body(index: &str, doc_type: &str, irs: &[Ir]) -> Vec<JsonBody<Value>> {
    let mut body: Vec<JsonBody<Value>> = Vec::with_capacity(irs.len() * 2);
    for ir in irs {
        match ir {
            Ir::Upsert {
                id, parent, data, ..
            } => {
                body.push(json!({ "index": action_meta(index, doc_type, id, parent) }).into());
                body.push(data.clone().into());
            }
            Ir::Delete { id, parent, .. } => {
                body.push(json!({ "delete": action_meta(index, doc_type, id, parent) }).into());
            }
        }
    }
    body
}

fn action_meta(index: &str, doc_type: &str, id: &str, parent: &Option<String>) -> Value {
    let mut meta = json!({
        "_index": index,
        "_type": doc_type,
        "_id": id,
    });
    if let Some(parent) = parent {
        meta["_parent"] = Value::String(parent.clone());
    }
    meta
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(body: &[JsonBody<Value>]) -> usize {
        body.len()
    }

    #[test]
    fn test_upsert_emits_action_and_data() {
        let irs = vec![Ir::Upsert {
            id: "aaaaaaaaaaaaaaaaaaaaaaaa".into(),
            parent: None,
            data: json!({"name": "n"}),
            ts: None,
        }];
        let body = bulk_body("users", "user", &irs);
        assert_eq!(lines(&body), 2);
    }

    #[test]
    fn test_delete_emits_single_action() {
        let irs = vec![Ir::Delete {
            id: "aaaaaaaaaaaaaaaaaaaaaaaa".into(),
            parent: None,
            ts: None,
        }];
        let body = bulk_body("users", "user", &irs);
        assert_eq!(lines(&body), 1);
    }

    #[test]
    fn test_action_meta_with_parent() {
        let meta = action_meta("users", "user", "id0", &Some("acct-1".to_string()));
        assert_eq!(
            meta,
            json!({
                "_index": "users",
                "_type": "user",
                "_id": "id0",
                "_parent": "acct-1",
            })
        );
    }

    #[test]
    fn test_action_meta_without_parent() {
        let meta = action_meta("users", "user", "id0", &None);
        assert_eq!(
            meta,
            json!({ "_index": "users", "_type": "user", "_id": "id0" })
        );
    }
}
