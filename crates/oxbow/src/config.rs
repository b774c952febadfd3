//! Task and runtime configuration
//!
//! A deployment is described by a JSON config file: source and sink
//! endpoints, global throughput controls, and one task per replicated
//! collection. Tasks are declarative; nothing here is code.

use mongodb::bson::Document;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::checkpoint::Checkpoint;
use crate::error::{Result, SyncError};

/// Top-level configuration for a daemon instance.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mongodb: MongoConfig,
    pub elasticsearch: EsConfig,
    #[serde(default)]
    pub controls: Controls,
    pub tasks: Vec<Task>,
}

impl Config {
    /// Parse a config from JSON and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(SyncError::config("no tasks configured"));
        }
        for task in &self.tasks {
            if task.transform.mapping.is_empty() {
                return Err(SyncError::config(format!(
                    "task {} has an empty field mapping",
                    task.name()
                )));
            }
            if let Some(parent) = &task.transform.parent {
                if parent.is_empty() {
                    return Err(SyncError::config(format!(
                        "task {} has an empty parent path",
                        task.name()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Source MongoDB connection.
#[derive(Debug, Clone, Deserialize)]
pub struct MongoConfig {
    /// Connection string; must point at a replica set member so the
    /// oplog is readable.
    pub url: String,
}

/// Sink Elasticsearch connection and the indices to provision.
#[derive(Debug, Clone, Deserialize)]
pub struct EsConfig {
    pub url: String,
    /// Indices created at startup if absent.
    #[serde(default)]
    pub indices: Vec<IndexSpec>,
}

/// An index to create before tasks start.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexSpec {
    pub index: String,
    /// Settings/mappings body passed through to index creation.
    #[serde(default)]
    pub body: Value,
}

/// Global throughput knobs shared by all tasks.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Controls {
    /// Max documents read from the source per second. 0 disables
    /// throttling.
    pub mongodb_read_capacity: u32,
    /// Max items per bulk request during the scan phase.
    pub elasticsearch_bulk_size: usize,
    /// Milliseconds a partial batch may wait before flushing.
    pub flush_interval_ms: u64,
    /// Suffix appended to every index name, e.g. for blue/green
    /// reindexing.
    pub index_name_suffix: String,
}

impl Default for Controls {
    fn default() -> Self {
        Self {
            mongodb_read_capacity: 0,
            elasticsearch_bulk_size: 5000,
            flush_interval_ms: 1000,
            index_name_suffix: String::new(),
        }
    }
}

/// One replicated collection: where to read, how to reshape, where to
/// write.
#[derive(Debug, Clone, Deserialize)]
pub struct Task {
    /// Starting checkpoint for a task that has never saved one.
    #[serde(default)]
    pub from: Checkpoint,
    pub extract: ExtractTask,
    pub transform: TransformTask,
    pub load: LoadTask,
}

impl Task {
    /// Stable task identity, used as the checkpoint key.
    pub fn name(&self) -> String {
        format!(
            "{}.{}___{}.{}",
            self.extract.db, self.extract.collection, self.load.index, self.load.doc_type
        )
    }

    /// Namespace of the source collection as it appears in the oplog.
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.extract.db, self.extract.collection)
    }

    /// Fields fetched from the source: the explicit projection if one
    /// is configured, otherwise the mapped paths plus the parent path.
    pub fn projection(&self) -> Document {
        if let Some(projection) = &self.extract.projection {
            return projection.clone();
        }
        let mut doc = Document::new();
        for src in self.transform.mapping.keys() {
            doc.insert(src.clone(), 1);
        }
        if let Some(parent) = &self.transform.parent {
            doc.insert(parent.clone(), 1);
        }
        doc
    }
}

/// Source side of a task.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractTask {
    pub db: String,
    pub collection: String,
    /// Extra filter ANDed into the scan query.
    #[serde(default)]
    pub query: Document,
    /// Explicit projection override. Defaults to the mapped fields.
    #[serde(default)]
    pub projection: Option<Document>,
}

/// Field mapping from source documents to sink documents.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformTask {
    /// Dotted source path to dotted sink path. Unmapped fields never
    /// reach the sink.
    pub mapping: BTreeMap<String, String>,
    /// Source path holding the parent/routing id, if the index uses
    /// parent-child relations.
    #[serde(default)]
    pub parent: Option<String>,
    /// Constant fields merged into every sink document.
    #[serde(default)]
    pub static_fields: Map<String, Value>,
}

/// Sink side of a task.
#[derive(Debug, Clone, Deserialize)]
pub struct LoadTask {
    pub index: String,
    #[serde(rename = "type", default = "default_doc_type")]
    pub doc_type: String,
    /// Mapping body applied via put-mapping at startup.
    #[serde(default)]
    pub mapping: Option<Value>,
}

fn default_doc_type() -> String {
    "_doc".to_string()
}
