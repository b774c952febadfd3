//! Change event model
//!
//! Raw oplog entries are decoded into [`ChangeEvent`]s at the extractor
//! boundary. Everything downstream (merge, transform, load) works on
//! plain JSON documents and string document ids, so BSON-specific types
//! are converted exactly once, here.

use mongodb::bson::{Bson, Document, Timestamp};
use serde_json::{Map, Value};

use crate::error::{Result, SyncError};

/// Position in the oplog. Ordered by seconds, then by the ordinal
/// within that second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct OplogTime {
    pub secs: u32,
    pub inc: u32,
}

impl From<Timestamp> for OplogTime {
    fn from(ts: Timestamp) -> Self {
        Self {
            secs: ts.time,
            inc: ts.increment,
        }
    }
}

impl std::fmt::Display for OplogTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.secs, self.inc)
    }
}

/// The body of an update event: either a partial update (`$set` and
/// `$unset` keyed by dotted source paths) or a full replacement doc.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateSpec {
    pub set: Map<String, Value>,
    pub unset: Map<String, Value>,
    pub replacement: Option<Value>,
}

impl UpdateSpec {
    pub fn is_replacement(&self) -> bool {
        self.replacement.is_some()
    }
}

/// A single decoded change from the source oplog.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub ts: OplogTime,
    pub id: String,
    pub op: ChangeOp,
}

/// The operation carried by a change event.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeOp {
    /// Full document insert
    Insert(Value),
    /// Partial update or replacement
    Update(UpdateSpec),
    /// Document removal
    Delete,
}

impl ChangeOp {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Insert(_) => "insert",
            Self::Update(_) => "update",
            Self::Delete => "delete",
        }
    }
}

impl ChangeEvent {
    /// Decode a raw oplog entry.
    ///
    /// Returns `Ok(None)` for entry types that carry no document change
    /// (no-ops, commands). Entries whose document id cannot be read are
    /// malformed and produce an error so callers can drop them loudly.
    pub fn from_oplog(entry: &Document) -> Result<Option<ChangeEvent>> {
        let ts: OplogTime = entry
            .get_timestamp("ts")
            .map_err(|_| SyncError::malformed("oplog entry without ts"))?
            .into();

        let op = match entry.get_str("op") {
            Ok(op) => op,
            Err(_) => return Err(SyncError::malformed("oplog entry without op")),
        };

        match op {
            "i" => {
                let doc = entry
                    .get_document("o")
                    .map_err(|_| SyncError::malformed("insert without o"))?;
                let id = doc
                    .get("_id")
                    .and_then(id_to_string)
                    .ok_or_else(|| SyncError::malformed("insert without _id"))?;
                Ok(Some(ChangeEvent {
                    ts,
                    id,
                    op: ChangeOp::Insert(document_to_json(doc)),
                }))
            }
            "u" => {
                let id = entry
                    .get_document("o2")
                    .ok()
                    .and_then(|o2| o2.get("_id"))
                    .and_then(id_to_string)
                    .ok_or_else(|| SyncError::malformed("update without o2._id"))?;
                let o = entry
                    .get_document("o")
                    .map_err(|_| SyncError::malformed("update without o"))?;
                Ok(Some(ChangeEvent {
                    ts,
                    id,
                    op: ChangeOp::Update(decode_update(o)),
                }))
            }
            "d" => {
                let id = entry
                    .get_document("o")
                    .ok()
                    .and_then(|o| o.get("_id"))
                    .and_then(id_to_string)
                    .ok_or_else(|| SyncError::malformed("delete without _id"))?;
                Ok(Some(ChangeEvent {
                    ts,
                    id,
                    op: ChangeOp::Delete,
                }))
            }
            // "n" (no-op) and "c" (command) carry no document change
            _ => Ok(None),
        }
    }
}

fn decode_update(o: &Document) -> UpdateSpec {
    let has_operators = o.keys().any(|k| k.starts_with('$'));
    if !has_operators {
        return UpdateSpec {
            replacement: Some(document_to_json(o)),
            ..Default::default()
        };
    }
    let mut spec = UpdateSpec::default();
    if let Ok(set) = o.get_document("$set") {
        spec.set = document_to_json_map(set);
    }
    if let Ok(unset) = o.get_document("$unset") {
        spec.unset = document_to_json_map(unset);
    }
    spec
}

/// Render a document id as the string used for checkpoints and sink
/// document ids. ObjectIds become 24-char hex.
pub fn id_to_string(id: &Bson) -> Option<String> {
    match id {
        Bson::ObjectId(oid) => Some(oid.to_hex()),
        Bson::String(s) => Some(s.clone()),
        Bson::Int32(n) => Some(n.to_string()),
        Bson::Int64(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Convert a BSON document to plain JSON.
pub fn document_to_json(doc: &Document) -> Value {
    Value::Object(document_to_json_map(doc))
}

fn document_to_json_map(doc: &Document) -> Map<String, Value> {
    doc.iter()
        .map(|(k, v)| (k.clone(), bson_to_json(v)))
        .collect()
}

/// Convert a BSON value to the JSON shape the sink receives.
///
/// ObjectIds flatten to hex strings and datetimes to RFC 3339 strings
/// rather than extended-JSON wrappers, since mapped fields feed
/// directly into sink documents.
pub fn bson_to_json(value: &Bson) -> Value {
    match value {
        Bson::Null => Value::Null,
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Int32(n) => Value::from(*n),
        Bson::Int64(n) => Value::from(*n),
        Bson::Double(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Bson::String(s) => Value::String(s.clone()),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => dt
            .try_to_rfc3339_string()
            .map(Value::String)
            .unwrap_or(Value::Null),
        Bson::Timestamp(ts) => Value::from(ts.time as i64),
        Bson::Decimal128(d) => Value::String(d.to_string()),
        Bson::Array(items) => Value::Array(items.iter().map(bson_to_json).collect()),
        Bson::Document(doc) => document_to_json(doc),
        other => other.clone().into_relaxed_extjson(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::{doc, oid::ObjectId};
    use serde_json::json;

    fn oid(hex: &str) -> ObjectId {
        ObjectId::parse_str(hex).unwrap()
    }

    #[test]
    fn test_oplog_time_ordering() {
        let a = OplogTime { secs: 10, inc: 5 };
        let b = OplogTime { secs: 10, inc: 6 };
        let c = OplogTime { secs: 11, inc: 0 };
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_decode_insert() {
        let entry = doc! {
            "ts": Timestamp { time: 100, increment: 1 },
            "op": "i",
            "ns": "db0.collection0",
            "o": { "_id": oid("aaaaaaaaaaaaaaaaaaaaaaaa"), "field0": 0 },
        };
        let event = ChangeEvent::from_oplog(&entry).unwrap().unwrap();
        assert_eq!(event.id, "aaaaaaaaaaaaaaaaaaaaaaaa");
        assert_eq!(event.ts, OplogTime { secs: 100, inc: 1 });
        match event.op {
            ChangeOp::Insert(doc) => {
                assert_eq!(doc, json!({"_id": "aaaaaaaaaaaaaaaaaaaaaaaa", "field0": 0}));
            }
            other => panic!("expected insert, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_partial_update() {
        let entry = doc! {
            "ts": Timestamp { time: 100, increment: 2 },
            "op": "u",
            "ns": "db0.collection0",
            "o2": { "_id": oid("aaaaaaaaaaaaaaaaaaaaaaaa") },
            "o": {
                "$set": { "field0.field1": "set nested field" },
                "$unset": { "field0.field2": 1 },
            },
        };
        let event = ChangeEvent::from_oplog(&entry).unwrap().unwrap();
        match event.op {
            ChangeOp::Update(spec) => {
                assert!(!spec.is_replacement());
                assert_eq!(spec.set.get("field0.field1"), Some(&json!("set nested field")));
                assert_eq!(spec.unset.get("field0.field2"), Some(&json!(1)));
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_replacement_update() {
        let entry = doc! {
            "ts": Timestamp { time: 100, increment: 3 },
            "op": "u",
            "ns": "db0.collection0",
            "o2": { "_id": oid("aaaaaaaaaaaaaaaaaaaaaaaa") },
            "o": { "_id": oid("aaaaaaaaaaaaaaaaaaaaaaaa"), "field0": 7 },
        };
        let event = ChangeEvent::from_oplog(&entry).unwrap().unwrap();
        match event.op {
            ChangeOp::Update(spec) => {
                assert!(spec.is_replacement());
                assert_eq!(
                    spec.replacement,
                    Some(json!({"_id": "aaaaaaaaaaaaaaaaaaaaaaaa", "field0": 7}))
                );
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_delete() {
        let entry = doc! {
            "ts": Timestamp { time: 100, increment: 4 },
            "op": "d",
            "ns": "db0.collection0",
            "o": { "_id": oid("aaaaaaaaaaaaaaaaaaaaaaaa") },
        };
        let event = ChangeEvent::from_oplog(&entry).unwrap().unwrap();
        assert_eq!(event.op, ChangeOp::Delete);
    }

    #[test]
    fn test_decode_noop_skipped() {
        let entry = doc! {
            "ts": Timestamp { time: 100, increment: 5 },
            "op": "n",
            "ns": "",
            "o": { "msg": "periodic noop" },
        };
        assert_eq!(ChangeEvent::from_oplog(&entry).unwrap(), None);
    }

    #[test]
    fn test_decode_missing_id_is_malformed() {
        let entry = doc! {
            "ts": Timestamp { time: 100, increment: 6 },
            "op": "i",
            "ns": "db0.collection0",
            "o": { "field0": 0 },
        };
        assert!(ChangeEvent::from_oplog(&entry).is_err());
    }

    #[test]
    fn test_bson_to_json_object_id() {
        let value = bson_to_json(&Bson::ObjectId(oid("aaaaaaaaaaaaaaaaaaaaaaaa")));
        assert_eq!(value, json!("aaaaaaaaaaaaaaaaaaaaaaaa"));
    }

    #[test]
    fn test_id_to_string_variants() {
        assert_eq!(
            id_to_string(&Bson::ObjectId(oid("aaaaaaaaaaaaaaaaaaaaaaaa"))),
            Some("aaaaaaaaaaaaaaaaaaaaaaaa".to_string())
        );
        assert_eq!(
            id_to_string(&Bson::String("user-1".into())),
            Some("user-1".to_string())
        );
        assert_eq!(id_to_string(&Bson::Int64(42)), Some("42".to_string()));
        assert_eq!(id_to_string(&Bson::Null), None);
    }
}
