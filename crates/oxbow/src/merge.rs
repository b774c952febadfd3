//! # Oplog micro-batch compaction
//!
//! A busy collection produces many oplog entries for the same document
//! within one batch window. Merging them before transformation avoids
//! redundant sink lookups and bulk actions: each document id leaves the
//! batch with at most one surviving event.
//!
//! Folding rules, applied in timestamp order per id:
//!
//! - insert then update: the update is applied to the captured document
//!   and the result stays an insert.
//! - update then update: `$set` maps merge with the later event winning
//!   per key, `$unset` maps union, a later replacement supersedes.
//! - insert then delete: the document never existed as far as the sink
//!   is concerned; both events vanish.
//! - a delete with no prior insert in the batch survives as a delete.
//!
//! Compaction is a windowed optimization only; correctness never
//! depends on which events share a batch.

use std::collections::HashMap;

use serde_json::Value;

use crate::event::{ChangeEvent, ChangeOp, UpdateSpec};
use crate::path;

/// Merge a batch of change events, returning at most one event per
/// document id, ordered by timestamp ascending.
pub fn merge(events: Vec<ChangeEvent>) -> Vec<ChangeEvent> {
    let mut sorted = events;
    sorted.sort_by_key(|e| e.ts);

    let mut merged: HashMap<String, ChangeEvent> = HashMap::new();
    for event in sorted {
        match merged.remove(&event.id) {
            None => {
                merged.insert(event.id.clone(), event);
            }
            Some(prev) => {
                if let Some(folded) = fold(prev, event) {
                    merged.insert(folded.id.clone(), folded);
                }
            }
        }
    }

    let mut out: Vec<ChangeEvent> = merged.into_values().collect();
    out.sort_by_key(|e| e.ts);
    out
}

/// Fold `next` into `prev` for the same id. `next.ts >= prev.ts`.
/// Returns None when the pair cancels out.
fn fold(prev: ChangeEvent, next: ChangeEvent) -> Option<ChangeEvent> {
    let id = next.id;
    let ts = next.ts;

    let op = match (prev.op, next.op) {
        // A later insert stands on its own, whatever came before
        (_, ChangeOp::Insert(doc)) => ChangeOp::Insert(doc),

        (ChangeOp::Insert(doc), ChangeOp::Update(spec)) => {
            ChangeOp::Insert(apply_update(doc, &spec))
        }

        (ChangeOp::Update(prev_spec), ChangeOp::Update(next_spec)) => {
            ChangeOp::Update(merge_updates(prev_spec, next_spec))
        }

        // The batch both created and removed the document
        (ChangeOp::Insert(_), ChangeOp::Delete) => return None,

        (_, ChangeOp::Delete) => ChangeOp::Delete,

        // Update after delete cannot be folded locally; let the
        // transformer's lookup chain sort it out
        (ChangeOp::Delete, ChangeOp::Update(spec)) => ChangeOp::Update(spec),
    };

    Some(ChangeEvent { ts, id, op })
}

/// Apply an update spec to a captured document, addressing fields by
/// their dotted source paths.
fn apply_update(mut doc: Value, spec: &UpdateSpec) -> Value {
    if let Some(replacement) = &spec.replacement {
        return replacement.clone();
    }
    for (src, value) in &spec.set {
        path::set_path(&mut doc, src, value.clone());
    }
    for src in spec.unset.keys() {
        path::unset_path(&mut doc, src);
    }
    doc
}

fn merge_updates(prev: UpdateSpec, next: UpdateSpec) -> UpdateSpec {
    if next.is_replacement() {
        return next;
    }
    if let Some(replacement) = prev.replacement {
        // Patch the earlier replacement in place
        let doc = apply_update(replacement, &next);
        return UpdateSpec {
            replacement: Some(doc),
            ..Default::default()
        };
    }

    let mut set = prev.set;
    for (k, v) in next.set {
        set.insert(k, v);
    }
    let mut unset = prev.unset;
    for (k, v) in next.unset {
        unset.insert(k, v);
    }
    UpdateSpec {
        set,
        unset,
        replacement: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::OplogTime;
    use serde_json::{json, Map};

    const ID: &str = "aaaaaaaaaaaaaaaaaaaaaaaa";
    const OTHER_ID: &str = "bbbbbbbbbbbbbbbbbbbbbbbb";

    fn ts(inc: u32) -> OplogTime {
        OplogTime { secs: 0, inc }
    }

    fn insert(id: &str, t: u32, doc: Value) -> ChangeEvent {
        ChangeEvent {
            ts: ts(t),
            id: id.to_string(),
            op: ChangeOp::Insert(doc),
        }
    }

    fn update(id: &str, t: u32, set: Value, unset: Value) -> ChangeEvent {
        let to_map = |v: Value| -> Map<String, Value> {
            v.as_object().cloned().unwrap_or_default()
        };
        ChangeEvent {
            ts: ts(t),
            id: id.to_string(),
            op: ChangeOp::Update(UpdateSpec {
                set: to_map(set),
                unset: to_map(unset),
                replacement: None,
            }),
        }
    }

    fn delete(id: &str, t: u32) -> ChangeEvent {
        ChangeEvent {
            ts: ts(t),
            id: id.to_string(),
            op: ChangeOp::Delete,
        }
    }

    #[test]
    fn test_insert_then_update_folds_into_insert() {
        let merged = merge(vec![
            insert(ID, 0, json!({"_id": ID, "field0": 0})),
            update(ID, 1, json!({"field1": 1}), json!({"field0": 1})),
        ]);

        assert_eq!(
            merged,
            vec![insert(ID, 1, json!({"_id": ID, "field1": 1}))]
        );
    }

    #[test]
    fn test_update_then_update_later_key_wins() {
        // Input deliberately out of timestamp order
        let merged = merge(vec![
            update(ID, 1, json!({"field1": 1}), json!({})),
            update(ID, 0, json!({"field1": 2, "field0": 3}), json!({})),
        ]);

        assert_eq!(
            merged,
            vec![update(ID, 1, json!({"field1": 1, "field0": 3}), json!({}))]
        );
    }

    #[test]
    fn test_update_unsets_union() {
        let merged = merge(vec![
            update(ID, 0, json!({}), json!({"a": 1})),
            update(ID, 1, json!({}), json!({"b": 1})),
        ]);

        assert_eq!(
            merged,
            vec![update(ID, 1, json!({}), json!({"a": 1, "b": 1}))]
        );
    }

    #[test]
    fn test_later_replacement_supersedes() {
        let mut replacement = update(ID, 1, json!({}), json!({}));
        if let ChangeOp::Update(spec) = &mut replacement.op {
            spec.replacement = Some(json!({"_id": ID, "fresh": true}));
        }

        let merged = merge(vec![
            update(ID, 0, json!({"stale": 1}), json!({})),
            replacement.clone(),
        ]);

        assert_eq!(merged, vec![replacement]);
    }

    #[test]
    fn test_insert_then_delete_cancels() {
        let merged = merge(vec![
            insert(ID, 0, json!({"_id": ID})),
            delete(ID, 1),
        ]);
        assert!(merged.is_empty());
    }

    #[test]
    fn test_standalone_delete_survives() {
        let merged = merge(vec![delete(ID, 0)]);
        assert_eq!(merged, vec![delete(ID, 0)]);
    }

    #[test]
    fn test_update_then_delete_becomes_delete() {
        let merged = merge(vec![
            update(ID, 0, json!({"field0": 1}), json!({})),
            delete(ID, 1),
        ]);
        assert_eq!(merged, vec![delete(ID, 1)]);
    }

    #[test]
    fn test_delete_then_insert_resurrects() {
        let merged = merge(vec![
            delete(ID, 0),
            insert(ID, 1, json!({"_id": ID, "field0": 1})),
        ]);
        assert_eq!(merged, vec![insert(ID, 1, json!({"_id": ID, "field0": 1}))]);
    }

    #[test]
    fn test_distinct_ids_do_not_interfere() {
        let merged = merge(vec![
            insert(ID, 0, json!({"_id": ID})),
            delete(OTHER_ID, 1),
            update(ID, 2, json!({"x": 1}), json!({})),
        ]);

        assert_eq!(
            merged,
            vec![
                delete(OTHER_ID, 1),
                insert(ID, 2, json!({"_id": ID, "x": 1})),
            ]
        );
    }

    #[test]
    fn test_nested_paths_fold_against_document() {
        let merged = merge(vec![
            insert(ID, 0, json!({"_id": ID, "field0": {"field1": 1, "field2": 2}})),
            update(
                ID,
                1,
                json!({"field0.field1": "set nested field"}),
                json!({"field0.field2": 1}),
            ),
        ]);

        assert_eq!(
            merged,
            vec![insert(
                ID,
                1,
                json!({"_id": ID, "field0": {"field1": "set nested field"}})
            )]
        );
    }
}
