//! Merge rules for build-state patches.
//!
//! Patches merge at the JSON level so arbitrary top-level fields written by
//! other build stages survive: shallow merge for scalars, one deep level for
//! the maps keyed by phase/mode, and a structured merge for the ordering
//! ledger (seeds shallow; per-stage seeds/artifacts one level deeper).

use super::model::ORDERING_LEDGER_SCHEMA_VERSION;
use serde_json::{Map, Value};

/// Fields whose values merge per-key one level deep instead of being
/// replaced wholesale.
const DEEP_MERGE_FIELDS: [&str; 7] = [
    "phases",
    "progress",
    "heartbeat",
    "counts",
    "signatures",
    "stageCheckpoints",
    "ignore",
];

pub(crate) fn as_object(value: &Value) -> Option<&Map<String, Value>> {
    value.as_object()
}

/// Merge a main-state patch into the current state document.
pub(crate) fn merge_state(base: &Map<String, Value>, patch: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (key, value) in patch {
        if key == "orderingLedger" {
            let current = base.get("orderingLedger");
            merged.insert(key.clone(), merge_ordering_ledger(current, value));
            continue;
        }
        if DEEP_MERGE_FIELDS.contains(&key.as_str()) {
            merged.insert(key.clone(), merge_keyed_map(base.get(key), value));
            continue;
        }
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Per-key merge one level deep: object values merge shallowly with the
/// existing entry, anything else replaces it.
pub(crate) fn merge_keyed_map(base: Option<&Value>, patch: &Value) -> Value {
    let Some(patch_map) = patch.as_object() else {
        return patch.clone();
    };
    let mut next = base
        .and_then(as_object)
        .cloned()
        .unwrap_or_default();
    for (key, value) in patch_map {
        match (next.get(key).and_then(Value::as_object), value.as_object()) {
            (Some(existing), Some(incoming)) => {
                let mut merged = existing.clone();
                for (inner_key, inner_value) in incoming {
                    merged.insert(inner_key.clone(), inner_value.clone());
                }
                next.insert(key.clone(), Value::Object(merged));
            }
            _ => {
                next.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(next)
}

fn normalized_ledger(value: Option<&Value>) -> Map<String, Value> {
    let mut out = Map::new();
    let source = value.and_then(as_object);
    out.insert(
        "schemaVersion".to_string(),
        Value::from(ORDERING_LEDGER_SCHEMA_VERSION),
    );
    out.insert(
        "seeds".to_string(),
        source
            .and_then(|map| map.get("seeds"))
            .filter(|v| v.is_object())
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new())),
    );
    out.insert(
        "stages".to_string(),
        source
            .and_then(|map| map.get("stages"))
            .filter(|v| v.is_object())
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new())),
    );
    out
}

/// Structured ordering-ledger merge: top-level seeds merge shallowly; each
/// patched stage merges shallowly except its `seeds`/`artifacts` maps, which
/// merge one level deeper.
pub(crate) fn merge_ordering_ledger(base: Option<&Value>, patch: &Value) -> Value {
    let base_map = normalized_ledger(base);
    let patch_map = normalized_ledger(Some(patch));

    let mut next = base_map.clone();

    // Seeds: shallow per-key merge.
    let mut seeds = base_map
        .get("seeds")
        .and_then(as_object)
        .cloned()
        .unwrap_or_default();
    if let Some(patch_seeds) = patch_map.get("seeds").and_then(as_object) {
        for (key, value) in patch_seeds {
            seeds.insert(key.clone(), value.clone());
        }
    }
    next.insert("seeds".to_string(), Value::Object(seeds));

    // Stages: shallow merge of each patched stage, with nested seeds and
    // artifacts merged per key.
    let mut stages = base_map
        .get("stages")
        .and_then(as_object)
        .cloned()
        .unwrap_or_default();
    if let Some(patch_stages) = patch_map.get("stages").and_then(as_object) {
        for (stage, value) in patch_stages {
            let Some(incoming) = value.as_object() else {
                stages.insert(stage.clone(), value.clone());
                continue;
            };
            let mut merged_stage = stages
                .get(stage)
                .and_then(as_object)
                .cloned()
                .unwrap_or_default();
            let base_stage = merged_stage.clone();
            for (key, inner) in incoming {
                merged_stage.insert(key.clone(), inner.clone());
            }
            for nested in ["seeds", "artifacts"] {
                if incoming.get(nested).is_some_and(Value::is_object) {
                    merged_stage.insert(
                        nested.to_string(),
                        merge_keyed_map(base_stage.get(nested), &incoming[nested]),
                    );
                }
            }
            stages.insert(stage.clone(), Value::Object(merged_stage));
        }
    }
    next.insert("stages".to_string(), Value::Object(stages));

    Value::Object(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn scalar_fields_merge_shallow() {
        let base = obj(json!({"stage": "index", "buildId": "b1"}));
        let patch = obj(json!({"stage": "promote"}));
        let merged = merge_state(&base, &patch);
        assert_eq!(merged["stage"], "promote");
        assert_eq!(merged["buildId"], "b1");
    }

    #[test]
    fn phases_merge_per_key() {
        let base = obj(json!({"phases": {"discover": {"status": "done"}}}));
        let patch = obj(json!({"phases": {"index": {"status": "running"}}}));
        let merged = merge_state(&base, &patch);
        assert_eq!(merged["phases"]["discover"]["status"], "done");
        assert_eq!(merged["phases"]["index"]["status"], "running");
    }

    #[test]
    fn per_key_objects_merge_one_level_deep() {
        let base = obj(json!({"progress": {"code": {"processedFiles": 1, "totalFiles": 10}}}));
        let patch = obj(json!({"progress": {"code": {"processedFiles": 5}}}));
        let merged = merge_state(&base, &patch);
        assert_eq!(merged["progress"]["code"]["processedFiles"], 5);
        assert_eq!(merged["progress"]["code"]["totalFiles"], 10);
    }

    #[test]
    fn ordering_ledger_merges_structurally() {
        let base = obj(json!({
            "orderingLedger": {
                "schemaVersion": 1,
                "seeds": {"discoveryHash": "d1"},
                "stages": {
                    "tokenize:code": {
                        "seeds": {"fileListHash": "f1"},
                        "artifacts": {"postings": {"hash": "h1"}}
                    }
                }
            }
        }));
        let patch = obj(json!({
            "orderingLedger": {
                "stages": {
                    "tokenize:code": {
                        "artifacts": {"chunks": {"hash": "h2"}}
                    }
                }
            }
        }));
        let merged = merge_state(&base, &patch);
        let ledger = &merged["orderingLedger"];
        assert_eq!(ledger["schemaVersion"], 1);
        assert_eq!(ledger["seeds"]["discoveryHash"], "d1");
        let stage = &ledger["stages"]["tokenize:code"];
        assert_eq!(stage["seeds"]["fileListHash"], "f1");
        assert_eq!(stage["artifacts"]["postings"]["hash"], "h1");
        assert_eq!(stage["artifacts"]["chunks"]["hash"], "h2");
    }

    #[test]
    fn non_object_values_replace() {
        let base = obj(json!({"counts": {"files": 3}}));
        let patch = obj(json!({"counts": {"files": 4}, "modes": ["code"]}));
        let merged = merge_state(&base, &patch);
        assert_eq!(merged["counts"]["files"], 4);
        assert_eq!(merged["modes"], json!(["code"]));
    }
}
