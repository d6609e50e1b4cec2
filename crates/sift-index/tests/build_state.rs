use serde_json::{json, Value};
use sift_core::{CacheConfig, IndexCacheDir};
use sift_index::build_state::{
    BuildStateStore, Durability, InitBuildState, StateEvent, StatePatch,
};
use std::path::PathBuf;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn new_build_root() -> (tempfile::TempDir, BuildStateStore, PathBuf) {
    init_tracing();
    let tmp = tempfile::tempdir().unwrap();
    let repo = tmp.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    let cache = IndexCacheDir::new(
        &repo,
        &CacheConfig {
            cache_root_override: Some(tmp.path().join("cache")),
        },
    )
    .unwrap();
    let build_root = cache.builds_dir().join("b1");
    let store = BuildStateStore::new();
    store
        .init(
            &build_root,
            &InitBuildState {
                build_id: "b1".to_string(),
                repo_root: Some(repo),
                modes: vec!["code".to_string()],
                stage: Some("index".to_string()),
                config_hash: Some("cfg-1".to_string()),
                tool_version: Some("1.4.0".to_string()),
                signature_version: Some(3),
                repo_provenance: Some(json!({"branch": "main", "commit": "abc", "dirty": false})),
            },
        )
        .unwrap();
    (tmp, store, build_root)
}

fn read_state(build_root: &PathBuf) -> Value {
    serde_json::from_slice(&std::fs::read(build_root.join("build_state.json")).unwrap()).unwrap()
}

#[test]
fn init_writes_the_initial_document() {
    let (_tmp, _store, build_root) = new_build_root();
    let state = read_state(&build_root);
    assert_eq!(state["schemaVersion"], 1);
    assert_eq!(state["buildId"], "b1");
    assert_eq!(state["configHash"], "cfg-1");
    assert_eq!(state["tool"]["version"], "1.4.0");
    assert_eq!(state["repo"]["branch"], "main");
}

#[test]
fn patches_merge_deeply_for_phases_and_progress() {
    let (_tmp, store, build_root) = new_build_root();
    store
        .apply_patch(
            &build_root,
            StatePatch::new()
                .set("phases", json!({"discover": {"status": "done"}}))
                .progress("code", 10, Some(100)),
            &[],
            Durability::Required,
        )
        .unwrap()
        .unwrap();
    let merged = store
        .apply_patch(
            &build_root,
            StatePatch::new()
                .set("phases", json!({"index": {"status": "running"}}))
                .progress("code", 55, None),
            &[],
            Durability::Required,
        )
        .unwrap()
        .unwrap();

    assert_eq!(
        merged.phases["discover"].status.as_deref(),
        Some("done"),
        "earlier phases must survive later patches"
    );
    assert_eq!(merged.phases["index"].status.as_deref(), Some("running"));

    // Progress lives in its sidecar, merged one level deep per mode.
    let progress: Value = serde_json::from_slice(
        &std::fs::read(build_root.join("build_state.progress.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(progress["code"]["processedFiles"], 55);
    assert_eq!(progress["code"]["totalFiles"], 100);
}

#[test]
fn identical_patches_skip_the_disk_write() {
    let (_tmp, store, build_root) = new_build_root();
    store
        .apply_patch(
            &build_root,
            StatePatch::new().stage("tokenize"),
            &[],
            Durability::Required,
        )
        .unwrap();
    let first = read_state(&build_root);

    store
        .apply_patch(
            &build_root,
            StatePatch::new().stage("tokenize"),
            &[],
            Durability::Required,
        )
        .unwrap();
    let second = read_state(&build_root);

    // A content-identical merge must not rewrite the file, so even the
    // volatile updatedAt stamp is unchanged.
    assert_eq!(first["updatedAt"], second["updatedAt"]);
}

#[test]
fn checkpoints_shard_per_mode_behind_an_index() {
    let (_tmp, store, build_root) = new_build_root();
    store
        .apply_patch(
            &build_root,
            StatePatch::new()
                .stage_checkpoint("code", "tokenize", json!({"generatedAt": "t1", "checkpoints": [1, 2]}))
                .stage_checkpoint("prose", "tokenize", json!({"generatedAt": "t1", "checkpoints": [3]})),
            &[],
            Durability::Required,
        )
        .unwrap();

    let index: Value = serde_json::from_slice(
        &std::fs::read(build_root.join("stage_checkpoints.v1.index.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(index["version"], 1);
    assert_eq!(
        index["modes"]["code"]["path"],
        "stage_checkpoints.v1.code.json"
    );
    assert!(build_root.join("stage_checkpoints.v1.code.json").is_file());
    assert!(build_root.join("stage_checkpoints.v1.prose.json").is_file());

    // The main document never duplicates the checkpoint payloads.
    let state = read_state(&build_root);
    assert!(state.get("stageCheckpoints").is_none());

    // A later flush for one mode leaves the other shard untouched.
    let prose_before =
        std::fs::read_to_string(build_root.join("stage_checkpoints.v1.prose.json")).unwrap();
    store
        .apply_patch(
            &build_root,
            StatePatch::new().stage_checkpoint(
                "code",
                "postings",
                json!({"generatedAt": "t2", "checkpoints": [4]}),
            ),
            &[],
            Durability::Required,
        )
        .unwrap();
    let prose_after =
        std::fs::read_to_string(build_root.join("stage_checkpoints.v1.prose.json")).unwrap();
    assert_eq!(prose_before, prose_after);
    let code: Value = serde_json::from_slice(
        &std::fs::read(build_root.join("stage_checkpoints.v1.code.json")).unwrap(),
    )
    .unwrap();
    assert!(code.get("tokenize").is_some());
    assert!(code.get("postings").is_some());
}

#[test]
fn events_and_deltas_land_in_their_logs() {
    let (_tmp, store, build_root) = new_build_root();
    store
        .apply_patch(
            &build_root,
            StatePatch::new()
                .stage("index")
                .progress("code", 5, Some(10))
                .stage_checkpoint("code", "tokenize", json!({"generatedAt": "t1", "checkpoints": []})),
            &[StateEvent::phase("index", "running", Some("warmup"))],
            Durability::Required,
        )
        .unwrap();

    let events = std::fs::read_to_string(build_root.join("build_state.events.jsonl")).unwrap();
    let event_lines: Vec<Value> = events
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert!(event_lines.iter().any(|event| event["type"] == "phase"));
    assert!(event_lines.iter().any(|event| event["type"] == "checkpoint"));

    let deltas = std::fs::read_to_string(build_root.join("build_state.deltas.jsonl")).unwrap();
    let delta_lines: Vec<Value> = deltas
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(delta_lines[0]["op"], "snapshot");
    let paths: Vec<&str> = delta_lines[1..]
        .iter()
        .filter_map(|entry| entry["path"].as_str())
        .collect();
    assert!(paths.contains(&"/stage"));
    assert!(paths.contains(&"/progress/code"));
    assert!(paths.contains(&"/stageCheckpoints/code"));
}

#[test]
fn mark_phase_stamps_lifecycle_fields() {
    let (_tmp, store, build_root) = new_build_root();
    store
        .mark_phase(&build_root, "index", "running", None)
        .unwrap()
        .unwrap();
    let state = read_state(&build_root);
    assert_eq!(state["currentPhase"], "index");
    assert!(state["phases"]["index"]["startedAt"].is_string());
    assert!(state["phases"]["index"].get("finishedAt").is_none());

    store
        .mark_phase(&build_root, "index", "done", Some("42 files"))
        .unwrap()
        .unwrap();
    let state = read_state(&build_root);
    assert!(state["phases"]["index"]["finishedAt"].is_string());
    assert_eq!(state["phases"]["index"]["detail"], "42 files");
}

#[test]
fn missing_build_root_is_a_quiet_no_op() {
    let (_tmp, store, build_root) = new_build_root();
    let gone = build_root.parent().unwrap().join("pruned");
    let merged = store
        .apply_patch(
            &gone,
            StatePatch::new().stage("index"),
            &[],
            Durability::Required,
        )
        .unwrap();
    assert!(merged.is_none());
}

#[test]
fn best_effort_records_failures_and_required_raises() {
    let (_tmp, store, build_root) = new_build_root();
    // Turn the state path into a directory so the atomic rename fails.
    std::fs::remove_file(build_root.join("build_state.json")).unwrap();
    std::fs::create_dir(build_root.join("build_state.json")).unwrap();

    let merged = store
        .apply_patch(
            &build_root,
            StatePatch::new().stage("index"),
            &[],
            Durability::BestEffort,
        )
        .unwrap();
    assert!(merged.is_some(), "best-effort failures do not abort the call");
    let failure = store.write_failures(&build_root).expect("failure recorded");
    assert_eq!(failure.count, 1);
    assert!(failure.message.unwrap().contains("build_state.json"));

    let err = store
        .apply_patch(
            &build_root,
            // A different stage so the no-op suppression does not kick in.
            StatePatch::new().stage("postings"),
            &[],
            Durability::Required,
        )
        .unwrap_err();
    assert_eq!(err.code(), sift_core::ErrorCode::Internal);
}

#[test]
fn ordering_ledger_accumulates_across_patches() {
    let (_tmp, store, build_root) = new_build_root();
    store
        .apply_patch(
            &build_root,
            StatePatch::new().ordering_seeds(
                json!({"discoveryHash": "d1", "fileListHash": "f1", "fileCount": 10, "mode": "code"}),
                Some("tokenize:code"),
            ),
            &[],
            Durability::Required,
        )
        .unwrap();
    store
        .apply_patch(
            &build_root,
            StatePatch::new().ordering_artifact(
                "tokenize:code",
                "postings",
                json!({"hash": "h1", "rule": "path-asc", "count": 42, "mode": "code"}),
            ),
            &[],
            Durability::Required,
        )
        .unwrap();

    let state = read_state(&build_root);
    let ledger = &state["orderingLedger"];
    assert_eq!(ledger["schemaVersion"], 1);
    assert_eq!(ledger["seeds"]["discoveryHash"], "d1");
    let stage = &ledger["stages"]["tokenize:code"];
    assert_eq!(stage["seeds"]["fileListHash"], "f1");
    assert_eq!(stage["artifacts"]["postings"]["hash"], "h1");
    assert_eq!(stage["artifacts"]["postings"]["count"], 42);
}

#[test]
fn heartbeats_merge_into_the_state() {
    let (_tmp, store, build_root) = new_build_root();
    let merged = store
        .apply_patch(
            &build_root,
            StatePatch::new().heartbeat(Some("tokenize")),
            &[],
            Durability::Required,
        )
        .unwrap()
        .unwrap();
    assert_eq!(merged.extra["heartbeat"]["stage"], "tokenize");
    assert!(merged.extra["heartbeat"]["lastHeartbeatAt"].is_string());
}

#[test]
fn load_merges_sidecars_into_the_view() {
    let (_tmp, store, build_root) = new_build_root();
    store
        .apply_patch(
            &build_root,
            StatePatch::new().progress("code", 7, Some(9)),
            &[],
            Durability::Required,
        )
        .unwrap();
    let view = store.load(&build_root).unwrap().unwrap();
    assert_eq!(view.progress["code"].processed_files, Some(7));
    assert_eq!(view.progress["code"].total_files, Some(9));
    assert_eq!(view.build_id.as_deref(), Some("b1"));
}
