use serde_json::{json, Value};
use sift_core::{CacheConfig, ErrorCode, IndexCacheDir, Mode};
use sift_index::diffs::{compute_diff, list_diffs, prune_diffs, DiffOptions, DiffRequest};
use std::path::{Path, PathBuf};

fn new_cache() -> (tempfile::TempDir, IndexCacheDir) {
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
    (tmp, cache)
}

struct FileSpec {
    file: &'static str,
    hash: &'static str,
    size: u64,
}

struct ChunkSpec {
    file: &'static str,
    chunk_id: &'static str,
    name: &'static str,
    signature: &'static str,
    start_line: i64,
}

fn write_build(
    cache: &IndexCacheDir,
    build_id: &str,
    config_hash: &str,
    files: &[FileSpec],
    chunks: &[ChunkSpec],
) -> PathBuf {
    let root = cache.builds_dir().join(build_id);
    let index_dir = root.join("index-code");
    std::fs::create_dir_all(index_dir.join("pieces")).unwrap();

    let file_meta: Vec<Value> = files
        .iter()
        .enumerate()
        .map(|(id, spec)| {
            json!({
                "id": id,
                "file": spec.file,
                "hash": spec.hash,
                "size": spec.size,
                "ext": ".js",
            })
        })
        .collect();
    std::fs::write(
        index_dir.join("file_meta.json"),
        serde_json::to_vec(&file_meta).unwrap(),
    )
    .unwrap();

    let chunk_meta: Vec<Value> = chunks
        .iter()
        .map(|spec| {
            json!({
                "file": spec.file,
                "kind": "function",
                "name": spec.name,
                "start": spec.start_line * 100,
                "end": spec.start_line * 100 + 80,
                "startLine": spec.start_line,
                "endLine": spec.start_line + 8,
                "segment": {"segmentId": "seg-0"},
                "metaV2": {
                    "chunkId": spec.chunk_id,
                    "signature": spec.signature,
                    "modifiers": ["export"],
                    "params": ["input"],
                },
                "codeRelations": {
                    "imports": [{"to": "lib/util.js", "type": "module"}],
                    "calls": [],
                    "usageLinks": [],
                },
            })
        })
        .collect();
    std::fs::write(
        index_dir.join("chunk_meta.json"),
        serde_json::to_vec(&chunk_meta).unwrap(),
    )
    .unwrap();

    write_pieces_manifest(&index_dir);

    std::fs::write(
        root.join("build_state.json"),
        serde_json::to_vec(&json!({
            "schemaVersion": 1,
            "buildId": build_id,
            "configHash": config_hash,
            "tool": {"version": "1.4.0"},
            "validation": {"ok": true, "issues": []},
        }))
        .unwrap(),
    )
    .unwrap();
    root
}

fn write_pieces_manifest(index_dir: &Path) {
    let pieces: Vec<Value> = ["file_meta.json", "chunk_meta.json"]
        .iter()
        .map(|name| {
            let path = index_dir.join(name);
            json!({
                "name": name.trim_end_matches(".json"),
                "path": name,
                "size": std::fs::metadata(&path).unwrap().len(),
                "checksum": format!("sha256:{}", sift_core::sha256_hex_file(&path).unwrap()),
            })
        })
        .collect();
    std::fs::write(
        index_dir.join("pieces/manifest.json"),
        serde_json::to_vec(&json!({
            "artifactSurfaceVersion": 1,
            "compatibilityKey": "ck-1",
            "pieces": pieces,
        }))
        .unwrap(),
    )
    .unwrap();
}

fn request(from: &str, to: &str) -> DiffRequest {
    DiffRequest {
        from: from.to_string(),
        to: to.to_string(),
        modes: vec![Mode::Code],
    }
}

fn unpersisted() -> DiffOptions {
    DiffOptions {
        persist: false,
        ..Default::default()
    }
}

#[test]
fn signature_change_yields_exactly_one_chunk_modified() {
    let (_tmp, cache) = new_cache();
    write_build(
        &cache,
        "a",
        "cfg",
        &[FileSpec { file: "src/a.js", hash: "h1", size: 10 }],
        &[ChunkSpec {
            file: "src/a.js",
            chunk_id: "chunk-a",
            name: "handler",
            signature: "sig-a",
            start_line: 1,
        }],
    );
    write_build(
        &cache,
        "b",
        "cfg",
        &[FileSpec { file: "src/a.js", hash: "h2", size: 10 }],
        &[ChunkSpec {
            file: "src/a.js",
            chunk_id: "chunk-a",
            name: "handler",
            signature: "sig-b",
            start_line: 1,
        }],
    );

    let outcome = compute_diff(&cache, &request("build:a", "build:b"), &unpersisted()).unwrap();
    let kinds: Vec<&str> = outcome.events.iter().map(|e| e.kind_str()).collect();
    assert!(!kinds.contains(&"file.added"));
    assert!(!kinds.contains(&"file.removed"));
    assert_eq!(
        kinds.iter().filter(|k| **k == "chunk.modified").count(),
        1
    );
    let modified = outcome
        .events
        .iter()
        .find(|e| e.kind_str() == "chunk.modified")
        .unwrap();
    let value = serde_json::to_value(modified).unwrap();
    assert_eq!(value["chunkId"], "chunk-a");
    assert_eq!(value["file"], "src/a.js");
}

#[test]
fn identical_inputs_produce_identical_diffs() {
    let (_tmp, cache) = new_cache();
    write_build(
        &cache,
        "a",
        "cfg",
        &[FileSpec { file: "src/a.js", hash: "h1", size: 10 }],
        &[],
    );
    write_build(
        &cache,
        "b",
        "cfg",
        &[FileSpec { file: "src/b.js", hash: "h2", size: 12 }],
        &[],
    );

    let first = compute_diff(&cache, &request("build:a", "build:b"), &unpersisted()).unwrap();
    let second = compute_diff(&cache, &request("build:a", "build:b"), &unpersisted()).unwrap();
    assert_eq!(first.diff_id, second.diff_id);
    assert_eq!(first.events, second.events);
    assert!(first.diff_id.starts_with("diff_"));
    assert_eq!(first.diff_id.len(), "diff_".len() + 16);
}

#[test]
fn fast_path_skips_io_when_fingerprints_match() {
    let (_tmp, cache) = new_cache();
    let root_a = write_build(
        &cache,
        "a",
        "cfg",
        &[FileSpec { file: "src/a.js", hash: "h1", size: 10 }],
        &[],
    );
    let root_b = write_build(
        &cache,
        "b",
        "cfg",
        &[FileSpec { file: "src/a.js", hash: "h1", size: 10 }],
        &[],
    );
    // Unrelated on-disk difference outside the manifest surface.
    std::fs::write(root_a.join("index-code/scratch.txt"), b"left").unwrap();
    std::fs::write(root_b.join("index-code/scratch.txt"), b"right").unwrap();

    let outcome = compute_diff(&cache, &request("build:a", "build:b"), &unpersisted()).unwrap();
    assert!(outcome.summary.fast_path);
    assert!(outcome.events.is_empty());
    assert_eq!(outcome.summary.totals.all_events, 0);
    assert!(outcome.summary.modes_summary["code"].fast_path);
}

#[test]
fn renamed_files_pair_by_content_hash() {
    let (_tmp, cache) = new_cache();
    write_build(
        &cache,
        "a",
        "cfg",
        &[FileSpec { file: "src/old.js", hash: "same", size: 10 }],
        &[],
    );
    write_build(
        &cache,
        "b",
        "cfg",
        &[FileSpec { file: "src/new.js", hash: "same", size: 10 }],
        &[],
    );

    let outcome = compute_diff(&cache, &request("build:a", "build:b"), &unpersisted()).unwrap();
    let kinds: Vec<&str> = outcome.events.iter().map(|e| e.kind_str()).collect();
    assert_eq!(kinds, vec!["file.renamed"]);
    let value = serde_json::to_value(&outcome.events[0]).unwrap();
    assert_eq!(value["beforeFile"], "src/old.js");
    assert_eq!(value["afterFile"], "src/new.js");

    // Without rename detection the same pair reads as add+remove.
    let outcome = compute_diff(
        &cache,
        &request("build:a", "build:b"),
        &DiffOptions {
            detect_renames: false,
            persist: false,
            ..Default::default()
        },
    )
    .unwrap();
    let kinds: Vec<&str> = outcome.events.iter().map(|e| e.kind_str()).collect();
    assert_eq!(kinds, vec!["file.added", "file.removed"]);
}

#[test]
fn truncation_caps_events_but_not_totals() {
    let (_tmp, cache) = new_cache();
    write_build(&cache, "a", "cfg", &[], &[]);
    write_build(
        &cache,
        "b",
        "cfg",
        &[
            FileSpec { file: "src/f1.js", hash: "h1", size: 1 },
            FileSpec { file: "src/f2.js", hash: "h2", size: 2 },
            FileSpec { file: "src/f3.js", hash: "h3", size: 3 },
            FileSpec { file: "src/f4.js", hash: "h4", size: 4 },
            FileSpec { file: "src/f5.js", hash: "h5", size: 5 },
        ],
        &[],
    );

    let outcome = compute_diff(
        &cache,
        &request("build:a", "build:b"),
        &DiffOptions {
            max_events: 1,
            persist: false,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(outcome.events.len(), 1);
    assert!(outcome.summary.truncated);
    assert_eq!(outcome.summary.limits.reason.as_deref(), Some("max-events"));
    assert_eq!(outcome.summary.totals.all_events, 5);
    assert_eq!(outcome.summary.totals.emitted_events, 1);
    assert_eq!(outcome.summary.totals.by_kind["file.added"], 5);
}

#[test]
fn config_hash_mismatch_blocks_unless_allowed() {
    let (_tmp, cache) = new_cache();
    write_build(
        &cache,
        "a",
        "cfg-1",
        &[FileSpec { file: "src/a.js", hash: "h1", size: 10 }],
        &[],
    );
    write_build(
        &cache,
        "b",
        "cfg-2",
        &[FileSpec { file: "src/a.js", hash: "h1", size: 10 }],
        &[],
    );

    let err = compute_diff(&cache, &request("build:a", "build:b"), &unpersisted()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidRequest);
    assert!(err.message().contains("allow-mismatch"));

    let outcome = compute_diff(
        &cache,
        &request("build:a", "build:b"),
        &DiffOptions {
            allow_mismatch: true,
            persist: false,
            ..Default::default()
        },
    )
    .unwrap();
    let compat = outcome.summary.compat.unwrap();
    assert!(compat.config_hash_mismatch);
    assert!(!compat.by_mode["code"].config_hash_match);
}

#[test]
fn persisted_diffs_are_reused_by_identity() {
    let (_tmp, cache) = new_cache();
    write_build(
        &cache,
        "a",
        "cfg",
        &[FileSpec { file: "src/a.js", hash: "h1", size: 10 }],
        &[],
    );
    write_build(
        &cache,
        "b",
        "cfg",
        &[FileSpec { file: "src/a.js", hash: "h2", size: 11 }],
        &[],
    );

    let first = compute_diff(&cache, &request("build:a", "build:b"), &DiffOptions::default())
        .unwrap();
    assert!(first.persisted);
    assert!(!first.reused);

    let diff_dir = cache.diffs_dir().join(&first.diff_id);
    assert!(diff_dir.join("inputs.json").is_file());
    assert!(diff_dir.join("summary.json").is_file());
    assert!(diff_dir.join("events.jsonl").is_file());

    let second = compute_diff(&cache, &request("build:a", "build:b"), &DiffOptions::default())
        .unwrap();
    assert!(second.reused, "identical inputs reuse the stored diff");
    assert_eq!(second.diff_id, first.diff_id);
    assert_eq!(second.created_at, first.created_at);

    let listed = list_diffs(&cache, &[Mode::Code]).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, first.diff_id);
}

#[test]
fn path_endpoints_are_never_silently_persisted() {
    let (tmp, cache) = new_cache();
    write_build(
        &cache,
        "a",
        "cfg",
        &[FileSpec { file: "src/a.js", hash: "h1", size: 10 }],
        &[],
    );
    // A bare filesystem index outside the cache.
    let external = tmp.path().join("external");
    let index_dir = external.join("index-code");
    std::fs::create_dir_all(index_dir.join("pieces")).unwrap();
    std::fs::write(index_dir.join("file_meta.json"), b"[]").unwrap();
    std::fs::write(index_dir.join("chunk_meta.json"), b"[]").unwrap();
    write_pieces_manifest(&index_dir);
    std::fs::write(
        external.join("build_state.json"),
        serde_json::to_vec(&json!({
            "schemaVersion": 1,
            "buildId": "ext",
            "configHash": "cfg",
            "validation": {"ok": true, "issues": []},
        }))
        .unwrap(),
    )
    .unwrap();

    let reference = format!("path:{}", external.to_str().unwrap());
    let outcome = compute_diff(
        &cache,
        &request("build:a", &reference),
        &DiffOptions::default(),
    )
    .unwrap();
    assert!(!outcome.persisted);
    assert!(outcome.path_ref_not_persisted);
    assert!(list_diffs(&cache, &[]).unwrap().is_empty());
}

#[test]
fn prune_keeps_recent_diffs() {
    let (_tmp, cache) = new_cache();
    write_build(
        &cache,
        "a",
        "cfg",
        &[FileSpec { file: "src/a.js", hash: "h1", size: 10 }],
        &[],
    );
    write_build(
        &cache,
        "b",
        "cfg",
        &[FileSpec { file: "src/a.js", hash: "h2", size: 11 }],
        &[],
    );
    let outcome = compute_diff(&cache, &request("build:a", "build:b"), &DiffOptions::default())
        .unwrap();

    // Everything is young, so the age floor protects it even with a zero
    // keep count.
    let pruned = prune_diffs(&cache, 0, Some(30.0), 0, false).unwrap();
    assert!(pruned.removed.is_empty());

    // Without the floor, the keep count rules alone.
    let pruned = prune_diffs(&cache, 0, None, 0, false).unwrap();
    assert_eq!(pruned.removed, vec![outcome.diff_id.clone()]);
    assert!(!cache.diffs_dir().join(&outcome.diff_id).exists());
}
