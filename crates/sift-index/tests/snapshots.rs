use serde_json::json;
use sift_core::{CacheConfig, ErrorCode, IndexCacheDir, Mode};
use sift_index::snapshots::{
    create_pointer_snapshot, freeze_snapshot, gc_snapshots, list_snapshots, prune_snapshots,
    remove_snapshot, show_snapshot, CreateSnapshotOptions, FreezeMethod, FreezeOptions,
    GcOptions, IncludeSqlite,
};
use sift_storage::{IndexLock, LockOptions};
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

fn write_build(cache: &IndexCacheDir, build_id: &str, validation_ok: bool) -> PathBuf {
    let root = cache.builds_dir().join(build_id);
    let index_dir = root.join("index-code");
    std::fs::create_dir_all(index_dir.join("pieces")).unwrap();

    std::fs::write(index_dir.join("file_meta.json"), b"[]").unwrap();
    std::fs::write(index_dir.join("chunk_meta.json"), b"[]").unwrap();
    write_pieces_manifest(&index_dir, &["file_meta.json", "chunk_meta.json"]);

    std::fs::write(
        root.join("build_state.json"),
        serde_json::to_vec(&json!({
            "schemaVersion": 1,
            "buildId": build_id,
            "configHash": "cfg-1",
            "tool": {"version": "1.4.0"},
            "repo": {"branch": "main", "commit": "abc123", "dirty": false},
            "validation": {"ok": validation_ok, "issues": []},
        }))
        .unwrap(),
    )
    .unwrap();
    root
}

fn write_pieces_manifest(index_dir: &Path, files: &[&str]) {
    let pieces: Vec<serde_json::Value> = files
        .iter()
        .map(|name| {
            let path = index_dir.join(name);
            json!({
                "name": name.trim_end_matches(".json"),
                "type": "chunks",
                "format": "json",
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

fn set_current(cache: &IndexCacheDir, build_id: &str) {
    std::fs::write(
        cache.current_build_path(),
        serde_json::to_vec(&json!({
            "buildId": build_id,
            "buildRoots": {"code": format!("builds/{build_id}")},
        }))
        .unwrap(),
    )
    .unwrap();
}

fn code_only(tags: &[&str]) -> CreateSnapshotOptions {
    CreateSnapshotOptions {
        modes: vec![Mode::Code],
        tags: tags.iter().map(|t| t.to_string()).collect(),
        ..Default::default()
    }
}

#[test]
fn create_records_a_pointer_snapshot() {
    let (_tmp, cache) = new_cache();
    write_build(&cache, "b1", true);
    set_current(&cache, "b1");

    let created = create_pointer_snapshot(&cache, &code_only(&["release/1.0"])).unwrap();
    assert!(created.snapshot_id.starts_with("snap-"));
    assert_eq!(created.build_id_by_mode["code"], "b1");

    let details = show_snapshot(&cache, &created.snapshot_id).unwrap().unwrap();
    assert_eq!(details.entry.tags, vec!["release/1.0"]);
    let record = details.record.unwrap();
    assert_eq!(record.kind, "pointer");
    assert_eq!(record.pointer.build_roots_by_mode["code"], "builds/b1");
    let provenance = record.provenance.unwrap();
    assert_eq!(provenance.git.unwrap()["branch"], "main");

    let listed = list_snapshots(&cache).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].snapshot_id, created.snapshot_id);
}

#[test]
fn create_refuses_unvalidated_builds() {
    let (_tmp, cache) = new_cache();
    write_build(&cache, "b1", false);
    set_current(&cache, "b1");

    let err = create_pointer_snapshot(&cache, &code_only(&[])).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidRequest);
    assert!(err.message().contains("validation.ok"));

    // Missing validation entirely is just as hard a stop.
    let root = cache.builds_dir().join("b1");
    std::fs::write(
        root.join("build_state.json"),
        serde_json::to_vec(&json!({"schemaVersion": 1, "buildId": "b1"})).unwrap(),
    )
    .unwrap();
    let err = create_pointer_snapshot(&cache, &code_only(&[])).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidRequest);
}

#[test]
fn retention_keeps_the_newest_untagged_pointers() {
    let (_tmp, cache) = new_cache();
    write_build(&cache, "b1", true);
    set_current(&cache, "b1");

    let mut ids = Vec::new();
    for _ in 0..3 {
        let created = create_pointer_snapshot(
            &cache,
            &CreateSnapshotOptions {
                modes: vec![Mode::Code],
                max_pointer_snapshots: 2,
                ..Default::default()
            },
        )
        .unwrap();
        ids.push(created.snapshot_id);
        std::thread::sleep(std::time::Duration::from_millis(15));
    }

    let listed = list_snapshots(&cache).unwrap();
    assert_eq!(listed.len(), 2, "third creation prunes the oldest");
    let oldest = &ids[0];
    assert!(listed.iter().all(|entry| entry.snapshot_id != *oldest));
    assert!(
        !cache.snapshots_dir().join(oldest).exists(),
        "pruned snapshot directory must be deleted from disk"
    );
}

#[test]
fn tagged_snapshots_survive_retention() {
    let (_tmp, cache) = new_cache();
    write_build(&cache, "b1", true);
    set_current(&cache, "b1");

    let tagged = create_pointer_snapshot(&cache, &code_only(&["release"])).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(15));
    for _ in 0..2 {
        create_pointer_snapshot(
            &cache,
            &CreateSnapshotOptions {
                modes: vec![Mode::Code],
                max_pointer_snapshots: 1,
                ..Default::default()
            },
        )
        .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(15));
    }

    let listed = list_snapshots(&cache).unwrap();
    assert!(listed
        .iter()
        .any(|entry| entry.snapshot_id == tagged.snapshot_id));
}

#[test]
fn freeze_is_idempotent_and_verified() {
    let (_tmp, cache) = new_cache();
    write_build(&cache, "b1", true);
    set_current(&cache, "b1");
    let created = create_pointer_snapshot(&cache, &code_only(&[])).unwrap();

    let outcome = freeze_snapshot(&cache, &created.snapshot_id, &FreezeOptions::default()).unwrap();
    assert!(!outcome.already_frozen);
    assert_eq!(outcome.method, FreezeMethod::Hardlink);
    assert!(outcome.files_checked.unwrap() >= 2);

    let snapshot_dir = cache.snapshots_dir().join(&created.snapshot_id);
    assert!(snapshot_dir.join("frozen/index-code/file_meta.json").is_file());
    assert!(snapshot_dir
        .join("frozen/index-code/pieces/manifest.json")
        .is_file());
    assert!(snapshot_dir.join("frozen/build_state.json").is_file());
    assert!(snapshot_dir.join("frozen.json").is_file());

    let details = show_snapshot(&cache, &created.snapshot_id).unwrap().unwrap();
    assert!(details.entry.has_frozen);
    let frozen = details.frozen.unwrap();
    assert!(frozen.verification.ok);
    assert_eq!(frozen.included.modes, vec!["code"]);

    // Second freeze is a no-op reporting the original freeze.
    let again = freeze_snapshot(&cache, &created.snapshot_id, &FreezeOptions::default()).unwrap();
    assert!(again.already_frozen);
    assert_eq!(again.frozen_at, outcome.frozen_at);
}

#[test]
fn freeze_fails_hard_on_checksum_mismatch() {
    let (_tmp, cache) = new_cache();
    let root = write_build(&cache, "b1", true);
    set_current(&cache, "b1");
    let created = create_pointer_snapshot(&cache, &code_only(&[])).unwrap();

    // Corrupt an artifact after the manifest recorded its checksum.
    std::fs::write(root.join("index-code/file_meta.json"), b"[{}]  ").unwrap();

    let err = freeze_snapshot(&cache, &created.snapshot_id, &FreezeOptions::default())
        .unwrap_err();
    assert!(err.message().contains("Checksum mismatch"), "{err}");

    let snapshot_dir = cache.snapshots_dir().join(&created.snapshot_id);
    assert!(!snapshot_dir.join("frozen").exists());
    let details = show_snapshot(&cache, &created.snapshot_id).unwrap().unwrap();
    assert!(!details.entry.has_frozen, "failed freeze leaves hasFrozen unset");
    // Staging is discarded, not left for a resume.
    let staging: Vec<_> = std::fs::read_dir(&snapshot_dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with("frozen.staging-")
        })
        .collect();
    assert!(staging.is_empty());
}

#[test]
fn frozen_resolution_prefers_the_frozen_root() {
    let (_tmp, cache) = new_cache();
    write_build(&cache, "b1", true);
    set_current(&cache, "b1");
    let created = create_pointer_snapshot(&cache, &code_only(&[])).unwrap();
    freeze_snapshot(&cache, &created.snapshot_id, &FreezeOptions::default()).unwrap();

    let resolved = sift_index::refs::resolve_index_ref(
        &cache,
        &format!("snap:{}", created.snapshot_id),
        &[Mode::Code],
        &sift_index::refs::ResolveOptions::default(),
    )
    .unwrap();
    let root = &resolved.index_base_root_by_mode[&Mode::Code];
    assert!(root.ends_with(Path::new(&created.snapshot_id).join("frozen")));
}

#[test]
fn mutations_fail_fast_when_the_lock_is_held() {
    let (_tmp, cache) = new_cache();
    write_build(&cache, "b1", true);
    set_current(&cache, "b1");

    let _held = IndexLock::acquire(&cache.lock_path(), &LockOptions::default())
        .unwrap()
        .expect("test holds the lock");

    let err = create_pointer_snapshot(&cache, &code_only(&[])).unwrap_err();
    assert_eq!(err.code(), ErrorCode::QueueOverloaded);

    let err = prune_snapshots(&cache, 5, 0, false).unwrap_err();
    assert_eq!(err.code(), ErrorCode::QueueOverloaded);
}

#[test]
fn remove_requires_force_for_frozen_snapshots() {
    let (_tmp, cache) = new_cache();
    write_build(&cache, "b1", true);
    set_current(&cache, "b1");
    let created = create_pointer_snapshot(&cache, &code_only(&[])).unwrap();
    freeze_snapshot(&cache, &created.snapshot_id, &FreezeOptions::default()).unwrap();

    let err = remove_snapshot(&cache, &created.snapshot_id, false, 0).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidRequest);

    let outcome = remove_snapshot(&cache, &created.snapshot_id, true, 0).unwrap();
    assert_eq!(outcome.removed, created.snapshot_id);
    assert!(list_snapshots(&cache).unwrap().is_empty());
}

#[test]
fn gc_honors_keep_counts_and_tag_protection() {
    let (_tmp, cache) = new_cache();
    write_build(&cache, "b1", true);
    set_current(&cache, "b1");

    let protected = create_pointer_snapshot(&cache, &code_only(&["release/2.0"])).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(15));
    let mut plain = Vec::new();
    for _ in 0..3 {
        plain.push(
            create_pointer_snapshot(&cache, &code_only(&[]))
                .unwrap()
                .snapshot_id,
        );
        std::thread::sleep(std::time::Duration::from_millis(15));
    }

    let outcome = gc_snapshots(
        &cache,
        &GcOptions {
            keep_pointer: 1,
            keep_frozen: 1,
            dry_run: false,
            ..Default::default()
        },
    )
    .unwrap();

    assert!(outcome
        .protected_by_tag
        .contains(&protected.snapshot_id));
    // Newest plain snapshot survives the keep count; the older two go.
    assert_eq!(outcome.removed.len(), 2);
    assert!(outcome.removed.contains(&plain[0]));
    assert!(outcome.removed.contains(&plain[1]));
    let listed = list_snapshots(&cache).unwrap();
    assert!(listed
        .iter()
        .any(|entry| entry.snapshot_id == protected.snapshot_id));
    assert!(listed.iter().any(|entry| entry.snapshot_id == plain[2]));
}

#[test]
fn gc_sweeps_stale_staging_directories() {
    let (_tmp, cache) = new_cache();
    write_build(&cache, "b1", true);
    set_current(&cache, "b1");
    let created = create_pointer_snapshot(&cache, &code_only(&[])).unwrap();

    let staging = cache
        .snapshots_dir()
        .join(&created.snapshot_id)
        .join("frozen.staging-123-abc");
    std::fs::create_dir_all(staging.join("index-code")).unwrap();
    std::fs::write(staging.join("index-code/file_meta.json"), b"[]").unwrap();
    std::thread::sleep(std::time::Duration::from_millis(50));

    let outcome = gc_snapshots(
        &cache,
        &GcOptions {
            staging_max_age_hours: 0,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(outcome.stale_staging.len(), 1);
    assert!(!staging.exists());
}

#[test]
fn freeze_includes_sqlite_when_present() {
    let (_tmp, cache) = new_cache();
    let root = write_build(&cache, "b1", true);
    set_current(&cache, "b1");
    std::fs::create_dir_all(root.join("index-sqlite")).unwrap();
    std::fs::write(root.join("index-sqlite/index.sqlite3"), b"sqlite-bytes").unwrap();

    let created = create_pointer_snapshot(&cache, &code_only(&[])).unwrap();
    let outcome = freeze_snapshot(
        &cache,
        &created.snapshot_id,
        &FreezeOptions {
            include_sqlite: IncludeSqlite::Auto,
            ..Default::default()
        },
    )
    .unwrap();
    assert!(outcome.include_sqlite);
    assert!(cache
        .snapshots_dir()
        .join(&created.snapshot_id)
        .join("frozen/index-sqlite/index.sqlite3")
        .is_file());
}
