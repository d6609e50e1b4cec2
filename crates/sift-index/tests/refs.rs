use serde_json::json;
use sift_core::{CacheConfig, ErrorCode, IndexCacheDir, Mode};
use sift_index::refs::{resolve_index_ref, IndexRef, ResolveOptions};
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

fn write_build(cache: &IndexCacheDir, build_id: &str, config_hash: &str) -> PathBuf {
    let root = cache.builds_dir().join(build_id);
    std::fs::create_dir_all(root.join("index-code")).unwrap();
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

fn set_current(cache: &IndexCacheDir, build_id: &str) {
    std::fs::write(
        cache.current_build_path(),
        serde_json::to_vec(&json!({
            "buildId": build_id,
            "buildRoots": {
                "code": format!("builds/{build_id}"),
            },
        }))
        .unwrap(),
    )
    .unwrap();
}

fn default_options() -> ResolveOptions {
    ResolveOptions {
        prefer_frozen: true,
        allow_missing_modes: false,
    }
}

#[test]
fn latest_resolves_through_the_pointer() {
    let (_tmp, cache) = new_cache();
    let root = write_build(&cache, "b1", "cfg-1");
    set_current(&cache, "b1");

    let resolved =
        resolve_index_ref(&cache, "latest", &[Mode::Code], &default_options()).unwrap();
    assert_eq!(resolved.canonical, "latest");
    assert_eq!(
        resolved.index_base_root_by_mode[&Mode::Code],
        root.canonicalize().unwrap()
    );
    assert_eq!(
        resolved.index_dir_by_mode[&Mode::Code],
        root.canonicalize().unwrap().join("index-code")
    );
    assert_eq!(resolved.identity["type"], "latest");
    assert_eq!(resolved.identity["buildIdByMode"]["code"], "b1");
    assert_eq!(resolved.identity["configHashByMode"]["code"], "cfg-1");
    assert_eq!(resolved.identity["toolVersionByMode"]["code"], "1.4.0");
}

#[test]
fn latest_identity_contains_no_absolute_paths() {
    let (_tmp, cache) = new_cache();
    write_build(&cache, "b1", "cfg-1");
    set_current(&cache, "b1");

    let resolved =
        resolve_index_ref(&cache, "latest", &[Mode::Code], &default_options()).unwrap();
    let identity_json = resolved.identity.to_string();
    assert!(
        !identity_json.contains(cache.root().to_str().unwrap()),
        "identity leaked a cache path: {identity_json}"
    );
    assert_eq!(
        resolved.identity_hash,
        sift_core::stable_hash(&resolved.identity)
    );
}

#[test]
fn latest_requires_the_pointer_document() {
    let (_tmp, cache) = new_cache();
    let err =
        resolve_index_ref(&cache, "latest", &[Mode::Code], &default_options()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[test]
fn pointer_outside_the_cache_boundary_is_rejected() {
    let (tmp, cache) = new_cache();
    let outside = tmp.path().join("outside-build");
    std::fs::create_dir_all(&outside).unwrap();
    std::fs::write(
        cache.current_build_path(),
        serde_json::to_vec(&json!({
            "buildRoots": {"code": outside.to_str().unwrap()},
        }))
        .unwrap(),
    )
    .unwrap();

    let err =
        resolve_index_ref(&cache, "latest", &[Mode::Code], &default_options()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidRequest);

    // The boundary holds even when missing modes are tolerated.
    let err = resolve_index_ref(
        &cache,
        "latest",
        &[Mode::Code],
        &ResolveOptions {
            prefer_frozen: true,
            allow_missing_modes: true,
        },
    )
    .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidRequest);
}

#[test]
fn build_ref_resolves_directly_and_warns_on_id_mismatch() {
    let (_tmp, cache) = new_cache();
    let root = write_build(&cache, "b2", "cfg-2");
    // State claims a different id than the directory.
    std::fs::write(
        root.join("build_state.json"),
        serde_json::to_vec(&json!({
            "schemaVersion": 1,
            "buildId": "something-else",
            "validation": {"ok": true, "issues": []},
        }))
        .unwrap(),
    )
    .unwrap();

    let resolved =
        resolve_index_ref(&cache, "build:b2", &[Mode::Code], &default_options()).unwrap();
    assert_eq!(resolved.canonical, "build:b2");
    assert!(resolved
        .warnings
        .iter()
        .any(|warning| warning.contains("buildId mismatch")));
}

#[test]
fn missing_build_is_not_found_unless_tolerated() {
    let (_tmp, cache) = new_cache();
    let err =
        resolve_index_ref(&cache, "build:nope", &[Mode::Code], &default_options()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);

    let resolved = resolve_index_ref(
        &cache,
        "build:nope",
        &[Mode::Code],
        &ResolveOptions {
            prefer_frozen: true,
            allow_missing_modes: true,
        },
    )
    .unwrap();
    assert!(resolved.index_base_root_by_mode.is_empty());
    assert!(!resolved.warnings.is_empty());
}

#[test]
fn path_refs_hash_the_location_and_warn() {
    let (tmp, cache) = new_cache();
    let target = tmp.path().join("external-index");
    std::fs::create_dir_all(&target).unwrap();

    let reference = format!("path:{}", target.to_str().unwrap());
    let resolved =
        resolve_index_ref(&cache, &reference, &[Mode::Code], &default_options()).unwrap();
    assert_eq!(resolved.identity["type"], "path");
    assert!(resolved.identity["pathHash"].is_string());
    assert!(resolved
        .warnings
        .iter()
        .any(|warning| warning.contains("not portable")));
}

#[test]
fn parse_canonical_round_trip_is_stable() {
    for raw in ["Latest", "build:B-1", "tag:release/2.0"] {
        let parsed = IndexRef::parse(raw).unwrap();
        let again = IndexRef::parse(&parsed.canonical()).unwrap();
        assert_eq!(parsed.canonical(), again.canonical());
    }
}

#[test]
fn identical_builds_resolve_to_identical_identity_hashes() {
    let (_tmp, cache) = new_cache();
    write_build(&cache, "b1", "cfg-1");
    set_current(&cache, "b1");

    let first =
        resolve_index_ref(&cache, "latest", &[Mode::Code], &default_options()).unwrap();
    let second =
        resolve_index_ref(&cache, "latest", &[Mode::Code], &default_options()).unwrap();
    assert_eq!(first.identity_hash, second.identity_hash);
}

#[test]
fn snapshot_refs_resolve_pointer_roots() {
    let (_tmp, cache) = new_cache();
    write_build(&cache, "b1", "cfg-1");
    set_current(&cache, "b1");
    let created = sift_index::snapshots::create_pointer_snapshot(
        &cache,
        &sift_index::snapshots::CreateSnapshotOptions {
            modes: vec![Mode::Code],
            ..Default::default()
        },
    )
    .unwrap();

    let reference = format!("snap:{}", created.snapshot_id);
    let resolved =
        resolve_index_ref(&cache, &reference, &[Mode::Code], &default_options()).unwrap();
    assert_eq!(resolved.identity["type"], "snapshot");
    assert_eq!(resolved.identity["snapshotId"], created.snapshot_id);
    assert!(resolved.snapshot.is_some());
    assert!(resolved.index_base_root_by_mode.contains_key(&Mode::Code));

    // Tag resolution goes through the same snapshot machinery.
    let err = resolve_index_ref(&cache, "tag:release", &[Mode::Code], &default_options())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[test]
fn relative_roots_stay_within_the_cache(){
    // Guard the helper the resolver leans on for every stored path.
    let (tmp, _cache) = new_cache();
    let root = tmp.path().join("cache-root");
    std::fs::create_dir_all(root.join("builds/b")).unwrap();
    assert!(sift_core::within_root(&root, &root.join("builds/b")));
    assert!(!sift_core::within_root(&root, Path::new("/etc")));
}
