use serde::{Deserialize, Serialize};
use serde_json::Value;
use sift_core::{now_iso, parse_iso_ms, Error, IndexCacheDir, Result};
use sift_storage::{atomic_write_json, IndexLock, LockOptions};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Registry of all snapshots for one repo cache.
///
/// Entries duplicate enough of each snapshot to list and sort without
/// opening the per-snapshot `snapshot.json`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotsManifest {
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub snapshots: BTreeMap<String, SnapshotEntry>,
    /// Tag name → snapshot ids sorted most-recent first.
    #[serde(default)]
    pub tags: BTreeMap<String, Vec<String>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub snapshot_id: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub has_frozen: bool,
}

impl SnapshotEntry {
    pub(crate) fn created_at_ms(&self) -> i64 {
        self.created_at
            .as_deref()
            .and_then(parse_iso_ms)
            .unwrap_or(0)
    }
}

/// The per-snapshot document (`snapshot.json`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub version: u32,
    pub snapshot_id: String,
    pub created_at: String,
    pub kind: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub pointer: SnapshotPointer,
    #[serde(default)]
    pub provenance: Option<SnapshotProvenance>,
}

/// Lightweight reference to an existing build's artifacts (no copy).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPointer {
    /// Repo-cache-relative build roots, keyed by mode.
    #[serde(default)]
    pub build_roots_by_mode: BTreeMap<String, String>,
    #[serde(default)]
    pub build_id_by_mode: BTreeMap<String, String>,
    /// Legacy single-root fallback used before per-mode pointers existed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_root: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotProvenance {
    #[serde(default)]
    pub repo_id: Option<String>,
    #[serde(default)]
    pub repo_root_hash: Option<String>,
    #[serde(default)]
    pub git: Option<Value>,
    #[serde(default)]
    pub tool_version_by_mode: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub config_hash_by_mode: BTreeMap<String, Option<String>>,
}

/// The frozen-copy record (`frozen.json`), present once a snapshot has an
/// immutable copy under `frozen/`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrozenRecord {
    pub version: u32,
    pub snapshot_id: String,
    pub frozen_at: String,
    pub method: String,
    #[serde(default)]
    pub frozen_root: Option<String>,
    #[serde(default)]
    pub included: FrozenIncluded,
    #[serde(default)]
    pub verification: FrozenVerification,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrozenIncluded {
    #[serde(default)]
    pub modes: Vec<String>,
    #[serde(default)]
    pub sqlite: bool,
    #[serde(default)]
    pub lmdb: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrozenVerification {
    #[serde(default)]
    pub checked_at: Option<String>,
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub files_checked: Option<u64>,
    #[serde(default)]
    pub bytes_checked: Option<u64>,
    #[serde(default)]
    pub failures: Vec<Value>,
}

pub(crate) fn snapshot_dir(cache: &IndexCacheDir, snapshot_id: &str) -> PathBuf {
    cache.snapshots_dir().join(snapshot_id)
}

/// Load the snapshots manifest; an absent file is an empty registry.
pub(crate) fn load_snapshots_manifest(cache: &IndexCacheDir) -> Result<SnapshotsManifest> {
    let path = cache.snapshots_manifest_path();
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(SnapshotsManifest::default())
        }
        Err(err) => return Err(err.into()),
    };
    serde_json::from_slice(&bytes).map_err(|err| {
        Error::invalid_request(format!("Invalid snapshots/manifest.json: {err}"))
    })
}

pub(crate) fn write_snapshots_manifest(
    cache: &IndexCacheDir,
    manifest: &mut SnapshotsManifest,
) -> Result<()> {
    manifest.version = Some(manifest.version.unwrap_or(1));
    manifest.updated_at = Some(now_iso());
    rebuild_tag_index(manifest);
    atomic_write_json(&cache.snapshots_manifest_path(), manifest)
}

pub(crate) fn load_snapshot_record(
    cache: &IndexCacheDir,
    snapshot_id: &str,
) -> Result<Option<SnapshotRecord>> {
    let path = snapshot_dir(cache, snapshot_id).join("snapshot.json");
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|err| Error::invalid_request(format!("Invalid snapshot {snapshot_id}: {err}")))
}

pub(crate) fn write_snapshot_record(
    cache: &IndexCacheDir,
    record: &SnapshotRecord,
) -> Result<()> {
    let path = snapshot_dir(cache, &record.snapshot_id).join("snapshot.json");
    atomic_write_json(&path, record)
}

pub(crate) fn load_frozen_record(
    cache: &IndexCacheDir,
    snapshot_id: &str,
) -> Result<Option<FrozenRecord>> {
    let path = snapshot_dir(cache, snapshot_id).join("frozen.json");
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    match serde_json::from_slice(&bytes) {
        Ok(record) => Ok(Some(record)),
        Err(err) => {
            // A frozen record we cannot decode means the frozen copy cannot
            // be trusted; treat it as absent rather than failing resolution.
            tracing::debug!(
                target = "sift.snapshots",
                snapshot_id,
                error = %err,
                "failed to decode frozen.json; treating snapshot as unfrozen"
            );
            Ok(None)
        }
    }
}

pub(crate) fn write_frozen_record(cache: &IndexCacheDir, record: &FrozenRecord) -> Result<()> {
    let validation = crate::contracts::validate_frozen_record(record);
    if !validation.ok {
        return Err(Error::invalid_request(format!(
            "frozen record invalid: {}",
            validation.errors.join("; ")
        )));
    }
    let path = snapshot_dir(cache, &record.snapshot_id).join("frozen.json");
    atomic_write_json(&path, record)
}

/// Rebuild the tag → ids index from entry tags, most recent first.
pub(crate) fn rebuild_tag_index(manifest: &mut SnapshotsManifest) {
    let mut tags: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for entry in manifest.snapshots.values() {
        for tag in &entry.tags {
            if tag.is_empty() {
                continue;
            }
            tags.entry(tag.clone())
                .or_default()
                .push(entry.snapshot_id.clone());
        }
    }
    for ids in tags.values_mut() {
        ids.sort_by(|a, b| {
            let left = manifest.snapshots.get(a).map(|e| e.created_at_ms()).unwrap_or(0);
            let right = manifest.snapshots.get(b).map(|e| e.created_at_ms()).unwrap_or(0);
            right.cmp(&left).then_with(|| a.cmp(b))
        });
    }
    manifest.tags = tags;
}

/// Manifest entries sorted most-recent first (id tiebreak).
pub(crate) fn sorted_entries(manifest: &SnapshotsManifest) -> Vec<SnapshotEntry> {
    let mut entries: Vec<SnapshotEntry> = manifest.snapshots.values().cloned().collect();
    entries.sort_by(|left, right| {
        right
            .created_at_ms()
            .cmp(&left.created_at_ms())
            .then_with(|| left.snapshot_id.cmp(&right.snapshot_id))
    });
    entries
}

/// Run `worker` while holding the index lock, failing fast when it is held.
pub(crate) fn with_snapshot_lock<T>(
    cache: &IndexCacheDir,
    wait_ms: u64,
    context: &str,
    worker: impl FnOnce(&IndexLock) -> Result<T>,
) -> Result<T> {
    let options = LockOptions {
        wait_ms,
        ..LockOptions::default()
    };
    let lock = IndexLock::acquire(&cache.lock_path(), &options)?.ok_or_else(|| {
        Error::queue_overloaded(format!("Index lock held; unable to {context}."))
    })?;
    worker(&lock)
}

/// Remove `frozen.staging-*` directories older than `max_age_hours`.
///
/// A crash mid-freeze leaves staging behind; it is swept, never resumed.
pub(crate) fn cleanup_stale_staging(
    cache: &IndexCacheDir,
    max_age_hours: u64,
) -> Result<Vec<PathBuf>> {
    let snapshots_root = cache.snapshots_dir();
    let mut swept = Vec::new();
    let entries = match std::fs::read_dir(&snapshots_root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(swept),
        Err(err) => return Err(err.into()),
    };
    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(max_age_hours.saturating_mul(3600)))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    for snapshot_entry in entries.flatten() {
        let snapshot_path = snapshot_entry.path();
        if !snapshot_path.is_dir() {
            continue;
        }
        let Ok(children) = std::fs::read_dir(&snapshot_path) else {
            continue;
        };
        for child in children.flatten() {
            let name = child.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("frozen.staging-") {
                continue;
            }
            let path = child.path();
            let stale = std::fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .map(|modified| modified < cutoff)
                .unwrap_or(true);
            if !stale {
                continue;
            }
            match remove_dir_all_nofollow(&path) {
                Ok(()) => {
                    tracing::debug!(
                        target = "sift.snapshots",
                        path = %path.display(),
                        "swept stale frozen staging directory"
                    );
                    swept.push(path);
                }
                Err(err) => {
                    tracing::debug!(
                        target = "sift.snapshots",
                        path = %path.display(),
                        error = %err,
                        "failed to sweep stale staging directory"
                    );
                }
            }
        }
    }
    Ok(swept)
}

/// Delete a directory tree without following symlinks.
pub(crate) fn remove_dir_all_nofollow(path: &Path) -> std::io::Result<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if meta.file_type().is_symlink() || meta.is_file() {
        return std::fs::remove_file(path);
    }

    for entry in walkdir::WalkDir::new(path)
        .follow_links(false)
        .contents_first(true)
    {
        let entry = entry.map_err(std::io::Error::other)?;
        if entry.file_type().is_dir() {
            std::fs::remove_dir(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Convenience: the pointer roots for a snapshot record, with the legacy
/// single-root fallback applied per mode.
pub(crate) fn pointer_root_for_mode<'a>(
    record: &'a SnapshotRecord,
    mode: &str,
) -> Option<&'a str> {
    record
        .pointer
        .build_roots_by_mode
        .get(mode)
        .map(String::as_str)
        .or(record.pointer.build_root.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, created_at: &str, tags: &[&str]) -> SnapshotEntry {
        SnapshotEntry {
            snapshot_id: id.to_string(),
            created_at: Some(created_at.to_string()),
            kind: Some("pointer".to_string()),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            label: None,
            has_frozen: false,
        }
    }

    #[test]
    fn tag_index_sorts_by_recency() {
        let mut manifest = SnapshotsManifest::default();
        manifest.snapshots.insert(
            "snap-a".to_string(),
            entry("snap-a", "2026-01-01T00:00:00.000Z", &["release"]),
        );
        manifest.snapshots.insert(
            "snap-b".to_string(),
            entry("snap-b", "2026-02-01T00:00:00.000Z", &["release"]),
        );
        rebuild_tag_index(&mut manifest);
        assert_eq!(manifest.tags["release"], vec!["snap-b", "snap-a"]);
    }

    #[test]
    fn sorted_entries_breaks_ties_by_id() {
        let mut manifest = SnapshotsManifest::default();
        let at = "2026-01-01T00:00:00.000Z";
        manifest
            .snapshots
            .insert("snap-b".to_string(), entry("snap-b", at, &[]));
        manifest
            .snapshots
            .insert("snap-a".to_string(), entry("snap-a", at, &[]));
        let sorted = sorted_entries(&manifest);
        assert_eq!(sorted[0].snapshot_id, "snap-a");
    }
}
