use super::registry::{
    self, load_snapshot_record, load_snapshots_manifest, rebuild_tag_index,
    remove_dir_all_nofollow, snapshot_dir, sorted_entries, with_snapshot_lock,
    write_snapshot_record, write_snapshots_manifest, FrozenRecord, SnapshotEntry, SnapshotPointer,
    SnapshotProvenance, SnapshotRecord, SnapshotsManifest,
};
use crate::contracts::is_valid_snapshot_id;
use crate::refs::{resolve_index_ref, ResolveOptions};
use rand::Rng as _;
use serde_json::Value;
use sift_core::{
    now_iso, relative_to_cache_root, Error, IndexCacheDir, Mode, Result,
};
use std::collections::BTreeMap;
use std::path::Path;

pub const DEFAULT_MAX_POINTER_SNAPSHOTS: usize = 25;

/// Options for creating a pointer snapshot over the latest validated build.
#[derive(Clone, Debug)]
pub struct CreateSnapshotOptions {
    /// Modes to capture; empty selects every mode.
    pub modes: Vec<Mode>,
    pub tags: Vec<String>,
    pub label: Option<String>,
    /// Explicit snapshot id; generated when absent.
    pub snapshot_id: Option<String>,
    pub wait_ms: u64,
    /// Untagged pointer snapshots to keep after creation.
    pub max_pointer_snapshots: usize,
}

impl Default for CreateSnapshotOptions {
    fn default() -> Self {
        Self {
            modes: Vec::new(),
            tags: Vec::new(),
            label: None,
            snapshot_id: None,
            wait_ms: 0,
            max_pointer_snapshots: DEFAULT_MAX_POINTER_SNAPSHOTS,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CreatedSnapshot {
    pub snapshot_id: String,
    pub created_at: String,
    pub modes: Vec<Mode>,
    pub tags: Vec<String>,
    pub build_id_by_mode: BTreeMap<String, String>,
    pub removed_by_retention: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct SnapshotDetails {
    pub entry: SnapshotEntry,
    pub record: Option<SnapshotRecord>,
    pub frozen: Option<FrozenRecord>,
}

#[derive(Clone, Debug)]
pub struct RemoveOutcome {
    pub removed: String,
}

#[derive(Clone, Debug)]
pub struct PruneOutcome {
    pub removed: Vec<String>,
    pub dry_run: bool,
}

fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for raw in tags {
        for token in raw.split(',') {
            let tag = token.trim();
            if tag.is_empty() {
                continue;
            }
            if !out.iter().any(|existing| existing == tag) {
                out.push(tag.to_string());
            }
        }
    }
    out.sort();
    out
}

fn generate_snapshot_id(created_at: &str) -> String {
    // `snap-<UTC datestamp>-<6 hex>`: sortable by creation time, unique via
    // the random suffix.
    let stamp: String = created_at
        .chars()
        .filter(|c| c.is_ascii_digit())
        .take(14)
        .collect();
    let token: u32 = rand::thread_rng().gen_range(0..0x0100_0000);
    format!("snap-{stamp}-{token:06x}")
}

fn ensure_snapshot_id(snapshot_id: &str) -> Result<()> {
    if !is_valid_snapshot_id(snapshot_id) {
        return Err(Error::invalid_request(format!(
            "Invalid snapshot id \"{snapshot_id}\"."
        )));
    }
    Ok(())
}

/// Strict read of a mode's build state for snapshotting: the file must
/// exist, decode, and self-report `validation.ok == true`.
fn read_build_state_strict(
    index_base_root: &Path,
    mode: Mode,
) -> Result<crate::build_state::BuildState> {
    let path = index_base_root.join(crate::build_state::BUILD_STATE_FILE);
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::not_found(format!(
                "Missing build_state.json for {mode}."
            )))
        }
        Err(err) => return Err(err.into()),
    };
    let state: crate::build_state::BuildState = serde_json::from_slice(&bytes)
        .map_err(|err| {
            Error::invalid_request(format!("Invalid build_state.json for {mode}: {err}"))
        })?;
    if !state.validation_ok() {
        return Err(Error::invalid_request(format!(
            "Snapshot creation requires validation.ok == true for {mode}."
        )));
    }
    Ok(state)
}

/// Delete untagged pointer snapshots beyond the keep budget. Frozen and
/// tagged entries are never touched here.
pub(crate) fn prune_pointer_snapshots(
    cache: &IndexCacheDir,
    manifest: &mut SnapshotsManifest,
    max_pointer_snapshots: usize,
    dry_run: bool,
) -> Result<Vec<String>> {
    let pointer_entries: Vec<SnapshotEntry> = sorted_entries(manifest)
        .into_iter()
        .filter(|entry| entry.kind.as_deref() == Some("pointer") && !entry.has_frozen)
        .collect();

    let mut kept_untagged = 0usize;
    let mut removed = Vec::new();
    for entry in &pointer_entries {
        if !entry.tags.is_empty() {
            continue;
        }
        if kept_untagged < max_pointer_snapshots {
            kept_untagged += 1;
            continue;
        }
        removed.push(entry.snapshot_id.clone());
    }

    if !dry_run {
        for snapshot_id in &removed {
            remove_dir_all_nofollow(&snapshot_dir(cache, snapshot_id))?;
            manifest.snapshots.remove(snapshot_id);
        }
        if !removed.is_empty() {
            rebuild_tag_index(manifest);
        }
    }
    Ok(removed)
}

/// Create a pointer snapshot of the latest build for the requested modes.
///
/// Refuses to snapshot a build whose state does not self-report
/// `validation.ok == true` in every requested mode, and records only
/// repo-cache-relative build roots.
pub fn create_pointer_snapshot(
    cache: &IndexCacheDir,
    options: &CreateSnapshotOptions,
) -> Result<CreatedSnapshot> {
    let modes: Vec<Mode> = if options.modes.is_empty() {
        Mode::ALL.to_vec()
    } else {
        options.modes.clone()
    };
    let tags = normalize_tags(&options.tags);
    let created_at = now_iso();
    let snapshot_id = options
        .snapshot_id
        .clone()
        .unwrap_or_else(|| generate_snapshot_id(&created_at));
    ensure_snapshot_id(&snapshot_id)?;
    let max_pointer = options.max_pointer_snapshots.max(1);

    with_snapshot_lock(cache, options.wait_ms, "mutate snapshots", |_lock| {
        let resolved = resolve_index_ref(
            cache,
            "latest",
            &modes,
            &ResolveOptions {
                prefer_frozen: true,
                allow_missing_modes: false,
            },
        )?;
        let mut manifest = load_snapshots_manifest(cache)?;
        if manifest.snapshots.contains_key(&snapshot_id) {
            return Err(Error::invalid_request(format!(
                "Snapshot already exists: {snapshot_id}"
            )));
        }
        let dir = snapshot_dir(cache, &snapshot_id);
        if dir.exists() {
            return Err(Error::invalid_request(format!(
                "Snapshot directory already exists: {snapshot_id}"
            )));
        }

        let mut build_roots_by_mode = BTreeMap::new();
        let mut build_id_by_mode = BTreeMap::new();
        let mut config_hash_by_mode = BTreeMap::new();
        let mut tool_version_by_mode = BTreeMap::new();
        let mut repo_provenance: Option<Value> = None;

        for mode in &modes {
            let index_base_root = resolved
                .index_base_root_by_mode
                .get(mode)
                .ok_or_else(|| {
                    Error::not_found(format!("Missing resolved index base root for {mode}."))
                })?;
            let state = read_build_state_strict(index_base_root, *mode)?;
            build_roots_by_mode.insert(
                mode.as_str().to_string(),
                relative_to_cache_root(
                    cache.root(),
                    index_base_root,
                    &format!("buildRoot ({mode})"),
                )?,
            );
            let build_id = state
                .build_id
                .clone()
                .filter(|id| !id.is_empty())
                .or_else(|| {
                    index_base_root
                        .file_name()
                        .map(|name| name.to_string_lossy().to_string())
                })
                .unwrap_or_default();
            build_id_by_mode.insert(mode.as_str().to_string(), build_id);
            config_hash_by_mode.insert(mode.as_str().to_string(), state.config_hash.clone());
            tool_version_by_mode.insert(
                mode.as_str().to_string(),
                state.tool_version().map(str::to_string),
            );
            if repo_provenance.is_none() {
                repo_provenance = state.repo.clone().filter(Value::is_object);
            }
        }

        let git = repo_provenance.as_ref().map(|repo| {
            serde_json::json!({
                "branch": repo.get("branch").cloned().unwrap_or(Value::Null),
                "commit": repo.get("commit").cloned().unwrap_or(Value::Null),
                "dirty": repo.get("dirty").cloned().unwrap_or(Value::Null),
            })
        });

        let record = SnapshotRecord {
            version: 1,
            snapshot_id: snapshot_id.clone(),
            created_at: created_at.clone(),
            kind: "pointer".to_string(),
            label: options
                .label
                .as_deref()
                .map(str::trim)
                .filter(|label| !label.is_empty())
                .map(str::to_string),
            tags: tags.clone(),
            pointer: SnapshotPointer {
                build_roots_by_mode,
                build_id_by_mode: build_id_by_mode.clone(),
                build_root: None,
            },
            provenance: Some(SnapshotProvenance {
                repo_id: Some(cache.repo_hash().to_string()),
                repo_root_hash: Some(cache.repo_root_hash()),
                git,
                tool_version_by_mode,
                config_hash_by_mode,
            }),
        };

        manifest.snapshots.insert(
            snapshot_id.clone(),
            SnapshotEntry {
                snapshot_id: snapshot_id.clone(),
                created_at: Some(created_at.clone()),
                kind: Some("pointer".to_string()),
                tags: tags.clone(),
                label: record.label.clone(),
                has_frozen: false,
            },
        );

        write_snapshot_record(cache, &record)?;
        let removed = prune_pointer_snapshots(cache, &mut manifest, max_pointer, false)?;
        write_snapshots_manifest(cache, &mut manifest)?;

        Ok(CreatedSnapshot {
            snapshot_id: snapshot_id.clone(),
            created_at: created_at.clone(),
            modes: modes.clone(),
            tags: tags.clone(),
            build_id_by_mode,
            removed_by_retention: removed,
        })
    })
}

/// All snapshot entries, most recent first. Read-only; takes no lock.
pub fn list_snapshots(cache: &IndexCacheDir) -> Result<Vec<SnapshotEntry>> {
    let manifest = load_snapshots_manifest(cache)?;
    Ok(sorted_entries(&manifest))
}

/// One snapshot's entry plus its full record and frozen metadata.
pub fn show_snapshot(cache: &IndexCacheDir, snapshot_id: &str) -> Result<Option<SnapshotDetails>> {
    ensure_snapshot_id(snapshot_id)?;
    let manifest = load_snapshots_manifest(cache)?;
    let Some(entry) = manifest.snapshots.get(snapshot_id).cloned() else {
        return Ok(None);
    };
    let record = load_snapshot_record(cache, snapshot_id)?;
    let frozen = registry::load_frozen_record(cache, snapshot_id)?;
    Ok(Some(SnapshotDetails {
        entry,
        record,
        frozen,
    }))
}

/// Remove a snapshot. Frozen snapshots require `force`.
pub fn remove_snapshot(
    cache: &IndexCacheDir,
    snapshot_id: &str,
    force: bool,
    wait_ms: u64,
) -> Result<RemoveOutcome> {
    ensure_snapshot_id(snapshot_id)?;
    with_snapshot_lock(cache, wait_ms, "mutate snapshots", |_lock| {
        let mut manifest = load_snapshots_manifest(cache)?;
        let entry = manifest
            .snapshots
            .get(snapshot_id)
            .ok_or_else(|| Error::not_found(format!("Snapshot not found: {snapshot_id}")))?;
        if entry.has_frozen && !force {
            return Err(Error::invalid_request(format!(
                "Snapshot {snapshot_id} is frozen. Use --force to remove."
            )));
        }
        remove_dir_all_nofollow(&snapshot_dir(cache, snapshot_id))?;
        manifest.snapshots.remove(snapshot_id);
        write_snapshots_manifest(cache, &mut manifest)?;
        Ok(RemoveOutcome {
            removed: snapshot_id.to_string(),
        })
    })
}

/// Retention-only pass over untagged pointer snapshots.
pub fn prune_snapshots(
    cache: &IndexCacheDir,
    max_pointer_snapshots: usize,
    wait_ms: u64,
    dry_run: bool,
) -> Result<PruneOutcome> {
    with_snapshot_lock(cache, wait_ms, "mutate snapshots", |_lock| {
        let mut manifest = load_snapshots_manifest(cache)?;
        let removed = prune_pointer_snapshots(
            cache,
            &mut manifest,
            max_pointer_snapshots.max(1),
            dry_run,
        )?;
        if !removed.is_empty() && !dry_run {
            write_snapshots_manifest(cache, &mut manifest)?;
        }
        Ok(PruneOutcome { removed, dry_run })
    })
}
