use super::registry::{
    cleanup_stale_staging, load_frozen_record, load_snapshot_record, load_snapshots_manifest,
    pointer_root_for_mode, remove_dir_all_nofollow, snapshot_dir, sorted_entries,
    with_snapshot_lock, write_frozen_record, write_snapshots_manifest, FrozenIncluded,
    FrozenRecord, FrozenVerification, SnapshotRecord,
};
use crate::artifacts::{load_pieces_manifest, PieceEntry};
use crate::contracts::is_valid_snapshot_id;
use globset::{Glob, GlobSet, GlobSetBuilder};
use rand::Rng as _;
use sift_core::{
    from_posix, now_iso, sha1_hex_file, sha256_hex_file, Error, IndexCacheDir, Mode, Result,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_KEEP_POINTER: usize = 50;
pub const DEFAULT_KEEP_FROZEN: usize = 20;
const DEFAULT_KEEP_TAGS: [&str; 2] = ["release/*", "release"];
const DEFAULT_STAGING_MAX_AGE_HOURS: u64 = 24;

/// How frozen files are materialized.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FreezeMethod {
    /// Hardlink into the frozen tree, falling back to a real copy on
    /// cross-device or permission errors.
    #[default]
    Hardlink,
    Copy,
}

impl FreezeMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            FreezeMethod::Hardlink => "hardlink",
            FreezeMethod::Copy => "copy",
        }
    }
}

/// Whether the embedded relational index rides along into the frozen copy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IncludeSqlite {
    /// Include it when `index-sqlite/` holds a database file.
    #[default]
    Auto,
    On,
    Off,
}

#[derive(Clone, Debug)]
pub struct FreezeOptions {
    /// Modes to freeze; empty selects the pointer's modes.
    pub modes: Vec<Mode>,
    pub method: FreezeMethod,
    /// Re-hash every copied piece against the manifest-recorded checksum.
    pub verify: bool,
    pub include_sqlite: IncludeSqlite,
    pub include_lmdb: bool,
    pub wait_ms: u64,
    pub staging_max_age_hours: u64,
}

impl Default for FreezeOptions {
    fn default() -> Self {
        Self {
            modes: Vec::new(),
            method: FreezeMethod::Hardlink,
            verify: true,
            include_sqlite: IncludeSqlite::Auto,
            include_lmdb: false,
            wait_ms: 0,
            staging_max_age_hours: DEFAULT_STAGING_MAX_AGE_HOURS,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FreezeOutcome {
    pub snapshot_id: String,
    pub already_frozen: bool,
    pub frozen_at: Option<String>,
    pub method: FreezeMethod,
    pub modes: Vec<Mode>,
    pub include_sqlite: bool,
    pub include_lmdb: bool,
    pub files_copied: u64,
    pub bytes_copied: u64,
    pub files_checked: Option<u64>,
    pub bytes_checked: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct GcOptions {
    pub keep_pointer: usize,
    pub keep_frozen: usize,
    /// Tag globs protecting entries from GC entirely.
    pub keep_tags: Vec<String>,
    /// Entries younger than this never GC, regardless of keep counts.
    pub max_age_days: Option<f64>,
    pub dry_run: bool,
    pub wait_ms: u64,
    pub staging_max_age_hours: u64,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            keep_pointer: DEFAULT_KEEP_POINTER,
            keep_frozen: DEFAULT_KEEP_FROZEN,
            keep_tags: DEFAULT_KEEP_TAGS.iter().map(|s| s.to_string()).collect(),
            max_age_days: None,
            dry_run: false,
            wait_ms: 0,
            staging_max_age_hours: DEFAULT_STAGING_MAX_AGE_HOURS,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GcOutcome {
    pub dry_run: bool,
    pub removed: Vec<String>,
    pub protected_by_tag: Vec<String>,
    pub stale_staging: Vec<PathBuf>,
}

#[derive(Default)]
struct CopyTotals {
    files_copied: u64,
    bytes_copied: u64,
    files_checked: u64,
    bytes_checked: u64,
}

/// Freeze a snapshot into an immutable, verified, source-independent copy.
///
/// All copying lands in a uniquely named staging directory beside the
/// snapshot; only after every copy and verification succeeds is staging
/// atomically promoted to `frozen/`. Any failure discards staging and
/// leaves the snapshot unfrozen.
pub fn freeze_snapshot(cache: &IndexCacheDir, snapshot_id: &str, options: &FreezeOptions) -> Result<FreezeOutcome> {
    if !is_valid_snapshot_id(snapshot_id) {
        return Err(Error::invalid_request(format!(
            "Invalid snapshot id \"{snapshot_id}\"."
        )));
    }

    with_snapshot_lock(cache, options.wait_ms, "freeze snapshots", |_lock| {
        cleanup_stale_staging(cache, options.staging_max_age_hours)?;

        let mut manifest = load_snapshots_manifest(cache)?;
        let entry = manifest
            .snapshots
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("Snapshot not found: {snapshot_id}")))?;
        let record = load_snapshot_record(cache, snapshot_id)?
            .ok_or_else(|| Error::not_found(format!("snapshot.json missing for {snapshot_id}")))?;

        let dir = snapshot_dir(cache, snapshot_id);
        let frozen_dir = dir.join("frozen");
        let existing_frozen = load_frozen_record(cache, snapshot_id)?;
        if entry.has_frozen {
            if let Some(existing) = existing_frozen {
                if frozen_dir.exists() {
                    return Ok(FreezeOutcome {
                        snapshot_id: snapshot_id.to_string(),
                        already_frozen: true,
                        frozen_at: Some(existing.frozen_at),
                        method: options.method,
                        modes: Vec::new(),
                        include_sqlite: existing.included.sqlite,
                        include_lmdb: existing.included.lmdb,
                        files_copied: 0,
                        bytes_copied: 0,
                        files_checked: None,
                        bytes_checked: None,
                    });
                }
            }
        }

        let selected_modes = selected_modes(&record, &options.modes)?;
        let source_root_by_mode = resolve_source_roots(cache, &record, &selected_modes)?;
        for (mode, source_root) in &source_root_by_mode {
            let source_index_dir = source_root.join(format!("index-{mode}"));
            if !source_index_dir.exists() {
                return Err(Error::not_found(format!(
                    "Snapshot {snapshot_id} source index missing for {mode}: {}",
                    source_index_dir.display()
                )));
            }
        }

        let staging = staging_dir(&dir);
        std::fs::create_dir_all(&staging)?;

        let freeze_result = (|| -> Result<(CopyTotals, bool, bool)> {
            let mut totals = CopyTotals::default();
            for mode in &selected_modes {
                let source_root = &source_root_by_mode[mode];
                copy_mode_pieces(
                    &source_root.join(format!("index-{mode}")),
                    &staging.join(format!("index-{mode}")),
                    options.method,
                    options.verify,
                    &mut totals,
                )?;
            }

            // Optional secondary stores ride along from the dominant source
            // root (code when present).
            let dominant = source_root_by_mode
                .get(&Mode::Code)
                .or_else(|| selected_modes.first().and_then(|m| source_root_by_mode.get(m)));
            let sqlite_dir = dominant.map(|root| root.join("index-sqlite"));
            let include_sqlite = match options.include_sqlite {
                IncludeSqlite::On => true,
                IncludeSqlite::Off => false,
                IncludeSqlite::Auto => sqlite_dir
                    .as_deref()
                    .map(has_sqlite_artifact)
                    .unwrap_or(false),
            };
            if include_sqlite {
                let source = sqlite_dir.as_deref().filter(|dir| dir.exists()).ok_or_else(|| {
                    Error::not_found(format!(
                        "index-sqlite source missing for snapshot {snapshot_id}."
                    ))
                })?;
                copy_dir_tree(source, &staging.join("index-sqlite"), options.method, &mut totals)?;
            }

            let include_lmdb = options.include_lmdb;
            if include_lmdb {
                let source = dominant
                    .map(|root| root.join("index-lmdb"))
                    .filter(|dir| dir.exists())
                    .ok_or_else(|| {
                        Error::not_found(format!(
                            "index-lmdb source missing for snapshot {snapshot_id}."
                        ))
                    })?;
                copy_dir_tree(&source, &staging.join("index-lmdb"), options.method, &mut totals)?;
            }

            if let Some(dominant) = dominant {
                let state_path = dominant.join(crate::build_state::BUILD_STATE_FILE);
                if state_path.exists() {
                    link_or_copy(
                        &state_path,
                        &staging.join(crate::build_state::BUILD_STATE_FILE),
                        options.method,
                    )?;
                }
            }

            Ok((totals, include_sqlite, include_lmdb))
        })();

        let (totals, include_sqlite, include_lmdb) = match freeze_result {
            Ok(result) => result,
            Err(err) => {
                discard_staging(&staging);
                return Err(err);
            }
        };

        if let Err(err) = sift_storage::replace_dir(&staging, &frozen_dir) {
            discard_staging(&staging);
            return Err(err);
        }

        let frozen_at = now_iso();
        let frozen = FrozenRecord {
            version: 1,
            snapshot_id: snapshot_id.to_string(),
            frozen_at: frozen_at.clone(),
            method: options.method.as_str().to_string(),
            frozen_root: Some(format!("snapshots/{snapshot_id}/frozen")),
            included: FrozenIncluded {
                modes: selected_modes.iter().map(|m| m.as_str().to_string()).collect(),
                sqlite: include_sqlite,
                lmdb: include_lmdb,
            },
            verification: FrozenVerification {
                checked_at: Some(frozen_at.clone()),
                ok: true,
                files_checked: options.verify.then_some(totals.files_checked),
                bytes_checked: options.verify.then_some(totals.bytes_checked),
                failures: Vec::new(),
            },
        };
        write_frozen_record(cache, &frozen)?;

        if let Some(entry) = manifest.snapshots.get_mut(snapshot_id) {
            entry.has_frozen = true;
        }
        write_snapshots_manifest(cache, &mut manifest)?;

        Ok(FreezeOutcome {
            snapshot_id: snapshot_id.to_string(),
            already_frozen: false,
            frozen_at: Some(frozen_at),
            method: options.method,
            modes: selected_modes,
            include_sqlite,
            include_lmdb,
            files_copied: totals.files_copied,
            bytes_copied: totals.bytes_copied,
            files_checked: options.verify.then_some(totals.files_checked),
            bytes_checked: options.verify.then_some(totals.bytes_checked),
        })
    })
}

fn selected_modes(record: &SnapshotRecord, requested: &[Mode]) -> Result<Vec<Mode>> {
    if !requested.is_empty() {
        return Ok(requested.to_vec());
    }
    let mut pointer_modes: Vec<Mode> = Vec::new();
    for mode_name in record.pointer.build_roots_by_mode.keys() {
        let mode = Mode::parse(mode_name)?;
        if !pointer_modes.contains(&mode) {
            pointer_modes.push(mode);
        }
    }
    pointer_modes.sort_by_key(|mode| mode.rank());
    if pointer_modes.is_empty() {
        return Ok(Mode::ALL.to_vec());
    }
    Ok(pointer_modes)
}

fn resolve_source_roots(
    cache: &IndexCacheDir,
    record: &SnapshotRecord,
    modes: &[Mode],
) -> Result<BTreeMap<Mode, PathBuf>> {
    let mut roots = BTreeMap::new();
    for mode in modes {
        let raw = pointer_root_for_mode(record, mode.as_str()).ok_or_else(|| {
            Error::invalid_request(format!(
                "Snapshot {} missing build root for {mode}.",
                record.snapshot_id
            ))
        })?;
        if !sift_core::is_manifest_path_safe(raw) {
            return Err(Error::invalid_request(format!(
                "pointer.buildRootsByMode.{mode} must be repo-cache-relative and traversal-safe."
            )));
        }
        let resolved = cache.root().join(from_posix(raw));
        if !sift_core::within_root(cache.root(), &resolved) {
            return Err(Error::invalid_request(format!(
                "pointer.buildRootsByMode.{mode} escapes repo cache root."
            )));
        }
        roots.insert(*mode, resolved);
    }
    Ok(roots)
}

fn staging_dir(snapshot_path: &Path) -> PathBuf {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let token: u32 = rand::thread_rng().gen_range(0..0x0100_0000);
    snapshot_path.join(format!("frozen.staging-{millis}-{token:06x}"))
}

fn discard_staging(staging: &Path) {
    if let Err(err) = remove_dir_all_nofollow(staging) {
        tracing::debug!(
            target = "sift.snapshots",
            path = %staging.display(),
            error = %err,
            "failed to discard freeze staging directory"
        );
    }
}

/// Copy one mode's pieces into staging, with the pieces manifest as the
/// authoritative file list, then verify each copy against the recorded
/// checksum and size.
fn copy_mode_pieces(
    source_index_dir: &Path,
    target_index_dir: &Path,
    method: FreezeMethod,
    verify: bool,
    totals: &mut CopyTotals,
) -> Result<()> {
    let manifest = load_pieces_manifest(source_index_dir)?.ok_or_else(|| {
        Error::not_found(format!(
            "pieces manifest missing: {}",
            crate::artifacts::pieces_manifest_path(source_index_dir).display()
        ))
    })?;

    for piece in &manifest.pieces {
        let Some(rel) = piece.safe_path() else {
            continue;
        };
        let source = source_index_dir.join(from_posix(rel));
        let target = target_index_dir.join(from_posix(rel));
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        link_or_copy(&source, &target, method)?;
        let copied_bytes = std::fs::metadata(&target)?.len();
        totals.files_copied += 1;
        totals.bytes_copied += copied_bytes;

        if verify {
            verify_piece(piece, &target, copied_bytes)?;
            totals.files_checked += 1;
            totals.bytes_checked += copied_bytes;
        }
    }

    // The manifest itself rides along so the frozen tree is self-describing.
    let manifest_source = crate::artifacts::pieces_manifest_path(source_index_dir);
    let manifest_target = crate::artifacts::pieces_manifest_path(target_index_dir);
    if let Some(parent) = manifest_target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    link_or_copy(&manifest_source, &manifest_target, method)?;
    totals.files_copied += 1;
    totals.bytes_copied += std::fs::metadata(&manifest_target)?.len();

    Ok(())
}

fn verify_piece(piece: &PieceEntry, copied: &Path, copied_bytes: u64) -> Result<()> {
    if let Some(expected_size) = piece.size {
        if expected_size != copied_bytes {
            return Err(Error::internal(format!(
                "Checksum mismatch for {}: expected {expected_size} bytes, found {copied_bytes}",
                copied.display()
            )));
        }
    }
    let Some(checksum) = piece.checksum.as_deref() else {
        return Ok(());
    };
    let (algo, expected) = checksum
        .split_once(':')
        .map(|(algo, hex)| (algo.trim().to_ascii_lowercase(), hex.trim().to_ascii_lowercase()))
        .unwrap_or_else(|| ("sha1".to_string(), checksum.trim().to_ascii_lowercase()));
    let found = match algo.as_str() {
        "sha1" => sha1_hex_file(copied)?,
        "sha256" => sha256_hex_file(copied)?,
        other => {
            tracing::debug!(
                target = "sift.snapshots",
                algo = other,
                path = %copied.display(),
                "unknown piece checksum algorithm; skipping verification"
            );
            return Ok(());
        }
    };
    if found != expected {
        return Err(Error::internal(format!(
            "Checksum mismatch for {}: expected {algo}:{expected}, found {algo}:{found}",
            copied.display()
        )));
    }
    Ok(())
}

/// Hardlink with copy fallback on filesystem boundaries and permission
/// errors; plain copy when the method says so.
fn link_or_copy(source: &Path, target: &Path, method: FreezeMethod) -> Result<()> {
    if method == FreezeMethod::Copy {
        std::fs::copy(source, target)?;
        return Ok(());
    }
    match std::fs::hard_link(source, target) {
        Ok(()) => Ok(()),
        Err(err)
            if matches!(
                err.kind(),
                std::io::ErrorKind::CrossesDevices
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::AlreadyExists
            ) =>
        {
            std::fs::copy(source, target)?;
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn copy_dir_tree(
    source: &Path,
    target: &Path,
    method: FreezeMethod,
    totals: &mut CopyTotals,
) -> Result<()> {
    for entry in walkdir::WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| Error::internal("walked path escaped its root"))?;
        let dest = target.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        link_or_copy(entry.path(), &dest, method)?;
        totals.files_copied += 1;
        totals.bytes_copied += std::fs::metadata(&dest)?.len();
    }
    Ok(())
}

fn has_sqlite_artifact(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries.flatten().any(|entry| {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        entry.file_type().map(|t| t.is_file()).unwrap_or(false)
            && (name.ends_with(".db") || name.ends_with(".sqlite") || name.ends_with(".sqlite3"))
    })
}

fn keep_tag_globs(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|err| {
            Error::invalid_request(format!("Invalid keep-tag pattern \"{pattern}\": {err}"))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|err| Error::invalid_request(format!("Invalid keep-tag patterns: {err}")))
}

/// Garbage-collect snapshots with independent keep-counts for frozen and
/// pointer entries, tag-glob protection, and an optional age floor that can
/// only extend retention.
pub fn gc_snapshots(cache: &IndexCacheDir, options: &GcOptions) -> Result<GcOutcome> {
    let keep_tags = keep_tag_globs(&options.keep_tags)?;
    let cutoff_ms = options.max_age_days.map(|days| {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        now_ms - (days.max(0.0) * 24.0 * 60.0 * 60.0 * 1000.0) as i64
    });

    with_snapshot_lock(cache, options.wait_ms, "gc snapshots", |_lock| {
        let stale_staging = cleanup_stale_staging(cache, options.staging_max_age_hours)?;
        let mut manifest = load_snapshots_manifest(cache)?;
        let entries = sorted_entries(&manifest);

        let mut protected: Vec<String> = entries
            .iter()
            .filter(|entry| entry.tags.iter().any(|tag| keep_tags.is_match(tag)))
            .map(|entry| entry.snapshot_id.clone())
            .collect();
        protected.sort();

        let frozen: Vec<_> = entries
            .iter()
            .filter(|e| e.has_frozen && !protected.contains(&e.snapshot_id))
            .collect();
        let pointer: Vec<_> = entries
            .iter()
            .filter(|e| !e.has_frozen && !protected.contains(&e.snapshot_id))
            .collect();

        let mut removals = Vec::new();
        let mut choose = |list: &[&super::registry::SnapshotEntry], keep_count: usize| {
            for (index, entry) in list.iter().enumerate() {
                let within_keep = index < keep_count;
                let keep = match cutoff_ms {
                    // The age floor extends retention: younger-than-cutoff
                    // entries survive even past the keep count.
                    Some(cutoff) => within_keep || entry.created_at_ms() >= cutoff,
                    None => within_keep,
                };
                if !keep {
                    removals.push((*entry).clone());
                }
            }
        };
        choose(&frozen, options.keep_frozen);
        choose(&pointer, options.keep_pointer);
        removals.sort_by(|left, right| {
            left.created_at_ms()
                .cmp(&right.created_at_ms())
                .then_with(|| left.snapshot_id.cmp(&right.snapshot_id))
        });

        let removed: Vec<String> = removals.iter().map(|e| e.snapshot_id.clone()).collect();
        if !options.dry_run && !removed.is_empty() {
            for snapshot_id in &removed {
                remove_dir_all_nofollow(&snapshot_dir(cache, snapshot_id))?;
                manifest.snapshots.remove(snapshot_id);
            }
            write_snapshots_manifest(cache, &mut manifest)?;
        }

        Ok(GcOutcome {
            dry_run: options.dry_run,
            removed,
            protected_by_tag: protected,
            stale_staging,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_tag_globs_match_release_patterns() {
        let globs = keep_tag_globs(&[
            "release/*".to_string(),
            "release".to_string(),
        ])
        .unwrap();
        assert!(globs.is_match("release"));
        assert!(globs.is_match("release/1.2"));
        assert!(!globs.is_match("nightly"));
    }

    #[test]
    fn sqlite_detection_requires_database_files() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!has_sqlite_artifact(tmp.path()));
        std::fs::write(tmp.path().join("notes.txt"), b"x").unwrap();
        assert!(!has_sqlite_artifact(tmp.path()));
        std::fs::write(tmp.path().join("index.sqlite3"), b"x").unwrap();
        assert!(has_sqlite_artifact(tmp.path()));
    }
}
