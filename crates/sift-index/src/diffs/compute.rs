use super::chunk::{compute_mode_diff, ModeDiffOptions, ModeDiffResult};
use super::events::{apply_event_bounds, event_counts, sort_events, DiffEvent, ModeSummary};
use super::registry::{
    diff_dir, load_diff_inputs, load_diff_summary, load_diffs_manifest, read_diff_events,
    sorted_diff_entries, write_diff_events, write_diff_inputs, write_diff_summary,
    write_diffs_manifest, DiffEndpoint, DiffInputs, DiffLimits, DiffManifestEntry, DiffSummary,
    DiffTotals,
};
use crate::refs::{redact_for_persistence, resolve_index_ref, ResolveOptions, ResolvedIndexRef};
use crate::snapshots::with_snapshot_lock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sift_core::{now_iso, sha1_hex, Error, IndexCacheDir, Mode, Result};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_MAX_CHANGED_FILES: usize = 200;
pub const DEFAULT_MAX_CHUNKS_PER_FILE: usize = 500;
pub const DEFAULT_MAX_EVENTS: usize = 20_000;
pub const DEFAULT_MAX_BYTES: usize = 2 * 1024 * 1024;
pub const DEFAULT_MAX_DIFFS: usize = 50;
pub const DEFAULT_RETAIN_DAYS: f64 = 30.0;

/// The two endpoints and modes to compare.
#[derive(Clone, Debug)]
pub struct DiffRequest {
    pub from: String,
    pub to: String,
    /// Modes to diff; empty selects `code`.
    pub modes: Vec<Mode>,
}

#[derive(Clone, Debug)]
pub struct DiffOptions {
    pub detect_renames: bool,
    pub include_relations: bool,
    pub max_changed_files: usize,
    pub max_chunks_per_file: usize,
    pub max_events: usize,
    pub max_bytes: usize,
    /// Record a configHash mismatch instead of failing on it.
    pub allow_mismatch: bool,
    pub persist: bool,
    /// Allow persisting diffs whose endpoints are raw path refs.
    pub persist_unsafe: bool,
    pub wait_ms: u64,
    pub dry_run: bool,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            detect_renames: true,
            include_relations: true,
            max_changed_files: DEFAULT_MAX_CHANGED_FILES,
            max_chunks_per_file: DEFAULT_MAX_CHUNKS_PER_FILE,
            max_events: DEFAULT_MAX_EVENTS,
            max_bytes: DEFAULT_MAX_BYTES,
            allow_mismatch: false,
            persist: true,
            persist_unsafe: false,
            wait_ms: 0,
            dry_run: false,
        }
    }
}

/// Per-mode compatibility comparison between the endpoints.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeCompat {
    #[serde(default)]
    pub from_config_hash: Option<String>,
    #[serde(default)]
    pub to_config_hash: Option<String>,
    pub config_hash_match: bool,
    #[serde(default)]
    pub from_tool_version: Option<String>,
    #[serde(default)]
    pub to_tool_version: Option<String>,
    pub tool_version_match: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatReport {
    pub config_hash_mismatch: bool,
    pub tool_version_mismatch: bool,
    #[serde(default)]
    pub by_mode: BTreeMap<String, ModeCompat>,
}

#[derive(Clone, Debug)]
pub struct DiffOutcome {
    pub diff_id: String,
    pub created_at: String,
    pub persisted: bool,
    pub reused: bool,
    pub path_ref_not_persisted: bool,
    pub inputs: DiffInputs,
    pub summary: DiffSummary,
    pub events: Vec<DiffEvent>,
    pub events_path: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DiffFormat {
    #[default]
    Summary,
    Jsonl,
}

#[derive(Clone, Debug)]
pub struct ShownDiff {
    pub entry: DiffManifestEntry,
    pub inputs: Option<DiffInputs>,
    pub summary: Option<DiffSummary>,
    pub events: Option<Vec<DiffEvent>>,
}

#[derive(Clone, Debug)]
pub struct DiffPruneOutcome {
    pub removed: Vec<String>,
    pub dry_run: bool,
}

/// Compare per-mode configHash and toolVersion between the endpoints.
fn compare_compat(
    from: &ResolvedIndexRef,
    to: &ResolvedIndexRef,
    modes: &[Mode],
) -> CompatReport {
    let mut report = CompatReport::default();
    for mode in modes {
        let from_config = from.config_hash_for(*mode).map(str::to_string);
        let to_config = to.config_hash_for(*mode).map(str::to_string);
        let from_tool = from.tool_version_for(*mode).map(str::to_string);
        let to_tool = to.tool_version_for(*mode).map(str::to_string);
        // Only a disagreement between two recorded values counts; an
        // endpoint with no recorded value (e.g. a bare path ref) is
        // unknown, not incompatible.
        let config_hash_match = match (&from_config, &to_config) {
            (Some(from), Some(to)) => from == to,
            _ => true,
        };
        let tool_version_match = match (&from_tool, &to_tool) {
            (Some(from), Some(to)) => from == to,
            _ => true,
        };
        if !config_hash_match {
            report.config_hash_mismatch = true;
        }
        if !tool_version_match {
            report.tool_version_mismatch = true;
        }
        report.by_mode.insert(
            mode.as_str().to_string(),
            ModeCompat {
                from_config_hash: from_config,
                to_config_hash: to_config,
                config_hash_match,
                from_tool_version: from_tool,
                to_tool_version: to_tool,
                tool_version_match,
            },
        );
    }
    report
}

fn build_endpoint(resolved: &ResolvedIndexRef, persist_unsafe: bool) -> DiffEndpoint {
    let (reference, redacted, path_hash) = if resolved.parsed.is_path() && persist_unsafe {
        match redact_for_persistence(&resolved.parsed, true) {
            Ok(redacted) => (redacted.r#ref, redacted.redacted, redacted.path_hash),
            Err(_) => (resolved.canonical.clone(), false, None),
        }
    } else {
        (resolved.canonical.clone(), false, None)
    };
    let build_id_by_mode = resolved
        .identity
        .get("buildIdByMode")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(mode, id)| id.as_str().map(|id| (mode.clone(), id.to_string())))
                .collect()
        })
        .unwrap_or_default();
    DiffEndpoint {
        r#ref: reference,
        redacted,
        path_hash,
        identity_hash: resolved.identity_hash.clone(),
        build_id_by_mode,
    }
}

/// Compute a structural diff between two resolved references.
///
/// Identical `(from, to, modes, options)` always yield the same diff id and
/// the same sorted event sequence. Persistence is skipped (but computation
/// is not) when a matching stored diff already exists.
pub fn compute_diff(
    cache: &IndexCacheDir,
    request: &DiffRequest,
    options: &DiffOptions,
) -> Result<DiffOutcome> {
    if request.from.trim().is_empty() || request.to.trim().is_empty() {
        return Err(Error::invalid_request("Both from and to refs are required."));
    }

    let mut modes: Vec<Mode> = if request.modes.is_empty() {
        vec![Mode::Code]
    } else {
        request.modes.clone()
    };
    modes.sort_by_key(|mode| mode.rank());
    modes.dedup();

    let resolve_options = ResolveOptions {
        prefer_frozen: true,
        allow_missing_modes: false,
    };
    let resolved_from = resolve_index_ref(cache, request.from.trim(), &modes, &resolve_options)?;
    let resolved_to = resolve_index_ref(cache, request.to.trim(), &modes, &resolve_options)?;

    let compat = compare_compat(&resolved_from, &resolved_to, &modes);
    if compat.config_hash_mismatch && !options.allow_mismatch {
        return Err(Error::invalid_request(
            "configHash mismatch between from and to. Use --allow-mismatch to continue.",
        ));
    }

    let canonical_options = json!({
        "detectRenames": options.detect_renames,
        "includeRelations": options.include_relations,
        "maxChangedFiles": options.max_changed_files,
        "maxChunksPerFile": options.max_chunks_per_file,
    });
    let canonical_inputs = json!({
        "version": 1,
        "kind": "semantic-v1",
        "from": {
            "ref": resolved_from.canonical,
            "identityHash": resolved_from.identity_hash,
            "identity": resolved_from.identity,
        },
        "to": {
            "ref": resolved_to.canonical,
            "identityHash": resolved_to.identity_hash,
            "identity": resolved_to.identity,
        },
        "modes": modes.iter().copied().map(Mode::as_str).collect::<Vec<_>>(),
        "options": canonical_options,
    });
    let identity_hash = sha1_hex(sift_core::canonical_json_string(&canonical_inputs));
    let diff_id = format!("diff_{}", &identity_hash[..16]);
    let created_at = now_iso();

    let mode_options = ModeDiffOptions {
        detect_renames: options.detect_renames,
        include_relations: options.include_relations,
        max_changed_files: options.max_changed_files,
        max_chunks_per_file: options.max_chunks_per_file,
    };
    let mut mode_results: Vec<ModeDiffResult> = Vec::new();
    for mode in &modes {
        let from_dir = resolved_from
            .index_dir_by_mode
            .get(mode)
            .ok_or_else(|| Error::not_found(format!("Missing resolved mode roots for {mode}.")))?;
        let to_dir = resolved_to
            .index_dir_by_mode
            .get(mode)
            .ok_or_else(|| Error::not_found(format!("Missing resolved mode roots for {mode}.")))?;
        mode_results.push(compute_mode_diff(*mode, from_dir, to_dir, &mode_options)?);
    }

    let fast_path = mode_results.iter().all(|result| result.fast_path);
    let mut all_events: Vec<DiffEvent> = mode_results
        .iter()
        .flat_map(|result| result.events.iter().cloned())
        .collect();
    sort_events(&mut all_events);
    let totals_by_kind = event_counts(&all_events);
    let all_count = all_events.len() as u64;
    let bounded = apply_event_bounds(all_events, options.max_events, options.max_bytes);

    let modes_summary: BTreeMap<String, ModeSummary> = mode_results
        .iter()
        .map(|result| (result.mode.as_str().to_string(), result.summary.clone()))
        .collect();

    let from_endpoint = build_endpoint(&resolved_from, options.persist_unsafe);
    let to_endpoint = build_endpoint(&resolved_to, options.persist_unsafe);

    let summary = DiffSummary {
        id: diff_id.clone(),
        created_at: created_at.clone(),
        from: from_endpoint.clone(),
        to: to_endpoint.clone(),
        modes: modes.iter().map(|m| m.as_str().to_string()).collect(),
        ordering_schema: "diff-events-v1".to_string(),
        fast_path,
        truncated: bounded.truncated,
        limits: DiffLimits {
            max_events: options.max_events as u64,
            max_bytes: options.max_bytes as u64,
            reason: bounded.reason.map(str::to_string),
        },
        totals: DiffTotals {
            all_events: all_count,
            emitted_events: bounded.events.len() as u64,
            by_kind: totals_by_kind,
        },
        modes_summary,
        compat: Some(compat),
    };
    let inputs = DiffInputs {
        id: diff_id.clone(),
        created_at: created_at.clone(),
        from: from_endpoint.clone(),
        to: to_endpoint.clone(),
        modes: summary.modes.clone(),
        allow_mismatch: options.allow_mismatch,
        identity_hash: identity_hash.clone(),
        options: canonical_options,
    };

    let has_path_inputs = resolved_from.parsed.is_path() || resolved_to.parsed.is_path();
    let path_ref_not_persisted = has_path_inputs && !options.persist_unsafe;
    let persist_enabled = options.persist && !options.dry_run && !path_ref_not_persisted;

    if !persist_enabled {
        return Ok(DiffOutcome {
            diff_id,
            created_at,
            persisted: false,
            reused: false,
            path_ref_not_persisted,
            inputs,
            summary,
            events: bounded.events,
            events_path: None,
        });
    }

    with_snapshot_lock(cache, options.wait_ms, "mutate diffs", |_lock| {
        let mut manifest = load_diffs_manifest(cache)?;
        if let Some(existing) = manifest.diffs.get(&diff_id) {
            let existing_inputs = load_diff_inputs(cache, &diff_id)?;
            match existing_inputs {
                Some(stored) if stored.identity_hash == identity_hash => {
                    let stored_summary = load_diff_summary(cache, &diff_id)?;
                    return Ok(DiffOutcome {
                        diff_id: diff_id.clone(),
                        created_at: existing
                            .created_at
                            .clone()
                            .unwrap_or_else(|| created_at.clone()),
                        persisted: true,
                        reused: true,
                        path_ref_not_persisted: false,
                        summary: stored_summary.unwrap_or_else(|| summary.clone()),
                        inputs: stored,
                        events: bounded.events.clone(),
                        events_path: existing.events_path.clone(),
                    });
                }
                _ => {
                    return Err(Error::internal(format!("diffId collision for {diff_id}.")));
                }
            }
        }

        write_diff_inputs(cache, &inputs)?;
        write_diff_summary(cache, &summary)?;
        write_diff_events(cache, &diff_id, &bounded.events)?;
        let events_rel = format!("diffs/{diff_id}/events.jsonl");
        let summary_rel = format!("diffs/{diff_id}/summary.json");

        manifest.diffs.insert(
            diff_id.clone(),
            DiffManifestEntry {
                id: diff_id.clone(),
                created_at: Some(created_at.clone()),
                from: Some(from_endpoint.clone()),
                to: Some(to_endpoint.clone()),
                modes: summary.modes.clone(),
                summary_path: Some(summary_rel),
                events_path: Some(events_rel.clone()),
                truncated: bounded.truncated,
                max_events: Some(options.max_events as u64),
                max_bytes: Some(options.max_bytes as u64),
            },
        );
        write_diffs_manifest(cache, &mut manifest)?;

        Ok(DiffOutcome {
            diff_id: diff_id.clone(),
            created_at: created_at.clone(),
            persisted: true,
            reused: false,
            path_ref_not_persisted: false,
            inputs: inputs.clone(),
            summary: summary.clone(),
            events: bounded.events.clone(),
            events_path: Some(events_rel),
        })
    })
}

/// Persisted diffs, most recent first; a mode filter keeps entries covering
/// every requested mode.
pub fn list_diffs(cache: &IndexCacheDir, modes: &[Mode]) -> Result<Vec<DiffManifestEntry>> {
    let manifest = load_diffs_manifest(cache)?;
    let entries = sorted_diff_entries(&manifest);
    if modes.is_empty() {
        return Ok(entries);
    }
    Ok(entries
        .into_iter()
        .filter(|entry| {
            modes
                .iter()
                .all(|mode| entry.modes.iter().any(|m| m == mode.as_str()))
        })
        .collect())
}

/// One persisted diff: entry, inputs, summary, and (for jsonl format) the
/// emitted events.
pub fn show_diff(
    cache: &IndexCacheDir,
    diff_id: &str,
    format: DiffFormat,
) -> Result<Option<ShownDiff>> {
    ensure_diff_id(diff_id)?;
    let manifest = load_diffs_manifest(cache)?;
    let Some(entry) = manifest.diffs.get(diff_id).cloned() else {
        return Ok(None);
    };
    let inputs = load_diff_inputs(cache, diff_id)?;
    let summary = load_diff_summary(cache, diff_id)?;
    let events = match format {
        DiffFormat::Summary => None,
        DiffFormat::Jsonl => Some(read_diff_events(cache, diff_id)?),
    };
    Ok(Some(ShownDiff {
        entry,
        inputs,
        summary,
        events,
    }))
}

/// Prune persisted diffs: keep the most recent `max_diffs`, plus anything
/// younger than `retain_days` (the age floor only extends retention).
pub fn prune_diffs(
    cache: &IndexCacheDir,
    max_diffs: usize,
    retain_days: Option<f64>,
    wait_ms: u64,
    dry_run: bool,
) -> Result<DiffPruneOutcome> {
    let cutoff_ms = retain_days.map(|days| {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        now_ms - (days.max(0.0) * 24.0 * 60.0 * 60.0 * 1000.0) as i64
    });

    with_snapshot_lock(cache, wait_ms, "mutate diffs", |_lock| {
        let mut manifest = load_diffs_manifest(cache)?;
        let entries = sorted_diff_entries(&manifest);
        let mut removed = Vec::new();
        for (index, entry) in entries.iter().enumerate() {
            let within_keep = index < max_diffs;
            let keep = match cutoff_ms {
                Some(cutoff) => within_keep || entry.created_at_ms() >= cutoff,
                None => within_keep,
            };
            if keep {
                continue;
            }
            removed.push(entry.id.clone());
            if !dry_run {
                remove_diff_dir(cache, &entry.id)?;
                manifest.diffs.remove(&entry.id);
            }
        }
        if !dry_run && !removed.is_empty() {
            write_diffs_manifest(cache, &mut manifest)?;
        }
        Ok(DiffPruneOutcome { removed, dry_run })
    })
}

fn remove_diff_dir(cache: &IndexCacheDir, diff_id: &str) -> Result<()> {
    match std::fs::remove_dir_all(diff_dir(cache, diff_id)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn ensure_diff_id(diff_id: &str) -> Result<()> {
    let valid = diff_id
        .strip_prefix("diff_")
        .is_some_and(|rest| {
            !rest.is_empty()
                && rest
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        });
    if !valid {
        return Err(Error::invalid_request(format!(
            "Invalid diff id \"{diff_id}\"."
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_id_grammar() {
        assert!(ensure_diff_id("diff_0123abcd0123abcd").is_ok());
        assert!(ensure_diff_id("diff_").is_err());
        assert!(ensure_diff_id("snap-x").is_err());
        assert!(ensure_diff_id("diff_has space").is_err());
    }
}
