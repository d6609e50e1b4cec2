use super::events::{DiffEvent, ModeSummary};
use super::compute::CompatReport;
use serde::{Deserialize, Serialize};
use sift_core::{now_iso, parse_iso_ms, Error, IndexCacheDir, Result};
use sift_storage::{atomic_write_json, atomic_write_text};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Registry of persisted diffs, analogous to the snapshots manifest but
/// with no tag index.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffsManifest {
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub diffs: BTreeMap<String, DiffManifestEntry>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffManifestEntry {
    pub id: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub from: Option<DiffEndpoint>,
    #[serde(default)]
    pub to: Option<DiffEndpoint>,
    #[serde(default)]
    pub modes: Vec<String>,
    #[serde(default)]
    pub summary_path: Option<String>,
    #[serde(default)]
    pub events_path: Option<String>,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub max_events: Option<u64>,
    #[serde(default)]
    pub max_bytes: Option<u64>,
}

impl DiffManifestEntry {
    pub(crate) fn created_at_ms(&self) -> i64 {
        self.created_at
            .as_deref()
            .and_then(parse_iso_ms)
            .unwrap_or(0)
    }
}

/// One endpoint of a diff as recorded in inputs/summary documents.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffEndpoint {
    pub r#ref: String,
    #[serde(default)]
    pub redacted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_hash: Option<String>,
    pub identity_hash: String,
    #[serde(default)]
    pub build_id_by_mode: BTreeMap<String, String>,
}

/// The persisted `inputs.json`: everything that went into the diff id.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffInputs {
    pub id: String,
    pub created_at: String,
    pub from: DiffEndpoint,
    pub to: DiffEndpoint,
    pub modes: Vec<String>,
    #[serde(default)]
    pub allow_mismatch: bool,
    pub identity_hash: String,
    pub options: serde_json::Value,
}

/// The persisted `summary.json`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSummary {
    pub id: String,
    pub created_at: String,
    pub from: DiffEndpoint,
    pub to: DiffEndpoint,
    pub modes: Vec<String>,
    pub ordering_schema: String,
    #[serde(default)]
    pub fast_path: bool,
    #[serde(default)]
    pub truncated: bool,
    pub limits: DiffLimits,
    pub totals: DiffTotals,
    #[serde(default)]
    pub modes_summary: BTreeMap<String, ModeSummary>,
    #[serde(default)]
    pub compat: Option<CompatReport>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffLimits {
    pub max_events: u64,
    pub max_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Always computed over the untruncated event set.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffTotals {
    pub all_events: u64,
    pub emitted_events: u64,
    #[serde(default)]
    pub by_kind: BTreeMap<String, u64>,
}

pub(crate) fn diff_dir(cache: &IndexCacheDir, diff_id: &str) -> PathBuf {
    cache.diffs_dir().join(diff_id)
}

pub(crate) fn load_diffs_manifest(cache: &IndexCacheDir) -> Result<DiffsManifest> {
    let path = cache.diffs_manifest_path();
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(DiffsManifest::default())
        }
        Err(err) => return Err(err.into()),
    };
    serde_json::from_slice(&bytes)
        .map_err(|err| Error::invalid_request(format!("Invalid diffs/manifest.json: {err}")))
}

pub(crate) fn write_diffs_manifest(
    cache: &IndexCacheDir,
    manifest: &mut DiffsManifest,
) -> Result<()> {
    manifest.version = Some(manifest.version.unwrap_or(1));
    manifest.updated_at = Some(now_iso());
    atomic_write_json(&cache.diffs_manifest_path(), manifest)
}

pub(crate) fn load_diff_inputs(cache: &IndexCacheDir, diff_id: &str) -> Result<Option<DiffInputs>> {
    read_optional(diff_dir(cache, diff_id).join("inputs.json"))
}

pub(crate) fn load_diff_summary(
    cache: &IndexCacheDir,
    diff_id: &str,
) -> Result<Option<DiffSummary>> {
    read_optional(diff_dir(cache, diff_id).join("summary.json"))
}

fn read_optional<T: for<'de> Deserialize<'de>>(path: PathBuf) -> Result<Option<T>> {
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|err| Error::invalid_request(format!("Invalid {}: {err}", path.display())))
}

pub(crate) fn write_diff_inputs(cache: &IndexCacheDir, inputs: &DiffInputs) -> Result<()> {
    atomic_write_json(&diff_dir(cache, &inputs.id).join("inputs.json"), inputs)
}

pub(crate) fn write_diff_summary(cache: &IndexCacheDir, summary: &DiffSummary) -> Result<()> {
    atomic_write_json(&diff_dir(cache, &summary.id).join("summary.json"), summary)
}

pub(crate) fn write_diff_events(
    cache: &IndexCacheDir,
    diff_id: &str,
    events: &[DiffEvent],
) -> Result<PathBuf> {
    let path = diff_dir(cache, diff_id).join("events.jsonl");
    let mut payload = String::new();
    for event in events {
        payload.push_str(&serde_json::to_string(event)?);
        payload.push('\n');
    }
    atomic_write_text(&path, &payload)?;
    Ok(path)
}

pub(crate) fn read_diff_events(cache: &IndexCacheDir, diff_id: &str) -> Result<Vec<DiffEvent>> {
    let path = diff_dir(cache, diff_id).join("events.jsonl");
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut events = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        events.push(serde_json::from_str(trimmed).map_err(|err| {
            Error::invalid_request(format!("Invalid diff event line in {}: {err}", path.display()))
        })?);
    }
    Ok(events)
}

/// Manifest entries sorted most-recent first (id tiebreak).
pub(crate) fn sorted_diff_entries(manifest: &DiffsManifest) -> Vec<DiffManifestEntry> {
    let mut entries: Vec<DiffManifestEntry> = manifest.diffs.values().cloned().collect();
    entries.sort_by(|left, right| {
        right
            .created_at_ms()
            .cmp(&left.created_at_ms())
            .then_with(|| left.id.cmp(&right.id))
    });
    entries
}
