use super::logs;
use super::merge::{merge_keyed_map, merge_state};
use super::model::{
    checkpoint_index_path, checkpoint_mode_path, deltas_path, events_path, progress_path,
    state_path, BuildState, ORDERING_LEDGER_SCHEMA_VERSION, STAGE_CHECKPOINTS_SIDECAR_VERSION,
    STATE_SCHEMA_VERSION,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sift_core::{now_iso, sha1_hex, Error, Result};
use sift_storage::atomic_write_text;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const STATE_CACHE_MAX_ENTRIES: usize = 64;

/// Policy controlling whether a failed durable write aborts the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Durability {
    /// Write failures are logged and recorded per build root; the operation
    /// continues. The default for hot-path progress flushes.
    #[default]
    BestEffort,
    /// A write failure raises a typed error aborting the call.
    Required,
}

/// A merge-patch against one build's state document.
///
/// Top-level fields merge shallowly; `phases`/`progress`/`heartbeat`/
/// `counts`/`signatures`/`stageCheckpoints`/`ignore` merge per key one
/// level deep; `orderingLedger` merges structurally.
#[derive(Clone, Debug, Default)]
pub struct StatePatch {
    fields: Map<String, Value>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Set an arbitrary top-level field.
    pub fn set(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn stage(self, stage: &str) -> Self {
        self.set("stage", Value::from(stage))
    }

    pub fn validation(self, ok: bool, issues: Vec<Value>) -> Self {
        self.set("validation", json!({"ok": ok, "issues": issues}))
    }

    pub fn heartbeat(self, stage: Option<&str>) -> Self {
        self.set(
            "heartbeat",
            json!({"stage": stage, "lastHeartbeatAt": now_iso()}),
        )
    }

    pub fn progress(mut self, mode: &str, processed_files: i64, total_files: Option<i64>) -> Self {
        let entry = json!({
            "processedFiles": processed_files,
            "totalFiles": total_files,
            "updatedAt": now_iso(),
        });
        let progress = self
            .fields
            .entry("progress".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(map) = progress.as_object_mut() {
            map.insert(mode.to_string(), entry);
        }
        self
    }

    pub fn stage_checkpoint(mut self, mode: &str, stage: &str, summary: Value) -> Self {
        let checkpoints = self
            .fields
            .entry("stageCheckpoints".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(map) = checkpoints.as_object_mut() {
            let mode_entry = map
                .entry(mode.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(mode_map) = mode_entry.as_object_mut() {
                mode_map.insert(stage.to_string(), summary);
            }
        }
        self
    }

    /// Record ordering seed inputs, optionally scoped to a `stage:mode` key.
    pub fn ordering_seeds(self, seeds: Value, stage_key: Option<&str>) -> Self {
        let mut ledger = json!({
            "schemaVersion": ORDERING_LEDGER_SCHEMA_VERSION,
            "seeds": seeds,
        });
        if let Some(stage_key) = stage_key {
            ledger["stages"] = json!({stage_key: {"seeds": ledger["seeds"].clone()}});
        }
        self.set("orderingLedger", ledger)
    }

    /// Record one stage artifact's ordering hash.
    pub fn ordering_artifact(self, stage_key: &str, artifact: &str, entry: Value) -> Self {
        self.set(
            "orderingLedger",
            json!({
                "schemaVersion": ORDERING_LEDGER_SCHEMA_VERSION,
                "stages": {stage_key: {"artifacts": {artifact: entry}}},
            }),
        )
    }

    fn into_fields(self) -> Map<String, Value> {
        self.fields
    }
}

/// A structured event appended to the build's event log.
#[derive(Clone, Debug)]
pub struct StateEvent {
    pub at: String,
    pub kind: String,
    pub fields: Map<String, Value>,
}

impl StateEvent {
    pub fn new(kind: &str) -> Self {
        Self {
            at: now_iso(),
            kind: kind.to_string(),
            fields: Map::new(),
        }
    }

    pub fn field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn phase(phase: &str, status: &str, detail: Option<&str>) -> Self {
        Self::new("phase")
            .field("phase", Value::from(phase))
            .field("status", Value::from(status))
            .field("detail", detail.map(Value::from).unwrap_or(Value::Null))
    }

    fn to_value(&self) -> Value {
        let mut out = Map::new();
        out.insert("at".to_string(), Value::from(self.at.clone()));
        out.insert("type".to_string(), Value::from(self.kind.clone()));
        for (key, value) in &self.fields {
            out.insert(key.clone(), value.clone());
        }
        Value::Object(out)
    }
}

/// Recorded best-effort write failures for one build root.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteFailure {
    pub count: u64,
    pub last_at: Option<String>,
    pub message: Option<String>,
}

/// Inputs for creating a fresh build state document.
#[derive(Clone, Debug, Default)]
pub struct InitBuildState {
    pub build_id: String,
    pub repo_root: Option<PathBuf>,
    pub modes: Vec<String>,
    pub stage: Option<String>,
    pub config_hash: Option<String>,
    pub tool_version: Option<String>,
    pub signature_version: Option<i64>,
    pub repo_provenance: Option<Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FileFingerprint {
    mtime_ms: u128,
    size: u64,
}

fn read_fingerprint(path: &Path) -> Option<FileFingerprint> {
    let meta = std::fs::metadata(path).ok()?;
    let mtime_ms = meta
        .modified()
        .ok()?
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?
        .as_millis();
    Some(FileFingerprint {
        mtime_ms,
        size: meta.len(),
    })
}

#[derive(Clone, Debug, Default)]
struct CacheEntry {
    state: Option<Map<String, Value>>,
    state_fingerprint: Option<FileFingerprint>,
    last_comparable_hash: Option<String>,
    progress: Option<Map<String, Value>>,
    progress_fingerprint: Option<FileFingerprint>,
    progress_hash: Option<String>,
    checkpoints: Option<Map<String, Value>>,
    checkpoints_fingerprint: Option<FileFingerprint>,
}

/// Bounded per-root cache with least-recently-used eviction and a pin for
/// the active build so it is never dropped mid-flight.
#[derive(Debug, Default)]
struct BoundedCache {
    map: HashMap<PathBuf, CacheEntry>,
    order: VecDeque<PathBuf>,
}

impl BoundedCache {
    fn touch(&mut self, key: &Path) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_path_buf());
    }

    fn entry_mut(&mut self, key: &Path, pinned: Option<&Path>) -> &mut CacheEntry {
        if !self.map.contains_key(key) {
            self.map.insert(key.to_path_buf(), CacheEntry::default());
        }
        self.touch(key);
        while self.map.len() > STATE_CACHE_MAX_ENTRIES {
            let Some(candidate) = self.order.front().cloned() else {
                break;
            };
            if pinned.is_some_and(|p| p == candidate) || candidate == key {
                // Move the pinned key off the eviction edge and try the next
                // oldest; if everything left is pinned, stop evicting.
                self.order.pop_front();
                self.order.push_back(candidate);
                if self.order.iter().all(|k| {
                    pinned.is_some_and(|p| p == *k) || *k == key
                }) {
                    break;
                }
                continue;
            }
            self.order.pop_front();
            self.map.remove(&candidate);
        }
        self.map.get_mut(key).expect("entry just inserted")
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    caches: BoundedCache,
    active: Option<PathBuf>,
    failures: HashMap<PathBuf, WriteFailure>,
}

/// The build state store service.
///
/// Owns the per-root fingerprint caches and write-failure records; callers
/// hold one instance per process (typically per indexing run).
#[derive(Debug, Default)]
pub struct BuildStateStore {
    inner: Mutex<StoreInner>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckpointIndexEntry {
    path: String,
    #[serde(default)]
    updated_at: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckpointIndex {
    version: u32,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    modes: BTreeMap<String, CheckpointIndexEntry>,
}

impl BuildStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin a build root so its cache entry is never evicted while the build
    /// is in flight.
    pub fn set_active(&self, build_root: Option<&Path>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.active = build_root.map(resolve_key);
    }

    /// Recorded best-effort write failures for a build root.
    pub fn write_failures(&self, build_root: &Path) -> Option<WriteFailure> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.failures.get(&resolve_key(build_root)).cloned()
    }

    /// Create the build root and write the initial state document.
    pub fn init(&self, build_root: &Path, init: &InitBuildState) -> Result<PathBuf> {
        let now = now_iso();
        let payload = json!({
            "schemaVersion": STATE_SCHEMA_VERSION,
            "buildId": init.build_id,
            "buildRoot": build_root.to_string_lossy(),
            "repoRoot": init.repo_root.as_ref().map(|p| p.to_string_lossy().to_string()),
            "createdAt": now,
            "updatedAt": now,
            "startedAt": now,
            "finishedAt": Value::Null,
            "stage": init.stage,
            "modes": init.modes,
            "currentPhase": Value::Null,
            "tool": {"version": init.tool_version},
            "signatureVersion": init.signature_version,
            "configHash": init.config_hash,
            "repo": init.repo_provenance,
            "phases": {},
            "progress": {},
        });
        std::fs::create_dir_all(build_root)?;
        let path = state_path(build_root);
        sift_storage::atomic_write_json(&path, &payload)?;
        Ok(path)
    }

    /// Apply a merge-patch, persist the result, and append the supplied
    /// events. Returns `Ok(None)` when the build root no longer exists (the
    /// build was pruned mid-flight).
    pub fn apply_patch(
        &self,
        build_root: &Path,
        patch: StatePatch,
        events: &[StateEvent],
        durability: Durability,
    ) -> Result<Option<BuildState>> {
        if !build_root.exists() {
            return Ok(None);
        }
        let key = resolve_key(build_root);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let mut fields = patch.into_fields();
        let progress_patch = fields
            .remove("progress")
            .and_then(|v| v.as_object().cloned());
        let checkpoints_patch = fields
            .remove("stageCheckpoints")
            .and_then(|v| v.as_object().cloned());
        let main_patch = fields;

        // Synthesized events for checkpoint flushes, matching the event the
        // indexer expects to see per (mode, stage) summary.
        let mut all_events: Vec<Value> = events.iter().map(StateEvent::to_value).collect();
        if let Some(checkpoints) = &checkpoints_patch {
            let at = now_iso();
            for (mode, stages) in checkpoints {
                let Some(stages) = stages.as_object() else {
                    continue;
                };
                for (stage, summary) in stages {
                    let count = summary
                        .get("checkpoints")
                        .and_then(Value::as_array)
                        .map(|list| list.len());
                    all_events.push(json!({
                        "at": summary.get("generatedAt").cloned().unwrap_or_else(|| Value::from(at.clone())),
                        "type": "checkpoint",
                        "mode": mode,
                        "stage": stage,
                        "checkpointCount": count,
                    }));
                }
            }
        }

        let deltas = logs::delta_entries(
            &main_patch,
            progress_patch.as_ref(),
            checkpoints_patch.as_ref(),
        );

        // Load current state through the fingerprint cache.
        let active = inner.active.clone();
        let entry = inner.caches.entry_mut(&key, active.as_deref());
        let mut state = load_state_cached(build_root, entry);
        ensure_versions(&mut state, build_root);
        hydrate_defaults(&mut state, build_root);

        let mut write_errors: Vec<(String, Error)> = Vec::new();

        // Progress sidecar.
        if let Some(progress) = &progress_patch {
            let base = load_progress_cached(build_root, entry)
                .or_else(|| state.get("progress").and_then(|v| v.as_object().cloned()))
                .unwrap_or_default();
            let merged = merge_keyed_map(Some(&Value::Object(base)), &Value::Object(progress.clone()));
            let merged_map = merged.as_object().cloned().unwrap_or_default();
            let serialized = Value::Object(merged_map.clone()).to_string();
            let hash = sha1_hex(&serialized);
            if entry.progress_hash.as_deref() != Some(hash.as_str()) {
                match atomic_write_text(&progress_path(build_root), &serialized) {
                    Ok(()) => {
                        entry.progress_fingerprint = read_fingerprint(&progress_path(build_root));
                        entry.progress_hash = Some(hash);
                    }
                    Err(err) => write_errors.push(("build_state.progress.json".to_string(), err)),
                }
            }
            entry.progress = Some(merged_map);
        }

        // Stage checkpoint shards.
        if let Some(checkpoints) = &checkpoints_patch {
            let base = load_checkpoints_cached(build_root, entry)
                .or_else(|| {
                    state
                        .get("stageCheckpoints")
                        .and_then(|v| v.as_object().cloned())
                })
                .unwrap_or_default();
            let merged = merge_keyed_map(
                Some(&Value::Object(base)),
                &Value::Object(checkpoints.clone()),
            );
            let merged_map = merged.as_object().cloned().unwrap_or_default();
            match write_checkpoint_shards(build_root, checkpoints, &merged_map) {
                Ok(()) => {
                    entry.checkpoints_fingerprint =
                        read_fingerprint(&checkpoint_index_path(build_root));
                    entry.checkpoints = Some(merged_map);
                }
                Err(err) => write_errors.push(("stage checkpoints".to_string(), err)),
            }
        }

        // Main state document, with content-addressed no-op suppression.
        let mut merged_state = state;
        if !main_patch.is_empty() {
            merged_state = merge_state(&merged_state, &main_patch);
            // The sidecar owns checkpoint payloads; the main document never
            // duplicates them.
            merged_state.remove("stageCheckpoints");
            let comparable = comparable_hash(&merged_state);
            if entry.last_comparable_hash.as_deref() != Some(comparable.as_str()) {
                merged_state.insert("updatedAt".to_string(), Value::from(now_iso()));
                match sift_storage::atomic_write_json(
                    &state_path(build_root),
                    &Value::Object(merged_state.clone()),
                ) {
                    Ok(()) => {
                        entry.state_fingerprint = read_fingerprint(&state_path(build_root));
                        entry.last_comparable_hash = Some(comparable);
                    }
                    Err(err) => write_errors.push(("build_state.json".to_string(), err)),
                }
            } else {
                entry.last_comparable_hash = Some(comparable);
            }
            entry.state = Some(merged_state.clone());
        }

        if !all_events.is_empty() {
            if let Err(err) = logs::append_events(&events_path(build_root), &all_events) {
                write_errors.push(("build_state.events.jsonl".to_string(), err));
            }
        }
        if !deltas.is_empty() {
            if let Err(err) = logs::append_deltas(&deltas_path(build_root), &deltas, &merged_state)
            {
                write_errors.push(("build_state.deltas.jsonl".to_string(), err));
            }
        }

        for (target, err) in &write_errors {
            let failure = inner.failures.entry(key.clone()).or_default();
            failure.count += 1;
            failure.last_at = Some(now_iso());
            failure.message = Some(format!("{target}: {err}"));
            tracing::warn!(
                target = "sift.build_state",
                build_root = %key.display(),
                write_target = %target,
                error = %err,
                "build state write failed"
            );
        }
        if durability == Durability::Required {
            if let Some((target, err)) = write_errors.into_iter().next() {
                return Err(Error::internal(format!(
                    "build state write failed for {target}: {err}"
                )));
            }
        }

        match BuildState::from_value(Value::Object(merged_state)) {
            Some(typed) => Ok(Some(typed)),
            None => Err(Error::internal("merged build state failed to decode")),
        }
    }

    /// Transition a build phase, stamping start/finish times and appending a
    /// `phase` event.
    pub fn mark_phase(
        &self,
        build_root: &Path,
        phase: &str,
        status: &str,
        detail: Option<&str>,
    ) -> Result<Option<BuildState>> {
        if !build_root.exists() {
            return Ok(None);
        }
        let now = now_iso();
        let current = read_state_raw(build_root).unwrap_or_default();
        let existing = current
            .get("phases")
            .and_then(|phases| phases.get(phase))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let mut next = existing.clone();
        next.insert("status".to_string(), Value::from(status));
        if let Some(detail) = detail {
            next.insert("detail".to_string(), Value::from(detail));
        }
        next.insert("updatedAt".to_string(), Value::from(now.clone()));
        if status == "running" && !existing.contains_key("startedAt") {
            next.insert("startedAt".to_string(), Value::from(now.clone()));
        }
        let terminal = status == "done" || status == "failed";
        if terminal {
            next.insert("finishedAt".to_string(), Value::from(now.clone()));
        }

        let mut patch = StatePatch::new()
            .set("currentPhase", Value::from(phase))
            .set("phases", json!({phase: Value::Object(next)}));
        if terminal && phase == "promote" {
            patch = patch.set("finishedAt", Value::from(now));
        }

        self.apply_patch(
            build_root,
            patch,
            &[StateEvent::phase(phase, status, detail)],
            Durability::BestEffort,
        )
    }

    /// Flush per-mode file progress.
    pub fn record_progress(
        &self,
        build_root: &Path,
        mode: &str,
        processed_files: i64,
        total_files: Option<i64>,
    ) -> Result<Option<BuildState>> {
        self.apply_patch(
            build_root,
            StatePatch::new().progress(mode, processed_files, total_files),
            &[],
            Durability::BestEffort,
        )
    }

    /// Current merged view (state plus sidecars), read-only.
    pub fn load(&self, build_root: &Path) -> Result<Option<BuildState>> {
        if !build_root.exists() {
            return Ok(None);
        }
        let key = resolve_key(build_root);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let active = inner.active.clone();
        let entry = inner.caches.entry_mut(&key, active.as_deref());
        let mut state = load_state_cached(build_root, entry);
        if let Some(progress) = load_progress_cached(build_root, entry) {
            state.insert("progress".to_string(), Value::Object(progress));
        }
        if let Some(checkpoints) = load_checkpoints_cached(build_root, entry) {
            state.insert("stageCheckpoints".to_string(), Value::Object(checkpoints));
        }
        if state.is_empty() {
            return Ok(None);
        }
        Ok(BuildState::from_value(Value::Object(state)))
    }
}

fn resolve_key(build_root: &Path) -> PathBuf {
    build_root
        .canonicalize()
        .unwrap_or_else(|_| build_root.to_path_buf())
}

fn read_state_raw(build_root: &Path) -> Option<Map<String, Value>> {
    let bytes = std::fs::read(state_path(build_root)).ok()?;
    serde_json::from_slice::<Value>(&bytes)
        .ok()
        .and_then(|value| value.as_object().cloned())
}

fn load_state_cached(build_root: &Path, entry: &mut CacheEntry) -> Map<String, Value> {
    let fingerprint = read_fingerprint(&state_path(build_root));
    if fingerprint.is_some()
        && fingerprint == entry.state_fingerprint
        && entry.state.is_some()
    {
        return entry.state.clone().unwrap_or_default();
    }
    let parsed = read_state_raw(build_root).unwrap_or_default();
    entry.state = Some(parsed.clone());
    entry.state_fingerprint = fingerprint;
    entry.last_comparable_hash = if parsed.is_empty() {
        None
    } else {
        Some(comparable_hash(&parsed))
    };
    parsed
}

fn load_progress_cached(build_root: &Path, entry: &mut CacheEntry) -> Option<Map<String, Value>> {
    let path = progress_path(build_root);
    let fingerprint = read_fingerprint(&path);
    if fingerprint.is_some()
        && fingerprint == entry.progress_fingerprint
        && entry.progress.is_some()
    {
        return entry.progress.clone();
    }
    let bytes = std::fs::read(&path).ok()?;
    let parsed = serde_json::from_slice::<Value>(&bytes)
        .ok()
        .and_then(|value| value.as_object().cloned())?;
    entry.progress = Some(parsed.clone());
    entry.progress_fingerprint = fingerprint;
    entry.progress_hash = Some(sha1_hex(Value::Object(parsed.clone()).to_string()));
    Some(parsed)
}

fn load_checkpoints_cached(
    build_root: &Path,
    entry: &mut CacheEntry,
) -> Option<Map<String, Value>> {
    let index_path = checkpoint_index_path(build_root);
    let fingerprint = read_fingerprint(&index_path);
    if fingerprint.is_some()
        && fingerprint == entry.checkpoints_fingerprint
        && entry.checkpoints.is_some()
    {
        return entry.checkpoints.clone();
    }
    let index: CheckpointIndex =
        serde_json::from_slice(&std::fs::read(&index_path).ok()?).ok()?;
    if index.version != STAGE_CHECKPOINTS_SIDECAR_VERSION {
        return None;
    }
    let mut merged = Map::new();
    for (mode, descriptor) in &index.modes {
        if !sift_core::is_manifest_path_safe(&descriptor.path) {
            continue;
        }
        let mode_path = build_root.join(sift_core::from_posix(&descriptor.path));
        let Ok(bytes) = std::fs::read(&mode_path) else {
            continue;
        };
        if let Some(payload) = serde_json::from_slice::<Value>(&bytes)
            .ok()
            .filter(Value::is_object)
        {
            merged.insert(mode.clone(), payload);
        }
    }
    entry.checkpoints = Some(merged.clone());
    entry.checkpoints_fingerprint = fingerprint;
    Some(merged)
}

/// Persist checkpoint payloads by mode so a flush rewrites only the slices
/// that changed.
fn write_checkpoint_shards(
    build_root: &Path,
    patch: &Map<String, Value>,
    merged: &Map<String, Value>,
) -> Result<()> {
    let index_path = checkpoint_index_path(build_root);
    let mut index: CheckpointIndex = std::fs::read(&index_path)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .filter(|index: &CheckpointIndex| index.version == STAGE_CHECKPOINTS_SIDECAR_VERSION)
        .unwrap_or(CheckpointIndex {
            version: STAGE_CHECKPOINTS_SIDECAR_VERSION,
            updated_at: None,
            modes: BTreeMap::new(),
        });

    let now = now_iso();
    // First flush writes every merged mode so the index is complete; later
    // flushes touch only the patched modes.
    let modes: Vec<&String> = if index.modes.is_empty() {
        merged.keys().collect()
    } else {
        patch.keys().collect()
    };

    for mode in modes {
        let Some(payload) = merged.get(mode).filter(|v| v.is_object()) else {
            continue;
        };
        let mode_path = checkpoint_mode_path(build_root, mode);
        let serialized = format!("{payload}\n");
        let existing = std::fs::read_to_string(&mode_path).ok();
        if existing.as_deref() != Some(serialized.as_str()) {
            atomic_write_text(&mode_path, &serialized)?;
        }
        index.modes.insert(
            mode.clone(),
            CheckpointIndexEntry {
                path: mode_path
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_default(),
                updated_at: Some(now.clone()),
            },
        );
    }
    index.updated_at = Some(now);
    sift_storage::atomic_write_json(&index_path, &index)?;
    Ok(())
}

fn ensure_versions(state: &mut Map<String, Value>, build_root: &Path) {
    let loaded = !state.is_empty();
    if loaded && state.get("schemaVersion").and_then(Value::as_u64).is_none() {
        tracing::warn!(
            target = "sift.build_state",
            build_root = %build_root.display(),
            "build_state missing schemaVersion"
        );
    }
    if state.get("schemaVersion").and_then(Value::as_u64).is_none() {
        state.insert(
            "schemaVersion".to_string(),
            Value::from(STATE_SCHEMA_VERSION),
        );
    }
}

fn hydrate_defaults(state: &mut Map<String, Value>, build_root: &Path) {
    let resolved = resolve_key(build_root);
    if state.get("buildId").and_then(Value::as_str).is_none() {
        if let Some(name) = resolved.file_name() {
            state.insert(
                "buildId".to_string(),
                Value::from(name.to_string_lossy().to_string()),
            );
        }
    }
    if state.get("buildRoot").and_then(Value::as_str).is_none() {
        state.insert(
            "buildRoot".to_string(),
            Value::from(resolved.to_string_lossy().to_string()),
        );
    }
}

/// Stable hash of the state with volatile fields stripped; equal hashes mean
/// the write can be skipped entirely.
fn comparable_hash(state: &Map<String, Value>) -> String {
    let mut stripped = state.clone();
    stripped.insert("updatedAt".to_string(), Value::Null);
    sift_core::stable_hash(&Value::Object(stripped))
}
