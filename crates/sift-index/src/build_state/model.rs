use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sift_core::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const BUILD_STATE_FILE: &str = "build_state.json";
pub const STATE_SCHEMA_VERSION: u32 = 1;
pub const ORDERING_LEDGER_SCHEMA_VERSION: u32 = 1;
pub(crate) const STAGE_CHECKPOINTS_SIDECAR_VERSION: u32 = 1;

const STATE_PROGRESS_FILE: &str = "build_state.progress.json";
const STATE_EVENTS_FILE: &str = "build_state.events.jsonl";
const STATE_DELTAS_FILE: &str = "build_state.deltas.jsonl";
const STAGE_CHECKPOINTS_INDEX_FILE: &str = "stage_checkpoints.v1.index.json";

pub(crate) fn state_path(build_root: &Path) -> PathBuf {
    build_root.join(BUILD_STATE_FILE)
}

pub(crate) fn progress_path(build_root: &Path) -> PathBuf {
    build_root.join(STATE_PROGRESS_FILE)
}

pub(crate) fn events_path(build_root: &Path) -> PathBuf {
    build_root.join(STATE_EVENTS_FILE)
}

pub(crate) fn deltas_path(build_root: &Path) -> PathBuf {
    build_root.join(STATE_DELTAS_FILE)
}

pub(crate) fn checkpoint_index_path(build_root: &Path) -> PathBuf {
    build_root.join(STAGE_CHECKPOINTS_INDEX_FILE)
}

pub(crate) fn checkpoint_mode_path(build_root: &Path, mode: &str) -> PathBuf {
    build_root.join(format!("stage_checkpoints.v1.{mode}.json"))
}

/// Typed read view over a build's `build_state.json`.
///
/// Decoding is deliberately permissive: every field is optional or
/// defaulted, and unknown top-level fields are preserved in `extra` so a
/// read-modify-write cycle never drops data written by a newer tool.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildState {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub build_id: Option<String>,
    #[serde(default)]
    pub build_root: Option<String>,
    #[serde(default)]
    pub repo_root: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub modes: Option<Vec<String>>,
    #[serde(default)]
    pub current_phase: Option<String>,
    #[serde(default)]
    pub tool: Option<ToolInfo>,
    #[serde(default)]
    pub signature_version: Option<i64>,
    #[serde(default)]
    pub config_hash: Option<String>,
    #[serde(default)]
    pub repo: Option<Value>,
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseState>,
    #[serde(default)]
    pub progress: BTreeMap<String, ModeProgress>,
    #[serde(default)]
    pub counts: BTreeMap<String, Value>,
    #[serde(default)]
    pub signatures: BTreeMap<String, Value>,
    #[serde(default)]
    pub stage_checkpoints: BTreeMap<String, Value>,
    #[serde(default)]
    pub ordering_ledger: Option<OrderingLedger>,
    #[serde(default)]
    pub ignore: BTreeMap<String, Value>,
    #[serde(default)]
    pub validation: Option<BuildValidation>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseState {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub detail: Option<Value>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeProgress {
    #[serde(default)]
    pub processed_files: Option<i64>,
    #[serde(default)]
    pub total_files: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Self-reported build validation verdict; snapshot creation refuses any
/// mode whose state does not carry `validation.ok == true`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildValidation {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub issues: Vec<Value>,
}

/// Deterministic-ordering provenance: seed inputs plus per-stage artifact
/// hashes, merged structurally (seeds shallow, per-stage seeds/artifacts one
/// level deeper).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderingLedger {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub seeds: Map<String, Value>,
    #[serde(default)]
    pub stages: BTreeMap<String, StageLedger>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageLedger {
    #[serde(default)]
    pub seeds: Map<String, Value>,
    #[serde(default)]
    pub artifacts: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BuildState {
    pub fn from_value(value: Value) -> Option<BuildState> {
        serde_json::from_value(value).ok()
    }

    pub fn tool_version(&self) -> Option<&str> {
        self.tool.as_ref().and_then(|tool| tool.version.as_deref())
    }

    pub fn validation_ok(&self) -> bool {
        self.validation.as_ref().is_some_and(|v| v.ok)
    }
}

/// Read a build root's `build_state.json` without going through the store.
///
/// Missing files are `Ok(None)`; malformed JSON is tolerated the same way
/// (logged, `Ok(None)`) since every caller treats the state as advisory.
pub fn read_build_state_file(build_root: &Path) -> Result<Option<BuildState>> {
    let path = state_path(build_root);
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    match serde_json::from_slice(&bytes) {
        Ok(state) => Ok(Some(state)),
        Err(err) => {
            tracing::debug!(
                target = "sift.build_state",
                path = %path.display(),
                error = %err,
                "failed to decode build_state.json; treating as missing"
            );
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let raw = json!({
            "schemaVersion": 1,
            "buildId": "b1",
            "futureField": {"x": 1},
            "validation": {"ok": true, "issues": []}
        });
        let state: BuildState = serde_json::from_value(raw).unwrap();
        assert!(state.validation_ok());
        assert_eq!(state.extra["futureField"]["x"], 1);
        let back = serde_json::to_value(&state).unwrap();
        assert_eq!(back["futureField"]["x"], 1);
    }

    #[test]
    fn missing_validation_is_not_ok() {
        let state = BuildState::default();
        assert!(!state.validation_ok());
    }
}
