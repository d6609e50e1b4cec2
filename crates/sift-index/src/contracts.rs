//! Contract checks for documents we persist on behalf of other tools.
//!
//! `frozen.json` is consumed by resolvers in other processes (and other
//! versions of this tool), so it is validated before it is ever written.

use crate::snapshots::FrozenRecord;

/// Result of a contract validation pass.
#[derive(Clone, Debug, Default)]
pub struct Validation {
    pub ok: bool,
    pub errors: Vec<String>,
}

impl Validation {
    fn failed(errors: Vec<String>) -> Self {
        Self { ok: false, errors }
    }

    fn passed() -> Self {
        Self {
            ok: true,
            errors: Vec::new(),
        }
    }
}

const SNAPSHOT_ID_CHARS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789._-";

pub(crate) fn is_valid_snapshot_id(id: &str) -> bool {
    match id.strip_prefix("snap-") {
        Some(rest) if !rest.is_empty() => rest.chars().all(|c| SNAPSHOT_ID_CHARS.contains(c)),
        _ => false,
    }
}

/// Validate a frozen-snapshot record against its contract.
pub fn validate_frozen_record(record: &FrozenRecord) -> Validation {
    let mut errors = Vec::new();

    if record.version != 1 {
        errors.push(format!("unsupported frozen record version {}", record.version));
    }
    if !is_valid_snapshot_id(&record.snapshot_id) {
        errors.push(format!("invalid snapshotId \"{}\"", record.snapshot_id));
    }
    if record.frozen_at.trim().is_empty() {
        errors.push("frozenAt must be set".to_string());
    }
    if record.method != "hardlink" && record.method != "copy" {
        errors.push(format!("invalid method \"{}\"", record.method));
    }
    if record.included.modes.is_empty() {
        errors.push("included.modes must not be empty".to_string());
    }
    if !record.verification.ok {
        errors.push("verification.ok must be true for a frozen record".to_string());
    }

    if errors.is_empty() {
        Validation::passed()
    } else {
        Validation::failed(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_id_pattern() {
        assert!(is_valid_snapshot_id("snap-20260101120000-abc123"));
        assert!(is_valid_snapshot_id("snap-x"));
        assert!(!is_valid_snapshot_id("snap-"));
        assert!(!is_valid_snapshot_id("build-1"));
        assert!(!is_valid_snapshot_id("snap-has space"));
    }
}
