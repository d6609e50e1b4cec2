//! Symbolic index references and their resolution to concrete per-mode
//! index directories.
//!
//! A reference is one of `latest`, `build:<id>`, `snap:<id>`, `tag:<name>`,
//! or `path:<value>`. Resolution produces absolute per-mode roots plus a
//! path-free identity descriptor whose stable hash feeds diff determinism;
//! an absolute path leaking into the identity is an invariant violation.

use crate::build_state::{read_build_state_file, BuildState};
use crate::contracts::is_valid_snapshot_id;
use crate::snapshots::{self, SnapshotEntry, SnapshotRecord};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sift_core::{
    is_absolute_path_any, sha1_hex, stable_hash, within_root, Error, IndexCacheDir, Mode, Result,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A parsed symbolic reference. Immutable once parsed; `canonical()` is the
/// case-normalized form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexRef {
    Latest,
    Build { id: String },
    Snapshot { id: String },
    Tag { name: String },
    Path { value: String },
}

impl IndexRef {
    /// Parse a reference string. The prefix is case-insensitive; the value
    /// is required and validated per kind.
    pub fn parse(raw: &str) -> Result<IndexRef> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::invalid_request("IndexRef cannot be empty."));
        }
        if trimmed.eq_ignore_ascii_case("latest") {
            return Ok(IndexRef::Latest);
        }

        let Some(split) = trimmed.find(':').filter(|idx| *idx > 0) else {
            return Err(Error::invalid_request(format!(
                "Invalid IndexRef \"{trimmed}\"."
            )));
        };
        let prefix = trimmed[..split].to_ascii_lowercase();
        let value = &trimmed[split + 1..];
        if value.trim().is_empty() {
            return Err(Error::invalid_request(format!(
                "Invalid IndexRef \"{trimmed}\": missing value."
            )));
        }

        match prefix.as_str() {
            "build" => {
                if !is_valid_build_id(value) {
                    return Err(Error::invalid_request(format!(
                        "Invalid build id \"{value}\"."
                    )));
                }
                Ok(IndexRef::Build {
                    id: value.to_string(),
                })
            }
            "snap" => {
                if !is_valid_snapshot_id(value) {
                    return Err(Error::invalid_request(format!(
                        "Invalid snapshot id \"{value}\"."
                    )));
                }
                Ok(IndexRef::Snapshot {
                    id: value.to_string(),
                })
            }
            "tag" => {
                if !is_valid_tag(value) {
                    return Err(Error::invalid_request(format!("Invalid tag \"{value}\".")));
                }
                Ok(IndexRef::Tag {
                    name: value.to_string(),
                })
            }
            "path" => Ok(IndexRef::Path {
                value: value.to_string(),
            }),
            other => Err(Error::invalid_request(format!(
                "Invalid IndexRef prefix \"{other}\"."
            ))),
        }
    }

    pub fn canonical(&self) -> String {
        match self {
            IndexRef::Latest => "latest".to_string(),
            IndexRef::Build { id } => format!("build:{id}"),
            IndexRef::Snapshot { id } => format!("snap:{id}"),
            IndexRef::Tag { name } => format!("tag:{name}"),
            IndexRef::Path { value } => format!("path:{value}"),
        }
    }

    pub fn is_path(&self) -> bool {
        matches!(self, IndexRef::Path { .. })
    }
}

pub(crate) fn is_valid_build_id(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.is_empty() || bytes.len() > 200 {
        return false;
    }
    if !bytes[0].is_ascii_alphanumeric() {
        return false;
    }
    bytes[1..]
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

fn is_valid_tag(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.is_empty() || bytes.len() > 64 {
        return false;
    }
    if !bytes[0].is_ascii_alphanumeric() {
        return false;
    }
    bytes[1..]
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'/' | b'-'))
}

/// Resolution options.
#[derive(Clone, Copy, Debug)]
pub struct ResolveOptions {
    /// When a snapshot has a frozen copy, point every mode at it instead of
    /// the pointer's build roots.
    pub prefer_frozen: bool,
    /// Tolerate modes with no resolvable root (recorded as warnings).
    pub allow_missing_modes: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            prefer_frozen: true,
            allow_missing_modes: false,
        }
    }
}

/// Snapshot context attached to a resolution that went through a snapshot.
#[derive(Clone, Debug)]
pub struct ResolvedSnapshot {
    pub snapshot_id: String,
    pub entry: SnapshotEntry,
    pub record: SnapshotRecord,
}

/// The result of resolving a reference: concrete per-mode directories plus
/// a path-free identity descriptor.
#[derive(Clone, Debug)]
pub struct ResolvedIndexRef {
    pub requested: String,
    pub parsed: IndexRef,
    pub canonical: String,
    pub index_base_root_by_mode: BTreeMap<Mode, PathBuf>,
    pub index_dir_by_mode: BTreeMap<Mode, PathBuf>,
    pub identity: Value,
    pub identity_hash: String,
    pub snapshot: Option<ResolvedSnapshot>,
    pub warnings: Vec<String>,
}

impl ResolvedIndexRef {
    pub fn config_hash_for(&self, mode: Mode) -> Option<&str> {
        self.identity
            .get("configHashByMode")
            .and_then(|map| map.get(mode.as_str()))
            .and_then(Value::as_str)
    }

    pub fn tool_version_for(&self, mode: Mode) -> Option<&str> {
        self.identity
            .get("toolVersionByMode")
            .and_then(|map| map.get(mode.as_str()))
            .and_then(Value::as_str)
    }
}

/// How a reference is recorded when persisted into a diff's inputs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistableRef {
    pub r#ref: String,
    pub redacted: bool,
    #[serde(default)]
    pub path_hash: Option<String>,
}

/// Redact a reference for persistence. Path refs carry machine-local
/// filesystem paths, so they are only persisted (hashed and redacted) when
/// the caller explicitly opts in.
pub fn redact_for_persistence(parsed: &IndexRef, persist_unsafe: bool) -> Result<PersistableRef> {
    match parsed {
        IndexRef::Path { value } => {
            if !persist_unsafe {
                return Err(Error::invalid_request(
                    "Path refs cannot be persisted without --persist-unsafe.",
                ));
            }
            let resolved = Path::new(value)
                .canonicalize()
                .unwrap_or_else(|_| PathBuf::from(value));
            Ok(PersistableRef {
                r#ref: "path:<redacted>".to_string(),
                redacted: true,
                path_hash: Some(sha1_hex(resolved.to_string_lossy().as_bytes())),
            })
        }
        other => Ok(PersistableRef {
            r#ref: other.canonical(),
            redacted: false,
            path_hash: None,
        }),
    }
}

/// Resolve a symbolic reference against a repo cache.
pub fn resolve_index_ref(
    cache: &IndexCacheDir,
    reference: &str,
    requested_modes: &[Mode],
    options: &ResolveOptions,
) -> Result<ResolvedIndexRef> {
    let parsed = IndexRef::parse(reference)?;
    resolve_parsed(cache, reference, parsed, requested_modes, options)
}

fn resolve_parsed(
    cache: &IndexCacheDir,
    requested: &str,
    parsed: IndexRef,
    requested_modes: &[Mode],
    options: &ResolveOptions,
) -> Result<ResolvedIndexRef> {
    let modes: Vec<Mode> = if requested_modes.is_empty() {
        Mode::ALL.to_vec()
    } else {
        requested_modes.to_vec()
    };
    let mut warnings = Vec::new();

    let resolution = match &parsed {
        IndexRef::Latest => resolve_latest(cache, &modes, options, &mut warnings)?,
        IndexRef::Build { id } => resolve_build(cache, id, &modes, options, &mut warnings)?,
        IndexRef::Snapshot { id } => resolve_snapshot(
            cache,
            id,
            &modes,
            options,
            &mut warnings,
            "snapshot",
            None,
        )?,
        IndexRef::Tag { name } => resolve_tag(cache, name, &modes, options, &mut warnings)?,
        IndexRef::Path { value } => resolve_path(value, &modes, options, &mut warnings)?,
    };

    finalize(cache, requested, parsed, resolution, warnings)
}

struct Resolution {
    index_base_root_by_mode: BTreeMap<Mode, PathBuf>,
    identity: Value,
    snapshot: Option<ResolvedSnapshot>,
}

fn finalize(
    _cache: &IndexCacheDir,
    requested: &str,
    parsed: IndexRef,
    resolution: Resolution,
    warnings: Vec<String>,
) -> Result<ResolvedIndexRef> {
    if identity_has_absolute_path(&resolution.identity) {
        return Err(Error::internal(
            "Resolved identity must not contain absolute paths.",
        ));
    }
    let identity_hash = stable_hash(&resolution.identity);
    let mut index_dir_by_mode = BTreeMap::new();
    for (mode, root) in &resolution.index_base_root_by_mode {
        index_dir_by_mode.insert(*mode, root.join(format!("index-{mode}")));
    }
    Ok(ResolvedIndexRef {
        requested: requested.to_string(),
        canonical: parsed.canonical(),
        parsed,
        index_base_root_by_mode: resolution.index_base_root_by_mode,
        index_dir_by_mode,
        identity: resolution.identity,
        identity_hash,
        snapshot: resolution.snapshot,
        warnings,
    })
}

fn identity_has_absolute_path(value: &Value) -> bool {
    match value {
        Value::String(s) => is_absolute_path_any(s),
        Value::Array(items) => items.iter().any(identity_has_absolute_path),
        Value::Object(map) => map.values().any(identity_has_absolute_path),
        _ => false,
    }
}

/// The build pointer document at `builds/current.json`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CurrentPointer {
    #[serde(default)]
    build_id: Option<String>,
    #[serde(default)]
    build_root: Option<String>,
    #[serde(default)]
    build_roots: Option<BTreeMap<String, String>>,
    /// Legacy alias for `buildRoots`.
    #[serde(default)]
    build_roots_by_mode: Option<BTreeMap<String, String>>,
}

fn read_current_pointer(cache: &IndexCacheDir) -> Result<CurrentPointer> {
    let path = cache.current_build_path();
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::not_found(format!(
                "builds/current.json not found: {}",
                path.display()
            )))
        }
        Err(err) => return Err(err.into()),
    };
    serde_json::from_slice(&bytes)
        .map_err(|err| Error::invalid_request(format!("Invalid builds/current.json: {err}")))
}

/// Resolve a pointer value to an existing directory under the cache
/// boundary.
///
/// Build-id-shaped values prefer `<buildsRoot>/<value>`; other relative
/// values try the cache root first. Candidates outside the boundary are
/// rejected outright; in-boundary candidates that do not exist resolve to
/// `None`.
fn resolve_cache_scoped_root(
    cache: &IndexCacheDir,
    value: &str,
    label: &str,
) -> Result<Option<PathBuf>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    // Canonicalize the boundary so symlinked cache roots compare cleanly
    // against canonicalized candidates.
    let cache_root = cache
        .root()
        .canonicalize()
        .unwrap_or_else(|_| cache.root().to_path_buf());
    let builds_root = cache_root.join("builds");

    let candidates: Vec<PathBuf> = if is_absolute_path_any(trimmed) {
        vec![PathBuf::from(trimmed)]
    } else if is_valid_build_id(trimmed) {
        vec![
            builds_root.join(sift_core::from_posix(trimmed)),
            cache_root.join(sift_core::from_posix(trimmed)),
        ]
    } else {
        vec![
            cache_root.join(sift_core::from_posix(trimmed)),
            builds_root.join(sift_core::from_posix(trimmed)),
        ]
    };

    let mut saw_scoped = false;
    for candidate in candidates {
        let resolved = candidate
            .canonicalize()
            .unwrap_or_else(|_| candidate.clone());
        if within_root(&cache_root, &resolved) {
            saw_scoped = true;
            if resolved.exists() {
                return Ok(Some(resolved));
            }
        }
    }
    if saw_scoped {
        return Ok(None);
    }
    Err(Error::invalid_request(format!(
        "{label} escapes repo cache root: {trimmed}"
    )))
}

#[derive(Default)]
struct ModeMetadata {
    build_id_by_mode: BTreeMap<Mode, String>,
    config_hash_by_mode: BTreeMap<Mode, Value>,
    tool_version_by_mode: BTreeMap<Mode, Value>,
}

/// Read each resolved mode's `build_state.json` to pick up build ids,
/// config hashes, and tool versions for the identity.
fn collect_build_state_metadata(
    roots: &BTreeMap<Mode, PathBuf>,
    allow_missing: bool,
    warnings: &mut Vec<String>,
) -> Result<ModeMetadata> {
    let mut metadata = ModeMetadata::default();
    let mut by_root: BTreeMap<PathBuf, Option<BuildState>> = BTreeMap::new();

    for (mode, root) in roots {
        let state = match by_root.get(root) {
            Some(cached) => cached.clone(),
            None => {
                let state_file = root.join(crate::build_state::BUILD_STATE_FILE);
                if !state_file.exists() && !allow_missing {
                    return Err(Error::not_found(format!(
                        "Missing build_state.json for {mode}."
                    )));
                }
                let loaded = read_build_state_file(root)?;
                if loaded.is_none() {
                    warnings.push(format!("Missing build_state.json for {mode}"));
                }
                by_root.insert(root.clone(), loaded.clone());
                loaded
            }
        };
        let Some(state) = state else {
            continue;
        };
        if let Some(build_id) = state.build_id.as_deref().filter(|id| !id.is_empty()) {
            metadata.build_id_by_mode.insert(*mode, build_id.to_string());
        }
        if let Some(config_hash) = &state.config_hash {
            metadata
                .config_hash_by_mode
                .insert(*mode, Value::from(config_hash.clone()));
        }
        if let Some(tool_version) = state.tool_version() {
            metadata
                .tool_version_by_mode
                .insert(*mode, Value::from(tool_version));
        }
    }
    Ok(metadata)
}

fn mode_map_value<V: Clone + Into<Value>>(map: &BTreeMap<Mode, V>) -> Value {
    let mut out = Map::new();
    for (mode, value) in map {
        out.insert(mode.as_str().to_string(), value.clone().into());
    }
    Value::Object(out)
}

fn attach_metadata(identity: &mut Map<String, Value>, metadata: &ModeMetadata) {
    if !metadata.build_id_by_mode.is_empty() {
        identity.insert(
            "buildIdByMode".to_string(),
            mode_map_value(&metadata.build_id_by_mode),
        );
    }
    if !metadata.config_hash_by_mode.is_empty() {
        identity.insert(
            "configHashByMode".to_string(),
            mode_map_value(&metadata.config_hash_by_mode),
        );
    }
    if !metadata.tool_version_by_mode.is_empty() {
        identity.insert(
            "toolVersionByMode".to_string(),
            mode_map_value(&metadata.tool_version_by_mode),
        );
    }
}

fn resolve_latest(
    cache: &IndexCacheDir,
    modes: &[Mode],
    options: &ResolveOptions,
    warnings: &mut Vec<String>,
) -> Result<Resolution> {
    let current = read_current_pointer(cache)?;
    let pointer_roots = current
        .build_roots
        .or(current.build_roots_by_mode)
        .unwrap_or_default();
    let default_root = current.build_root;
    let current_build_id = current
        .build_id
        .filter(|id| is_valid_build_id(id.trim()))
        .map(|id| id.trim().to_string());

    let mut roots = BTreeMap::new();
    for mode in modes {
        let raw = pointer_roots
            .get(mode.as_str())
            .cloned()
            .or_else(|| default_root.clone())
            .or_else(|| current_build_id.clone());
        let Some(raw) = raw else {
            if options.allow_missing_modes {
                warnings.push(format!("Missing build root for {mode}"));
                continue;
            }
            return Err(Error::not_found(format!(
                "Missing build root for {mode} in builds/current.json."
            )));
        };
        match resolve_cache_scoped_root(cache, &raw, &format!("build root ({mode})"))? {
            Some(root) => {
                roots.insert(*mode, root);
            }
            None => {
                if options.allow_missing_modes {
                    warnings.push(format!("Missing index base root for {mode}"));
                    continue;
                }
                return Err(Error::not_found(format!(
                    "Missing index base root for {mode}: {raw}"
                )));
            }
        }
    }

    let metadata = collect_build_state_metadata(&roots, options.allow_missing_modes, warnings)?;
    let mut identity = Map::new();
    identity.insert("type".to_string(), Value::from("latest"));
    attach_metadata(&mut identity, &metadata);
    Ok(Resolution {
        index_base_root_by_mode: roots,
        identity: Value::Object(identity),
        snapshot: None,
    })
}

fn resolve_build(
    cache: &IndexCacheDir,
    build_id: &str,
    modes: &[Mode],
    options: &ResolveOptions,
    warnings: &mut Vec<String>,
) -> Result<Resolution> {
    let build_root = cache.builds_dir().join(build_id);
    let mut roots = BTreeMap::new();
    for mode in modes {
        if build_root.exists() {
            roots.insert(*mode, build_root.clone());
        } else if options.allow_missing_modes {
            warnings.push(format!("Missing build root for {mode}: {build_id}"));
        } else {
            return Err(Error::not_found(format!(
                "Build root not found: builds/{build_id}"
            )));
        }
    }

    // Metadata reads tolerate absence here: the build directory itself is
    // the source of truth for a direct build ref.
    let metadata = collect_build_state_metadata(&roots, true, warnings)?;
    if let Some(state_build_id) = metadata.build_id_by_mode.values().next() {
        if state_build_id != build_id {
            warnings.push(format!(
                "build_state.json buildId mismatch: requested {build_id}, found {state_build_id}"
            ));
        }
    }

    let mut build_id_by_mode = BTreeMap::new();
    for mode in roots.keys() {
        let id = metadata
            .build_id_by_mode
            .get(mode)
            .cloned()
            .unwrap_or_else(|| build_id.to_string());
        build_id_by_mode.insert(*mode, id);
    }

    let mut identity = Map::new();
    identity.insert("type".to_string(), Value::from("build"));
    identity.insert(
        "buildIdByMode".to_string(),
        mode_map_value(&build_id_by_mode),
    );
    if !metadata.config_hash_by_mode.is_empty() {
        identity.insert(
            "configHashByMode".to_string(),
            mode_map_value(&metadata.config_hash_by_mode),
        );
    }
    if !metadata.tool_version_by_mode.is_empty() {
        identity.insert(
            "toolVersionByMode".to_string(),
            mode_map_value(&metadata.tool_version_by_mode),
        );
    }
    Ok(Resolution {
        index_base_root_by_mode: roots,
        identity: Value::Object(identity),
        snapshot: None,
    })
}

fn resolve_snapshot(
    cache: &IndexCacheDir,
    snapshot_id: &str,
    modes: &[Mode],
    options: &ResolveOptions,
    warnings: &mut Vec<String>,
    identity_type: &str,
    tag: Option<&str>,
) -> Result<Resolution> {
    let manifest = snapshots::load_snapshots_manifest(cache)?;
    if manifest.snapshots.is_empty() && !cache.snapshots_manifest_path().exists() {
        return Err(Error::not_found(format!(
            "snapshots/manifest.json not found: {}",
            cache.snapshots_manifest_path().display()
        )));
    }
    let entry = manifest
        .snapshots
        .get(snapshot_id)
        .cloned()
        .ok_or_else(|| Error::not_found(format!("Snapshot not found: {snapshot_id}")))?;
    let record = snapshots::load_snapshot_record(cache, snapshot_id)?
        .ok_or_else(|| Error::not_found(format!("snapshot.json missing for {snapshot_id}")))?;
    let frozen = snapshots::load_frozen_record(cache, snapshot_id)?;
    let has_frozen = entry.has_frozen || frozen.is_some();
    let snapshot_root = snapshots::snapshot_dir(cache, snapshot_id);

    let mut roots = BTreeMap::new();
    if options.prefer_frozen && has_frozen {
        let frozen_root = snapshot_root.join("frozen");
        if frozen_root.exists() {
            for mode in modes {
                roots.insert(*mode, frozen_root.clone());
            }
        } else if options.allow_missing_modes {
            warnings.push(format!("Frozen root missing for snapshot {snapshot_id}"));
        } else {
            return Err(Error::not_found(format!(
                "Frozen root missing for snapshot {snapshot_id}."
            )));
        }
    } else {
        for mode in modes {
            let raw = record
                .pointer
                .build_roots_by_mode
                .get(mode.as_str())
                .cloned()
                .or_else(|| record.pointer.build_root.clone());
            let Some(raw) = raw else {
                if options.allow_missing_modes {
                    warnings.push(format!("Snapshot {snapshot_id} missing build root for {mode}"));
                    continue;
                }
                return Err(Error::not_found(format!(
                    "Snapshot {snapshot_id} missing build root for {mode}."
                )));
            };
            match resolve_cache_scoped_root(cache, &raw, &format!("snapshot root ({mode})"))? {
                Some(root) => {
                    roots.insert(*mode, root);
                }
                None => {
                    if options.allow_missing_modes {
                        warnings.push(format!(
                            "Snapshot {snapshot_id} references missing build root for {mode}"
                        ));
                        continue;
                    }
                    return Err(Error::not_found(format!(
                        "Snapshot {snapshot_id} references missing build root {raw}."
                    )));
                }
            }
        }
    }

    let metadata = collect_build_state_metadata(&roots, true, warnings)?;
    let mut build_id_by_mode = BTreeMap::new();
    for mode in roots.keys() {
        let from_state = metadata.build_id_by_mode.get(mode).cloned();
        let from_pointer = record.pointer.build_id_by_mode.get(mode.as_str()).cloned();
        if let Some(id) = from_state.or(from_pointer) {
            build_id_by_mode.insert(*mode, id);
        }
    }

    let mut identity = Map::new();
    identity.insert("type".to_string(), Value::from(identity_type));
    identity.insert("snapshotId".to_string(), Value::from(snapshot_id));
    if let Some(tag) = tag {
        identity.insert("tag".to_string(), Value::from(tag));
    }
    if !build_id_by_mode.is_empty() {
        identity.insert(
            "buildIdByMode".to_string(),
            mode_map_value(&build_id_by_mode),
        );
    }
    if !metadata.config_hash_by_mode.is_empty() {
        identity.insert(
            "configHashByMode".to_string(),
            mode_map_value(&metadata.config_hash_by_mode),
        );
    }
    if !metadata.tool_version_by_mode.is_empty() {
        identity.insert(
            "toolVersionByMode".to_string(),
            mode_map_value(&metadata.tool_version_by_mode),
        );
    }

    Ok(Resolution {
        index_base_root_by_mode: roots,
        identity: Value::Object(identity),
        snapshot: Some(ResolvedSnapshot {
            snapshot_id: snapshot_id.to_string(),
            entry,
            record,
        }),
    })
}

fn resolve_tag(
    cache: &IndexCacheDir,
    tag: &str,
    modes: &[Mode],
    options: &ResolveOptions,
    warnings: &mut Vec<String>,
) -> Result<Resolution> {
    let manifest = snapshots::load_snapshots_manifest(cache)?;
    let snapshot_id = manifest
        .tags
        .get(tag)
        .and_then(|ids| ids.iter().find(|id| !id.trim().is_empty()))
        .cloned()
        .ok_or_else(|| Error::not_found(format!("No snapshots found for tag {tag}.")))?;
    resolve_snapshot(
        cache,
        &snapshot_id,
        modes,
        options,
        warnings,
        "tag",
        Some(tag),
    )
}

fn resolve_path(
    value: &str,
    modes: &[Mode],
    options: &ResolveOptions,
    warnings: &mut Vec<String>,
) -> Result<Resolution> {
    let resolved = Path::new(value)
        .canonicalize()
        .unwrap_or_else(|_| PathBuf::from(value));
    if !resolved.exists() && !options.allow_missing_modes {
        return Err(Error::not_found(format!("Path ref not found: {value}")));
    }
    let mut roots = BTreeMap::new();
    for mode in modes {
        roots.insert(*mode, resolved.clone());
    }
    warnings.push("Path ref used; identity is not portable across machines".to_string());
    let identity = json!({
        "type": "path",
        "pathHash": sha1_hex(resolved.to_string_lossy().as_bytes()),
    });
    Ok(Resolution {
        index_base_root_by_mode: roots,
        identity,
        snapshot: None,
    })
}
