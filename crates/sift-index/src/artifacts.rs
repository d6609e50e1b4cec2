//! Tolerant typed readers for the artifact surface the diff engine and the
//! freeze path consume.
//!
//! These readers never panic on malformed input: a missing or undecodable
//! artifact is `Ok(None)` with a debug log, so corruption degrades to an
//! artifact miss rather than failing the whole operation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sift_core::{is_manifest_path_safe, Result};
use std::path::Path;

/// The authoritative list of artifact files comprising one mode's index
/// output, written by the build pipeline at `pieces/manifest.json`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PiecesManifest {
    #[serde(default)]
    pub artifact_surface_version: Option<Value>,
    #[serde(default)]
    pub compatibility_key: Option<String>,
    #[serde(default)]
    pub pieces: Vec<PieceEntry>,
}

/// One artifact file in the pieces manifest.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PieceEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub piece_type: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    /// Index-dir-relative posix path of the artifact file.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    /// Recorded content checksum, `"<algo>:<hex>"` (sha1 or sha256).
    #[serde(default)]
    pub checksum: Option<String>,
}

impl PieceEntry {
    /// The piece path, screened against traversal; unsafe entries resolve
    /// to `None` and are skipped by callers.
    pub fn safe_path(&self) -> Option<&str> {
        let path = self.path.as_deref()?;
        if is_manifest_path_safe(path) {
            Some(path)
        } else {
            tracing::warn!(
                target = "sift.artifacts",
                path,
                "skipping unsafe piece path in manifest"
            );
            None
        }
    }
}

/// Per-file metadata row from the `file_meta.json` artifact.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetaEntry {
    #[serde(default)]
    pub id: Option<i64>,
    pub file: String,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub file_hash: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub ext: Option<String>,
}

impl FileMetaEntry {
    pub fn content_hash(&self) -> Option<&str> {
        self.hash
            .as_deref()
            .filter(|h| !h.is_empty())
            .or(self.file_hash.as_deref().filter(|h| !h.is_empty()))
    }
}

/// One chunk row from the `chunk_meta.json` artifact.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetaEntry {
    pub file: String,
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub chunk_id: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
    #[serde(default)]
    pub start_line: Option<i64>,
    #[serde(default)]
    pub end_line: Option<i64>,
    #[serde(default)]
    pub segment: Option<ChunkSegment>,
    #[serde(default)]
    pub meta_v2: Option<ChunkMetaV2>,
    #[serde(default)]
    pub docmeta: Option<ChunkDocMeta>,
    #[serde(default)]
    pub code_relations: Option<CodeRelations>,
    #[serde(default)]
    pub file_id: Option<i64>,
    #[serde(default)]
    pub file_hash: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub ext: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSegment {
    #[serde(default)]
    pub segment_id: Option<String>,
}

/// Structured chunk metadata: explicit id plus the semantic-signature
/// ingredients (deliberately range-independent).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetaV2 {
    #[serde(default)]
    pub chunk_id: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub modifiers: Option<Value>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDocMeta {
    #[serde(default)]
    pub signature: Option<String>,
}

/// Declared relations for a chunk (imports / calls / usage links).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeRelations {
    #[serde(default)]
    pub imports: Vec<RelationEntry>,
    #[serde(default)]
    pub calls: Vec<RelationEntry>,
    #[serde(default)]
    pub usage_links: Vec<RelationEntry>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationEntry {
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default, rename = "type")]
    pub relation_type: Option<String>,
}

impl RelationEntry {
    pub fn target_key(&self) -> &str {
        self.to
            .as_deref()
            .or(self.target.as_deref())
            .or(self.file.as_deref())
            .or(self.symbol.as_deref())
            .unwrap_or("")
    }
}

pub fn pieces_manifest_path(index_dir: &Path) -> std::path::PathBuf {
    index_dir.join("pieces").join("manifest.json")
}

/// Load one mode's pieces manifest, tolerating absence and malformed JSON.
pub fn load_pieces_manifest(index_dir: &Path) -> Result<Option<PiecesManifest>> {
    read_tolerant(&pieces_manifest_path(index_dir), "pieces manifest")
}

/// Load per-chunk metadata rows, tolerating absence and malformed JSON.
pub fn load_chunk_meta(index_dir: &Path) -> Result<Option<Vec<ChunkMetaEntry>>> {
    read_tolerant(&index_dir.join("chunk_meta.json"), "chunk meta")
}

/// Load per-file metadata rows, tolerating absence and malformed JSON.
pub fn load_file_meta(index_dir: &Path) -> Result<Option<Vec<FileMetaEntry>>> {
    read_tolerant(&index_dir.join("file_meta.json"), "file meta")
}

fn read_tolerant<T: for<'de> Deserialize<'de>>(path: &Path, label: &str) -> Result<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(err) => {
            tracing::debug!(
                target = "sift.artifacts",
                path = %path.display(),
                error = %err,
                "failed to decode {label}; treating as missing"
            );
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_artifacts_read_as_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(load_pieces_manifest(tmp.path()).unwrap().is_none());
        assert!(load_chunk_meta(tmp.path()).unwrap().is_none());
        assert!(load_file_meta(tmp.path()).unwrap().is_none());
    }

    #[test]
    fn malformed_artifacts_read_as_none() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("file_meta.json"), b"{not json").unwrap();
        assert!(load_file_meta(tmp.path()).unwrap().is_none());
    }

    #[test]
    fn unsafe_piece_paths_are_screened() {
        let entry = PieceEntry {
            path: Some("../escape.json".to_string()),
            ..PieceEntry::default()
        };
        assert!(entry.safe_path().is_none());
        let ok = PieceEntry {
            path: Some("file_meta.json".to_string()),
            ..PieceEntry::default()
        };
        assert_eq!(ok.safe_path(), Some("file_meta.json"));
    }

    #[test]
    fn relation_target_prefers_to_field() {
        let rel = RelationEntry {
            to: Some("a".into()),
            target: Some("b".into()),
            ..RelationEntry::default()
        };
        assert_eq!(rel.target_key(), "a");
    }
}
