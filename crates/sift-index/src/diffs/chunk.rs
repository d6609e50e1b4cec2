//! Per-mode structural diffing: file sets, rename detection, and the
//! two-pass chunk matcher.

use super::events::{
    summarize_mode, ChunkSide, DiffEvent, FileSummary, ModeSummary,
};
use crate::artifacts::{
    load_chunk_meta, load_file_meta, load_pieces_manifest, ChunkMetaEntry, CodeRelations,
};
use serde_json::json;
use sift_core::{sha1_hex, stable_hash, Mode, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

pub(crate) struct ModeDiffOptions {
    pub detect_renames: bool,
    pub include_relations: bool,
    pub max_changed_files: usize,
    pub max_chunks_per_file: usize,
}

pub(crate) struct ModeDiffResult {
    pub mode: Mode,
    pub events: Vec<DiffEvent>,
    pub summary: ModeSummary,
    pub fast_path: bool,
}

/// A chunk row normalized to its three identities: explicit id (or
/// positional fallback), logical key, and range key.
#[derive(Clone, Debug)]
struct NormalizedChunk {
    chunk_id: Option<String>,
    logical_key: String,
    signature: String,
    range_key: String,
    stable_key: String,
    relations: Option<CodeRelations>,
}

fn declared_signature(chunk: &ChunkMetaEntry) -> &str {
    chunk
        .meta_v2
        .as_ref()
        .and_then(|meta| meta.signature.as_deref())
        .filter(|sig| !sig.is_empty())
        .or_else(|| chunk.docmeta.as_ref().and_then(|doc| doc.signature.as_deref()))
        .unwrap_or("")
}

fn logical_key(chunk: &ChunkMetaEntry) -> String {
    let segment_id = chunk
        .segment
        .as_ref()
        .and_then(|segment| segment.segment_id.as_deref())
        .unwrap_or("");
    format!(
        "{segment_id}|{}|{}|{}",
        chunk.kind.as_deref().unwrap_or(""),
        chunk.name.as_deref().unwrap_or(""),
        declared_signature(chunk)
    )
}

/// Semantic signature: hash of kind/name/type-signature/modifiers/params,
/// deliberately range-independent so a pure move never reads as modified.
fn semantic_signature(chunk: &ChunkMetaEntry) -> String {
    let meta = chunk.meta_v2.as_ref();
    let payload = json!({
        "kind": chunk.kind,
        "name": chunk.name,
        "signature": match declared_signature(chunk) {
            "" => serde_json::Value::Null,
            sig => serde_json::Value::from(sig),
        },
        "modifiers": meta.and_then(|m| m.modifiers.clone()),
        "params": meta.and_then(|m| m.params.clone()),
    });
    stable_hash(&payload)
}

fn range_key(chunk: &ChunkMetaEntry) -> String {
    format!(
        "{}:{}:{}:{}",
        chunk.start_line.unwrap_or(-1),
        chunk.end_line.unwrap_or(-1),
        chunk.start.unwrap_or(-1),
        chunk.end.unwrap_or(-1)
    )
}

fn explicit_chunk_id(chunk: &ChunkMetaEntry) -> Option<String> {
    chunk
        .meta_v2
        .as_ref()
        .and_then(|meta| meta.chunk_id.clone())
        .or_else(|| chunk.chunk_id.clone())
        .filter(|id| !id.is_empty())
        .or_else(|| chunk.id.map(|id| format!("id:{id}")))
}

fn normalize_chunk(chunk: &ChunkMetaEntry) -> NormalizedChunk {
    let logical = logical_key(chunk);
    let range = range_key(chunk);
    let id = explicit_chunk_id(chunk);
    NormalizedChunk {
        stable_key: format!("{}|{range}|{logical}", id.as_deref().unwrap_or("")),
        chunk_id: id,
        logical_key: logical,
        signature: semantic_signature(chunk),
        range_key: range,
        relations: chunk.code_relations.clone(),
    }
}

/// Relation keys for a chunk: `kind|target|type` over the declared
/// import/call/usage relations, deduped and ordered.
fn relation_set(chunk: &NormalizedChunk) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    let Some(relations) = &chunk.relations else {
        return keys;
    };
    let mut append = |prefix: &str, list: &[crate::artifacts::RelationEntry]| {
        for entry in list {
            keys.insert(format!(
                "{prefix}|{}|{}",
                entry.target_key(),
                entry.relation_type.as_deref().unwrap_or("")
            ));
        }
    };
    append("imports", &relations.imports);
    append("calls", &relations.calls);
    append("usage", &relations.usage_links);
    keys
}

/// Stable fingerprint of a mode's pieces manifest: the fast-path equality
/// check that lets identical indexes diff without any per-file I/O.
fn pieces_fingerprint(index_dir: &Path) -> Result<Option<String>> {
    let Some(manifest) = load_pieces_manifest(index_dir)? else {
        return Ok(None);
    };
    let value = json!({
        "artifactSurfaceVersion": manifest.artifact_surface_version,
        "compatibilityKey": manifest.compatibility_key,
        "pieces": serde_json::to_value(&manifest.pieces)?,
    });
    Ok(Some(sha1_hex(sift_core::canonical_json_string(&value))))
}

/// Per-file metadata keyed by path, from the `file_meta` artifact with a
/// chunk-meta fallback (first row per file wins).
fn load_file_summaries(index_dir: &Path) -> Result<BTreeMap<String, FileSummary>> {
    let mut by_path = BTreeMap::new();
    if let Some(rows) = load_file_meta(index_dir)? {
        for row in &rows {
            if row.file.is_empty() {
                continue;
            }
            by_path
                .entry(row.file.clone())
                .or_insert_with(|| FileSummary::from_meta(row));
        }
    }
    if !by_path.is_empty() {
        return Ok(by_path);
    }

    if let Some(chunks) = load_chunk_meta(index_dir)? {
        for chunk in &chunks {
            if chunk.file.is_empty() || by_path.contains_key(&chunk.file) {
                continue;
            }
            by_path.insert(
                chunk.file.clone(),
                FileSummary {
                    id: chunk.file_id,
                    file: chunk.file.clone(),
                    hash: chunk.file_hash.clone(),
                    size: chunk.file_size,
                    ext: chunk.ext.clone(),
                },
            );
        }
    }
    Ok(by_path)
}

struct ChangedFileSpec {
    file: String,
    before_file: String,
    after_file: String,
}

pub(crate) fn compute_mode_diff(
    mode: Mode,
    from_dir: &Path,
    to_dir: &Path,
    options: &ModeDiffOptions,
) -> Result<ModeDiffResult> {
    let mut events: Vec<DiffEvent> = Vec::new();

    let from_fingerprint = pieces_fingerprint(from_dir)?;
    let to_fingerprint = pieces_fingerprint(to_dir)?;
    if let (Some(from), Some(to)) = (&from_fingerprint, &to_fingerprint) {
        if from == to {
            return Ok(ModeDiffResult {
                mode,
                summary: summarize_mode(&events, true, None),
                events,
                fast_path: true,
            });
        }
    }

    let from_files = load_file_summaries(from_dir)?;
    let to_files = load_file_summaries(to_dir)?;

    let added: Vec<&String> = to_files
        .keys()
        .filter(|file| !from_files.contains_key(*file))
        .collect();
    let removed: Vec<&String> = from_files
        .keys()
        .filter(|file| !to_files.contains_key(*file))
        .collect();
    let mut modified: Vec<&String> = Vec::new();
    for (file, before) in &from_files {
        let Some(after) = to_files.get(file) else {
            continue;
        };
        if before.hash != after.hash || before.size != after.size {
            modified.push(file);
        }
    }

    // Rename detection pairs removed/added files with identical content
    // hashes, in sorted-path order within each hash group. Deliberately not
    // similarity-based: near-identical renames stay add+remove.
    let mut renamed_pairs: Vec<(String, String)> = Vec::new();
    if options.detect_renames {
        let mut removed_by_hash: BTreeMap<&str, Vec<&String>> = BTreeMap::new();
        for file in &removed {
            if let Some(hash) = from_files[*file].hash.as_deref() {
                removed_by_hash.entry(hash).or_default().push(*file);
            }
        }
        let mut added_by_hash: BTreeMap<&str, Vec<&String>> = BTreeMap::new();
        for file in &added {
            if let Some(hash) = to_files[*file].hash.as_deref() {
                added_by_hash.entry(hash).or_default().push(*file);
            }
        }
        for (hash, from_list) in &removed_by_hash {
            let Some(to_list) = added_by_hash.get(hash) else {
                continue;
            };
            for (before, after) in from_list.iter().zip(to_list.iter()) {
                renamed_pairs.push(((**before).clone(), (**after).clone()));
            }
        }
    }
    let renamed_before: BTreeSet<&str> =
        renamed_pairs.iter().map(|(before, _)| before.as_str()).collect();
    let renamed_after: BTreeSet<&str> =
        renamed_pairs.iter().map(|(_, after)| after.as_str()).collect();

    for file in &added {
        if renamed_after.contains(file.as_str()) {
            continue;
        }
        events.push(DiffEvent::FileAdded {
            mode,
            file: (*file).clone(),
            after: to_files.get(*file).cloned(),
        });
    }
    for file in &removed {
        if renamed_before.contains(file.as_str()) {
            continue;
        }
        events.push(DiffEvent::FileRemoved {
            mode,
            file: (*file).clone(),
            before: from_files.get(*file).cloned(),
        });
    }
    for file in &modified {
        events.push(DiffEvent::FileModified {
            mode,
            file: (*file).clone(),
            before: from_files.get(*file).cloned(),
            after: to_files.get(*file).cloned(),
        });
    }
    for (before_file, after_file) in &renamed_pairs {
        events.push(DiffEvent::FileRenamed {
            mode,
            file: after_file.clone(),
            before_file: before_file.clone(),
            after_file: after_file.clone(),
            before: from_files.get(before_file).cloned(),
            after: to_files.get(after_file).cloned(),
        });
    }

    let mut changed_specs: Vec<ChangedFileSpec> = modified
        .iter()
        .map(|file| ChangedFileSpec {
            file: (*file).clone(),
            before_file: (*file).clone(),
            after_file: (*file).clone(),
        })
        .chain(renamed_pairs.iter().map(|(before, after)| ChangedFileSpec {
            file: after.clone(),
            before_file: before.clone(),
            after_file: after.clone(),
        }))
        .collect();
    changed_specs.sort_by(|left, right| {
        (&left.before_file, &left.after_file).cmp(&(&right.before_file, &right.after_file))
    });

    let mut skip_reason = None;
    if changed_specs.len() > options.max_changed_files {
        skip_reason = Some("max-changed-files");
        events.push(DiffEvent::ChunkDiffSkipped {
            mode,
            file: None,
            reason: "max-changed-files".to_string(),
            changed_files: Some(changed_specs.len() as u64),
            before_chunks: None,
            after_chunks: None,
        });
    } else if !changed_specs.is_empty() {
        let from_chunks = load_chunk_meta(from_dir)?.unwrap_or_default();
        let to_chunks = load_chunk_meta(to_dir)?.unwrap_or_default();
        let before_by_file = group_chunks_by_file(&from_chunks);
        let after_by_file = group_chunks_by_file(&to_chunks);
        for spec in &changed_specs {
            let empty = Vec::new();
            let before = before_by_file.get(&spec.before_file).unwrap_or(&empty);
            let after = after_by_file.get(&spec.after_file).unwrap_or(&empty);
            diff_chunks_for_file(
                mode,
                spec,
                before,
                after,
                options.include_relations,
                options.max_chunks_per_file,
                &mut events,
            );
        }
    }

    Ok(ModeDiffResult {
        mode,
        summary: summarize_mode(&events, false, skip_reason),
        events,
        fast_path: false,
    })
}

fn group_chunks_by_file(chunks: &[ChunkMetaEntry]) -> BTreeMap<String, Vec<NormalizedChunk>> {
    let mut grouped: BTreeMap<String, Vec<NormalizedChunk>> = BTreeMap::new();
    for chunk in chunks {
        if chunk.file.is_empty() {
            continue;
        }
        grouped
            .entry(chunk.file.clone())
            .or_default()
            .push(normalize_chunk(chunk));
    }
    grouped
}

/// Two-pass chunk matcher.
///
/// Pass 1 consumes explicit-id matches order-stably; pass 2 groups the
/// leftovers by logical key and pairs positionally within each group sorted
/// by range key. Matched pairs with a differing semantic signature are
/// `chunk.modified`; same signature with a differing range is
/// `chunk.moved`; the unmatched remainder is added/removed.
#[allow(clippy::too_many_arguments)]
fn diff_chunks_for_file(
    mode: Mode,
    spec: &ChangedFileSpec,
    before_chunks: &[NormalizedChunk],
    after_chunks: &[NormalizedChunk],
    include_relations: bool,
    max_chunks_per_file: usize,
    events: &mut Vec<DiffEvent>,
) {
    if before_chunks.len() > max_chunks_per_file || after_chunks.len() > max_chunks_per_file {
        events.push(DiffEvent::ChunkDiffSkipped {
            mode,
            file: Some(spec.file.clone()),
            reason: "max-chunks-per-file".to_string(),
            changed_files: None,
            before_chunks: Some(before_chunks.len() as u64),
            after_chunks: Some(after_chunks.len() as u64),
        });
        return;
    }

    let mut before_sorted: Vec<&NormalizedChunk> = before_chunks.iter().collect();
    let mut after_sorted: Vec<&NormalizedChunk> = after_chunks.iter().collect();
    before_sorted.sort_by(|a, b| a.stable_key.cmp(&b.stable_key));
    after_sorted.sort_by(|a, b| a.stable_key.cmp(&b.stable_key));

    // Pass 1: explicit-id matches, each before occurrence consuming one
    // unused after occurrence with the same id.
    let mut after_by_id: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (index, chunk) in after_sorted.iter().enumerate() {
        if let Some(id) = chunk.chunk_id.as_deref() {
            after_by_id.entry(id).or_default().push(index);
        }
    }
    let mut used_after: Vec<bool> = vec![false; after_sorted.len()];
    let mut matched: Vec<(&NormalizedChunk, &NormalizedChunk)> = Vec::new();
    let mut unmatched_before: Vec<&NormalizedChunk> = Vec::new();

    for before in &before_sorted {
        let Some(id) = before.chunk_id.as_deref() else {
            unmatched_before.push(before);
            continue;
        };
        let slot = after_by_id
            .get(id)
            .and_then(|indexes| indexes.iter().find(|index| !used_after[**index]))
            .copied();
        match slot {
            Some(index) => {
                used_after[index] = true;
                matched.push((before, after_sorted[index]));
            }
            None => unmatched_before.push(before),
        }
    }
    let unmatched_after: Vec<&NormalizedChunk> = after_sorted
        .iter()
        .enumerate()
        .filter(|(index, _)| !used_after[*index])
        .map(|(_, chunk)| *chunk)
        .collect();

    // Pass 2: group leftovers by logical key, pair positionally within each
    // group sorted by range key.
    let group_by_logical = |chunks: &[&NormalizedChunk]| -> BTreeMap<String, Vec<usize>> {
        let mut map: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (index, chunk) in chunks.iter().enumerate() {
            map.entry(chunk.logical_key.clone()).or_default().push(index);
        }
        map
    };
    let sort_group = |chunks: &[&NormalizedChunk], indexes: &mut Vec<usize>| {
        indexes.sort_by(|a, b| chunks[*a].range_key.cmp(&chunks[*b].range_key));
    };

    let mut before_logical = group_by_logical(&unmatched_before);
    let mut after_logical = group_by_logical(&unmatched_after);
    let mut still_before: Vec<&NormalizedChunk> = Vec::new();
    let mut still_after: Vec<&NormalizedChunk> = Vec::new();

    let logical_keys: BTreeSet<String> = before_logical
        .keys()
        .chain(after_logical.keys())
        .cloned()
        .collect();
    for key in &logical_keys {
        let mut left = before_logical.remove(key).unwrap_or_default();
        let mut right = after_logical.remove(key).unwrap_or_default();
        sort_group(&unmatched_before, &mut left);
        sort_group(&unmatched_after, &mut right);
        let pairs = left.len().min(right.len());
        for i in 0..pairs {
            matched.push((unmatched_before[left[i]], unmatched_after[right[i]]));
        }
        for index in &left[pairs..] {
            still_before.push(unmatched_before[*index]);
        }
        for index in &right[pairs..] {
            still_after.push(unmatched_after[*index]);
        }
    }

    for (before, after) in &matched {
        let range_changed = before.range_key != after.range_key;
        let semantic_changed = before.signature != after.signature;
        let chunk_id = before.chunk_id.clone().or_else(|| after.chunk_id.clone());
        if semantic_changed {
            events.push(DiffEvent::ChunkModified {
                mode,
                file: spec.file.clone(),
                before_file: spec.before_file.clone(),
                after_file: spec.after_file.clone(),
                chunk_id: chunk_id.clone(),
                logical_key: before.logical_key.clone(),
                before: ChunkSide {
                    range: before.range_key.clone(),
                    signature: before.signature.clone(),
                },
                after: ChunkSide {
                    range: after.range_key.clone(),
                    signature: after.signature.clone(),
                },
            });
        } else if range_changed {
            events.push(DiffEvent::ChunkMoved {
                mode,
                file: spec.file.clone(),
                before_file: spec.before_file.clone(),
                after_file: spec.after_file.clone(),
                chunk_id: chunk_id.clone(),
                logical_key: before.logical_key.clone(),
                before_range: before.range_key.clone(),
                after_range: after.range_key.clone(),
            });
        }
        if include_relations {
            let before_relations = relation_set(before);
            let after_relations = relation_set(after);
            for key in after_relations.difference(&before_relations) {
                events.push(DiffEvent::RelationAdded {
                    mode,
                    file: spec.file.clone(),
                    before_file: spec.before_file.clone(),
                    after_file: spec.after_file.clone(),
                    chunk_id: after.chunk_id.clone(),
                    relation_key: key.clone(),
                });
            }
            for key in before_relations.difference(&after_relations) {
                events.push(DiffEvent::RelationRemoved {
                    mode,
                    file: spec.file.clone(),
                    before_file: spec.before_file.clone(),
                    after_file: spec.after_file.clone(),
                    chunk_id: before.chunk_id.clone(),
                    relation_key: key.clone(),
                });
            }
        }
    }

    for chunk in &still_before {
        events.push(DiffEvent::ChunkRemoved {
            mode,
            file: spec.file.clone(),
            before_file: spec.before_file.clone(),
            after_file: spec.after_file.clone(),
            chunk_id: chunk.chunk_id.clone(),
            logical_key: chunk.logical_key.clone(),
        });
    }
    for chunk in &still_after {
        events.push(DiffEvent::ChunkAdded {
            mode,
            file: spec.file.clone(),
            before_file: spec.before_file.clone(),
            after_file: spec.after_file.clone(),
            chunk_id: chunk.chunk_id.clone(),
            logical_key: chunk.logical_key.clone(),
        });
    }
}
