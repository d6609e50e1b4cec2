use crate::artifacts::FileMetaEntry;
use serde::{Deserialize, Serialize};
use sift_core::Mode;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Compact per-file metadata carried on file events.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    #[serde(default)]
    pub id: Option<i64>,
    pub file: String,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub ext: Option<String>,
}

impl FileSummary {
    pub(crate) fn from_meta(entry: &FileMetaEntry) -> Self {
        Self {
            id: entry.id,
            file: entry.file.clone(),
            hash: entry.content_hash().map(str::to_string),
            size: entry.size,
            ext: entry.ext.clone(),
        }
    }
}

/// Before/after view of one chunk on a `chunk.modified` event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSide {
    pub range: String,
    pub signature: String,
}

/// One structural difference between the two endpoints.
///
/// The serialized `kind` strings are part of the persisted format; the
/// variant order here is also the fixed secondary sort rank.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum DiffEvent {
    #[serde(rename = "file.added", rename_all = "camelCase")]
    FileAdded {
        mode: Mode,
        file: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<FileSummary>,
    },
    #[serde(rename = "file.removed", rename_all = "camelCase")]
    FileRemoved {
        mode: Mode,
        file: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<FileSummary>,
    },
    #[serde(rename = "file.modified", rename_all = "camelCase")]
    FileModified {
        mode: Mode,
        file: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<FileSummary>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<FileSummary>,
    },
    #[serde(rename = "file.renamed", rename_all = "camelCase")]
    FileRenamed {
        mode: Mode,
        file: String,
        before_file: String,
        after_file: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<FileSummary>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<FileSummary>,
    },
    #[serde(rename = "chunk.added", rename_all = "camelCase")]
    ChunkAdded {
        mode: Mode,
        file: String,
        before_file: String,
        after_file: String,
        #[serde(default)]
        chunk_id: Option<String>,
        logical_key: String,
    },
    #[serde(rename = "chunk.removed", rename_all = "camelCase")]
    ChunkRemoved {
        mode: Mode,
        file: String,
        before_file: String,
        after_file: String,
        #[serde(default)]
        chunk_id: Option<String>,
        logical_key: String,
    },
    #[serde(rename = "chunk.modified", rename_all = "camelCase")]
    ChunkModified {
        mode: Mode,
        file: String,
        before_file: String,
        after_file: String,
        #[serde(default)]
        chunk_id: Option<String>,
        logical_key: String,
        before: ChunkSide,
        after: ChunkSide,
    },
    #[serde(rename = "chunk.moved", rename_all = "camelCase")]
    ChunkMoved {
        mode: Mode,
        file: String,
        before_file: String,
        after_file: String,
        #[serde(default)]
        chunk_id: Option<String>,
        logical_key: String,
        before_range: String,
        after_range: String,
    },
    #[serde(rename = "relation.added", rename_all = "camelCase")]
    RelationAdded {
        mode: Mode,
        file: String,
        before_file: String,
        after_file: String,
        #[serde(default)]
        chunk_id: Option<String>,
        relation_key: String,
    },
    #[serde(rename = "relation.removed", rename_all = "camelCase")]
    RelationRemoved {
        mode: Mode,
        file: String,
        before_file: String,
        after_file: String,
        #[serde(default)]
        chunk_id: Option<String>,
        relation_key: String,
    },
    #[serde(rename = "limits.chunkDiffSkipped", rename_all = "camelCase")]
    ChunkDiffSkipped {
        mode: Mode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<String>,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        changed_files: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before_chunks: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after_chunks: Option<u64>,
    },
}

impl DiffEvent {
    pub fn kind_str(&self) -> &'static str {
        match self {
            DiffEvent::FileAdded { .. } => "file.added",
            DiffEvent::FileRemoved { .. } => "file.removed",
            DiffEvent::FileModified { .. } => "file.modified",
            DiffEvent::FileRenamed { .. } => "file.renamed",
            DiffEvent::ChunkAdded { .. } => "chunk.added",
            DiffEvent::ChunkRemoved { .. } => "chunk.removed",
            DiffEvent::ChunkModified { .. } => "chunk.modified",
            DiffEvent::ChunkMoved { .. } => "chunk.moved",
            DiffEvent::RelationAdded { .. } => "relation.added",
            DiffEvent::RelationRemoved { .. } => "relation.removed",
            DiffEvent::ChunkDiffSkipped { .. } => "limits.chunkDiffSkipped",
        }
    }

    fn kind_rank(&self) -> usize {
        match self {
            DiffEvent::FileAdded { .. } => 0,
            DiffEvent::FileRemoved { .. } => 1,
            DiffEvent::FileModified { .. } => 2,
            DiffEvent::FileRenamed { .. } => 3,
            DiffEvent::ChunkAdded { .. } => 4,
            DiffEvent::ChunkRemoved { .. } => 5,
            DiffEvent::ChunkModified { .. } => 6,
            DiffEvent::ChunkMoved { .. } => 7,
            DiffEvent::RelationAdded { .. } => 8,
            DiffEvent::RelationRemoved { .. } => 9,
            DiffEvent::ChunkDiffSkipped { .. } => 10,
        }
    }

    pub fn mode(&self) -> Mode {
        match self {
            DiffEvent::FileAdded { mode, .. }
            | DiffEvent::FileRemoved { mode, .. }
            | DiffEvent::FileModified { mode, .. }
            | DiffEvent::FileRenamed { mode, .. }
            | DiffEvent::ChunkAdded { mode, .. }
            | DiffEvent::ChunkRemoved { mode, .. }
            | DiffEvent::ChunkModified { mode, .. }
            | DiffEvent::ChunkMoved { mode, .. }
            | DiffEvent::RelationAdded { mode, .. }
            | DiffEvent::RelationRemoved { mode, .. }
            | DiffEvent::ChunkDiffSkipped { mode, .. } => *mode,
        }
    }

    fn file_key(&self) -> &str {
        match self {
            DiffEvent::FileAdded { file, .. }
            | DiffEvent::FileRemoved { file, .. }
            | DiffEvent::FileModified { file, .. }
            | DiffEvent::FileRenamed { file, .. }
            | DiffEvent::ChunkAdded { file, .. }
            | DiffEvent::ChunkRemoved { file, .. }
            | DiffEvent::ChunkModified { file, .. }
            | DiffEvent::ChunkMoved { file, .. }
            | DiffEvent::RelationAdded { file, .. }
            | DiffEvent::RelationRemoved { file, .. } => file,
            DiffEvent::ChunkDiffSkipped { file, .. } => file.as_deref().unwrap_or(""),
        }
    }

    fn before_file_key(&self) -> &str {
        match self {
            DiffEvent::FileRenamed { before_file, .. }
            | DiffEvent::ChunkAdded { before_file, .. }
            | DiffEvent::ChunkRemoved { before_file, .. }
            | DiffEvent::ChunkModified { before_file, .. }
            | DiffEvent::ChunkMoved { before_file, .. }
            | DiffEvent::RelationAdded { before_file, .. }
            | DiffEvent::RelationRemoved { before_file, .. } => before_file,
            _ => "",
        }
    }

    fn after_file_key(&self) -> &str {
        match self {
            DiffEvent::FileRenamed { after_file, .. }
            | DiffEvent::ChunkAdded { after_file, .. }
            | DiffEvent::ChunkRemoved { after_file, .. }
            | DiffEvent::ChunkModified { after_file, .. }
            | DiffEvent::ChunkMoved { after_file, .. }
            | DiffEvent::RelationAdded { after_file, .. }
            | DiffEvent::RelationRemoved { after_file, .. } => after_file,
            _ => "",
        }
    }

    fn chunk_id_key(&self) -> &str {
        match self {
            DiffEvent::ChunkAdded { chunk_id, .. }
            | DiffEvent::ChunkRemoved { chunk_id, .. }
            | DiffEvent::ChunkModified { chunk_id, .. }
            | DiffEvent::ChunkMoved { chunk_id, .. }
            | DiffEvent::RelationAdded { chunk_id, .. }
            | DiffEvent::RelationRemoved { chunk_id, .. } => chunk_id.as_deref().unwrap_or(""),
            _ => "",
        }
    }

    fn logical_key_key(&self) -> &str {
        match self {
            DiffEvent::ChunkAdded { logical_key, .. }
            | DiffEvent::ChunkRemoved { logical_key, .. }
            | DiffEvent::ChunkModified { logical_key, .. }
            | DiffEvent::ChunkMoved { logical_key, .. } => logical_key,
            _ => "",
        }
    }

    fn relation_key_key(&self) -> &str {
        match self {
            DiffEvent::RelationAdded { relation_key, .. }
            | DiffEvent::RelationRemoved { relation_key, .. } => relation_key,
            _ => "",
        }
    }
}

/// The global deterministic ordering: mode rank, then event-kind rank, then
/// the lexicographic composite of identifying keys. This exact order is
/// part of the content-addressed output and must never drift.
pub(crate) fn sort_events(events: &mut [DiffEvent]) {
    events.sort_by(compare_events);
}

fn compare_events(left: &DiffEvent, right: &DiffEvent) -> Ordering {
    left.mode()
        .rank()
        .cmp(&right.mode().rank())
        .then_with(|| left.kind_rank().cmp(&right.kind_rank()))
        .then_with(|| left.file_key().cmp(right.file_key()))
        .then_with(|| left.before_file_key().cmp(right.before_file_key()))
        .then_with(|| left.after_file_key().cmp(right.after_file_key()))
        .then_with(|| left.chunk_id_key().cmp(right.chunk_id_key()))
        .then_with(|| left.logical_key_key().cmp(right.logical_key_key()))
        .then_with(|| left.relation_key_key().cmp(right.relation_key_key()))
}

/// Result of applying the event-count and byte budgets.
#[derive(Clone, Debug)]
pub struct BoundedEvents {
    pub events: Vec<DiffEvent>,
    pub truncated: bool,
    pub reason: Option<&'static str>,
}

/// Truncate a sorted event list to the first N that fit both the count and
/// the cumulative serialized-byte budget. The first breached limit wins.
pub(crate) fn apply_event_bounds(
    sorted: Vec<DiffEvent>,
    max_events: usize,
    max_bytes: usize,
) -> BoundedEvents {
    let mut events = Vec::new();
    let mut bytes = 0usize;
    let mut reason = None;
    for event in sorted {
        if events.len() >= max_events {
            reason = Some("max-events");
            break;
        }
        let line_bytes = serde_json::to_string(&event)
            .map(|line| line.len() + 1)
            .unwrap_or(0);
        if bytes + line_bytes > max_bytes && !events.is_empty() {
            reason = Some("max-bytes");
            break;
        }
        bytes += line_bytes;
        events.push(event);
    }
    BoundedEvents {
        truncated: reason.is_some(),
        reason,
        events,
    }
}

/// Event counts per kind over the untruncated set.
pub(crate) fn event_counts(events: &[DiffEvent]) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for event in events {
        *counts.entry(event.kind_str().to_string()).or_insert(0) += 1;
    }
    counts
}

/// Per-mode summary carried in `summary.json`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeSummary {
    pub total_events: u64,
    #[serde(default)]
    pub by_kind: BTreeMap<String, u64>,
    #[serde(default)]
    pub fast_path: bool,
    #[serde(default)]
    pub chunk_diff_skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

pub(crate) fn summarize_mode(
    events: &[DiffEvent],
    fast_path: bool,
    chunk_diff_skipped: Option<&str>,
) -> ModeSummary {
    ModeSummary {
        total_events: events.len() as u64,
        by_kind: event_counts(events),
        fast_path,
        chunk_diff_skipped: chunk_diff_skipped.is_some(),
        skip_reason: chunk_diff_skipped.map(str::to_string),
    }
}
