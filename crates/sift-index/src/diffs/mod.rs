//! Deterministic structural diffs between two resolved index versions.
//!
//! Diff output is a content-addressed artifact: identical inputs must
//! produce the same `diff_<hash>` id and the same byte-for-byte event
//! ordering. Everything here sorts on fixed ranks and lexicographic
//! composites, never on traversal order.

mod chunk;
mod compute;
mod events;
mod registry;

pub use compute::{
    compute_diff, list_diffs, prune_diffs, show_diff, CompatReport, DiffFormat, DiffOptions,
    DiffOutcome, DiffPruneOutcome, DiffRequest, ModeCompat, ShownDiff, DEFAULT_MAX_BYTES,
    DEFAULT_MAX_CHANGED_FILES, DEFAULT_MAX_CHUNKS_PER_FILE, DEFAULT_MAX_DIFFS,
    DEFAULT_MAX_EVENTS, DEFAULT_RETAIN_DAYS,
};
pub use events::{BoundedEvents, ChunkSide, DiffEvent, FileSummary, ModeSummary};
pub use registry::{
    DiffEndpoint, DiffInputs, DiffLimits, DiffManifestEntry, DiffSummary, DiffTotals,
    DiffsManifest,
};
