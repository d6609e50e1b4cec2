//! Pointer snapshots over validated builds, immutable frozen copies, and
//! retention/GC over the snapshot registry.
//!
//! Every mutating call runs under the advisory index lock and fails fast
//! with `QueueOverloaded` when the lock is held; readers go straight to the
//! atomically-replaced manifest.

mod create;
mod freeze;
mod registry;

pub use create::{
    create_pointer_snapshot, list_snapshots, prune_snapshots, remove_snapshot, show_snapshot,
    CreateSnapshotOptions, CreatedSnapshot, PruneOutcome, RemoveOutcome, SnapshotDetails,
    DEFAULT_MAX_POINTER_SNAPSHOTS,
};
pub use freeze::{
    freeze_snapshot, gc_snapshots, FreezeMethod, FreezeOptions, FreezeOutcome, GcOptions,
    GcOutcome, IncludeSqlite, DEFAULT_KEEP_FROZEN, DEFAULT_KEEP_POINTER,
};
pub use registry::{
    FrozenIncluded, FrozenRecord, FrozenVerification, SnapshotEntry, SnapshotPointer,
    SnapshotProvenance, SnapshotRecord, SnapshotsManifest,
};

pub(crate) use registry::{
    load_frozen_record, load_snapshot_record, load_snapshots_manifest, snapshot_dir,
    with_snapshot_lock,
};
