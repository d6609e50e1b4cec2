//! Lifecycle management for the versioned on-disk code-search index:
//! resolving symbolic index references, persisting incremental build
//! progress, creating and freezing immutable snapshots, and computing
//! deterministic structural diffs between two index versions.
//!
//! ## On-disk layout (inventory)
//!
//! Everything lives under the repo-scoped cache root (see
//! [`sift_core::IndexCacheDir`]):
//! - `builds/current.json`: `{buildId, buildRoot, buildRoots}` pointer
//! - `builds/<id>/build_state.json` + sidecars
//!   (`build_state.progress.json`, `stage_checkpoints.v1.*.json` +
//!   `stage_checkpoints.v1.index.json`) + append-only logs
//!   (`build_state.events.jsonl`, `build_state.deltas.jsonl`)
//! - `snapshots/manifest.json`; `snapshots/<id>/snapshot.json`,
//!   `frozen.json`, `frozen/` (immutable copy), `frozen.staging-<token>/`
//!   (transient)
//! - `diffs/manifest.json`; `diffs/<id>/inputs.json`, `summary.json`,
//!   `events.jsonl`
//!
//! Mutations to the snapshot and diff registries run under the advisory
//! index lock; readers never take it and rely on atomic-replace writes.

pub mod artifacts;
pub mod build_state;
pub mod contracts;
pub mod diffs;
pub mod refs;
pub mod snapshots;

pub use sift_core::{CacheConfig, Error, ErrorCode, IndexCacheDir, Mode, Result};
