//! Durable, mergeable record of one build's progress and metadata.
//!
//! One document per build root (`build_state.json`), mutated only by its
//! owning build process through merge-patches. Progress and stage
//! checkpoints live in sidecar files so hot-path flushes rewrite only what
//! changed; every mutation also feeds an append-only event log and a
//! field-level delta log.
//!
//! No cross-process lock guards this store: correctness relies on the
//! single-owning-process assumption plus content-addressed no-op writes
//! that make redundant flushes free.

mod logs;
mod merge;
mod model;
mod store;

pub use model::{
    read_build_state_file, BuildState, BuildValidation, ModeProgress, OrderingLedger, PhaseState,
    StageLedger, ToolInfo, BUILD_STATE_FILE, ORDERING_LEDGER_SCHEMA_VERSION, STATE_SCHEMA_VERSION,
};
pub use store::{
    BuildStateStore, Durability, InitBuildState, StateEvent, StatePatch, WriteFailure,
};
