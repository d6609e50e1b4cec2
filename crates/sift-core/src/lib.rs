//! Shared types for the sift index lifecycle: the closed error taxonomy,
//! indexing modes, canonical JSON hashing, cache-root path discipline, and
//! the repo-scoped cache directory layout.
//!
//! ## On-disk layout (inventory)
//!
//! Repo-scoped caches live under `<cache_root>/<repo_hash>/`:
//! - `builds/current.json`: pointer to the latest build roots by mode
//! - `builds/<id>/`: one build root (`build_state.json` + sidecars + logs)
//! - `snapshots/manifest.json` + `snapshots/<id>/`: snapshot registry
//! - `diffs/manifest.json` + `diffs/<id>/`: diff registry
//! - `index.lock`: advisory lockfile guarding registry mutations

mod cache_dir;
mod error;
mod hash;
mod mode;
mod scoped;
mod time;

pub use cache_dir::{CacheConfig, IndexCacheDir};
pub use error::{Error, ErrorCode, Result};
pub use hash::{
    canonical_json_string, sha1_hex, sha1_hex_file, sha256_hex_file, sha256_hex_reader,
    stable_hash,
};
pub use mode::{normalize_modes, parse_mode_list, Mode};
pub use scoped::{
    from_posix, is_absolute_path_any, is_manifest_path_safe, relative_to_cache_root, to_posix,
    within_root,
};
pub use time::{now_iso, parse_iso_ms};
