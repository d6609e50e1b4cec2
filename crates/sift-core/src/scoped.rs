//! Cache-root path discipline.
//!
//! Every component that resolves a path stored in a manifest or pointer file
//! goes through these checks, so the "does this escape the repo cache?"
//! decision lives in exactly one place.

use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};

/// Lexical containment check: `target` is `root` or below it.
///
/// Case-insensitive on Windows to match the filesystem. Neither path is
/// canonicalized; callers resolve symlinks first when they care.
pub fn within_root(root: &Path, target: &Path) -> bool {
    if cfg!(windows) {
        let root_lower = root.to_string_lossy().to_lowercase();
        let target_lower = target.to_string_lossy().to_lowercase();
        return target_lower == root_lower
            || target_lower.starts_with(&format!("{root_lower}{}", std::path::MAIN_SEPARATOR));
    }
    target.strip_prefix(root).is_ok()
}

/// Whether a string looks like an absolute path on any platform we persist
/// for: Unix (`/...`), Windows drive (`C:\...` / `C:/...`), or UNC (`\\...`).
pub fn is_absolute_path_any(value: &str) -> bool {
    if value.starts_with('/') || value.starts_with('\\') {
        return true;
    }
    let bytes = value.as_bytes();
    if bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'/' || bytes[2] == b'\\')
    {
        return true;
    }
    false
}

/// Whether a manifest-recorded relative path is safe to join under a root:
/// non-empty, relative, forward-slash shaped, no `..` or empty segments.
pub fn is_manifest_path_safe(value: &str) -> bool {
    if value.is_empty() || is_absolute_path_any(value) || value.contains('\\') {
        return false;
    }
    value
        .split('/')
        .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}

/// Normalize a path to forward slashes for persistence.
pub fn to_posix(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                if !out.is_empty() {
                    out.push('/');
                }
                out.push_str(&part.to_string_lossy());
            }
            Component::CurDir => {}
            other => {
                // Absolute/parent components are preserved verbatim; callers
                // screen them out with `is_manifest_path_safe` first.
                if !out.is_empty() {
                    out.push('/');
                }
                out.push_str(&other.as_os_str().to_string_lossy());
            }
        }
    }
    out
}

/// Turn a persisted forward-slash relative path back into a native path.
pub fn from_posix(value: &str) -> PathBuf {
    value.split('/').collect()
}

/// Express `absolute` as a repo-cache-relative, traversal-safe posix path.
///
/// Used at write time by everything that persists a build root: absolute
/// paths never land in a manifest, and a path outside the cache boundary is
/// rejected with a typed error rather than silently recorded.
pub fn relative_to_cache_root(cache_root: &Path, absolute: &Path, label: &str) -> Result<String> {
    let root = cache_root
        .canonicalize()
        .unwrap_or_else(|_| cache_root.to_path_buf());
    let resolved = absolute
        .canonicalize()
        .unwrap_or_else(|_| absolute.to_path_buf());
    if !within_root(&root, &resolved) {
        return Err(Error::invalid_request(format!(
            "{label} escapes repo cache root."
        )));
    }
    let relative = resolved
        .strip_prefix(&root)
        .map_err(|_| Error::invalid_request(format!("{label} escapes repo cache root.")))?;
    let posix = to_posix(relative);
    if !is_manifest_path_safe(&posix) {
        return Err(Error::invalid_request(format!(
            "{label} must be repo-cache-relative and traversal-safe."
        )));
    }
    Ok(posix)
}
