use serde::Serialize;
use sift_core::Result;
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

const RENAME_ATTEMPTS: usize = 10;
const RENAME_BASE_DELAY: Duration = Duration::from_millis(20);

/// Error kinds we treat as transient for renames: another writer racing the
/// same target, an AV scanner holding the file, or a staging dir landing on
/// a different filesystem.
fn is_transient_rename_kind(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::AlreadyExists
            | ErrorKind::PermissionDenied
            | ErrorKind::DirectoryNotEmpty
            | ErrorKind::CrossesDevices
            | ErrorKind::ResourceBusy
    )
}

/// Atomically replace `path` with `bytes`.
///
/// The payload is written to a uniquely named temp sibling, fsynced, then
/// renamed over the target; the parent directory is fsynced best-effort so
/// the rename itself is durable. A reader can never observe a partial file.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    atomic_write_with(path, |file| {
        file.write_all(bytes)?;
        Ok(())
    })
}

/// Atomically replace `path` with the JSON serialization of `value`.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    atomic_write(path, &payload)
}

/// Atomically replace `path` with UTF-8 text.
pub fn atomic_write_text(path: &Path, text: &str) -> Result<()> {
    atomic_write(path, text.as_bytes())
}

fn atomic_write_with(path: &Path, write: impl FnOnce(&mut fs::File) -> Result<()>) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Err(io::Error::other("path has no parent").into());
    };
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };

    fs::create_dir_all(parent)?;

    let (tmp_path, mut file) = open_unique_tmp_file(path, parent)?;
    let write_result = (|| -> Result<()> {
        write(&mut file)?;
        file.sync_all()?;
        Ok(())
    })();
    drop(file);
    if let Err(err) = write_result {
        remove_tmp_best_effort(&tmp_path, "write failure");
        return Err(err);
    }

    match rename_replace_file(&tmp_path, path) {
        Ok(()) => {
            sync_dir_best_effort(parent);
            Ok(())
        }
        Err(err) => {
            remove_tmp_best_effort(&tmp_path, "rename failure");
            Err(err.into())
        }
    }
}

/// Rename `tmp_path` over `dest` with a capped retry loop, falling back to
/// copy+remove across devices and to a backup swap when retries exhaust.
fn rename_replace_file(tmp_path: &Path, dest: &Path) -> io::Result<()> {
    let mut last_err = None;
    for attempt in 0..RENAME_ATTEMPTS {
        match fs::rename(tmp_path, dest) {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == ErrorKind::CrossesDevices => {
                // Temp siblings normally share the target's filesystem, but
                // long-path fallbacks can land elsewhere.
                return copy_remove_fallback(tmp_path, dest);
            }
            Err(err) if is_transient_rename_kind(err.kind()) => {
                // On Windows `rename` doesn't overwrite; under concurrent
                // writers multiple remove+rename sequences can race.
                if err.kind() == ErrorKind::AlreadyExists || dest.exists() {
                    match fs::remove_file(dest) {
                        Ok(()) => {}
                        Err(remove_err) if remove_err.kind() == ErrorKind::NotFound => {}
                        Err(_) => {}
                    }
                }
                last_err = Some(err);
                std::thread::sleep(RENAME_BASE_DELAY * (attempt as u32 + 1));
            }
            Err(err) => return Err(err),
        }
    }

    // Retries exhausted on a transient kind; swap through a backup so the
    // destination is never left missing.
    match backup_swap(tmp_path, dest) {
        Ok(()) => Ok(()),
        Err(swap_err) => Err(last_err.unwrap_or(swap_err)),
    }
}

fn copy_remove_fallback(tmp_path: &Path, dest: &Path) -> io::Result<()> {
    fs::copy(tmp_path, dest)?;
    match fs::remove_file(tmp_path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            tracing::debug!(
                target = "sift.storage",
                path = %tmp_path.display(),
                error = %err,
                "failed to remove temp file after cross-device copy"
            );
        }
    }
    Ok(())
}

/// Move the existing target aside, move the temp file in, then delete the
/// backup. If the final rename fails the backup is restored, so the target
/// is never left missing.
fn backup_swap(tmp_path: &Path, dest: &Path) -> io::Result<()> {
    let backup = unique_sibling(dest, "bak");
    let mut moved_existing = false;
    match fs::rename(dest, &backup) {
        Ok(()) => moved_existing = true,
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    match fs::rename(tmp_path, dest) {
        Ok(()) => {
            if moved_existing {
                if let Err(err) = fs::remove_file(&backup) {
                    if err.kind() != ErrorKind::NotFound {
                        tracing::debug!(
                            target = "sift.storage",
                            path = %backup.display(),
                            error = %err,
                            "failed to remove backup after swap"
                        );
                    }
                }
            }
            Ok(())
        }
        Err(err) => {
            if moved_existing && !dest.exists() {
                let _ = fs::rename(&backup, dest);
            }
            Err(err)
        }
    }
}

/// Atomically promote `staging` into `dest`, replacing any existing
/// directory tree.
///
/// An existing destination is moved aside first and deleted only once the
/// promotion rename succeeds; on failure it is restored.
pub fn replace_dir(staging: &Path, dest: &Path) -> Result<()> {
    if !staging.exists() {
        return Err(io::Error::new(
            ErrorKind::NotFound,
            format!("staging dir missing before replace: {}", staging.display()),
        )
        .into());
    }

    let backup = unique_sibling(dest, "bak");
    let mut moved_existing = false;
    match fs::rename(dest, &backup) {
        Ok(()) => moved_existing = true,
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }

    let mut last_err = None;
    for attempt in 0..RENAME_ATTEMPTS {
        match fs::rename(staging, dest) {
            Ok(()) => {
                last_err = None;
                break;
            }
            Err(err) if is_transient_rename_kind(err.kind()) => {
                last_err = Some(err);
                std::thread::sleep(RENAME_BASE_DELAY * (attempt as u32 + 1));
            }
            Err(err) => {
                last_err = Some(err);
                break;
            }
        }
    }

    match last_err {
        None => {
            if moved_existing {
                if let Err(err) = fs::remove_dir_all(&backup) {
                    if err.kind() != ErrorKind::NotFound {
                        tracing::debug!(
                            target = "sift.storage",
                            path = %backup.display(),
                            error = %err,
                            "failed to remove directory backup after replace"
                        );
                    }
                }
            }
            if let Some(parent) = dest.parent() {
                sync_dir_best_effort(parent);
            }
            Ok(())
        }
        Some(err) => {
            if moved_existing && !dest.exists() {
                let _ = fs::rename(&backup, dest);
            }
            Err(err.into())
        }
    }
}

fn remove_tmp_best_effort(tmp_path: &Path, reason: &'static str) {
    if let Err(err) = fs::remove_file(tmp_path) {
        if err.kind() != ErrorKind::NotFound {
            tracing::debug!(
                target = "sift.storage",
                path = %tmp_path.display(),
                reason,
                error = %err,
                "failed to remove temporary file"
            );
        }
    }
}

fn sync_dir_best_effort(dir: &Path) {
    #[cfg(unix)]
    {
        match fs::File::open(dir).and_then(|dir| dir.sync_all()) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                tracing::debug!(
                    target = "sift.storage",
                    dir = %dir.display(),
                    error = %err,
                    "failed to sync directory (best effort)"
                );
            }
        }
    }

    #[cfg(not(unix))]
    let _ = dir;
}

fn open_unique_tmp_file(dest: &Path, parent: &Path) -> io::Result<(PathBuf, fs::File)> {
    let file_name = dest
        .file_name()
        .ok_or_else(|| io::Error::other("destination path has no file name"))?;
    let pid = std::process::id();

    loop {
        let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(format!(".tmp.{pid}.{counter}"));
        let tmp_path = parent.join(tmp_name);

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
        {
            Ok(file) => return Ok((tmp_path, file)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
}

fn unique_sibling(path: &Path, suffix: &str) -> PathBuf {
    let pid = std::process::id();
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "target".to_string());
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    for attempt in 0..1000u32 {
        let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let candidate = parent.join(format!(".{name}.{suffix}-{pid}-{counter}-{attempt}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    parent.join(format!(".{name}.{suffix}-{pid}"))
}
