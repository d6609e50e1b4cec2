use rand::Rng as _;
use serde::{Deserialize, Serialize};
use sift_core::{now_iso, parse_iso_ms, Result};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub const DEFAULT_LOCK_WAIT_MS: u64 = 0;
pub const DEFAULT_LOCK_POLL_MS: u64 = 100;
pub const DEFAULT_LOCK_STALE_MS: u64 = 30 * 60 * 1000;

/// Acquisition parameters for the advisory index lock.
#[derive(Clone, Copy, Debug)]
pub struct LockOptions {
    /// How long to keep polling before giving up. Zero means a single
    /// non-blocking attempt, which is the default: contention is surfaced to
    /// the caller, never hidden behind queueing.
    pub wait_ms: u64,
    /// Poll interval while waiting.
    pub poll_ms: u64,
    /// Age past which a holder is considered dead and its lockfile removed.
    pub stale_ms: u64,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            wait_ms: DEFAULT_LOCK_WAIT_MS,
            poll_ms: DEFAULT_LOCK_POLL_MS,
            stale_ms: DEFAULT_LOCK_STALE_MS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockPayload {
    pid: u32,
    lock_id: String,
    started_at: String,
}

/// An acquired advisory lock over the repo cache.
///
/// The lockfile is removed when the value is dropped, but only if it is
/// still owned by this acquisition (lock-id comparison), so a stale-takeover
/// by another process is never clobbered.
#[derive(Debug)]
pub struct IndexLock {
    path: PathBuf,
    payload: LockPayload,
}

impl IndexLock {
    /// Try to acquire the lock at `path`.
    ///
    /// Returns `Ok(None)` when the lock is held by a live owner and the wait
    /// budget is exhausted; callers surface that as a queue-overloaded
    /// error. A holder older than `stale_ms` (by payload `startedAt` or
    /// lockfile mtime) is swept and acquisition retried.
    pub fn acquire(path: &Path, options: &LockOptions) -> Result<Option<IndexLock>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let deadline = (options.wait_ms > 0)
            .then(|| Instant::now() + Duration::from_millis(options.wait_ms));
        let poll = Duration::from_millis(options.poll_ms.max(1));

        loop {
            let payload = LockPayload {
                pid: std::process::id(),
                lock_id: new_lock_id(),
                started_at: now_iso(),
            };
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let bytes = serde_json::to_vec(&payload)?;
                    file.write_all(&bytes)?;
                    file.sync_all()?;
                    return Ok(Some(IndexLock {
                        path: path.to_path_buf(),
                        payload,
                    }));
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(path, options.stale_ms) {
                        tracing::debug!(
                            target = "sift.storage",
                            path = %path.display(),
                            stale_ms = options.stale_ms,
                            "removing stale index lock"
                        );
                        match fs::remove_file(path) {
                            Ok(()) => continue,
                            Err(err) if err.kind() == ErrorKind::NotFound => continue,
                            Err(err) => return Err(err.into()),
                        }
                    }

                    match deadline {
                        Some(deadline) if Instant::now() < deadline => {
                            std::thread::sleep(poll);
                        }
                        _ => return Ok(None),
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        let owned = match read_payload(&self.path) {
            Some(info) => info.lock_id == self.payload.lock_id,
            // Unreadable payload with the file still present: leave it to the
            // stale sweep rather than guessing at ownership.
            None => !self.path.exists(),
        };
        if !owned {
            return;
        }
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                tracing::debug!(
                    target = "sift.storage",
                    path = %self.path.display(),
                    error = %err,
                    "failed to release index lock"
                );
            }
        }
    }
}

fn read_payload(path: &Path) -> Option<LockPayload> {
    let raw = fs::read(path).ok()?;
    serde_json::from_slice(&raw).ok()
}

fn is_stale(path: &Path, stale_ms: u64) -> bool {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    if let Some(info) = read_payload(path) {
        if let Some(started_ms) = parse_iso_ms(&info.started_at) {
            if now_ms.saturating_sub(started_ms) > stale_ms as i64 {
                return true;
            }
        }
    }

    match fs::metadata(path).and_then(|meta| meta.modified()) {
        Ok(modified) => {
            let modified_ms = modified
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            now_ms.saturating_sub(modified_ms) > stale_ms as i64
        }
        Err(_) => false,
    }
}

fn new_lock_id() -> String {
    let mut rng = rand::thread_rng();
    let entropy: u64 = rng.gen();
    format!("{}-{:016x}", std::process::id(), entropy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquisition_fails_without_waiting() {
        let tmp = tempfile::tempdir().unwrap();
        let lock_path = tmp.path().join("index.lock");
        let held = IndexLock::acquire(&lock_path, &LockOptions::default())
            .unwrap()
            .expect("first acquisition succeeds");
        let second = IndexLock::acquire(&lock_path, &LockOptions::default()).unwrap();
        assert!(second.is_none());
        drop(held);
        let third = IndexLock::acquire(&lock_path, &LockOptions::default()).unwrap();
        assert!(third.is_some());
    }

    #[test]
    fn drop_releases_the_lockfile() {
        let tmp = tempfile::tempdir().unwrap();
        let lock_path = tmp.path().join("index.lock");
        {
            let _lock = IndexLock::acquire(&lock_path, &LockOptions::default())
                .unwrap()
                .unwrap();
            assert!(lock_path.is_file());
        }
        assert!(!lock_path.exists());
    }

    #[test]
    fn stale_holder_is_swept() {
        let tmp = tempfile::tempdir().unwrap();
        let lock_path = tmp.path().join("index.lock");
        // Fabricate a holder that started long ago.
        std::fs::write(
            &lock_path,
            serde_json::to_vec(&LockPayload {
                pid: 1,
                lock_id: "dead".to_string(),
                started_at: "2001-01-01T00:00:00.000Z".to_string(),
            })
            .unwrap(),
        )
        .unwrap();

        let lock = IndexLock::acquire(
            &lock_path,
            &LockOptions {
                stale_ms: 1000,
                ..LockOptions::default()
            },
        )
        .unwrap();
        assert!(lock.is_some());
    }

    #[test]
    fn drop_does_not_clobber_a_takeover() {
        let tmp = tempfile::tempdir().unwrap();
        let lock_path = tmp.path().join("index.lock");
        let lock = IndexLock::acquire(&lock_path, &LockOptions::default())
            .unwrap()
            .unwrap();
        // Simulate another process taking the lock over after a stale sweep.
        std::fs::write(
            &lock_path,
            serde_json::to_vec(&LockPayload {
                pid: 2,
                lock_id: "other".to_string(),
                started_at: now_iso(),
            })
            .unwrap(),
        )
        .unwrap();
        drop(lock);
        assert!(lock_path.exists());
    }
}
