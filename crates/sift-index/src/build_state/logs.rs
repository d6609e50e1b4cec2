//! Append-only JSONL logs for the build state store.
//!
//! The event log carries the caller's structured events; the delta log
//! carries field-level `{op:"set", path, value}` entries. Both rotate past a
//! size cap; the rotated segment is renamed aside and gzipped, and a fresh
//! or freshly-rotated delta segment opens with a full-state `snapshot` line
//! so replay can start from any rotation boundary.

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{Map, Value};
use sift_core::{now_iso, Result};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) const EVENT_LOG_MAX_BYTES: u64 = 2 * 1024 * 1024;
pub(crate) const DELTA_LOG_MAX_BYTES: u64 = 4 * 1024 * 1024;

/// Append JSON lines to `path`, rotating first when the file is past `cap`.
///
/// Returns whether the target was fresh (absent or just rotated) so the
/// delta log can lead with a snapshot line.
fn append_lines(path: &Path, lines: &[String], cap: u64) -> Result<bool> {
    let mut fresh = true;
    match fs::metadata(path) {
        Ok(meta) => {
            if meta.len() >= cap {
                rotate_and_gzip(path);
            } else {
                fresh = false;
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }

    let mut payload = String::new();
    for line in lines {
        payload.push_str(line);
        payload.push('\n');
    }
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(payload.as_bytes())?;
    Ok(fresh)
}

/// Rename the full segment aside (`<stem>.<millis>.jsonl`) and gzip it.
///
/// Rotation is best-effort: a failure leaves the original log growing, which
/// is preferable to losing appended history.
fn rotate_and_gzip(path: &Path) {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let rotated = path.with_extension(format!("{millis}.jsonl"));
    if let Err(err) = fs::rename(path, &rotated) {
        tracing::debug!(
            target = "sift.build_state",
            path = %path.display(),
            error = %err,
            "failed to rotate log segment"
        );
        return;
    }
    if let Err(err) = gzip_file(&rotated) {
        tracing::debug!(
            target = "sift.build_state",
            path = %rotated.display(),
            error = %err,
            "failed to gzip rotated log segment"
        );
    }
}

fn gzip_file(path: &Path) -> Result<()> {
    let payload = fs::read(path)?;
    let gz_path = {
        let mut name = path.as_os_str().to_os_string();
        name.push(".gz");
        std::path::PathBuf::from(name)
    };
    let file = fs::File::create(&gz_path)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(&payload)?;
    encoder.finish()?;
    fs::remove_file(path)?;
    Ok(())
}

/// Append structured events to the event log.
pub(crate) fn append_events(events_path: &Path, events: &[Value]) -> Result<()> {
    if events.is_empty() {
        return Ok(());
    }
    let lines: Vec<String> = events.iter().map(|event| event.to_string()).collect();
    append_lines(events_path, &lines, EVENT_LOG_MAX_BYTES)?;
    Ok(())
}

/// Append field-level deltas, leading with a `snapshot` line whenever the
/// segment is fresh.
pub(crate) fn append_deltas(
    deltas_path: &Path,
    deltas: &[Value],
    snapshot: &Map<String, Value>,
) -> Result<()> {
    if deltas.is_empty() {
        return Ok(());
    }

    let fresh = match fs::metadata(deltas_path) {
        Ok(meta) => meta.len() >= DELTA_LOG_MAX_BYTES,
        Err(_) => true,
    };

    let mut lines = Vec::with_capacity(deltas.len() + 1);
    if fresh {
        lines.push(
            serde_json::json!({
                "op": "snapshot",
                "value": Value::Object(snapshot.clone()),
                "ts": now_iso(),
            })
            .to_string(),
        );
    }
    for delta in deltas {
        lines.push(delta.to_string());
    }
    append_lines(deltas_path, &lines, DELTA_LOG_MAX_BYTES)?;
    Ok(())
}

/// Expand a split patch into `{op:"set", path, value, ts}` delta entries:
/// one per top-level main field, one per patched progress mode, one per
/// patched checkpoint mode.
pub(crate) fn delta_entries(
    main: &Map<String, Value>,
    progress: Option<&Map<String, Value>>,
    checkpoints: Option<&Map<String, Value>>,
) -> Vec<Value> {
    let ts = now_iso();
    let mut entries = Vec::new();
    let mut push = |path: String, value: &Value| {
        entries.push(serde_json::json!({
            "op": "set",
            "path": path,
            "value": value,
            "ts": ts,
        }));
    };
    for (key, value) in main {
        push(format!("/{key}"), value);
    }
    if let Some(progress) = progress {
        for (mode, value) in progress {
            push(format!("/progress/{mode}"), value);
        }
    }
    if let Some(checkpoints) = checkpoints {
        for (mode, value) in checkpoints {
            push(format!("/stageCheckpoints/{mode}"), value);
        }
    }
    entries
}
