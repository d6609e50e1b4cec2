use crate::error::Result;
use serde_json::Value;
use sha1::{Digest as _, Sha1};
use sha2::Sha256;
use std::io::Read;
use std::path::Path;

/// Serialize a JSON value with recursively key-sorted objects and no
/// whitespace.
///
/// Every identity hash in the subsystem is computed over this form, so two
/// semantically equal documents always hash identically regardless of the
/// insertion order their maps happened to have.
pub fn canonical_json_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Keys are plain strings; serde_json handles escaping.
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// SHA-1 of a byte slice as lowercase hex.
pub fn sha1_hex(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes.as_ref());
    hex::encode(hasher.finalize())
}

/// Stable SHA-1 hash of a JSON value (canonical form).
pub fn stable_hash(value: &Value) -> String {
    sha1_hex(canonical_json_string(value))
}

/// Streaming SHA-1 of a file's contents as lowercase hex.
///
/// Piece checksums recorded by older builds are SHA-1; verification has to
/// speak both digests.
pub fn sha1_hex_file(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = [0_u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Streaming SHA-256 of a reader's contents as lowercase hex.
pub fn sha256_hex_reader(mut reader: impl Read) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Streaming SHA-256 of a file's contents as lowercase hex.
///
/// Streams so that large copied artifacts are never read into memory whole
/// during freeze verification.
pub fn sha256_hex_file(path: impl AsRef<Path>) -> Result<String> {
    let file = std::fs::File::open(path)?;
    sha256_hex_reader(file)
}
