use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An independent indexing lane over the same repository.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Mode {
    #[serde(rename = "code")]
    Code,
    #[serde(rename = "prose")]
    Prose,
    #[serde(rename = "extracted-prose")]
    ExtractedProse,
    #[serde(rename = "records")]
    Records,
}

impl Mode {
    pub const ALL: [Mode; 4] = [Mode::Code, Mode::Prose, Mode::ExtractedProse, Mode::Records];

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Code => "code",
            Mode::Prose => "prose",
            Mode::ExtractedProse => "extracted-prose",
            Mode::Records => "records",
        }
    }

    /// Fixed ordering rank used wherever mode order must be deterministic
    /// (diff event ordering, mode normalization).
    pub fn rank(self) -> usize {
        match self {
            Mode::Code => 0,
            Mode::Prose => 1,
            Mode::ExtractedProse => 2,
            Mode::Records => 3,
        }
    }

    pub fn parse(raw: &str) -> Result<Mode> {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "code" => Ok(Mode::Code),
            "prose" => Ok(Mode::Prose),
            "extracted-prose" => Ok(Mode::ExtractedProse),
            "records" => Ok(Mode::Records),
            _ => Err(Error::invalid_request(format!(
                "Invalid mode \"{normalized}\". Use code|prose|extracted-prose|records."
            ))),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize a requested mode list: trim, lowercase, dedup, preserve request
/// order. An empty request selects every mode.
pub fn normalize_modes<S: AsRef<str>>(requested: &[S]) -> Result<Vec<Mode>> {
    let mut resolved = Vec::new();
    for raw in requested {
        let token = raw.as_ref().trim();
        if token.is_empty() {
            continue;
        }
        let mode = Mode::parse(token)?;
        if !resolved.contains(&mode) {
            resolved.push(mode);
        }
    }
    if resolved.is_empty() {
        return Ok(Mode::ALL.to_vec());
    }
    Ok(resolved)
}

/// Parse a comma/whitespace separated mode list, e.g. `"code,prose"`.
pub fn parse_mode_list(raw: &str) -> Result<Vec<Mode>> {
    let tokens: Vec<&str> = raw
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .collect();
    normalize_modes(&tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_request_selects_all_modes() {
        let modes = normalize_modes::<&str>(&[]).unwrap();
        assert_eq!(modes, Mode::ALL.to_vec());
    }

    #[test]
    fn normalization_dedups_and_preserves_order() {
        let modes = normalize_modes(&["Prose", "code", "prose"]).unwrap();
        assert_eq!(modes, vec![Mode::Prose, Mode::Code]);
    }

    #[test]
    fn unknown_mode_is_invalid_request() {
        let err = normalize_modes(&["sql"]).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::InvalidRequest);
    }

    #[test]
    fn mode_list_splits_on_commas_and_whitespace() {
        let modes = parse_mode_list("code, records\nprose").unwrap();
        assert_eq!(modes, vec![Mode::Code, Mode::Records, Mode::Prose]);
    }
}
