use chrono::{DateTime, SecondsFormat, Utc};

/// Current time as an RFC 3339 UTC string with millisecond precision.
///
/// This is the timestamp format every persisted document in the subsystem
/// uses (`createdAt`, `updatedAt`, `frozenAt`, ...).
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Tolerant parse of a persisted timestamp into epoch milliseconds.
///
/// Missing or unparsable values return `None`; recency sorts treat them as
/// 0 so malformed entries sink to the old end instead of failing the call.
pub fn parse_iso_ms(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc).timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_parse() {
        let now = now_iso();
        assert!(parse_iso_ms(&now).is_some());
    }

    #[test]
    fn garbage_parses_to_none() {
        assert_eq!(parse_iso_ms("not-a-date"), None);
        assert_eq!(parse_iso_ms(""), None);
    }
}
