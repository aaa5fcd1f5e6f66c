//! # Id and Time Helpers
//!
//! Every outbound envelope, ping and parsed update carries an id and a
//! millisecond timestamp. These helpers keep their format in one place.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

/// Generates a short, random correlation id (9 lowercase hex characters).
///
/// Ids only need to be unique among the in-flight pings and the updates of a
/// single session, so the first 36 bits of a v4 UUID are plenty.
pub fn generate_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(9);
    id
}

/// Current wall-clock time in Unix epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Today's UTC date as `YYYY-MM-DD`.
pub fn today_utc() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

/// Formats epoch milliseconds as a fixed-width, zero-padded string.
///
/// Keys built from this sort lexicographically in time order.
pub fn fixed_width_millis(millis: i64) -> String {
    format!("{:013}", millis.max(0))
}

/// Renders epoch milliseconds as RFC 3339 with millisecond precision.
pub fn millis_to_rfc3339(millis: i64) -> String {
    match Utc.timestamp_millis_opt(millis).single() {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => String::new(),
    }
}

/// Parses either epoch milliseconds or an RFC 3339 string into epoch milliseconds.
pub fn parse_timestamp(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis())
            .or_else(|| s.parse::<i64>().ok()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_are_short_and_distinct() {
        let a = generate_id();
        let b = generate_id();
        assert_eq!(a.len(), 9);
        assert_ne!(a, b);
    }

    #[test]
    fn fixed_width_keys_sort_in_time_order() {
        let early = fixed_width_millis(999_999_999_999);
        let late = fixed_width_millis(1_000_000_000_000);
        assert_eq!(early.len(), late.len());
        assert!(early < late);
    }

    #[test]
    fn timestamps_accept_millis_and_rfc3339() {
        assert_eq!(parse_timestamp(&json!(1_700_000_000_123i64)), Some(1_700_000_000_123));
        assert_eq!(
            parse_timestamp(&json!("2023-11-14T22:13:20.123Z")),
            Some(1_700_000_000_123)
        );
        assert_eq!(parse_timestamp(&json!(true)), None);
    }
}
