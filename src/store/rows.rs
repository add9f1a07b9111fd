//! Column codecs shared by the store modules.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;

/// Canonical timestamp encoding: RFC 3339, UTC, millisecond precision.
///
/// Fixed width, so SQL string comparison orders timestamps correctly.
pub fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn fmt_opt_ts(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(fmt_ts)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(ndt.and_utc());
    }
    Err(DatabaseError::Serialization(format!("bad timestamp {s:?}")))
}

pub fn parse_optional_datetime(s: &Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(parse_datetime).transpose()
}

pub fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s:?}: {e}")))
}

/// Drop sub-millisecond precision so values compare equal after a round trip.
pub fn truncate_ts(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.trunc_subsecs(3)
}

pub fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

pub fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_are_fixed_width_and_ordered() {
        let a = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(1500);
        let (sa, sb) = (fmt_ts(a), fmt_ts(b));
        assert_eq!(sa, "2026-01-01T00:00:00.000Z");
        assert_eq!(sa.len(), sb.len());
        assert!(sa < sb);
        assert_eq!(parse_datetime(&sb).unwrap(), b);
    }

    #[test]
    fn parses_sqlite_datetime() {
        let dt = parse_datetime("2026-03-04 05:06:07").unwrap();
        assert_eq!(fmt_ts(dt), "2026-03-04T05:06:07.000Z");
    }

    #[test]
    fn corrupt_timestamp_is_an_error() {
        assert!(matches!(
            parse_datetime("yesterday-ish"),
            Err(DatabaseError::Serialization(_))
        ));
        assert_eq!(parse_optional_datetime(&None).unwrap(), None);
    }

    #[test]
    fn truncation_matches_stored_precision() {
        let dt = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
            + chrono::Duration::microseconds(1_234_567);
        let truncated = truncate_ts(dt);
        assert_eq!(fmt_ts(truncated), "2026-01-01T00:00:01.234Z");
        assert_eq!(parse_datetime(&fmt_ts(dt)).unwrap(), truncated);
    }

    #[test]
    fn garbage_uuid_is_serialization_error() {
        assert!(matches!(
            parse_uuid("nope"),
            Err(DatabaseError::Serialization(_))
        ));
    }
}
