use chrono::{DateTime, SecondsFormat, Utc};

/// Get the current time as a UTC datetime.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Format a timestamp as RFC 3339 / ISO 8601 with second precision,
/// e.g. `"2026-02-08T05:00:00Z"`.
pub fn iso8601(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}
