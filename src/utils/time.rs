use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Timelike, Utc};

/// Sortable, filesystem-safe identifier format for stored versions.
pub const VERSION_ID_FORMAT: &str = "%Y%m%dT%H%M%S%.6fZ";

pub fn version_id(at: DateTime<Utc>) -> String {
    at.format(VERSION_ID_FORMAT).to_string()
}

pub fn parse_version_id(id: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(id, VERSION_ID_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Current time, bumped past `after` so ids issued for one source never collide.
pub fn next_version_time(after: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = truncate_micros(Utc::now());
    match after {
        Some(last) if now <= last => last + Duration::microseconds(1),
        _ => now,
    }
}

pub fn format_local(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

fn truncate_micros(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_nanosecond(at.nanosecond() / 1_000 * 1_000)
        .unwrap_or(at)
}
