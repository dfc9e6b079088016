use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

use crate::config::{DataPath, PathSegment};
use crate::series::Quality;

/// Epoch values above this are treated as milliseconds.
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// What the data path resolved to inside a payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Extracted<'a> {
    Scalar(&'a Value),
    Records(Vec<&'a Value>),
}

pub fn walk_json_path<'a>(root: &'a Value, path: &DataPath) -> Result<&'a Value, String> {
    let mut cursor = root;
    for segment in path.segments() {
        cursor = match (segment, cursor) {
            (PathSegment::Key(key), Value::Object(map)) => map
                .get(key)
                .ok_or_else(|| format!("missing key `{key}` while resolving `{path}`"))?,
            (PathSegment::Index(index), Value::Array(items)) => items.get(*index).ok_or_else(|| {
                format!(
                    "index {index} out of bounds (len {}) while resolving `{path}`",
                    items.len()
                )
            })?,
            (PathSegment::Index(index), Value::Object(map)) => map
                .get(&index.to_string())
                .ok_or_else(|| format!("missing key `{index}` while resolving `{path}`"))?,
            (segment, other) => {
                return Err(format!(
                    "cannot descend into {} with segment {} while resolving `{path}`",
                    kind_of(other),
                    describe(segment)
                ))
            }
        };
    }
    Ok(cursor)
}

/// Resolve the data path and classify the target as one scalar or a list of records.
/// A single object is treated as a one-record list.
pub fn extract<'a>(root: &'a Value, path: &DataPath) -> Result<Extracted<'a>, String> {
    match walk_json_path(root, path)? {
        Value::Null => Err(format!("data path `{path}` resolved to null")),
        Value::Array(items) => Ok(Extracted::Records(items.iter().collect())),
        object @ Value::Object(_) => Ok(Extracted::Records(vec![object])),
        scalar => Ok(Extracted::Scalar(scalar)),
    }
}

/// Numeric coercion. Native numbers are `Good`; numeric strings are `Suspect`.
pub fn coerce_value(value: &Value) -> Option<(f64, Quality)> {
    let (number, quality) = match value {
        Value::Number(n) => (n.as_f64()?, Quality::Good),
        Value::String(s) => (parse_f64(s)?, Quality::Suspect),
        _ => return None,
    };
    number.is_finite().then_some((number, quality))
}

pub fn parse_f64(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok()
}

/// Coerce a JSON timestamp into a UTC instant.
pub fn coerce_timestamp(value: &Value) -> Result<DateTime<Utc>, String> {
    match value {
        Value::String(text) => parse_timestamp(text),
        Value::Number(n) => {
            if let Some(whole) = n.as_i64() {
                from_epoch(whole)
            } else if let Some(fractional) = n.as_f64() {
                if fractional.abs() >= MILLIS_THRESHOLD as f64 {
                    from_epoch(fractional.round() as i64)
                } else {
                    Utc.timestamp_millis_opt((fractional * 1000.0).round() as i64)
                        .single()
                        .ok_or_else(|| format!("epoch value {fractional} out of range"))
                }
            } else {
                Err(format!("epoch value {n} out of range"))
            }
        }
        Value::Null => Err("timestamp is null".to_string()),
        other => Err(format!("unsupported timestamp {}", kind_of(other))),
    }
}

pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("timestamp is empty".to_string());
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }

    const NAIVE_FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ];
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    if let Ok(epoch) = trimmed.parse::<i64>() {
        return from_epoch(epoch);
    }

    Err(format!("unrecognised timestamp `{trimmed}`"))
}

fn from_epoch(value: i64) -> Result<DateTime<Utc>, String> {
    let parsed = if value.unsigned_abs() >= MILLIS_THRESHOLD.unsigned_abs() {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    };
    parsed.ok_or_else(|| format!("epoch value {value} out of range"))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn describe(segment: &PathSegment) -> String {
    match segment {
        PathSegment::Key(key) => format!("`{key}`"),
        PathSegment::Index(index) => format!("[{index}]"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(raw: &str) -> DataPath {
        DataPath::parse(raw).unwrap()
    }

    #[test]
    fn walks_nested_keys_and_indices() {
        let doc = json!({"list": [{"main": {"temp": 1.5}}], "by_id": {"7": 3}});

        assert_eq!(walk_json_path(&doc, &path("list.0.main.temp")).unwrap(), &json!(1.5));
        assert_eq!(walk_json_path(&doc, &path("by_id.7")).unwrap(), &json!(3));

        let err = walk_json_path(&doc, &path("list.3")).unwrap_err();
        assert!(err.contains("out of bounds"), "{err}");
        let err = walk_json_path(&doc, &path("list.0.main.temp.deeper")).unwrap_err();
        assert!(err.contains("cannot descend into a number"), "{err}");
    }

    #[test]
    fn classifies_extraction_targets() {
        let doc = json!({"main": {"temp": 23.5}, "rows": [{"value": 1}], "gone": null});

        assert_eq!(
            extract(&doc, &path("main.temp")).unwrap(),
            Extracted::Scalar(&json!(23.5))
        );
        assert!(matches!(
            extract(&doc, &path("rows")).unwrap(),
            Extracted::Records(rows) if rows.len() == 1
        ));
        assert!(matches!(
            extract(&doc, &path("main")).unwrap(),
            Extracted::Records(rows) if rows.len() == 1
        ));
        assert!(extract(&doc, &path("gone")).is_err());
    }

    #[test]
    fn coerces_values() {
        assert_eq!(coerce_value(&json!(4)), Some((4.0, Quality::Good)));
        assert_eq!(coerce_value(&json!(" 2.5 ")), Some((2.5, Quality::Suspect)));
        assert_eq!(coerce_value(&json!("NaN")), None);
        assert_eq!(coerce_value(&json!("abc")), None);
        assert_eq!(coerce_value(&json!(true)), None);
    }

    #[test]
    fn coerces_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 5, 9, 30, 0).unwrap();

        assert_eq!(coerce_timestamp(&json!("2024-01-05T09:30:00Z")).unwrap(), expected);
        assert_eq!(coerce_timestamp(&json!("2024-01-05T18:30:00+09:00")).unwrap(), expected);
        assert_eq!(coerce_timestamp(&json!("2024-01-05 09:30:00")).unwrap(), expected);
        assert_eq!(coerce_timestamp(&json!(expected.timestamp())).unwrap(), expected);
        assert_eq!(
            coerce_timestamp(&json!(expected.timestamp_millis())).unwrap(),
            expected
        );
        assert_eq!(
            coerce_timestamp(&json!("2024-01-05")).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap()
        );
        assert!(coerce_timestamp(&json!("yesterday")).is_err());
        assert!(coerce_timestamp(&json!(null)).is_err());
    }

    #[test]
    fn extreme_epochs_are_errors() {
        assert!(coerce_timestamp(&json!(i64::MIN)).is_err());
        assert!(coerce_timestamp(&json!(i64::MAX)).is_err());
        assert!(coerce_timestamp(&json!(u64::MAX)).is_err());
        assert!(coerce_timestamp(&json!(-1.0e30)).is_err());
        assert!(parse_timestamp("-9223372036854775808").is_err());
    }
}
