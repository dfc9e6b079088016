use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, info};
use serde_json::Value;

use crate::config::Source;
use crate::error::{AppError, Result};
use crate::fetch::RawResponse;
use crate::series::{canonicalize, Dataset, Quality, TimeSeriesPoint};

use super::extract::{coerce_timestamp, coerce_value, extract, Extracted};
use super::validate::ValidationReport;

/// Points stamped this far past the fetch time are flagged `Suspect`.
const FUTURE_TOLERANCE_MINUTES: i64 = 5;

/// Bookkeeping for one normalization pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeStats {
    pub total: usize,
    pub unparseable: usize,
    pub duplicates: usize,
}

impl NormalizeStats {
    pub fn dropped(&self) -> usize {
        self.unparseable + self.duplicates
    }
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer;

impl Normalizer {
    pub fn new() -> Self {
        Self
    }

    pub fn normalize(
        &self,
        raw: &RawResponse,
        report: &ValidationReport,
        source: &Source,
    ) -> Result<Dataset> {
        self.normalize_with_stats(raw, report, source)
            .map(|(dataset, _)| dataset)
    }

    /// Convert a validated payload into a canonical batch for `source`.
    pub fn normalize_with_stats(
        &self,
        raw: &RawResponse,
        report: &ValidationReport,
        source: &Source,
    ) -> Result<(Dataset, NormalizeStats)> {
        if !report.valid {
            return Err(AppError::Validation(report.summary()));
        }

        let root: Value = serde_json::from_str(&raw.body)
            .map_err(|err| AppError::Validation(format!("payload is not valid JSON: {err}")))?;
        let extracted = extract(&root, &source.data_path).map_err(AppError::Validation)?;

        let mut stats = NormalizeStats::default();
        let mut points = Vec::new();
        match extracted {
            Extracted::Scalar(value) => {
                stats.total = 1;
                match point_from_parts(Ok(raw.fetched_at), value, raw, source) {
                    Ok(point) => points.push(point),
                    Err(err) => {
                        debug!("{}: dropping scalar point: {err}", source.name);
                        stats.unparseable += 1;
                    }
                }
            }
            Extracted::Records(records) => {
                stats.total = records.len();
                for (index, record) in records.into_iter().enumerate() {
                    match point_from_record(record, raw, source) {
                        Ok(point) => points.push(point),
                        Err(err) => {
                            debug!("{}: dropping record {index}: {err}", source.name);
                            stats.unparseable += 1;
                        }
                    }
                }
            }
        }

        let (points, duplicates) = canonicalize(points);
        stats.duplicates = duplicates;

        let score = adjusted_score(report.quality_score, &stats);
        info!(
            "{}: normalized {} of {} records ({} unparseable, {} duplicates), quality {}",
            source.name,
            points.len(),
            stats.total,
            stats.unparseable,
            stats.duplicates,
            score
        );

        let dataset = Dataset::from_points(&source.name, points, score, raw.fetched_at);
        Ok((dataset, stats))
    }
}

/// Validation score reduced in proportion to the share of records that did not survive.
pub fn adjusted_score(validation_score: u8, stats: &NormalizeStats) -> u8 {
    if stats.total == 0 {
        return validation_score.min(100);
    }
    let penalty = (50 * stats.dropped()).div_ceil(stats.total);
    let penalty = u8::try_from(penalty).unwrap_or(u8::MAX);
    validation_score.min(100).saturating_sub(penalty)
}

fn point_from_record(record: &Value, raw: &RawResponse, source: &Source) -> Result<TimeSeriesPoint> {
    let fields = record
        .as_object()
        .ok_or_else(|| AppError::Parse("record is not an object".to_string()))?;
    let timestamp = fields
        .get(&source.timestamp_field)
        .ok_or_else(|| format!("missing `{}`", source.timestamp_field))
        .and_then(coerce_timestamp);
    let value = fields
        .get(&source.value_field)
        .ok_or_else(|| AppError::Parse(format!("missing `{}`", source.value_field)))?;
    point_from_parts(timestamp, value, raw, source)
}

fn point_from_parts(
    timestamp: std::result::Result<DateTime<Utc>, String>,
    value: &Value,
    raw: &RawResponse,
    source: &Source,
) -> Result<TimeSeriesPoint> {
    let timestamp = timestamp.map_err(AppError::Parse)?;
    let (value, mut quality) = coerce_value(value)
        .ok_or_else(|| AppError::Parse(format!("non-numeric value {value}")))?;

    if timestamp > raw.fetched_at + ChronoDuration::minutes(FUTURE_TOLERANCE_MINUTES) {
        quality = Quality::Suspect;
    }

    Ok(TimeSeriesPoint {
        timestamp,
        value,
        unit: source.unit.clone(),
        quality,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Validator;
    use chrono::TimeZone;
    use serde_json::json;

    fn raw_at(body: String, fetched_at: DateTime<Utc>) -> RawResponse {
        RawResponse {
            url: "https://api.example.com".to_string(),
            status: 200,
            body,
            fetched_at,
            attempts: 1,
            from_cache: false,
        }
    }

    fn run(body: serde_json::Value, source: &Source) -> Result<(Dataset, NormalizeStats)> {
        let fetched_at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let raw = raw_at(body.to_string(), fetched_at);
        let report = Validator::default().validate(&raw, source);
        Normalizer::new().normalize_with_stats(&raw, &report, source)
    }

    fn list_source() -> Source {
        Source::new("sensor", "https://api.example.com", "readings", "kwh").unwrap()
    }

    #[test]
    fn scalar_payload_becomes_single_point_at_fetch_time() {
        let source =
            Source::new("weather_tokyo", "https://api.example.com", "main.temp", "celsius").unwrap();
        let (dataset, _) = run(json!({"main": {"temp": 23.5}}), &source).unwrap();

        assert_eq!(dataset.len(), 1);
        let point = &dataset.points[0];
        assert_eq!(point.value, 23.5);
        assert_eq!(point.unit, "celsius");
        assert_eq!(point.quality, Quality::Good);
        assert_eq!(point.timestamp, dataset.metadata.last_updated);
        assert_eq!(dataset.metadata.quality_score, 100);
    }

    #[test]
    fn duplicates_collapse_to_last_occurrence() {
        let body = json!({"readings": [
            {"timestamp": "2024-06-01T10:00:00Z", "value": 1.0},
            {"timestamp": "2024-06-01T09:00:00Z", "value": 2.0},
            {"timestamp": "2024-06-01T10:00:00Z", "value": 3.0}
        ]});
        let (dataset, stats) = run(body, &list_source()).unwrap();

        assert_eq!(stats.duplicates, 1);
        let values: Vec<f64> = dataset.points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![2.0, 3.0]);
        assert!(dataset.points[0].timestamp < dataset.points[1].timestamp);
        // ceil(50 * 1 / 3) = 17
        assert_eq!(dataset.metadata.quality_score, 83);
    }

    #[test]
    fn unparseable_records_are_dropped_and_penalised() {
        let body = json!({"readings": [
            {"timestamp": "2024-06-01T10:00:00Z", "value": "4.5"},
            {"timestamp": "not a date", "value": 1.0},
            {"timestamp": "2024-06-01T11:00:00Z", "value": "n/a"},
            {"timestamp": 1717239600, "value": 7}
        ]});
        let (dataset, stats) = run(body, &list_source()).unwrap();

        assert_eq!(stats.unparseable, 2);
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.points[0].quality, Quality::Suspect);
        assert_eq!(dataset.points[1].quality, Quality::Good);
        assert_eq!(dataset.metadata.quality_score, 75);
    }

    #[test]
    fn future_points_are_suspect() {
        let body = json!({"readings": [{"timestamp": "2030-01-01T00:00:00Z", "value": 1}]});
        let (dataset, _) = run(body, &list_source()).unwrap();

        assert_eq!(dataset.points[0].quality, Quality::Suspect);
    }

    #[test]
    fn invalid_report_is_rejected() {
        let err = run(json!({"other": 1}), &list_source()).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)), "{err:?}");
    }

    #[test]
    fn normalizing_canonical_output_is_identity() {
        let body = json!({"readings": [
            {"timestamp": "2024-06-01T10:00:00.250Z", "value": 1.5},
            {"timestamp": "2024-06-01T08:00:00Z", "value": -2},
            {"timestamp": "2024-06-01T10:00:00.250Z", "value": 9}
        ]});
        let (first, _) = run(body, &list_source()).unwrap();

        let replay: Vec<Value> = first
            .points
            .iter()
            .map(|p| json!({"timestamp": p.timestamp.to_rfc3339(), "value": p.value}))
            .collect();
        let (second, stats) = run(json!({ "readings": replay }), &list_source()).unwrap();

        assert_eq!(stats.dropped(), 0);
        assert_eq!(first.points, second.points);
    }

    #[test]
    fn score_adjustment_rounds_penalty_up() {
        let stats = NormalizeStats {
            total: 10,
            unparseable: 1,
            duplicates: 0,
        };
        assert_eq!(adjusted_score(100, &stats), 95);
        assert_eq!(adjusted_score(3, &stats), 0);
        assert_eq!(adjusted_score(90, &NormalizeStats::default()), 90);
    }
}
