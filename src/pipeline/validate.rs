use serde_json::Value;

use crate::config::Source;
use crate::fetch::RawResponse;

use super::extract::{coerce_value, extract, Extracted};

/// Default number of leading records inspected per payload.
pub const DEFAULT_SAMPLE_SIZE: usize = 10;

const MISSING_FIELD_PENALTY: u8 = 5;
const API_ERROR_PENALTY: u8 = 30;
const API_STATUS_PENALTY: u8 = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub quality_score: u8,
}

impl ValidationReport {
    fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            quality_score: 100,
        }
    }

    fn fail(&mut self, error: String) {
        self.valid = false;
        self.quality_score = 0;
        self.errors.push(error);
    }

    fn warn(&mut self, warning: String, penalty: u8) {
        self.quality_score = self.quality_score.saturating_sub(penalty);
        self.warnings.push(warning);
    }

    pub fn summary(&self) -> String {
        if self.errors.is_empty() {
            format!("{} warnings", self.warnings.len())
        } else {
            self.errors.join("; ")
        }
    }
}

/// Structural checks on a raw payload. Never fails; the report carries the verdict.
#[derive(Debug, Clone)]
pub struct Validator {
    sample_size: usize,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_SIZE)
    }
}

impl Validator {
    pub fn new(sample_size: usize) -> Self {
        Self {
            sample_size: sample_size.max(1),
        }
    }

    pub fn validate(&self, raw: &RawResponse, source: &Source) -> ValidationReport {
        let mut report = ValidationReport::new();

        let root: Value = match serde_json::from_str(&raw.body) {
            Ok(root) => root,
            Err(err) => {
                report.fail(format!("payload is not valid JSON: {err}"));
                return report;
            }
        };

        if !(root.is_object() || root.is_array()) {
            report.fail("payload must be a JSON object or array".to_string());
            return report;
        }

        inspect_api_hints(&root, &mut report);

        match extract(&root, &source.data_path) {
            Err(err) => report.fail(err),
            Ok(Extracted::Scalar(value)) => {
                if coerce_value(value).is_none() {
                    report.warn(
                        format!("value at `{}` is not numeric", source.data_path),
                        MISSING_FIELD_PENALTY,
                    );
                }
            }
            Ok(Extracted::Records(records)) => {
                if records.is_empty() {
                    report.fail(format!("no records at `{}`", source.data_path));
                }
                for (index, record) in records.iter().take(self.sample_size).enumerate() {
                    let Some(fields) = record.as_object() else {
                        report.fail(format!("record {index} is not an object"));
                        continue;
                    };
                    for field in [&source.timestamp_field, &source.value_field] {
                        if fields.get(field).map_or(true, Value::is_null) {
                            report.warn(
                                format!("record {index} is missing `{field}`"),
                                MISSING_FIELD_PENALTY,
                            );
                        }
                    }
                }
            }
        }

        if !report.valid {
            report.quality_score = 0;
        }
        report
    }
}

fn inspect_api_hints(root: &Value, report: &mut ValidationReport) {
    let Some(object) = root.as_object() else {
        return;
    };

    if let Some(error) = object.get("error").filter(|value| !value.is_null()) {
        report.warn(format!("API returned error: {error}"), API_ERROR_PENALTY);
    }

    if let Some(status) = object.get("status").and_then(Value::as_str) {
        if !status.eq_ignore_ascii_case("success") && !status.eq_ignore_ascii_case("ok") {
            report.warn(format!("API status: {status}"), API_STATUS_PENALTY);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn raw(body: &str) -> RawResponse {
        RawResponse {
            url: "https://api.example.com".to_string(),
            status: 200,
            body: body.to_string(),
            fetched_at: Utc::now(),
            attempts: 1,
            from_cache: false,
        }
    }

    fn source(path: &str) -> Source {
        Source::new("weather_tokyo", "https://api.example.com", path, "celsius").unwrap()
    }

    #[test]
    fn accepts_scalar_payload() {
        let report = Validator::default().validate(&raw(r#"{"main":{"temp":23.5}}"#), &source("main.temp"));

        assert!(report.valid);
        assert!(report.warnings.is_empty());
        assert_eq!(report.quality_score, 100);
    }

    #[test]
    fn penalises_missing_fields_per_record() {
        let body = r#"[
            {"timestamp": "2024-01-01T00:00:00Z", "value": 1},
            {"timestamp": "2024-01-01T01:00:00Z"},
            {"value": 3},
            {"timestamp": null, "value": null}
        ]"#;
        let report = Validator::default().validate(&raw(body), &source(""));

        assert!(report.valid);
        assert_eq!(report.warnings.len(), 4);
        assert_eq!(report.quality_score, 80);
    }

    #[test]
    fn only_samples_leading_records() {
        let body = serde_json::to_string(&vec![serde_json::json!({"other": 1}); 30]).unwrap();
        let report = Validator::new(3).validate(&raw(&body), &source(""));

        assert_eq!(report.warnings.len(), 6);
        assert_eq!(report.quality_score, 70);
    }

    #[test]
    fn malformed_structure_is_invalid() {
        let validator = Validator::default();

        let not_json = validator.validate(&raw("<html>"), &source("main.temp"));
        assert!(!not_json.valid);
        assert_eq!(not_json.quality_score, 0);

        let bare = validator.validate(&raw("42"), &source(""));
        assert!(!bare.valid);

        let missing = validator.validate(&raw(r#"{"main":{}}"#), &source("main.temp"));
        assert!(!missing.valid);
        assert!(missing.errors[0].contains("missing key `temp`"), "{:?}", missing.errors);

        let scalars = validator.validate(&raw("[1, 2]"), &source(""));
        assert!(!scalars.valid);

        let empty = validator.validate(&raw(r#"{"rows": []}"#), &source("rows"));
        assert!(!empty.valid);
    }

    #[test]
    fn flags_api_level_errors() {
        let body = r#"{"status": "error", "error": "quota", "main": {"temp": 1}}"#;
        let report = Validator::default().validate(&raw(body), &source("main.temp"));

        assert!(report.valid);
        assert_eq!(report.warnings.len(), 2);
        assert_eq!(report.quality_score, 50);
    }
}
