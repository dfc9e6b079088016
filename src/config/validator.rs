use std::collections::HashSet;

use crate::error::{AppError, Result};
use crate::fetch::request::template_placeholders;

use super::{loader::SourceDescriptor, DataPath};

/// Validate a single source descriptor and surface every issue at once.
pub fn validate_source_descriptor(descriptor: &SourceDescriptor) -> Result<()> {
    let mut issues = Vec::new();

    validate_name(descriptor, &mut issues);
    validate_url(descriptor, &mut issues);
    validate_fields(descriptor, &mut issues);

    if issues.is_empty() {
        Ok(())
    } else {
        Err(AppError::Config(format!(
            "source `{}` config invalid:\n  - {}",
            descriptor.name,
            issues.join("\n  - ")
        )))
    }
}

/// Names double as directory names in the storage tree.
pub fn is_valid_source_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

fn validate_name(descriptor: &SourceDescriptor, issues: &mut Vec<String>) {
    if !is_valid_source_name(&descriptor.name) {
        issues.push(format!(
            "name `{}` must be non-empty and use only a-z, 0-9, '_' or '-'",
            descriptor.name
        ));
    }
}

fn validate_url(descriptor: &SourceDescriptor, issues: &mut Vec<String>) {
    let url = descriptor.url.trim();
    if url.is_empty() {
        issues.push("url must not be empty".to_string());
        return;
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        issues.push(format!("url `{url}` must start with http:// or https://"));
    }

    match template_placeholders(url) {
        Ok(placeholders) => {
            let known: HashSet<&str> = descriptor.params.keys().map(String::as_str).collect();
            for name in placeholders {
                if !known.contains(name.as_str()) {
                    issues.push(format!("url placeholder `{{{name}}}` has no matching param"));
                }
            }
        }
        Err(err) => issues.push(err.to_string()),
    }
}

fn validate_fields(descriptor: &SourceDescriptor, issues: &mut Vec<String>) {
    if descriptor.unit.trim().is_empty() {
        issues.push("unit must not be empty".to_string());
    }
    if descriptor.timestamp_field.trim().is_empty() {
        issues.push("timestamp_field must not be empty".to_string());
    }
    if descriptor.value_field.trim().is_empty() {
        issues.push("value_field must not be empty".to_string());
    }
    if let Err(err) = DataPath::parse(&descriptor.data_path) {
        issues.push(err.to_string());
    }
    if descriptor.timeout_secs == Some(0) {
        issues.push("timeout_secs must be greater than zero".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> SourceDescriptor {
        serde_json::from_str(
            r#"{
                "name": "weather_tokyo",
                "url": "https://api.example.com/weather?q={city}",
                "params": {"city": "Tokyo"},
                "data_path": "main.temp",
                "unit": "celsius"
            }"#,
        )
        .expect("descriptor parses")
    }

    #[test]
    fn accepts_well_formed_descriptor() {
        validate_source_descriptor(&descriptor()).expect("descriptor should be valid");
    }

    #[test]
    fn rejects_unsafe_name() {
        let mut descriptor = descriptor();
        descriptor.name = "../etc".to_string();

        let err = validate_source_descriptor(&descriptor).expect_err("validation should fail");
        assert!(err.to_string().contains("must be non-empty"), "{err}");
    }

    #[test]
    fn rejects_unbound_placeholder() {
        let mut descriptor = descriptor();
        descriptor.params.clear();

        let err = validate_source_descriptor(&descriptor).expect_err("validation should fail");
        assert!(
            err.to_string().contains("`{city}` has no matching param"),
            "unexpected error message: {err}"
        );
    }

    #[test]
    fn aggregates_multiple_issues() {
        let mut descriptor = descriptor();
        descriptor.url = "ftp://example.com".to_string();
        descriptor.unit = " ".to_string();
        descriptor.data_path = "a..b".to_string();

        let message = validate_source_descriptor(&descriptor)
            .expect_err("validation should fail")
            .to_string();
        assert!(message.contains("http:// or https://"), "{message}");
        assert!(message.contains("unit must not be empty"), "{message}");
        assert!(message.contains("empty segment"), "{message}");
    }
}
