use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Context, Result};

use super::{
    default_timestamp_field, default_value_field, rate_group_for, validator, DataPath, Settings,
    Source,
};

/// On-disk shape of one source definition under `config/sources`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub data_path: String,
    pub unit: String,
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
    #[serde(default = "default_value_field")]
    pub value_field: String,
    #[serde(default)]
    pub rate_group: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl SourceDescriptor {
    /// Validate and convert into the runtime representation.
    pub fn into_source(self) -> Result<Source> {
        validator::validate_source_descriptor(&self)?;

        let data_path = DataPath::parse(&self.data_path)?;
        let rate_group = self
            .rate_group
            .filter(|group| !group.trim().is_empty())
            .unwrap_or_else(|| rate_group_for(&self.url, &self.name));

        Ok(Source {
            name: self.name,
            url_template: self.url,
            params: self.params,
            headers: self.headers,
            data_path,
            unit: self.unit,
            timestamp_field: self.timestamp_field,
            value_field: self.value_field,
            rate_group,
            timeout: self.timeout_secs.map(Duration::from_secs),
        })
    }
}

pub fn config_dir(root: &Path) -> PathBuf {
    root.join("config")
}

pub fn sources_dir(root: &Path) -> PathBuf {
    config_dir(root).join("sources")
}

/// Load `config/settings.json`, falling back to defaults when the file is absent.
pub fn load_settings(root: &Path) -> Result<Settings> {
    let path = config_dir(root).join("settings.json");
    let json = match fs::read_to_string(&path) {
        Ok(json) => json,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Settings::default()),
        Err(err) => {
            return Err(AppError::Config(format!(
                "failed to read settings at {}: {err}",
                path.display()
            )))
        }
    };

    let mut settings: Settings = serde_json::from_str(&json)
        .with_context(|| format!("failed to parse settings JSON at {}", path.display()))?;

    if settings.data_dir.is_relative() {
        settings.data_dir = root.join(&settings.data_dir);
    }
    Ok(settings)
}

/// Load a single source definition file.
pub fn load_source_descriptor(path: &Path) -> Result<Source> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("failed to read source config at {}", path.display()))?;

    let descriptor: SourceDescriptor = serde_json::from_str(&json)
        .with_context(|| format!("failed to parse source config at {}", path.display()))?;

    descriptor.into_source().map_err(|err| match err {
        AppError::Config(msg) => AppError::Config(format!("{} ({})", msg, path.display())),
        other => other,
    })
}

/// Discover and load every source under `config/sources`, sorted by name.
pub fn load_sources(root: &Path) -> Result<Vec<Source>> {
    let dir = sources_dir(root);
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut sources = Vec::new();
    for entry in fs::read_dir(&dir)
        .with_context(|| format!("failed to read source config directory {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        sources.push(load_source_descriptor(&path)?);
    }

    sources.sort_by(|a, b| a.name.cmp(&b.name));
    for pair in sources.windows(2) {
        if pair[0].name == pair[1].name {
            return Err(AppError::Config(format!(
                "source `{}` is defined more than once",
                pair[0].name
            )));
        }
    }
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn loads_sources_and_settings() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            "config/sources/tokyo.json",
            r#"{
                "name": "weather_tokyo",
                "url": "https://api.example.com/weather?q={city}",
                "params": {"city": "Tokyo"},
                "data_path": "main.temp",
                "unit": "celsius"
            }"#,
        );
        write(
            tmp.path(),
            "config/sources/btc.json",
            r#"{
                "name": "btc_usd",
                "url": "https://prices.example.com/simple",
                "data_path": "bitcoin.usd",
                "unit": "usd",
                "rate_group": "prices",
                "timeout_secs": 5
            }"#,
        );
        write(tmp.path(), "config/sources/notes.txt", "ignored");
        write(
            tmp.path(),
            "config/settings.json",
            r#"{"data_dir": "store", "pipeline": {"max_backups": 4}}"#,
        );

        let sources = load_sources(tmp.path()).expect("sources load");
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].name, "btc_usd");
        assert_eq!(sources[0].rate_group, "prices");
        assert_eq!(sources[0].timeout, Some(Duration::from_secs(5)));
        assert_eq!(sources[1].rate_group, "api.example.com");
        assert_eq!(sources[1].timestamp_field, "timestamp");

        let settings = load_settings(tmp.path()).expect("settings load");
        assert_eq!(settings.data_dir, tmp.path().join("store"));
        assert_eq!(settings.pipeline.max_backups, Some(4));
    }

    #[test]
    fn missing_settings_use_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = load_settings(tmp.path()).expect("defaults");
        assert_eq!(settings, Settings::default());
        assert!(load_sources(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn rejects_duplicate_names() {
        let tmp = tempfile::tempdir().unwrap();
        let body = r#"{"name": "dup", "url": "https://a.example.com", "unit": "x"}"#;
        write(tmp.path(), "config/sources/a.json", body);
        write(tmp.path(), "config/sources/b.json", body);

        let err = load_sources(tmp.path()).expect_err("duplicate should fail");
        assert!(err.to_string().contains("more than once"), "{err}");
    }
}
