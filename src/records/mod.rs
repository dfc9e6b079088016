use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;

use crate::config::Settings;
use crate::error::{AppError, Result};
use crate::series::Dataset;
use crate::utils::{list_json_files, next_version_time, parse_version_id, version_id, write_atomic};

pub mod document;
pub mod export;

pub use document::{DatasetDocument, SchemaDescription};
pub use export::{export_to_path, exporter_for, CsvExporter, DatasetExporter, ExportFormat, JsonExporter};

const VERSIONS_DIR: &str = "versions";
const CURRENT_FILE: &str = "CURRENT";

/// One retained version of a source's dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub source: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub location: PathBuf,
    pub size_bytes: u64,
    pub is_current: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStorageStats {
    pub source: String,
    pub versions: usize,
    pub bytes: u64,
    pub current: Option<String>,
    pub last_saved: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub sources: Vec<SourceStorageStats>,
    pub total_versions: usize,
    pub total_bytes: u64,
}

/// Durable per-source datasets laid out as immutable versions plus a `CURRENT` pointer:
///
/// ```text
/// <data_dir>/<source>/versions/<version>.json
/// <data_dir>/<source>/CURRENT
/// ```
///
/// Every save writes a new version and then swaps the pointer, so a failure at any
/// step leaves the previous current dataset readable.
pub struct StorageManager {
    data_dir: PathBuf,
    max_backups: Option<usize>,
    write_lock: Mutex<()>,
}

impl StorageManager {
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
            max_backups: None,
            write_lock: Mutex::new(()),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.data_dir).with_max_backups(settings.pipeline.max_backups)
    }

    /// Keep at most `limit` versions per source; `None` keeps everything.
    pub fn with_max_backups(mut self, limit: Option<usize>) -> Self {
        self.max_backups = limit.map(|limit| limit.max(1));
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn source_dir(&self, source: &str) -> PathBuf {
        self.data_dir.join(source)
    }

    fn versions_dir(&self, source: &str) -> PathBuf {
        self.source_dir(source).join(VERSIONS_DIR)
    }

    fn current_path(&self, source: &str) -> PathBuf {
        self.source_dir(source).join(CURRENT_FILE)
    }

    fn version_path(&self, source: &str, version: &str) -> PathBuf {
        self.versions_dir(source).join(format!("{version}.json"))
    }

    /// Persist `dataset` as the new current version of its source.
    pub fn save(&self, dataset: &Dataset) -> Result<BackupRecord> {
        let bytes = DatasetDocument::from(dataset).to_bytes()?;
        let _guard = self.write_lock.lock().expect("storage lock poisoned");
        let record = self.commit_version(&dataset.source, &bytes)?;
        info!(
            "stored {} points for {} as version {}",
            dataset.len(),
            dataset.source,
            record.version
        );
        self.prune_locked(&dataset.source);
        Ok(record)
    }

    /// Read the current dataset of `source`.
    pub fn load(&self, source: &str) -> Result<Dataset> {
        let version = self
            .current_version(source)?
            .ok_or_else(|| AppError::NotFound(source.to_string()))?;
        self.load_version(source, &version)
    }

    pub fn load_version(&self, source: &str, version: &str) -> Result<Dataset> {
        check_version_id(version)?;
        let path = self.version_path(source, version);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(AppError::NotFound(format!("{source}@{version}")))
            }
            Err(err) => return Err(AppError::storage(path, err)),
        };
        Ok(DatasetDocument::from_slice(&bytes)?.into_dataset())
    }

    pub fn current_version(&self, source: &str) -> Result<Option<String>> {
        let path = self.current_path(source);
        match fs::read_to_string(&path) {
            Ok(text) => {
                let version = text.trim();
                Ok((!version.is_empty()).then(|| version.to_string()))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(AppError::storage(path, err)),
        }
    }

    /// Retained versions of `source`, newest first.
    pub fn list_backups(&self, source: &str) -> Result<Vec<BackupRecord>> {
        let dir = self.versions_dir(source);
        let current = self.current_version(source)?;
        let entries = list_json_files(&dir).map_err(|err| AppError::storage(&dir, err))?;

        let mut records: Vec<BackupRecord> = entries
            .into_iter()
            .filter_map(|entry| {
                let created_at = parse_version_id(&entry.stem)?;
                Some(BackupRecord {
                    source: source.to_string(),
                    is_current: current.as_deref() == Some(entry.stem.as_str()),
                    version: entry.stem,
                    created_at,
                    location: entry.path,
                    size_bytes: entry.size,
                })
            })
            .collect();
        records.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(records)
    }

    /// Make the content of `version` current again. The restored bytes are written as a
    /// new version so the history stays append-only.
    pub fn restore(&self, source: &str, version: &str) -> Result<Dataset> {
        check_version_id(version)?;
        let from = self.version_path(source, version);
        let bytes = match fs::read(&from) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(AppError::NotFound(format!("{source}@{version}")))
            }
            Err(err) => return Err(AppError::storage(from, err)),
        };
        let dataset = DatasetDocument::from_slice(&bytes)?.into_dataset();
        if dataset.source != source {
            return Err(AppError::Validation(format!(
                "version {version} of {source} holds data for {}",
                dataset.source
            )));
        }

        let _guard = self.write_lock.lock().expect("storage lock poisoned");
        let record = self.commit_version(source, &bytes)?;
        info!(
            "restored {} from version {} as version {}",
            source, version, record.version
        );
        self.prune_locked(source);
        Ok(dataset)
    }

    /// Apply the retention limit to `source`. Returns how many versions were removed.
    pub fn prune(&self, source: &str) -> Result<usize> {
        let _guard = self.write_lock.lock().expect("storage lock poisoned");
        self.try_prune(source)
    }

    /// Sources that have a current dataset on disk.
    pub fn stored_sources(&self) -> Result<Vec<String>> {
        let read_dir = match fs::read_dir(&self.data_dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(AppError::storage(&self.data_dir, err)),
        };

        let mut sources: Vec<String> = read_dir
            .flatten()
            .filter(|entry| entry.path().join(CURRENT_FILE).is_file())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .collect();
        sources.sort();
        Ok(sources)
    }

    pub fn stats(&self) -> Result<StorageStats> {
        let mut stats = StorageStats::default();
        for source in self.stored_sources()? {
            let backups = self.list_backups(&source)?;
            let bytes = backups.iter().map(|record| record.size_bytes).sum();
            stats.total_versions += backups.len();
            stats.total_bytes += bytes;
            stats.sources.push(SourceStorageStats {
                current: self.current_version(&source)?,
                last_saved: backups.first().map(|record| record.created_at),
                versions: backups.len(),
                bytes,
                source,
            });
        }
        Ok(stats)
    }

    fn commit_version(&self, source: &str, bytes: &[u8]) -> Result<BackupRecord> {
        let dir = self.versions_dir(source);
        fs::create_dir_all(&dir).map_err(|err| AppError::storage(&dir, err))?;

        let last = self
            .list_backups(source)?
            .first()
            .map(|record| record.created_at);
        let created_at = next_version_time(last);
        let version = version_id(created_at);
        let location = self.version_path(source, &version);

        write_atomic(&location, bytes).map_err(|err| AppError::storage(&location, err))?;

        let pointer = self.current_path(source);
        if let Err(err) = write_atomic(&pointer, version.as_bytes()) {
            if let Err(cleanup) = fs::remove_file(&location) {
                warn!("failed to remove orphaned version {}: {}", location.display(), cleanup);
            }
            return Err(AppError::storage(pointer, err));
        }

        Ok(BackupRecord {
            source: source.to_string(),
            version,
            created_at,
            location,
            size_bytes: bytes.len() as u64,
            is_current: true,
        })
    }

    fn prune_locked(&self, source: &str) {
        if let Err(err) = self.try_prune(source) {
            warn!("retention pass for {} failed: {}", source, err);
        }
    }

    fn try_prune(&self, source: &str) -> Result<usize> {
        let Some(limit) = self.max_backups else {
            return Ok(0);
        };

        let backups = self.list_backups(source)?;
        let mut removed = 0;
        // Newest first: everything past the limit goes, except the current version.
        for record in backups.iter().skip(limit).filter(|record| !record.is_current) {
            fs::remove_file(&record.location)
                .map_err(|err| AppError::storage(&record.location, err))?;
            debug!("pruned {} version {}", source, record.version);
            removed += 1;
        }
        Ok(removed)
    }
}

/// Only ids this manager issued are accepted, so a version can never name a path
/// outside the source's own `versions/` directory.
fn check_version_id(version: &str) -> Result<()> {
    match parse_version_id(version) {
        Some(at) if version_id(at) == version => Ok(()),
        _ => Err(AppError::Validation(format!("`{version}` is not a version id"))),
    }
}
