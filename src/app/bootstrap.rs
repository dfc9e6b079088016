use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};

use crate::config::{load_settings, Settings, SourceRegistry};
use crate::error::{AppError, Result};
use crate::records::StorageManager;
use crate::store::SharedStore;

use super::orchestrator::FetchOrchestrator;

/// Everything a front end needs, wired from one configuration root.
pub struct Runtime {
    pub settings: Settings,
    pub registry: Arc<SourceRegistry>,
    pub storage: Arc<StorageManager>,
    pub store: Arc<SharedStore>,
    pub orchestrator: Arc<FetchOrchestrator>,
}

impl Runtime {
    /// Load settings and sources under `root`, then rebuild the shared store from disk.
    pub fn load(root: &Path, data_dir: Option<PathBuf>) -> Result<Self> {
        let mut settings = load_settings(root)?;
        if let Some(data_dir) = data_dir {
            settings.data_dir = data_dir;
        }
        let registry = Arc::new(SourceRegistry::load(root)?);
        info!(
            "loaded {} sources from {}; data in {}",
            registry.names().len(),
            root.display(),
            settings.data_dir.display()
        );
        Self::from_parts(settings, registry)
    }

    pub fn from_parts(settings: Settings, registry: Arc<SourceRegistry>) -> Result<Self> {
        let storage = Arc::new(StorageManager::from_settings(&settings));
        let store = Arc::new(SharedStore::new());
        rebuild_store(&storage, &store, &registry.names());

        let orchestrator = Arc::new(FetchOrchestrator::from_settings(
            Arc::clone(&registry),
            Arc::clone(&storage),
            Arc::clone(&store),
            settings.pipeline.clone(),
        )?);

        Ok(Self {
            settings,
            registry,
            storage,
            store,
            orchestrator,
        })
    }
}

/// Seed `store` with the current stored dataset of each source. Returns how many were loaded.
pub fn rebuild_store(storage: &StorageManager, store: &SharedStore, sources: &[String]) -> usize {
    let mut loaded = 0;
    for source in sources {
        match storage.load(source) {
            Ok(dataset) => {
                store.seed(source, dataset);
                loaded += 1;
            }
            Err(AppError::NotFound(_)) => {}
            Err(err) => warn!("could not restore cached dataset for {}: {}", source, err),
        }
    }
    loaded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::Dataset;
    use chrono::Utc;
    use tempfile::tempdir;

    #[test]
    fn rebuild_seeds_only_stored_sources() {
        let dir = tempdir().unwrap();
        let storage = StorageManager::new(dir.path());
        storage
            .save(&Dataset::from_points("a", Vec::new(), 80, Utc::now()))
            .unwrap();

        let store = SharedStore::new();
        let loaded = rebuild_store(&storage, &store, &["a".to_string(), "b".to_string()]);

        assert_eq!(loaded, 1);
        assert_eq!(store.get("a").unwrap().metadata.quality_score, 80);
        assert!(store.get("b").is_err());
    }
}
