use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock, Weak},
};

use log::{info, warn};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::watch;

use crate::error::{AppError, Result};

use super::loader::{load_sources, sources_dir};
use super::validator::is_valid_source_name;
use super::Source;

#[derive(Clone, Default)]
struct RegistryState {
    sources: HashMap<String, Arc<Source>>,
    ordered: Arc<Vec<Arc<Source>>>,
}

impl RegistryState {
    fn from_sources(sources: impl IntoIterator<Item = Arc<Source>>) -> Self {
        let map: HashMap<String, Arc<Source>> = sources
            .into_iter()
            .map(|source| (source.name.clone(), source))
            .collect();
        Self::from_map(map)
    }

    fn from_map(sources: HashMap<String, Arc<Source>>) -> Self {
        let mut ordered: Vec<Arc<Source>> = sources.values().cloned().collect();
        ordered.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            sources,
            ordered: Arc::new(ordered),
        }
    }
}

/// Registry of configured sources with optional hot-reload from disk.
///
/// Lookups hand out `Arc<Source>`, so replacing a definition never affects a
/// cycle that already captured the previous one.
pub struct SourceRegistry {
    root: Option<PathBuf>,
    state: RwLock<RegistryState>,
    updates_tx: watch::Sender<Arc<Vec<Arc<Source>>>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl SourceRegistry {
    /// In-memory registry, typically fed by `register`.
    pub fn from_sources(sources: impl IntoIterator<Item = Source>) -> Self {
        let state = RegistryState::from_sources(sources.into_iter().map(Arc::new));
        let (updates_tx, _) = watch::channel(state.ordered.clone());
        Self {
            root: None,
            state: RwLock::new(state),
            updates_tx,
            watcher: Mutex::new(None),
        }
    }

    /// Build the registry by scanning `config/sources` under the provided root.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let sources = load_sources(&root)?;
        let mut registry = Self::from_sources(sources);
        registry.root = Some(root);
        Ok(registry)
    }

    /// Ordered snapshot of every registered source.
    pub fn snapshot(&self) -> Arc<Vec<Arc<Source>>> {
        self.state.read().expect("registry lock poisoned").ordered.clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot().iter().map(|s| s.name.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Source>> {
        self.state
            .read()
            .expect("registry lock poisoned")
            .sources
            .get(name)
            .cloned()
    }

    /// Subscribe to registry changes. The receiver immediately holds the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<Arc<Source>>>> {
        self.updates_tx.subscribe()
    }

    /// Add or replace a single source at runtime.
    pub fn register(&self, source: Source) -> Result<()> {
        if !is_valid_source_name(&source.name) {
            return Err(AppError::Config(format!(
                "source name `{}` is not a valid identifier",
                source.name
            )));
        }

        let snapshot = {
            let mut state = self.state.write().expect("registry lock poisoned");
            let mut sources = state.sources.clone();
            if sources.insert(source.name.clone(), Arc::new(source)).is_some() {
                info!("Re-registered source definition");
            }
            *state = RegistryState::from_map(sources);
            state.ordered.clone()
        };

        let _ = self.updates_tx.send(snapshot);
        Ok(())
    }

    /// Force a reload from disk and broadcast the new snapshot.
    pub fn refresh(&self) -> Result<()> {
        let root = self
            .root
            .as_deref()
            .ok_or_else(|| AppError::message("registry was not loaded from a config root"))?;
        let sources = load_sources(root)?;
        let new_state = RegistryState::from_sources(sources.into_iter().map(Arc::new));
        let snapshot = new_state.ordered.clone();

        {
            let mut state = self.state.write().expect("registry lock poisoned");
            *state = new_state;
        }

        info!("Reloaded {} source definitions", snapshot.len());
        let _ = self.updates_tx.send(snapshot);
        Ok(())
    }

    /// Begin watching `config/sources` for changes. Multiple invocations are no-ops.
    ///
    /// The watcher only holds a weak handle, so dropping the last `Arc` stops it.
    pub fn start_watching(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.watcher.lock().expect("watcher lock poisoned");
        if slot.is_some() {
            return Ok(());
        }

        let root = self
            .root
            .as_deref()
            .ok_or_else(|| AppError::message("registry was not loaded from a config root"))?;
        let dir = sources_dir(root);
        if !dir.exists() {
            std::fs::create_dir_all(&dir).map_err(|err| AppError::storage(&dir, err))?;
        }

        let registry: Weak<Self> = Arc::downgrade(self);
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) if is_relevant_event(&event.kind) => {
                    let Some(registry) = registry.upgrade() else {
                        return;
                    };
                    if let Err(err) = registry.refresh() {
                        warn!("Failed to reload source definitions: {err}");
                    }
                }
                Ok(_) => {}
                Err(err) => warn!("Source config watch error: {err}"),
            })
            .map_err(|err| AppError::message(format!("Failed to start watcher: {err}")))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|err| AppError::message(format!("Failed to watch {}: {err}", dir.display())))?;
        *slot = Some(watcher);
        Ok(())
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }
}

fn is_relevant_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(_)
            | EventKind::Remove(_)
            | EventKind::Any
            | EventKind::Other
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn source(name: &str, unit: &str) -> Source {
        Source::new(name, "https://api.example.com/v1", "value", unit).unwrap()
    }

    #[test]
    fn register_replaces_without_touching_held_handles() {
        let registry = SourceRegistry::from_sources(vec![source("alpha", "celsius")]);
        let held = registry.get("alpha").expect("alpha registered");

        registry
            .register(source("alpha", "kelvin"))
            .expect("re-register");

        assert_eq!(held.unit, "celsius");
        assert_eq!(registry.get("alpha").unwrap().unit, "kelvin");
        assert_eq!(registry.names(), vec!["alpha".to_string()]);
    }

    #[test]
    fn register_broadcasts_snapshot() {
        let registry = SourceRegistry::from_sources(Vec::new());
        let rx = registry.subscribe();

        registry.register(source("beta", "usd")).unwrap();

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow().len(), 1);
    }

    #[test]
    fn refresh_reloads_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("config").join("sources");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("a.json"),
            r#"{"name": "a", "url": "https://x.example.com", "unit": "u"}"#,
        )
        .unwrap();

        let registry = SourceRegistry::load(tmp.path()).expect("registry loads");
        assert_eq!(registry.names(), vec!["a".to_string()]);

        fs::write(
            dir.join("b.json"),
            r#"{"name": "b", "url": "https://y.example.com", "unit": "u"}"#,
        )
        .unwrap();
        registry.refresh().expect("refresh succeeds");

        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn watcher_picks_up_new_definitions() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("config").join("sources");
        fs::create_dir_all(&dir).unwrap();

        let registry = Arc::new(SourceRegistry::load(tmp.path()).expect("registry loads"));
        registry.start_watching().expect("watcher starts");
        registry.start_watching().expect("second call is a no-op");
        let rx = registry.subscribe();

        fs::write(
            dir.join("c.json"),
            r#"{"name": "c", "url": "https://z.example.com", "unit": "u"}"#,
        )
        .unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while registry.get("c").is_none() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(registry.names(), vec!["c".to_string()]);
        assert!(rx.has_changed().unwrap());

        let weak = Arc::downgrade(&registry);
        drop(rx);
        drop(registry);
        // A refresh still running on the watcher thread may hold a handle briefly.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while weak.upgrade().is_some() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn refresh_requires_root() {
        let registry = SourceRegistry::from_sources(Vec::new());
        assert!(registry.refresh().is_err());
    }
}
