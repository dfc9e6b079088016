use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use log::{debug, info, warn};
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::{self, JoinHandle};
use tokio::time::sleep;

use crate::config::{PipelineSettings, Source, SourceRegistry};
use crate::error::{AppError, Result};
use crate::fetch::{ensure_concurrency_limit, FetchClient, FetchFailure, RawResponse};
use crate::pipeline::{Normalizer, Validator};
use crate::records::{BackupRecord, StorageManager};
use crate::series::Dataset;
use crate::store::SharedStore;

use super::history::{CycleOutcome, FetchHistory, FetchRecord};
use super::state::{FailureInfo, FetchState, FetchStatus, StatusEvent};

const EVENT_CAPACITY: usize = 256;

/// Result of a cycle that made it all the way to `Idle`.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub source: String,
    pub cycle: u64,
    pub attempts: u32,
    pub from_cache: bool,
    pub batch_points: usize,
    pub total_points: usize,
    pub quality_score: u8,
    pub version: String,
}

/// Handle to an accepted cycle running in the background.
pub struct CycleHandle {
    pub source: String,
    pub cycle: u64,
    task: JoinHandle<Result<CycleReport>>,
}

impl CycleHandle {
    pub async fn join(self) -> Result<CycleReport> {
        self.task.await?
    }
}

struct Slot {
    status: FetchStatus,
    cancel: Option<watch::Sender<bool>>,
}

/// Why a cycle ended early, with the HTTP attempts it had spent by then.
struct CycleFailure {
    error: AppError,
    attempts: Option<u32>,
}

impl From<AppError> for CycleFailure {
    fn from(error: AppError) -> Self {
        Self {
            error,
            attempts: None,
        }
    }
}

impl From<FetchFailure> for CycleFailure {
    fn from(failure: FetchFailure) -> Self {
        Self {
            attempts: Some(failure.attempts),
            error: failure.into(),
        }
    }
}

/// Drives fetch cycles for every registered source with at most one cycle per
/// source in flight and a global cap on concurrent fetches.
pub struct FetchOrchestrator {
    registry: Arc<SourceRegistry>,
    client: FetchClient,
    validator: Validator,
    normalizer: Normalizer,
    storage: Arc<StorageManager>,
    store: Arc<SharedStore>,
    settings: PipelineSettings,
    permits: Arc<Semaphore>,
    slots: Mutex<HashMap<String, Slot>>,
    events: broadcast::Sender<StatusEvent>,
    history: FetchHistory,
    next_cycle: AtomicU64,
}

impl FetchOrchestrator {
    pub fn new(
        registry: Arc<SourceRegistry>,
        client: FetchClient,
        storage: Arc<StorageManager>,
        store: Arc<SharedStore>,
        settings: PipelineSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let permits = ensure_concurrency_limit(settings.max_concurrent_fetches);
        Self {
            registry,
            client,
            validator: Validator::new(settings.validation_sample_size),
            normalizer: Normalizer::new(),
            storage,
            store,
            permits: Arc::new(Semaphore::new(permits)),
            slots: Mutex::new(HashMap::new()),
            events,
            history: FetchHistory::new(settings.history_limit),
            next_cycle: AtomicU64::new(0),
            settings,
        }
    }

    pub fn from_settings(
        registry: Arc<SourceRegistry>,
        storage: Arc<StorageManager>,
        store: Arc<SharedStore>,
        settings: PipelineSettings,
    ) -> Result<Self> {
        let client = FetchClient::from_settings(&settings)?;
        Ok(Self::new(registry, client, storage, store, settings))
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<SharedStore> {
        &self.store
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    pub fn history(&self) -> &FetchHistory {
        &self.history
    }

    /// Start a cycle for `name`. Rejected with `AlreadyInProgress` while another
    /// cycle or restore owns the source.
    pub fn trigger(self: &Arc<Self>, name: &str) -> Result<CycleHandle> {
        let source = self
            .registry
            .get(name)
            .ok_or_else(|| AppError::UnknownSource(name.to_string()))?;
        let (cycle, cancel) = self.begin(name, FetchState::Fetching)?;
        info!("{}: cycle {} accepted", name, cycle);

        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.run_cycle(source, cycle, cancel).await });
        Ok(CycleHandle {
            source: name.to_string(),
            cycle,
            task,
        })
    }

    /// Trigger every registered source, reporting acceptance per source.
    pub fn trigger_all(self: &Arc<Self>) -> Vec<(String, Result<CycleHandle>)> {
        self.registry
            .names()
            .into_iter()
            .map(|name| {
                let accepted = self.trigger(&name);
                (name, accepted)
            })
            .collect()
    }

    /// Trigger `names` and wait for every accepted cycle, in input order.
    pub async fn run_sources(self: &Arc<Self>, names: &[String]) -> Vec<(String, Result<CycleReport>)> {
        let pending: Vec<(String, Result<CycleHandle>)> = names
            .iter()
            .map(|name| (name.clone(), self.trigger(name)))
            .collect();

        stream::iter(pending)
            .map(|(name, accepted)| async move {
                let outcome = match accepted {
                    Ok(handle) => handle.join().await,
                    Err(err) => Err(err),
                };
                (name, outcome)
            })
            .buffered(names.len().max(1))
            .collect()
            .await
    }

    /// Current state of `name`. Fields no cycle has filled in yet are taken from
    /// the dataset already in the shared store, e.g. one loaded at startup.
    pub fn status(&self, name: &str) -> Result<FetchStatus> {
        let known = {
            let slots = self.slots.lock().expect("orchestrator lock poisoned");
            slots.get(name).map(|slot| slot.status.clone())
        };
        let mut status = match known {
            Some(status) => status,
            None if self.registry.get(name).is_some() => FetchStatus::idle(name),
            None => return Err(AppError::UnknownSource(name.to_string())),
        };

        if status.last_updated.is_none() {
            if let Some(dataset) = self.store.try_get(name) {
                status.last_updated = Some(dataset.metadata.last_updated);
                status.quality_score = Some(dataset.metadata.quality_score);
                status.total_records = Some(dataset.len());
            }
        }
        Ok(status)
    }

    pub fn statuses(&self) -> Vec<FetchStatus> {
        self.registry
            .names()
            .iter()
            .filter_map(|name| self.status(name).ok())
            .collect()
    }

    /// Request cancellation of the running cycle. Returns `false` when nothing
    /// cancellable is in flight.
    pub fn cancel(&self, name: &str) -> bool {
        let slots = self.slots.lock().expect("orchestrator lock poisoned");
        let Some(slot) = slots.get(name) else {
            return false;
        };
        match (&slot.cancel, slot.status.state.is_cancellable()) {
            (Some(cancel), true) => {
                info!("{}: cancellation requested for cycle {}", name, slot.status.cycle);
                cancel.send_replace(true);
                true
            }
            _ => false,
        }
    }

    /// Make a stored version current again under the same single-flight guard as a cycle.
    pub async fn restore(self: &Arc<Self>, name: &str, version: &str) -> Result<Arc<Dataset>> {
        if self.registry.get(name).is_none() {
            return Err(AppError::UnknownSource(name.to_string()));
        }
        let (cycle, _cancel) = self.begin(name, FetchState::Persisting)?;
        let started_at = Utc::now();

        let storage = Arc::clone(&self.storage);
        let (source, wanted) = (name.to_string(), version.to_string());
        let restored = task::spawn_blocking(move || storage.restore(&source, &wanted))
            .await
            .map_err(AppError::from)
            .and_then(|result| result);

        let dataset = match restored {
            Ok(dataset) => dataset,
            Err(err) => {
                self.fail(name, cycle, started_at, &err, None);
                return Err(err);
            }
        };

        self.transition(name, cycle, FetchState::Notifying, None);
        let published = self.store.publish(name, dataset);
        self.complete(name, cycle, &published);
        self.history.record(FetchRecord {
            source: name.to_string(),
            cycle,
            started_at,
            finished_at: Utc::now(),
            outcome: CycleOutcome::Restored,
            error_category: None,
            error: None,
            attempts: None,
            points: Some(published.len()),
        });
        info!("{}: restored version {}", name, version);
        Ok(published)
    }

    fn begin(&self, name: &str, first: FetchState) -> Result<(u64, watch::Receiver<bool>)> {
        let mut slots = self.slots.lock().expect("orchestrator lock poisoned");
        let slot = slots.entry(name.to_string()).or_insert_with(|| Slot {
            status: FetchStatus::idle(name),
            cancel: None,
        });
        if slot.status.state.is_busy() {
            debug!("{}: rejected trigger while {}", name, slot.status.state);
            return Err(AppError::AlreadyInProgress(name.to_string()));
        }

        let cycle = self.next_cycle.fetch_add(1, Ordering::SeqCst) + 1;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        slot.cancel = Some(cancel_tx);
        slot.status.cycle = cycle;
        self.apply(slot, first, None);
        Ok((cycle, cancel_rx))
    }

    /// Move `name` to `next` if `cycle` still owns the slot.
    fn transition(&self, name: &str, cycle: u64, next: FetchState, error: Option<FailureInfo>) -> bool {
        let mut slots = self.slots.lock().expect("orchestrator lock poisoned");
        match slots.get_mut(name) {
            Some(slot) if slot.status.cycle == cycle => {
                self.apply(slot, next, error);
                true
            }
            _ => false,
        }
    }

    /// Enter `Persisting` unless cancellation was requested. Both happen under the
    /// slot lock, so a `cancel` that reports success always stops the cycle.
    fn persist_unless_cancelled(
        &self,
        name: &str,
        cycle: u64,
        cancel: &watch::Receiver<bool>,
    ) -> Result<()> {
        let mut slots = self.slots.lock().expect("orchestrator lock poisoned");
        let cancel_requested = *cancel.borrow();
        if cancel_requested {
            return Err(AppError::Cancelled);
        }
        if let Some(slot) = slots.get_mut(name).filter(|slot| slot.status.cycle == cycle) {
            self.apply(slot, FetchState::Persisting, None);
        }
        Ok(())
    }

    fn apply(&self, slot: &mut Slot, next: FetchState, error: Option<FailureInfo>) {
        let from = slot.status.state;
        if !from.can_transition_to(next) {
            warn!(
                "{}: unexpected transition {} -> {}",
                slot.status.source, from, next
            );
        }
        debug!("{}: {} -> {} (cycle {})", slot.status.source, from, next, slot.status.cycle);

        let now = Utc::now();
        slot.status.state = next;
        slot.status.changed_at = now;
        if error.is_some() {
            slot.status.last_error = error.clone();
        }
        if !next.is_busy() {
            slot.cancel = None;
        }

        // No receivers is fine.
        let _ = self.events.send(StatusEvent {
            source: slot.status.source.clone(),
            cycle: slot.status.cycle,
            from,
            state: next,
            at: now,
            error,
        });
    }

    fn complete(&self, name: &str, cycle: u64, dataset: &Dataset) {
        let mut slots = self.slots.lock().expect("orchestrator lock poisoned");
        if let Some(slot) = slots.get_mut(name).filter(|slot| slot.status.cycle == cycle) {
            slot.status.last_updated = Some(dataset.metadata.last_updated);
            slot.status.quality_score = Some(dataset.metadata.quality_score);
            slot.status.total_records = Some(dataset.len());
            slot.status.last_error = None;
            self.apply(slot, FetchState::Idle, None);
        }
    }

    fn fail(
        self: &Arc<Self>,
        name: &str,
        cycle: u64,
        started_at: DateTime<Utc>,
        err: &AppError,
        attempts: Option<u32>,
    ) {
        warn!("{}: cycle {} failed: {}", name, cycle, err);
        let info = FailureInfo::from_error(err);
        self.transition(name, cycle, FetchState::Failed, Some(info));

        let outcome = match err {
            AppError::Cancelled => CycleOutcome::Cancelled,
            _ => CycleOutcome::Failed,
        };
        self.history.record(FetchRecord {
            source: name.to_string(),
            cycle,
            started_at,
            finished_at: Utc::now(),
            outcome,
            error_category: Some(err.category()),
            error: Some(err.to_string()),
            attempts,
            points: None,
        });

        let this = Arc::clone(self);
        let source = name.to_string();
        let cooldown = self.settings.failure_cooldown();
        tokio::spawn(async move {
            sleep(cooldown).await;
            this.recover(&source, cycle);
        });
    }

    /// Cool-down expiry: back to `Idle` unless a newer cycle already took over.
    fn recover(&self, name: &str, cycle: u64) {
        let mut slots = self.slots.lock().expect("orchestrator lock poisoned");
        if let Some(slot) = slots.get_mut(name) {
            if slot.status.cycle == cycle && slot.status.state == FetchState::Failed {
                self.apply(slot, FetchState::Idle, None);
            }
        }
    }

    async fn run_cycle(
        self: Arc<Self>,
        source: Arc<Source>,
        cycle: u64,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<CycleReport> {
        let started_at = Utc::now();
        let outcome = AssertUnwindSafe(self.drive(&source, cycle, &mut cancel))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => Err(CycleFailure::from(AppError::message(format!(
                "cycle panicked: {}",
                panic_message(panic.as_ref())
            )))),
        };

        match &result {
            Ok(report) => {
                info!(
                    "{}: cycle {} stored version {} ({} new points, {} total, quality {})",
                    source.name,
                    cycle,
                    report.version,
                    report.batch_points,
                    report.total_points,
                    report.quality_score
                );
                self.history.record(FetchRecord {
                    source: source.name.clone(),
                    cycle,
                    started_at,
                    finished_at: Utc::now(),
                    outcome: CycleOutcome::Succeeded,
                    error_category: None,
                    error: None,
                    attempts: Some(report.attempts),
                    points: Some(report.total_points),
                });
            }
            Err(failure) => {
                self.fail(&source.name, cycle, started_at, &failure.error, failure.attempts)
            }
        }
        result.map_err(|failure| failure.error)
    }

    async fn drive(
        &self,
        source: &Source,
        cycle: u64,
        cancel: &mut watch::Receiver<bool>,
    ) -> std::result::Result<CycleReport, CycleFailure> {
        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| AppError::message("fetch permits closed"))?
            }
            _ = cancelled(cancel) => return Err(AppError::Cancelled.into()),
        };

        let timeout = source.timeout.unwrap_or_else(|| self.settings.request_timeout());
        let raw = tokio::select! {
            result = self.client.fetch(source, timeout) => result?,
            _ = cancelled(cancel) => return Err(AppError::Cancelled.into()),
        };
        drop(permit);

        let attempts = raw.attempts;
        self.process(source, cycle, cancel, raw)
            .await
            .map_err(|error| CycleFailure {
                error,
                attempts: Some(attempts),
            })
    }

    /// Everything after a successful fetch: validate, normalize, persist, publish.
    async fn process(
        &self,
        source: &Source,
        cycle: u64,
        cancel: &watch::Receiver<bool>,
        raw: RawResponse,
    ) -> Result<CycleReport> {
        let name = source.name.as_str();

        self.transition(name, cycle, FetchState::Validating, None);
        let report = self.validator.validate(&raw, source);
        for warning in &report.warnings {
            debug!("{}: validation warning: {}", name, warning);
        }
        if !report.valid {
            return Err(AppError::Validation(report.summary()));
        }

        self.transition(name, cycle, FetchState::Normalizing, None);
        let (batch, _) = self.normalizer.normalize_with_stats(&raw, &report, source)?;
        let batch_points = batch.len();

        self.persist_unless_cancelled(name, cycle, cancel)?;

        let storage = Arc::clone(&self.storage);
        let (merged, record) = task::spawn_blocking(move || merge_and_save(&storage, batch)).await??;

        self.transition(name, cycle, FetchState::Notifying, None);
        let published = self.store.publish(name, merged);
        self.complete(name, cycle, &published);

        Ok(CycleReport {
            source: name.to_string(),
            cycle,
            attempts: raw.attempts,
            from_cache: raw.from_cache,
            batch_points,
            total_points: published.len(),
            quality_score: published.metadata.quality_score,
            version: record.version,
        })
    }
}

/// Fold `batch` into the stored dataset and persist the result.
fn merge_and_save(storage: &StorageManager, batch: Dataset) -> Result<(Dataset, BackupRecord)> {
    let merged = match storage.load(&batch.source) {
        Ok(previous) => previous.merged_with(&batch),
        Err(AppError::NotFound(_)) => batch,
        Err(err) => return Err(err),
    };
    let record = storage.save(&merged)?;
    Ok((merged, record))
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Resolves once cancellation is requested; pends forever if the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let sender_gone = cancel.wait_for(|requested| *requested).await.is_err();
    if sender_gone {
        std::future::pending::<()>().await;
    }
}
