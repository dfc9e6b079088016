use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::AppError;

/// Lifecycle of one source's fetch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchState {
    Idle,
    Fetching,
    Validating,
    Normalizing,
    Persisting,
    Notifying,
    Failed,
}

impl FetchState {
    /// A cycle (or restore) currently owns the source.
    pub fn is_busy(self) -> bool {
        !matches!(self, FetchState::Idle | FetchState::Failed)
    }

    /// Cancellation is only honoured before anything durable happens.
    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            FetchState::Fetching | FetchState::Validating | FetchState::Normalizing
        )
    }

    pub fn can_transition_to(self, next: FetchState) -> bool {
        use FetchState::*;
        match (self, next) {
            (Idle | Failed, Fetching | Persisting) => true,
            (Failed, Idle) => true,
            (Fetching, Validating) => true,
            (Validating, Normalizing) => true,
            (Normalizing, Persisting) => true,
            (Persisting, Notifying) => true,
            (Notifying, Idle) => true,
            (from, Failed) => from.is_busy(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FetchState::Idle => "idle",
            FetchState::Fetching => "fetching",
            FetchState::Validating => "validating",
            FetchState::Normalizing => "normalizing",
            FetchState::Persisting => "persisting",
            FetchState::Notifying => "notifying",
            FetchState::Failed => "failed",
        }
    }
}

impl fmt::Display for FetchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureInfo {
    pub category: &'static str,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl FailureInfo {
    pub fn from_error(err: &AppError) -> Self {
        Self {
            category: err.category(),
            message: err.to_string(),
            at: Utc::now(),
        }
    }
}

/// Snapshot answered by `status(source)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchStatus {
    pub source: String,
    pub state: FetchState,
    pub cycle: u64,
    pub changed_at: DateTime<Utc>,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_error: Option<FailureInfo>,
    pub quality_score: Option<u8>,
    pub total_records: Option<usize>,
}

impl FetchStatus {
    pub fn idle(source: &str) -> Self {
        Self {
            source: source.to_string(),
            state: FetchState::Idle,
            cycle: 0,
            changed_at: Utc::now(),
            last_updated: None,
            last_error: None,
            quality_score: None,
            total_records: None,
        }
    }
}

/// Emitted on every state transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub source: String,
    pub cycle: u64,
    pub from: FetchState,
    pub state: FetchState,
    pub at: DateTime<Utc>,
    pub error: Option<FailureInfo>,
}
