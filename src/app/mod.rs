pub mod bootstrap;
pub mod history;
pub mod orchestrator;
pub mod state;

pub use bootstrap::{rebuild_store, Runtime};
pub use history::{CycleOutcome, FetchHistory, FetchRecord};
pub use orchestrator::{CycleHandle, CycleReport, FetchOrchestrator};
pub use state::{FailureInfo, FetchState, FetchStatus, StatusEvent};
