//! Progress events emitted by the scheduler during a run.

use crate::mutation::MutantStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Sender half handed to `Scheduler::run` for the lifetime of one run.
pub type EventSender = mpsc::UnboundedSender<EngineEvent>;

/// A progress or log event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Scheduling started.
    RunStarted {
        timestamp_ms: i64,
        total: usize,
        lanes: usize,
    },
    /// A mutant was dispatched to a lane.
    MutantStarted {
        timestamp_ms: i64,
        mutant_id: usize,
        lane: usize,
    },
    /// A mutant reached a terminal status.
    MutantFinished {
        timestamp_ms: i64,
        mutant_id: usize,
        status: MutantStatus,
        completed: usize,
        total: usize,
    },
    /// The build for a batch failed for every mutant in it.
    BatchBuildFailed { timestamp_ms: i64, batch: usize },
    /// The workspace build failed and a fallback configuration is being tried.
    FallbackApplied {
        timestamp_ms: i64,
        strategy: String,
        lanes: usize,
    },
    /// A survived/killed ratio crossed its threshold; no new mutants start.
    ThresholdReached {
        timestamp_ms: i64,
        survived_ratio: f64,
        killed_ratio: f64,
    },
    /// Cancellation was observed.
    Cancelled { timestamp_ms: i64 },
    /// Scheduling finished.
    RunCompleted {
        timestamp_ms: i64,
        completed: usize,
        not_run: usize,
    },
}

/// Current unix time in milliseconds.
pub fn now_timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Send an event, ignoring a dropped receiver.
pub fn emit(events: Option<&EventSender>, event: EngineEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}
