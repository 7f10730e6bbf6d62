//! Shared run state: finished counts, early-stop latch and collected results.
//!
//! Everything lives behind one mutex, and events are sent while it is held,
//! so listeners see a serialized stream.

use crate::config::InFlightPolicy;
use crate::mutation::events::{emit, now_timestamp_ms, EngineEvent, EventSender};
use crate::mutation::MutantStatus;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Early-stop bounds on the running survived/killed ratios.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub survived: f64,
    pub killed: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            survived: 1.0,
            killed: 1.0,
        }
    }
}

/// Final classification of one executed mutant.
#[derive(Debug, Clone, PartialEq)]
pub struct MutantResult {
    pub status: MutantStatus,
    pub lane: usize,
    pub diagnostics: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    completed: usize,
    survived: usize,
    killed: usize,
    stopped: bool,
    results: BTreeMap<usize, MutantResult>,
}

pub struct Progress {
    state: Mutex<State>,
    total: usize,
    thresholds: Thresholds,
    policy: InFlightPolicy,
    events: Option<EventSender>,
}

impl Progress {
    pub fn new(
        total: usize,
        thresholds: Thresholds,
        policy: InFlightPolicy,
        events: Option<EventSender>,
    ) -> Self {
        Self {
            state: Mutex::new(State::default()),
            total,
            thresholds,
            policy,
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // Counters are only changed under the lock, so a poisoned lock is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// May a new mutant be dispatched? Re-evaluates the thresholds and
    /// latches the stop once they are crossed.
    pub fn may_start(&self) -> bool {
        let mut state = self.lock();
        if !state.stopped {
            self.check_thresholds(&mut state);
        }
        !state.stopped
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Report a dispatch.
    pub fn started(&self, mutant_id: usize, lane: usize) {
        let _state = self.lock();
        emit(
            self.events.as_ref(),
            EngineEvent::MutantStarted {
                timestamp_ms: now_timestamp_ms(),
                mutant_id,
                lane,
            },
        );
    }

    /// Record a finished mutant. Returns false when the result was dropped
    /// because the run had already stopped and the policy discards in-flight work.
    pub fn record(&self, mutant_id: usize, result: MutantResult) -> bool {
        let mut state = self.lock();
        if state.stopped && self.policy == InFlightPolicy::Discard {
            tracing::debug!("Discarding result of mutant {} after early stop", mutant_id);
            return false;
        }

        match result.status {
            MutantStatus::Survived => state.survived += 1,
            MutantStatus::Killed => state.killed += 1,
            _ => {}
        }
        state.completed += 1;
        let status = result.status;
        state.results.insert(mutant_id, result);

        emit(
            self.events.as_ref(),
            EngineEvent::MutantFinished {
                timestamp_ms: now_timestamp_ms(),
                mutant_id,
                status,
                completed: state.completed,
                total: self.total,
            },
        );

        if !state.stopped {
            self.check_thresholds(&mut state);
        }
        true
    }

    /// Send an event in order with the others.
    pub fn emit(&self, event: EngineEvent) {
        let _state = self.lock();
        emit(self.events.as_ref(), event);
    }

    pub fn completed(&self) -> usize {
        self.lock().completed
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Take the collected results.
    pub fn take_results(&self) -> BTreeMap<usize, MutantResult> {
        std::mem::take(&mut self.lock().results)
    }

    fn check_thresholds(&self, state: &mut State) {
        if self.total == 0 {
            return;
        }
        let survived_ratio = state.survived as f64 / self.total as f64;
        let killed_ratio = state.killed as f64 / self.total as f64;
        if survived_ratio > self.thresholds.survived || killed_ratio > self.thresholds.killed {
            state.stopped = true;
            tracing::info!(
                "Threshold reached (survived {:.2}, killed {:.2}); no new mutants will start",
                survived_ratio,
                killed_ratio
            );
            emit(
                self.events.as_ref(),
                EngineEvent::ThresholdReached {
                    timestamp_ms: now_timestamp_ms(),
                    survived_ratio,
                    killed_ratio,
                },
            );
        }
    }
}
