//! Build-failure fallback chain.
//!
//! When a whole batch fails to build, the workspace is rebuilt in a more
//! isolated configuration and the batch retried. Each step is used at most
//! once per run.

use crate::workspace::{IsolationMode, WorkspaceConfig};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackStep {
    /// Fresh per-lane descriptors and solutions, built unoptimised
    IsolatedRebuild,
    /// One lane mutating the original source behind a backup
    SingleLaneInPlace,
}

impl FallbackStep {
    /// The configuration this step moves to, or None if it would change nothing.
    pub fn apply(&self, current: &WorkspaceConfig) -> Option<WorkspaceConfig> {
        let next = match self {
            FallbackStep::IsolatedRebuild => WorkspaceConfig {
                mode: IsolationMode::FullIsolation,
                lanes: current.lanes,
                optimized: false,
            },
            FallbackStep::SingleLaneInPlace => WorkspaceConfig {
                mode: IsolationMode::InPlace,
                lanes: 1,
                optimized: false,
            },
        };
        (next != *current).then_some(next)
    }
}

impl fmt::Display for FallbackStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackStep::IsolatedRebuild => write!(f, "isolated-rebuild"),
            FallbackStep::SingleLaneInPlace => write!(f, "single-lane-in-place"),
        }
    }
}

/// Remaining fallback steps for one run.
#[derive(Debug, Clone)]
pub struct FallbackChain {
    remaining: Vec<FallbackStep>,
    applied: Vec<FallbackStep>,
}

impl FallbackChain {
    pub fn new(enabled: bool) -> Self {
        let remaining = if enabled {
            vec![FallbackStep::IsolatedRebuild, FallbackStep::SingleLaneInPlace]
        } else {
            Vec::new()
        };
        Self {
            remaining,
            applied: Vec::new(),
        }
    }

    /// Consume the next step that changes `current`.
    pub fn next(&mut self, current: &WorkspaceConfig) -> Option<(FallbackStep, WorkspaceConfig)> {
        while !self.remaining.is_empty() {
            let step = self.remaining.remove(0);
            if let Some(next) = step.apply(current) {
                self.applied.push(step);
                return Some((step, next));
            }
        }
        None
    }

    pub fn applied(&self) -> &[FallbackStep] {
        &self.applied
    }
}
