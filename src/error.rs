//! Fatal, unit-level errors.
//!
//! Per-mutant failures never show up here; adapters turn them into status
//! values. These are the errors that stop a unit before or instead of
//! mutation, each with its own process exit code.

use thiserror::Error;

/// A unit-level setup error that aborts the run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing tool configuration, settings file or input file.
    #[error("{message}")]
    Input { message: String, details: String },

    /// The unmutated tests do not pass.
    #[error("Tests are failing!")]
    FailingTests { details: String },

    /// The unmutated project does not build.
    #[error("Test project build is failed!")]
    FailingBuild { details: String },
}

impl EngineError {
    pub fn input(message: impl Into<String>) -> Self {
        Self::Input {
            message: message.into(),
            details: String::new(),
        }
    }

    /// Process exit code for this error category.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Input { .. } => 1,
            Self::FailingTests { .. } => 2,
            Self::FailingBuild { .. } => 3,
        }
    }

    /// Captured log text attached to the error, if any.
    pub fn details(&self) -> &str {
        match self {
            Self::Input { details, .. }
            | Self::FailingTests { details }
            | Self::FailingBuild { details } => details,
        }
    }
}

/// Map any top-level error to a process exit code.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<EngineError>()
        .map(EngineError::exit_code)
        .unwrap_or(1)
}
