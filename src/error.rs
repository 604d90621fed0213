//! Custom error types for the orchestrator.
//!
//! This module defines the primary error type, `OrchestratorError`, for the
//! entire application. Using the `thiserror` crate, it provides a centralized
//! and consistent way to handle the different kinds of failures that occur
//! while driving a device fleet: configuration problems, batch-file issues,
//! collection-service I/O, and the two process-level outcomes of a worker
//! (`StageFatal` and `Aborted`).
//!
//! Task-level failures are *not* errors: they are classified into
//! [`crate::task::TaskOutcome`] by the task runner and only cross into the
//! pipeline once they have become fatal.

use crate::spec::StageName;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Batch definition error: {0}")]
    Batch(String),

    #[error("Collection service error: {0}")]
    Collection(String),

    #[error("Device command error: {0}")]
    Command(String),

    #[error("Device '{device}' did not reappear after hardware recovery")]
    RecoveryTimeout { device: String },

    #[error("Stage '{stage}' failed fatally on device '{device}': {reason}")]
    StageFatal {
        stage: StageName,
        device: String,
        reason: String,
    },

    #[error("Worker aborted: sibling worker failed fatally")]
    Aborted,
}

impl From<csv::Error> for OrchestratorError {
    fn from(err: csv::Error) -> Self {
        OrchestratorError::Batch(err.to_string())
    }
}

impl From<reqwest::Error> for OrchestratorError {
    fn from(err: reqwest::Error) -> Self {
        OrchestratorError::Collection(err.to_string())
    }
}
