use std::fmt;
use std::time::Duration;

use thiserror::Error;

use super::stage::StageName;
use crate::ai::AnalysisError;
use crate::codec::CodecError;
use crate::error::RedlineError;
use crate::sanitize;

/// Typed failure of a single stage.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("Document codec failed: {0}")]
    Codec(#[from] CodecError),

    #[error("{0}")]
    Analysis(#[from] AnalysisError),

    #[error("{operation} timed out after {}s", timeout.as_secs())]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Expected a {expected} artifact, got {actual}")]
    UnexpectedArtifact {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Storage failed: {0}")]
    Storage(#[source] RedlineError),

    #[error("Could not start worker thread: {0}")]
    Thread(String),

    #[error("Stage panicked: {0}")]
    Panicked(String),
}

impl StageError {
    /// Text safe to store on the job and show to clients.
    pub fn public_message(&self) -> String {
        match self {
            StageError::Storage(e) => format!("Storage failed: {}", e.public_message()),
            StageError::Panicked(_) | StageError::Thread(_) => {
                "Internal error while processing the document".to_string()
            }
            other => sanitize::public_message(&other.to_string()),
        }
    }

    /// Whether running the job again might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StageError::Timeout { .. } | StageError::Thread(_) => true,
            StageError::Analysis(e) => {
                matches!(e, AnalysisError::Service(_) | AnalysisError::Unavailable)
            }
            StageError::Storage(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// A stage error tagged with the stage that raised it.
#[derive(Debug)]
pub struct StageFailure {
    pub stage: StageName,
    pub error: StageError,
}

impl StageFailure {
    pub fn new(stage: StageName, error: StageError) -> Self {
        Self { stage, error }
    }

    /// The message recorded as the job's `error_message`.
    pub fn public_message(&self) -> String {
        format!("Stage '{}' failed: {}", self.stage, self.error.public_message())
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stage '{}' failed: {}", self.stage, self.error)
    }
}

impl std::error::Error for StageFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
