use std::path::PathBuf;
use thiserror::Error;

/// Classification of a [`RedlineError`] used at API boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    SecurityViolation,
    Processing,
    Internal,
}

#[derive(Error, Debug)]
pub enum RedlineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Security violation: {0}")]
    SecurityViolation(String),

    #[error("Processing failed: {0}")]
    Processing(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Integrity check failed for file {id}: expected {expected}, got {actual}")]
    Integrity {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RedlineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RedlineError::Validation(_) => ErrorKind::Validation,
            RedlineError::NotFound(_) => ErrorKind::NotFound,
            RedlineError::Conflict(_) => ErrorKind::Conflict,
            RedlineError::SecurityViolation(_) => ErrorKind::SecurityViolation,
            RedlineError::Processing(_) => ErrorKind::Processing,
            RedlineError::Config(_) => ErrorKind::Validation,
            RedlineError::Database(_)
            | RedlineError::Io { .. }
            | RedlineError::Integrity { .. }
            | RedlineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Message safe to hand to a client.
    ///
    /// Security and internal failures never leak their detail; callers are
    /// expected to log the full error themselves.
    pub fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::SecurityViolation => "Request rejected".to_string(),
            ErrorKind::Internal => "Internal error".to_string(),
            _ => self.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Processing)
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

pub type Result<T> = std::result::Result<T, RedlineError>;
