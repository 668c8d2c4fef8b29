use std::time::Duration;

use thiserror::Error;

use crate::generation::GenerationError;

#[derive(Debug, Error)]
pub enum SpectraError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Timeout after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("AI error: {0}")]
    Generation(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl SpectraError {
    /// Timeouts are the only failure worth retrying from the caller's side.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SpectraError::Timeout(_))
    }
}

impl From<GenerationError> for SpectraError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::Timeout(after) => SpectraError::Timeout(after),
            GenerationError::Configuration(msg) => SpectraError::Config(msg),
            other => SpectraError::Generation(other.to_string()),
        }
    }
}

/// Failures of the network store. Never leaves the job store: every one of
/// them degrades to the in-process backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Redis connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Malformed job record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}
