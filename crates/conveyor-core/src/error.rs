//! Error types for conveyor-core

use thiserror::Error;

/// Core error type for conveyor operations
#[derive(Debug, Error)]
pub enum Error {
    /// Identifier failed validation
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// A wire message could not be decoded
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// No runtime is registered for the named pipeline
    #[error("unknown pipeline: {0}")]
    UnknownPipeline(String),

    /// Configuration is invalid or could not be loaded
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A pipeline's target execution failed
    #[error("execution failed: {0}")]
    Execution(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedMessage(err.to_string())
    }
}

/// Result type alias for conveyor-core operations
pub type Result<T> = std::result::Result<T, Error>;
