//! Error types for the conveyor worker

use conveyor_broker::ChannelError;
use thiserror::Error;

/// Worker-level error: transport failures that escaped the retry budget,
/// plus protocol/core failures.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Transport failure after the single reconnect-and-retry
    #[error(transparent)]
    Transport(#[from] ChannelError),

    /// Protocol, configuration or pipeline failure
    #[error(transparent)]
    Core(#[from] conveyor_core::Error),
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Core(conveyor_core::Error::from(err))
    }
}

/// Result type alias for worker operations
pub type Result<T> = std::result::Result<T, WorkerError>;
