//! Error types for murmur-agent

use thiserror::Error;

/// Result type alias using murmur-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can end a turn
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the backend layer
    #[error(transparent)]
    Ai(#[from] murmur_ai::Error),

    /// The spawned turn task panicked or was aborted
    #[error("turn task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
