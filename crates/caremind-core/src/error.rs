//! CareMind error type.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CaremindError>;

/// All errors surfaced by CareMind components.
#[derive(Debug, Error)]
pub enum CaremindError {
    /// Malformed configuration or campaign definition. Rejected at
    /// creation time; never reaches the tick loop.
    #[error("Config error: {0}")]
    Config(String),

    /// Messaging channel failure (transport, auth, API shape).
    #[error("Channel error: {0}")]
    Channel(String),

    /// Persistence failure (ledger or campaign store).
    #[error("Storage error: {0}")]
    Storage(String),

    /// Recurrence / due-evaluation failure.
    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CaremindError {
    /// Shorthand used by the channel crates.
    pub fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}
