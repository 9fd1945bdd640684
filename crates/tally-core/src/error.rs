//! Error types for tally-core

use thiserror::Error;

/// Result type alias using tally-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tally-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite error from the structured storage tier
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP transport error from the remote gateway adapter
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Remote gateway rejected or mangled a request
    #[error("Remote gateway error: {0}")]
    Remote(String),

    /// Both storage tiers failed; the mutation was not persisted
    #[error("Storage error: {0}")]
    Storage(String),

    /// Record or ledger entry not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
