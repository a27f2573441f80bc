use thiserror::Error;

use concierge_shared::ValidationError;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Append rejected before touching the database.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// A persisted row could not be mapped back to the data model.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// Chrono parsing error.
    #[error("Timestamp parse error: {0}")]
    ChronoParse(#[from] chrono::ParseError),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
