//! SQLite persistence for learned extraction patterns.

pub mod repository;
pub mod sqlite;

pub use repository::*;
pub use sqlite::*;

use thiserror::Error;

/// Persistence failures. Logged by the pattern store, never surfaced by a run.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Schema migration v{version} failed: {reason}")]
    MigrationFailed { version: i64, reason: String },

    #[error("Pattern blob is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database file I/O error: {0}")]
    Io(#[from] std::io::Error),
}
