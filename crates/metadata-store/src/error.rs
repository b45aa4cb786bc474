//! Error types for the metadata store.

use thiserror::Error;

/// Errors raised by the metadata store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    /// A stored column holds a value the schema does not allow.
    #[error("Corrupt record {id}: column {column} holds {value:?}")]
    Corrupt {
        id: String,
        column: &'static str,
        value: String,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;
