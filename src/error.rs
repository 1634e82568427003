use std::io;

use thiserror::Error;

/// Failures surfaced by the history store and engine.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("no item found at position {position}")]
    NotFound { position: i64 },

    #[error("invalid history list: {0}")]
    InvalidList(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
