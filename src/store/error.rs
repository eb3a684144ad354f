//! Store Error Types

use crate::core::error_handling::ContextualError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Schema migration {version} failed: {source}")]
    Migration {
        version: u32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Migration lock is held by {holder}")]
    MigrationLocked { holder: String },

    #[error("Repository {id} not found")]
    RepositoryNotFound { id: i64 },

    #[error("Invalid stored value in {column}: {message}")]
    Corrupt { column: &'static str, message: String },
}

impl ContextualError for StoreError {
    fn is_user_actionable(&self) -> bool {
        matches!(self, StoreError::MigrationLocked { .. })
    }

    fn user_message(&self) -> Option<&str> {
        match self {
            StoreError::MigrationLocked { .. } => Some(
                "another repowatch process holds the schema migration lock; remove the stale migration_lock row if no migration is running",
            ),
            _ => None,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
