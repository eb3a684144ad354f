//! Scanner Error Types

use crate::git::GitError;
use crate::store::StoreError;
use thiserror::Error;

/// A scan unit failed; nothing from it was persisted
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Git error while scanning {repository}: {source}")]
    Git {
        repository: String,
        #[source]
        source: GitError,
    },

    #[error("Failed to persist scan of {repository} ({range}): {source}")]
    Store {
        repository: String,
        range: String,
        #[source]
        source: StoreError,
    },
}

pub type ScanResult<T> = Result<T, ScanError>;
