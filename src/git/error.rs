//! Git Error Types

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GitError {
    /// The git binary could not be started
    #[error("Failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The git binary exited unsuccessfully
    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    /// Opening or reading the object database failed
    #[error("Repository error in {}: {message}", path.display())]
    Repository { path: PathBuf, message: String },

    #[error("Object {oid} not found in {}", path.display())]
    ObjectNotFound { path: PathBuf, oid: String },

    #[error("Invalid object id '{oid}'")]
    InvalidObjectId { oid: String },

    #[error("Git task failed: {message}")]
    Task { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    pub(crate) fn repository(path: &std::path::Path, message: impl std::fmt::Display) -> Self {
        GitError::Repository {
            path: path.to_path_buf(),
            message: message.to_string(),
        }
    }
}

pub type GitResult<T> = Result<T, GitError>;
