//! Remote listing error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("GitHub API error: {0}")]
    Api(#[from] octocrab::Error),

    #[error("GitHub client configuration error: {message}")]
    Client { message: String },

    #[error("Listing unavailable: {message}")]
    Unavailable { message: String },

    #[error("GitHub rate limit low ({remaining}/{limit} remaining), resets in {reset_in_secs}s")]
    RateLimited {
        remaining: u32,
        limit: u32,
        reset_in_secs: u64,
    },
}

pub type GitHubResult<T> = Result<T, GitHubError>;
