//! GitHub core API rate limit handling
//!
//! The lister never sleeps for a window reset. Low headroom fails the
//! listing with [`GitHubError::RateLimited`] and discovery retries on a
//! later tick.

use super::error::{GitHubError, GitHubResult};
use crate::core::time::TimeProvider;
use octocrab::Octocrab;
use std::time::Duration;

/// Below this many remaining requests the lister stops until the reset
const MIN_REMAINING_THRESHOLD: u32 = 5;

#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    pub remaining: u32,
    /// Unix timestamp when the window resets
    pub reset: u64,
    pub limit: u32,
}

pub async fn check_core_rate_limit(octocrab: &Octocrab) -> Result<RateLimitInfo, octocrab::Error> {
    let rate_limit = octocrab.ratelimit().get().await?;
    let core = &rate_limit.resources.core;

    Ok(RateLimitInfo {
        remaining: core.remaining as u32,
        reset: core.reset,
        limit: core.limit as u32,
    })
}

/// Time until the window resets when headroom is too low, `None` otherwise
pub fn required_wait(info: &RateLimitInfo, now_secs: u64) -> Option<Duration> {
    if info.remaining >= MIN_REMAINING_THRESHOLD || info.reset <= now_secs {
        return None;
    }
    Some(Duration::from_secs(info.reset - now_secs))
}

/// Fail with [`GitHubError::RateLimited`] when the window is nearly spent
pub fn check_headroom(info: &RateLimitInfo, now_secs: u64) -> GitHubResult<()> {
    match required_wait(info, now_secs) {
        Some(wait) => Err(GitHubError::RateLimited {
            remaining: info.remaining,
            limit: info.limit,
            reset_in_secs: wait.as_secs(),
        }),
        None => Ok(()),
    }
}

/// Query the core limit and check there is room for another request
pub async fn ensure_core_rate_limit(
    octocrab: &Octocrab,
    clock: &dyn TimeProvider,
) -> GitHubResult<()> {
    let info = check_core_rate_limit(octocrab).await?;
    check_headroom(&info, clock.now().timestamp().max(0) as u64)
}
