//! Retry with a fixed delay between attempts
//!
//! Used for startup preconditions such as the schema migration lock.

use std::time::Duration;

/// Fixed-backoff retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

/// Run a synchronous operation, retrying failures until the policy is
/// exhausted. Sleeps the calling thread between attempts; the last error is
/// returned.
pub fn retry_blocking<F, T, E>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation() {
            Ok(result) => return Ok(result),
            Err(error) if attempt < attempts => {
                log::warn!(
                    "Operation '{}' failed on attempt {}/{}, retrying in {:?}: {}",
                    operation_name,
                    attempt,
                    attempts,
                    policy.delay,
                    error
                );
                std::thread::sleep(policy.delay);
            }
            Err(error) => return Err(error),
        }
    }
}
