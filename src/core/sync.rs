//! Synchronisation helpers
//!
//! Converts lock poisoning into the caller's error type instead of panicking.

use std::sync::LockResult;

/// Map a poisoned lock into an application error.
///
/// # Examples
/// ```
/// use std::sync::Mutex;
/// use repowatch::core::sync::handle_mutex_poison;
///
/// let mutex = Mutex::new(42);
/// let guard = handle_mutex_poison(mutex.lock(), |msg| msg).unwrap();
/// assert_eq!(*guard, 42);
/// ```
pub fn handle_mutex_poison<T, E>(
    result: LockResult<T>,
    error_constructor: impl FnOnce(String) -> E,
) -> Result<T, E> {
    result.map_err(|poison_err| {
        error_constructor(format!(
            "Internal synchronisation error (mutex poisoned). A panic occurred while holding a lock: {:?}",
            poison_err
        ))
    })
}

/// Recover the guard from a poisoned lock. For state that stays consistent
/// even if a holder panicked (sets of keys, counters).
pub fn recover_poison<T>(result: LockResult<T>) -> T {
    match result {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Recovering from poisoned lock");
            poisoned.into_inner()
        }
    }
}
