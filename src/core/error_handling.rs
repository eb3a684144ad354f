//! Fatal error reporting
//!
//! Startup failures (bad configuration, unusable database, unwritable
//! workspace) are reported once through [`log_error_with_context`] and end
//! the process before any worker is launched.

/// Errors that know whether an operator can fix them directly
///
/// When `is_user_actionable()` returns `true`, `user_message()` returns the
/// message to show. Otherwise it returns `None` and only the operation
/// context is shown, with details at debug level.
pub trait ContextualError: std::error::Error {
    fn is_user_actionable(&self) -> bool;

    fn user_message(&self) -> Option<&str>;
}

/// Log a fatal error with the right amount of detail
pub fn log_error_with_context<E: ContextualError + std::fmt::Display + std::fmt::Debug>(
    error: &E,
    operation_context: &str,
) {
    match error.user_message().filter(|_| error.is_user_actionable()) {
        Some(user_msg) => log::error!("FATAL: {}: {}", operation_context, user_msg),
        None => log::error!("FATAL: {}: {}", operation_context, error),
    }
    log::debug!("DEBUG_DETAILS: {:?}", error);
}
