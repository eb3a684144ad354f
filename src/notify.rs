//! Delivery of newly found credentials
//!
//! Notification is fire-and-forget: the scanner logs a failed delivery and
//! moves on.

use crate::store::NewCredential;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notification delivery failed: {message}")]
    Delivery { message: String },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// `repository` is `owner/name`
    async fn notify(
        &self,
        repository: &str,
        credentials: &[NewCredential],
        private: bool,
    ) -> Result<(), NotifyError>;
}

/// Writes one warning per finding to the log
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        repository: &str,
        credentials: &[NewCredential],
        private: bool,
    ) -> Result<(), NotifyError> {
        let visibility = if private { "private" } else { "public" };
        for credential in credentials {
            log::warn!(
                "Credential found in {} ({}) at {}:{} commit {} [{}..{}]",
                repository,
                visibility,
                credential.path,
                credential.line_number,
                credential.sha,
                credential.match_start,
                credential.match_end
            );
        }
        Ok(())
    }
}
