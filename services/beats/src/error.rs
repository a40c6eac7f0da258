use std::time::Duration;
use thiserror::Error;

use crate::blob_store::StorageError;

/// Errors surfaced by the coordinator and its collaborators.
///
/// Transport layers map these onto status codes; the event-processing path
/// has no caller to report to and routes failures to logs and the
/// dead-letter sink instead.
#[derive(Error, Debug)]
pub enum BeatError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("service overloaded, retry after {retry_after:?}")]
    Overloaded { retry_after: Duration },

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BeatError {
    /// True for errors the caller may retry after a delay.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BeatError::Overloaded { .. } | BeatError::UpstreamUnavailable(_)
        )
    }
}

impl From<StorageError> for BeatError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => BeatError::NotFound(format!("blob {}", key)),
            StorageError::InvalidKey(msg) => BeatError::Validation(msg),
            StorageError::Timeout(msg)
            | StorageError::Backend(msg)
            | StorageError::UploadFailed(msg)
            | StorageError::DownloadFailed(msg)
            | StorageError::DeleteFailed(msg) => BeatError::UpstreamUnavailable(msg),
        }
    }
}
