//! Blob gateway: the only component allowed to talk to the blob store.
//!
//! Every call runs the same two-stage admission: a constant-time load-guard
//! check that rejects immediately when the process is saturated, then the
//! concurrency limiter, which queues the call until one of the bounded
//! in-flight slots frees up. Rejection under load therefore never waits on
//! the limiter queue.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::blob_store::{content_type_for_extension, BlobStore, StorageError, StorageResult};
use crate::error::BeatError;
use crate::limiter::{ConcurrencyLimiter, LimiterStats};
use crate::load_guard::LoadGuard;

/// Advisory retry delay handed to callers rejected under load.
pub const OVERLOAD_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Outcome of `issue_upload_url`: where to PUT and under which key the blob
/// will live once uploaded.
#[derive(Debug, Clone)]
pub struct UploadGrant {
    pub key: String,
    pub url: String,
    pub expires_in: Duration,
}

#[derive(Clone)]
pub struct BlobGateway {
    store: Arc<dyn BlobStore>,
    guard: LoadGuard,
    limiter: ConcurrencyLimiter,
    upload_url_ttl: Duration,
    download_url_ttl: Duration,
}

impl BlobGateway {
    pub fn new(
        store: Arc<dyn BlobStore>,
        guard: LoadGuard,
        limiter: ConcurrencyLimiter,
        upload_url_ttl: Duration,
        download_url_ttl: Duration,
    ) -> Self {
        Self {
            store,
            guard,
            limiter,
            upload_url_ttl,
            download_url_ttl,
        }
    }

    /// Admission pipeline shared by every operation: guard first, limiter
    /// second. The guard check never touches the queue, so an overloaded
    /// process answers in microseconds.
    async fn run<T, F>(&self, op_name: &'static str, op: F) -> Result<T, BeatError>
    where
        F: Future<Output = StorageResult<T>>,
    {
        if !self.guard.admit() {
            counter!("beats.gateway.overload_rejections").increment(1);
            warn!(
                op = op_name,
                lag_ms = self.guard.current_lag().as_millis() as u64,
                "rejecting blob operation under load"
            );
            return Err(BeatError::Overloaded {
                retry_after: OVERLOAD_RETRY_AFTER,
            });
        }

        let result = self.limiter.schedule(op).await;
        match &result {
            Ok(_) => counter!("beats.gateway.ops_ok").increment(1),
            Err(_) => counter!("beats.gateway.ops_failed").increment(1),
        }
        Ok(result?)
    }

    pub async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), BeatError> {
        validate_key(key)?;
        self.run("put", self.store.put(key, bytes, content_type))
            .await
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, BeatError> {
        validate_key(key)?;
        self.run("get", self.store.get(key)).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, BeatError> {
        validate_key(key)?;
        self.run("exists", self.store.exists(key)).await
    }

    /// Best-effort delete. Failures (including overload rejection) are
    /// logged and reported as `false`; callers treat leaked blobs as
    /// acceptable debris, never as operation failure.
    pub async fn delete(&self, key: &str) -> bool {
        if validate_key(key).is_err() {
            warn!(key = %key, "skipping delete of malformed blob key");
            return false;
        }
        match self.run("delete", self.store.delete(key)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %key, error = %e, "best-effort blob delete failed");
                false
            }
        }
    }

    /// Grant a client a short-lived URL to upload a blob directly.
    ///
    /// The key is minted here, never taken from the client:
    /// `<owner>/<uuid-v4>.<ext>`, so a grant can only ever write into the
    /// owner's own prefix and never collides with an existing blob.
    pub async fn issue_upload_url(
        &self,
        owner_id: Uuid,
        extension: &str,
        content_type: &str,
    ) -> Result<UploadGrant, BeatError> {
        let ext = extension.trim_start_matches('.').to_ascii_lowercase();
        let expected = content_type_for_extension(&ext).ok_or_else(|| {
            BeatError::Validation(format!("unsupported upload extension: {}", extension))
        })?;
        if !content_type.eq_ignore_ascii_case(expected) {
            return Err(BeatError::Validation(format!(
                "content type {} does not match .{} (expected {})",
                content_type, ext, expected
            )));
        }

        let key = format!("{}/{}.{}", owner_id, Uuid::new_v4(), ext);
        let ttl = self.upload_url_ttl;
        let url = self
            .run(
                "presign_put",
                self.store.presign_put(&key, expected, ttl),
            )
            .await?;

        debug!(owner_id = %owner_id, key = %key, ttl_secs = ttl.as_secs(), "upload URL issued");
        Ok(UploadGrant {
            key,
            url,
            expires_in: ttl,
        })
    }

    /// Grant a short-lived download URL that forces a file download under
    /// `filename` rather than rendering inline.
    pub async fn issue_download_url(
        &self,
        key: &str,
        filename: &str,
    ) -> Result<String, BeatError> {
        validate_key(key)?;
        let ttl = self.download_url_ttl;
        self.run(
            "presign_get",
            self.store.presign_get(key, Some(filename), ttl),
        )
        .await
    }

    pub fn stats(&self) -> LimiterStats {
        self.limiter.stats()
    }
}

/// Reject keys that could escape the bucket namespace or smuggle header
/// content into presigned URLs.
fn validate_key(key: &str) -> Result<(), BeatError> {
    let check = || -> StorageResult<()> {
        if key.is_empty() || key.len() > 1024 {
            return Err(StorageError::InvalidKey(format!(
                "key length {} out of range",
                key.len()
            )));
        }
        if key.starts_with('/') || key.split('/').any(|seg| seg.is_empty() || seg == "..") {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        if key.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(())
    };
    Ok(check()?)
}
