//! Blob store client abstraction and the S3 implementation.
//!
//! The gateway and coordinator only see the [`BlobStore`] trait, so tests run
//! against an in-memory store and the S3 client is constructed exactly once
//! at startup and injected by reference.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::S3Config;

/// Blob layer errors. Mapped onto the caller-facing taxonomy by the gateway
/// and coordinator.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("delete failed: {0}")]
    DeleteFailed(String),

    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Operations the service needs from an object store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> StorageResult<()>;

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>>;

    async fn delete(&self, key: &str) -> StorageResult<()>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Time-boxed authorization to upload directly to `key` with HTTP PUT.
    async fn presign_put(
        &self,
        key: &str,
        content_type: &str,
        expires_in: Duration,
    ) -> StorageResult<String>;

    /// Time-boxed authorization to fetch `key`. When `download_filename` is
    /// set, the response forces a download under that name instead of the
    /// internal key.
    async fn presign_get(
        &self,
        key: &str,
        download_filename: Option<&str>,
        expires_in: Duration,
    ) -> StorageResult<String>;
}

/// Allowed audio upload formats and their content types.
const AUDIO_TYPES: &[(&str, &str)] = &[
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("flac", "audio/flac"),
    ("ogg", "audio/ogg"),
    ("m4a", "audio/mp4"),
];

/// Allowed cover-image upload formats and their content types.
const IMAGE_TYPES: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("webp", "image/webp"),
];

/// Look up the expected content type for an allowed upload extension.
pub fn content_type_for_extension(extension: &str) -> Option<&'static str> {
    let ext = extension.to_ascii_lowercase();
    AUDIO_TYPES
        .iter()
        .chain(IMAGE_TYPES.iter())
        .find(|(e, _)| *e == ext)
        .map(|(_, ct)| *ct)
}

/// S3-backed blob store.
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
}

impl S3BlobStore {
    pub async fn new(config: &S3Config) -> StorageResult<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut builder = S3ConfigBuilder::from(&aws_config);

        // Custom endpoint for MinIO/LocalStack.
        if let Some(ref endpoint_url) = config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        let client = S3Client::from_conf(builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 blob store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn presigning_config(expires_in: Duration) -> StorageResult<PresigningConfig> {
        PresigningConfig::expires_in(expires_in)
            .map_err(|e| StorageError::Backend(e.to_string()))
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> StorageResult<()> {
        let size = bytes.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::UploadFailed(e.to_string()))?;

        debug!(key = %key, size_bytes = size, "blob uploaded");
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false)
                {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::DownloadFailed(e.to_string())
                }
            })?;

        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|e| StorageError::DownloadFailed(e.to_string()))?;

        Ok(bytes.into_bytes().to_vec())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::DeleteFailed(e.to_string()))?;

        debug!(key = %key, "blob deleted");
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|se| se.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(StorageError::Backend(e.to_string()))
                }
            }
        }
    }

    async fn presign_put(
        &self,
        key: &str,
        content_type: &str,
        expires_in: Duration,
    ) -> StorageResult<String> {
        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .presigned(Self::presigning_config(expires_in)?)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(presigned.uri().to_string())
    }

    async fn presign_get(
        &self,
        key: &str,
        download_filename: Option<&str>,
        expires_in: Duration,
    ) -> StorageResult<String> {
        let mut request = self.client.get_object().bucket(&self.bucket).key(key);

        if let Some(filename) = download_filename {
            request = request.response_content_disposition(format!(
                "attachment; filename=\"{}\"",
                sanitize_disposition_filename(filename)
            ));
        }

        let presigned = request
            .presigned(Self::presigning_config(expires_in)?)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(presigned.uri().to_string())
    }
}

/// Strip characters that would break the content-disposition header.
fn sanitize_disposition_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            '"' | '\\' | '\r' | '\n' => '_',
            _ => c,
        })
        .collect()
}
