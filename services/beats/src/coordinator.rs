//! Consistency coordinator: keeps blob storage and beat metadata in step.
//!
//! Neither store participates in a transaction with the other, so every
//! mutation follows a fixed ordering with a compensation step:
//!
//! * create: blobs must already exist, metadata written last; a failed
//!   metadata write deletes the just-validated blobs.
//! * update: old keys are read first, metadata written, and only then are
//!   the replaced blobs deleted; a failed metadata write deletes the newly
//!   supplied blobs instead.
//! * delete: metadata row goes first (it is the source of truth), blobs are
//!   cleaned up afterwards best-effort.
//!
//! The worst reachable state is an orphaned blob, never a metadata row that
//! points at nothing.

use std::sync::Arc;

use metrics::counter;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::blob_gateway::BlobGateway;
use crate::error::BeatError;
use crate::events::{event_types, EventEnvelope, EventPublisher};
use crate::repository::{
    Beat, BeatPatch, BeatRepository, CounterField, CoverPatch, NewBeat, RepoError,
};

const MAX_TITLE_LEN: usize = 200;

pub struct Coordinator {
    repo: Arc<dyn BeatRepository>,
    gateway: BlobGateway,
    publisher: Arc<dyn EventPublisher>,
}

impl Coordinator {
    pub fn new(
        repo: Arc<dyn BeatRepository>,
        gateway: BlobGateway,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            repo,
            gateway,
            publisher,
        }
    }

    pub fn gateway(&self) -> &BlobGateway {
        &self.gateway
    }

    pub async fn create(&self, beat: NewBeat) -> Result<Beat, BeatError> {
        validate_title(&beat.title)?;

        // Blobs first: the client uploaded via a presigned URL, so confirm
        // the keys actually landed before trusting them in metadata.
        self.require_blob(&beat.audio.s3_key).await?;
        if let Some(cover) = &beat.cover {
            self.require_blob(&cover.s3_key).await?;
        }

        let audio_key = beat.audio.s3_key.clone();
        let cover_key = beat.cover.as_ref().map(|c| c.s3_key.clone());

        let created = match self.repo.insert(beat).await {
            Ok(created) => created,
            Err(e) => {
                if matches!(e, RepoError::Conflict(_)) {
                    // The key collided with a row that already owns the
                    // blob; deleting it would orphan that row's metadata.
                    warn!(error = %e, "beat insert conflicted, leaving blobs in place");
                    return Err(e.into());
                }
                // Metadata write failed: remove the blobs so the failed
                // request leaves nothing behind.
                warn!(error = %e, "beat insert failed, compensating blob deletes");
                self.gateway.delete(&audio_key).await;
                if let Some(key) = &cover_key {
                    self.gateway.delete(key).await;
                }
                return Err(e.into());
            }
        };

        counter!("beats.coordinator.created").increment(1);
        info!(beat_id = %created.id, owner_id = %created.owner_id, "beat created");
        self.publish_best_effort(
            event_types::BEAT_CREATED,
            created.id,
            json!({ "beatId": created.id, "ownerId": created.owner_id }),
        )
        .await;

        Ok(created)
    }

    pub async fn get(&self, id: Uuid) -> Result<Beat, BeatError> {
        Ok(self.repo.get(id).await?)
    }

    pub async fn update(&self, id: Uuid, patch: BeatPatch) -> Result<Beat, BeatError> {
        if let Some(title) = &patch.title {
            validate_title(title)?;
        }

        // Read the old row first: its blob keys are needed for cleanup and
        // they are gone from the database the moment the update lands.
        let old = self.repo.get(id).await?;

        if let Some(audio) = &patch.audio {
            self.require_blob(&audio.s3_key).await?;
        }
        if let CoverPatch::Set(cover) = &patch.cover {
            self.require_blob(&cover.s3_key).await?;
        }

        let new_audio_key = patch.audio.as_ref().map(|a| a.s3_key.clone());
        let new_cover_key = match &patch.cover {
            CoverPatch::Set(c) => Some(c.s3_key.clone()),
            _ => None,
        };
        let cover_changed = patch.cover != CoverPatch::Unchanged;

        let updated = match self.repo.update(id, patch).await {
            Ok(updated) => updated,
            Err(e) => {
                // Metadata still points at the old blobs; discard the new
                // ones so the failed request leaves no trace. A resubmitted
                // key equal to the old record's is still referenced by the
                // surviving row and must be left alone.
                warn!(beat_id = %id, error = %e, "beat update failed, discarding new blobs");
                if let Some(key) = &new_audio_key {
                    if *key != old.audio.s3_key {
                        self.gateway.delete(key).await;
                    }
                }
                if let Some(key) = &new_cover_key {
                    if old.cover.as_ref().map(|c| c.s3_key.as_str()) != Some(key.as_str()) {
                        self.gateway.delete(key).await;
                    }
                }
                return Err(e.into());
            }
        };

        // Metadata now references the new keys; the replaced blobs are
        // unreachable and safe to drop. Failures here only leak debris.
        if let Some(new_key) = &new_audio_key {
            if *new_key != old.audio.s3_key {
                self.gateway.delete(&old.audio.s3_key).await;
            }
        }
        if cover_changed {
            if let Some(old_cover) = &old.cover {
                if new_cover_key.as_deref() != Some(old_cover.s3_key.as_str()) {
                    self.gateway.delete(&old_cover.s3_key).await;
                }
            }
        }

        counter!("beats.coordinator.updated").increment(1);
        info!(beat_id = %updated.id, "beat updated");
        self.publish_best_effort(
            event_types::BEAT_UPDATED,
            updated.id,
            json!({ "beatId": updated.id, "ownerId": updated.owner_id }),
        )
        .await;

        Ok(updated)
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), BeatError> {
        let beat = self.repo.get(id).await?;

        // Metadata is the source of truth: once the row is gone the beat is
        // deleted, whatever happens to the blobs afterwards.
        self.repo.delete(id).await?;

        self.gateway.delete(&beat.audio.s3_key).await;
        if let Some(cover) = &beat.cover {
            self.gateway.delete(&cover.s3_key).await;
        }

        counter!("beats.coordinator.deleted").increment(1);
        info!(beat_id = %id, owner_id = %beat.owner_id, "beat deleted");
        self.publish_best_effort(
            event_types::BEAT_DELETED,
            id,
            json!({ "beatId": id, "ownerId": beat.owner_id }),
        )
        .await;

        Ok(())
    }

    pub async fn list_by_owner(&self, owner_id: Uuid) -> Result<Vec<Beat>, BeatError> {
        Ok(self.repo.list_by_owner(owner_id).await?)
    }

    pub async fn record_play(&self, id: Uuid) -> Result<i64, BeatError> {
        let count = self.repo.increment_counter(id, CounterField::Plays).await?;
        self.publish_best_effort(
            event_types::PLAY_INCREMENTED,
            id,
            json!({ "beatId": id, "playCount": count }),
        )
        .await;
        Ok(count)
    }

    /// Presign a download of the beat's audio under its original filename
    /// and count the download.
    pub async fn issue_download_url(&self, id: Uuid) -> Result<String, BeatError> {
        let beat = self.repo.get(id).await?;
        let url = self
            .gateway
            .issue_download_url(&beat.audio.s3_key, &beat.audio.filename)
            .await?;

        let count = self
            .repo
            .increment_counter(id, CounterField::Downloads)
            .await?;
        self.publish_best_effort(
            event_types::DOWNLOAD_INCREMENTED,
            id,
            json!({ "beatId": id, "downloadCount": count }),
        )
        .await;

        Ok(url)
    }

    async fn require_blob(&self, key: &str) -> Result<(), BeatError> {
        if self.gateway.exists(key).await? {
            Ok(())
        } else {
            Err(BeatError::Validation(format!(
                "blob {} has not been uploaded",
                key
            )))
        }
    }

    /// Publication never fails the primary operation.
    async fn publish_best_effort(
        &self,
        event_type: &str,
        beat_id: Uuid,
        payload: serde_json::Value,
    ) {
        let envelope = match EventEnvelope::new(event_type, payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(event_type = %event_type, error = %e, "event serialization failed");
                return;
            }
        };
        if let Err(e) = self
            .publisher
            .publish(&beat_id.to_string(), &envelope)
            .await
        {
            warn!(event_type = %event_type, beat_id = %beat_id, error = %e, "event publish failed");
        }
    }
}

fn validate_title(title: &str) -> Result<(), BeatError> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(BeatError::Validation("title must not be empty".into()));
    }
    if trimmed.len() > MAX_TITLE_LEN {
        return Err(BeatError::Validation(format!(
            "title exceeds {} characters",
            MAX_TITLE_LEN
        )));
    }
    Ok(())
}
