//! In-memory fakes for tests. Each one records enough of what happened
//! (deleted keys, published envelopes, sleep durations) for tests to assert
//! on side effects, and can be switched into failure mode to exercise the
//! compensation paths.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::blob_store::{BlobStore, StorageError, StorageResult};
use crate::consumer::Sleeper;
use crate::events::{DeadLetterRecord, DeadLetterSink, EventEnvelope, EventPublisher, PublishError};
use crate::repository::{
    Beat, BeatPatch, BeatRepository, CounterField, CoverPatch, NewBeat, RepoError, RepoResult,
};

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
    deleted: Mutex<Vec<String>>,
    fail_puts: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Keys successfully deleted, in call order.
    pub async fn deleted_keys(&self) -> Vec<String> {
        self.deleted.lock().await.clone()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> StorageResult<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StorageError::UploadFailed("injected put failure".into()));
        }
        self.objects
            .lock()
            .await
            .insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        self.objects
            .lock()
            .await
            .get(key)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::DeleteFailed("injected delete failure".into()));
        }
        self.objects.lock().await.remove(key);
        self.deleted.lock().await.push(key.to_string());
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.objects.lock().await.contains_key(key))
    }

    async fn presign_put(
        &self,
        key: &str,
        content_type: &str,
        expires_in: Duration,
    ) -> StorageResult<String> {
        Ok(format!(
            "https://blobs.test/{}?sig=put&ct={}&ttl={}",
            key,
            content_type,
            expires_in.as_secs()
        ))
    }

    async fn presign_get(
        &self,
        key: &str,
        download_filename: Option<&str>,
        expires_in: Duration,
    ) -> StorageResult<String> {
        let mut url = format!("https://blobs.test/{}?sig=get&ttl={}", key, expires_in.as_secs());
        if let Some(filename) = download_filename {
            url.push_str(&format!("&disposition=attachment; filename={}", filename));
        }
        Ok(url)
    }
}

#[derive(Default)]
pub struct MemoryBeatRepository {
    beats: Mutex<HashMap<Uuid, Beat>>,
    fail_inserts: AtomicBool,
    fail_updates: AtomicBool,
    fail_deletes_flag: AtomicBool,
}

impl MemoryBeatRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes_flag.store(fail, Ordering::SeqCst);
    }

    pub async fn all(&self) -> Vec<Beat> {
        self.beats.lock().await.values().cloned().collect()
    }
}

fn apply_patch(beat: &mut Beat, patch: BeatPatch) {
    if let Some(title) = patch.title {
        beat.title = title;
    }
    if let Some(is_public) = patch.is_public {
        beat.is_public = is_public;
    }
    if let Some(audio) = patch.audio {
        beat.audio = audio;
    }
    match patch.cover {
        CoverPatch::Unchanged => {}
        CoverPatch::Clear => beat.cover = None,
        CoverPatch::Set(cover) => beat.cover = Some(cover),
    }
    beat.updated_at = Utc::now();
}

#[async_trait]
impl BeatRepository for MemoryBeatRepository {
    async fn insert(&self, beat: NewBeat) -> RepoResult<Beat> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(RepoError::Database("injected insert failure".into()));
        }
        let mut beats = self.beats.lock().await;
        // Mirrors the unique constraint on the audio key.
        if beats
            .values()
            .any(|b| b.audio.s3_key == beat.audio.s3_key)
        {
            return Err(RepoError::Conflict(format!(
                "duplicate audio key {}",
                beat.audio.s3_key
            )));
        }

        let now = Utc::now();
        let stored = Beat {
            id: beat.id,
            owner_id: beat.owner_id,
            title: beat.title,
            audio: beat.audio,
            cover: beat.cover,
            is_public: beat.is_public,
            play_count: 0,
            download_count: 0,
            created_at: now,
            updated_at: now,
        };
        beats.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: Uuid) -> RepoResult<Beat> {
        self.beats
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(RepoError::NotFound)
    }

    async fn update(&self, id: Uuid, patch: BeatPatch) -> RepoResult<Beat> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(RepoError::Database("injected update failure".into()));
        }
        let mut beats = self.beats.lock().await;
        let beat = beats.get_mut(&id).ok_or(RepoError::NotFound)?;
        apply_patch(beat, patch);
        Ok(beat.clone())
    }

    async fn delete(&self, id: Uuid) -> RepoResult<()> {
        if self.fail_deletes_flag.load(Ordering::SeqCst) {
            return Err(RepoError::Database("injected delete failure".into()));
        }
        self.beats
            .lock()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(RepoError::NotFound)
    }

    async fn list_by_owner(&self, owner_id: Uuid) -> RepoResult<Vec<Beat>> {
        let mut beats: Vec<Beat> = self
            .beats
            .lock()
            .await
            .values()
            .filter(|b| b.owner_id == owner_id)
            .cloned()
            .collect();
        beats.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(beats)
    }

    async fn increment_counter(&self, id: Uuid, field: CounterField) -> RepoResult<i64> {
        let mut beats = self.beats.lock().await;
        let beat = beats.get_mut(&id).ok_or(RepoError::NotFound)?;
        let count = match field {
            CounterField::Plays => {
                beat.play_count += 1;
                beat.play_count
            }
            CounterField::Downloads => {
                beat.download_count += 1;
                beat.download_count
            }
        };
        beat.updated_at = Utc::now();
        Ok(count)
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(String, EventEnvelope)>>,
    fail_publishes: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<(String, EventEnvelope)> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, key: &str, envelope: &EventEnvelope) -> Result<(), PublishError> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(PublishError::Broker("injected publish failure".into()));
        }
        self.published
            .lock()
            .await
            .push((key.to_string(), envelope.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryDeadLetters {
    records: Mutex<Vec<DeadLetterRecord>>,
}

impl MemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetters {
    async fn record(&self, record: DeadLetterRecord) -> Result<(), PublishError> {
        self.records.lock().await.push(record);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn slept(&self) -> Vec<Duration> {
        self.slept.lock().await.clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().await.push(duration);
    }
}
