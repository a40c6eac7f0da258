//! Beat metadata model and its Postgres repository.
//!
//! The coordinator only depends on the [`BeatRepository`] trait; the sqlx
//! implementation lives here and the in-memory fake used by tests lives in
//! `testing.rs`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::error::BeatError;

/// A stored blob and the client-facing metadata that travels with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub s3_key: String,
    pub filename: String,
    pub size_bytes: i64,
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Beat {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub audio: BlobRef,
    pub cover: Option<BlobRef>,
    pub is_public: bool,
    pub play_count: i64,
    pub download_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewBeat {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub audio: BlobRef,
    pub cover: Option<BlobRef>,
    pub is_public: bool,
}

/// Partial update. `None` fields are left untouched; the cover needs a
/// three-way patch because "remove the cover" is a valid request.
#[derive(Debug, Clone, Default)]
pub struct BeatPatch {
    pub title: Option<String>,
    pub is_public: Option<bool>,
    pub audio: Option<BlobRef>,
    pub cover: CoverPatch,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CoverPatch {
    #[default]
    Unchanged,
    Clear,
    Set(BlobRef),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterField {
    Plays,
    Downloads,
}

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("record not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(String),
}

// Postgres unique-violation SQLSTATE.
const UNIQUE_VIOLATION: &str = "23505";

impl From<sqlx::Error> for RepoError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepoError::NotFound,
            sqlx::Error::Database(db)
                if db.code().as_deref() == Some(UNIQUE_VIOLATION) =>
            {
                RepoError::Conflict(db.to_string())
            }
            other => RepoError::Database(other.to_string()),
        }
    }
}

impl From<RepoError> for BeatError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound => BeatError::NotFound("beat".to_string()),
            RepoError::Conflict(msg) => BeatError::Conflict(msg),
            RepoError::Database(msg) => BeatError::Internal(msg),
        }
    }
}

pub type RepoResult<T> = Result<T, RepoError>;

#[async_trait]
pub trait BeatRepository: Send + Sync {
    async fn insert(&self, beat: NewBeat) -> RepoResult<Beat>;

    async fn get(&self, id: Uuid) -> RepoResult<Beat>;

    async fn update(&self, id: Uuid, patch: BeatPatch) -> RepoResult<Beat>;

    /// Removes the row. `NotFound` when no row matched.
    async fn delete(&self, id: Uuid) -> RepoResult<()>;

    async fn list_by_owner(&self, owner_id: Uuid) -> RepoResult<Vec<Beat>>;

    /// Atomic in-database increment; returns the new counter value.
    async fn increment_counter(&self, id: Uuid, field: CounterField) -> RepoResult<i64>;
}

pub struct PgBeatRepository {
    pool: PgPool,
}

impl PgBeatRepository {
    pub async fn connect(database_url: &str, max_connections: u32) -> RepoResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| RepoError::Database(e.to_string()))?;

        info!(max_connections, "beat repository connected, migrations applied");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_beat(row: &PgRow) -> Result<Beat, sqlx::Error> {
    let cover = match row.try_get::<Option<String>, _>("cover_s3_key")? {
        Some(s3_key) => Some(BlobRef {
            s3_key,
            filename: row.try_get("cover_filename")?,
            size_bytes: row.try_get("cover_size_bytes")?,
            format: row.try_get("cover_format")?,
        }),
        None => None,
    };

    Ok(Beat {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        title: row.try_get("title")?,
        audio: BlobRef {
            s3_key: row.try_get("audio_s3_key")?,
            filename: row.try_get("audio_filename")?,
            size_bytes: row.try_get("audio_size_bytes")?,
            format: row.try_get("audio_format")?,
        },
        cover,
        is_public: row.try_get("is_public")?,
        play_count: row.try_get("play_count")?,
        download_count: row.try_get("download_count")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl BeatRepository for PgBeatRepository {
    async fn insert(&self, beat: NewBeat) -> RepoResult<Beat> {
        let (cover_key, cover_filename, cover_size, cover_format) = match &beat.cover {
            Some(c) => (
                Some(c.s3_key.as_str()),
                Some(c.filename.as_str()),
                Some(c.size_bytes),
                Some(c.format.as_str()),
            ),
            None => (None, None, None, None),
        };

        let row = sqlx::query(
            r#"
            INSERT INTO beats (
                id, owner_id, title,
                audio_s3_key, audio_filename, audio_size_bytes, audio_format,
                cover_s3_key, cover_filename, cover_size_bytes, cover_format,
                is_public
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING *
            "#,
        )
        .bind(beat.id)
        .bind(beat.owner_id)
        .bind(&beat.title)
        .bind(&beat.audio.s3_key)
        .bind(&beat.audio.filename)
        .bind(beat.audio.size_bytes)
        .bind(&beat.audio.format)
        .bind(cover_key)
        .bind(cover_filename)
        .bind(cover_size)
        .bind(cover_format)
        .bind(beat.is_public)
        .fetch_one(&self.pool)
        .await?;

        Ok(row_to_beat(&row)?)
    }

    async fn get(&self, id: Uuid) -> RepoResult<Beat> {
        let row = sqlx::query("SELECT * FROM beats WHERE id = $1")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;

        Ok(row_to_beat(&row)?)
    }

    async fn update(&self, id: Uuid, patch: BeatPatch) -> RepoResult<Beat> {
        let (audio_key, audio_filename, audio_size, audio_format) = match &patch.audio {
            Some(a) => (
                Some(a.s3_key.as_str()),
                Some(a.filename.as_str()),
                Some(a.size_bytes),
                Some(a.format.as_str()),
            ),
            None => (None, None, None, None),
        };

        let cover_changed = patch.cover != CoverPatch::Unchanged;
        let (cover_key, cover_filename, cover_size, cover_format) = match &patch.cover {
            CoverPatch::Set(c) => (
                Some(c.s3_key.as_str()),
                Some(c.filename.as_str()),
                Some(c.size_bytes),
                Some(c.format.as_str()),
            ),
            _ => (None, None, None, None),
        };

        let row = sqlx::query(
            r#"
            UPDATE beats SET
                title = COALESCE($2, title),
                is_public = COALESCE($3, is_public),
                audio_s3_key = COALESCE($4, audio_s3_key),
                audio_filename = COALESCE($5, audio_filename),
                audio_size_bytes = COALESCE($6, audio_size_bytes),
                audio_format = COALESCE($7, audio_format),
                cover_s3_key = CASE WHEN $8 THEN $9 ELSE cover_s3_key END,
                cover_filename = CASE WHEN $8 THEN $10 ELSE cover_filename END,
                cover_size_bytes = CASE WHEN $8 THEN $11 ELSE cover_size_bytes END,
                cover_format = CASE WHEN $8 THEN $12 ELSE cover_format END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(patch.title.as_deref())
        .bind(patch.is_public)
        .bind(audio_key)
        .bind(audio_filename)
        .bind(audio_size)
        .bind(audio_format)
        .bind(cover_changed)
        .bind(cover_key)
        .bind(cover_filename)
        .bind(cover_size)
        .bind(cover_format)
        .fetch_one(&self.pool)
        .await?;

        Ok(row_to_beat(&row)?)
    }

    async fn delete(&self, id: Uuid) -> RepoResult<()> {
        let result = sqlx::query("DELETE FROM beats WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }

    async fn list_by_owner(&self, owner_id: Uuid) -> RepoResult<Vec<Beat>> {
        let rows = sqlx::query(
            "SELECT * FROM beats WHERE owner_id = $1 ORDER BY created_at DESC",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row_to_beat(row).map_err(RepoError::from))
            .collect()
    }

    async fn increment_counter(&self, id: Uuid, field: CounterField) -> RepoResult<i64> {
        let sql = match field {
            CounterField::Plays => {
                "UPDATE beats SET play_count = play_count + 1, updated_at = NOW()
                 WHERE id = $1 RETURNING play_count"
            }
            CounterField::Downloads => {
                "UPDATE beats SET download_count = download_count + 1, updated_at = NOW()
                 WHERE id = $1 RETURNING download_count"
            }
        };

        let row = sqlx::query(sql).bind(id).fetch_one(&self.pool).await?;
        Ok(row.try_get(0)?)
    }
}
