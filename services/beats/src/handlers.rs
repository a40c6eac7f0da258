//! Handlers for inbound bus events.
//!
//! A handler error bubbles up to the dispatcher, which dead-letters the
//! event. Handlers must tolerate redelivery: the bus guarantees
//! at-least-once, nothing more.

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::coordinator::Coordinator;
use crate::error::BeatError;
use crate::events::event_types;

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Envelope `type` this handler subscribes to.
    fn event_type(&self) -> &'static str;

    async fn handle(&self, payload: serde_json::Value) -> anyhow::Result<()>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserDeletedPayload {
    user_id: Uuid,
}

/// Cascade delete: when a user account is removed elsewhere, all of their
/// beats (metadata and blobs) go with it.
pub struct UserDeletedHandler {
    coordinator: Arc<Coordinator>,
}

impl UserDeletedHandler {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl EventHandler for UserDeletedHandler {
    fn event_type(&self) -> &'static str {
        event_types::USER_DELETED
    }

    async fn handle(&self, payload: serde_json::Value) -> anyhow::Result<()> {
        let payload: UserDeletedPayload =
            serde_json::from_value(payload).context("malformed user-deleted payload")?;

        let beats = self
            .coordinator
            .list_by_owner(payload.user_id)
            .await
            .context("listing beats for deleted user")?;

        info!(
            user_id = %payload.user_id,
            beat_count = beats.len(),
            "cascading delete for removed user"
        );

        // One stuck record must not abort the rest of the cascade, and a
        // record already gone (redelivery) is success, not failure.
        for beat in beats {
            match self.coordinator.delete(beat.id).await {
                Ok(()) => {}
                Err(BeatError::NotFound(_)) => {}
                Err(e) => {
                    warn!(beat_id = %beat.id, error = %e, "cascade delete of beat failed");
                }
            }
        }

        Ok(())
    }
}
