//! Push-notification subscription lifecycle and inbound notification
//! handling.
//!
//! Subscriptions expire server-side, so a periodic sweep renews every
//! subscription expiring within the lookahead window. Inbound Pub/Sub
//! notifications are deduplicated against the last accepted history id;
//! only a strictly newer id triggers a sync.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{Duration, Utc};
use log::{info, warn};
use serde::Deserialize;
use uuid::Uuid;

use crate::config::{GoogleConfig, SyncConfig};
use crate::error::SyncError;
use crate::models::CredentialPatch;
use crate::store::CredentialStore;
use crate::token::MailboxConnector;

/// Pub/Sub push envelope as delivered to the webhook endpoint.
#[derive(Debug, Deserialize)]
pub struct PushNotification {
    pub message: PushMessage,
    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PushMessage {
    /// Base64-encoded JSON payload.
    pub data: String,
    #[serde(rename = "messageId", default)]
    pub message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NotificationPayload {
    #[serde(rename = "emailAddress")]
    email_address: String,
    #[serde(rename = "historyId")]
    history_id: HistoryId,
}

/// Google serializes history ids as numbers or strings depending on the
/// API surface; accept both.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HistoryId {
    Number(u64),
    Text(String),
}

impl HistoryId {
    fn value(&self) -> Result<u64, SyncError> {
        match self {
            Self::Number(n) => Ok(*n),
            Self::Text(s) => s
                .parse()
                .map_err(|_| SyncError::InvalidNotification(format!("bad history id: {s}"))),
        }
    }
}

/// Decision for one inbound notification.
#[derive(Debug, Clone)]
pub struct NotificationOutcome {
    pub user_id: Option<Uuid>,
    pub history_id: u64,
    /// The history id was at or behind the last accepted one.
    pub already_processed: bool,
    pub should_sync: bool,
}

pub struct WebhookManager {
    connector: Arc<dyn MailboxConnector>,
    creds: Arc<dyn CredentialStore>,
    topic: String,
    lookahead_hours: i64,
    renew_delay_ms: u64,
}

impl WebhookManager {
    pub fn new(
        connector: Arc<dyn MailboxConnector>,
        creds: Arc<dyn CredentialStore>,
        google: &GoogleConfig,
        config: &SyncConfig,
    ) -> Self {
        Self {
            connector,
            creds,
            topic: google.pubsub_topic.clone(),
            lookahead_hours: config.webhook_lookahead_hours,
            renew_delay_ms: config.renew_delay_ms,
        }
    }

    /// Register a push subscription for the user's inbox and persist the
    /// returned baseline history id and expiry.
    pub async fn register(&self, user_id: Uuid) -> Result<(), SyncError> {
        let session = self.connector.connect(user_id).await?;
        let registration = session
            .watch(&self.topic, &["INBOX".to_string()])
            .await?;
        self.connector
            .persist_if_rotated(user_id, session.as_ref())
            .await;

        let patch = CredentialPatch {
            webhook_history_id: Some(Some(registration.history_id)),
            webhook_expires_at: Some(Some(registration.expiration)),
            ..Default::default()
        };
        self.creds.update(user_id, patch).await?;
        info!(
            "Registered webhook for user {user_id}, history id {}, expires {}",
            registration.history_id, registration.expiration
        );
        Ok(())
    }

    /// Stop the push subscription and clear persisted webhook state.
    pub async fn stop(&self, user_id: Uuid) -> Result<(), SyncError> {
        let session = self.connector.connect(user_id).await?;
        session.stop_watch().await?;
        self.connector
            .persist_if_rotated(user_id, session.as_ref())
            .await;

        let patch = CredentialPatch {
            webhook_history_id: Some(None),
            webhook_expires_at: Some(None),
            ..Default::default()
        };
        self.creds.update(user_id, patch).await?;
        info!("Stopped webhook for user {user_id}");
        Ok(())
    }

    /// Re-register the subscription. The stop is best-effort; the
    /// subscription may already have lapsed server-side.
    pub async fn renew(&self, user_id: Uuid) -> Result<(), SyncError> {
        let session = self.connector.connect(user_id).await?;
        if let Err(e) = session.stop_watch().await {
            warn!("Stop before renewal failed for user {user_id}: {e}");
        }
        self.register(user_id).await
    }

    /// Renew every subscription expiring within the lookahead window.
    /// Runs sequentially with a small delay between users to stay under
    /// provider rate limits. Returns the number renewed.
    pub async fn renew_all_expiring(&self) -> Result<usize, SyncError> {
        let cutoff = Utc::now() + Duration::hours(self.lookahead_hours);
        let users = self.creds.expiring_webhooks(cutoff).await?;
        info!("{} webhook subscriptions due for renewal", users.len());

        let mut renewed = 0;
        for user_id in users {
            match self.renew(user_id).await {
                Ok(()) => renewed += 1,
                Err(e) => warn!("Webhook renewal failed for user {user_id}: {e}"),
            }
            tokio::time::sleep(std::time::Duration::from_millis(self.renew_delay_ms)).await;
        }
        Ok(renewed)
    }

    /// Decode an inbound push notification, resolve its mailbox to a
    /// user and decide whether it warrants a sync. The accepted history
    /// id is persisted so redelivered notifications dedup.
    pub async fn process_notification(
        &self,
        notification: &PushNotification,
    ) -> Result<NotificationOutcome, SyncError> {
        let decoded = STANDARD
            .decode(&notification.message.data)
            .map_err(|e| SyncError::InvalidNotification(format!("bad base64 payload: {e}")))?;
        let payload: NotificationPayload = serde_json::from_slice(&decoded)
            .map_err(|e| SyncError::InvalidNotification(format!("bad payload json: {e}")))?;
        let history_id = payload.history_id.value()?;

        let user_id = self
            .creds
            .find_user_by_address(&payload.email_address.to_lowercase())
            .await?;
        let Some(user_id) = user_id else {
            warn!(
                "Notification for unknown mailbox {}",
                payload.email_address
            );
            return Ok(NotificationOutcome {
                user_id: None,
                history_id,
                already_processed: false,
                should_sync: false,
            });
        };

        let credential = self
            .creds
            .get(user_id)
            .await?
            .ok_or_else(|| SyncError::InvalidNotification("credential row gone".to_string()))?;

        if let Some(stored) = credential.webhook_history_id {
            if history_id <= stored {
                return Ok(NotificationOutcome {
                    user_id: Some(user_id),
                    history_id,
                    already_processed: true,
                    should_sync: false,
                });
            }
        }

        let patch = CredentialPatch {
            webhook_history_id: Some(Some(history_id)),
            ..Default::default()
        };
        self.creds.update(user_id, patch).await?;

        Ok(NotificationOutcome {
            user_id: Some(user_id),
            history_id,
            already_processed: false,
            should_sync: true,
        })
    }
}
