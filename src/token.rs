//! Credential lifecycle: building authenticated sessions and persisting
//! rotated tokens.
//!
//! Rotation is persisted by an explicit post-call hook rather than a
//! hidden refresh listener: after provider calls, the caller hands the
//! session back to [`TokenManager::persist_if_rotated`], which diffs the
//! in-memory token state against a freshly-read credential and writes
//! only what changed. A failed persist never aborts the in-flight work;
//! the caller already holds a working token.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{GoogleConfig, SyncConfig};
use crate::error::SyncError;
use crate::gmail::{GmailClient, MailboxSession, TokenState};
use crate::models::CredentialPatch;
use crate::store::CredentialStore;

/// Produces authenticated mailbox sessions for users. The orchestrator
/// and webhook manager depend on this trait so tests can hand out fake
/// sessions.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    /// Build an authenticated session for the user. Fails with
    /// [`SyncError::NotConnected`] when no usable credential exists.
    async fn connect(&self, user_id: Uuid) -> Result<Arc<dyn MailboxSession>, SyncError>;

    /// Persist any token rotation the session performed. Best-effort.
    async fn persist_if_rotated(&self, user_id: Uuid, session: &dyn MailboxSession);

    /// Write a bounded error text and timestamp to the credential's
    /// sync-health fields. Best-effort.
    async fn record_error(&self, user_id: Uuid, error: &str);
}

pub struct TokenManager {
    creds: Arc<dyn CredentialStore>,
    google: GoogleConfig,
    max_error_len: usize,
}

impl TokenManager {
    pub fn new(creds: Arc<dyn CredentialStore>, google: GoogleConfig, config: &SyncConfig) -> Self {
        Self {
            creds,
            google,
            max_error_len: config.max_error_len,
        }
    }

    fn truncate_error(&self, error: &str) -> String {
        error.chars().take(self.max_error_len).collect()
    }
}

#[async_trait]
impl MailboxConnector for TokenManager {
    async fn connect(&self, user_id: Uuid) -> Result<Arc<dyn MailboxSession>, SyncError> {
        let credential = self
            .creds
            .get(user_id)
            .await
            .map_err(SyncError::Store)?
            .ok_or(SyncError::NotConnected)?;

        if credential.refresh_token.is_none() {
            return Err(SyncError::NotConnected);
        }

        let tokens = TokenState {
            access_token: credential.access_token,
            refresh_token: credential.refresh_token,
            expires_at: credential.expires_at,
            scope: credential.scope,
        };
        Ok(Arc::new(GmailClient::new(self.google.clone(), tokens)))
    }

    async fn persist_if_rotated(&self, user_id: Uuid, session: &dyn MailboxSession) {
        let current = session.token_state();

        // Merge against a fresh read so a concurrent external auth flow
        // is not clobbered with stale fields.
        let stored = match self.creds.get(user_id).await {
            Ok(Some(c)) => c,
            Ok(None) => {
                warn!("Token rotation for user {user_id} dropped: credential row gone");
                return;
            }
            Err(e) => {
                warn!("Token rotation for user {user_id} dropped: credential read failed: {e}");
                return;
            }
        };

        let access_rotated = current.access_token.is_some()
            && current.access_token != stored.access_token;
        let refresh_rotated = current.refresh_token.is_some()
            && current.refresh_token != stored.refresh_token;
        if !access_rotated && !refresh_rotated {
            debug!("No token rotation to persist for user {user_id}");
            return;
        }

        let mut patch = CredentialPatch {
            last_error: Some(None),
            last_error_at: Some(None),
            ..Default::default()
        };
        if access_rotated {
            patch.access_token = current.access_token;
            patch.expires_at = current.expires_at;
            patch.scope = current.scope;
        }
        if refresh_rotated {
            patch.refresh_token = current.refresh_token;
        }

        match self.creds.update(user_id, patch).await {
            Ok(()) => info!("Persisted rotated tokens for user {user_id}"),
            // The in-flight call already has a working token; losing the
            // persist costs one extra refresh on the next sync.
            Err(e) => error!("Failed to persist rotated tokens for user {user_id}: {e}"),
        }
    }

    async fn record_error(&self, user_id: Uuid, error: &str) {
        let patch = CredentialPatch {
            last_error: Some(Some(self.truncate_error(error))),
            last_error_at: Some(Some(Utc::now())),
            ..Default::default()
        };
        if let Err(e) = self.creds.update(user_id, patch).await {
            warn!("Failed to record sync error for user {user_id}: {e}");
        }
    }
}
