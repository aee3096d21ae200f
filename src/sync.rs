//! Per-user sync orchestration.
//!
//! One invocation connects, fetches a bounded batch of recent messages,
//! and processes each independently: a problem with one message is a
//! counter bump, never an abort. Only connection-level failures (no
//! credential, listing failed) escape to the caller, after being stamped
//! onto the credential's sync-health fields.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::json;
use uuid::Uuid;

use crate::classify::MessageClassifier;
use crate::config::SyncConfig;
use crate::crm::CrmResolver;
use crate::error::SyncError;
use crate::fetch::MessageFetcher;
use crate::mapper::map_message;
use crate::models::{CredentialPatch, SyncStats};
use crate::store::{CredentialStore, SyncStore};
use crate::token::MailboxConnector;

pub struct SyncOrchestrator {
    connector: Arc<dyn MailboxConnector>,
    creds: Arc<dyn CredentialStore>,
    store: Arc<dyn SyncStore>,
    resolver: CrmResolver,
    classifier: Arc<dyn MessageClassifier>,
    fetcher: MessageFetcher,
    dup_query_chunk: usize,
}

impl SyncOrchestrator {
    pub fn new(
        connector: Arc<dyn MailboxConnector>,
        creds: Arc<dyn CredentialStore>,
        store: Arc<dyn SyncStore>,
        resolver: CrmResolver,
        classifier: Arc<dyn MessageClassifier>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            connector,
            creds,
            store,
            resolver,
            classifier,
            fetcher: MessageFetcher::new(config),
            dup_query_chunk: config.dup_query_chunk,
        }
    }

    /// Run one sync for the user. Fatal failures are recorded on the
    /// credential before propagating so operators can see why a mailbox
    /// stopped syncing.
    pub async fn sync_user(&self, user_id: Uuid) -> Result<SyncStats, SyncError> {
        info!("Starting mailbox sync for user {user_id}");
        match self.run_sync(user_id).await {
            Ok(stats) => {
                info!(
                    "Sync complete for user {user_id}: {} imported, {} skipped, {} failed, {} dropped",
                    stats.imported, stats.skipped, stats.failed, stats.dropped
                );
                Ok(stats)
            }
            Err(e) => {
                error!("Sync failed for user {user_id}: {e}");
                self.connector.record_error(user_id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn run_sync(&self, user_id: Uuid) -> Result<SyncStats, SyncError> {
        let session = self.connector.connect(user_id).await?;
        let batch = self.fetcher.fetch_recent(session.as_ref()).await?;
        self.connector
            .persist_if_rotated(user_id, session.as_ref())
            .await;

        let mut stats = SyncStats {
            dropped: batch.dropped,
            ..Default::default()
        };

        // Cheap pre-check to skip already-imported messages without
        // paying the insert path. Advisory only; the unique constraint
        // on the provider message id is the real gate.
        let ids: Vec<String> = batch.messages.iter().filter_map(|m| m.id.clone()).collect();
        let mut known = std::collections::HashSet::new();
        for chunk in ids.chunks(self.dup_query_chunk.max(1)) {
            match self.store.known_provider_ids(chunk).await {
                Ok(found) => known.extend(found),
                Err(e) => warn!("Duplicate pre-check failed, inserting blind: {e}"),
            }
        }

        for raw in &batch.messages {
            let provider_id = raw.id.as_deref().unwrap_or("<no id>");
            if known.contains(provider_id) {
                stats.skipped += 1;
                continue;
            }

            let mapped = match map_message(raw) {
                Ok(m) => m,
                Err(e) => {
                    warn!("Skipping malformed message {provider_id}: {e}");
                    stats.failed += 1;
                    continue;
                }
            };

            let message = match self
                .store
                .insert_message(user_id, mapped.thread, mapped.message)
                .await
            {
                Ok(m) => m,
                Err(e) if e.is_duplicate_conflict() => {
                    // A concurrent sync inserted it between the pre-check
                    // and here.
                    debug!("Message {provider_id} already imported");
                    stats.skipped += 1;
                    continue;
                }
                Err(e) => {
                    error!("Failed to persist message {provider_id}: {e}");
                    stats.failed += 1;
                    continue;
                }
            };

            let link = self.resolver.link_message(&message).await;
            if link.contact_created {
                stats.contacts_created += 1;
            }
            if link.brand_created {
                stats.brands_created += 1;
            }
            if link.error.is_some() {
                stats.link_errors += 1;
            }

            let subject = message.subject.as_deref().unwrap_or_default();
            let classification =
                self.classifier
                    .classify(&message.body, subject, &message.from_addr);
            let output = json!({
                "category": classification.category,
                "urgency": classification.urgency,
            });
            if let Err(e) = self
                .store
                .set_classification(message.id, &classification.category, output)
                .await
            {
                warn!("Failed to store classification for message {}: {e}", message.id);
                stats.link_errors += 1;
            }

            stats.imported += 1;
        }

        let patch = CredentialPatch {
            last_synced_at: Some(Utc::now()),
            last_error: Some(None),
            last_error_at: Some(None),
            ..Default::default()
        };
        if let Err(e) = self.creds.update(user_id, patch).await {
            warn!("Failed to stamp last_synced_at for user {user_id}: {e}");
        }

        Ok(stats)
    }
}
