//! Batch retrieval of recent inbox messages.
//!
//! Listing is bounded and fatal on failure; full-message retrieval fans
//! out concurrently and tolerates individual failures, returning the
//! successfully fetched subset plus a drop count.

use chrono::{Duration, Utc};
use futures::future::join_all;
use log::{debug, warn};

use crate::config::SyncConfig;
use crate::error::ProviderError;
use crate::gmail::{MailboxSession, RawMessage};

#[derive(Debug, Default)]
pub struct FetchBatch {
    pub messages: Vec<RawMessage>,
    /// Listed ids whose full retrieval failed.
    pub dropped: usize,
}

pub struct MessageFetcher {
    page_size: u32,
    lookback_days: i64,
}

impl MessageFetcher {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            page_size: config.page_size,
            lookback_days: config.lookback_days,
        }
    }

    fn inbox_query(&self) -> String {
        let after = (Utc::now() - Duration::days(self.lookback_days)).timestamp();
        format!("after:{after} -label:spam -label:trash in:inbox")
    }

    /// List recent inbox messages and retrieve their full bodies
    /// concurrently. A listing failure propagates; a single message's
    /// retrieval failure only drops that message.
    pub async fn fetch_recent(
        &self,
        session: &dyn MailboxSession,
    ) -> Result<FetchBatch, ProviderError> {
        let refs = session
            .list_messages(&self.inbox_query(), self.page_size)
            .await?;
        if refs.is_empty() {
            debug!("Inbox listing returned no messages");
            return Ok(FetchBatch::default());
        }

        let fetches = refs.iter().map(|r| session.get_message(&r.id));
        let results = join_all(fetches).await;

        let mut batch = FetchBatch::default();
        for (msg_ref, result) in refs.iter().zip(results) {
            match result {
                Ok(raw) => batch.messages.push(raw),
                Err(e) => {
                    warn!("Dropping message {}: retrieval failed: {e}", msg_ref.id);
                    batch.dropped += 1;
                }
            }
        }
        debug!(
            "Fetched {} of {} listed messages ({} dropped)",
            batch.messages.len(),
            refs.len(),
            batch.dropped
        );
        Ok(batch)
    }
}
