use std::env;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Google OAuth application settings plus endpoint overrides. The URL
/// fields exist so tests can point the client at a local mock server.
#[derive(Debug, Clone)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: String,
    pub api_base_url: String,
    pub token_url: String,
    /// Pub/Sub topic that receives push notifications.
    pub pubsub_topic: String,
}

impl GoogleConfig {
    pub fn from_env() -> Self {
        Self {
            client_id: env_or("GOOGLE_OAUTH_CLIENT_ID", "test-client"),
            client_secret: env_or("GOOGLE_OAUTH_CLIENT_SECRET", "test-secret"),
            api_base_url: env_or(
                "GMAIL_API_BASE_URL",
                "https://gmail.googleapis.com/gmail/v1",
            ),
            token_url: env_or("GOOGLE_TOKEN_URL", "https://oauth2.googleapis.com/token"),
            pubsub_topic: env_or(
                "GMAIL_PUBSUB_TOPIC",
                "projects/unset-project/topics/gmail-notifications",
            ),
        }
    }
}

/// Tunables for the sync pipeline and webhook lifecycle.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Upper bound on listed messages per sync pass.
    pub page_size: u32,
    /// Listing window in days.
    pub lookback_days: i64,
    /// Chunk size for the bulk duplicate pre-check.
    pub dup_query_chunk: usize,
    /// Webhook renewal lookahead window in hours.
    pub webhook_lookahead_hours: i64,
    /// Inter-call delay during the renewal sweep, in milliseconds.
    pub renew_delay_ms: u64,
    /// Bound on error text written back to credential rows.
    pub max_error_len: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            lookback_days: 30,
            dup_query_chunk: 50,
            webhook_lookahead_hours: 24,
            renew_delay_ms: 500,
            max_error_len: 500,
        }
    }
}
