use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Per-user OAuth credential plus sync-health bookkeeping.
///
/// Owned by the account-management layer; this subsystem only mutates
/// token fields (on refresh), error fields and webhook state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub user_id: Uuid,
    /// Mailbox address, used to resolve incoming push notifications.
    pub email: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    pub token_type: Option<String>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub webhook_history_id: Option<u64>,
    pub webhook_expires_at: Option<DateTime<Utc>>,
}

/// Partial update for a [`Credential`]. `None` leaves a field untouched;
/// for clearable fields `Some(None)` writes NULL.
#[derive(Debug, Clone, Default)]
pub struct CredentialPatch {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<Option<String>>,
    pub last_error_at: Option<Option<DateTime<Utc>>>,
    pub webhook_history_id: Option<Option<u64>>,
    pub webhook_expires_at: Option<Option<DateTime<Utc>>>,
}

/// Aggregate record for one provider conversation. Exactly one row per
/// (user, provider thread id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider_thread_id: String,
    pub subject: String,
    pub snippet: String,
    pub last_message_at: DateTime<Utc>,
    pub sender: Option<String>,
    pub is_read: bool,
    pub participants: Vec<String>,
}

/// Upsert input for a [`Thread`], produced by the mapper.
#[derive(Debug, Clone)]
pub struct ThreadPatch {
    pub provider_thread_id: String,
    pub subject: String,
    pub snippet: String,
    pub last_message_at: DateTime<Utc>,
    pub sender: Option<String>,
    pub is_read: bool,
    pub participants: Vec<String>,
}

/// Canonical per-message record. The provider message id is the
/// idempotency key: globally unique, re-processing updates rather than
/// duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Parent [`Thread`] row.
    pub thread_ref: Uuid,
    pub platform: String,
    pub provider_message_id: String,
    pub provider_thread_id: String,
    pub subject: Option<String>,
    pub from_addr: String,
    pub to_addr: String,
    pub received_at: DateTime<Utc>,
    pub body: String,
    pub snippet: String,
    pub is_read: bool,
    pub categories: Vec<String>,
    pub metadata: Value,
}

/// Insert input for an [`InboundMessage`]; row id and thread reference
/// are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewInboundMessage {
    pub platform: String,
    pub provider_message_id: String,
    pub provider_thread_id: String,
    pub subject: Option<String>,
    pub from_addr: String,
    pub to_addr: String,
    pub received_at: DateTime<Utc>,
    pub body: String,
    pub snippet: String,
    pub is_read: bool,
    pub metadata: Value,
}

/// CRM contact, unique per case-normalized email address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmContact {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub brand_id: Option<Uuid>,
    pub primary_contact: bool,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCrmContact {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub notes: Option<String>,
}

/// Timestamped entry in a brand's append-only activity log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub at: DateTime<Utc>,
    pub label: String,
}

/// CRM brand, unique per name. The reserved "Personal Contacts" brand
/// collects contacts from free-email-provider domains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmBrand {
    pub id: Uuid,
    pub name: String,
    pub website: Option<String>,
    pub industry: String,
    pub status: String,
    pub notes: Option<String>,
    pub activity: Vec<ActivityEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCrmBrand {
    pub name: String,
    pub website: Option<String>,
    pub industry: String,
    pub status: String,
    pub notes: Option<String>,
    pub activity: Vec<ActivityEntry>,
}

/// Outcome of one CRM resolution call. Never persisted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkResult {
    pub contact_id: Option<Uuid>,
    pub brand_id: Option<Uuid>,
    pub contact_created: bool,
    pub brand_created: bool,
    pub error: Option<String>,
}

/// Aggregate counters for one sync invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub imported: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Messages listed but dropped because full retrieval failed.
    pub dropped: usize,
    pub contacts_created: usize,
    pub brands_created: usize,
    pub link_errors: usize,
}
