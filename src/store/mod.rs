//! Persistence interface consumed by the sync pipeline.
//!
//! Components receive store handles at construction time; nothing in this
//! crate reaches for a global client. Correctness under concurrent syncs
//! rests on the unique constraints the store enforces (provider message
//! id, contact email, brand name) surfacing as
//! [`StoreError::UniqueViolation`].

pub mod memory;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    CredentialPatch, Credential, CrmBrand, CrmContact, InboundMessage, NewCrmBrand, NewCrmContact,
    NewInboundMessage, ThreadPatch,
};

#[derive(Debug, Clone)]
pub enum StoreError {
    /// A unique constraint rejected the write. Concurrent syncs racing to
    /// insert the same row land here; callers reclassify it as a skip or
    /// re-fetch instead of failing.
    UniqueViolation(String),
    NotFound(String),
    Backend(String),
}

impl StoreError {
    /// Single predicate for duplicate-key detection so callers never
    /// inspect backend error internals.
    pub fn is_duplicate_conflict(&self) -> bool {
        matches!(self, Self::UniqueViolation(_))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UniqueViolation(e) => write!(f, "Unique violation: {e}"),
            Self::NotFound(e) => write!(f, "Not found: {e}"),
            Self::Backend(e) => write!(f, "Backend error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Per-user OAuth credential rows with merge-style partial updates.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, user_id: Uuid) -> Result<Option<Credential>, StoreError>;

    async fn update(&self, user_id: Uuid, patch: CredentialPatch) -> Result<(), StoreError>;

    /// Resolve a mailbox address to its owning user.
    async fn find_user_by_address(&self, email: &str) -> Result<Option<Uuid>, StoreError>;

    /// Users whose webhook subscription expires before `cutoff`.
    async fn expiring_webhooks(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError>;
}

/// Relational store for threads, messages and CRM entities.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Which of `ids` already exist as inbound messages. Callers chunk the
    /// input to respect query-size limits.
    async fn known_provider_ids(&self, ids: &[String]) -> Result<HashSet<String>, StoreError>;

    /// Transactional upsert of the thread aggregate plus insert of the
    /// message row. A duplicate provider message id fails the whole
    /// transaction with [`StoreError::UniqueViolation`].
    async fn insert_message(
        &self,
        user_id: Uuid,
        thread: ThreadPatch,
        message: NewInboundMessage,
    ) -> Result<InboundMessage, StoreError>;

    /// Record classifier output: append the category and merge the raw
    /// output into message metadata.
    async fn set_classification(
        &self,
        message_id: Uuid,
        category: &str,
        output: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Stamp resolved CRM references into message metadata.
    async fn link_message_to_crm(
        &self,
        message_id: Uuid,
        contact_id: Option<Uuid>,
        brand_id: Option<Uuid>,
    ) -> Result<(), StoreError>;

    async fn find_contact_by_email(&self, email: &str) -> Result<Option<CrmContact>, StoreError>;

    async fn insert_contact(&self, contact: NewCrmContact) -> Result<CrmContact, StoreError>;

    async fn set_contact_brand(&self, contact_id: Uuid, brand_id: Uuid) -> Result<(), StoreError>;

    async fn find_brand_by_name(&self, name: &str) -> Result<Option<CrmBrand>, StoreError>;

    async fn insert_brand(&self, brand: NewCrmBrand) -> Result<CrmBrand, StoreError>;
}
