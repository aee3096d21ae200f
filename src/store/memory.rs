//! In-memory store used by tests and local development. Unique
//! constraints mirror the relational schema: provider message id,
//! (user, provider thread id), contact email, brand name.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{CredentialStore, StoreError, SyncStore};
use crate::models::{
    Credential, CredentialPatch, CrmBrand, CrmContact, InboundMessage, NewCrmBrand, NewCrmContact,
    NewInboundMessage, Thread, ThreadPatch,
};

#[derive(Default)]
struct Inner {
    credentials: HashMap<Uuid, Credential>,
    threads: HashMap<(Uuid, String), Thread>,
    /// Keyed by provider message id, the global idempotency key.
    messages: HashMap<String, InboundMessage>,
    /// Keyed by normalized email.
    contacts: HashMap<String, CrmContact>,
    /// Keyed by brand name.
    brands: HashMap<String, CrmBrand>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_credential(&self, cred: Credential) {
        let mut inner = self.inner.write().await;
        inner.credentials.insert(cred.user_id, cred);
    }

    pub async fn credential(&self, user_id: Uuid) -> Option<Credential> {
        self.inner.read().await.credentials.get(&user_id).cloned()
    }

    pub async fn message_by_provider_id(&self, provider_id: &str) -> Option<InboundMessage> {
        self.inner.read().await.messages.get(provider_id).cloned()
    }

    pub async fn thread(&self, user_id: Uuid, provider_thread_id: &str) -> Option<Thread> {
        self.inner
            .read()
            .await
            .threads
            .get(&(user_id, provider_thread_id.to_string()))
            .cloned()
    }

    pub async fn contact(&self, email: &str) -> Option<CrmContact> {
        self.inner.read().await.contacts.get(email).cloned()
    }

    pub async fn brand(&self, name: &str) -> Option<CrmBrand> {
        self.inner.read().await.brands.get(name).cloned()
    }

    pub async fn brand_count(&self) -> usize {
        self.inner.read().await.brands.len()
    }

    pub async fn contact_count(&self) -> usize {
        self.inner.read().await.contacts.len()
    }

    pub async fn message_count(&self) -> usize {
        self.inner.read().await.messages.len()
    }
}

fn apply_patch(cred: &mut Credential, patch: CredentialPatch) {
    if let Some(v) = patch.access_token {
        cred.access_token = Some(v);
    }
    if let Some(v) = patch.refresh_token {
        cred.refresh_token = Some(v);
    }
    if let Some(v) = patch.expires_at {
        cred.expires_at = Some(v);
    }
    if let Some(v) = patch.scope {
        cred.scope = Some(v);
    }
    if let Some(v) = patch.last_synced_at {
        cred.last_synced_at = Some(v);
    }
    if let Some(v) = patch.last_error {
        cred.last_error = v;
    }
    if let Some(v) = patch.last_error_at {
        cred.last_error_at = v;
    }
    if let Some(v) = patch.webhook_history_id {
        cred.webhook_history_id = v;
    }
    if let Some(v) = patch.webhook_expires_at {
        cred.webhook_expires_at = v;
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(&self, user_id: Uuid) -> Result<Option<Credential>, StoreError> {
        Ok(self.inner.read().await.credentials.get(&user_id).cloned())
    }

    async fn update(&self, user_id: Uuid, patch: CredentialPatch) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let cred = inner
            .credentials
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::NotFound(format!("credential for user {user_id}")))?;
        apply_patch(cred, patch);
        Ok(())
    }

    async fn find_user_by_address(&self, email: &str) -> Result<Option<Uuid>, StoreError> {
        let needle = email.to_lowercase();
        Ok(self
            .inner
            .read()
            .await
            .credentials
            .values()
            .find(|c| c.email.to_lowercase() == needle)
            .map(|c| c.user_id))
    }

    async fn expiring_webhooks(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .credentials
            .values()
            .filter(|c| c.webhook_expires_at.map(|e| e <= cutoff).unwrap_or(false))
            .map(|c| c.user_id)
            .collect())
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn known_provider_ids(&self, ids: &[String]) -> Result<HashSet<String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .filter(|id| inner.messages.contains_key(*id))
            .cloned()
            .collect())
    }

    async fn insert_message(
        &self,
        user_id: Uuid,
        thread: ThreadPatch,
        message: NewInboundMessage,
    ) -> Result<InboundMessage, StoreError> {
        let mut inner = self.inner.write().await;

        // Reject the whole transaction before touching the thread, so a
        // duplicate message never leaves a half-updated aggregate behind.
        if inner.messages.contains_key(&message.provider_message_id) {
            return Err(StoreError::UniqueViolation(format!(
                "inbound_messages.provider_message_id = {}",
                message.provider_message_id
            )));
        }

        let key = (user_id, thread.provider_thread_id.clone());
        let thread_ref = match inner.threads.get_mut(&key) {
            Some(existing) => {
                existing.subject = thread.subject;
                existing.snippet = thread.snippet;
                existing.last_message_at = thread.last_message_at;
                existing.sender = thread.sender;
                existing.is_read = thread.is_read;
                for p in thread.participants {
                    if !existing.participants.contains(&p) {
                        existing.participants.push(p);
                    }
                }
                existing.id
            }
            None => {
                let row = Thread {
                    id: Uuid::new_v4(),
                    user_id,
                    provider_thread_id: thread.provider_thread_id,
                    subject: thread.subject,
                    snippet: thread.snippet,
                    last_message_at: thread.last_message_at,
                    sender: thread.sender,
                    is_read: thread.is_read,
                    participants: thread.participants,
                };
                let id = row.id;
                inner.threads.insert(key, row);
                id
            }
        };

        let row = InboundMessage {
            id: Uuid::new_v4(),
            user_id,
            thread_ref,
            platform: message.platform,
            provider_message_id: message.provider_message_id.clone(),
            provider_thread_id: message.provider_thread_id,
            subject: message.subject,
            from_addr: message.from_addr,
            to_addr: message.to_addr,
            received_at: message.received_at,
            body: message.body,
            snippet: message.snippet,
            is_read: message.is_read,
            categories: Vec::new(),
            metadata: message.metadata,
        };
        inner
            .messages
            .insert(message.provider_message_id, row.clone());
        Ok(row)
    }

    async fn set_classification(
        &self,
        message_id: Uuid,
        category: &str,
        output: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let msg = inner
            .messages
            .values_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        if !msg.categories.iter().any(|c| c == category) {
            msg.categories.push(category.to_string());
        }
        if let Some(map) = msg.metadata.as_object_mut() {
            map.insert("classification".to_string(), output);
        }
        Ok(())
    }

    async fn link_message_to_crm(
        &self,
        message_id: Uuid,
        contact_id: Option<Uuid>,
        brand_id: Option<Uuid>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let msg = inner
            .messages
            .values_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        if let Some(map) = msg.metadata.as_object_mut() {
            map.insert(
                "crm_contact_id".to_string(),
                serde_json::json!(contact_id.map(|i| i.to_string())),
            );
            map.insert(
                "crm_brand_id".to_string(),
                serde_json::json!(brand_id.map(|i| i.to_string())),
            );
            map.insert(
                "linked_at".to_string(),
                serde_json::json!(Utc::now().to_rfc3339()),
            );
        }
        Ok(())
    }

    async fn find_contact_by_email(&self, email: &str) -> Result<Option<CrmContact>, StoreError> {
        Ok(self.inner.read().await.contacts.get(email).cloned())
    }

    async fn insert_contact(&self, contact: NewCrmContact) -> Result<CrmContact, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.contacts.contains_key(&contact.email) {
            return Err(StoreError::UniqueViolation(format!(
                "crm_contacts.email = {}",
                contact.email
            )));
        }
        let now = Utc::now();
        let row = CrmContact {
            id: Uuid::new_v4(),
            email: contact.email.clone(),
            first_name: contact.first_name,
            last_name: contact.last_name,
            brand_id: None,
            primary_contact: false,
            notes: contact.notes,
            created_at: now,
            updated_at: now,
        };
        inner.contacts.insert(contact.email, row.clone());
        Ok(row)
    }

    async fn set_contact_brand(&self, contact_id: Uuid, brand_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let contact = inner
            .contacts
            .values_mut()
            .find(|c| c.id == contact_id)
            .ok_or_else(|| StoreError::NotFound(format!("contact {contact_id}")))?;
        contact.brand_id = Some(brand_id);
        contact.updated_at = Utc::now();
        Ok(())
    }

    async fn find_brand_by_name(&self, name: &str) -> Result<Option<CrmBrand>, StoreError> {
        Ok(self.inner.read().await.brands.get(name).cloned())
    }

    async fn insert_brand(&self, brand: NewCrmBrand) -> Result<CrmBrand, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.brands.contains_key(&brand.name) {
            return Err(StoreError::UniqueViolation(format!(
                "crm_brands.name = {}",
                brand.name
            )));
        }
        let now = Utc::now();
        let row = CrmBrand {
            id: Uuid::new_v4(),
            name: brand.name.clone(),
            website: brand.website,
            industry: brand.industry,
            status: brand.status,
            notes: brand.notes,
            activity: brand.activity,
            created_at: now,
            updated_at: now,
        };
        inner.brands.insert(brand.name, row.clone());
        Ok(row)
    }
}
