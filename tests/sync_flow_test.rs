//! End-to-end sync pipeline tests over fake mailbox sessions and the
//! in-memory store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{Duration, Utc};
use uuid::Uuid;

use mailsync::gmail::{
    MailboxSession, MessageHeader, MessagePart, MessageRef, PartBody, RawMessage, TokenState,
    WatchRegistration,
};
use mailsync::models::{Credential, CredentialPatch};
use mailsync::store::memory::MemoryStore;
use mailsync::store::{CredentialStore, StoreError, SyncStore};
use mailsync::{
    CrmResolver, GoogleConfig, LogAudit, MailboxConnector, NoopClassifier, ProviderError,
    SyncConfig, SyncError, SyncOrchestrator, TokenManager, WebhookManager,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn header(name: &str, value: &str) -> MessageHeader {
    MessageHeader {
        name: name.to_string(),
        value: value.to_string(),
    }
}

fn raw_message(id: &str, thread: &str, from: &str, subject: &str, body: &str) -> RawMessage {
    RawMessage {
        id: Some(id.to_string()),
        thread_id: Some(thread.to_string()),
        snippet: Some(body.chars().take(80).collect()),
        internal_date: Some("1755900000000".to_string()),
        label_ids: vec!["INBOX".to_string(), "UNREAD".to_string()],
        payload: Some(MessagePart {
            mime_type: Some("text/plain".to_string()),
            headers: vec![
                header("From", from),
                header("To", "me@example.com"),
                header("Subject", subject),
                header("Date", "Mon, 24 Aug 2026 10:00:00 +0000"),
            ],
            body: Some(PartBody {
                data: Some(URL_SAFE.encode(body)),
            }),
            parts: Vec::new(),
        }),
    }
}

/// Canned mailbox session: serves a fixed message set, optionally failing
/// retrieval for chosen ids, with mutable token state to exercise
/// rotation persistence.
struct FakeSession {
    messages: Vec<RawMessage>,
    fail_ids: HashSet<String>,
    tokens: Mutex<TokenState>,
}

impl FakeSession {
    fn new(messages: Vec<RawMessage>) -> Self {
        Self {
            messages,
            fail_ids: HashSet::new(),
            tokens: Mutex::new(TokenState {
                access_token: Some("session-token".to_string()),
                refresh_token: Some("session-refresh".to_string()),
                expires_at: Some(Utc::now() + Duration::hours(1)),
                scope: Some("gmail.readonly".to_string()),
            }),
        }
    }

    fn failing_on(mut self, id: &str) -> Self {
        self.fail_ids.insert(id.to_string());
        self
    }

    fn rotate_access_token(&self, token: &str) {
        self.tokens.lock().unwrap().access_token = Some(token.to_string());
    }
}

#[async_trait]
impl MailboxSession for FakeSession {
    async fn list_messages(
        &self,
        _query: &str,
        max_results: u32,
    ) -> Result<Vec<MessageRef>, ProviderError> {
        Ok(self
            .messages
            .iter()
            .take(max_results as usize)
            .map(|m| MessageRef {
                id: m.id.clone().unwrap_or_default(),
                thread_id: m.thread_id.clone(),
            })
            .collect())
    }

    async fn get_message(&self, id: &str) -> Result<RawMessage, ProviderError> {
        if self.fail_ids.contains(id) {
            return Err(ProviderError::NetworkError("connection reset".to_string()));
        }
        self.messages
            .iter()
            .find(|m| m.id.as_deref() == Some(id))
            .cloned()
            .ok_or_else(|| ProviderError::ApiError {
                status: 404,
                message: format!("message {id} not found"),
            })
    }

    async fn watch(
        &self,
        _topic: &str,
        _label_ids: &[String],
    ) -> Result<WatchRegistration, ProviderError> {
        Ok(WatchRegistration {
            history_id: 42,
            expiration: Utc::now() + Duration::days(7),
        })
    }

    async fn stop_watch(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    fn token_state(&self) -> TokenState {
        self.tokens.lock().unwrap().clone()
    }
}

/// Hands out the fake session; token persistence and error recording go
/// through the real manager.
struct FakeConnector {
    session: Arc<FakeSession>,
    tokens: TokenManager,
}

impl FakeConnector {
    fn new(session: Arc<FakeSession>, store: Arc<MemoryStore>) -> Self {
        Self {
            session,
            tokens: TokenManager::new(store, GoogleConfig::from_env(), &SyncConfig::default()),
        }
    }
}

#[async_trait]
impl MailboxConnector for FakeConnector {
    async fn connect(&self, _user_id: Uuid) -> Result<Arc<dyn MailboxSession>, SyncError> {
        Ok(self.session.clone())
    }

    async fn persist_if_rotated(&self, user_id: Uuid, session: &dyn MailboxSession) {
        self.tokens.persist_if_rotated(user_id, session).await;
    }

    async fn record_error(&self, user_id: Uuid, error: &str) {
        self.tokens.record_error(user_id, error).await;
    }
}

fn credential(user_id: Uuid) -> Credential {
    Credential {
        user_id,
        email: "me@example.com".to_string(),
        access_token: Some("session-token".to_string()),
        refresh_token: Some("session-refresh".to_string()),
        expires_at: Some(Utc::now() + Duration::hours(1)),
        scope: Some("gmail.readonly".to_string()),
        token_type: Some("Bearer".to_string()),
        last_error: None,
        last_error_at: None,
        last_synced_at: None,
        webhook_history_id: None,
        webhook_expires_at: None,
    }
}

fn orchestrator(session: Arc<FakeSession>, store: Arc<MemoryStore>) -> SyncOrchestrator {
    let resolver = CrmResolver::new(store.clone(), Arc::new(LogAudit));
    SyncOrchestrator::new(
        Arc::new(FakeConnector::new(session, store.clone())),
        store.clone(),
        store,
        resolver,
        Arc::new(NoopClassifier),
        &SyncConfig::default(),
    )
}

#[tokio::test]
async fn full_sync_imports_and_reruns_are_idempotent() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let user = Uuid::new_v4();
    store.put_credential(credential(user)).await;

    let session = Arc::new(FakeSession::new(vec![
        raw_message("m1", "t1", "Jane Doe <jane@acme.com>", "Order", "Order inquiry"),
        raw_message("m2", "t1", "Jane Doe <jane@acme.com>", "Re: Order", "Following up"),
        raw_message("m3", "t2", "pal@gmail.com", "Hi", "Personal note"),
    ]));
    let sync = orchestrator(session.clone(), store.clone());

    let first = sync.sync_user(user).await.unwrap();
    assert_eq!(first.imported, 3);
    assert_eq!(first.failed, 0);
    assert_eq!(first.dropped, 0);
    assert_eq!(first.contacts_created, 2);
    assert_eq!(first.brands_created, 1);
    assert_eq!(first.link_errors, 0);

    // Both acme messages share one thread row.
    let m1 = store.message_by_provider_id("m1").await.unwrap();
    let m2 = store.message_by_provider_id("m2").await.unwrap();
    assert_eq!(m1.thread_ref, m2.thread_ref);

    // Classification ran and was written back.
    assert!(m1.categories.contains(&"other".to_string()));
    assert!(m1.metadata.get("classification").is_some());
    assert!(m1.metadata.get("crm_contact_id").is_some());

    // Sender resolution: corporate brand plus the personal bucket.
    assert!(store.brand("Acme").await.is_some());
    assert!(store.brand("Gmail").await.is_none());
    assert!(store.brand("Personal Contacts").await.is_some());

    assert!(store.credential(user).await.unwrap().last_synced_at.is_some());

    let second = sync.sync_user(user).await.unwrap();
    assert_eq!(second.imported, 0);
    assert_eq!(second.skipped, 3);
    assert_eq!(second.contacts_created, 0);
    assert_eq!(store.message_count().await, 3);
}

#[tokio::test]
async fn retrieval_failure_drops_only_that_message() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let user = Uuid::new_v4();
    store.put_credential(credential(user)).await;

    let session = Arc::new(
        FakeSession::new(vec![
            raw_message("m1", "t1", "a@acme.com", "One", "First"),
            raw_message("m2", "t2", "b@acme.com", "Two", "Second"),
            raw_message("m3", "t3", "c@acme.com", "Three", "Third"),
        ])
        .failing_on("m2"),
    );
    let stats = orchestrator(session, store.clone())
        .sync_user(user)
        .await
        .unwrap();

    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.imported, 2);
    assert!(store.message_by_provider_id("m2").await.is_none());
}

#[tokio::test]
async fn message_without_thread_id_counts_as_failed() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let user = Uuid::new_v4();
    store.put_credential(credential(user)).await;

    let mut broken = raw_message("m1", "t1", "a@acme.com", "One", "First");
    broken.thread_id = None;
    let session = Arc::new(FakeSession::new(vec![broken]));

    let stats = orchestrator(session, store.clone())
        .sync_user(user)
        .await
        .unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.imported, 0);
    assert_eq!(store.message_count().await, 0);
}

#[tokio::test]
async fn link_failure_does_not_block_the_import() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let user = Uuid::new_v4();
    store.put_credential(credential(user)).await;

    // Message arrives with no From header; the mapper substitutes a
    // placeholder that CRM resolution refuses to turn into a contact.
    let mut nameless = raw_message("m1", "t1", "x", "One", "First");
    nameless.payload.as_mut().unwrap().headers.retain(|h| h.name != "From");
    let session = Arc::new(FakeSession::new(vec![nameless]));

    let stats = orchestrator(session, store.clone())
        .sync_user(user)
        .await
        .unwrap();
    assert_eq!(stats.imported, 1);
    assert_eq!(stats.link_errors, 1);
    assert_eq!(stats.contacts_created, 0);
    assert!(store.message_by_provider_id("m1").await.is_some());
}

/// Pretends another sync created the contact between the lookup and the
/// insert: the first lookup misses, the insert conflicts, the re-fetch
/// finds the winner's row.
struct RacingStore {
    inner: Arc<MemoryStore>,
    lookups: AtomicUsize,
}

#[async_trait]
impl SyncStore for RacingStore {
    async fn known_provider_ids(&self, ids: &[String]) -> Result<HashSet<String>, StoreError> {
        self.inner.known_provider_ids(ids).await
    }

    async fn insert_message(
        &self,
        user_id: Uuid,
        thread: mailsync::models::ThreadPatch,
        message: mailsync::models::NewInboundMessage,
    ) -> Result<mailsync::models::InboundMessage, StoreError> {
        self.inner.insert_message(user_id, thread, message).await
    }

    async fn set_classification(
        &self,
        message_id: Uuid,
        category: &str,
        output: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.inner.set_classification(message_id, category, output).await
    }

    async fn link_message_to_crm(
        &self,
        message_id: Uuid,
        contact_id: Option<Uuid>,
        brand_id: Option<Uuid>,
    ) -> Result<(), StoreError> {
        self.inner.link_message_to_crm(message_id, contact_id, brand_id).await
    }

    async fn find_contact_by_email(
        &self,
        email: &str,
    ) -> Result<Option<mailsync::models::CrmContact>, StoreError> {
        if self.lookups.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(None);
        }
        self.inner.find_contact_by_email(email).await
    }

    async fn insert_contact(
        &self,
        contact: mailsync::models::NewCrmContact,
    ) -> Result<mailsync::models::CrmContact, StoreError> {
        self.inner.insert_contact(contact).await
    }

    async fn set_contact_brand(&self, contact_id: Uuid, brand_id: Uuid) -> Result<(), StoreError> {
        self.inner.set_contact_brand(contact_id, brand_id).await
    }

    async fn find_brand_by_name(
        &self,
        name: &str,
    ) -> Result<Option<mailsync::models::CrmBrand>, StoreError> {
        self.inner.find_brand_by_name(name).await
    }

    async fn insert_brand(
        &self,
        brand: mailsync::models::NewCrmBrand,
    ) -> Result<mailsync::models::CrmBrand, StoreError> {
        self.inner.insert_brand(brand).await
    }
}

#[tokio::test]
async fn contact_insert_race_resolves_to_the_winning_row() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let user = Uuid::new_v4();

    // Pre-seed the winner's contact row.
    let existing = store
        .insert_contact(mailsync::models::NewCrmContact {
            email: "jane@acme.com".to_string(),
            first_name: "Jane".to_string(),
            last_name: "Doe".to_string(),
            notes: None,
        })
        .await
        .unwrap();

    let message = store
        .insert_message(
            user,
            mailsync::models::ThreadPatch {
                provider_thread_id: "t1".to_string(),
                subject: "Hello".to_string(),
                snippet: "Hello".to_string(),
                last_message_at: Utc::now(),
                sender: Some("jane@acme.com".to_string()),
                is_read: false,
                participants: vec!["jane@acme.com".to_string()],
            },
            mailsync::models::NewInboundMessage {
                platform: "gmail".to_string(),
                provider_message_id: "m1".to_string(),
                provider_thread_id: "t1".to_string(),
                subject: Some("Hello".to_string()),
                from_addr: "Jane Doe <jane@acme.com>".to_string(),
                to_addr: "me@example.com".to_string(),
                received_at: Utc::now(),
                body: "Hello".to_string(),
                snippet: "Hello".to_string(),
                is_read: false,
                metadata: serde_json::json!({}),
            },
        )
        .await
        .unwrap();

    let racing = Arc::new(RacingStore {
        inner: store.clone(),
        lookups: AtomicUsize::new(0),
    });
    let resolver = CrmResolver::new(racing, Arc::new(LogAudit));
    let result = resolver.link_message(&message).await;

    assert!(result.error.is_none());
    assert!(!result.contact_created);
    assert_eq!(result.contact_id, Some(existing.id));
    assert_eq!(store.contact_count().await, 1);
}

#[tokio::test]
async fn rotated_session_tokens_are_persisted() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let user = Uuid::new_v4();
    let mut cred = credential(user);
    cred.last_error = Some("previous failure".to_string());
    cred.last_error_at = Some(Utc::now());
    store.put_credential(cred).await;

    let session = Arc::new(FakeSession::new(Vec::new()));
    session.rotate_access_token("fresh-token");

    let connector = FakeConnector::new(session.clone(), store.clone());
    connector.persist_if_rotated(user, session.as_ref()).await;

    let stored = store.credential(user).await.unwrap();
    assert_eq!(stored.access_token.as_deref(), Some("fresh-token"));
    assert_eq!(stored.refresh_token.as_deref(), Some("session-refresh"));
    assert_eq!(stored.last_error, None);
    assert_eq!(stored.last_error_at, None);
}

#[tokio::test]
async fn fatal_sync_failure_is_recorded_on_the_credential() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let user = Uuid::new_v4();
    store.put_credential(credential(user)).await;

    struct BrokenSession;
    #[async_trait]
    impl MailboxSession for BrokenSession {
        async fn list_messages(
            &self,
            _query: &str,
            _max_results: u32,
        ) -> Result<Vec<MessageRef>, ProviderError> {
            Err(ProviderError::ApiError {
                status: 500,
                message: "backend unavailable".to_string(),
            })
        }
        async fn get_message(&self, _id: &str) -> Result<RawMessage, ProviderError> {
            unreachable!()
        }
        async fn watch(
            &self,
            _topic: &str,
            _label_ids: &[String],
        ) -> Result<WatchRegistration, ProviderError> {
            unreachable!()
        }
        async fn stop_watch(&self) -> Result<(), ProviderError> {
            unreachable!()
        }
        fn token_state(&self) -> TokenState {
            TokenState::default()
        }
    }

    struct BrokenConnector {
        tokens: TokenManager,
    }
    #[async_trait]
    impl MailboxConnector for BrokenConnector {
        async fn connect(&self, _user_id: Uuid) -> Result<Arc<dyn MailboxSession>, SyncError> {
            Ok(Arc::new(BrokenSession))
        }
        async fn persist_if_rotated(&self, user_id: Uuid, session: &dyn MailboxSession) {
            self.tokens.persist_if_rotated(user_id, session).await;
        }
        async fn record_error(&self, user_id: Uuid, error: &str) {
            self.tokens.record_error(user_id, error).await;
        }
    }

    let connector = BrokenConnector {
        tokens: TokenManager::new(store.clone(), GoogleConfig::from_env(), &SyncConfig::default()),
    };
    let resolver = CrmResolver::new(store.clone(), Arc::new(LogAudit));
    let sync = SyncOrchestrator::new(
        Arc::new(connector),
        store.clone(),
        store.clone(),
        resolver,
        Arc::new(NoopClassifier),
        &SyncConfig::default(),
    );

    let err = sync.sync_user(user).await.unwrap_err();
    assert!(matches!(err, SyncError::Provider(_)));
    let stored = store.credential(user).await.unwrap();
    assert!(stored.last_error.unwrap().contains("500"));
    assert!(stored.last_error_at.is_some());
}

#[tokio::test]
async fn webhook_register_and_renew_sweep() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let user = Uuid::new_v4();
    store.put_credential(credential(user)).await;

    let session = Arc::new(FakeSession::new(Vec::new()));
    let connector = Arc::new(FakeConnector::new(session, store.clone()));
    let config = SyncConfig {
        renew_delay_ms: 0,
        ..SyncConfig::default()
    };
    let webhooks = WebhookManager::new(
        connector,
        store.clone(),
        &GoogleConfig::from_env(),
        &config,
    );

    webhooks.register(user).await.unwrap();
    let stored = store.credential(user).await.unwrap();
    assert_eq!(stored.webhook_history_id, Some(42));
    assert!(stored.webhook_expires_at.is_some());

    // Pull the expiry inside the lookahead window and sweep.
    store
        .update(
            user,
            CredentialPatch {
                webhook_expires_at: Some(Some(Utc::now() + Duration::hours(1))),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let renewed = webhooks.renew_all_expiring().await.unwrap();
    assert_eq!(renewed, 1);
    let stored = store.credential(user).await.unwrap();
    assert!(stored.webhook_expires_at.unwrap() > Utc::now() + Duration::days(1));
}

#[tokio::test]
async fn webhook_stop_clears_state_and_persists_rotation() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let user = Uuid::new_v4();
    let mut cred = credential(user);
    cred.webhook_history_id = Some(42);
    cred.webhook_expires_at = Some(Utc::now() + Duration::days(7));
    store.put_credential(cred).await;

    let session = Arc::new(FakeSession::new(Vec::new()));
    // A refresh happened during the provider call; stop must not lose it.
    session.rotate_access_token("fresh-token");
    let connector = Arc::new(FakeConnector::new(session, store.clone()));
    let webhooks = WebhookManager::new(
        connector,
        store.clone(),
        &GoogleConfig::from_env(),
        &SyncConfig::default(),
    );

    webhooks.stop(user).await.unwrap();
    let stored = store.credential(user).await.unwrap();
    assert_eq!(stored.webhook_history_id, None);
    assert_eq!(stored.webhook_expires_at, None);
    assert_eq!(stored.access_token.as_deref(), Some("fresh-token"));
}
