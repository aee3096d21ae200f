//! Mailbox-to-CRM synchronization engine.
//!
//! Connects a user's Gmail inbox to the CRM: OAuth token lifecycle,
//! partial-failure-tolerant batch fetching, mapping provider messages
//! into canonical thread and message records, resolving senders into
//! contacts and brands, and keeping push-notification subscriptions
//! alive. Persistence sits behind the [`store`] traits; callers inject
//! whichever backend they run on.

pub mod classify;
pub mod config;
pub mod crm;
pub mod error;
pub mod fetch;
pub mod gmail;
pub mod mapper;
pub mod models;
pub mod store;
pub mod sync;
pub mod token;
pub mod webhook;

pub use classify::{AuditLog, Classification, LogAudit, MessageClassifier, NoopClassifier};
pub use config::{GoogleConfig, SyncConfig};
pub use crm::CrmResolver;
pub use error::{ProviderError, SyncError};
pub use fetch::{FetchBatch, MessageFetcher};
pub use gmail::{GmailClient, MailboxSession, TokenState, WatchRegistration};
pub use mapper::{map_message, MapError, MappedMessage};
pub use models::{LinkResult, SyncStats};
pub use store::{CredentialStore, StoreError, SyncStore};
pub use sync::SyncOrchestrator;
pub use token::{MailboxConnector, TokenManager};
pub use webhook::{NotificationOutcome, PushNotification, WebhookManager};
