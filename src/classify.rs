//! External collaborator seams: the rule-based classifier and the audit
//! trail. Both are consumed through traits; production wiring injects
//! the real implementations once at construction time.

use async_trait::async_trait;
use log::info;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Classifier output for one message.
#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub category: String,
    pub urgency: String,
}

/// Pure classification function over message content.
pub trait MessageClassifier: Send + Sync {
    fn classify(&self, body: &str, subject: &str, from_addr: &str) -> Classification;
}

/// Fallback classifier for wiring without the rule engine: everything is
/// an ordinary low-urgency message.
pub struct NoopClassifier;

impl MessageClassifier for NoopClassifier {
    fn classify(&self, _body: &str, _subject: &str, _from_addr: &str) -> Classification {
        Classification {
            category: "other".to_string(),
            urgency: "low".to_string(),
        }
    }
}

/// Fire-and-forget audit record sink. Implementations must swallow their
/// own failures; callers never check.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(
        &self,
        user_id: Uuid,
        action: &str,
        entity_type: &str,
        entity_id: &str,
        metadata: Value,
    );
}

/// Audit sink that writes to the application log.
pub struct LogAudit;

#[async_trait]
impl AuditLog for LogAudit {
    async fn record(
        &self,
        user_id: Uuid,
        action: &str,
        entity_type: &str,
        entity_id: &str,
        metadata: Value,
    ) {
        info!("audit user={user_id} action={action} {entity_type}={entity_id} meta={metadata}");
    }
}
