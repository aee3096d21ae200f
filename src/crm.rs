//! Sender → CRM entity resolution.
//!
//! Every step is independently recoverable and the whole resolution is
//! fenced: a failure lands in [`LinkResult::error`] and never aborts the
//! surrounding sync. Races with concurrent syncs are absorbed by the
//! find-or-create-then-refetch pattern over the store's unique
//! constraints.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info};
use once_cell::sync::Lazy;
use serde_json::json;

use crate::classify::AuditLog;
use crate::models::{
    ActivityEntry, CrmBrand, CrmContact, InboundMessage, LinkResult, NewCrmBrand, NewCrmContact,
};
use crate::store::{StoreError, SyncStore};

/// Consumer email domains that must never become brands.
static FREE_EMAIL_PROVIDERS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "gmail.com",
        "googlemail.com",
        "outlook.com",
        "hotmail.com",
        "live.com",
        "yahoo.com",
        "icloud.com",
        "me.com",
        "aol.com",
        "protonmail.com",
        "mail.com",
    ])
});

/// Catch-all bucket for free-email-provider senders.
pub const PERSONAL_CONTACTS_BRAND: &str = "Personal Contacts";

/// Split a From header into display name and address. Handles both
/// `"Jane Doe" <jane@acme.com>` and bare addresses.
pub fn parse_from_header(value: &str) -> (Option<String>, Option<String>) {
    if let Ok(list) = mailparse::addrparse(value) {
        for addr in &*list {
            if let mailparse::MailAddr::Single(info) = addr {
                let display = info
                    .display_name
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
                return (display, Some(info.addr.trim().to_string()));
            }
        }
    }
    let trimmed = value.trim();
    if trimmed.contains('@') && !trimmed.contains(' ') {
        return (None, Some(trimmed.to_string()));
    }
    (None, None)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// `john.doe` → `John Doe`; empty when no tokens survive.
fn name_from_local_part(local: &str) -> Option<String> {
    let tokens: Vec<String> = local
        .split(['.', '_', '-'])
        .filter(|t| !t.is_empty())
        .map(capitalize)
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

/// Two-label public suffixes where the registrable name sits one label
/// deeper than usual.
static MULTI_PART_SUFFIXES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "co.uk", "org.uk", "ac.uk", "gov.uk", "com.au", "net.au", "org.au", "co.jp", "ne.jp",
        "or.jp", "co.nz", "co.in", "co.za", "com.br", "com.mx", "com.sg", "com.cn", "com.tr",
    ])
});

/// Registrable label of the domain, capitalized: `sub.acme.co.uk` →
/// `Acme`, `nike.com` → `Nike`. Exact-name matching downstream; no
/// disambiguation across TLDs.
pub fn domain_to_brand_name(domain: &str) -> String {
    let parts: Vec<&str> = domain.split('.').collect();
    let main = if parts.len() >= 3
        && MULTI_PART_SUFFIXES.contains(parts[parts.len() - 2..].join(".").as_str())
    {
        parts[parts.len() - 3]
    } else if parts.len() >= 2 {
        parts[parts.len() - 2]
    } else {
        parts[0]
    };
    capitalize(main)
}

fn split_name(display: &str) -> (String, String) {
    let mut words = display.split_whitespace();
    let first = words.next().unwrap_or_default().to_string();
    let last = words.collect::<Vec<_>>().join(" ");
    (first, last)
}

pub struct CrmResolver {
    store: Arc<dyn SyncStore>,
    audit: Arc<dyn AuditLog>,
}

impl CrmResolver {
    pub fn new(store: Arc<dyn SyncStore>, audit: Arc<dyn AuditLog>) -> Self {
        Self { store, audit }
    }

    /// Resolve the message's sender into a contact and brand, linking
    /// all three. Never fails the caller; problems land in the result.
    pub async fn link_message(&self, message: &InboundMessage) -> LinkResult {
        let mut result = LinkResult::default();
        if let Err(e) = self.try_link(message, &mut result).await {
            error!("CRM link failed for message {}: {e}", message.id);
            result.error = Some(e);
        }
        result
    }

    async fn try_link(
        &self,
        message: &InboundMessage,
        result: &mut LinkResult,
    ) -> Result<(), String> {
        let (display_name, email) = parse_from_header(&message.from_addr);
        let email = email.ok_or_else(|| "Could not parse sender address".to_string())?;
        let normalized = email.to_lowercase();
        let domain = normalized
            .split('@')
            .nth(1)
            .filter(|d| !d.is_empty())
            .ok_or_else(|| "Could not extract domain from sender address".to_string())?
            .to_string();
        let local_part = normalized.split('@').next().unwrap_or_default();

        let display = display_name
            .or_else(|| name_from_local_part(local_part))
            .unwrap_or_else(|| local_part.to_string());
        let (first_name, last_name) = split_name(&display);

        let (contact, contact_created) = self
            .find_or_create_contact(&normalized, first_name, last_name, &message.from_addr)
            .await
            .map_err(|e| e.to_string())?;
        result.contact_id = Some(contact.id);
        if contact_created {
            result.contact_created = true;
            info!("Created contact {} ({})", normalized, contact.id);
            self.audit
                .record(
                    message.user_id,
                    "CONTACT_CREATED_FROM_EMAIL",
                    "CONTACT",
                    &contact.id.to_string(),
                    json!({
                        "email": normalized,
                        "source": "mailbox_import",
                        "inbound_message_id": message.id.to_string(),
                    }),
                )
                .await;
        }

        if FREE_EMAIL_PROVIDERS.contains(domain.as_str()) {
            // Free provider: no derived brand. Park brandless contacts in
            // the singleton personal bucket.
            if contact.brand_id.is_none() {
                let (personal, _) = self
                    .find_or_create_brand(
                        PERSONAL_CONTACTS_BRAND,
                        None,
                        "Auto-created placeholder for personal email contacts",
                        "Auto-created",
                    )
                    .await
                    .map_err(|e| e.to_string())?;
                self.store
                    .set_contact_brand(contact.id, personal.id)
                    .await
                    .map_err(|e| e.to_string())?;
                result.brand_id = Some(personal.id);
            }
        } else {
            let brand_name = domain_to_brand_name(&domain);
            let (brand, brand_created) = self
                .find_or_create_brand(
                    &brand_name,
                    Some(format!("https://{domain}")),
                    &format!("Auto-created from mailbox import: {normalized}"),
                    "Auto-created from mailbox import",
                )
                .await
                .map_err(|e| e.to_string())?;
            result.brand_id = Some(brand.id);
            if brand_created {
                result.brand_created = true;
                info!("Created brand {} ({})", brand_name, brand.id);
                self.audit
                    .record(
                        message.user_id,
                        "BRAND_CREATED_FROM_EMAIL",
                        "BRAND",
                        &brand.id.to_string(),
                        json!({
                            "brand_name": brand_name,
                            "domain": domain,
                            "source": "mailbox_import",
                            "inbound_message_id": message.id.to_string(),
                        }),
                    )
                    .await;
            }

            match contact.brand_id {
                None => {
                    self.store
                        .set_contact_brand(contact.id, brand.id)
                        .await
                        .map_err(|e| e.to_string())?;
                    debug!("Linked contact {} to brand {}", contact.id, brand.id);
                }
                // First writer wins: an established brand assignment is
                // not re-derived from a different domain.
                Some(existing) if existing != brand.id => {
                    debug!(
                        "Contact {} keeps brand {existing}, resolved {} ignored",
                        contact.id, brand.id
                    );
                }
                Some(_) => {}
            }
        }

        self.store
            .link_message_to_crm(message.id, result.contact_id, result.brand_id)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn find_or_create_contact(
        &self,
        email: &str,
        first_name: String,
        last_name: String,
        from_header: &str,
    ) -> Result<(CrmContact, bool), StoreError> {
        if let Some(existing) = self.store.find_contact_by_email(email).await? {
            return Ok((existing, false));
        }

        let new_contact = NewCrmContact {
            email: email.to_string(),
            first_name,
            last_name,
            notes: Some(format!("Auto-created from mailbox import: {from_header}")),
        };
        match self.store.insert_contact(new_contact).await {
            Ok(created) => Ok((created, true)),
            Err(e) if e.is_duplicate_conflict() => {
                // A concurrent sync won the insert; take their row.
                debug!("Contact {email} created concurrently, re-fetching");
                self.store
                    .find_contact_by_email(email)
                    .await?
                    .map(|c| (c, false))
                    .ok_or_else(|| {
                        StoreError::Backend(format!(
                            "Contact {email} missing after unique violation"
                        ))
                    })
            }
            Err(e) => Err(e),
        }
    }

    async fn find_or_create_brand(
        &self,
        name: &str,
        website: Option<String>,
        notes: &str,
        activity_label: &str,
    ) -> Result<(CrmBrand, bool), StoreError> {
        if let Some(existing) = self.store.find_brand_by_name(name).await? {
            return Ok((existing, false));
        }

        let new_brand = NewCrmBrand {
            name: name.to_string(),
            website,
            industry: "Other".to_string(),
            status: "Prospect".to_string(),
            notes: Some(notes.to_string()),
            activity: vec![ActivityEntry {
                at: Utc::now(),
                label: activity_label.to_string(),
            }],
        };
        match self.store.insert_brand(new_brand).await {
            Ok(created) => Ok((created, true)),
            Err(e) if e.is_duplicate_conflict() => {
                debug!("Brand {name} created concurrently, re-fetching");
                self.store
                    .find_brand_by_name(name)
                    .await?
                    .map(|b| (b, false))
                    .ok_or_else(|| {
                        StoreError::Backend(format!("Brand {name} missing after unique violation"))
                    })
            }
            Err(e) => Err(e),
        }
    }
}
