//! Raw provider message → canonical thread patch + message record.

use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;

use crate::gmail::{MessagePart, RawMessage};
use crate::models::{NewInboundMessage, ThreadPatch};

/// Sender value used when the message has no usable From header. Chosen
/// so CRM resolution fails softly instead of inventing a contact.
pub const PLACEHOLDER_SENDER: &str = "(unknown sender)";

const PLATFORM: &str = "gmail";

/// Structural failures: these are invariants of the provider contract,
/// not conditions to paper over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapError {
    MissingMessageId,
    MissingThreadId,
}

impl std::fmt::Display for MapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingMessageId => write!(f, "Raw message has no provider message id"),
            Self::MissingThreadId => write!(f, "Raw message has no provider thread id"),
        }
    }
}

impl std::error::Error for MapError {}

#[derive(Debug)]
pub struct MappedMessage {
    pub thread: ThreadPatch,
    pub message: NewInboundMessage,
}

fn header<'a>(raw: &'a RawMessage, name: &str) -> Option<&'a str> {
    raw.payload.as_ref().and_then(|p| {
        p.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    })
}

/// Gmail body data is base64url; some providers pad, some don't.
fn decode_body_data(data: &str) -> Option<String> {
    URL_SAFE
        .decode(data)
        .or_else(|_| URL_SAFE_NO_PAD.decode(data))
        .or_else(|_| STANDARD.decode(data))
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

fn collect_parts(part: &MessagePart, out: &mut Vec<(String, String)>) {
    if let (Some(mime), Some(body)) = (&part.mime_type, &part.body) {
        if let Some(data) = body.data.as_deref() {
            if let Some(decoded) = decode_body_data(data) {
                out.push((mime.clone(), decoded));
            }
        }
    }
    for child in &part.parts {
        collect_parts(child, out);
    }
}

static STYLE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<style[^>]*>.*?</style>").unwrap());
static SCRIPT_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script[^>]*>.*?</script>").unwrap());
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

pub fn strip_html(html: &str) -> String {
    let text = STYLE_BLOCK.replace_all(html, "");
    let text = SCRIPT_BLOCK.replace_all(&text, "");
    let text = TAG.replace_all(&text, " ");
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

/// Concatenated decoded body, preferring text/plain parts and falling
/// back to HTML-stripped text/html when nothing plain exists.
fn extract_body(raw: &RawMessage) -> String {
    let mut parts = Vec::new();
    if let Some(payload) = &raw.payload {
        collect_parts(payload, &mut parts);
    }

    let plain: Vec<&str> = parts
        .iter()
        .filter(|(mime, _)| mime.eq_ignore_ascii_case("text/plain"))
        .map(|(_, body)| body.as_str())
        .collect();
    if !plain.is_empty() {
        return plain.join("\n");
    }

    let html: Vec<String> = parts
        .iter()
        .filter(|(mime, _)| mime.eq_ignore_ascii_case("text/html"))
        .map(|(_, body)| strip_html(body))
        .collect();
    html.join("\n")
}

/// Addresses in one header value, lowercased, RFC 5322 groups flattened.
fn addresses_in(value: &str) -> Vec<String> {
    match mailparse::addrparse(value) {
        Ok(list) => {
            let mut out = Vec::new();
            for addr in &*list {
                match addr {
                    mailparse::MailAddr::Single(info) => out.push(info.addr.to_lowercase()),
                    mailparse::MailAddr::Group(group) => {
                        out.extend(group.addrs.iter().map(|a| a.addr.to_lowercase()))
                    }
                }
            }
            out
        }
        Err(_) => value
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| s.contains('@'))
            .collect(),
    }
}

fn participants(raw: &RawMessage) -> Vec<String> {
    let mut seen = Vec::new();
    for name in ["From", "To", "Cc"] {
        if let Some(value) = header(raw, name) {
            for addr in addresses_in(value) {
                if !seen.contains(&addr) {
                    seen.push(addr);
                }
            }
        }
    }
    seen
}

fn received_at(raw: &RawMessage, message_id: &str) -> DateTime<Utc> {
    if let Some(date) = header(raw, "Date") {
        if let Ok(parsed) = DateTime::parse_from_rfc2822(date.trim()) {
            return parsed.with_timezone(&Utc);
        }
        warn!("Unparseable Date header on message {message_id}: {date:?}");
    }
    if let Some(ms) = raw
        .internal_date
        .as_deref()
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    {
        return ms;
    }
    warn!("Message {message_id} has no usable timestamp, falling back to now");
    Utc::now()
}

/// Transform one raw provider message into the thread patch and message
/// record to persist. Missing message or thread id is a hard error;
/// everything else degrades with a logged fallback.
pub fn map_message(raw: &RawMessage) -> Result<MappedMessage, MapError> {
    let message_id = raw
        .id
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or(MapError::MissingMessageId)?;
    let thread_id = raw
        .thread_id
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or(MapError::MissingThreadId)?;

    let subject_header = header(raw, "Subject").map(str::to_string);
    let from = match header(raw, "From") {
        Some(value) => value.to_string(),
        None => {
            warn!("Message {message_id} has no From header");
            PLACEHOLDER_SENDER.to_string()
        }
    };
    let to = header(raw, "To").unwrap_or_default().to_string();

    let received = received_at(raw, message_id);
    let snippet = raw.snippet.clone().unwrap_or_default();
    let body = extract_body(raw);
    let is_read = !raw.label_ids.iter().any(|l| l == "UNREAD");

    let thread = ThreadPatch {
        provider_thread_id: thread_id.to_string(),
        subject: subject_header
            .clone()
            .unwrap_or_else(|| "No subject".to_string()),
        snippet: snippet.clone(),
        last_message_at: received,
        sender: Some(from.clone()),
        is_read,
        participants: participants(raw),
    };

    let message = NewInboundMessage {
        platform: PLATFORM.to_string(),
        provider_message_id: message_id.to_string(),
        provider_thread_id: thread_id.to_string(),
        subject: subject_header,
        from_addr: from,
        to_addr: to,
        received_at: received,
        body,
        snippet,
        is_read,
        metadata: json!({
            "labels": raw.label_ids,
            "imported_at": Utc::now().to_rfc3339(),
        }),
    };

    Ok(MappedMessage { thread, message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmail::{MessageHeader, PartBody};

    fn b64(body: &str) -> Option<PartBody> {
        Some(PartBody {
            data: Some(URL_SAFE.encode(body)),
        })
    }

    fn part(mime: &str, body: &str) -> MessagePart {
        MessagePart {
            mime_type: Some(mime.to_string()),
            headers: Vec::new(),
            body: b64(body),
            parts: Vec::new(),
        }
    }

    fn headers(pairs: &[(&str, &str)]) -> Vec<MessageHeader> {
        pairs
            .iter()
            .map(|(name, value)| MessageHeader {
                name: name.to_string(),
                value: value.to_string(),
            })
            .collect()
    }

    fn raw(id: Option<&str>, thread: Option<&str>, payload: MessagePart) -> RawMessage {
        RawMessage {
            id: id.map(str::to_string),
            thread_id: thread.map(str::to_string),
            snippet: Some("snippet".to_string()),
            internal_date: Some("1716000000000".to_string()),
            label_ids: vec!["INBOX".to_string(), "UNREAD".to_string()],
            payload: Some(payload),
        }
    }

    #[test]
    fn missing_thread_id_is_a_hard_error() {
        let message = raw(Some("m1"), None, part("text/plain", "hi"));
        assert_eq!(map_message(&message).unwrap_err(), MapError::MissingThreadId);
    }

    #[test]
    fn missing_message_id_is_a_hard_error() {
        let message = raw(None, Some("t1"), part("text/plain", "hi"));
        assert_eq!(
            map_message(&message).unwrap_err(),
            MapError::MissingMessageId
        );
    }

    #[test]
    fn headers_match_case_insensitively() {
        let mut payload = part("text/plain", "hi");
        payload.headers = headers(&[
            ("FROM", "Jane <jane@acme.com>"),
            ("subject", "Quarterly review"),
            ("tO", "me@example.com"),
        ]);
        let mapped = map_message(&raw(Some("m1"), Some("t1"), payload)).unwrap();
        assert_eq!(mapped.message.from_addr, "Jane <jane@acme.com>");
        assert_eq!(mapped.message.subject.as_deref(), Some("Quarterly review"));
        assert_eq!(mapped.thread.subject, "Quarterly review");
    }

    #[test]
    fn plain_text_is_preferred_over_html() {
        let mut payload = MessagePart {
            mime_type: Some("multipart/alternative".to_string()),
            headers: headers(&[("From", "a@b.com")]),
            body: None,
            parts: vec![
                part("text/html", "<p>Hello <b>HTML</b></p>"),
                part("text/plain", "Hello plain"),
            ],
        };
        payload.parts.push(MessagePart {
            mime_type: Some("multipart/mixed".to_string()),
            headers: Vec::new(),
            body: None,
            parts: vec![part("text/plain", "nested plain")],
        });
        let mapped = map_message(&raw(Some("m1"), Some("t1"), payload)).unwrap();
        assert_eq!(mapped.message.body, "Hello plain\nnested plain");
    }

    #[test]
    fn html_only_bodies_are_stripped() {
        let payload = MessagePart {
            mime_type: Some("multipart/alternative".to_string()),
            headers: Vec::new(),
            body: None,
            parts: vec![part(
                "text/html",
                "<style>p { color: red }</style><p>Offer for <b>you</b></p>",
            )],
        };
        let mapped = map_message(&raw(Some("m1"), Some("t1"), payload)).unwrap();
        assert_eq!(mapped.message.body, "Offer for you");
    }

    #[test]
    fn missing_from_uses_placeholder() {
        let payload = part("text/plain", "hi");
        let mapped = map_message(&raw(Some("m1"), Some("t1"), payload)).unwrap();
        assert_eq!(mapped.message.from_addr, PLACEHOLDER_SENDER);
    }

    #[test]
    fn bad_date_falls_back_to_internal_date() {
        let mut payload = part("text/plain", "hi");
        payload.headers = headers(&[("Date", "not a date")]);
        let mapped = map_message(&raw(Some("m1"), Some("t1"), payload)).unwrap();
        assert_eq!(mapped.message.received_at.timestamp_millis(), 1716000000000);
    }

    #[test]
    fn participants_are_deduped_in_order() {
        let mut payload = part("text/plain", "hi");
        payload.headers = headers(&[
            ("From", "Jane <jane@acme.com>"),
            ("To", "me@example.com, jane@acme.com"),
            ("Cc", "Bob <bob@acme.com>, ME@example.com"),
        ]);
        let mapped = map_message(&raw(Some("m1"), Some("t1"), payload)).unwrap();
        assert_eq!(
            mapped.thread.participants,
            vec![
                "jane@acme.com".to_string(),
                "me@example.com".to_string(),
                "bob@acme.com".to_string(),
            ]
        );
    }

    #[test]
    fn unread_label_clears_read_flag() {
        let payload = part("text/plain", "hi");
        let mapped = map_message(&raw(Some("m1"), Some("t1"), payload)).unwrap();
        assert!(!mapped.message.is_read);
    }
}
