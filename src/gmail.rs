//! Gmail REST client.
//!
//! One [`GmailClient`] is built per authenticated user from stored
//! credentials. Token refresh happens transparently inside each call:
//! the access token is renewed when missing, about to expire, or when
//! the API answers 401. Rotated tokens stay in memory; the token
//! manager persists them after the call via [`MailboxSession::token_state`].

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, warn};
use reqwest::Client;
use serde::Deserialize;

use crate::config::GoogleConfig;
use crate::error::ProviderError;

/// Expiry skew: refresh when the access token dies within this window.
const TOKEN_EXPIRY_SKEW_SECS: i64 = 60;

/// In-memory OAuth token state for one mailbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenState {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
}

/// Listing result: message id plus thread id when the provider returns it.
#[derive(Debug, Clone)]
pub struct MessageRef {
    pub id: String,
    pub thread_id: Option<String>,
}

/// Raw provider message as returned by `messages.get` with `format=full`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawMessage {
    pub id: Option<String>,
    pub thread_id: Option<String>,
    pub snippet: Option<String>,
    /// Epoch milliseconds as a decimal string.
    pub internal_date: Option<String>,
    pub label_ids: Vec<String>,
    pub payload: Option<MessagePart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessagePart {
    pub mime_type: Option<String>,
    pub headers: Vec<MessageHeader>,
    pub body: Option<PartBody>,
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartBody {
    /// Base64url-encoded content.
    pub data: Option<String>,
}

/// Result of registering a push subscription.
#[derive(Debug, Clone)]
pub struct WatchRegistration {
    pub history_id: u64,
    pub expiration: DateTime<Utc>,
}

/// Provider-facing surface of one authenticated mailbox. The orchestrator,
/// fetcher and webhook manager only see this trait, so tests substitute a
/// fake session.
#[async_trait]
pub trait MailboxSession: Send + Sync {
    /// List up to `max_results` recent message refs matching `query`.
    /// An empty result is not an error.
    async fn list_messages(
        &self,
        query: &str,
        max_results: u32,
    ) -> Result<Vec<MessageRef>, ProviderError>;

    async fn get_message(&self, id: &str) -> Result<RawMessage, ProviderError>;

    async fn watch(
        &self,
        topic: &str,
        label_ids: &[String],
    ) -> Result<WatchRegistration, ProviderError>;

    async fn stop_watch(&self) -> Result<(), ProviderError>;

    /// Current in-memory token state, inspected after calls to persist
    /// any rotation.
    fn token_state(&self) -> TokenState;
}

pub struct GmailClient {
    http: Client,
    config: GoogleConfig,
    tokens: Mutex<TokenState>,
}

#[derive(Deserialize)]
struct TokenRefreshResponse {
    access_token: String,
    expires_in: i64,
    refresh_token: Option<String>,
    scope: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    messages: Option<Vec<ListedMessage>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListedMessage {
    id: Option<String>,
    thread_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchResponseDto {
    history_id: Option<String>,
    expiration: Option<String>,
}

impl GmailClient {
    pub fn new(config: GoogleConfig, tokens: TokenState) -> Self {
        Self {
            http: Client::new(),
            config,
            tokens: Mutex::new(tokens),
        }
    }

    fn snapshot(&self) -> TokenState {
        self.tokens
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    fn needs_refresh(state: &TokenState) -> bool {
        match (&state.access_token, state.expires_at) {
            (None, _) => true,
            (Some(_), Some(expiry)) => {
                expiry <= Utc::now() + chrono::Duration::seconds(TOKEN_EXPIRY_SKEW_SECS)
            }
            (Some(_), None) => false,
        }
    }

    async fn refresh_access_token(&self) -> Result<(), ProviderError> {
        let refresh_token = self
            .snapshot()
            .refresh_token
            .ok_or_else(|| ProviderError::AuthError("No refresh token available".to_string()))?;

        let response = self
            .http
            .post(&self.config.token_url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("Token refresh failed: {} - {}", status, body);
            return Err(ProviderError::AuthError(format!(
                "Token refresh failed: {status}"
            )));
        }

        let refreshed: TokenRefreshResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.access_token = Some(refreshed.access_token);
            tokens.expires_at =
                Some(Utc::now() + chrono::Duration::seconds(refreshed.expires_in));
            if let Some(rotated) = refreshed.refresh_token {
                tokens.refresh_token = Some(rotated);
            }
            if let Some(scope) = refreshed.scope {
                tokens.scope = Some(scope);
            }
        }
        debug!("Access token refreshed");
        Ok(())
    }

    async fn bearer_token(&self) -> Result<String, ProviderError> {
        if Self::needs_refresh(&self.snapshot()) {
            self.refresh_access_token().await?;
        }
        self.snapshot()
            .access_token
            .ok_or_else(|| ProviderError::AuthError("No access token after refresh".to_string()))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let mut token = self.bearer_token().await?;
        for attempt in 0..2 {
            let response = self
                .http
                .get(url)
                .query(query)
                .bearer_auth(&token)
                .send()
                .await
                .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED && attempt == 0 {
                // Access token died mid-flight; rotate once and retry.
                self.refresh_access_token().await?;
                token = self
                    .snapshot()
                    .access_token
                    .ok_or_else(|| ProviderError::AuthError("No access token".to_string()))?;
                continue;
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ProviderError::ApiError {
                    status: status.as_u16(),
                    message: body,
                });
            }
            return response
                .json()
                .await
                .map_err(|e| ProviderError::ParseError(e.to_string()));
        }
        unreachable!("request loop exits via return")
    }

    async fn post_json(
        &self,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response, ProviderError> {
        let mut token = self.bearer_token().await?;
        for attempt in 0..2 {
            let mut request = self.http.post(url).bearer_auth(&token);
            if let Some(json) = body {
                request = request.json(json);
            }
            let response = request
                .send()
                .await
                .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED && attempt == 0 {
                self.refresh_access_token().await?;
                token = self
                    .snapshot()
                    .access_token
                    .ok_or_else(|| ProviderError::AuthError("No access token".to_string()))?;
                continue;
            }
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(ProviderError::ApiError {
                    status: status.as_u16(),
                    message: text,
                });
            }
            return Ok(response);
        }
        unreachable!("request loop exits via return")
    }
}

fn parse_epoch_millis(raw: &str) -> Option<DateTime<Utc>> {
    raw.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

#[async_trait]
impl MailboxSession for GmailClient {
    async fn list_messages(
        &self,
        query: &str,
        max_results: u32,
    ) -> Result<Vec<MessageRef>, ProviderError> {
        let url = format!("{}/users/me/messages", self.config.api_base_url);
        let listed: ListResponse = self
            .get_json(
                &url,
                &[
                    ("q", query.to_string()),
                    ("maxResults", max_results.to_string()),
                ],
            )
            .await?;
        Ok(listed
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| {
                m.id.map(|id| MessageRef {
                    id,
                    thread_id: m.thread_id,
                })
            })
            .collect())
    }

    async fn get_message(&self, id: &str) -> Result<RawMessage, ProviderError> {
        let url = format!("{}/users/me/messages/{}", self.config.api_base_url, id);
        self.get_json(&url, &[("format", "full".to_string())]).await
    }

    async fn watch(
        &self,
        topic: &str,
        label_ids: &[String],
    ) -> Result<WatchRegistration, ProviderError> {
        let url = format!("{}/users/me/watch", self.config.api_base_url);
        let body = serde_json::json!({
            "topicName": topic,
            "labelIds": label_ids,
        });
        let response = self.post_json(&url, Some(&body)).await?;
        let dto: WatchResponseDto = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        let history_id = dto
            .history_id
            .as_deref()
            .and_then(|h| h.parse::<u64>().ok())
            .ok_or_else(|| {
                ProviderError::ParseError("Watch response missing historyId".to_string())
            })?;
        let expiration = dto
            .expiration
            .as_deref()
            .and_then(parse_epoch_millis)
            .ok_or_else(|| {
                ProviderError::ParseError("Watch response missing expiration".to_string())
            })?;
        Ok(WatchRegistration {
            history_id,
            expiration,
        })
    }

    async fn stop_watch(&self) -> Result<(), ProviderError> {
        let url = format!("{}/users/me/stop", self.config.api_base_url);
        self.post_json(&url, None).await?;
        Ok(())
    }

    fn token_state(&self) -> TokenState {
        self.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_for(server: &mockito::Server) -> GoogleConfig {
        GoogleConfig {
            client_id: "cid".to_string(),
            client_secret: "secret".to_string(),
            api_base_url: server.url(),
            token_url: format!("{}/token", server.url()),
            pubsub_topic: "projects/test/topics/mail".to_string(),
        }
    }

    fn live_tokens() -> TokenState {
        TokenState {
            access_token: Some("tok".to_string()),
            refresh_token: Some("refresh".to_string()),
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
            scope: None,
        }
    }

    #[tokio::test]
    async fn list_messages_parses_refs() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/users/me/messages")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"messages":[{"id":"m1","threadId":"t1"},{"id":"m2","threadId":"t2"}]}"#)
            .create_async()
            .await;

        let client = GmailClient::new(config_for(&server), live_tokens());
        let refs = client.list_messages("in:inbox", 100).await.unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].id, "m1");
        assert_eq!(refs[1].thread_id.as_deref(), Some("t2"));
    }

    #[tokio::test]
    async fn empty_listing_is_not_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/users/me/messages")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("{}")
            .create_async()
            .await;

        let client = GmailClient::new(config_for(&server), live_tokens());
        let refs = client.list_messages("in:inbox", 100).await.unwrap();
        assert!(refs.is_empty());
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_before_the_call() {
        let mut server = mockito::Server::new_async().await;
        let token_mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"fresh","expires_in":3600,"refresh_token":"refresh2"}"#)
            .create_async()
            .await;
        let _list = server
            .mock("GET", "/users/me/messages")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("{}")
            .create_async()
            .await;

        let expired = TokenState {
            access_token: Some("stale".to_string()),
            refresh_token: Some("refresh".to_string()),
            expires_at: Some(Utc::now() - chrono::Duration::minutes(5)),
            scope: None,
        };
        let client = GmailClient::new(config_for(&server), expired);
        client.list_messages("in:inbox", 100).await.unwrap();

        token_mock.assert_async().await;
        let rotated = client.token_state();
        assert_eq!(rotated.access_token.as_deref(), Some("fresh"));
        assert_eq!(rotated.refresh_token.as_deref(), Some("refresh2"));
    }

    #[tokio::test]
    async fn listing_failure_surfaces_as_api_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/users/me/messages")
            .match_query(mockito::Matcher::Any)
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let client = GmailClient::new(config_for(&server), live_tokens());
        let err = client.list_messages("in:inbox", 100).await.unwrap_err();
        match err {
            ProviderError::ApiError { status, .. } => assert_eq!(status, 500),
            other => panic!("unexpected error: {other}"),
        }
    }
}
