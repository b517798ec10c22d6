// Join credentials for the media channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::config::CallConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub token: String,
    pub expires_in_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("token fetch failed{}: {message}", status_suffix(.http_status))]
pub struct TokenFetchError {
    /// `None` for transport or decode failures.
    pub http_status: Option<u16>,
    pub message: String,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl TokenFetchError {
    fn transport(err: impl std::fmt::Display) -> Self {
        Self {
            http_status: None,
            message: err.to_string(),
        }
    }
}

/// Source of short-lived join tokens. Implementations do not retry; the caller
/// decides whether a failed fetch aborts the session.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn fetch_token(
        &self,
        channel_id: &str,
        participant_id: u32,
    ) -> Result<SessionToken, TokenFetchError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest<'a> {
    channel_name: &'a str,
    uid: u32,
    role: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// POSTs `{channelName, uid, role}` to a token server.
#[derive(Debug, Clone)]
pub struct HttpTokenProvider {
    client: reqwest::Client,
    endpoint: String,
    role: String,
    timeout: Duration,
}

impl HttpTokenProvider {
    pub fn new(endpoint: impl Into<String>, role: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            role: role.into(),
            timeout,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn fetch_token(
        &self,
        channel_id: &str,
        participant_id: u32,
    ) -> Result<SessionToken, TokenFetchError> {
        let body = TokenRequest {
            channel_name: channel_id,
            uid: participant_id,
            role: &self.role,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(TokenFetchError::transport)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = if text.trim().is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("token endpoint error")
                    .to_string()
            } else {
                text.trim().to_string()
            };
            return Err(TokenFetchError {
                http_status: Some(status.as_u16()),
                message,
            });
        }

        let parsed: TokenResponse = resp.json().await.map_err(TokenFetchError::transport)?;
        if parsed.token.trim().is_empty() {
            return Err(TokenFetchError::transport("token endpoint returned empty token"));
        }
        tracing::debug!(channel_id, participant_id, expires_in = ?parsed.expires_in, "token: fetched");
        Ok(SessionToken {
            token: parsed.token,
            expires_in_secs: parsed.expires_in,
        })
    }
}

/// Returns a fixed token. An empty token puts the engine in its unauthenticated
/// testing mode.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn fetch_token(
        &self,
        _channel_id: &str,
        _participant_id: u32,
    ) -> Result<SessionToken, TokenFetchError> {
        Ok(SessionToken {
            token: self.token.clone(),
            expires_in_secs: None,
        })
    }
}

/// A configured static token wins; otherwise the endpoint is used when the
/// network is enabled, falling back to the engine's unauthenticated mode.
pub(crate) fn provider_from_config(config: &CallConfig) -> Arc<dyn TokenProvider> {
    if let Some(token) = config.static_token.clone() {
        return Arc::new(StaticTokenProvider::new(token));
    }
    match config.token_endpoint() {
        Some(endpoint) if config.network_enabled() => Arc::new(HttpTokenProvider::new(
            endpoint,
            config.token_role(),
            config.token_timeout(),
        )),
        Some(endpoint) => {
            tracing::info!(%endpoint, "token: network disabled, using empty token");
            Arc::new(StaticTokenProvider::default())
        }
        None => Arc::new(StaticTokenProvider::default()),
    }
}
