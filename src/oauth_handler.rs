//! Concrete, in-process `OauthHandler`: a DashMap-backed token cache plus the
//! RFC 8693 token-exchange HTTP call, grounded in `turbomcp-auth`'s
//! `discovery/fetcher.rs` caching shape. Standing up a full Dex-backed
//! authorization-code flow is outside this crate's scope (the spec treats
//! the muster login UI and its own ID-token issuance as external); this
//! handler assumes the muster ID token and any already-obtained upstream
//! tokens are handed to it out of band (e.g. by the HTTP frontend's own
//! session cookie exchange) and only implements the two flows this
//! aggregator itself must perform: token exchange and challenge-URL
//! construction.

use std::time::Duration;

use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{AggregatorError, AggregatorResult};
use crate::oauth::OauthHandler;
use crate::server_registry::TokenExchangeConfig;

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct TokenExchangeResponse {
    access_token: String,
}

/// Keys both caches by `(session_id, issuer)`; the muster ID token is cached
/// under the sentinel issuer key the session-connection helper uses.
pub struct InMemoryOauthHandler {
    tokens: DashMap<(String, String), String>,
    challenge_base_url: String,
    http: reqwest::Client,
}

impl InMemoryOauthHandler {
    pub fn new(challenge_base_url: impl Into<String>) -> Self {
        Self {
            tokens: DashMap::new(),
            challenge_base_url: challenge_base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Seeds the muster-issued ID token for a session, e.g. once the HTTP
    /// frontend's own login flow completes. Not part of `OauthHandler`
    /// itself since it is a setup step, not a per-call operation.
    pub fn seed_muster_token(&self, session_id: &str, muster_issuer_key: &str, id_token: String) {
        self.tokens.insert((session_id.to_string(), muster_issuer_key.to_string()), id_token);
    }
}

#[async_trait::async_trait]
impl OauthHandler for InMemoryOauthHandler {
    async fn get_token(&self, session_id: &str, issuer: &str) -> Option<String> {
        self.tokens.get(&(session_id.to_string(), issuer.to_string())).map(|v| v.clone())
    }

    async fn get_muster_id_token(&self, session_id: &str) -> Option<String> {
        self.tokens
            .get(&(session_id.to_string(), crate::session_connection::MUSTER_ISSUER_KEY.to_string()))
            .map(|v| v.clone())
    }

    async fn clear_token(&self, session_id: &str, issuer: &str) {
        self.tokens.remove(&(session_id.to_string(), issuer.to_string()));
    }

    async fn create_challenge(&self, session_id: &str, issuer: &str, scope: &str) -> AggregatorResult<String> {
        let url = format!(
            "{}?session_id={}&issuer={}&scope={}",
            self.challenge_base_url.trim_end_matches('/'),
            urlencoding_session(session_id),
            urlencoding_session(issuer),
            urlencoding_session(scope),
        );
        debug!(session_id, issuer, "created oauth challenge");
        Ok(url)
    }

    async fn exchange_token(
        &self,
        id_token: &str,
        subject: &str,
        config: &TokenExchangeConfig,
    ) -> AggregatorResult<String> {
        if !config.enabled {
            return Err(AggregatorError::TokenExchangeFailed {
                server: config.connector_id.clone(),
                message: "token exchange disabled for this server".to_string(),
            });
        }

        let client = reqwest::Client::builder().timeout(EXCHANGE_TIMEOUT).build()?;

        let response = client
            .post(&config.dex_token_endpoint)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:token-exchange"),
                ("subject_token", id_token),
                ("subject_token_type", "urn:ietf:params:oauth:token-type:id_token"),
                ("connector_id", &config.connector_id),
                ("subject", subject),
            ])
            .send()
            .await
            .map_err(|e| {
                warn!(endpoint = %config.dex_token_endpoint, error = %e, "token exchange request failed");
                AggregatorError::from(e)
            })?;

        if !response.status().is_success() {
            return Err(AggregatorError::TokenExchangeFailed {
                server: config.connector_id.clone(),
                message: format!("exchange endpoint returned {}", response.status()),
            });
        }

        let body: TokenExchangeResponse = response.json().await?;
        Ok(body.access_token)
    }
}

fn urlencoding_session(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c.to_string() } else { format!("%{:02X}", c as u32) })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seeded_muster_token_round_trips() {
        let handler = InMemoryOauthHandler::new("https://login.example/challenge");
        handler.seed_muster_token("s1", "muster_issuer", "abc.def.ghi".to_string());
        let token = handler.get_muster_id_token("s1").await;
        assert_eq!(token.as_deref(), Some("abc.def.ghi"));
    }

    #[tokio::test]
    async fn clear_token_removes_the_cached_entry() {
        let handler = InMemoryOauthHandler::new("https://login.example/challenge");
        handler.tokens.insert(("s1".to_string(), "issuer-a".to_string()), "tok".to_string());
        handler.clear_token("s1", "issuer-a").await;
        assert!(handler.get_token("s1", "issuer-a").await.is_none());
    }

    #[tokio::test]
    async fn disabled_exchange_config_is_rejected() {
        let handler = InMemoryOauthHandler::new("https://login.example/challenge");
        let config = TokenExchangeConfig {
            dex_token_endpoint: "https://dex.example/token".to_string(),
            connector_id: "github".to_string(),
            enabled: false,
        };
        let err = handler.exchange_token("id-token", "user-1", &config).await.unwrap_err();
        assert_eq!(err.kind(), "token_exchange_failed");
    }
}
