//! OAuth collaborator abstraction: token store access, RFC 9728 discovery,
//! and the local (unverified) JWT inspection the SSO strategies need.
//!
//! The actual OAuth provider — issuing, refreshing, and persisting tokens —
//! is an external collaborator; this module only defines the boundary this
//! aggregator calls across and the couple of RFC flows specific to its SSO
//! precedence that aren't already covered by `turbomcp_auth`.

use std::time::Duration;

use base64::Engine;
use serde::Deserialize;

use crate::error::{AggregatorError, AggregatorResult};
use crate::server_registry::TokenExchangeConfig;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
const EXPIRY_SKEW: Duration = Duration::from_secs(30);

/// Result of RFC 9728 protected-resource discovery.
#[derive(Debug, Clone)]
pub struct DiscoveredAuthServer {
    pub issuer: String,
    pub scope: String,
}

#[derive(Debug, Deserialize)]
struct ProtectedResourceMetadata {
    authorization_servers: Vec<String>,
    #[serde(default)]
    scopes_supported: Vec<String>,
}

/// Fetches `/.well-known/oauth-protected-resource` for `upstream_url` and
/// extracts the first authorization server and the space-joined scope list.
pub async fn discover_protected_resource(upstream_url: &str) -> AggregatorResult<DiscoveredAuthServer> {
    let discovery_url = format!(
        "{}/.well-known/oauth-protected-resource",
        upstream_url.trim_end_matches('/')
    );

    let client = reqwest::Client::builder()
        .timeout(DISCOVERY_TIMEOUT)
        .build()?;

    let response = client.get(&discovery_url).send().await?;
    let metadata: ProtectedResourceMetadata = response.json().await?;

    let issuer = metadata
        .authorization_servers
        .into_iter()
        .next()
        .ok_or_else(|| AggregatorError::IssuerDiscoveryFailed {
            server: upstream_url.to_string(),
            message: "no authorization_servers entry in discovery document".to_string(),
        })?;

    Ok(DiscoveredAuthServer {
        issuer,
        scope: metadata.scopes_supported.join(" "),
    })
}

#[derive(Debug, Deserialize)]
struct UnverifiedClaims {
    sub: Option<String>,
    exp: Option<i64>,
}

fn decode_payload(jwt: &str) -> AggregatorResult<UnverifiedClaims> {
    let mut parts = jwt.split('.');
    let (_, payload, _) = (
        parts.next(),
        parts.next(),
        parts.next(),
    );
    let payload = payload.ok_or_else(|| AggregatorError::TokenExpired(jwt.to_string()))?;
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| AggregatorError::TokenExpired(e.to_string()))?;
    serde_json::from_slice(&decoded).map_err(AggregatorError::from)
}

/// Extracts the `sub` claim from an ID token **without verifying its
/// signature** — purely for cache keying. The token came from a trusted
/// in-process source and the remote token-exchange endpoint re-verifies it;
/// never use this value for authorization decisions.
pub fn unverified_subject(id_token: &str) -> AggregatorResult<String> {
    decode_payload(id_token)?
        .sub
        .ok_or_else(|| AggregatorError::TokenExpired("missing sub claim".to_string()))
}

/// Local `exp` check with a 30s clock-skew margin, avoiding a network
/// round-trip before every SSO attempt.
pub fn is_expired(id_token: &str) -> bool {
    let Ok(claims) = decode_payload(id_token) else {
        return true;
    };
    let Some(exp) = claims.exp else {
        return true;
    };
    let now = chrono::Utc::now().timestamp();
    now + EXPIRY_SKEW.as_secs() as i64 >= exp
}

/// Per-session OAuth state the aggregator brokers against: token storage
/// keyed by `(session, issuer)`, the muster-issued ID token, challenge
/// creation, and RFC 8693 exchange. Implemented by the external OAuth
/// provider collaborator.
#[async_trait::async_trait]
pub trait OauthHandler: Send + Sync {
    /// An access token this session already holds for `issuer`, if any.
    async fn get_token(&self, session_id: &str, issuer: &str) -> Option<String>;

    /// The muster-issued ID token for this session, used for forwarding and
    /// as the basis for token exchange.
    async fn get_muster_id_token(&self, session_id: &str) -> Option<String>;

    /// Clears a cached token, e.g. after a 401.
    async fn clear_token(&self, session_id: &str, issuer: &str);

    /// Starts a fresh OAuth challenge, returning the sign-in URL for the caller.
    async fn create_challenge(
        &self,
        session_id: &str,
        issuer: &str,
        scope: &str,
    ) -> AggregatorResult<String>;

    /// RFC 8693 token exchange against the upstream's configured Dex connector.
    async fn exchange_token(
        &self,
        id_token: &str,
        subject: &str,
        config: &TokenExchangeConfig,
    ) -> AggregatorResult<String>;
}
