//! Establishes an upstream client for one session; implements the three SSO
//! strategies in precedence order (C3).

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{AggregatorError, AggregatorResult};
use crate::mcp_client::{UpstreamClient, UpstreamClientConfig, UpstreamTransport};
use crate::oauth::{self, OauthHandler};
use crate::server_registry::{AuthConfig, AuthInfo};
use crate::session_registry::{
    ConnectionStatus, SessionCapabilities, SessionConnection, SessionRegistry, TokenKey,
};

const INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Muster's own issuer, used as the key for the ID token that token exchange
/// and token forwarding both start from.
pub const MUSTER_ISSUER_KEY: &str = "muster_issuer";

/// Outcome of a connection attempt that may require user interaction.
pub enum EstablishOutcome {
    Connected(SessionConnection),
    ChallengeUrl(String),
}

/// Notified when a session's tool surface changes so transports can push
/// `tools/list_changed` to that one session, without the connector owning
/// the MCP server itself (see the cyclic-ownership design note).
#[async_trait::async_trait]
pub trait SessionNotifier: Send + Sync {
    async fn notify_tools_changed(&self, session_id: &str);
}

pub struct SessionConnector {
    oauth: Option<Arc<dyn OauthHandler>>,
    notifier: Arc<dyn SessionNotifier>,
}

impl SessionConnector {
    pub fn new(oauth: Option<Arc<dyn OauthHandler>>, notifier: Arc<dyn SessionNotifier>) -> Self {
        Self { oauth, notifier }
    }

    /// Resolves a bearer token (or a challenge URL) following the documented
    /// SSO precedence: token exchange, token forwarding, token reuse, fresh
    /// challenge.
    async fn resolve_auth(
        &self,
        session_id: &str,
        server_name: &str,
        auth_info: &AuthInfo,
        auth_config: &AuthConfig,
        upstream_url: &str,
    ) -> AggregatorResult<EstablishAuth> {
        let Some(oauth) = self.oauth.as_ref() else {
            return Err(AggregatorError::OauthNotConfigured(server_name.to_string()));
        };

        if let Some(exchange) = &auth_config.token_exchange {
            if exchange.enabled && !exchange.dex_token_endpoint.is_empty() && !exchange.connector_id.is_empty() {
                match self.try_token_exchange(oauth.as_ref(), session_id, exchange).await {
                    Ok(bearer) => {
                        return Ok(EstablishAuth::Bearer {
                            token: bearer,
                            issuer: auth_info.issuer.clone(),
                            scope: auth_info.scope.clone(),
                        });
                    }
                    Err(e) if auth_config.fallback_to_own_auth => {
                        warn!(server = %server_name, error = %e, "token exchange failed, falling back");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if auth_config.forward_token {
            match self.try_token_forwarding(oauth.as_ref(), session_id).await {
                Ok(bearer) => {
                    return Ok(EstablishAuth::Bearer {
                        token: bearer,
                        issuer: auth_info.issuer.clone(),
                        scope: auth_info.scope.clone(),
                    });
                }
                Err(e) if auth_config.fallback_to_own_auth => {
                    warn!(server = %server_name, error = %e, "token forwarding failed, falling back");
                }
                Err(e) => return Err(e),
            }
        }

        if auth_config.sso_enabled.unwrap_or(true) {
            if let Some(token) = oauth.get_token(session_id, &auth_info.issuer).await {
                return Ok(EstablishAuth::Bearer {
                    token,
                    issuer: auth_info.issuer.clone(),
                    scope: auth_info.scope.clone(),
                });
            }
        }

        let url = self
            .fresh_challenge(session_id, server_name, &auth_info.issuer, &auth_info.scope, upstream_url)
            .await?;

        Ok(EstablishAuth::Challenge(url))
    }

    /// Discovers the issuer if not already known and requests a fresh
    /// authorization challenge. Shared by the initial resolution path and the
    /// 401-triggered retry in `establish_session_connection`.
    async fn fresh_challenge(
        &self,
        session_id: &str,
        server_name: &str,
        issuer: &str,
        scope: &str,
        upstream_url: &str,
    ) -> AggregatorResult<String> {
        let Some(oauth) = self.oauth.as_ref() else {
            return Err(AggregatorError::OauthNotConfigured(server_name.to_string()));
        };

        let (issuer, scope) = if issuer.is_empty() {
            let discovered = oauth::discover_protected_resource(upstream_url).await?;
            (discovered.issuer, discovered.scope)
        } else {
            (issuer.to_string(), scope.to_string())
        };

        if issuer.is_empty() {
            return Err(AggregatorError::IssuerDiscoveryFailed {
                server: server_name.to_string(),
                message: "no issuer known after discovery".to_string(),
            });
        }

        oauth
            .create_challenge(session_id, &issuer, &scope)
            .await
            .map_err(|e| AggregatorError::ChallengeCreationFailed {
                server: server_name.to_string(),
                message: e.to_string(),
            })
    }

    async fn try_token_exchange(
        &self,
        oauth: &dyn OauthHandler,
        session_id: &str,
        exchange: &crate::server_registry::TokenExchangeConfig,
    ) -> AggregatorResult<String> {
        let id_token = oauth
            .get_muster_id_token(session_id)
            .await
            .ok_or_else(|| AggregatorError::TokenExpired(MUSTER_ISSUER_KEY.to_string()))?;

        if oauth::is_expired(&id_token) {
            return Err(AggregatorError::TokenExpired(MUSTER_ISSUER_KEY.to_string()));
        }

        let subject = oauth::unverified_subject(&id_token)?;

        oauth
            .exchange_token(&id_token, &subject, exchange)
            .await
            .map_err(|e| AggregatorError::TokenExchangeFailed {
                server: exchange.connector_id.clone(),
                message: e.to_string(),
            })
    }

    async fn try_token_forwarding(
        &self,
        oauth: &dyn OauthHandler,
        session_id: &str,
    ) -> AggregatorResult<String> {
        let id_token = oauth
            .get_muster_id_token(session_id)
            .await
            .ok_or_else(|| AggregatorError::TokenExpired(MUSTER_ISSUER_KEY.to_string()))?;

        if oauth::is_expired(&id_token) {
            return Err(AggregatorError::TokenExpired(MUSTER_ISSUER_KEY.to_string()));
        }

        Ok(id_token)
    }

    /// Shared connection path once a bearer token is known: builds the
    /// client (dynamic-auth if an OAuth handler is attached, static-bearer
    /// otherwise), lists capabilities, and installs the session connection.
    pub async fn establish_session_connection(
        &self,
        session_id: &str,
        server_name: &str,
        upstream_url: &str,
        auth_info: Option<AuthInfo>,
        auth_config: AuthConfig,
        sessions: &SessionRegistry,
    ) -> AggregatorResult<EstablishOutcome> {
        let auth = match &auth_info {
            Some(info) => {
                self.resolve_auth(session_id, server_name, info, &auth_config, upstream_url)
                    .await?
            }
            None => EstablishAuth::Bearer {
                token: String::new(),
                issuer: String::new(),
                scope: String::new(),
            },
        };

        let (bearer, issuer, scope) = match auth {
            EstablishAuth::Bearer { token, issuer, scope } => (token, issuer, scope),
            EstablishAuth::Challenge(url) => return Ok(EstablishOutcome::ChallengeUrl(url)),
        };

        let client = UpstreamClient::connect(UpstreamClientConfig {
            transport: UpstreamTransport::Http {
                url: upstream_url.to_string(),
                auth_token: if bearer.is_empty() { None } else { Some(bearer) },
            },
            client_name: format!("muster-session-{session_id}"),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        })
        .await?;

        let connected = async {
            client.initialize(INIT_TIMEOUT).await?;
            let tools: Vec<String> = client.list_tools().await?.into_iter().map(|t| t.name).collect();
            Ok::<_, AggregatorError>(tools)
        }
        .await;

        let tools = match connected {
            Ok(tools) => tools,
            Err(e) if is_unauthorized(&e.to_string()) => {
                let unauthorized = AggregatorError::ConnectionFailed401(server_name.to_string());
                warn!(session_id, server = %server_name, error = %unauthorized, "clearing token and re-challenging");
                if !issuer.is_empty() {
                    if let Some(oauth) = self.oauth.as_ref() {
                        oauth.clear_token(session_id, &issuer).await;
                    }
                }
                let url = self
                    .fresh_challenge(session_id, server_name, &issuer, &scope, upstream_url)
                    .await?;
                return Ok(EstablishOutcome::ChallengeUrl(url));
            }
            Err(e) => return Err(e),
        };

        let resources: Vec<String> = client
            .list_resources()
            .await
            .map(|rs| rs.into_iter().map(|r| r.name).collect())
            .unwrap_or_default();
        let prompts: Vec<String> = client
            .list_prompts()
            .await
            .map(|ps| ps.into_iter().map(|p| p.name).collect())
            .unwrap_or_default();

        let client = Arc::new(client);
        let token_key = if issuer.is_empty() {
            None
        } else {
            Some(TokenKey {
                session_id: session_id.to_string(),
                issuer,
                scope,
            })
        };

        let connection = SessionConnection {
            server_name: server_name.to_string(),
            status: ConnectionStatus::Connected,
            client: Some(client),
            token_key,
            connected_at: Some(chrono::Utc::now()),
            capabilities: SessionCapabilities {
                tools,
                resources,
                prompts,
            },
            sso_attempt_failed: false,
        };

        sessions.set_connection(session_id, connection.clone()).await?;
        self.notifier.notify_tools_changed(session_id).await;

        info!(session_id, server = %server_name, "session connection established");
        Ok(EstablishOutcome::Connected(connection))
    }
}

/// Matches the text `turbomcp-transport`/`turbomcp-client` produce for an
/// HTTP 401 response; these errors are only ever surfaced as stringified
/// messages by `UpstreamClient`, so detection is textual.
fn is_unauthorized(message: &str) -> bool {
    message.contains("401") || message.to_lowercase().contains("unauthorized")
}

enum EstablishAuth {
    Bearer {
        token: String,
        issuer: String,
        scope: String,
    },
    Challenge(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct NoopNotifier(AtomicBool);

    #[async_trait::async_trait]
    impl SessionNotifier for NoopNotifier {
        async fn notify_tools_changed(&self, _session_id: &str) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn no_oauth_handler_without_auth_info_skips_resolution() {
        let notifier = Arc::new(NoopNotifier(AtomicBool::new(false)));
        let connector = SessionConnector::new(None, notifier);
        // resolve_auth is only reached when auth_info is Some; this just
        // exercises that the connector can be constructed without a handler.
        assert!(connector.oauth.is_none());
    }
}
