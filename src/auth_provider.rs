//! `auth_login`/`auth_logout` meta-tools, the `auth://status` resource, and
//! auth metrics (C4).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{info, warn};
use turbomcp_protocol::RequestContext;
use turbomcp_protocol::types::{
    CallToolRequest, CallToolResult, ContentBlock, TextContent, Tool, ToolInputSchema,
};
use turbomcp_server::error::ServerResult;
use turbomcp_server::handlers::traits::tool::ToolHandler;

use crate::error::AggregatorError;
use crate::oauth::OauthHandler;
use crate::rate_limiter::RateLimiter;
use crate::server_registry::{AuthConfig, ServerRegistry, ServerStatus};
use crate::session_connection::{EstablishOutcome, SessionConnector};
use crate::session_registry::{ConnectionStatus, SessionRegistry};

/// Always the reported `auth_tool` value on the status resource, per the
/// documented wire contract, independent of the meta-tool's own (unprefixed)
/// exposed name.
const STATUS_AUTH_TOOL: &str = "core_auth_login";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    LoginAttempt,
    LoginSuccess,
    LoginFailure,
    LogoutAttempt,
    LogoutSuccess,
    RateLimitBlock,
}

impl MetricKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::LoginAttempt => "login_attempt",
            Self::LoginSuccess => "login_success",
            Self::LoginFailure => "login_failure",
            Self::LogoutAttempt => "logout_attempt",
            Self::LogoutSuccess => "logout_success",
            Self::RateLimitBlock => "rate_limit_block",
        }
    }
}

/// Counters per `(server, kind)` plus the timestamp of the most recent event
/// of each kind, as consumed by operational dashboards.
#[derive(Default)]
pub struct AuthMetrics {
    counters: Mutex<HashMap<(String, &'static str), u64>>,
    last_event: Mutex<HashMap<(String, &'static str), DateTime<Utc>>>,
    /// `login_failure` is further broken down by reason, per the documented
    /// `login_failure[reason]` kind.
    failure_reasons: Mutex<HashMap<(String, String), u64>>,
}

impl AuthMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, server: &str, kind: MetricKind) {
        let key = (server.to_string(), kind.as_str());
        *self.counters.lock().entry(key.clone()).or_insert(0) += 1;
        self.last_event.lock().insert(key, Utc::now());
    }

    pub fn record_failure(&self, server: &str, reason: &str) {
        self.record(server, MetricKind::LoginFailure);
        *self
            .failure_reasons
            .lock()
            .entry((server.to_string(), reason.to_string()))
            .or_insert(0) += 1;
    }

    pub fn count(&self, server: &str, kind: MetricKind) -> u64 {
        self.counters
            .lock()
            .get(&(server.to_string(), kind.as_str()))
            .copied()
            .unwrap_or(0)
    }
}

fn text_result(message: impl Into<String>, is_error: bool) -> CallToolResult {
    CallToolResult {
        content: vec![ContentBlock::Text(TextContent {
            text: message.into(),
            annotations: None,
            meta: None,
        })],
        is_error: Some(is_error),
    }
}

fn error_result(kind: &str, message: impl std::fmt::Display) -> CallToolResult {
    text_result(format!("{kind}: {message}"), true)
}

fn server_arg(request: &CallToolRequest) -> Result<String, CallToolResult> {
    let server = request
        .arguments
        .as_ref()
        .and_then(|args| args.get("server"))
        .and_then(Value::as_str)
        .map(str::to_string);

    server.ok_or_else(|| error_result("invalid_arguments", "missing required string argument 'server'"))
}

fn session_id_of(ctx: &RequestContext) -> Result<String, CallToolResult> {
    ctx.session_id
        .clone()
        .ok_or_else(|| error_result("invalid_session_id", "request has no resolved session id"))
}

/// Shared collaborators behind both meta-tools and the status resource.
pub struct AuthToolProvider {
    servers: Arc<ServerRegistry>,
    sessions: Arc<SessionRegistry>,
    connector: Arc<SessionConnector>,
    oauth: Option<Arc<dyn OauthHandler>>,
    rate_limiter: Arc<RateLimiter>,
    metrics: Arc<AuthMetrics>,
}

impl AuthToolProvider {
    pub fn new(
        servers: Arc<ServerRegistry>,
        sessions: Arc<SessionRegistry>,
        connector: Arc<SessionConnector>,
        oauth: Option<Arc<dyn OauthHandler>>,
        rate_limiter: Arc<RateLimiter>,
        metrics: Arc<AuthMetrics>,
    ) -> Self {
        Self {
            servers,
            sessions,
            connector,
            oauth,
            rate_limiter,
            metrics,
        }
    }

    pub fn login_tool(self: &Arc<Self>) -> AuthLoginTool {
        AuthLoginTool { provider: self.clone() }
    }

    pub fn logout_tool(self: &Arc<Self>) -> AuthLogoutTool {
        AuthLogoutTool { provider: self.clone() }
    }

    /// Runs the `auth_login` pipeline; steps are numbered to match the
    /// documented order.
    async fn login(&self, session_id: &str, server: &str) -> CallToolResult {
        // 3. Rate-limit check.
        if !self.rate_limiter.allow(session_id).await {
            self.metrics.record(server, MetricKind::RateLimitBlock);
            return error_result(
                "rate_limited",
                format!(
                    "remaining_attempts=0, retry after the rate limit window elapses for session {session_id}"
                ),
            );
        }

        // 4. Record login_attempt.
        self.metrics.record(server, MetricKind::LoginAttempt);

        // 5. Fetch server info.
        let Some((auth_info, auth_config)) = self.servers.auth_info_of(server).await else {
            if self.servers.is_registered(server).await {
                // 6. Connected server with no auth_info: auth not required.
                self.metrics.record(server, MetricKind::LoginSuccess);
                return text_result(format!("server '{server}' does not require authentication"), false);
            }
            self.metrics.record_failure(server, "server_not_found");
            return error_result("server_not_found", server);
        };

        // 7. Already connected for this session?
        match self.sessions.get_connection(session_id, server).await {
            Ok(Some(conn)) if conn.status == ConnectionStatus::Connected => {
                self.metrics.record(server, MetricKind::LoginSuccess);
                return text_result(
                    format!("already authenticated for this session against '{server}'"),
                    false,
                );
            }
            Ok(_) => {}
            Err(AggregatorError::SessionNotFound(_)) => {
                if let Err(e) = self.sessions.get_or_create(session_id).await {
                    self.metrics.record_failure(server, "invalid_session_id");
                    return error_result("invalid_session_id", e);
                }
            }
            Err(e) => {
                self.metrics.record_failure(server, "connection_lookup_failed");
                return error_result("connection_failed_other", e);
            }
        }

        // 8. OAuth handler required from here on.
        if self.oauth.is_none() {
            self.metrics.record_failure(server, "oauth_not_configured");
            return error_result("oauth_not_configured", server);
        }

        let upstream_url = self.servers.url_of(server).await.unwrap_or_default();

        // 9-12. SSO precedence and/or challenge, via the shared connector.
        match self
            .connector
            .establish_session_connection(
                session_id,
                server,
                &upstream_url,
                Some(auth_info),
                auth_config,
                &self.sessions,
            )
            .await
        {
            Ok(EstablishOutcome::Connected(_)) => {
                self.metrics.record(server, MetricKind::LoginSuccess);
                self.rate_limiter.reset(session_id).await;
                text_result(format!("authenticated against '{server}'"), false)
            }
            Ok(EstablishOutcome::ChallengeUrl(url)) => {
                text_result(format!("sign in to continue: {url}"), false)
            }
            Err(e) => {
                self.metrics.record_failure(server, e.kind());
                error_result(e.kind(), e)
            }
        }
    }

    async fn logout(&self, session_id: &str, server: &str) -> CallToolResult {
        self.metrics.record(server, MetricKind::LogoutAttempt);

        let Some((auth_info, _)) = self.servers.auth_info_of(server).await else {
            if !self.servers.is_registered(server).await {
                return error_result("server_not_found", server);
            }
            return text_result(format!("no session-scoped connection to clear for '{server}'"), false);
        };

        match self.sessions.get_connection(session_id, server).await {
            Ok(Some(conn)) => {
                if let Some(client) = &conn.client {
                    client.close().await;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(session_id, server, error = %e, "logout: connection lookup failed, continuing"),
        }

        if let Err(e) = self.sessions.delete_connection(session_id, server).await {
            warn!(session_id, server, error = %e, "logout: failed to remove session connection");
        }

        if let Some(oauth) = &self.oauth {
            if !auth_info.issuer.is_empty() {
                oauth.clear_token(session_id, &auth_info.issuer).await;
            }
        }

        self.metrics.record(server, MetricKind::LogoutSuccess);
        info!(session_id, server, "session logged out");
        text_result(format!("logged out of '{server}' for this session"), false)
    }

    /// Builds the `auth://status` resource body.
    pub async fn status_resource(&self, session_id: &str) -> Value {
        let mut servers = Vec::new();
        for name in self.servers.server_names().await {
            let Some((auth_info, auth_config)) = self.servers.auth_info_of(&name).await else {
                servers.push(json!({
                    "name": name,
                    "status": "connected",
                    "token_forwarding_enabled": false,
                    "token_exchange_enabled": false,
                    "token_reuse_enabled": false,
                    "sso_attempt_failed": false,
                }));
                continue;
            };

            let session_conn = self
                .sessions
                .get_connection(session_id, &name)
                .await
                .ok()
                .flatten();

            let (status, sso_attempt_failed) = match &session_conn {
                Some(conn) if conn.status == ConnectionStatus::Connected => ("connected", false),
                Some(conn) => ("auth_required", conn.sso_attempt_failed),
                None => {
                    let global = self.servers.status_of(&name).await;
                    match global {
                        Some(ServerStatus::Unreachable) => ("unreachable", false),
                        Some(ServerStatus::Disconnected) => ("disconnected", false),
                        _ => ("auth_required", false),
                    }
                }
            };

            servers.push(json!({
                "name": name,
                "status": status,
                "issuer": if auth_info.issuer.is_empty() { None } else { Some(auth_info.issuer.clone()) },
                "scope": if auth_info.scope.is_empty() { None } else { Some(auth_info.scope.clone()) },
                "auth_tool": if status == "auth_required" { Some(STATUS_AUTH_TOOL) } else { None },
                "token_forwarding_enabled": auth_config.forward_token,
                "token_exchange_enabled": auth_config.token_exchange.as_ref().is_some_and(|t| t.enabled),
                "token_reuse_enabled": auth_config.sso_enabled.unwrap_or(true),
                "sso_attempt_failed": sso_attempt_failed,
            }));
        }

        json!({ "servers": servers })
    }

    /// Session-init hook: attempts every SSO-enabled, auth-required server in
    /// parallel, bounded by the number of such servers, recording failures as
    /// `sso_attempt_failed` rather than surfacing them to the caller.
    pub async fn on_session_authenticated(self: &Arc<Self>, session_id: &str) {
        if self.oauth.is_none() {
            return;
        }

        let mut candidates = Vec::new();
        for name in self.servers.server_names().await {
            if let Some((auth_info, auth_config)) = self.servers.auth_info_of(&name).await {
                if auth_config.is_sso_based() || auth_config.sso_enabled.unwrap_or(true) {
                    candidates.push((name, auth_info, auth_config));
                }
            }
        }

        let attempts = candidates.into_iter().map(|(name, auth_info, auth_config)| {
            let this = self.clone();
            let session_id = session_id.to_string();
            async move {
                let upstream_url = this.servers.url_of(&name).await.unwrap_or_default();
                let result = this
                    .connector
                    .establish_session_connection(
                        &session_id,
                        &name,
                        &upstream_url,
                        Some(auth_info),
                        auth_config,
                        &this.sessions,
                    )
                    .await;
                if let Err(e) = result {
                    warn!(session_id = %session_id, server = %name, error = %e, "session-init SSO attempt failed");
                    let _ = this.sessions.mark_sso_attempt_failed(&session_id, &name).await;
                }
            }
        });

        futures::future::join_all(attempts).await;
    }
}

pub struct AuthLoginTool {
    provider: Arc<AuthToolProvider>,
}

#[async_trait]
impl ToolHandler for AuthLoginTool {
    async fn handle(&self, request: CallToolRequest, ctx: RequestContext) -> ServerResult<CallToolResult> {
        let server = match server_arg(&request) {
            Ok(s) => s,
            Err(result) => return Ok(result),
        };
        let session_id = match session_id_of(&ctx) {
            Ok(s) => s,
            Err(result) => return Ok(result),
        };
        Ok(self.provider.login(&session_id, &server).await)
    }

    fn tool_definition(&self) -> Tool {
        Tool {
            name: "auth_login".to_string(),
            title: Some("Authenticate".to_string()),
            description: Some("Begin or complete OAuth sign-in against an upstream server".to_string()),
            input_schema: server_arg_schema(),
            output_schema: None,
        }
    }
}

pub struct AuthLogoutTool {
    provider: Arc<AuthToolProvider>,
}

#[async_trait]
impl ToolHandler for AuthLogoutTool {
    async fn handle(&self, request: CallToolRequest, ctx: RequestContext) -> ServerResult<CallToolResult> {
        let server = match server_arg(&request) {
            Ok(s) => s,
            Err(result) => return Ok(result),
        };
        let session_id = match session_id_of(&ctx) {
            Ok(s) => s,
            Err(result) => return Ok(result),
        };
        Ok(self.provider.logout(&session_id, &server).await)
    }

    fn tool_definition(&self) -> Tool {
        Tool {
            name: "auth_logout".to_string(),
            title: Some("Sign out".to_string()),
            description: Some("Clear this session's connection and token for an upstream server".to_string()),
            input_schema: server_arg_schema(),
            output_schema: None,
        }
    }
}

fn server_arg_schema() -> ToolInputSchema {
    let mut properties = HashMap::new();
    properties.insert(
        "server".to_string(),
        json!({ "type": "string", "description": "Registered upstream server name" }),
    );
    ToolInputSchema {
        schema_type: "object".to_string(),
        properties: Some(properties),
        required: Some(vec!["server".to_string()]),
        additional_properties: Some(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_kinds_have_stable_strings() {
        assert_eq!(MetricKind::LoginAttempt.as_str(), "login_attempt");
        assert_eq!(MetricKind::RateLimitBlock.as_str(), "rate_limit_block");
    }

    #[test]
    fn metrics_count_per_server_and_kind() {
        let metrics = AuthMetrics::new();
        metrics.record("a", MetricKind::LoginAttempt);
        metrics.record("a", MetricKind::LoginAttempt);
        metrics.record("b", MetricKind::LoginAttempt);
        assert_eq!(metrics.count("a", MetricKind::LoginAttempt), 2);
        assert_eq!(metrics.count("b", MetricKind::LoginAttempt), 1);
        assert_eq!(metrics.count("a", MetricKind::LoginSuccess), 0);
    }

    #[test]
    fn server_arg_rejects_missing_argument() {
        let request = CallToolRequest {
            name: "auth_login".to_string(),
            arguments: None,
        };
        assert!(server_arg(&request).is_err());
    }

    #[test]
    fn server_arg_extracts_string() {
        let mut args = HashMap::new();
        args.insert("server".to_string(), json!("srv"));
        let request = CallToolRequest {
            name: "auth_login".to_string(),
            arguments: Some(args),
        };
        assert_eq!(server_arg(&request).unwrap(), "srv");
    }
}
