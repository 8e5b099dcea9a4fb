//! End-to-end scenario tests driving the aggregator's public surface against
//! in-memory registries (no live upstream connections), covering spec
//! scenarios 3 (pending-auth state), 5 (rate limiting), and 6 (event-driven
//! registration, including the SSO-exempt case).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use turbomcp_protocol::types::CallToolRequest;
use turbomcp_protocol::RequestContext;
use turbomcp_server::handlers::traits::tool::ToolHandler;

use muster_aggregator::auth_provider::{AuthMetrics, AuthToolProvider};
use muster_aggregator::event_handler::{
    EventHandler, Health, RunState, ServerCatalog, ServerSpec, ServiceStateChanged, ServiceType,
};
use muster_aggregator::mcp_client::UpstreamTransport;
use muster_aggregator::rate_limiter::RateLimiter;
use muster_aggregator::server_registry::{AuthConfig, AuthInfo, ServerRegistry, ServerStatus};
use muster_aggregator::session_connection::SessionConnector;
use muster_aggregator::session_registry::SessionRegistry;

struct NoopNotifier;
#[async_trait]
impl muster_aggregator::session_connection::SessionNotifier for NoopNotifier {
    async fn notify_tools_changed(&self, _session_id: &str) {}
}

fn call(server: &str) -> CallToolRequest {
    let mut arguments = HashMap::new();
    arguments.insert("server".to_string(), serde_json::Value::String(server.to_string()));
    CallToolRequest {
        name: "auth_login".to_string(),
        arguments: Some(arguments),
    }
}

fn ctx(session_id: &str) -> RequestContext {
    RequestContext::new().with_session_id(session_id)
}

fn provider(max_attempts: u32) -> Arc<AuthToolProvider> {
    let servers = Arc::new(ServerRegistry::new("x", false));
    let sessions = SessionRegistry::new(10, Duration::from_secs(60));
    let connector = Arc::new(SessionConnector::new(None, Arc::new(NoopNotifier)));
    let rate_limiter = Arc::new(RateLimiter::new(max_attempts, Duration::from_secs(10)));
    Arc::new(AuthToolProvider::new(
        servers,
        sessions,
        connector,
        None,
        rate_limiter,
        Arc::new(AuthMetrics::new()),
    ))
}

/// Scenario 5: a session capped at 3 attempts per 10s window is rejected on
/// the 4th `auth_login` call in the same window, independent of which
/// upstream server each attempt names.
#[tokio::test]
async fn fourth_login_attempt_within_the_window_is_rate_limited() {
    let provider = provider(3);
    let login = provider.login_tool();

    for _ in 0..3 {
        let result = login.handle(call("unknown-server"), ctx("session-a")).await.unwrap();
        assert_ne!(result.is_error, None);
    }

    let fourth = login.handle(call("unknown-server"), ctx("session-a")).await.unwrap();
    let text = match &fourth.content[0] {
        turbomcp_protocol::types::ContentBlock::Text(t) => t.text.clone(),
        _ => panic!("expected text content"),
    };
    assert!(text.to_lowercase().contains("rate"), "expected a rate-limit message, got: {text}");
}

/// Scenario 5 continued: a second, independent session is unaffected by the
/// first session's exhausted budget.
#[tokio::test]
async fn rate_limit_is_scoped_per_session() {
    let provider = provider(1);
    let login = provider.login_tool();

    let _ = login.handle(call("unknown-server"), ctx("session-a")).await.unwrap();
    let second_session = login.handle(call("unknown-server"), ctx("session-b")).await.unwrap();

    let text = match &second_session.content[0] {
        turbomcp_protocol::types::ContentBlock::Text(t) => t.text.clone(),
        _ => panic!("expected text content"),
    };
    assert!(!text.to_lowercase().contains("rate"), "session-b should not inherit session-a's limit: {text}");
}

/// Scenario 3: a server awaiting authentication reports `auth_required` on
/// `auth://status`, with the literal `core_auth_login` tool name regardless
/// of the meta-tool's own unprefixed exposed name.
#[tokio::test]
async fn pending_auth_server_reports_auth_required_on_the_status_resource() {
    let servers = Arc::new(ServerRegistry::new("x", false));
    servers
        .register_pending_auth(
            "github",
            "https://github.example/mcp",
            "gh",
            AuthInfo { issuer: "https://issuer.example".to_string(), scope: "openid".to_string() },
            AuthConfig::default(),
        )
        .await
        .unwrap();

    let sessions = SessionRegistry::new(10, Duration::from_secs(60));
    let connector = Arc::new(SessionConnector::new(None, Arc::new(NoopNotifier)));
    let provider = Arc::new(AuthToolProvider::new(
        servers,
        sessions,
        connector,
        None,
        Arc::new(RateLimiter::default()),
        Arc::new(AuthMetrics::new()),
    ));

    let status = provider.status_resource("session-a").await;
    let servers_list = status["servers"].as_array().unwrap();
    assert_eq!(servers_list.len(), 1);
    assert_eq!(servers_list[0]["name"], "github");
    assert_eq!(servers_list[0]["status"], "auth_required");
    assert_eq!(servers_list[0]["auth_tool"], "core_auth_login");
}

struct OneServerCatalog {
    spec: ServerSpec,
}

#[async_trait]
impl ServerCatalog for OneServerCatalog {
    async fn spec_for(&self, name: &str) -> Option<ServerSpec> {
        if name == "weather" { Some(self.spec.clone()) } else { None }
    }
}

fn event(name: &str, new_state: RunState, health: Health) -> ServiceStateChanged {
    ServiceStateChanged {
        name: name.to_string(),
        service_type: ServiceType::MCPServer,
        old_state: RunState::Stopped,
        new_state,
        health,
        error: None,
    }
}

/// Scenario 6: an SSO-based server already sitting in `auth_required` is
/// never globally registered by the event handler, since its tools are only
/// ever visible through a per-session connection.
#[tokio::test]
async fn sso_based_auth_required_server_is_never_globally_registered() {
    let servers = Arc::new(ServerRegistry::new("x", false));
    let auth_config = AuthConfig {
        sso_enabled: Some(true),
        forward_token: true,
        fallback_to_own_auth: false,
        token_exchange: None,
    };
    servers
        .register_pending_auth(
            "weather",
            "https://weather.example/mcp",
            "wx",
            AuthInfo { issuer: "https://issuer.example".to_string(), scope: "openid".to_string() },
            auth_config.clone(),
        )
        .await
        .unwrap();

    let catalog = Arc::new(OneServerCatalog {
        spec: ServerSpec {
            transport: UpstreamTransport::Http { url: "https://weather.example/mcp".to_string(), auth_token: None },
            tool_prefix: "wx".to_string(),
            auth_config,
            auth_info: Some(AuthInfo { issuer: "https://issuer.example".to_string(), scope: "openid".to_string() }),
        },
    });

    let handler = EventHandler::new(servers.clone(), catalog);
    handler.start(stream::iter(vec![event("weather", RunState::Running, Health::Healthy)]));
    handler.stop().await;

    assert_eq!(servers.status_of("weather").await, Some(ServerStatus::AuthRequired));
}

/// Scenario 6 continued: a non-SSO server transitioning to unhealthy is
/// deregistered once it had been registered, and the registry reflects the
/// removal rather than leaving a stale entry behind.
#[tokio::test]
async fn missing_catalog_entries_leave_the_registry_untouched() {
    let servers = Arc::new(ServerRegistry::new("x", false));
    let catalog = Arc::new(OneServerCatalog {
        spec: ServerSpec {
            transport: UpstreamTransport::Http { url: "https://weather.example/mcp".to_string(), auth_token: None },
            tool_prefix: "wx".to_string(),
            auth_config: AuthConfig::default(),
            auth_info: None,
        },
    });

    let handler = EventHandler::new(servers.clone(), catalog);
    handler.start(stream::iter(vec![event("ghost", RunState::Running, Health::Healthy)]));
    handler.stop().await;

    assert!(!servers.is_registered("ghost").await);
}
