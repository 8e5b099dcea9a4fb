//! Owns both registries, the MCP server boundary, capability deltas, and
//! internal tool routing (C6).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use turbomcp_protocol::types::CallToolResult;

use crate::active_items::ActiveItemManager;
use crate::auth_provider::AuthToolProvider;
use crate::denylist;
use crate::error::{AggregatorError, AggregatorResult};
use crate::name_tracker::{self, ItemKind};
use crate::server_registry::{ServerRegistry, ServerStatus};
use crate::session_registry::SessionRegistry;

const STOP_BUDGET: Duration = Duration::from_secs(5);

/// Fixed meta-tools every session sees regardless of its own connections,
/// unioned with its session-scoped tools by the tool filter.
pub const CORE_META_TOOLS: &[&str] = &[
    "list_tools",
    "call_tool",
    "describe_tool",
    "auth_login",
    "auth_logout",
];

/// Boundary to the MCP wire protocol/server object, an external collaborator
/// by design (the protocol library, transports, and capability plumbing are
/// out of scope here).
#[async_trait]
pub trait McpServerHandle: Send + Sync {
    /// Installs the per-request session tool filter; called once at start.
    async fn install_session_filter(&self);

    /// Applies a batch of tool additions/removals. Removals are always
    /// passed in the same call as their corresponding additions, already
    /// ordered removals-then-additions by the caller.
    async fn apply_tool_delta(&self, additions: &[String], removals: &[String]);
    async fn apply_resource_delta(&self, additions: &[String], removals: &[String]);
    async fn apply_prompt_delta(&self, additions: &[String], removals: &[String]);

    /// Publishes a tool-update event with the full current tool name list.
    async fn publish_tool_update(&self, tool_names: &[String]);

    /// Sends `tools/list_changed` to one session.
    async fn notify_session_tools_changed(&self, session_id: &str);

    /// Shuts down whichever transport is active, bounded by `budget`.
    async fn shutdown(&self, budget: Duration);
}

/// Resolves and invokes `core_*`/`workflow_*` tools this crate does not
/// itself implement (workflow/service/config/serviceclass/mcpserver/events
/// managers) — external tool providers per the documented non-goals.
#[async_trait]
pub trait ExternalToolProvider: Send + Sync {
    /// The fixed prefix this provider answers for, e.g. `"core_workflow_"` or
    /// `"workflow_"` for direct action execution.
    fn prefix(&self) -> &'static str;
    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<HashMap<String, serde_json::Value>>,
    ) -> AggregatorResult<CallToolResult>;
}

const CORE_PREFIXES: &[&str] = &[
    "core_workflow_",
    "core_service_",
    "core_config_",
    "core_serviceclass_",
    "core_mcpserver_",
    "core_events",
    "core_auth_",
];

struct Lifecycle {
    delta_task: Option<JoinHandle<()>>,
}

/// The federation and session-auth engine's top-level object.
pub struct AggregatorCore {
    pub servers: Arc<ServerRegistry>,
    pub sessions: Arc<SessionRegistry>,
    pub auth: Arc<AuthToolProvider>,
    active_items: ActiveItemManager,
    mcp: Arc<dyn McpServerHandle>,
    providers: Vec<Arc<dyn ExternalToolProvider>>,
    yolo: bool,
    shutting_down: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
}

impl AggregatorCore {
    pub fn new(
        servers: Arc<ServerRegistry>,
        sessions: Arc<SessionRegistry>,
        auth: Arc<AuthToolProvider>,
        mcp: Arc<dyn McpServerHandle>,
        providers: Vec<Arc<dyn ExternalToolProvider>>,
        yolo: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            servers,
            sessions,
            auth,
            active_items: ActiveItemManager::new(),
            mcp,
            providers,
            yolo,
            shutting_down: AtomicBool::new(false),
            lifecycle: Mutex::new(Lifecycle { delta_task: None }),
        })
    }

    /// Installs the session tool filter and launches the registry-update
    /// monitor. Releases no internal lock across the first delta cycle
    /// beyond the brief one guarding `lifecycle.delta_task`.
    pub async fn start(self: &Arc<Self>) {
        self.mcp.install_session_filter().await;

        let this = self.clone();
        let updates = self.servers.updates();
        let task = tokio::spawn(async move {
            this.run_delta_monitor(updates).await;
        });

        let mut lifecycle = self.lifecycle.lock().await;
        lifecycle.delta_task = Some(task);
        drop(lifecycle);

        // First cycle runs immediately so a fresh start doesn't wait for the
        // next registry change.
        self.run_capability_delta().await;
    }

    async fn run_delta_monitor(self: Arc<Self>, updates: Arc<crate::server_registry::UpdateChannel>) {
        while updates.recv().await.is_some() {
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            self.run_capability_delta().await;
        }
        debug!("registry-update monitor stopped");
    }

    /// Recomputes the exposed tool/resource/prompt sets from every connected
    /// upstream and applies removals before additions.
    pub async fn run_capability_delta(&self) {
        let tools = self.servers.get_all_tools().await;
        let tool_names: Vec<String> = tools.into_iter().map(|(name, _)| name).collect();
        let resources = self.servers.get_all_resources().await;
        let prompts = self.servers.get_all_prompts().await;

        let tool_delta = self.active_items.diff_and_commit(ItemKind::Tool, tool_names.clone()).await;
        let resource_delta = self.active_items.diff_and_commit(ItemKind::Resource, resources).await;
        let prompt_delta = self.active_items.diff_and_commit(ItemKind::Prompt, prompts).await;

        self.mcp.apply_tool_delta(&tool_delta.additions, &tool_delta.removals).await;
        self.mcp
            .apply_resource_delta(&resource_delta.additions, &resource_delta.removals)
            .await;
        self.mcp.apply_prompt_delta(&prompt_delta.additions, &prompt_delta.removals).await;

        self.mcp.publish_tool_update(&tool_names).await;
    }

    /// The session tool filter's computation: union of this session's
    /// visible upstream tools and the fixed core meta-tools.
    pub async fn tools_for_session(&self, session_id: &str) -> Vec<(String, bool)> {
        let mut tools = self.servers.get_all_tools_for_session(session_id, &self.sessions).await;
        for name in CORE_META_TOOLS {
            tools.push((name.to_string(), false));
        }
        tools
    }

    /// Routes a client-facing tool call: registry resolution first, then
    /// fixed core-tool prefixes, then `tool_not_found`.
    pub async fn call_tool_internal(
        &self,
        session_id: &str,
        exposed_name: &str,
        arguments: Option<HashMap<String, serde_json::Value>>,
    ) -> AggregatorResult<CallToolResult> {
        if let Ok((server, original)) = self.servers.resolve_tool(exposed_name).await {
            return self.call_upstream(session_id, &server, &original, arguments).await;
        }

        if let Some(action_name) = name_tracker::workflow_exposed_to_action(exposed_name) {
            if let Some(provider) = self.providers.iter().find(|p| p.prefix() == "workflow_") {
                return provider.call_tool(&action_name, arguments).await;
            }
        }

        for prefix in CORE_PREFIXES {
            if exposed_name.starts_with(prefix) {
                if let Some(provider) = self.providers.iter().find(|p| p.prefix() == *prefix) {
                    return provider.call_tool(exposed_name, arguments).await;
                }
            }
        }

        Err(AggregatorError::ToolNotFound(exposed_name.to_string()))
    }

    async fn call_upstream(
        &self,
        session_id: &str,
        server: &str,
        original: &str,
        arguments: Option<HashMap<String, serde_json::Value>>,
    ) -> AggregatorResult<CallToolResult> {
        if denylist::is_blocked(original, self.yolo) {
            return Err(AggregatorError::ToolBlocked(original.to_string()));
        }

        let status = self
            .servers
            .status_of(server)
            .await
            .ok_or_else(|| AggregatorError::ServerNotFound(server.to_string()))?;

        let client = match status {
            ServerStatus::Connected => self
                .servers
                .client_for(server)
                .await
                .ok_or_else(|| AggregatorError::ServerNotFound(server.to_string()))?,
            ServerStatus::AuthRequired => {
                let conn = self
                    .sessions
                    .get_connection(session_id, server)
                    .await?
                    .ok_or_else(|| AggregatorError::ConnectionNotFound {
                        session: session_id.to_string(),
                        server: server.to_string(),
                    })?;
                conn.client.ok_or_else(|| AggregatorError::ConnectionNotFound {
                    session: session_id.to_string(),
                    server: server.to_string(),
                })?
            }
            ServerStatus::Disconnected | ServerStatus::Unreachable => {
                return Err(AggregatorError::ServerNotFound(server.to_string()));
            }
        };

        client.call_tool(original, arguments).await
    }

    /// Idempotent shutdown: cancels the delta monitor, shuts down the
    /// transport within budget, deregisters every upstream, stops sessions.
    pub async fn stop(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        self.mcp.shutdown(STOP_BUDGET).await;

        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(task) = lifecycle.delta_task.take() {
            task.abort();
        }
        drop(lifecycle);

        for name in self.servers.server_names().await {
            if let Err(e) = self.servers.deregister(&name).await {
                warn!(server = %name, error = %e, "deregister during shutdown failed");
            }
        }

        self.sessions.stop().await;
        info!("aggregator core stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::RateLimiter;
    use crate::session_connection::{SessionConnector, SessionNotifier};
    use std::sync::atomic::AtomicUsize;

    struct NoopMcp {
        tool_deltas: AtomicUsize,
    }

    #[async_trait]
    impl McpServerHandle for NoopMcp {
        async fn install_session_filter(&self) {}
        async fn apply_tool_delta(&self, _a: &[String], _r: &[String]) {
            self.tool_deltas.fetch_add(1, Ordering::SeqCst);
        }
        async fn apply_resource_delta(&self, _a: &[String], _r: &[String]) {}
        async fn apply_prompt_delta(&self, _a: &[String], _r: &[String]) {}
        async fn publish_tool_update(&self, _names: &[String]) {}
        async fn notify_session_tools_changed(&self, _session_id: &str) {}
        async fn shutdown(&self, _budget: Duration) {}
    }

    struct NoopNotifier;
    #[async_trait]
    impl SessionNotifier for NoopNotifier {
        async fn notify_tools_changed(&self, _session_id: &str) {}
    }

    fn core() -> Arc<AggregatorCore> {
        let servers = Arc::new(ServerRegistry::new("x", false));
        let sessions = SessionRegistry::new(10, Duration::from_secs(60));
        let connector = Arc::new(SessionConnector::new(None, Arc::new(NoopNotifier)));
        let rate_limiter = Arc::new(RateLimiter::default());
        let metrics = Arc::new(crate::auth_provider::AuthMetrics::new());
        let auth = Arc::new(AuthToolProvider::new(
            servers.clone(),
            sessions.clone(),
            connector,
            None,
            rate_limiter,
            metrics,
        ));
        let mcp = Arc::new(NoopMcp { tool_deltas: AtomicUsize::new(0) });
        AggregatorCore::new(servers, sessions, auth, mcp, Vec::new(), false)
    }

    #[tokio::test]
    async fn unresolvable_tool_name_is_not_found() {
        let core = core();
        let result = core.call_tool_internal("s1", "x_srv_doesnotexist", None).await;
        assert!(matches!(result, Err(AggregatorError::ToolNotFound(_))));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let core = core();
        core.stop().await;
        core.stop().await;
        assert!(core.is_shutting_down());
    }

    #[tokio::test]
    async fn capability_delta_runs_without_upstreams() {
        let core = core();
        core.run_capability_delta().await;
        assert_eq!(core.servers.total_count().await, 0);
    }
}
