//! Upstream server registry: lifecycle, capability cache, name resolution (C2).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};
use turbomcp_protocol::types::{Prompt, Resource, Tool, ToolInputSchema};

use crate::denylist;
use crate::error::{AggregatorError, AggregatorResult};
use crate::mcp_client::UpstreamClient;
use crate::name_tracker::{ItemKind, NameTracker};
use crate::session_registry::{ConnectionStatus, SessionRegistry};

const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(2);
const SYNTHETIC_AUTH_TOOL: &str = "authenticate";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Connected,
    AuthRequired,
    Disconnected,
    Unreachable,
}

/// OAuth issuer/scope the server requires, set only while `status=auth_required`.
#[derive(Debug, Clone)]
pub struct AuthInfo {
    pub issuer: String,
    pub scope: String,
}

#[derive(Debug, Clone)]
pub struct TokenExchangeConfig {
    pub dex_token_endpoint: String,
    pub connector_id: String,
    pub enabled: bool,
}

/// Per-server SSO policy, carried unchanged through event-driven registration.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub sso_enabled: Option<bool>,
    pub forward_token: bool,
    pub fallback_to_own_auth: bool,
    pub token_exchange: Option<TokenExchangeConfig>,
}

impl AuthConfig {
    pub fn is_sso_based(&self) -> bool {
        self.forward_token || self.token_exchange.as_ref().is_some_and(|t| t.enabled)
    }
}

struct ServerEntry {
    name: String,
    url: String,
    tool_prefix: String,
    status: ServerStatus,
    auth_info: Option<AuthInfo>,
    auth_config: AuthConfig,
    client: Option<Arc<UpstreamClient>>,
    tools: Vec<Tool>,
    resources: Vec<Resource>,
    prompts: Vec<Prompt>,
}

impl ServerEntry {
    fn prefix_or_name(&self) -> &str {
        if self.tool_prefix.is_empty() {
            &self.name
        } else {
            &self.tool_prefix
        }
    }
}

fn synthetic_authenticate_tool() -> Tool {
    Tool {
        name: SYNTHETIC_AUTH_TOOL.to_string(),
        title: Some("Authenticate".to_string()),
        description: Some("Begin OAuth sign-in for this upstream server".to_string()),
        input_schema: ToolInputSchema {
            schema_type: "object".to_string(),
            properties: None,
            required: None,
            additional_properties: Some(false),
        },
        output_schema: None,
    }
}

/// Update signal published on registration changes; receivers drain a
/// capacity-1 channel so bursts coalesce into one capability-delta cycle.
pub struct UpdateChannel {
    tx: mpsc::Sender<()>,
    rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl UpdateChannel {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    fn notify(&self) {
        // try_send on a capacity-1 channel: a pending signal means a delta
        // cycle will already observe the latest state, so failure is fine.
        let _ = self.tx.try_send(());
    }

    pub async fn recv(&self) -> Option<()> {
        self.rx.lock().await.recv().await
    }
}

/// Registry of federated upstream servers.
pub struct ServerRegistry {
    entries: RwLock<HashMap<String, Arc<RwLock<ServerEntry>>>>,
    names: NameTracker,
    global_prefix: String,
    yolo: bool,
    updates: Arc<UpdateChannel>,
}

impl ServerRegistry {
    pub fn new(global_prefix: impl Into<String>, yolo: bool) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            names: NameTracker::new(),
            global_prefix: global_prefix.into(),
            yolo,
            updates: Arc::new(UpdateChannel::new()),
        }
    }

    pub fn updates(&self) -> Arc<UpdateChannel> {
        self.updates.clone()
    }

    pub fn names(&self) -> &NameTracker {
        &self.names
    }

    /// Registers a connected upstream. Rejects duplicate names; initialize is
    /// best-effort and bounded by a short timeout; tool listing is mandatory
    /// for a non-empty cache but its failure does not fail registration;
    /// resources/prompts are optional and only logged on failure.
    pub async fn register(
        &self,
        name: &str,
        client: Arc<UpstreamClient>,
        tool_prefix: &str,
    ) -> AggregatorResult<()> {
        {
            let entries = self.entries.read().await;
            if entries.contains_key(name) {
                return Err(AggregatorError::DuplicateServer(name.to_string()));
            }
        }

        if let Err(e) = client.initialize(INITIALIZE_TIMEOUT).await {
            warn!(server = %name, error = %e, "upstream initialize failed, registering anyway");
        }

        let tools = client.list_tools().await.unwrap_or_else(|e| {
            warn!(server = %name, error = %e, "list_tools failed, cache stays empty");
            Vec::new()
        });
        let resources = client.list_resources().await.unwrap_or_else(|e| {
            debug!(server = %name, error = %e, "list_resources failed");
            Vec::new()
        });
        let prompts = client.list_prompts().await.unwrap_or_else(|e| {
            debug!(server = %name, error = %e, "list_prompts failed");
            Vec::new()
        });

        let entry = ServerEntry {
            name: name.to_string(),
            url: String::new(),
            tool_prefix: tool_prefix.to_string(),
            status: ServerStatus::Connected,
            auth_info: None,
            auth_config: AuthConfig::default(),
            client: Some(client),
            tools,
            resources,
            prompts,
        };

        self.install_names(&entry).await;

        let mut entries = self.entries.write().await;
        entries.insert(name.to_string(), Arc::new(RwLock::new(entry)));
        drop(entries);

        self.updates.notify();
        Ok(())
    }

    /// Registers a server that requires per-session OAuth before any global
    /// client exists. Exposes exactly one synthetic `authenticate` tool.
    pub async fn register_pending_auth(
        &self,
        name: &str,
        url: &str,
        tool_prefix: &str,
        auth_info: AuthInfo,
        auth_config: AuthConfig,
    ) -> AggregatorResult<()> {
        {
            let entries = self.entries.read().await;
            if entries.contains_key(name) {
                return Err(AggregatorError::DuplicateServer(name.to_string()));
            }
        }

        let entry = ServerEntry {
            name: name.to_string(),
            url: url.to_string(),
            tool_prefix: tool_prefix.to_string(),
            status: ServerStatus::AuthRequired,
            auth_info: Some(auth_info),
            auth_config,
            client: None,
            tools: vec![synthetic_authenticate_tool()],
            resources: Vec::new(),
            prompts: Vec::new(),
        };

        self.install_names(&entry).await;

        let mut entries = self.entries.write().await;
        entries.insert(name.to_string(), Arc::new(RwLock::new(entry)));
        drop(entries);

        self.updates.notify();
        Ok(())
    }

    /// Swaps in a real client for a previously pending-auth server.
    pub async fn upgrade_to_connected(
        &self,
        name: &str,
        client: Arc<UpstreamClient>,
    ) -> AggregatorResult<()> {
        let entries = self.entries.read().await;
        let entry_lock = entries
            .get(name)
            .ok_or_else(|| AggregatorError::ServerNotFound(name.to_string()))?
            .clone();
        drop(entries);

        let mut entry = entry_lock.write().await;
        if entry.status != ServerStatus::AuthRequired {
            return Err(AggregatorError::ServerNotFound(name.to_string()));
        }

        let tools = client.list_tools().await.unwrap_or_default();
        let resources = client.list_resources().await.unwrap_or_default();
        let prompts = client.list_prompts().await.unwrap_or_default();

        entry.client = Some(client);
        entry.status = ServerStatus::Connected;
        entry.auth_info = None;
        entry.tools = tools;
        entry.resources = resources;
        entry.prompts = prompts;
        let prefix = entry.prefix_or_name().to_string();
        drop(entry);

        let entry = entry_lock.read().await;
        self.reinstall_names(&entry, &prefix).await;
        drop(entry);

        self.updates.notify();
        Ok(())
    }

    /// Closes the client (if any), removes the entry and its names.
    pub async fn deregister(&self, name: &str) -> AggregatorResult<()> {
        let removed = {
            let mut entries = self.entries.write().await;
            entries.remove(name)
        };

        let entry_lock = removed.ok_or_else(|| AggregatorError::ServerNotFound(name.to_string()))?;
        let entry = entry_lock.read().await;
        if let Some(client) = &entry.client {
            client.close().await;
        }
        drop(entry);

        self.names.unregister_server(name).await;
        self.updates.notify();
        Ok(())
    }

    async fn install_names(&self, entry: &ServerEntry) {
        let prefix = entry.prefix_or_name().to_string();
        for tool in &entry.tools {
            self.names
                .register(&self.global_prefix, &entry.name, &prefix, &tool.name, ItemKind::Tool)
                .await;
        }
        for resource in &entry.resources {
            self.names
                .register(
                    &self.global_prefix,
                    &entry.name,
                    &prefix,
                    &resource.name,
                    ItemKind::Resource,
                )
                .await;
        }
        for prompt in &entry.prompts {
            self.names
                .register(&self.global_prefix, &entry.name, &prefix, &prompt.name, ItemKind::Prompt)
                .await;
        }
    }

    async fn reinstall_names(&self, entry: &ServerEntry, prefix: &str) {
        self.names.unregister_server(&entry.name).await;
        self.install_names(entry).await;
        let _ = prefix;
    }

    /// Prefixed tool view over every connected server.
    pub async fn get_all_tools(&self) -> Vec<(String, bool)> {
        let entries = self.entries.read().await;
        let mut out = Vec::new();
        for entry_lock in entries.values() {
            let entry = entry_lock.read().await;
            if entry.status != ServerStatus::Connected {
                continue;
            }
            let prefix = entry.prefix_or_name().to_string();
            for tool in &entry.tools {
                let exposed = self
                    .names
                    .register(&self.global_prefix, &entry.name, &prefix, &tool.name, ItemKind::Tool)
                    .await;
                let blocked = denylist::is_blocked(&tool.name, self.yolo);
                out.push((exposed, blocked));
            }
        }
        out
    }

    pub async fn get_all_resources(&self) -> Vec<String> {
        self.collect_exposed(|e| e.resources.iter().map(|r| r.name.clone()).collect(), ItemKind::Resource)
            .await
    }

    pub async fn get_all_prompts(&self) -> Vec<String> {
        self.collect_exposed(|e| e.prompts.iter().map(|p| p.name.clone()).collect(), ItemKind::Prompt)
            .await
    }

    async fn collect_exposed(
        &self,
        extract: impl Fn(&ServerEntry) -> Vec<String>,
        kind: ItemKind,
    ) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut out = Vec::new();
        for entry_lock in entries.values() {
            let entry = entry_lock.read().await;
            if entry.status != ServerStatus::Connected {
                continue;
            }
            let prefix = entry.prefix_or_name().to_string();
            for name in extract(&entry) {
                let exposed = self
                    .names
                    .register(&self.global_prefix, &entry.name, &prefix, &name, kind)
                    .await;
                out.push(exposed);
            }
        }
        out
    }

    /// Per-session tool view: for `auth_required` servers, the session's own
    /// connection tools if upgraded, else the synthetic `authenticate` tool;
    /// for `connected` servers, the entry's cached tools.
    pub async fn get_all_tools_for_session(
        &self,
        session_id: &str,
        sessions: &SessionRegistry,
    ) -> Vec<(String, bool)> {
        let entries = self.entries.read().await;
        let mut out = Vec::new();
        for entry_lock in entries.values() {
            let entry = entry_lock.read().await;
            let prefix = entry.prefix_or_name().to_string();

            match entry.status {
                ServerStatus::Connected => {
                    for tool in &entry.tools {
                        let exposed = self
                            .names
                            .register(&self.global_prefix, &entry.name, &prefix, &tool.name, ItemKind::Tool)
                            .await;
                        out.push((exposed, denylist::is_blocked(&tool.name, self.yolo)));
                    }
                }
                ServerStatus::AuthRequired => {
                    let upgraded = sessions
                        .get_connection(session_id, &entry.name)
                        .await
                        .ok()
                        .flatten()
                        .filter(|c| c.status == ConnectionStatus::Connected);

                    if let Some(conn) = upgraded {
                        for name in &conn.capabilities.tools {
                            let exposed = self
                                .names
                                .register(&self.global_prefix, &entry.name, &prefix, name, ItemKind::Tool)
                                .await;
                            out.push((exposed, false));
                        }
                    } else {
                        let exposed = self
                            .names
                            .register(
                                &self.global_prefix,
                                &entry.name,
                                &prefix,
                                SYNTHETIC_AUTH_TOOL,
                                ItemKind::Tool,
                            )
                            .await;
                        out.push((exposed, false));
                    }
                }
                ServerStatus::Disconnected | ServerStatus::Unreachable => {}
            }
        }
        out
    }

    pub async fn resolve_tool(&self, exposed: &str) -> AggregatorResult<(String, String)> {
        self.names
            .resolve_tool(exposed)
            .await
            .map_err(|_| AggregatorError::ToolNotFound(exposed.to_string()))
    }

    pub async fn resolve_resource(&self, exposed: &str) -> AggregatorResult<(String, String)> {
        self.names
            .resolve_resource(exposed)
            .await
            .map_err(|_| AggregatorError::ServerNotFound(exposed.to_string()))
    }

    pub async fn resolve_prompt(&self, exposed: &str) -> AggregatorResult<(String, String)> {
        self.names
            .resolve_prompt(exposed)
            .await
            .map_err(|_| AggregatorError::ServerNotFound(exposed.to_string()))
    }

    /// Looks up a server's client for dispatching a resolved tool call.
    pub async fn client_for(&self, server: &str) -> Option<Arc<UpstreamClient>> {
        let entries = self.entries.read().await;
        let entry_lock = entries.get(server)?;
        let entry = entry_lock.read().await;
        entry.client.clone()
    }

    pub async fn url_of(&self, server: &str) -> Option<String> {
        let entries = self.entries.read().await;
        let entry_lock = entries.get(server)?;
        let entry = entry_lock.read().await;
        Some(entry.url.clone())
    }

    pub async fn status_of(&self, server: &str) -> Option<ServerStatus> {
        let entries = self.entries.read().await;
        let entry_lock = entries.get(server)?;
        Some(entry_lock.read().await.status)
    }

    pub async fn auth_info_of(&self, server: &str) -> Option<(AuthInfo, AuthConfig)> {
        let entries = self.entries.read().await;
        let entry_lock = entries.get(server)?;
        let entry = entry_lock.read().await;
        entry
            .auth_info
            .clone()
            .map(|info| (info, entry.auth_config.clone()))
    }

    pub async fn is_registered(&self, server: &str) -> bool {
        self.entries.read().await.contains_key(server)
    }

    pub async fn server_names(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn connected_count(&self) -> usize {
        let entries = self.entries.read().await;
        let mut count = 0;
        for entry_lock in entries.values() {
            if entry_lock.read().await.status == ServerStatus::Connected {
                count += 1;
            }
        }
        count
    }

    pub async fn total_count(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_pending_auth_exposes_only_the_authenticate_tool() {
        let registry = ServerRegistry::new("x", false);
        registry
            .register_pending_auth(
                "srv",
                "https://srv",
                "",
                AuthInfo {
                    issuer: "https://issuer".to_string(),
                    scope: "openid".to_string(),
                },
                AuthConfig::default(),
            )
            .await
            .unwrap();

        let sessions = SessionRegistry::new(10, Duration::from_secs(60));
        let tools = registry.get_all_tools_for_session("s1", &sessions).await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].0, "x_srv_authenticate");
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let registry = ServerRegistry::new("x", false);
        registry
            .register_pending_auth(
                "srv",
                "https://srv",
                "",
                AuthInfo {
                    issuer: "i".to_string(),
                    scope: "s".to_string(),
                },
                AuthConfig::default(),
            )
            .await
            .unwrap();

        let result = registry
            .register_pending_auth(
                "srv",
                "https://srv",
                "",
                AuthInfo {
                    issuer: "i".to_string(),
                    scope: "s".to_string(),
                },
                AuthConfig::default(),
            )
            .await;
        assert!(matches!(result, Err(AggregatorError::DuplicateServer(_))));
    }

    #[tokio::test]
    async fn deregister_removes_names() {
        let registry = ServerRegistry::new("x", false);
        registry
            .register_pending_auth(
                "srv",
                "https://srv",
                "",
                AuthInfo {
                    issuer: "i".to_string(),
                    scope: "s".to_string(),
                },
                AuthConfig::default(),
            )
            .await
            .unwrap();
        registry.deregister("srv").await.unwrap();
        assert!(registry.resolve_tool("x_srv_authenticate").await.is_err());
        assert!(registry.deregister("srv").await.is_err());
    }
}
