//! Bidirectional exposed-name mapping for federated tools/resources/prompts (L2).

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// The kind of item an exposed name resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Tool,
    Resource,
    Prompt,
}

/// Workflow management tool names that keep the `core_workflow_` prefix
/// rather than being rewritten to `workflow_<name>` / routed to `action_<name>`.
/// Small and fixed by contract, not discovered.
pub const WORKFLOW_MANAGEMENT_TOOLS: &[&str] = &[
    "list",
    "get",
    "create",
    "update",
    "delete",
    "validate",
    "available",
    "execution_list",
    "execution_get",
];

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("exposed name '{0}' is not registered")]
    NotFound(String),
    #[error("exposed name '{0}' resolves to a {actual:?}, not the requested kind", actual = .1)]
    KindMismatch(String, ItemKind),
}

type Key = (String, String, ItemKind);

#[derive(Debug, Default)]
struct Inner {
    forward: HashMap<Key, String>,
    reverse: HashMap<String, Key>,
    prefixes: HashMap<String, String>,
}

/// Tracks the bidirectional map between `(server, original_name, kind)` and
/// the unique exposed name clients see.
#[derive(Debug, Clone, Default)]
pub struct NameTracker {
    inner: Arc<RwLock<Inner>>,
}

fn compute_exposed(global_prefix: &str, server_prefix: &str, name: &str) -> String {
    format!("{global_prefix}_{server_prefix}_{name}")
}

impl NameTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one item, computing and storing its exposed name. Returns the
    /// exposed name. `server_prefix` should be the server's configured
    /// `tool_prefix`, falling back to its `name` when empty.
    pub async fn register(
        &self,
        global_prefix: &str,
        server: &str,
        server_prefix: &str,
        name: &str,
        kind: ItemKind,
    ) -> String {
        let exposed = compute_exposed(global_prefix, server_prefix, name);
        let key = (server.to_string(), name.to_string(), kind);

        let mut inner = self.inner.write().await;
        inner.prefixes.insert(server.to_string(), server_prefix.to_string());
        if let Some(old) = inner.forward.insert(key.clone(), exposed.clone()) {
            inner.reverse.remove(&old);
        }
        inner.reverse.insert(exposed.clone(), key);
        exposed
    }

    /// Removes every item belonging to `server`.
    pub async fn unregister_server(&self, server: &str) {
        let mut inner = self.inner.write().await;
        inner.prefixes.remove(server);
        let stale: Vec<Key> = inner
            .forward
            .keys()
            .filter(|(s, _, _)| s == server)
            .cloned()
            .collect();
        for key in stale {
            if let Some(exposed) = inner.forward.remove(&key) {
                inner.reverse.remove(&exposed);
            }
        }
    }

    /// Atomically rewrites every exposed name belonging to `server` to use
    /// `new_prefix` instead of its previous prefix.
    pub async fn change_prefix(&self, global_prefix: &str, server: &str, new_prefix: &str) {
        let mut inner = self.inner.write().await;
        inner.prefixes.insert(server.to_string(), new_prefix.to_string());

        let keys: Vec<Key> = inner
            .forward
            .keys()
            .filter(|(s, _, _)| s == server)
            .cloned()
            .collect();

        for key in keys {
            let (_, name, _) = &key;
            if let Some(old_exposed) = inner.forward.remove(&key) {
                inner.reverse.remove(&old_exposed);
            }
            let new_exposed = compute_exposed(global_prefix, new_prefix, name);
            inner.forward.insert(key.clone(), new_exposed.clone());
            inner.reverse.insert(new_exposed, key);
        }
    }

    /// Resolves an exposed name to its `(server, original, kind)` triple.
    pub async fn resolve(&self, exposed: &str) -> Result<(String, String, ItemKind), ResolveError> {
        let inner = self.inner.read().await;
        inner
            .reverse
            .get(exposed)
            .cloned()
            .map(|(server, name, kind)| (server, name, kind))
            .ok_or_else(|| ResolveError::NotFound(exposed.to_string()))
    }

    pub async fn resolve_tool(&self, exposed: &str) -> Result<(String, String), ResolveError> {
        self.resolve_kind(exposed, ItemKind::Tool).await
    }

    pub async fn resolve_resource(&self, exposed: &str) -> Result<(String, String), ResolveError> {
        self.resolve_kind(exposed, ItemKind::Resource).await
    }

    pub async fn resolve_prompt(&self, exposed: &str) -> Result<(String, String), ResolveError> {
        self.resolve_kind(exposed, ItemKind::Prompt).await
    }

    async fn resolve_kind(
        &self,
        exposed: &str,
        expected: ItemKind,
    ) -> Result<(String, String), ResolveError> {
        let (server, name, kind) = self.resolve(exposed).await?;
        if kind != expected {
            return Err(ResolveError::KindMismatch(exposed.to_string(), kind));
        }
        Ok((server, name))
    }
}

/// Category of an internal (non-upstream) tool, used to compute its fixed
/// `core_*` exposed name per the workflow name-rewriting contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalCategory {
    ServerManagement,
    WorkflowManagement,
    Config,
    ServiceClass,
    McpServer,
    Auth,
    Events,
    /// A direct-execution workflow action tool (`action_*` from the provider).
    WorkflowAction,
}

/// Computes the exposed name for an internal tool. `original` is the name as
/// reported by the internal provider (e.g. `action_run_foo`, `list`, `login`).
pub fn internal_exposed_name(category: InternalCategory, original: &str) -> String {
    match category {
        InternalCategory::ServerManagement => format!("core_server_{original}"),
        InternalCategory::WorkflowManagement => format!("core_workflow_{original}"),
        InternalCategory::Config => format!("core_config_{original}"),
        InternalCategory::ServiceClass => format!("core_serviceclass_{original}"),
        InternalCategory::McpServer => format!("core_mcpserver_{original}"),
        InternalCategory::Auth => format!("core_auth_{original}"),
        InternalCategory::Events => "core_events".to_string(),
        InternalCategory::WorkflowAction => {
            if let Some(action) = original.strip_prefix("action_") {
                format!("workflow_{action}")
            } else if WORKFLOW_MANAGEMENT_TOOLS.contains(&original) {
                format!("core_workflow_{original}")
            } else {
                format!("core_{original}")
            }
        }
    }
}

/// Given an exposed `workflow_X` tool name, returns the provider-facing
/// `action_X` name — but only when `X` is not a workflow management tool
/// name, matching the routing contract in `aggregator::call_tool_internal`.
pub fn workflow_exposed_to_action(exposed: &str) -> Option<String> {
    let x = exposed.strip_prefix("workflow_")?;
    if WORKFLOW_MANAGEMENT_TOOLS.contains(&x) {
        None
    } else {
        Some(format!("action_{x}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_resolve_round_trip() {
        let tracker = NameTracker::new();
        let exposed = tracker.register("x", "a", "a", "t1", ItemKind::Tool).await;
        assert_eq!(exposed, "x_a_t1");
        let (server, name, kind) = tracker.resolve(&exposed).await.unwrap();
        assert_eq!(server, "a");
        assert_eq!(name, "t1");
        assert_eq!(kind, ItemKind::Tool);
    }

    #[tokio::test]
    async fn distinct_servers_produce_distinct_exposed_names() {
        let tracker = NameTracker::new();
        let e1 = tracker.register("x", "a", "", "t1", ItemKind::Tool).await;
        let e2 = tracker.register("x", "bb", "bb", "t1", ItemKind::Tool).await;
        assert_ne!(e1, e2);
    }

    #[tokio::test]
    async fn unregister_server_drops_all_its_names() {
        let tracker = NameTracker::new();
        let exposed = tracker.register("x", "a", "a", "t1", ItemKind::Tool).await;
        tracker.unregister_server("a").await;
        assert!(tracker.resolve(&exposed).await.is_err());
    }

    #[tokio::test]
    async fn kind_mismatch_is_an_error() {
        let tracker = NameTracker::new();
        let exposed = tracker.register("x", "a", "a", "t1", ItemKind::Tool).await;
        assert!(tracker.resolve_resource(&exposed).await.is_err());
        assert!(tracker.resolve_tool(&exposed).await.is_ok());
    }

    #[tokio::test]
    async fn change_prefix_rewrites_all_names() {
        let tracker = NameTracker::new();
        let old = tracker.register("x", "a", "a", "t1", ItemKind::Tool).await;
        tracker.change_prefix("x", "a", "aa").await;
        assert!(tracker.resolve(&old).await.is_err());
        let (server, name, _) = tracker.resolve("x_aa_t1").await.unwrap();
        assert_eq!(server, "a");
        assert_eq!(name, "t1");
    }

    #[test]
    fn workflow_action_rewriting() {
        assert_eq!(
            internal_exposed_name(InternalCategory::WorkflowAction, "action_run_foo"),
            "workflow_run_foo"
        );
        assert_eq!(
            internal_exposed_name(InternalCategory::WorkflowAction, "list"),
            "core_workflow_list"
        );
    }

    #[test]
    fn workflow_exposed_to_action_skips_management_tools() {
        assert_eq!(
            workflow_exposed_to_action("workflow_run_foo"),
            Some("action_run_foo".to_string())
        );
        assert_eq!(workflow_exposed_to_action("workflow_list"), None);
    }
}
