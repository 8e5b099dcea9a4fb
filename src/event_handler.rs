//! Reacts to external service lifecycle events by registering/deregistering
//! upstream servers in the global registry (C5).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mcp_client::{UpstreamClient, UpstreamClientConfig, UpstreamTransport};
use crate::server_registry::{AuthConfig, AuthInfo, ServerRegistry, ServerStatus};

/// The only service kind this handler acts on; everything else is filtered out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceType {
    MCPServer,
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Stopped,
    Starting,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ServiceStateChanged {
    pub name: String,
    pub service_type: ServiceType,
    pub old_state: RunState,
    pub new_state: RunState,
    pub health: Health,
    pub error: Option<String>,
}

/// What the event handler needs to know to dial a named server, supplied by
/// whatever owns the static/dynamic server configuration (the manager).
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub transport: UpstreamTransport,
    pub tool_prefix: String,
    pub auth_config: AuthConfig,
    pub auth_info: Option<AuthInfo>,
}

#[async_trait]
pub trait ServerCatalog: Send + Sync {
    async fn spec_for(&self, name: &str) -> Option<ServerSpec>;
}

/// Subscribes to a service-lifecycle stream and keeps the server registry in
/// sync. SSO-based, auth-required servers are skipped: they have no global
/// client, only per-session ones established by the auth tool provider.
pub struct EventHandler {
    registry: Arc<ServerRegistry>,
    catalog: Arc<dyn ServerCatalog>,
    cancel: CancellationToken,
    join: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl EventHandler {
    pub fn new(registry: Arc<ServerRegistry>, catalog: Arc<dyn ServerCatalog>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            catalog,
            cancel: CancellationToken::new(),
            join: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    /// Starts consuming `events` in the background. Calling this more than
    /// once is a no-op.
    pub fn start<S>(self: &Arc<Self>, events: S)
    where
        S: Stream<Item = ServiceStateChanged> + Send + Unpin + 'static,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.run(events).await;
        });

        // Best-effort: start() is not async, so stash the handle without
        // blocking on the mutex (it is uncontended this early).
        if let Ok(mut slot) = self.join.try_lock() {
            *slot = Some(handle);
        }
    }

    async fn run<S>(self: Arc<Self>, mut events: S)
    where
        S: Stream<Item = ServiceStateChanged> + Send + Unpin,
    {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("event handler stopping");
                    return;
                }
                next = events.next() => {
                    match next {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            debug!("event stream closed, stopping handler");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn handle_event(&self, event: ServiceStateChanged) {
        if event.service_type != ServiceType::MCPServer {
            return;
        }

        if let Some((_, auth_config)) = self.registry.auth_info_of(&event.name).await {
            if auth_config.is_sso_based()
                && self.registry.status_of(&event.name).await == Some(ServerStatus::AuthRequired)
            {
                debug!(server = %event.name, "SSO-based server, skipping global registration");
                return;
            }
        }

        let should_run = event.new_state == RunState::Running && event.health == Health::Healthy;

        if should_run {
            if let Err(e) = self.register(&event.name).await {
                debug!(server = %event.name, error = %e, "registration failed");
            }
        } else if let Err(e) = self.registry.deregister(&event.name).await {
            debug!(server = %event.name, error = %e, "deregistration failed (likely already absent)");
        }
    }

    /// Attempts to register `name` via the catalog, exactly as the event
    /// loop would on a `running ∧ healthy` transition. Exposed so the
    /// manager's reconciliation sweep can use the same path.
    pub async fn register(&self, name: &str) -> crate::error::AggregatorResult<()> {
        let Some(spec) = self.catalog.spec_for(name).await else {
            warn!(server = name, "no catalog entry, cannot register");
            return Ok(());
        };

        if spec.auth_config.is_sso_based() {
            let auth_info = spec.auth_info.unwrap_or(AuthInfo {
                issuer: String::new(),
                scope: String::new(),
            });
            let url = match &spec.transport {
                UpstreamTransport::Http { url, .. } => url.clone(),
                UpstreamTransport::Stdio { .. } => String::new(),
            };
            return self
                .registry
                .register_pending_auth(name, &url, &spec.tool_prefix, auth_info, spec.auth_config)
                .await;
        }

        let client = UpstreamClient::connect(UpstreamClientConfig {
            transport: spec.transport,
            client_name: format!("muster-global-{name}"),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        })
        .await?;

        self.registry.register(name, Arc::new(client), &spec.tool_prefix).await
    }

    /// Cancels the background task and waits for it to finish processing
    /// whatever event it was already in the middle of. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.join.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "event handler task panicked");
            }
        }
        info!("event handler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    struct EmptyCatalog;

    #[async_trait]
    impl ServerCatalog for EmptyCatalog {
        async fn spec_for(&self, _name: &str) -> Option<ServerSpec> {
            None
        }
    }

    fn event(name: &str, service_type: ServiceType, new_state: RunState, health: Health) -> ServiceStateChanged {
        ServiceStateChanged {
            name: name.to_string(),
            service_type,
            old_state: RunState::Stopped,
            new_state,
            health,
            error: None,
        }
    }

    #[tokio::test]
    async fn non_mcp_events_are_ignored_without_touching_the_registry() {
        let registry = Arc::new(ServerRegistry::new("x", false));
        let handler = EventHandler::new(registry.clone(), Arc::new(EmptyCatalog));
        let events = stream::iter(vec![event(
            "db",
            ServiceType::Other("Database".to_string()),
            RunState::Running,
            Health::Healthy,
        )]);
        handler.start(events);
        handler.stop().await;
        assert_eq!(registry.total_count().await, 0);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let registry = Arc::new(ServerRegistry::new("x", false));
        let handler = EventHandler::new(registry, Arc::new(EmptyCatalog));
        handler.start(stream::iter(Vec::<ServiceStateChanged>::new()));
        handler.stop().await;
        handler.stop().await;
    }

    #[tokio::test]
    async fn missing_catalog_entry_does_not_error_the_handler() {
        let registry = Arc::new(ServerRegistry::new("x", false));
        let handler = EventHandler::new(registry.clone(), Arc::new(EmptyCatalog));
        let events = stream::iter(vec![event(
            "unknown",
            ServiceType::MCPServer,
            RunState::Running,
            Health::Healthy,
        )]);
        handler.start(events);
        handler.stop().await;
        assert_eq!(registry.total_count().await, 0);
    }
}
