//! Top-level lifecycle: starts the aggregator core and event handler, then
//! reconciles the orchestrator's view of healthy services on a timer (C7).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::AggregatorCore;
use crate::config::AggregatorConfig;
use crate::event_handler::{EventHandler, Health, RunState};

const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// A point-in-time view of which services the orchestrator currently
/// considers healthy, polled by the reconciliation loop.
#[async_trait]
pub trait HealthSnapshotSource: Send + Sync {
    async fn snapshot(&self) -> Vec<(String, RunState, Health)>;
}

/// Summary reported to operators/status tools.
#[derive(Debug, Clone)]
pub struct ServiceData {
    pub endpoint_url: String,
    pub tool_count: usize,
    pub resource_count: usize,
    pub prompt_count: usize,
    pub blocked_tool_count: usize,
    pub total_server_count: usize,
    pub connected_server_count: usize,
    pub event_handler_running: bool,
}

pub struct Manager {
    config: AggregatorConfig,
    core: Arc<AggregatorCore>,
    events: Arc<EventHandler>,
    health_source: Arc<dyn HealthSnapshotSource>,
    retry_cancel: CancellationToken,
    retry_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    pub fn new(
        config: AggregatorConfig,
        core: Arc<AggregatorCore>,
        events: Arc<EventHandler>,
        health_source: Arc<dyn HealthSnapshotSource>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            core,
            events,
            health_source,
            retry_cancel: CancellationToken::new(),
            retry_task: tokio::sync::Mutex::new(None),
        })
    }

    /// Starts the core, then the retry/reconciliation loop. The event
    /// handler itself is started by the caller against its own event
    /// stream, since its `Stream` type is chosen by the transport layer.
    pub async fn start(self: &Arc<Self>) {
        self.core.start().await;
        self.manual_refresh().await;

        let this = self.clone();
        let task = tokio::spawn(async move {
            this.retry_loop().await;
        });
        *self.retry_task.lock().await = Some(task);

        info!("manager started");
    }

    async fn retry_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(RETRY_INTERVAL);
        loop {
            tokio::select! {
                _ = self.retry_cancel.cancelled() => {
                    debug!("retry loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.manual_refresh().await;
                }
            }
        }
    }

    /// Registers any service the orchestrator reports as `running ∧ healthy`
    /// but that is not yet present in the server registry. Exposed so
    /// callers can force an out-of-band sweep.
    pub async fn manual_refresh(&self) {
        let snapshot = self.health_source.snapshot().await;
        for (name, state, health) in snapshot {
            if state != RunState::Running || health != Health::Healthy {
                continue;
            }
            if self.core.servers.is_registered(&name).await {
                continue;
            }
            debug!(server = %name, "reconciliation: registering missing healthy service");
            if let Err(e) = self.events.register(&name).await {
                warn!(server = %name, error = %e, "reconciliation registration failed");
            }
        }
    }

    pub async fn service_data(&self) -> ServiceData {
        let tools = self.core.servers.get_all_tools().await;
        let tool_count = tools.len();
        let blocked_tool_count = tools.iter().filter(|(_, blocked)| *blocked).count();

        ServiceData {
            endpoint_url: format!("{}://{}", self.config.transport_scheme(), self.config.bind_address),
            tool_count,
            resource_count: self.core.servers.get_all_resources().await.len(),
            prompt_count: self.core.servers.get_all_prompts().await.len(),
            blocked_tool_count,
            total_server_count: self.core.servers.total_count().await,
            connected_server_count: self.core.servers.connected_count().await,
            event_handler_running: self.events.is_running(),
        }
    }

    /// Idempotent: stops the retry loop, the event handler, then the core.
    pub async fn stop(&self) {
        self.retry_cancel.cancel();
        if let Some(task) = self.retry_task.lock().await.take() {
            let _ = task.await;
        }
        self.events.stop().await;
        self.core.stop().await;
        info!("manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::McpServerHandle;
    use crate::auth_provider::{AuthMetrics, AuthToolProvider};
    use crate::event_handler::ServerCatalog;
    use crate::rate_limiter::RateLimiter;
    use crate::server_registry::ServerRegistry;
    use crate::session_connection::{SessionConnector, SessionNotifier};
    use crate::session_registry::SessionRegistry;
    use async_trait::async_trait as at;

    struct NoopMcp;
    #[at]
    impl McpServerHandle for NoopMcp {
        async fn install_session_filter(&self) {}
        async fn apply_tool_delta(&self, _a: &[String], _r: &[String]) {}
        async fn apply_resource_delta(&self, _a: &[String], _r: &[String]) {}
        async fn apply_prompt_delta(&self, _a: &[String], _r: &[String]) {}
        async fn publish_tool_update(&self, _names: &[String]) {}
        async fn notify_session_tools_changed(&self, _session_id: &str) {}
        async fn shutdown(&self, _budget: Duration) {}
    }

    struct NoopNotifier;
    #[at]
    impl SessionNotifier for NoopNotifier {
        async fn notify_tools_changed(&self, _session_id: &str) {}
    }

    struct EmptyCatalog;
    #[at]
    impl ServerCatalog for EmptyCatalog {
        async fn spec_for(&self, _name: &str) -> Option<crate::event_handler::ServerSpec> {
            None
        }
    }

    struct EmptySnapshot;
    #[at]
    impl HealthSnapshotSource for EmptySnapshot {
        async fn snapshot(&self) -> Vec<(String, RunState, Health)> {
            Vec::new()
        }
    }

    fn manager() -> Arc<Manager> {
        let servers = Arc::new(ServerRegistry::new("x", false));
        let sessions = SessionRegistry::new(10, Duration::from_secs(60));
        let connector = Arc::new(SessionConnector::new(None, Arc::new(NoopNotifier)));
        let auth = Arc::new(AuthToolProvider::new(
            servers.clone(),
            sessions.clone(),
            connector,
            None,
            Arc::new(RateLimiter::default()),
            Arc::new(AuthMetrics::new()),
        ));
        let core = AggregatorCore::new(servers.clone(), sessions, auth, Arc::new(NoopMcp), Vec::new(), false);
        let events = EventHandler::new(servers, Arc::new(EmptyCatalog));
        Manager::new(AggregatorConfig::default(), core, events, Arc::new(EmptySnapshot))
    }

    #[tokio::test]
    async fn service_data_reports_zero_for_an_empty_registry() {
        let manager = manager();
        let data = manager.service_data().await;
        assert_eq!(data.total_server_count, 0);
        assert_eq!(data.tool_count, 0);
    }

    #[tokio::test]
    async fn manual_refresh_is_a_noop_with_an_empty_snapshot() {
        let manager = manager();
        manager.manual_refresh().await;
        assert_eq!(manager.core.servers.total_count().await, 0);
    }
}
