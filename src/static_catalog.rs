//! Standalone-deployment server catalog: turns the config file's static
//! `servers` list into the `ServerCatalog`/`HealthSnapshotSource` the event
//! handler and manager need, for deployments with no real orchestrator.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::config::StaticServerConfig;
use crate::event_handler::{Health, RunState, ServerCatalog, ServerSpec};
use crate::manager::HealthSnapshotSource;
use crate::mcp_client::UpstreamTransport;
use crate::server_registry::{AuthConfig, AuthInfo, TokenExchangeConfig};

fn transport_of(cfg: &StaticServerConfig) -> UpstreamTransport {
    if let Some(url) = &cfg.url {
        UpstreamTransport::Http {
            url: url.clone(),
            auth_token: None,
        }
    } else {
        UpstreamTransport::Stdio {
            command: cfg.command.clone().unwrap_or_default(),
            args: cfg.args.clone(),
            working_dir: cfg.working_dir.clone(),
        }
    }
}

fn spec_of(cfg: &StaticServerConfig) -> ServerSpec {
    let auth_info = cfg.issuer.clone().map(|issuer| AuthInfo {
        issuer,
        scope: cfg.scope.clone().unwrap_or_default(),
    });

    let token_exchange = cfg.dex_token_endpoint.clone().map(|dex_token_endpoint| TokenExchangeConfig {
        dex_token_endpoint,
        connector_id: cfg.connector_id.clone().unwrap_or_default(),
        enabled: true,
    });

    ServerSpec {
        transport: transport_of(cfg),
        tool_prefix: cfg.tool_prefix.clone(),
        auth_config: AuthConfig {
            sso_enabled: cfg.sso_enabled,
            forward_token: cfg.forward_token,
            fallback_to_own_auth: cfg.fallback_to_own_auth,
            token_exchange,
        },
        auth_info,
    }
}

/// Serves the fixed server list from configuration as both a catalog (for
/// dialing) and a health snapshot (every configured server reports
/// running/healthy immediately, since there is no orchestrator to ask).
pub struct StaticCatalog {
    servers: HashMap<String, StaticServerConfig>,
}

impl StaticCatalog {
    pub fn new(servers: Vec<StaticServerConfig>) -> Self {
        let servers = servers.into_iter().map(|s| (s.name.clone(), s)).collect();
        Self { servers }
    }
}

#[async_trait]
impl ServerCatalog for StaticCatalog {
    async fn spec_for(&self, name: &str) -> Option<ServerSpec> {
        self.servers.get(name).map(spec_of)
    }
}

#[async_trait]
impl HealthSnapshotSource for StaticCatalog {
    async fn snapshot(&self) -> Vec<(String, RunState, Health)> {
        self.servers
            .keys()
            .map(|name| (name.clone(), RunState::Running, Health::Healthy))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_reports_every_configured_server_as_healthy() {
        let catalog = StaticCatalog::new(vec![StaticServerConfig {
            name: "weather".to_string(),
            url: Some("http://localhost:9000".to_string()),
            ..Default::default()
        }]);
        let snapshot = catalog.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, "weather");
    }

    #[tokio::test]
    async fn spec_for_unknown_server_is_none() {
        let catalog = StaticCatalog::new(Vec::new());
        assert!(catalog.spec_for("ghost").await.is_none());
    }
}
