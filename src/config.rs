//! Aggregator configuration: file + environment + CLI, layered via the `config` crate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AggregatorError, AggregatorResult};

/// Transport the aggregator speaks to its own clients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    Sse,
    Http,
}

/// Top-level aggregator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Prefix applied to every exposed tool/resource/prompt name.
    pub global_prefix: String,

    /// Disables the denylist when true.
    pub yolo: bool,

    /// Upper bound on concurrently tracked sessions.
    pub max_sessions: usize,

    /// Sessions idle longer than this are swept and their clients closed.
    pub session_timeout: Duration,

    /// Sliding-window auth-attempt cap.
    pub rate_limit_max_attempts: u32,

    pub rate_limit_window: Duration,

    /// Which transport the aggregator's own MCP endpoint speaks.
    pub transport: TransportKind,

    /// Bind address for the `sse`/`http` transports.
    pub bind_address: String,

    /// Whether the HTTP surface is wrapped with OAuth server-protection middleware.
    pub oauth_server_protection: bool,

    /// Retry-loop interval reconciling orchestrator health against the registry.
    pub retry_interval: Duration,

    /// Statically configured upstream servers. Real deployments typically
    /// pair this aggregator with a service orchestrator that drives
    /// registration through `ServiceStateChanged` events; this list lets
    /// `musterd` run standalone against a fixed server set.
    pub servers: Vec<StaticServerConfig>,
}

/// One entry of the static server list, deserialized straight from the
/// config file/environment. Converted into `AuthConfig`/`AuthInfo` by the
/// static catalog rather than depending on those types here directly.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StaticServerConfig {
    pub name: String,
    pub tool_prefix: String,

    /// `Some(url)` selects the HTTP transport; otherwise `command`/`args` select stdio.
    pub url: Option<String>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub working_dir: Option<String>,

    pub issuer: Option<String>,
    pub scope: Option<String>,
    pub sso_enabled: Option<bool>,
    pub forward_token: bool,
    pub fallback_to_own_auth: bool,
    pub dex_token_endpoint: Option<String>,
    pub connector_id: Option<String>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            global_prefix: "x".to_string(),
            yolo: false,
            max_sessions: 1000,
            session_timeout: Duration::from_secs(30 * 60),
            rate_limit_max_attempts: 10,
            rate_limit_window: Duration::from_secs(60),
            transport: TransportKind::Stdio,
            bind_address: "127.0.0.1:8090".to_string(),
            oauth_server_protection: false,
            retry_interval: Duration::from_secs(5),
            servers: Vec::new(),
        }
    }
}

impl AggregatorConfig {
    /// The URL scheme under which `bind_address` is reachable, for reporting
    /// the endpoint URL. Stdio has no network endpoint; reported as `stdio`.
    pub fn transport_scheme(&self) -> &'static str {
        match self.transport {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse | TransportKind::Http => "http",
        }
    }

    /// Normalizes non-positive or nonsensical values to their documented defaults,
    /// mirroring the rate limiter's own "non-positive values fall back" rule.
    pub fn normalize(mut self) -> Self {
        let defaults = Self::default();
        if self.global_prefix.trim().is_empty() {
            self.global_prefix = defaults.global_prefix;
        }
        if self.max_sessions == 0 {
            self.max_sessions = defaults.max_sessions;
        }
        if self.session_timeout.is_zero() {
            self.session_timeout = defaults.session_timeout;
        }
        if self.rate_limit_max_attempts == 0 {
            self.rate_limit_max_attempts = defaults.rate_limit_max_attempts;
        }
        if self.rate_limit_window.is_zero() {
            self.rate_limit_window = defaults.rate_limit_window;
        }
        self
    }

    /// Loads configuration from (in increasing precedence): an optional file,
    /// `MUSTER_*` environment variables, then explicit CLI overrides applied by the caller.
    pub fn load(file_path: Option<&str>) -> AggregatorResult<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = file_path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("MUSTER")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder
            .build()
            .map_err(|e| AggregatorError::configuration(e.to_string()))?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| AggregatorError::configuration(e.to_string()))?;

        Ok(config.normalize())
    }
}

impl From<config::ConfigError> for AggregatorError {
    fn from(e: config::ConfigError) -> Self {
        AggregatorError::configuration(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = AggregatorConfig::default();
        assert_eq!(cfg.global_prefix, "x");
        assert!(!cfg.yolo);
        assert_eq!(cfg.rate_limit_max_attempts, 10);
    }

    #[test]
    fn normalize_replaces_non_positive_values() {
        let cfg = AggregatorConfig {
            global_prefix: "  ".to_string(),
            max_sessions: 0,
            rate_limit_max_attempts: 0,
            ..AggregatorConfig::default()
        }
        .normalize();

        assert_eq!(cfg.global_prefix, "x");
        assert_eq!(cfg.max_sessions, 1000);
        assert_eq!(cfg.rate_limit_max_attempts, 10);
    }
}
