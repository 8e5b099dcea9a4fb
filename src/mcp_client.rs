//! Type-erased upstream MCP client, trimmed to the transports this aggregator
//! actually dials out on (stdio subprocess, streaming HTTP).

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use turbomcp_client::Client;
use turbomcp_protocol::types::{CallToolResult, GetPromptResult, Prompt, Resource, Tool};
use turbomcp_transport::{
    ChildProcessConfig, ChildProcessTransport, Transport,
    streamable_http_client::{StreamableHttpClientConfig, StreamableHttpClientTransport},
};

use crate::error::{AggregatorError, AggregatorResult};

/// Supplies a fresh bearer token immediately before each outbound request.
/// Implementations never cache; refresh is entirely the OAuth handler's
/// responsibility (see `session_connection::refresh_token_if_needed`).
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync + std::fmt::Debug {
    async fn token(&self) -> AggregatorResult<String>;
}

/// Transport selection for an upstream connection.
#[derive(Debug, Clone)]
pub enum UpstreamTransport {
    Stdio {
        command: String,
        args: Vec<String>,
        working_dir: Option<String>,
    },
    Http {
        url: String,
        /// Static bearer, used only when no `TokenProvider` is attached.
        auth_token: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub transport: UpstreamTransport,
    pub client_name: String,
    pub client_version: String,
}

/// Type-erased client handle over the supported upstream transports.
enum AnyClient {
    Stdio(Arc<Client<ChildProcessTransport>>),
    Http(Arc<Client<StreamableHttpClientTransport>>),
    /// In-memory stand-in used by unit tests that need an `UpstreamClient`
    /// value without dialing a real process or socket.
    #[cfg(test)]
    Test,
}

macro_rules! dispatch_client {
    ($client:expr, $method:ident($($args:expr),*)) => {
        match $client {
            AnyClient::Stdio(c) => c.$method($($args),*).await,
            AnyClient::Http(c) => c.$method($($args),*).await,
            #[cfg(test)]
            AnyClient::Test => unreachable!("test double does not perform real calls"),
        }
    };
}

/// A live connection to one upstream MCP server.
pub struct UpstreamClient {
    client: AnyClient,
    /// When set, queried immediately before every request that needs
    /// authentication (the "dynamic-auth" client from the session-connection
    /// SSO strategies). Access tokens are never cached here.
    token_provider: RwLock<Option<Arc<dyn TokenProvider>>>,
}

impl UpstreamClient {
    pub async fn connect(config: UpstreamClientConfig) -> AggregatorResult<Self> {
        let client = match config.transport {
            UpstreamTransport::Stdio {
                command,
                args,
                working_dir,
            } => {
                let process_config = ChildProcessConfig {
                    command,
                    args,
                    working_directory: working_dir,
                    environment: None,
                    ..Default::default()
                };
                let transport = ChildProcessTransport::new(process_config);
                transport.connect().await.map_err(|e| AggregatorError::InitializeFailed {
                    server: config.client_name.clone(),
                    message: e.to_string(),
                })?;
                AnyClient::Stdio(Arc::new(Client::new(transport)))
            }
            UpstreamTransport::Http { url, auth_token } => {
                let http_config = StreamableHttpClientConfig {
                    base_url: url.clone(),
                    endpoint_path: "/mcp".to_string(),
                    timeout: std::time::Duration::from_secs(30),
                    auth_token,
                    ..Default::default()
                };
                let transport = StreamableHttpClientTransport::new(http_config);
                transport.connect().await.map_err(|e| AggregatorError::InitializeFailed {
                    server: config.client_name.clone(),
                    message: e.to_string(),
                })?;
                AnyClient::Http(Arc::new(Client::new(transport)))
            }
        };

        Ok(Self {
            client,
            token_provider: RwLock::new(None),
        })
    }

    /// Attaches a dynamic token provider for this connection's lifetime.
    pub async fn set_token_provider(&self, provider: Arc<dyn TokenProvider>) {
        *self.token_provider.write().await = Some(provider);
    }

    async fn refresh_bearer(&self) -> AggregatorResult<()> {
        let provider = self.token_provider.read().await.clone();
        if let Some(provider) = provider {
            let token = provider.token().await?;
            if let AnyClient::Http(client) = &self.client {
                client
                    .set_bearer_token(token)
                    .await
                    .map_err(|e| AggregatorError::ConnectionFailedOther {
                        server: "upstream".to_string(),
                        message: e.to_string(),
                    })?;
            }
        }
        Ok(())
    }

    /// Bounded by a short timeout so a dead server cannot block registration.
    pub async fn initialize(&self, timeout: std::time::Duration) -> AggregatorResult<()> {
        self.refresh_bearer().await?;
        let fut = async {
            dispatch_client!(&self.client, initialize())
                .map(|_| ())
                .map_err(|e| AggregatorError::InitializeFailed {
                    server: "upstream".to_string(),
                    message: e.to_string(),
                })
        };
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| AggregatorError::InitializeFailed {
                server: "upstream".to_string(),
                message: "initialize timed out".to_string(),
            })?
    }

    pub async fn list_tools(&self) -> AggregatorResult<Vec<Tool>> {
        self.refresh_bearer().await?;
        dispatch_client!(&self.client, list_tools()).map_err(|e| AggregatorError::ListToolsFailed {
            server: "upstream".to_string(),
            message: e.to_string(),
        })
    }

    pub async fn list_resources(&self) -> AggregatorResult<Vec<Resource>> {
        self.refresh_bearer().await?;
        dispatch_client!(&self.client, list_resources())
            .map_err(|e| AggregatorError::ConnectionFailedOther {
                server: "upstream".to_string(),
                message: e.to_string(),
            })
    }

    pub async fn list_prompts(&self) -> AggregatorResult<Vec<Prompt>> {
        self.refresh_bearer().await?;
        dispatch_client!(&self.client, list_prompts())
            .map_err(|e| AggregatorError::ConnectionFailedOther {
                server: "upstream".to_string(),
                message: e.to_string(),
            })
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<HashMap<String, Value>>,
    ) -> AggregatorResult<CallToolResult> {
        self.refresh_bearer().await?;
        dispatch_client!(&self.client, call_tool(name, arguments)).map_err(|e| {
            AggregatorError::ConnectionFailedOther {
                server: "upstream".to_string(),
                message: e.to_string(),
            }
        })
    }

    pub async fn read_resource(&self, uri: &str) -> AggregatorResult<Value> {
        self.refresh_bearer().await?;
        dispatch_client!(&self.client, read_resource(uri)).map_err(|e| {
            AggregatorError::ConnectionFailedOther {
                server: "upstream".to_string(),
                message: e.to_string(),
            }
        })
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, Value>>,
    ) -> AggregatorResult<GetPromptResult> {
        self.refresh_bearer().await?;
        dispatch_client!(&self.client, get_prompt(name, arguments)).map_err(|e| {
            AggregatorError::ConnectionFailedOther {
                server: "upstream".to_string(),
                message: e.to_string(),
            }
        })
    }

    /// Closes the underlying transport. Safe to call more than once.
    pub async fn close(&self) {
        match &self.client {
            AnyClient::Stdio(c) => {
                let _ = c.shutdown().await;
            }
            AnyClient::Http(c) => {
                let _ = c.shutdown().await;
            }
            #[cfg(test)]
            AnyClient::Test => {}
        }
    }

    #[cfg(test)]
    pub fn test_double() -> Self {
        Self {
            client: AnyClient::Test,
            token_provider: RwLock::new(None),
        }
    }
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient").finish_non_exhaustive()
    }
}
