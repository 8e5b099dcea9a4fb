//! Error types for the aggregator.

use thiserror::Error;

/// Result type for aggregator operations.
pub type AggregatorResult<T> = std::result::Result<T, AggregatorError>;

/// Main error type for the aggregator.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AggregatorError {
    #[error("server '{0}' is already registered")]
    DuplicateServer(String),

    #[error("server '{0}' not found")]
    ServerNotFound(String),

    #[error("initialize failed for '{server}': {message}")]
    InitializeFailed { server: String, message: String },

    #[error("list_tools failed for '{server}': {message}")]
    ListToolsFailed { server: String, message: String },

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("session limit exceeded (max {max})")]
    SessionLimitExceeded { max: usize },

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("connection to '{server}' not found for session '{session}'")]
    ConnectionNotFound { session: String, server: String },

    #[error("connection to '{server}' already established for session '{session}'")]
    ConnectionAlreadyEstablished { session: String, server: String },

    #[error("rate limited: {remaining_attempts} attempts remaining, retry after {retry_after_secs}s")]
    RateLimited {
        remaining_attempts: u32,
        retry_after_secs: u64,
    },

    #[error("OAuth is not configured for server '{0}'")]
    OauthNotConfigured(String),

    #[error("issuer discovery failed for '{server}': {message}")]
    IssuerDiscoveryFailed { server: String, message: String },

    #[error("failed to create auth challenge for '{server}': {message}")]
    ChallengeCreationFailed { server: String, message: String },

    #[error("token exchange failed for '{server}': {message}")]
    TokenExchangeFailed { server: String, message: String },

    #[error("token forwarding failed for '{server}': {message}")]
    TokenForwardingFailed { server: String, message: String },

    #[error("token expired for issuer '{0}'")]
    TokenExpired(String),

    #[error("connection to '{0}' failed: 401 unauthorized")]
    ConnectionFailed401(String),

    #[error("connection to '{server}' failed: {message}")]
    ConnectionFailedOther { server: String, message: String },

    #[error("tool '{0}' not found")]
    ToolNotFound(String),

    #[error("tool '{0}' is blocked by the denylist")]
    ToolBlocked(String),

    #[error("shutdown did not complete within the timeout budget")]
    ShutdownTimeout,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl AggregatorError {
    /// The stable error-kind string used in tool-result payloads and metrics,
    /// matching the kind vocabulary the aggregator is documented against.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateServer(_) => "duplicate_server",
            Self::ServerNotFound(_) => "server_not_found",
            Self::InitializeFailed { .. } => "initialize_failed",
            Self::ListToolsFailed { .. } => "list_tools_failed",
            Self::InvalidSessionId(_) => "invalid_session_id",
            Self::SessionLimitExceeded { .. } => "session_limit_exceeded",
            Self::SessionNotFound(_) => "session_not_found",
            Self::ConnectionNotFound { .. } => "connection_not_found",
            Self::ConnectionAlreadyEstablished { .. } => "connection_already_established",
            Self::RateLimited { .. } => "rate_limited",
            Self::OauthNotConfigured(_) => "oauth_not_configured",
            Self::IssuerDiscoveryFailed { .. } => "issuer_discovery_failed",
            Self::ChallengeCreationFailed { .. } => "challenge_creation_failed",
            Self::TokenExchangeFailed { .. } => "token_exchange_failed",
            Self::TokenForwardingFailed { .. } => "token_forwarding_failed",
            Self::TokenExpired(_) => "token_expired",
            Self::ConnectionFailed401(_) => "connection_failed_401",
            Self::ConnectionFailedOther { .. } => "connection_failed_other",
            Self::ToolNotFound(_) => "tool_not_found",
            Self::ToolBlocked(_) => "tool_blocked",
            Self::ShutdownTimeout => "shutdown_timeout",
            Self::Configuration(_) => "configuration_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Http(_) => "http_error",
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}
