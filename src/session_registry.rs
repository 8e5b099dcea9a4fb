//! Per-session connection registry: idle sweep, capacity limit, connection map (C1).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AggregatorError, AggregatorResult};
use crate::mcp_client::UpstreamClient;

const MAX_SESSION_ID_LEN: usize = 256;

/// HTTP header carrying a client-supplied session identity; takes precedence
/// over the transport's own session id.
pub const SESSION_ID_HEADER: &str = "X-Muster-Session-ID";

/// Sentinel session id used only for the single-user stdio transport.
pub const DEFAULT_SESSION_ID: &str = "default-session";

/// Status of one session's connection to one upstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    PendingAuth,
    Failed,
}

/// A session-scoped cache of tools/resources/prompts, mirroring the server
/// registry's per-server cache shape but scoped to one session's connection.
#[derive(Debug, Clone, Default)]
pub struct SessionCapabilities {
    pub tools: Vec<String>,
    pub resources: Vec<String>,
    pub prompts: Vec<String>,
}

/// Identifies the OAuth token a session connection is keyed against, without
/// owning the token itself — tokens live in the external OAuth collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenKey {
    pub session_id: String,
    pub issuer: String,
    pub scope: String,
}

/// One session's connection to one upstream server.
#[derive(Debug, Clone)]
pub struct SessionConnection {
    pub server_name: String,
    pub status: ConnectionStatus,
    pub client: Option<Arc<UpstreamClient>>,
    pub token_key: Option<TokenKey>,
    pub connected_at: Option<DateTime<Utc>>,
    pub capabilities: SessionCapabilities,
    /// Set when a session-init SSO attempt failed for this server; surfaced
    /// on `auth://status` without being re-attempted on read.
    pub sso_attempt_failed: bool,
}

impl SessionConnection {
    fn pending(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            status: ConnectionStatus::PendingAuth,
            client: None,
            token_key: None,
            connected_at: None,
            capabilities: SessionCapabilities::default(),
            sso_attempt_failed: false,
        }
    }
}

struct SessionState {
    created_at: DateTime<Utc>,
    last_activity: RwLock<DateTime<Utc>>,
    connections: RwLock<HashMap<String, SessionConnection>>,
}

impl SessionState {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            last_activity: RwLock::new(now),
            connections: RwLock::new(HashMap::new()),
        }
    }

    async fn touch(&self) {
        *self.last_activity.write().await = Utc::now();
    }
}

/// A point-in-time snapshot of a session, for status reporting.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub connections: HashMap<String, SessionConnection>,
}

/// Per-session connection map with idle sweep and bounded capacity.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionState>>>,
    max_sessions: usize,
    session_timeout: Duration,
    shutdown: CancellationToken,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, session_timeout: Duration) -> Arc<Self> {
        let registry = Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            session_timeout,
            shutdown: CancellationToken::new(),
        });
        registry.clone().spawn_sweeper();
        registry
    }

    fn validate_session_id(session_id: &str) -> AggregatorResult<()> {
        if session_id.is_empty() || session_id.len() > MAX_SESSION_ID_LEN {
            return Err(AggregatorError::InvalidSessionId(session_id.to_string()));
        }
        Ok(())
    }

    /// Returns the existing session or creates one, rejecting invalid ids and
    /// creation past `max_sessions`.
    pub async fn get_or_create(&self, session_id: &str) -> AggregatorResult<()> {
        Self::validate_session_id(session_id)?;

        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(session_id) {
                session.touch().await;
                return Ok(());
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(session_id) {
            session.touch().await;
            return Ok(());
        }
        if sessions.len() >= self.max_sessions {
            return Err(AggregatorError::SessionLimitExceeded {
                max: self.max_sessions,
            });
        }
        sessions.insert(session_id.to_string(), Arc::new(SessionState::new()));
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionSnapshot> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(session_id)?;
        let connections = session.connections.read().await.clone();
        Some(SessionSnapshot {
            session_id: session_id.to_string(),
            created_at: session.created_at,
            last_activity: *session.last_activity.read().await,
            connections,
        })
    }

    /// Removes a session and closes all of its clients.
    pub async fn delete(&self, session_id: &str) {
        let removed = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(session_id)
        };
        if let Some(session) = removed {
            Self::close_all(&session).await;
        }
    }

    async fn close_all(session: &SessionState) {
        let mut connections = session.connections.write().await;
        for (_, conn) in connections.drain() {
            if let Some(client) = conn.client {
                client.close().await;
            }
        }
    }

    pub async fn get_connection(
        &self,
        session_id: &str,
        server: &str,
    ) -> AggregatorResult<Option<SessionConnection>> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| AggregatorError::SessionNotFound(session_id.to_string()))?;
        session.touch().await;
        let connections = session.connections.read().await;
        Ok(connections.get(server).cloned())
    }

    /// Installs (or replaces) a fully-connected connection for `server`.
    pub async fn set_connection(
        &self,
        session_id: &str,
        connection: SessionConnection,
    ) -> AggregatorResult<()> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| AggregatorError::SessionNotFound(session_id.to_string()))?;
        session.touch().await;
        let mut connections = session.connections.write().await;
        connections.insert(connection.server_name.clone(), connection);
        Ok(())
    }

    /// Marks a server as pending-auth for this session (no client yet).
    pub async fn set_pending_auth(&self, session_id: &str, server: &str) -> AggregatorResult<()> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| AggregatorError::SessionNotFound(session_id.to_string()))?;
        session.touch().await;
        let mut connections = session.connections.write().await;
        connections.insert(server.to_string(), SessionConnection::pending(server));
        Ok(())
    }

    /// Upgrades a pending-auth connection to connected. Fails when the
    /// connection is missing or already connected.
    pub async fn upgrade_connection(
        &self,
        session_id: &str,
        server: &str,
        client: Arc<UpstreamClient>,
        token_key: Option<TokenKey>,
    ) -> AggregatorResult<()> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| AggregatorError::SessionNotFound(session_id.to_string()))?;
        session.touch().await;
        let mut connections = session.connections.write().await;

        match connections.get_mut(server) {
            None => Err(AggregatorError::ConnectionNotFound {
                session: session_id.to_string(),
                server: server.to_string(),
            }),
            Some(conn) if conn.status == ConnectionStatus::Connected => {
                Err(AggregatorError::ConnectionAlreadyEstablished {
                    session: session_id.to_string(),
                    server: server.to_string(),
                })
            }
            Some(conn) => {
                conn.status = ConnectionStatus::Connected;
                conn.client = Some(client);
                conn.token_key = token_key;
                conn.connected_at = Some(Utc::now());
                Ok(())
            }
        }
    }

    /// Removes one session's connection to `server`, closing its client.
    /// A no-op (not an error) when no such connection exists.
    pub async fn delete_connection(&self, session_id: &str, server: &str) -> AggregatorResult<()> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| AggregatorError::SessionNotFound(session_id.to_string()))?;
        session.touch().await;
        let removed = session.connections.write().await.remove(server);
        if let Some(conn) = removed {
            if let Some(client) = conn.client {
                client.close().await;
            }
        }
        Ok(())
    }

    /// Marks a pending/failed connection as having failed its session-init
    /// SSO attempt, surfaced on the auth status resource.
    pub async fn mark_sso_attempt_failed(&self, session_id: &str, server: &str) -> AggregatorResult<()> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| AggregatorError::SessionNotFound(session_id.to_string()))?;
        session.touch().await;
        let mut connections = session.connections.write().await;
        connections
            .entry(server.to_string())
            .or_insert_with(|| SessionConnection::pending(server))
            .sso_attempt_failed = true;
        Ok(())
    }

    /// Removes a server's connection from every session, closing its client.
    pub async fn remove_server_from_all_sessions(&self, server: &str) {
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            let removed = {
                let mut connections = session.connections.write().await;
                connections.remove(server)
            };
            if let Some(conn) = removed {
                if let Some(client) = conn.client {
                    client.close().await;
                }
            }
        }
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Closes all sessions synchronously. Idempotent.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let mut sessions = self.sessions.write().await;
        for (_, session) in sessions.drain() {
            Self::close_all(&session).await;
        }
    }

    fn spawn_sweeper(self: Arc<Self>) {
        let interval = std::cmp::max(Duration::from_secs(1), self.session_timeout / 2);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        debug!("session sweeper stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }
                }
            }
        });
    }

    async fn sweep_once(&self) {
        let now = Utc::now();
        let expired: Vec<(String, Arc<SessionState>)> = {
            let sessions = self.sessions.read().await;
            let mut out = Vec::new();
            for (id, session) in sessions.iter() {
                let last_activity = *session.last_activity.read().await;
                if (now - last_activity).to_std().unwrap_or_default() > self.session_timeout {
                    out.push((id.clone(), session.clone()));
                }
            }
            out
        };

        if expired.is_empty() {
            return;
        }

        let mut sessions = self.sessions.write().await;
        for (id, session) in expired {
            sessions.remove(&id);
            Self::close_all(&session).await;
            info!(session_id = %id, "swept idle session");
        }
    }
}

/// Resolves the session id for an inbound request following the documented
/// precedence: trusted header, then transport session id, then the stdio
/// sentinel.
pub fn resolve_session_id(
    header_value: Option<&str>,
    transport_session_id: Option<&str>,
    is_stdio: bool,
) -> Option<String> {
    if let Some(id) = header_value {
        if !id.is_empty() {
            return Some(id.to_string());
        }
    }
    if let Some(id) = transport_session_id {
        if !id.is_empty() {
            return Some(id.to_string());
        }
    }
    if is_stdio {
        return Some(DEFAULT_SESSION_ID.to_string());
    }
    warn!("no session id could be resolved for request");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_rejects_empty_id() {
        let registry = SessionRegistry::new(10, Duration::from_secs(60));
        assert!(registry.get_or_create("").await.is_err());
    }

    #[tokio::test]
    async fn get_or_create_rejects_at_capacity() {
        let registry = SessionRegistry::new(1, Duration::from_secs(60));
        registry.get_or_create("s1").await.unwrap();
        assert!(registry.get_or_create("s2").await.is_err());
    }

    #[tokio::test]
    async fn upgrade_without_pending_fails() {
        let registry = SessionRegistry::new(10, Duration::from_secs(60));
        registry.get_or_create("s1").await.unwrap();
        let client = Arc::new(crate::mcp_client::UpstreamClient::test_double());
        let result = registry
            .upgrade_connection("s1", "srv", client, None)
            .await;
        assert!(matches!(result, Err(AggregatorError::ConnectionNotFound { .. })));
    }

    #[tokio::test]
    async fn upgrade_twice_fails_second_time() {
        let registry = SessionRegistry::new(10, Duration::from_secs(60));
        registry.get_or_create("s1").await.unwrap();
        registry.set_pending_auth("s1", "srv").await.unwrap();

        let client = Arc::new(crate::mcp_client::UpstreamClient::test_double());
        registry
            .upgrade_connection("s1", "srv", client.clone(), None)
            .await
            .unwrap();

        let result = registry.upgrade_connection("s1", "srv", client, None).await;
        assert!(matches!(
            result,
            Err(AggregatorError::ConnectionAlreadyEstablished { .. })
        ));
    }

    #[test]
    fn session_id_precedence_prefers_header() {
        let id = resolve_session_id(Some("header-id"), Some("transport-id"), false);
        assert_eq!(id, Some("header-id".to_string()));
    }

    #[test]
    fn session_id_falls_back_to_stdio_sentinel() {
        let id = resolve_session_id(None, None, true);
        assert_eq!(id, Some(DEFAULT_SESSION_ID.to_string()));
    }

    #[test]
    fn session_id_is_none_when_unresolvable_on_non_stdio() {
        let id = resolve_session_id(None, None, false);
        assert_eq!(id, None);
    }
}
