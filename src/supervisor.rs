//! Proxy supervisor: owns the configured set of upstream
//! connections, drives each through the reconnection state machine, and
//! publishes status changes on the event bus. Follows
//! `daemon/server_manager.rs::ServerManager`/`ManagedServer`'s
//! "one map of name to managed handle, guarded by a sync `RwLock` for cheap
//! snapshot reads" shape; tool indexing/routing is dropped since downstream
//! tool dispatch is an external collaborator here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock as SyncRwLock};

use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::{
    AuthProvider, BearerProvider, NoAuthProvider, OAuth2AuthCodeProvider,
    OAuth2ClientCredentialsProvider, ProviderRegistry,
};
use crate::config::{AuthConfig, TransportConfig, UpstreamConfig};
use crate::correlator::{Outcome, RequestCorrelator};
use crate::error::{FunnelError, Result};
use crate::events::{EventBus, ServerEvent};
use crate::reconnect::{ReconnectManager, ReconnectState};
use crate::token::InMemoryTokenStorage;
use crate::transport::{SseTransport, StdioTransport, StreamableHttpTransport, Transport, WebSocketTransport};

/// Externally-observable connection status.
/// A superset of [`ReconnectState`]: `Terminating` has no reconnect-manager
/// analogue since it only exists during an in-progress `disconnectServer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Terminating,
    Failed,
}

impl From<ReconnectState> for ConnectionStatus {
    fn from(state: ReconnectState) -> Self {
        match state {
            ReconnectState::Disconnected => Self::Disconnected,
            ReconnectState::Connecting => Self::Connecting,
            ReconnectState::Connected => Self::Connected,
            ReconnectState::Reconnecting => Self::Reconnecting,
            ReconnectState::Failed => Self::Failed,
        }
    }
}

/// Synchronous snapshot returned by `get_server_status`.
#[derive(Debug, Clone)]
pub struct ServerStatusSnapshot {
    pub status: ConnectionStatus,
    pub connected_at: Option<OffsetDateTime>,
    pub error: Option<String>,
}

struct StatusCell {
    status: ConnectionStatus,
    connected_at: Option<OffsetDateTime>,
    error: Option<String>,
}

/// Everything owned by one configured upstream: its transport, auth, the
/// reconnect state machine, and the request correlator for in-flight calls.
struct Connection {
    name: String,
    config: UpstreamConfig,
    transport: Mutex<Box<dyn Transport>>,
    auth: Arc<dyn AuthProvider>,
    auth_code_provider: Option<Arc<OAuth2AuthCodeProvider>>,
    reconnect: Mutex<ReconnectManager>,
    correlator: Arc<RequestCorrelator>,
    status: SyncRwLock<StatusCell>,
    terminating: AtomicBool,
    pump_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    timeout_sweep_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Connection {
    fn snapshot(&self) -> ServerStatusSnapshot {
        let cell = self.status.read().unwrap();
        ServerStatusSnapshot { status: cell.status, connected_at: cell.connected_at, error: cell.error.clone() }
    }

    fn set_status(&self, status: ConnectionStatus, error: Option<String>) {
        let mut cell = self.status.write().unwrap();
        cell.status = status;
        cell.error = error;
        if status == ConnectionStatus::Connected {
            cell.connected_at = Some(OffsetDateTime::now_utc());
        } else if status == ConnectionStatus::Disconnected || status == ConnectionStatus::Failed {
            cell.connected_at = None;
        }
    }
}

/// How often each connection's correlator is swept for requests whose
/// deadline has passed (spec.md §4.4 "timeout sweep"). Short enough that a
/// caller's deadline is honored promptly without busy-waiting.
const TIMEOUT_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);

fn build_transport(config: &TransportConfig) -> Result<Box<dyn Transport>> {
    match config {
        TransportConfig::Stdio { command, args, env } => {
            Ok(Box::new(StdioTransport::new(command.clone(), args.clone(), env.clone())))
        }
        TransportConfig::Sse { url, timeout_ms, .. } => {
            Ok(Box::new(SseTransport::new(url.clone(), *timeout_ms)?))
        }
        TransportConfig::WebSocket { url, ping_interval_ms, .. } => {
            Ok(Box::new(WebSocketTransport::new(url.clone(), Some(*ping_interval_ms))?))
        }
        TransportConfig::StreamableHttp { url, timeout_ms, session_id, .. } => {
            Ok(Box::new(StreamableHttpTransport::new(url.clone(), *timeout_ms, session_id.clone())?))
        }
    }
}

/// Builds the auth provider for one upstream. Token storage is in-memory and
/// scoped to this one connection — persisting it across process restarts is
/// out of scope here.
fn build_auth_provider(
    config: &AuthConfig,
    registry: Arc<ProviderRegistry>,
) -> Result<(Arc<dyn AuthProvider>, Option<Arc<OAuth2AuthCodeProvider>>)> {
    match config {
        AuthConfig::None => Ok((Arc::new(NoAuthProvider::new()), None)),
        AuthConfig::Bearer { token } => Ok((Arc::new(BearerProvider::new(token.clone())?), None)),
        AuthConfig::OAuth2ClientCredentials { client_id, client_secret, token_endpoint, scope, audience } => {
            let storage = Arc::new(InMemoryTokenStorage::new());
            let provider = Arc::new(OAuth2ClientCredentialsProvider::new(
                client_id.clone(),
                client_secret.clone(),
                token_endpoint.clone(),
                scope.clone(),
                audience.clone(),
                storage,
            )?);
            provider.start_background_refresh();
            Ok((provider as Arc<dyn AuthProvider>, None))
        }
        AuthConfig::OAuth2AuthCode {
            client_id,
            client_secret,
            authorization_endpoint,
            token_endpoint,
            redirect_uri,
            scope,
            audience,
        } => {
            let storage = Arc::new(InMemoryTokenStorage::new());
            let provider = OAuth2AuthCodeProvider::new(
                client_id.clone(),
                client_secret.clone(),
                authorization_endpoint.clone(),
                token_endpoint.clone(),
                redirect_uri.clone(),
                scope.clone(),
                audience.clone(),
                storage,
                registry,
            )?;
            provider.start_background_refresh();
            Ok((provider.clone() as Arc<dyn AuthProvider>, Some(provider)))
        }
    }
}

/// Owns every configured upstream connection.
pub struct ProxySupervisor {
    connections: SyncRwLock<HashMap<String, Arc<Connection>>>,
    events: EventBus,
    registry: Arc<ProviderRegistry>,
}

impl ProxySupervisor {
    pub fn new(configs: Vec<UpstreamConfig>, registry: Arc<ProviderRegistry>) -> Result<Arc<Self>> {
        let mut connections = HashMap::with_capacity(configs.len());
        for config in configs {
            config.transport.validate(true)?;
            let transport = build_transport(&config.transport)?;
            let (auth, auth_code_provider) = build_auth_provider(&config.auth, registry.clone())?;
            let reconnect_config = config.transport.reconnect().copied().unwrap_or_default();
            let connection = Connection {
                name: config.name.clone(),
                transport: Mutex::new(transport),
                auth,
                auth_code_provider,
                reconnect: Mutex::new(ReconnectManager::new(reconnect_config)),
                correlator: RequestCorrelator::new(),
                status: SyncRwLock::new(StatusCell {
                    status: ConnectionStatus::Disconnected,
                    connected_at: None,
                    error: None,
                }),
                terminating: AtomicBool::new(false),
                pump_task: Mutex::new(None),
                timeout_sweep_task: Mutex::new(None),
                config,
            };
            connections.insert(connection.name.clone(), Arc::new(connection));
        }
        Ok(Arc::new(Self { connections: SyncRwLock::new(connections), events: EventBus::new(), registry }))
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn list_server_names(&self) -> Vec<String> {
        self.connections.read().unwrap().keys().cloned().collect()
    }

    pub fn get_server_status(&self, name: &str) -> Option<ServerStatusSnapshot> {
        self.connections.read().unwrap().get(name).map(|c| c.snapshot())
    }

    fn connection(&self, name: &str) -> Option<Arc<Connection>> {
        self.connections.read().unwrap().get(name).cloned()
    }

    /// The OAuth2 authorization-code provider for `name`, if that's how it's
    /// configured. Callers use this to drive `begin_authorization`/
    /// `cancel_authorization` directly; the supervisor itself never starts a
    /// flow since doing so is triggered by an external operator action.
    pub fn auth_code_provider(&self, name: &str) -> Option<Arc<OAuth2AuthCodeProvider>> {
        self.connection(name)?.auth_code_provider.clone()
    }

    /// Starts connections to every configured server in parallel. A single
    /// server's connect failure does not abort the others — it is left in
    /// `Failed`/`Disconnected` with the error recorded.
    pub async fn initialize(self: &Arc<Self>) {
        let names = self.list_server_names();
        let tasks = names.into_iter().map(|name| {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(err) = this.connect_one(&name).await {
                    warn!(server_name = %name, error = %err, "initial connect failed");
                }
            })
        });
        futures_util::future::join_all(tasks).await;
    }

    /// Manual reconnect: rejects if already
    /// connected or the name is unknown, otherwise resets the attempt counter
    /// and performs one fresh connect, surfacing failures to the caller.
    pub async fn reconnect_server(self: &Arc<Self>, name: &str) -> Result<()> {
        let connection = self
            .connection(name)
            .ok_or_else(|| FunnelError::config(format!("unknown server '{name}'")))?;

        if connection.snapshot().status == ConnectionStatus::Connected {
            return Err(FunnelError::config(format!("server '{name}' is already connected")));
        }

        {
            let mut reconnect = connection.reconnect.lock().await;
            reconnect.manual_reconnect();
        }
        connection.terminating.store(false, Ordering::SeqCst);
        self.connect_one(name).await
    }

    /// Idempotent disconnect: transitions
    /// through `Terminating` to `Disconnected`, cancels any pending auth flow,
    /// and rejects every outstanding request on this connection.
    pub async fn disconnect_server(self: &Arc<Self>, name: &str) -> Result<()> {
        let Some(connection) = self.connection(name) else {
            return Err(FunnelError::config(format!("unknown server '{name}'")));
        };

        if connection.snapshot().status == ConnectionStatus::Disconnected {
            return Ok(());
        }

        connection.terminating.store(true, Ordering::SeqCst);
        connection.set_status(ConnectionStatus::Terminating, None);

        if let Some(task) = connection.pump_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = connection.timeout_sweep_task.lock().await.take() {
            task.abort();
        }

        {
            let mut transport = connection.transport.lock().await;
            let _ = transport.close(Some(1000), Some("disconnect requested".to_string())).await;
        }

        if let Some(provider) = &connection.auth_code_provider {
            provider.cancel_all_pending().await;
        }
        connection.correlator.reject_all().await;
        connection.set_status(ConnectionStatus::Disconnected, None);
        self.events.publish(ServerEvent::Disconnected {
            server_name: name.to_string(),
            timestamp: OffsetDateTime::now_utc(),
            reason: Some("disconnect requested".to_string()),
        });
        Ok(())
    }

    /// Disconnects every configured server and cancels each auth provider's
    /// background task (proactive refresh timer, OAuth2 sweep) — the
    /// explicit-ownership shutdown path spec.md §9 calls for in place of a
    /// `FinalizationRegistry`. A CLI driver embedding this core calls this once
    /// before exit; leaving any server in `error`/`Failed` afterward is its
    /// signal to use exit code `2` (spec.md §6).
    pub async fn shutdown(self: &Arc<Self>) {
        let names = self.list_server_names();
        for name in names {
            if let Err(err) = self.disconnect_server(&name).await {
                warn!(server_name = %name, error = %err, "error disconnecting server during shutdown");
            }
            if let Some(connection) = self.connection(&name) {
                connection.auth.destroy();
            }
        }
    }

    /// Forwards a JSON-RPC request to `name`, preserving its `id` end-to-end,
    /// and resolves once the correlator observes the matching response (or the
    /// deadline or connection loss fires first). Fails fast with a transport
    /// `NotConnected` error rather than implicitly queuing.
    pub async fn forward_request(&self, name: &str, id: Value, message: Value, deadline: Instant) -> Result<Outcome> {
        let connection = self
            .connection(name)
            .ok_or_else(|| FunnelError::config(format!("unknown server '{name}'")))?;

        if connection.snapshot().status != ConnectionStatus::Connected {
            return Err(FunnelError::transport(
                crate::error::TransportErrorKind::NotConnected,
                format!("server '{name}' is not connected"),
            ));
        }

        let handle = connection.correlator.register(id, deadline).await?;
        {
            let transport = connection.transport.lock().await;
            transport.send(message).await?;
        }
        Ok(handle.wait().await)
    }

    async fn connect_one(self: &Arc<Self>, name: &str) -> Result<()> {
        let Some(connection) = self.connection(name) else {
            return Err(FunnelError::config(format!("unknown server '{name}'")));
        };

        {
            let mut reconnect = connection.reconnect.lock().await;
            reconnect.begin_connecting();
        }
        connection.set_status(ConnectionStatus::Connecting, None);

        let (tx, rx) = mpsc::unbounded_channel();
        let start_result = {
            let mut transport = connection.transport.lock().await;
            transport.start(connection.auth.clone(), tx).await
        };

        if let Err(err) = start_result {
            connection.set_status(ConnectionStatus::Failed, Some(err.to_string()));
            return Err(err);
        }

        {
            let mut reconnect = connection.reconnect.lock().await;
            reconnect.mark_connected();
        }
        connection.set_status(ConnectionStatus::Connected, None);
        self.events.publish(ServerEvent::Connected {
            server_name: name.to_string(),
            timestamp: OffsetDateTime::now_utc(),
        });

        let supervisor = self.clone();
        let connection_for_pump = connection.clone();
        let server_name = name.to_string();
        let pump = tokio::spawn(async move {
            supervisor.pump_events(connection_for_pump, server_name, rx).await;
        });
        *connection.pump_task.lock().await = Some(pump);

        let correlator = connection.correlator.clone();
        let sweep = tokio::spawn(async move {
            loop {
                tokio::time::sleep(TIMEOUT_SWEEP_INTERVAL).await;
                correlator.sweep_timeouts(Instant::now()).await;
            }
        });
        *connection.timeout_sweep_task.lock().await = Some(sweep);

        Ok(())
    }

    async fn pump_events(
        self: Arc<Self>,
        connection: Arc<Connection>,
        name: String,
        mut rx: mpsc::UnboundedReceiver<crate::transport::TransportEvent>,
    ) {
        use crate::transport::TransportEvent;
        while let Some(event) = rx.recv().await {
            match event {
                TransportEvent::Message(value) => {
                    self.dispatch_message(&connection, &value).await;
                }
                TransportEvent::Log(line) => {
                    debug!(server_name = %name, line = %crate::redact::sanitize_str(&line), "upstream log line");
                }
                TransportEvent::Error(message) => {
                    warn!(server_name = %name, error = %crate::redact::sanitize_str(&message), "transport error");
                }
                TransportEvent::Closed { code, reason, reconnect_hint } => {
                    self.handle_closed(&connection, &name, code, reason, reconnect_hint).await;
                    return;
                }
            }
        }
    }

    async fn dispatch_message(&self, connection: &Arc<Connection>, value: &Value) {
        let Some(id) = value.get("id").cloned() else {
            // Notifications have no id and nothing to correlate; downstream
            // dispatch of server-initiated notifications is out of scope here.
            return;
        };
        if let Some(error) = value.get("error") {
            connection.correlator.reject(&id, error.clone()).await;
        } else if let Some(result) = value.get("result") {
            connection.correlator.resolve(&id, result.clone()).await;
        } else {
            debug!(request_id = %id, "message carries neither result nor error; ignoring");
        }
    }

    async fn handle_closed(
        self: Arc<Self>,
        connection: &Arc<Connection>,
        name: &str,
        code: Option<u16>,
        reason: Option<String>,
        reconnect_hint: bool,
    ) {
        connection.correlator.reject_all().await;
        if let Some(task) = connection.timeout_sweep_task.lock().await.take() {
            task.abort();
        }

        if connection.terminating.load(Ordering::SeqCst) {
            // `disconnect_server` already owns this transition.
            return;
        }

        self.events.publish(ServerEvent::Disconnected {
            server_name: name.to_string(),
            timestamp: OffsetDateTime::now_utc(),
            reason: reason.clone(),
        });

        if !reconnect_hint || connection.config.transport.reconnect().is_none() {
            connection.set_status(
                ConnectionStatus::Disconnected,
                reason.clone().or_else(|| code.map(|c| format!("closed with code {c}"))),
            );
            return;
        }

        let change = {
            let mut reconnect = connection.reconnect.lock().await;
            reconnect.record_loss(reason.clone().unwrap_or_else(|| "connection lost".to_string()))
        };

        match change.to {
            ReconnectState::Failed => {
                connection.set_status(ConnectionStatus::Failed, change.error.clone());
            }
            ReconnectState::Reconnecting => {
                connection.set_status(ConnectionStatus::Reconnecting, change.error.clone());
                let delay = change.next_retry_delay.unwrap_or_default();
                self.events.publish(ServerEvent::Reconnecting {
                    server_name: name.to_string(),
                    timestamp: OffsetDateTime::now_utc(),
                    retry_attempt: change.retry_count,
                    next_retry_delay_ms: delay.as_millis() as u64,
                });

                let supervisor = self.clone();
                let name = name.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(err) = supervisor.connect_one(&name).await {
                        info!(server_name = %name, error = %err, "scheduled reconnect attempt failed");
                    }
                });
            }
            other => {
                debug!(server_name = %name, state = ?other, "unexpected transition after connection loss");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;

    fn stdio_config(name: &str) -> UpstreamConfig {
        UpstreamConfig {
            name: name.to_string(),
            transport: TransportConfig::Stdio { command: "cat".to_string(), args: vec![], env: HashMap::new() },
            auth: AuthConfig::None,
        }
    }

    #[tokio::test]
    async fn unknown_server_status_is_none() {
        let registry = ProviderRegistry::new();
        let supervisor = ProxySupervisor::new(vec![], registry).unwrap();
        assert!(supervisor.get_server_status("missing").is_none());
    }

    #[tokio::test]
    async fn initialize_connects_configured_stdio_servers() {
        let registry = ProviderRegistry::new();
        let supervisor = ProxySupervisor::new(vec![stdio_config("alpha")], registry).unwrap();
        supervisor.initialize().await;
        let status = supervisor.get_server_status("alpha").unwrap();
        assert_eq!(status.status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn reconnect_rejects_when_already_connected() {
        let registry = ProviderRegistry::new();
        let supervisor = ProxySupervisor::new(vec![stdio_config("alpha")], registry).unwrap();
        supervisor.initialize().await;
        let err = supervisor.reconnect_server("alpha").await.unwrap_err();
        assert!(matches!(err, FunnelError::Config { .. }));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let registry = ProviderRegistry::new();
        let supervisor = ProxySupervisor::new(vec![stdio_config("alpha")], registry).unwrap();
        supervisor.initialize().await;
        supervisor.disconnect_server("alpha").await.unwrap();
        supervisor.disconnect_server("alpha").await.unwrap();
        let status = supervisor.get_server_status("alpha").unwrap();
        assert_eq!(status.status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn unknown_server_operations_fail() {
        let registry = ProviderRegistry::new();
        let supervisor = ProxySupervisor::new(vec![], registry).unwrap();
        assert!(supervisor.reconnect_server("ghost").await.is_err());
        assert!(supervisor.disconnect_server("ghost").await.is_err());
    }

    #[tokio::test]
    async fn shutdown_disconnects_every_server() {
        let registry = ProviderRegistry::new();
        let supervisor =
            ProxySupervisor::new(vec![stdio_config("alpha"), stdio_config("beta")], registry).unwrap();
        supervisor.initialize().await;
        supervisor.shutdown().await;
        assert_eq!(supervisor.get_server_status("alpha").unwrap().status, ConnectionStatus::Disconnected);
        assert_eq!(supervisor.get_server_status("beta").unwrap().status, ConnectionStatus::Disconnected);
    }
}
