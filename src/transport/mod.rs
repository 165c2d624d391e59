//! Transport layer: four wire protocols behind one capability
//! trait. `daemon/server_manager.rs::ManagedServer`
//! dispatches Stdio/SSE/StreamableHTTP leaning on `rmcp`'s own
//! transport types; WebSocket connection handling here follows
//! `turbomcp-transport`'s approach instead, since that's a protocol
//! with no upstream analogue to generalize from.
//!
//! Capability composition is expressed as a single trait plus four small
//! structs, rather than a base class.

mod sse;
mod stdio;
mod streamable_http;
mod websocket;

pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use streamable_http::StreamableHttpTransport;
pub use websocket::WebSocketTransport;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::auth::AuthProvider;
use crate::error::Result;

/// Delivered to the owning connection's observer in arrival order, one
/// connection's events handled cooperatively rather than interleaved.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(Value),
    /// Structured log line forwarded from a child process's stderr (Stdio only).
    Log(String),
    Error(String),
    /// The connection closed; `code`/`reason` are populated for WebSocket,
    /// `None` otherwise. `reconnect_hint` tells the reconnection manager whether
    /// this closure should be treated as a retryable connection loss.
    Closed { code: Option<u16>, reason: Option<String>, reconnect_hint: bool },
}

/// Capability every transport variant implements. Observer
/// delivery happens through `events`, a channel the caller owns and polls —
/// this keeps the trait itself synchronous-looking and avoids boxing a
/// caller-supplied callback trait object per event.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the underlying channel, resolving auth headers from `auth` exactly
    /// once. Fails with a typed transport
    /// error on unreachable endpoint or auth failure. Every event observed
    /// after this point (`onMessage`/`onError`/`onClose`) is delivered, in
    /// arrival order, to `events`.
    async fn start(
        &mut self,
        auth: Arc<dyn AuthProvider>,
        events: tokio::sync::mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<()>;

    /// Serializes and writes `message`, returning once the wire has accepted it
    /// — not once a response arrives. Callers register a pending request with
    /// the correlator *before* calling `send` for request-bearing messages, to
    /// avoid a race with fast responses.
    async fn send(&self, message: Value) -> Result<()>;

    /// Idempotent; detaches listeners and closes the channel. Does not itself
    /// reject pending correlator entries — the supervisor does that once it
    /// observes the resulting `Closed` event, since the correlator is owned at
    /// the supervisor layer, not the transport layer.
    async fn close(&mut self, code: Option<u16>, reason: Option<String>) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// Shared "retry a send once after a 401 triggers refresh()" behavior.
/// Transports call this instead of reimplementing the refresh-then-retry
/// policy individually.
pub(crate) async fn send_with_reauth<F, Fut>(
    auth: &Arc<dyn AuthProvider>,
    attempt: F,
) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<SendOutcome>>,
{
    match attempt().await? {
        SendOutcome::Ok => Ok(()),
        SendOutcome::Unauthorized => {
            auth.refresh().await?;
            match attempt().await? {
                SendOutcome::Ok => Ok(()),
                SendOutcome::Unauthorized => Err(crate::error::FunnelError::auth(
                    crate::error::AuthErrorCode::UnknownError,
                    "request unauthorized after refresh retry",
                )),
            }
        }
    }
}

pub(crate) enum SendOutcome {
    Ok,
    Unauthorized,
}
