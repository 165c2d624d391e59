//! WebSocket transport, following
//! `turbomcp-transport`'s `tokio-tungstenite`-based connection handling, since
//! there's no WebSocket transport elsewhere in this stack to generalize from.
//!
//! Close-code semantics (see DESIGN.md for the reasoning):
//! 1000 is a clean shutdown and never triggers reconnection; 1006 (abnormal
//! closure) is treated as a retryable connection loss; 1002 (protocol error)
//! never reconnects, and the 4000-4999 application-defined range is treated
//! as `1002`-class per spec.md §9's open-question resolution: no auto-reconnect,
//! code surfaced verbatim.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::{Transport, TransportEvent};
use crate::auth::AuthProvider;
use crate::error::{FunnelError, Result, TransportErrorKind};

const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;

pub struct WebSocketTransport {
    url: String,
    ping_interval: Duration,
    connected: Arc<AtomicBool>,
    sink: Option<Arc<Mutex<WsSink>>>,
    reader_task: Option<tokio::task::JoinHandle<()>>,
    ping_task: Option<tokio::task::JoinHandle<()>>,
    last_pong: Arc<std::sync::Mutex<std::time::Instant>>,
}

/// Close codes that should never trigger an automatic reconnection attempt:
/// a clean shutdown (1000) or a protocol violation (1002) both mean the
/// upstream is telling us to stop, not retry. The 4000-4999 application-defined
/// range has no documented policy upstream, so per spec.md §9 it is treated as
/// `1002`-class pending operator guidance.
fn is_terminal_close_code(code: u16) -> bool {
    code == 1000 || code == 1002 || (4000..=4999).contains(&code)
}

impl WebSocketTransport {
    pub fn new(url: String, ping_interval_ms: Option<u64>) -> Result<Self> {
        let parsed = url::Url::parse(&url).map_err(FunnelError::from)?;
        if parsed.scheme() != "wss" && parsed.scheme() != "ws" {
            return Err(FunnelError::transport(
                TransportErrorKind::InvalidUrl,
                format!("unsupported scheme: {}", parsed.scheme()),
            ));
        }
        Ok(Self {
            url,
            ping_interval: ping_interval_ms.map(Duration::from_millis).unwrap_or(DEFAULT_PING_INTERVAL),
            connected: Arc::new(AtomicBool::new(false)),
            sink: None,
            reader_task: None,
            ping_task: None,
            last_pong: Arc::new(std::sync::Mutex::new(std::time::Instant::now())),
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn start(
        &mut self,
        auth: Arc<dyn AuthProvider>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<()> {
        let headers = auth.get_headers().await?;

        let mut request = tokio_tungstenite::tungstenite::client::IntoClientRequest::into_client_request(
            self.url.as_str(),
        )
        .map_err(|e| FunnelError::transport(TransportErrorKind::InvalidUrl, e.to_string()))?;
        for (key, value) in &headers {
            let name = http::header::HeaderName::try_from(key.as_str())
                .map_err(|e| FunnelError::transport(TransportErrorKind::InvalidUrl, e.to_string()))?;
            let val = http::header::HeaderValue::try_from(value.as_str())
                .map_err(|e| FunnelError::transport(TransportErrorKind::InvalidUrl, e.to_string()))?;
            request.headers_mut().insert(name, val);
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| FunnelError::transport(TransportErrorKind::ConnectionFailed, e.to_string()))?;
        let (sink, mut source) = stream.split();
        let sink = Arc::new(Mutex::new(sink));

        self.connected.store(true, Ordering::SeqCst);
        self.sink = Some(sink.clone());
        *self.last_pong.lock().unwrap() = std::time::Instant::now();

        let connected = self.connected.clone();
        let reader_events = events.clone();
        let reader_last_pong = self.last_pong.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match source.next().await {
                    Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<Value>(&text) {
                        Ok(value) => {
                            if reader_events.send(TransportEvent::Message(value)).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = reader_events
                                .send(TransportEvent::Error(format!("malformed json-rpc frame: {e}")));
                        }
                    },
                    Some(Ok(WsMessage::Binary(bytes))) => match serde_json::from_slice::<Value>(&bytes) {
                        Ok(value) => {
                            if reader_events.send(TransportEvent::Message(value)).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = reader_events
                                .send(TransportEvent::Error(format!("malformed json-rpc frame: {e}")));
                        }
                    },
                    Some(Ok(WsMessage::Ping(_))) => {}
                    Some(Ok(WsMessage::Pong(_))) => {
                        *reader_last_pong.lock().unwrap() = std::time::Instant::now();
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        connected.store(false, Ordering::SeqCst);
                        let code = frame.as_ref().map(|f| u16::from(f.code));
                        let reason = frame.map(|f| f.reason.to_string());
                        let reconnect_hint = code.map(|c| !is_terminal_close_code(c)).unwrap_or(true);
                        let _ = reader_events.send(TransportEvent::Closed { code, reason, reconnect_hint });
                        return;
                    }
                    Some(Ok(WsMessage::Frame(_))) => {}
                    Some(Err(e)) => {
                        connected.store(false, Ordering::SeqCst);
                        // Abnormal closures (no close frame at all) map to
                        // 1006 per the WebSocket spec, which this crate
                        // treats as a retryable connection loss.
                        let _ = reader_events.send(TransportEvent::Closed {
                            code: Some(1006),
                            reason: Some(e.to_string()),
                            reconnect_hint: true,
                        });
                        return;
                    }
                    None => {
                        connected.store(false, Ordering::SeqCst);
                        let _ = reader_events.send(TransportEvent::Closed {
                            code: Some(1006),
                            reason: Some("connection closed without a close frame".to_string()),
                            reconnect_hint: true,
                        });
                        return;
                    }
                }
            }
        });

        let ping_connected = self.connected.clone();
        let ping_sink = sink.clone();
        let ping_interval = self.ping_interval;
        let ping_last_pong = self.last_pong.clone();
        let ping_events = events.clone();
        let reader_abort = reader_task.abort_handle();
        let ping_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(ping_interval);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                if !ping_connected.load(Ordering::SeqCst) {
                    return;
                }
                if ping_last_pong.lock().unwrap().elapsed() > ping_interval {
                    ping_connected.store(false, Ordering::SeqCst);
                    let _ = ping_events.send(TransportEvent::Closed {
                        code: Some(1006),
                        reason: Some("missed heartbeat pong within one ping interval".to_string()),
                        reconnect_hint: true,
                    });
                    reader_abort.abort();
                    return;
                }
                let mut guard = ping_sink.lock().await;
                if guard.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    return;
                }
            }
        });

        self.reader_task = Some(reader_task);
        self.ping_task = Some(ping_task);
        Ok(())
    }

    async fn send(&self, message: Value) -> Result<()> {
        let Some(sink) = &self.sink else {
            return Err(FunnelError::transport(TransportErrorKind::NotConnected, "websocket transport not started"));
        };
        if !self.connected.load(Ordering::SeqCst) {
            return Err(FunnelError::transport(TransportErrorKind::NotConnected, "websocket not open"));
        }
        let text = serde_json::to_string(&message)?;
        let mut guard = sink.lock().await;
        guard
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| FunnelError::transport(TransportErrorKind::SendFailed, e.to_string()))
    }

    async fn close(&mut self, code: Option<u16>, reason: Option<String>) -> Result<()> {
        if let Some(task) = self.ping_task.take() {
            task.abort();
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(sink) = self.sink.take() {
            let close_frame = code.map(|c| CloseFrame {
                code: CloseCode::from(c),
                reason: reason.unwrap_or_default().into(),
            });
            let mut guard = sink.lock().await;
            let _ = guard.send(WsMessage::Close(close_frame)).await;
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_shutdown_is_terminal() {
        assert!(is_terminal_close_code(1000));
    }

    #[test]
    fn protocol_error_is_terminal() {
        assert!(is_terminal_close_code(1002));
    }

    #[test]
    fn abnormal_closure_is_not_terminal() {
        assert!(!is_terminal_close_code(1006));
    }

    #[test]
    fn application_range_is_terminal() {
        assert!(is_terminal_close_code(4000));
        assert!(is_terminal_close_code(4999));
    }

    #[test]
    fn rejects_non_ws_scheme() {
        let err = WebSocketTransport::new("http://example.com/ws".to_string(), None).unwrap_err();
        assert!(matches!(err, FunnelError::Transport { kind: TransportErrorKind::InvalidUrl, .. }));
    }
}
