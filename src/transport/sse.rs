//! SSE transport: server→client messages arrive over a
//! long-lived `text/event-stream` GET, client→server messages are individual
//! HTTP POSTs. `daemon/server_manager.rs` handles remote connections this way
//! too, itself leaning on `rmcp`'s reqwest-backed SSE client transport; this
//! is re-expressed here with hand-rolled framing so auth headers and
//! reconnection stay under this crate's own control rather than `rmcp`'s
//! internal `Service`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};

use super::{send_with_reauth, SendOutcome, Transport, TransportEvent};
use crate::auth::AuthProvider;
use crate::error::{FunnelError, Result, TransportErrorKind};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SseTransport {
    url: String,
    timeout: Duration,
    http: reqwest::Client,
    auth: RwLock<Option<Arc<dyn AuthProvider>>>,
    connected: Arc<AtomicBool>,
    stream_task: Option<tokio::task::JoinHandle<()>>,
    post_endpoint: Arc<RwLock<Option<String>>>,
}

impl SseTransport {
    pub fn new(url: String, timeout_ms: Option<u64>) -> Result<Self> {
        let parsed = url::Url::parse(&url).map_err(FunnelError::from)?;
        if parsed.scheme() != "https" && parsed.scheme() != "http" {
            return Err(FunnelError::transport(
                TransportErrorKind::InvalidUrl,
                format!("unsupported scheme: {}", parsed.scheme()),
            ));
        }
        let is_localhost = matches!(parsed.host_str(), Some("localhost" | "127.0.0.1" | "::1"));
        if parsed.scheme() == "http" && !is_localhost {
            return Err(FunnelError::transport(
                TransportErrorKind::InvalidUrl,
                format!("plaintext http is only allowed against localhost: {url}"),
            ));
        }
        Ok(Self {
            url,
            timeout: timeout_ms.map(Duration::from_millis).unwrap_or(DEFAULT_TIMEOUT),
            http: reqwest::Client::new(),
            auth: RwLock::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            stream_task: None,
            post_endpoint: Arc::new(RwLock::new(None)),
        })
    }
}

/// Parses one `text/event-stream` frame's `data:` lines (SSE framing is
/// line-oriented: an event is terminated by a blank line, each field is
/// `field: value`). Returns the `event` name (defaulting to `"message"`) and
/// the joined `data` payload.
fn parse_sse_event(raw: &str) -> (String, String) {
    let mut event = String::from("message");
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            event = value.trim().to_string();
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim_start().to_string());
        }
    }
    (event, data_lines.join("\n"))
}

#[async_trait]
impl Transport for SseTransport {
    async fn start(
        &mut self,
        auth: Arc<dyn AuthProvider>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<()> {
        let headers = auth.get_headers().await?;
        *self.auth.write().await = Some(auth);

        let mut request = self.http.get(&self.url).timeout(self.timeout);
        for (key, value) in &headers {
            request = request.header(key, value);
        }
        // SSE requires this Accept header per the protocol; auth stays in
        // headers only, never appended to the URL as a query string.
        request = request.header("Accept", "text/event-stream");

        let response = request.send().await.map_err(|e| {
            FunnelError::transport(TransportErrorKind::ConnectionFailed, e.to_string())
        })?;
        if !response.status().is_success() {
            return Err(FunnelError::transport(
                TransportErrorKind::ConnectionFailed,
                format!("unexpected status: {}", response.status()),
            ));
        }

        // The endpoint event, if sent, tells us where to POST client messages;
        // absent that, POSTs go back to the same URL (common single-endpoint
        // deployments).
        *self.post_endpoint.write().await = Some(self.url.clone());

        self.connected.store(true, Ordering::SeqCst);
        let connected = self.connected.clone();
        let post_endpoint = self.post_endpoint.clone();

        let task = tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();
            loop {
                match byte_stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                        while let Some(pos) = buffer.find("\n\n") {
                            let raw_event: String = buffer.drain(..pos + 2).collect();
                            let (event_name, data) = parse_sse_event(&raw_event);
                            if event_name == "endpoint" {
                                *post_endpoint.write().await = Some(data);
                                continue;
                            }
                            if data.is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<Value>(&data) {
                                Ok(value) => {
                                    if events.send(TransportEvent::Message(value)).is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    let _ = events.send(TransportEvent::Error(format!(
                                        "malformed sse payload: {e}"
                                    )));
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        connected.store(false, Ordering::SeqCst);
                        let _ = events.send(TransportEvent::Closed {
                            code: None,
                            reason: Some(e.to_string()),
                            reconnect_hint: true,
                        });
                        return;
                    }
                    None => {
                        connected.store(false, Ordering::SeqCst);
                        let _ = events.send(TransportEvent::Closed {
                            code: None,
                            reason: Some("stream ended".to_string()),
                            reconnect_hint: true,
                        });
                        return;
                    }
                }
            }
        });

        self.stream_task = Some(task);
        Ok(())
    }

    async fn send(&self, message: Value) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(FunnelError::transport(TransportErrorKind::NotConnected, "sse transport not started"));
        }
        let Some(auth) = self.auth.read().await.clone() else {
            return Err(FunnelError::transport(TransportErrorKind::NotConnected, "sse transport not started"));
        };

        let attempt = || async move {
            let headers = auth.get_headers().await?;
            let endpoint = self.post_endpoint.read().await.clone().unwrap_or_else(|| self.url.clone());
            let mut request = self.http.post(&endpoint).timeout(self.timeout);
            for (key, value) in &headers {
                request = request.header(key, value);
            }
            let response = request
                .json(&message)
                .send()
                .await
                .map_err(|e| FunnelError::transport(TransportErrorKind::SendFailed, e.to_string()))?;
            if response.status() == reqwest::StatusCode::UNAUTHORIZED {
                return Ok(SendOutcome::Unauthorized);
            }
            if !response.status().is_success() {
                return Err(FunnelError::transport(
                    TransportErrorKind::SendFailed,
                    format!("unexpected status: {}", response.status()),
                ));
            }
            Ok(SendOutcome::Ok)
        };

        send_with_reauth(&auth, attempt).await
    }

    async fn close(&mut self, _code: Option<u16>, _reason: Option<String>) -> Result<()> {
        if let Some(task) = self.stream_task.take() {
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
