//! Stdio transport: spawns a child process and frames JSON-RPC over its
//! stdin/stdout. `daemon/server_manager.rs::ManagedServer::spawn_local`
//! supplies the command/args/env spawn shape and graceful-termination
//! discipline; its PID-file bookkeeping is downstream housekeeping and is
//! dropped here. Request correlation stays at the supervisor layer, so this
//! transport frames raw JSON-RPC lines rather than going through `rmcp`'s own
//! `Service`/`Peer` abstraction, which owns correlation internally.

use std::collections::HashMap;
use std::process::Stdio as ProcStdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

use super::{Transport, TransportEvent};
use crate::auth::AuthProvider;
use crate::error::{FunnelError, Result, TransportErrorKind};

/// Grace period between SIGTERM and SIGKILL on close.
const TERMINATION_GRACE: Duration = Duration::from_secs(5);

pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    child: Option<Child>,
    stdin: Option<Mutex<tokio::process::ChildStdin>>,
    reader_task: Option<tokio::task::JoinHandle<()>>,
}

impl StdioTransport {
    pub fn new(command: String, args: Vec<String>, env: HashMap<String, String>) -> Self {
        Self { command, args, env, child: None, stdin: None, reader_task: None }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(
        &mut self,
        auth: Arc<dyn AuthProvider>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<()> {
        // Stdio has nothing analogous to HTTP headers, but every transport
        // still does exactly one auth-provider touch per connect so a
        // provider with side effects (token acquisition) runs on schedule.
        let _ = auth.get_headers().await?;

        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(ProcStdio::piped())
            .stdout(ProcStdio::piped())
            .stderr(ProcStdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            FunnelError::transport(TransportErrorKind::ConnectionFailed, format!("spawn failed: {e}"))
        })?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let stdin = child.stdin.take().expect("piped stdin");

        let stdout_events = events.clone();
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(&line) {
                            Ok(value) => {
                                if stdout_events.send(TransportEvent::Message(value)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                let _ = stdout_events
                                    .send(TransportEvent::Error(format!("malformed json-rpc line: {e}")));
                            }
                        }
                    }
                    Ok(None) => {
                        let _ = stdout_events.send(TransportEvent::Closed {
                            code: None,
                            reason: Some("child process exited".to_string()),
                            reconnect_hint: true,
                        });
                        break;
                    }
                    Err(e) => {
                        let _ = stdout_events.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
        });

        let stderr_events = events.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = stderr_events.send(TransportEvent::Log(line));
            }
        });

        self.child = Some(child);
        self.stdin = Some(Mutex::new(stdin));
        self.reader_task = Some(stdout_task);
        Ok(())
    }

    async fn send(&self, message: Value) -> Result<()> {
        let Some(stdin) = &self.stdin else {
            return Err(FunnelError::transport(TransportErrorKind::NotConnected, "stdio transport not started"));
        };
        let mut line = serde_json::to_string(&message)?;
        line.push('\n');
        let mut stdin = stdin.lock().await;
        stdin.write_all(line.as_bytes()).await.map_err(|e| {
            FunnelError::transport(TransportErrorKind::SendFailed, e.to_string())
        })
    }

    async fn close(&mut self, _code: Option<u16>, _reason: Option<String>) -> Result<()> {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.stdin = None;
        let Some(mut child) = self.child.take() else {
            return Ok(()); // idempotent: already closed
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: pid comes from a `Child` we still hold; sending SIGTERM to
            // a live, owned process id is the documented use of `libc::kill`.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            let graceful = tokio::time::timeout(TERMINATION_GRACE, child.wait()).await;
            if graceful.is_err() {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
            return Ok(());
        }

        let _ = child.start_kill();
        let _ = child.wait().await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.child.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NoAuthProvider;

    #[tokio::test]
    async fn echoes_json_rpc_line_back_as_a_message_event() {
        let mut transport =
            StdioTransport::new("cat".to_string(), vec![], HashMap::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.start(Arc::new(NoAuthProvider::new()), tx).await.unwrap();
        assert!(transport.is_connected());

        transport.send(serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        match event {
            TransportEvent::Message(v) => assert_eq!(v["method"], "ping"),
            other => panic!("unexpected event: {other:?}"),
        }

        transport.close(None, None).await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mut transport = StdioTransport::new("cat".to_string(), vec![], HashMap::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.start(Arc::new(NoAuthProvider::new()), tx).await.unwrap();
        transport.close(None, None).await.unwrap();
        transport.close(None, None).await.unwrap();
    }

    #[tokio::test]
    async fn send_before_start_fails_not_connected() {
        let transport = StdioTransport::new("cat".to_string(), vec![], HashMap::new());
        let err = transport.send(serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, FunnelError::Transport { kind: TransportErrorKind::NotConnected, .. }));
    }
}
