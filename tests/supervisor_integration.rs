//! End-to-end exercise of the supervisor/correlator/reconnection interplay
//! against a real (not mocked) upstream: a `cat` child process driven through
//! the stdio transport, in the spirit of the teacher's `tests/http_api.rs`
//! (a real router against a real `ServerManager`, not a stub).

use std::collections::HashMap;
use std::time::Duration;

use mcp_funnel_core::config::{AuthConfig, TransportConfig, UpstreamConfig};
use mcp_funnel_core::correlator::Outcome;
use mcp_funnel_core::ProxySupervisor;
use serde_json::json;

fn registry() -> std::sync::Arc<mcp_funnel_core::auth::ProviderRegistry> {
    mcp_funnel_core::auth::ProviderRegistry::new()
}

fn cat_config(name: &str) -> UpstreamConfig {
    UpstreamConfig {
        name: name.to_string(),
        transport: TransportConfig::Stdio { command: "cat".to_string(), args: vec![], env: HashMap::new() },
        auth: AuthConfig::None,
    }
}

#[tokio::test]
async fn forward_request_round_trips_through_a_real_stdio_child() {
    let supervisor = ProxySupervisor::new(vec![cat_config("echo")], registry()).unwrap();
    supervisor.initialize().await;
    assert_eq!(
        supervisor.get_server_status("echo").unwrap().status,
        mcp_funnel_core::ConnectionStatus::Connected
    );

    // `cat` echoes back exactly what it's fed, so a request already shaped
    // like a response stands in for "the upstream answered" without needing
    // a real MCP server on the other end.
    let id = json!(1);
    let message = json!({"jsonrpc": "2.0", "id": 1, "result": {"pong": true}});
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

    let outcome = supervisor.forward_request("echo", id, message, deadline).await.unwrap();
    match outcome {
        Outcome::Response(value) => assert_eq!(value, json!({"pong": true})),
        other => panic!("unexpected outcome: {other:?}"),
    }

    supervisor.shutdown().await;
}

#[tokio::test]
async fn forward_request_fails_fast_when_not_connected() {
    let supervisor = ProxySupervisor::new(vec![cat_config("echo")], registry()).unwrap();
    // Deliberately skip initialize(): the server is still `Disconnected`.
    let err = supervisor
        .forward_request(
            "echo",
            json!(1),
            json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
            tokio::time::Instant::now() + Duration::from_secs(1),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        mcp_funnel_core::FunnelError::Transport {
            kind: mcp_funnel_core::error::TransportErrorKind::NotConnected,
            ..
        }
    ));
}

#[tokio::test]
async fn unanswered_request_times_out_via_the_sweep_task() {
    let supervisor = ProxySupervisor::new(vec![cat_config("echo")], registry()).unwrap();
    supervisor.initialize().await;

    // A message with no "result"/"error" key never resolves the correlator
    // entry once echoed back, so the only way out is the timeout sweep.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(50);
    let outcome = supervisor
        .forward_request(
            "echo",
            json!(42),
            json!({"jsonrpc": "2.0", "id": 42, "method": "slow"}),
            deadline,
        )
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::Timeout));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn disconnect_rejects_pending_requests_and_publishes_an_event() {
    let supervisor = ProxySupervisor::new(vec![cat_config("echo")], registry()).unwrap();
    let mut events = supervisor.events().subscribe();
    supervisor.initialize().await;
    // Drain the Connected event so the next recv() is the Disconnected one.
    let _ = events.recv().await.unwrap();

    let disconnect_supervisor = supervisor.clone();
    let pending = tokio::spawn(async move {
        disconnect_supervisor
            .forward_request(
                "echo",
                json!(7),
                json!({"jsonrpc": "2.0", "id": 7, "method": "never answered"}),
                tokio::time::Instant::now() + Duration::from_secs(30),
            )
            .await
    });

    // Give the request a moment to register with the correlator before the
    // disconnect races it.
    tokio::time::sleep(Duration::from_millis(20)).await;
    supervisor.disconnect_server("echo").await.unwrap();

    let outcome = pending.await.unwrap().unwrap();
    assert!(matches!(outcome, Outcome::Canceled));

    let event = events.recv().await.unwrap();
    assert_eq!(event.name(), "server.disconnected");
    assert_eq!(
        supervisor.get_server_status("echo").unwrap().status,
        mcp_funnel_core::ConnectionStatus::Disconnected
    );
}

#[tokio::test]
async fn reconnect_rejects_unknown_server_and_already_connected_server() {
    let supervisor = ProxySupervisor::new(vec![cat_config("echo")], registry()).unwrap();
    supervisor.initialize().await;

    assert!(supervisor.reconnect_server("ghost").await.is_err());
    assert!(supervisor.reconnect_server("echo").await.is_err());

    supervisor.disconnect_server("echo").await.unwrap();
    supervisor.reconnect_server("echo").await.unwrap();
    assert_eq!(
        supervisor.get_server_status("echo").unwrap().status,
        mcp_funnel_core::ConnectionStatus::Connected
    );

    supervisor.shutdown().await;
}
