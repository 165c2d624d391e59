//! Request correlator: maps outstanding JSON-RPC request ids on
//! one connection to the waiting caller. `rmcp` delegates this to its own
//! `RunningService`/`Peer` internals; this crate owns id matching directly
//! instead, using a `Mutex`-guarded `HashMap` locking idiom.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::warn;

use crate::error::{FunnelError, Result};

/// Outcome delivered to a registered caller exactly once.
#[derive(Debug)]
pub enum Outcome {
    Response(Value),
    Error(Value),
    Timeout,
    Canceled,
}

struct Entry {
    deadline: Instant,
    sender: oneshot::Sender<Outcome>,
}

/// A handle a caller awaits for the outcome of one `send()`.
pub struct PendingHandle {
    receiver: oneshot::Receiver<Outcome>,
}

impl PendingHandle {
    /// Awaits the outcome. Only resolves once, by construction — the sender half
    /// is consumed by whichever of resolve/reject/timeout/reject_all fires first.
    pub async fn wait(self) -> Outcome {
        self.receiver.await.unwrap_or(Outcome::Canceled)
    }
}

/// Canonicalizes a JSON-RPC id (string or number) into a hashable
/// key. `serde_json::Value` itself does not implement `Hash` (its `Number`
/// variant can hold a float), so ids are keyed by their canonical JSON text.
fn request_key(id: &Value) -> String {
    serde_json::to_string(id).unwrap_or_default()
}

/// Per-connection outstanding-request map.
#[derive(Default)]
pub struct RequestCorrelator {
    pending: Mutex<HashMap<String, Entry>>,
}

impl RequestCorrelator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `id` with a deadline, returning a handle the caller awaits.
    /// Fails if `id` is already outstanding on this connection.
    pub async fn register(&self, id: Value, deadline: Instant) -> Result<PendingHandle> {
        let key = request_key(&id);
        let mut pending = self.pending.lock().await;
        if pending.contains_key(&key) {
            return Err(FunnelError::config(format!("request id {id} is already outstanding")));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(key, Entry { deadline, sender: tx });
        Ok(PendingHandle { receiver: rx })
    }

    /// Resolves `id` with a successful result. No-op (with a structured warning)
    /// if `id` is unknown — a late response arriving after timeout/rejection.
    pub async fn resolve(&self, id: &Value, result: Value) {
        self.complete(id, Outcome::Response(result)).await;
    }

    /// Rejects `id` with an error payload.
    pub async fn reject(&self, id: &Value, error: Value) {
        self.complete(id, Outcome::Error(error)).await;
    }

    async fn complete(&self, id: &Value, outcome: Outcome) {
        let key = request_key(id);
        let mut pending = self.pending.lock().await;
        match pending.remove(&key) {
            Some(entry) => {
                let _ = entry.sender.send(outcome);
            }
            None => {
                warn!(request_id = %id, "discarding late response for unknown or already-resolved request id");
            }
        }
    }

    /// Sweeps entries whose deadline has passed, rejecting each with `Timeout`.
    /// Intended to be driven by a periodic timer owned by the connection's
    /// supervisor task.
    pub async fn sweep_timeouts(&self, now: Instant) {
        let mut pending = self.pending.lock().await;
        let expired: Vec<String> = pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(entry) = pending.remove(&id) {
                let _ = entry.sender.send(Outcome::Timeout);
            }
        }
    }

    /// Rejects every outstanding request on this connection, e.g. on connection
    /// loss or explicit disconnect.
    pub async fn reject_all(&self) {
        let mut pending = self.pending.lock().await;
        for (_, entry) in pending.drain() {
            let _ = entry.sender.send(Outcome::Canceled);
        }
    }

    pub async fn outstanding_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn registering_duplicate_id_fails() {
        let correlator = RequestCorrelator::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let _handle = correlator.register(json!(1), deadline).await.unwrap();
        let err = correlator.register(json!(1), deadline).await.unwrap_err();
        assert!(matches!(err, FunnelError::Config { .. }));
    }

    #[tokio::test]
    async fn resolve_delivers_exactly_one_outcome() {
        let correlator = RequestCorrelator::new();
        let handle = correlator.register(json!(1), Instant::now() + Duration::from_secs(5)).await.unwrap();
        correlator.resolve(&json!(1), json!({"ok": true})).await;
        match handle.wait().await {
            Outcome::Response(v) => assert_eq!(v, json!({"ok": true})),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn late_response_for_unknown_id_is_discarded() {
        let correlator = RequestCorrelator::new();
        // No register() call for id 99 — resolve should not panic.
        correlator.resolve(&json!(99), json!("late")).await;
        assert_eq!(correlator.outstanding_count().await, 0);
    }

    #[tokio::test]
    async fn sweep_timeouts_rejects_expired_entries() {
        let correlator = RequestCorrelator::new();
        let past_deadline = Instant::now() - Duration::from_millis(1);
        let handle = correlator.register(json!(1), past_deadline).await.unwrap();
        correlator.sweep_timeouts(Instant::now()).await;
        assert!(matches!(handle.wait().await, Outcome::Timeout));
    }

    #[tokio::test]
    async fn reject_all_rejects_every_outstanding_request() {
        let correlator = RequestCorrelator::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let h1 = correlator.register(json!(1), deadline).await.unwrap();
        let h2 = correlator.register(json!(2), deadline).await.unwrap();
        correlator.reject_all().await;
        assert!(matches!(h1.wait().await, Outcome::Canceled));
        assert!(matches!(h2.wait().await, Outcome::Canceled));
        assert_eq!(correlator.outstanding_count().await, 0);
    }
}
