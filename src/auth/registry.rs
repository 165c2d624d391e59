//! Process-wide `state -> provider` registry for OAuth2 authorization-code
//! flows (spec.md §4.5 step 3, §5, §6, §9). Grounded on `turbomcp-auth::manager`'s
//! `once_cell::sync::Lazy<RwLock<...>>` global-registry-with-periodic-sweep
//! pattern, since the teacher crate has no OAuth2 code to generalize from.
//!
//! Per spec.md §4.5 step 3, what gets registered globally by `state` is the
//! *provider* — an out-of-band callback arriving on the downstream control
//! channel carries only `(state, code)` and must be dispatched to whichever
//! provider instance started that flow, without the caller needing to already
//! hold a reference to it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::Result;

/// Pending flows expire 5 minutes after creation if no callback arrives
/// (spec.md §3, §4.5 step 6).
pub const PENDING_FLOW_TTL: StdDuration = StdDuration::from_secs(5 * 60);

/// How often the sweep task checks for expired flows (spec.md §4.5 step 6).
const SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(2 * 60);

/// Capability a registered provider exposes to the registry: given the
/// authorization `code` and the flow's own PKCE verifier, complete the token
/// exchange. Kept separate from [`super::AuthProvider`] so the registry can
/// hold a type-erased handle without coupling to the full provider trait.
#[async_trait]
pub(super) trait FlowCompleter: Send + Sync {
    async fn exchange_code(&self, state: String, code: String, code_verifier: String) -> Result<()>;
}

/// One in-flight authorization-code + PKCE exchange (spec.md §3
/// `PendingAuthFlow`), keyed globally by `state`.
pub struct PendingAuthFlow {
    pub state: String,
    code_verifier: String,
    deadline: OffsetDateTime,
    provider: Arc<dyn FlowCompleter>,
}

impl PendingAuthFlow {
    fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.deadline
    }
}

/// Process-wide registry mapping an opaque `state` to its pending flow and
/// owning provider, protected by a short-held lock per spec.md §5. One instance
/// is shared by every `OAuth2AuthCodeProvider` in the process (spec.md §6
/// "Process-wide state: one OAuth `state -> provider` map per process").
pub struct ProviderRegistry {
    flows: RwLock<HashMap<String, PendingAuthFlow>>,
    sweep_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self { flows: RwLock::new(HashMap::new()), sweep_handle: std::sync::Mutex::new(None) }
    }
}

impl ProviderRegistry {
    pub fn new() -> Arc<Self> {
        let registry = Arc::new(Self::default());
        registry.spawn_sweep_task();
        registry
    }

    fn spawn_sweep_task(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let Some(registry) = weak.upgrade() else { break };
                registry.sweep_expired().await;
            }
        });
        *self.sweep_handle.lock().unwrap() = Some(handle);
    }

    /// Registers a new pending flow under `state`, with `provider` as the
    /// dispatch target for the eventual callback (spec.md §4.5 step 3).
    pub(super) async fn begin(
        &self,
        state: String,
        code_verifier: String,
        provider: Arc<dyn FlowCompleter>,
    ) {
        let flow = PendingAuthFlow {
            state: state.clone(),
            code_verifier,
            deadline: OffsetDateTime::now_utc() + PENDING_FLOW_TTL,
            provider,
        };
        self.flows.write().await.insert(state, flow);
    }

    /// Dispatches an out-of-band callback to the provider that registered
    /// `state`, completing its token exchange. Fails with an unknown-state error
    /// if `state` is unrecognized or already expired — `state` is strictly
    /// single-use (spec.md §3, §4.5 step 5).
    pub async fn complete(&self, state: &str, code: String) -> Result<()> {
        let flow = {
            let mut flows = self.flows.write().await;
            match flows.remove(state) {
                Some(flow) if !flow.is_expired(OffsetDateTime::now_utc()) => flow,
                Some(_) => {
                    return Err(crate::error::FunnelError::auth(
                        crate::error::AuthErrorCode::InvalidRequest,
                        "state has expired",
                    ))
                }
                None => {
                    return Err(crate::error::FunnelError::auth(
                        crate::error::AuthErrorCode::InvalidRequest,
                        "unknown or already-completed state",
                    ))
                }
            }
        };
        flow.provider.exchange_code(state.to_string(), code, flow.code_verifier).await
    }

    /// Explicit cancellation, e.g. the owning provider is destroyed.
    pub async fn cancel(&self, state: &str) {
        self.flows.write().await.remove(state);
    }

    async fn sweep_expired(&self) {
        let now = OffsetDateTime::now_utc();
        let mut flows = self.flows.write().await;
        let expired: Vec<String> =
            flows.iter().filter(|(_, f)| f.is_expired(now)).map(|(s, _)| s.clone()).collect();
        for state in &expired {
            flows.remove(state);
        }
        drop(flows);
        for state in expired {
            info!(event = "auth:oauth_state_expired", state = %state, "sweeping expired pending authorization flow");
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.flows.read().await.len()
    }
}

impl Drop for ProviderRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self.sweep_handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingCompleter {
        calls: Arc<AtomicUsize>,
        last_code: std::sync::Mutex<Option<String>>,
    }

    #[async_trait]
    impl FlowCompleter for RecordingCompleter {
        async fn exchange_code(&self, _state: String, code: String, _verifier: String) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_code.lock().unwrap() = Some(code);
            Ok(())
        }
    }

    #[tokio::test]
    async fn complete_dispatches_to_the_registering_provider() {
        let registry = ProviderRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let completer =
            Arc::new(RecordingCompleter { calls: calls.clone(), last_code: std::sync::Mutex::new(None) });
        registry.begin("state-1".into(), "verifier".into(), completer.clone()).await;

        registry.complete("state-1", "auth-code".into()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(completer.last_code.lock().unwrap().as_deref(), Some("auth-code"));
    }

    #[tokio::test]
    async fn complete_fails_for_unknown_state() {
        let registry = ProviderRegistry::new();
        let err = registry.complete("nonexistent", "code".into()).await.unwrap_err();
        assert!(matches!(err, crate::error::FunnelError::Auth { .. }));
    }

    #[tokio::test]
    async fn state_is_single_use() {
        let registry = ProviderRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let completer =
            Arc::new(RecordingCompleter { calls: calls.clone(), last_code: std::sync::Mutex::new(None) });
        registry.begin("state-1".into(), "verifier".into(), completer).await;

        registry.complete("state-1", "code".into()).await.unwrap();
        let err = registry.complete("state-1", "other-code".into()).await.unwrap_err();
        assert!(matches!(err, crate::error::FunnelError::Auth { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_removes_pending_flow() {
        let registry = ProviderRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let completer =
            Arc::new(RecordingCompleter { calls: calls.clone(), last_code: std::sync::Mutex::new(None) });
        registry.begin("state-1".into(), "verifier".into(), completer).await;
        registry.cancel("state-1").await;
        assert_eq!(registry.pending_count().await, 0);
        assert!(registry.complete("state-1", "code".into()).await.is_err());
    }
}
