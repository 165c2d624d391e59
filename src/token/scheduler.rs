//! Proactive refresh scheduling, following the signal-driven background-task
//! idiom in `daemon/serve.rs`'s long-lived `tokio::select!` loop, and
//! `turbomcp-auth::manager`'s periodic-sweep-task pattern for the
//! "reschedule on failure" behavior — there's no token refresh logic
//! elsewhere in this stack to generalize from directly.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use super::ITokenStorage;

/// Default lead time before `expires_at` at which a refresh is attempted.
pub const DEFAULT_LEAD: StdDuration = StdDuration::from_secs(60);

/// Drives a single provider's proactive refresh timer. Owns the background task
/// and cancels it on drop — the supervisor owns providers and calls destroy
/// on them explicitly, in place of a `FinalizationRegistry`.
pub struct RefreshScheduler {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<Notify>,
}

impl RefreshScheduler {
    /// Spawns a task that re-derives the next wakeup from the current token on
    /// storage every time it fires, so a manual `getHeaders()`-driven refresh
    /// outside the scheduler is automatically picked up on the next tick.
    pub fn spawn<F, Fut>(
        storage: Arc<dyn ITokenStorage>,
        lead: StdDuration,
        mut refresh: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), String>> + Send,
    {
        let shutdown = Arc::new(Notify::new());
        let task_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut backoff = StdDuration::from_secs(1);
            loop {
                let wait = next_wait(storage.as_ref(), lead).await;
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = task_shutdown.notified() => break,
                }
                match refresh().await {
                    Ok(()) => backoff = StdDuration::from_secs(1),
                    Err(reason) => {
                        warn!(reason, "token refresh failed, retrying with backoff");
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = task_shutdown.notified() => break,
                        }
                        backoff = bounded_backoff(storage.as_ref(), backoff).await;
                    }
                }
            }
        });
        Self { handle: Some(handle), shutdown }
    }

    /// Cancels the background task. Idempotent.
    pub fn destroy(&mut self) {
        self.shutdown.notify_waiters();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn next_wait(storage: &dyn ITokenStorage, lead: StdDuration) -> StdDuration {
    let lead = TimeDuration::try_from(lead).unwrap_or(TimeDuration::ZERO);
    match storage.retrieve().await {
        Some(token) => {
            let target = token.expires_at - lead;
            let now = OffsetDateTime::now_utc();
            if target <= now {
                StdDuration::from_secs(0)
            } else {
                StdDuration::try_from(target - now).unwrap_or(StdDuration::from_secs(1))
            }
        }
        // No token cached yet: check back soon rather than sleeping forever.
        None => StdDuration::from_secs(5),
    }
}

/// On failure, backoff doubles but is bounded by the token's own remaining
/// lifetime (spec.md §4.6: "retry with exponential backoff bounded by the
/// token's remaining life").
async fn bounded_backoff(storage: &dyn ITokenStorage, previous: StdDuration) -> StdDuration {
    let doubled = previous.saturating_mul(2);
    match storage.retrieve().await {
        Some(token) => {
            let now = OffsetDateTime::now_utc();
            if token.expires_at <= now {
                error!("token expired while refresh retries were backing off; marking invalid");
                return StdDuration::from_secs(1);
            }
            let remaining = StdDuration::try_from(token.expires_at - now).unwrap_or(doubled);
            doubled.min(remaining)
        }
        None => doubled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{InMemoryTokenStorage, TokenData};
    use secrecy::SecretString;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn token(expires_in: TimeDuration) -> TokenData {
        TokenData {
            access_token: SecretString::from("A".to_string()),
            token_type: "Bearer".to_string(),
            expires_at: OffsetDateTime::now_utc() + expires_in,
            scope: None,
            refresh_token: None,
        }
    }

    #[tokio::test]
    async fn next_wait_is_near_zero_when_already_due() {
        let storage = InMemoryTokenStorage::new();
        storage.store(token(TimeDuration::seconds(30))).await;
        let wait = next_wait(&storage, StdDuration::from_secs(60)).await;
        assert_eq!(wait, StdDuration::from_secs(0));
    }

    #[tokio::test]
    async fn destroy_stops_background_task() {
        let storage: Arc<dyn ITokenStorage> = Arc::new(InMemoryTokenStorage::new());
        storage.store(token(TimeDuration::seconds(3600))).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let mut scheduler = RefreshScheduler::spawn(storage, StdDuration::from_secs(60), move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        scheduler.destroy();
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
