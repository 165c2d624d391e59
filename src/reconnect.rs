//! Per-connection reconnection state machine and jittered exponential backoff.
//! Upstream connections here are reconnected on loss, unlike a long-lived
//! transport that never needs to retry once open.

use std::time::Duration;

use crate::config::ReconnectConfig;

/// Reconnection state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconnectState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Emitted on every state transition.
#[derive(Debug, Clone)]
pub struct ConnectionStateChange {
    pub from: ReconnectState,
    pub to: ReconnectState,
    pub retry_count: u32,
    pub next_retry_delay: Option<Duration>,
    pub error: Option<String>,
}

/// Drives one upstream connection's reconnect lifecycle. Owns no I/O itself; the
/// supervisor asks it for the next delay and performs the actual reconnect.
pub struct ReconnectManager {
    config: ReconnectConfig,
    state: ReconnectState,
    attempt: u32,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, state: ReconnectState::Disconnected, attempt: 0 }
    }

    pub fn state(&self) -> ReconnectState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Computes the delay for 0-indexed attempt `n`:
    /// `base = min(initial * mult^n, max)`, `jitter = base * jitterFactor *
    /// uniform(-1, 1)`, `delay = max(0, round(base + jitter))`.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = (self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(attempt as i32))
        .min(self.config.max_delay_ms as f64);
        let jitter = base * self.config.jitter * (fastrand::f64() * 2.0 - 1.0);
        let delay_ms = (base + jitter).max(0.0).round() as u64;
        Duration::from_millis(delay_ms)
    }

    /// Pure variant of [`Self::calculate_delay`] for property tests that need a
    /// deterministic base without the jitter term.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let base = (self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(attempt as i32))
        .min(self.config.max_delay_ms as f64);
        Duration::from_millis(base.round() as u64)
    }

    pub fn begin_connecting(&mut self) -> ConnectionStateChange {
        self.transition(ReconnectState::Connecting, None, None)
    }

    /// Successful connect: resets the attempt counter to zero.
    pub fn mark_connected(&mut self) -> ConnectionStateChange {
        self.attempt = 0;
        self.transition(ReconnectState::Connected, None, None)
    }

    /// Records a connection loss. Increments the attempt counter *after*
    /// computing the delay but *before* the caller's timer fires, so observers
    /// see a consistent `(retry_count, next_retry_delay)` pair on the emitted
    /// event. Transitions to `Failed` once `max_attempts` is exhausted.
    pub fn record_loss(&mut self, error: impl Into<String>) -> ConnectionStateChange {
        let error = error.into();
        let _ = self.transition(ReconnectState::Disconnected, None, Some(error.clone()));
        if self.attempt >= self.config.max_attempts {
            return self.transition(ReconnectState::Failed, None, Some(error));
        }
        let delay = self.calculate_delay(self.attempt);
        self.attempt += 1;
        self.transition(ReconnectState::Reconnecting, Some(delay), Some(error))
    }

    /// Manual reconnect request: resets the attempt counter and moves straight
    /// to `Connecting`.
    pub fn manual_reconnect(&mut self) -> ConnectionStateChange {
        self.attempt = 0;
        self.transition(ReconnectState::Connecting, None, None)
    }

    /// Cancels a pending reconnect wait, returning to `Disconnected` without
    /// incrementing the attempt counter.
    pub fn cancel(&mut self) -> ConnectionStateChange {
        self.transition(ReconnectState::Disconnected, None, None)
    }

    fn transition(
        &mut self,
        to: ReconnectState,
        next_retry_delay: Option<Duration>,
        error: Option<String>,
    ) -> ConnectionStateChange {
        let from = self.state;
        self.state = to;
        ConnectionStateChange { from, to, retry_count: self.attempt, next_retry_delay, error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter: f64) -> ReconnectConfig {
        ReconnectConfig {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter,
        }
    }

    #[test]
    fn delay_schedule_matches_scenario_4() {
        let mgr = ReconnectManager::new(config(0.0));
        let expected = [1_000u64, 2_000, 4_000, 8_000, 16_000];
        for (n, exp) in expected.into_iter().enumerate() {
            assert_eq!(mgr.calculate_delay(n as u32).as_millis() as u64, exp);
        }
    }

    #[test]
    fn sixth_loss_transitions_to_failed() {
        let mut mgr = ReconnectManager::new(config(0.0));
        for _ in 0..5 {
            let change = mgr.record_loss("boom");
            assert_eq!(change.to, ReconnectState::Reconnecting);
        }
        let change = mgr.record_loss("boom");
        assert_eq!(change.to, ReconnectState::Failed);
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let mgr = ReconnectManager::new(config(0.25));
        for attempt in 0..8 {
            let base = mgr.base_delay(attempt).as_millis() as f64;
            let delay = mgr.calculate_delay(attempt).as_millis() as f64;
            assert!(delay >= (base * 0.75).floor() - 1.0);
            assert!(delay <= (base * 1.25).ceil() + 1.0);
        }
    }

    #[test]
    fn success_resets_attempt_counter() {
        let mut mgr = ReconnectManager::new(config(0.0));
        mgr.record_loss("a");
        mgr.record_loss("b");
        assert_eq!(mgr.attempt(), 2);
        mgr.mark_connected();
        assert_eq!(mgr.attempt(), 0);
        assert_eq!(mgr.state(), ReconnectState::Connected);
    }

    #[test]
    fn manual_reconnect_resets_attempt_counter() {
        let mut mgr = ReconnectManager::new(config(0.0));
        mgr.record_loss("a");
        mgr.record_loss("b");
        mgr.manual_reconnect();
        assert_eq!(mgr.attempt(), 0);
        assert_eq!(mgr.state(), ReconnectState::Connecting);
    }

    #[test]
    fn cancel_does_not_increment_attempt() {
        let mut mgr = ReconnectManager::new(config(0.0));
        mgr.record_loss("a");
        let before = mgr.attempt();
        mgr.cancel();
        assert_eq!(mgr.attempt(), before);
        assert_eq!(mgr.state(), ReconnectState::Disconnected);
    }

    #[test]
    fn delay_respects_max_delay_cap() {
        let mgr = ReconnectManager::new(config(0.0));
        let delay = mgr.calculate_delay(20);
        assert_eq!(delay.as_millis() as u64, 30_000);
    }
}
