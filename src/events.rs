//! The supervisor's typed, broadcast-based status feed. `daemon/logging.rs::ServerLogHandle`
//! pairs an append-only sink with a `tokio::sync::broadcast::Sender` for live
//! streaming; here the sink is dropped (log file sinks are out of scope) and only
//! the broadcast half survives, now carrying status events instead of log lines.

use time::OffsetDateTime;
use tokio::sync::broadcast;

/// Default channel capacity, matching `ServerLogHandle`'s choice for
/// a live-update broadcast channel.
const CHANNEL_CAPACITY: usize = 512;

/// Emitted status events.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Connected { server_name: String, timestamp: OffsetDateTime },
    Disconnected { server_name: String, timestamp: OffsetDateTime, reason: Option<String> },
    Reconnecting {
        server_name: String,
        timestamp: OffsetDateTime,
        retry_attempt: u32,
        next_retry_delay_ms: u64,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "server.connected",
            Self::Disconnected { .. } => "server.disconnected",
            Self::Reconnecting { .. } => "server.reconnecting",
        }
    }

    pub fn server_name(&self) -> &str {
        match self {
            Self::Connected { server_name, .. }
            | Self::Disconnected { server_name, .. }
            | Self::Reconnecting { server_name, .. } => server_name,
        }
    }
}

/// Process-wide (per-supervisor) broadcast of [`ServerEvent`]s. Cloning the
/// handle is cheap and shares the same underlying channel, matching the
/// teacher's `ServerLogHandle` clone semantics.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ServerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _receiver) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes an event to all current subscribers. A publish with no
    /// subscribers is not an error — the bus has no durability guarantee beyond
    /// delivering to whoever is listening right now.
    pub fn publish(&self, event: ServerEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_observes_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(ServerEvent::Connected {
            server_name: "alpha".into(),
            timestamp: OffsetDateTime::UNIX_EPOCH,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "server.connected");
        assert_eq!(event.server_name(), "alpha");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(ServerEvent::Disconnected {
            server_name: "beta".into(),
            timestamp: OffsetDateTime::UNIX_EPOCH,
            reason: None,
        });
    }
}
