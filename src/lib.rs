//! Multi-server MCP proxy runtime: connects to many upstream MCP servers on
//! behalf of one downstream client, handling transport framing, reconnection,
//! request correlation, and authentication for each.

pub mod auth;
pub mod config;
pub mod correlator;
pub mod error;
pub mod events;
pub mod reconnect;
pub mod redact;
pub mod supervisor;
pub mod telemetry;
pub mod token;
pub mod transport;

pub use config::UpstreamConfig;
pub use correlator::{Outcome, RequestCorrelator};
pub use error::{FunnelError, Result};
pub use events::{EventBus, ServerEvent};
pub use reconnect::{ReconnectManager, ReconnectState};
pub use supervisor::{ConnectionStatus, ProxySupervisor, ServerStatusSnapshot};
