//! Outbound relays
//!
//! A relay re-publishes a local stream to a remote RTMP server. It attaches
//! to the local [`StreamBuffer`](crate::registry::StreamBuffer) like any
//! player, so a slow or dead remote only ever costs the relay its own queue.
//!
//! ```text
//! publisher ──► StreamBuffer ──► players
//!                    │
//!                    └──► RelayTask ──► RtmpConnector ──► remote server
//! ```
//!
//! [`RelayManager`] keeps the registrations and starts or stops the tasks as
//! the local stream comes and goes.

pub mod config;
pub mod error;
pub mod manager;
mod task;

use std::fmt;

pub use config::RelayConfig;
pub use error::RelayError;
pub use manager::RelayManager;

/// Lifecycle of one relay registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayStatus {
    /// Registered; waiting for the local stream to be published
    Pending,
    /// Dialing or re-dialing the remote
    Connecting,
    /// Forwarding frames
    Active,
    /// Every dial attempt failed
    Failed(String),
    /// Removed by `stop_relay` or shutdown
    Stopped,
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayStatus::Pending => f.write_str("pending"),
            RelayStatus::Connecting => f.write_str("connecting"),
            RelayStatus::Active => f.write_str("active"),
            RelayStatus::Failed(reason) => write!(f, "failed: {reason}"),
            RelayStatus::Stopped => f.write_str("stopped"),
        }
    }
}
