//! Relay error types

use thiserror::Error;

use crate::registry::StreamKey;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// The local stream already has a relay target
    #[error("relay already registered for {0}")]
    AlreadyRegistered(StreamKey),

    /// No relay target for the local stream
    #[error("no relay registered for {0}")]
    NotRegistered(StreamKey),

    /// Every dial attempt failed
    #[error("relay to {target} failed after {attempts} attempt(s): {reason}")]
    DialFailed {
        target: String,
        attempts: u32,
        reason: String,
    },

    /// The server is stopping; no relay may start
    #[error("relay manager is shut down")]
    ShutDown,
}
