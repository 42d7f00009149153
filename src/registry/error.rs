//! Registry error types

use thiserror::Error;

use super::frame::StreamKey;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No publisher for the key
    #[error("stream not found: {0}")]
    StreamNotFound(StreamKey),

    /// Another session is already publishing the key
    #[error("stream already publishing: {0}")]
    StreamAlreadyPublishing(StreamKey),

    /// Unregister attempted by a session that does not own the stream
    #[error("session {session_id} is not the publisher of {key}")]
    PublisherMismatch { key: StreamKey, session_id: u64 },

    /// The stream ended while attaching
    #[error("stream closed: {0}")]
    StreamClosed(StreamKey),
}
