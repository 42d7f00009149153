//! Error types
//!
//! Every fallible operation in the crate returns [`Result`]. Module-local
//! errors (address parsing, registry, relay) convert into [`Error`] so the
//! session and server layers can propagate them with `?`.

use std::io;

use thiserror::Error;

use crate::addr::AddrError;
use crate::registry::RegistryError;
use crate::relay::RelayError;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// Socket read/write failure
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Malformed chunk stream or message
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Handshake failure
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Command payload encode/decode failure
    #[error("amf error: {0}")]
    Amf(#[from] AmfError),

    /// Address string could not be parsed
    #[error("address error: {0}")]
    Addr(#[from] AddrError),

    /// Stream registry rejected the operation
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Relay dial or forwarding failure
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    /// Operation did not finish in time
    #[error("timed out: {0}")]
    Timeout(&'static str),

    /// Shutdown was requested while the operation was pending
    #[error("operation cancelled")]
    Cancelled,

    /// Peer closed the connection
    #[error("connection closed")]
    ConnectionClosed,
}

/// Chunk stream and message level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Declared message length exceeds the accepted maximum
    #[error("message length {0} exceeds maximum {1}")]
    MessageTooLarge(u32, u32),

    /// Chunk size outside 1..=0x7FFFFFFF
    #[error("invalid chunk size: {0}")]
    InvalidChunkSize(u32),

    /// Chunk stream id outside what a basic header can carry (2..=65599)
    #[error("invalid chunk stream id: {0}")]
    InvalidChunkStreamId(u32),

    /// Continuation header on a chunk stream that never carried a full header
    #[error("format {format} chunk on unknown chunk stream {csid}")]
    UnknownChunkStream { csid: u32, format: u8 },

    /// Protocol control message payload could not be parsed
    #[error("malformed {kind} message ({len} bytes)")]
    MalformedControl { kind: &'static str, len: usize },

    /// Command payload decoded to fewer than two values
    #[error("command payload too short: {0} value(s)")]
    CommandTooShort(usize),

    /// First command value was not a string
    #[error("command name is not a string")]
    CommandNameNotString,

    /// Command arguments were missing or of the wrong type
    #[error("invalid {command} arguments: {reason}")]
    InvalidCommand {
        command: &'static str,
        reason: &'static str,
    },

    /// A message arrived that is not valid in the current state
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// Peer rejected one of our requests
    #[error("request rejected by peer: {0}")]
    Rejected(String),
}

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// C0/S0 version byte below 3
    #[error("unsupported rtmp version: {0}")]
    InvalidVersion(u8),
}

/// AMF encode/decode errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmfError {
    /// Buffer ended in the middle of a value
    #[error("unexpected end of amf data")]
    UnexpectedEof,

    /// Marker byte this codec does not understand
    #[error("unknown amf marker: 0x{0:02x}")]
    UnknownMarker(u8),

    /// String bytes were not UTF-8
    #[error("invalid utf-8 in amf string")]
    InvalidUtf8,

    /// Object or array nesting beyond the decoder limit
    #[error("amf nesting too deep")]
    NestingTooDeep,

    /// Reference marker pointing past the reference table
    #[error("invalid amf reference: {0}")]
    InvalidReference(u16),

    /// References expand the payload past the decoder budget
    #[error("amf payload expands past {0} values")]
    ExpansionLimit(usize),
}
