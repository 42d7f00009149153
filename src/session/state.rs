//! Session state machine
//!
//! Tracks an RTMP session from the first command to disconnection.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::error::{Error, ProtocolError};
use crate::protocol::message::ConnectParams;
use crate::registry::StreamKey;

/// Session lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Handshake done, waiting for connect
    New,
    /// Connect accepted
    Connected,
    /// At least one message stream allocated
    StreamCreated,
    /// Bound as the producer of a stream
    Publishing,
    /// Attached as a consumer of a stream
    Playing,
    /// Session ended
    Closed,
}

impl SessionPhase {
    /// Whether the session finished its command handshake
    pub fn is_streaming(self) -> bool {
        matches!(self, SessionPhase::Publishing | SessionPhase::Playing)
    }
}

/// Why a command was refused in the current phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub phase: SessionPhase,
    pub command: &'static str,
}

impl From<InvalidTransition> for Error {
    fn from(e: InvalidTransition) -> Self {
        ProtocolError::UnexpectedMessage(format!("{} in phase {:?}", e.command, e.phase)).into()
    }
}

/// Complete session state
#[derive(Debug)]
pub struct SessionState {
    /// Unique session ID
    pub id: u64,

    /// Remote peer address
    pub peer_addr: SocketAddr,

    /// Current phase
    pub phase: SessionPhase,

    /// Connection start time
    pub connected_at: Instant,

    /// Connect parameters (after connect command)
    pub connect_params: Option<ConnectParams>,

    /// Stream bound by publish or play
    pub stream_key: Option<StreamKey>,

    /// Message stream ID of the publish or play binding
    pub stream_id: u32,

    /// Next message stream ID to allocate
    next_stream_id: u32,
}

impl SessionState {
    pub fn new(id: u64, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            peer_addr,
            phase: SessionPhase::New,
            connected_at: Instant::now(),
            connect_params: None,
            stream_key: None,
            stream_id: 0,
            next_stream_id: 1, // Stream 0 is reserved for NetConnection
        }
    }

    /// Accept a connect command
    pub fn on_connect(&mut self, params: ConnectParams) -> Result<(), InvalidTransition> {
        self.require(SessionPhase::New, "connect")?;
        self.connect_params = Some(params);
        self.phase = SessionPhase::Connected;
        Ok(())
    }

    /// Allocate a new message stream ID
    pub fn allocate_stream_id(&mut self) -> Result<u32, InvalidTransition> {
        match self.phase {
            SessionPhase::Connected | SessionPhase::StreamCreated => {}
            phase => {
                return Err(InvalidTransition {
                    phase,
                    command: "createStream",
                })
            }
        }
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        self.phase = SessionPhase::StreamCreated;
        Ok(id)
    }

    /// Check that publish or play may start
    pub fn can_bind(&self, command: &'static str) -> Result<(), InvalidTransition> {
        self.require(SessionPhase::StreamCreated, command)
    }

    pub fn on_publish(&mut self, key: StreamKey, stream_id: u32) {
        self.bind(key, stream_id, SessionPhase::Publishing);
    }

    pub fn on_play(&mut self, key: StreamKey, stream_id: u32) {
        self.bind(key, stream_id, SessionPhase::Playing);
    }

    fn bind(&mut self, key: StreamKey, stream_id: u32, phase: SessionPhase) {
        self.stream_key = Some(key);
        self.stream_id = stream_id;
        self.phase = phase;
    }

    fn require(&self, phase: SessionPhase, command: &'static str) -> Result<(), InvalidTransition> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(InvalidTransition {
                phase: self.phase,
                command,
            })
        }
    }

    /// Get session duration
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn close(&mut self) {
        self.phase = SessionPhase::Closed;
    }

    /// Get the application name
    pub fn app(&self) -> Option<&str> {
        self.connect_params.as_ref().map(|p| p.app.as_str())
    }
}
