//! RTMP wire protocol
//!
//! Handshake, chunk stream framing and message-level types. Nothing in here
//! owns a socket except the async handshake helpers; chunk parsing works on
//! byte buffers so it can be driven by [`crate::connection::Connection`].

pub mod chunk;
pub mod constants;
pub mod handshake;
pub mod message;
pub mod pool;

pub use chunk::{ChunkDecoder, ChunkEncoder, ChunkMessage};
pub use message::{Command, ConnectParams, ControlMessage, PlayParams, PublishParams, UserControlEvent};
pub use pool::{BufferPool, PooledBuf};
