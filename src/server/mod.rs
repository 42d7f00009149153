//! RTMP server
//!
//! [`RtmpServer`] accepts connections and runs one [`ServerSession`] task
//! per socket. [`IngestController`] wraps a server with the start, forward
//! and stop operations of a control plane.
//!
//! [`ServerSession`]: crate::session::ServerSession

pub mod config;
pub mod context;
pub mod control;
pub mod handler;
pub mod listener;

pub use config::ServerConfig;
pub use context::ServerContext;
pub use control::{ControlAck, IngestController};
pub use handler::{AcceptAll, AuthResult, RtmpHandler};
pub use listener::RtmpServer;
