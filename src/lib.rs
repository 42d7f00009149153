//! RTMP live ingest and relay server
//!
//! Publishers push a stream over RTMP; the server fans it out to any number
//! of players and optionally re-publishes it to one remote server.
//!
//! ```text
//! TCP accept ─► handshake ─► ServerSession ─► StreamRegistry ─► StreamBuffer
//!                                                                  │
//!                                      players ◄── Consumer ◄──────┤
//!                                      remote  ◄── RelayTask ◄─────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use rtmp_ingest::{AcceptAll, RtmpServer, ServerConfig};
//!
//! # async fn run() -> rtmp_ingest::Result<()> {
//! let server = RtmpServer::new(ServerConfig::default(), AcceptAll);
//! server.run_until(async {
//!     let _ = tokio::signal::ctrl_c().await;
//! })
//! .await
//! # }
//! ```

pub mod addr;
pub mod amf;
pub mod client;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;

pub use addr::{Addr, AddrError};
pub use client::{ClientConfig, RtmpConnector};
pub use error::{Error, Result};
pub use registry::{Frame, FrameKind, RegistryConfig, StreamKey, StreamRegistry};
pub use relay::{RelayConfig, RelayError, RelayManager, RelayStatus};
pub use server::{
    AcceptAll, AuthResult, ControlAck, IngestController, RtmpHandler, RtmpServer, ServerConfig,
};
