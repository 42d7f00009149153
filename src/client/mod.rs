//! RTMP client implementation
//!
//! Client-side RTMP for:
//! - Re-publishing a local stream to a remote server (relays)
//! - Playing a stream from any RTMP server

pub mod config;
pub mod connector;

pub use config::ClientConfig;
pub use connector::{RtmpConnector, Status};
