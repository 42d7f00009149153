//! Stream registry for pub/sub routing
//!
//! The registry maps stream keys to the [`StreamBuffer`] of their single
//! publisher. Players and relays attach to that buffer as [`Consumer`]s.
//!
//! # Architecture
//!
//! ```text
//!                          Arc<StreamRegistry>
//!                     ┌─────────────────────────┐
//!                     │ streams: HashMap<Key,   │
//!                     │   Arc<StreamBuffer> {   │
//!                     │     catch-up cache,     │
//!                     │     consumer queues,    │
//!                     │   }                     │
//!                     │ >                       │
//!                     └───────────┬─────────────┘
//!                                 │
//!         ┌───────────────────────┼───────────────────────┐
//!         │                       │                       │
//!         ▼                       ▼                       ▼
//!    [Publisher]              [Player]                [Relay]
//!    buffer.publish()      consumer.recv()        consumer.recv()
//! ```
//!
//! Payloads are `bytes::Bytes`, so every consumer shares one allocation per
//! frame; only the handle is cloned into each queue.

pub mod buffer;
pub mod config;
pub mod error;
pub mod frame;
pub mod store;

pub use buffer::{BufferStats, Consumer, StreamBuffer};
pub use config::RegistryConfig;
pub use error::RegistryError;
pub use frame::{Frame, FrameKind, StreamKey};
pub use store::StreamRegistry;
