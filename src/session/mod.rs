//! Per-connection session handling
//!
//! [`state`] holds the phase machine, [`context`] the read-only view given
//! to handler hooks, and [`server`] the loop that drives one connection.

pub mod context;
pub mod server;
pub mod state;

pub use context::SessionContext;
pub use server::ServerSession;
pub use state::{SessionPhase, SessionState};
