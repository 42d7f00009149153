//! Application hooks
//!
//! [`RtmpHandler`] lets the embedding application authorize connects,
//! publishes and plays. Every method has an accepting default.

use std::future::Future;

use crate::protocol::message::ConnectParams;
use crate::registry::StreamKey;
use crate::session::SessionContext;

/// Outcome of an authorization hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Accept,
    /// Refuse with a reason sent to the peer
    Reject(String),
}

impl AuthResult {
    pub fn is_accept(&self) -> bool {
        matches!(self, AuthResult::Accept)
    }
}

/// Session lifecycle hooks
pub trait RtmpHandler: Send + Sync + 'static {
    /// Called on `connect`; rejecting ends the session
    fn on_connect(
        &self,
        _ctx: &SessionContext,
        _params: &ConnectParams,
    ) -> impl Future<Output = AuthResult> + Send {
        async { AuthResult::Accept }
    }

    /// Called before a publisher is bound to `key`
    fn on_publish(
        &self,
        _ctx: &SessionContext,
        _key: &StreamKey,
    ) -> impl Future<Output = AuthResult> + Send {
        async { AuthResult::Accept }
    }

    /// Called before a player is attached to `key`
    fn on_play(
        &self,
        _ctx: &SessionContext,
        _key: &StreamKey,
    ) -> impl Future<Output = AuthResult> + Send {
        async { AuthResult::Accept }
    }

    /// Called once the session has released its stream binding
    fn on_disconnect(&self, _ctx: &SessionContext) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Handler that accepts everything
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl RtmpHandler for AcceptAll {}
