//! Handler context
//!
//! Context passed to handler callbacks containing session information.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::protocol::message::ConnectParams;
use crate::registry::StreamKey;

/// Context passed to RtmpHandler callbacks
///
/// Read-only view of the session. Handlers influence the session only
/// through their return values.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Unique session ID
    pub session_id: u64,

    /// Remote peer address
    pub peer_addr: SocketAddr,

    /// Application name (from connect)
    pub app: String,

    /// Connect parameters (if available)
    pub connect_params: Option<Arc<ConnectParams>>,
}

impl SessionContext {
    pub fn new(session_id: u64, peer_addr: SocketAddr) -> Self {
        Self {
            session_id,
            peer_addr,
            app: String::new(),
            connect_params: None,
        }
    }

    /// Update with connect parameters
    pub fn with_connect(&mut self, params: ConnectParams) {
        self.app = params.app.clone();
        self.connect_params = Some(Arc::new(params));
    }

    /// Stream key for a name published or played in this session's app
    pub fn stream_key(&self, name: &str) -> StreamKey {
        StreamKey::new(self.app.as_str(), name)
    }

    pub fn tc_url(&self) -> Option<&str> {
        self.connect_params
            .as_ref()
            .and_then(|p| p.tc_url.as_deref())
    }

    pub fn flash_ver(&self) -> Option<&str> {
        self.connect_params
            .as_ref()
            .and_then(|p| p.flash_ver.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_connect() {
        let mut ctx = SessionContext::new(3, "127.0.0.1:50000".parse().unwrap());
        assert!(ctx.tc_url().is_none());

        ctx.with_connect(ConnectParams {
            app: "live".into(),
            tc_url: Some("rtmp://localhost:1935/live".into()),
            flash_ver: Some("FMLE/3.0".into()),
            ..ConnectParams::default()
        });

        assert_eq!(ctx.app, "live");
        assert_eq!(ctx.tc_url(), Some("rtmp://localhost:1935/live"));
        assert_eq!(ctx.flash_ver(), Some("FMLE/3.0"));
        assert_eq!(ctx.stream_key("abc"), StreamKey::new("live", "abc"));
    }
}
