//! Client configuration

use std::time::Duration;

use crate::protocol::constants::{MAX_CHUNK_SIZE, RECOMMENDED_CHUNK_SIZE};

/// Outbound connection settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `flashVer` sent in connect
    pub flash_ver: String,

    /// Outbound chunk size announced right after the handshake
    pub chunk_size: u32,

    /// TCP connect plus handshake must finish within this time
    pub connect_timeout: Duration,

    /// How long to wait for a command reply or status
    pub command_timeout: Duration,

    /// A flush to a server that stops reading fails after this long
    pub write_timeout: Duration,

    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            flash_ver: "FMLE/3.0 (compatible; rtmp-ingest)".to_string(),
            chunk_size: RECOMMENDED_CHUNK_SIZE,
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            tcp_nodelay: true,
        }
    }
}

impl ClientConfig {
    pub fn flash_ver(mut self, flash_ver: impl Into<String>) -> Self {
        self.flash_ver = flash_ver.into();
        self
    }

    pub fn chunk_size(mut self, size: u32) -> Self {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = ClientConfig::default()
            .flash_ver("LNX 9,0,124,2")
            .chunk_size(0)
            .connect_timeout(Duration::from_secs(1))
            .command_timeout(Duration::from_millis(750))
            .write_timeout(Duration::from_secs(2));

        assert_eq!(config.flash_ver, "LNX 9,0,124,2");
        assert_eq!(config.chunk_size, 1);
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
        assert_eq!(config.command_timeout, Duration::from_millis(750));
        assert_eq!(config.write_timeout, Duration::from_secs(2));
        assert!(config.tcp_nodelay);
    }
}
