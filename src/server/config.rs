//! Server configuration

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::protocol::constants::*;

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Outbound chunk size announced after connect
    pub chunk_size: u32,

    /// Window acknowledgement size sent to clients
    pub window_ack_size: u32,

    /// Peer bandwidth limit sent to clients
    pub peer_bandwidth: u32,

    /// Handshake must complete within this time
    pub handshake_timeout: Duration,

    /// Disconnect when nothing is received or sent for this long
    pub idle_timeout: Duration,

    /// A flush to a peer that stops reading fails after this long
    pub write_timeout: Duration,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,

    /// How long `play` waits for a publisher that has not started yet
    pub play_wait: Duration,

    /// How long shutdown waits for sessions to finish
    pub shutdown_grace: Duration,

    /// Largest message accepted from a peer
    pub max_message_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 1935)),
            max_connections: 0, // Unlimited
            chunk_size: RECOMMENDED_CHUNK_SIZE,
            window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
            peer_bandwidth: DEFAULT_PEER_BANDWIDTH,
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            tcp_nodelay: true, // Important for low latency
            play_wait: Duration::ZERO,
            shutdown_grace: Duration::from_secs(5),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set chunk size
    pub fn chunk_size(mut self, size: u32) -> Self {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
        self
    }

    /// Set handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set idle timeout
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set write timeout
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Let `play` wait for a publisher about to start
    pub fn play_wait(mut self, wait: Duration) -> Self {
        self.play_wait = wait;
        self
    }

    /// Set the shutdown grace period
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set the largest accepted message (capped at 16 MiB)
    pub fn max_message_size(mut self, size: u32) -> Self {
        self.max_message_size = size.min(MAX_MESSAGE_SIZE);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();

        assert_eq!(config.bind_addr.port(), 1935);
        assert_eq!(config.max_connections, 0);
        assert_eq!(config.chunk_size, RECOMMENDED_CHUNK_SIZE);
        assert_eq!(config.window_ack_size, DEFAULT_WINDOW_ACK_SIZE);
        assert_eq!(config.peer_bandwidth, DEFAULT_PEER_BANDWIDTH);
        assert_eq!(config.play_wait, Duration::ZERO);
        assert!(config.tcp_nodelay);
    }

    #[test]
    fn test_with_addr() {
        let addr: SocketAddr = "127.0.0.1:1936".parse().unwrap();
        let config = ServerConfig::with_addr(addr);

        assert_eq!(config.bind_addr.port(), 1936);
    }

    #[test]
    fn test_builder_chunk_size_clamped() {
        assert_eq!(ServerConfig::default().chunk_size(8192).chunk_size, 8192);
        assert_eq!(
            ServerConfig::default().chunk_size(u32::MAX).chunk_size,
            MAX_CHUNK_SIZE
        );
        assert_eq!(ServerConfig::default().chunk_size(0).chunk_size, 1);
    }

    #[test]
    fn test_builder_max_message_size_capped() {
        let config = ServerConfig::default().max_message_size(u32::MAX);

        assert_eq!(config.max_message_size, MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_builder_chaining() {
        let addr: SocketAddr = "127.0.0.1:1935".parse().unwrap();
        let config = ServerConfig::default()
            .bind(addr)
            .max_connections(50)
            .chunk_size(4096)
            .handshake_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(30))
            .write_timeout(Duration::from_secs(3))
            .play_wait(Duration::from_millis(500))
            .shutdown_grace(Duration::from_secs(2));

        assert_eq!(config.bind_addr, addr);
        assert_eq!(config.max_connections, 50);
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.write_timeout, Duration::from_secs(3));
        assert_eq!(config.play_wait, Duration::from_millis(500));
        assert_eq!(config.shutdown_grace, Duration::from_secs(2));
    }
}
