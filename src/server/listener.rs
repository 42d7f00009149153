//! RTMP server listener
//!
//! Handles TCP accept loop and spawns connection handlers.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

use crate::error::{Error, Result};
use crate::protocol::handshake;
use crate::registry::StreamRegistry;
use crate::relay::RelayManager;
use crate::server::config::ServerConfig;
use crate::server::context::ServerContext;
use crate::server::handler::RtmpHandler;
use crate::session::ServerSession;

/// RTMP server
pub struct RtmpServer<H: RtmpHandler> {
    ctx: Arc<ServerContext>,
    handler: Arc<H>,
    next_session_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
}

impl<H: RtmpHandler> RtmpServer<H> {
    /// Create a new server with the given configuration and handler
    pub fn new(config: ServerConfig, handler: H) -> Self {
        Self::with_context(ServerContext::new(config), handler)
    }

    /// Create a server around prepared shared state
    pub fn with_context(ctx: ServerContext, handler: H) -> Self {
        let connection_semaphore = if ctx.config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(ctx.config.max_connections)))
        } else {
            None
        };

        Self {
            ctx: Arc::new(ctx),
            handler: Arc::new(handler),
            next_session_id: AtomicU64::new(1),
            connection_semaphore,
            tracker: TaskTracker::new(),
        }
    }

    /// Get a reference to the stream registry
    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.ctx.registry
    }

    pub fn relays(&self) -> &Arc<RelayManager> {
        &self.ctx.relays
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Get the configured bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.ctx.config.bind_addr
    }

    /// Bind the configured address and serve until shut down
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.ctx.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve until `shutdown` resolves, then shut down gracefully
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.ctx.config.bind_addr).await?;

        let result = tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.serve(listener) => result,
        };

        self.shutdown().await;
        result
    }

    /// Accept connections on an already bound listener until shut down
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "RTMP server listening");

        loop {
            let accepted = tokio::select! {
                _ = self.ctx.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }

        tracing::info!(addr = %local_addr, "RTMP server stopped accepting");
        Ok(())
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            session_id = session_id,
            peer = %peer_addr,
            "New connection"
        );

        if self.ctx.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::error!(error = %e, "Failed to configure socket");
                return;
            }
        }

        let ctx = Arc::clone(&self.ctx);
        let handler = Arc::clone(&self.handler);

        self.tracker.spawn(async move {
            // Held for the lifetime of the connection
            let _permit = permit;

            if let Err(e) = Self::run_connection(session_id, socket, peer_addr, ctx, handler).await {
                tracing::debug!(
                    session_id = session_id,
                    error = %e,
                    "Connection error"
                );
            }

            tracing::debug!(session_id = session_id, "Connection closed");
        });
    }

    async fn run_connection(
        session_id: u64,
        mut socket: TcpStream,
        peer_addr: SocketAddr,
        ctx: Arc<ServerContext>,
        handler: Arc<H>,
    ) -> Result<()> {
        let handshake = tokio::time::timeout(
            ctx.config.handshake_timeout,
            handshake::accept(&mut socket),
        );
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
            result = handshake => result.map_err(|_| Error::Timeout("handshake"))??,
        }

        tracing::debug!(session_id = session_id, "Handshake complete");

        ServerSession::new(session_id, peer_addr, socket, ctx, handler)
            .run()
            .await
    }

    /// Stop accepting, end every session and relay, and wait for them
    pub async fn shutdown(&self) {
        let grace = self.ctx.config.shutdown_grace;

        self.ctx.cancel.cancel();
        self.ctx.relays.shutdown(grace).await;
        self.ctx.registry.close_all().await;

        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                remaining = self.tracker.len(),
                "Sessions still running after shutdown grace"
            );
        }
    }

    /// Number of sessions currently running
    pub fn session_count(&self) -> usize {
        self.tracker.len()
    }
}
