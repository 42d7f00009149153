//! Control surface
//!
//! [`IngestController`] is what an RPC layer calls to run one local ingest
//! server and manage its relays. Every operation answers with a
//! [`ControlAck`] instead of an error so it can be returned to a remote
//! caller as is.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::addr::Addr;
use crate::error::Result;
use crate::registry::{RegistryConfig, StreamKey};
use crate::relay::{RelayConfig, RelayStatus};
use crate::server::config::ServerConfig;
use crate::server::context::ServerContext;
use crate::server::handler::RtmpHandler;
use crate::server::listener::RtmpServer;

/// Reply to a control operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlAck {
    pub success: bool,
    pub message: String,
}

impl ControlAck {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: "Success".to_string(),
        }
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl fmt::Display) -> Self {
        Self {
            success: false,
            message: message.to_string(),
        }
    }
}

struct Ingest<H: RtmpHandler> {
    addr: Addr,
    local_addr: SocketAddr,
    server: Arc<RtmpServer<H>>,
    task: JoinHandle<Result<()>>,
}

/// Runs at most one ingest server and forwards its streams
pub struct IngestController<H: RtmpHandler + Clone> {
    config: ServerConfig,
    registry_config: RegistryConfig,
    relay_config: RelayConfig,
    handler: H,
    ingest: Mutex<Option<Ingest<H>>>,
}

impl<H: RtmpHandler + Clone> IngestController<H> {
    pub fn new(config: ServerConfig, handler: H) -> Self {
        Self::with_parts(
            config,
            RegistryConfig::default(),
            RelayConfig::default(),
            handler,
        )
    }

    pub fn with_parts(
        config: ServerConfig,
        registry_config: RegistryConfig,
        relay_config: RelayConfig,
        handler: H,
    ) -> Self {
        Self {
            config,
            registry_config,
            relay_config,
            handler,
            ingest: Mutex::new(None),
        }
    }

    /// Bind `addr` and start accepting publishers
    ///
    /// The address names both the listening socket and the default stream
    /// that [`forward`](Self::forward) relays.
    pub async fn start_ingest(&self, addr: &str) -> ControlAck {
        let mut ingest = self.ingest.lock().await;
        if ingest.is_some() {
            return ControlAck::fail("unable to start rtmp, already running");
        }

        let addr = match Addr::parse(addr) {
            Ok(addr) => addr,
            Err(e) => return ControlAck::fail(e),
        };

        tracing::debug!(addr = %addr.host(), "Binding ingest listener");
        let listener = match TcpListener::bind(addr.host()).await {
            Ok(listener) => listener,
            Err(e) => return ControlAck::fail(e),
        };
        let local_addr = match listener.local_addr() {
            Ok(local_addr) => local_addr,
            Err(e) => return ControlAck::fail(e),
        };

        let ctx = ServerContext::with_parts(
            self.config.clone().bind(local_addr),
            self.registry_config.clone(),
            self.relay_config.clone(),
        );
        let server = Arc::new(RtmpServer::with_context(ctx, self.handler.clone()));
        let serving = Arc::clone(&server);
        let task = tokio::spawn(async move { serving.serve(listener).await });

        tracing::info!(addr = %addr, local_addr = %local_addr, "Ingest started");

        *ingest = Some(Ingest {
            addr,
            local_addr,
            server,
            task,
        });
        ControlAck::ok()
    }

    /// Relay the ingest's own stream to `remote`
    pub async fn forward(&self, remote: &str) -> ControlAck {
        let key = match self.ingest.lock().await.as_ref() {
            Some(ingest) => ingest.addr.stream_key(),
            None => return ControlAck::fail("unable to start rtmp relay, local server not running"),
        };
        self.forward_stream(key, remote).await
    }

    /// Relay local stream `key` to `remote`
    pub async fn forward_stream(&self, key: StreamKey, remote: &str) -> ControlAck {
        let Some(server) = self.server().await else {
            return ControlAck::fail("unable to start rtmp relay, local server not running");
        };
        let target = match Addr::parse(remote) {
            Ok(target) => target,
            Err(e) => return ControlAck::fail(e),
        };

        match server.relays().forward(key, target).await {
            Ok(RelayStatus::Active) => ControlAck::ok(),
            Ok(status) => ControlAck::with_message(format!("relay {status}")),
            Err(e) => ControlAck::fail(e),
        }
    }

    pub async fn stop_relay(&self, key: &StreamKey) -> ControlAck {
        let Some(server) = self.server().await else {
            return ControlAck::fail("unable to stop rtmp relay, local server not running");
        };
        match server.relays().stop_relay(key) {
            Ok(()) => ControlAck::ok(),
            Err(e) => ControlAck::fail(e),
        }
    }

    pub async fn relay_status(&self, key: &StreamKey) -> Option<RelayStatus> {
        self.server().await?.relays().status(key)
    }

    /// Stop the ingest server along with its sessions and relays
    pub async fn stop_ingest(&self) -> ControlAck {
        let Some(ingest) = self.ingest.lock().await.take() else {
            return ControlAck::fail("unable to stop rtmp, not running");
        };

        ingest.server.shutdown().await;
        match ingest.task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Ingest listener ended with error"),
            Err(e) => tracing::error!(error = %e, "Ingest listener task failed"),
        }

        tracing::info!(addr = %ingest.addr, "Ingest stopped");
        ControlAck::ok()
    }

    /// Graceful shutdown entry point; a no-op when nothing runs
    pub async fn shutdown(&self) {
        let _ = self.stop_ingest().await;
    }

    /// Address the ingest listener is bound to
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.ingest.lock().await.as_ref().map(|i| i.local_addr)
    }

    /// Address the ingest was started with, defaults filled in
    pub async fn ingest_addr(&self) -> Option<Addr> {
        self.ingest.lock().await.as_ref().map(|i| i.addr.clone())
    }

    pub async fn server(&self) -> Option<Arc<RtmpServer<H>>> {
        self.ingest
            .lock()
            .await
            .as_ref()
            .map(|i| Arc::clone(&i.server))
    }
}
