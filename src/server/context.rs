//! State shared by every session of one server

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::amf::{Amf0Codec, CommandCodec};
use crate::client::ClientConfig;
use crate::protocol::pool::BufferPool;
use crate::registry::{RegistryConfig, StreamRegistry};
use crate::relay::{RelayConfig, RelayManager};
use crate::server::config::ServerConfig;

/// Registries, codec and shutdown signal owned by one server
pub struct ServerContext {
    pub config: ServerConfig,
    pub registry: Arc<StreamRegistry>,
    pub relays: Arc<RelayManager>,
    pub codec: Arc<dyn CommandCodec>,
    pub pool: Arc<BufferPool>,
    /// Cancelled on shutdown; sessions and relays use child tokens
    pub cancel: CancellationToken,
}

impl ServerContext {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_parts(config, RegistryConfig::default(), RelayConfig::default())
    }

    pub fn with_parts(
        config: ServerConfig,
        registry_config: RegistryConfig,
        relay_config: RelayConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let pool = Arc::new(BufferPool::new());
        let registry = Arc::new(StreamRegistry::with_config(registry_config));
        let relays = Arc::new(RelayManager::new(
            Arc::clone(&registry),
            relay_config,
            ClientConfig::default(),
            Arc::clone(&pool),
            cancel.child_token(),
        ));

        Self {
            config,
            registry,
            relays,
            codec: Arc::new(Amf0Codec),
            pool,
            cancel,
        }
    }
}
