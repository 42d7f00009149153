//! Stream registry implementation
//!
//! Maps `{app, name}` to the live [`StreamBuffer`] of its publisher. The map
//! lock is held only for the lookup or mutation itself, never while frames
//! are delivered.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, RwLock};

use super::buffer::{BufferStats, Consumer, StreamBuffer};
use super::config::RegistryConfig;
use super::error::RegistryError;
use super::frame::StreamKey;

/// Central registry for all active streams
pub struct StreamRegistry {
    streams: RwLock<HashMap<StreamKey, Arc<StreamBuffer>>>,

    /// Woken whenever a publisher registers
    published: Notify,

    config: RegistryConfig,
}

impl StreamRegistry {
    /// Create a new stream registry with default configuration
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new stream registry with custom configuration
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            published: Notify::new(),
            config,
        }
    }

    /// Get the registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a publisher for a stream
    ///
    /// The first publisher wins: a second registration for a live key is
    /// rejected and leaves the existing stream untouched.
    pub async fn register_publisher(
        &self,
        key: &StreamKey,
        session_id: u64,
    ) -> Result<Arc<StreamBuffer>, RegistryError> {
        let mut streams = self.streams.write().await;

        if let Some(existing) = streams.get(key) {
            tracing::warn!(
                stream = %key,
                session_id = session_id,
                publisher = existing.publisher_id(),
                "Publish rejected, stream already live"
            );
            return Err(RegistryError::StreamAlreadyPublishing(key.clone()));
        }

        let buffer = Arc::new(StreamBuffer::new(
            key.clone(),
            session_id,
            self.config.clone(),
        ));
        streams.insert(key.clone(), Arc::clone(&buffer));
        drop(streams);

        self.published.notify_waiters();
        tracing::info!(stream = %key, session_id = session_id, "Publisher registered");

        Ok(buffer)
    }

    /// Remove a publisher's stream and close its buffer
    ///
    /// Every attached consumer is detached and woken.
    pub async fn unregister_publisher(
        &self,
        key: &StreamKey,
        session_id: u64,
    ) -> Result<(), RegistryError> {
        let buffer = {
            let mut streams = self.streams.write().await;
            match streams.get(key) {
                None => return Err(RegistryError::StreamNotFound(key.clone())),
                Some(buffer) if buffer.publisher_id() != session_id => {
                    tracing::warn!(
                        stream = %key,
                        expected = buffer.publisher_id(),
                        actual = session_id,
                        "Publisher unregister mismatch"
                    );
                    return Err(RegistryError::PublisherMismatch {
                        key: key.clone(),
                        session_id,
                    });
                }
                Some(_) => streams.remove(key),
            }
        };

        if let Some(buffer) = buffer {
            let stats = buffer.stats();
            buffer.close();
            tracing::info!(
                stream = %key,
                session_id = session_id,
                consumers = stats.consumers,
                published = stats.published,
                dropped = stats.dropped,
                "Publisher unregistered"
            );
        }
        Ok(())
    }

    /// Look up a live stream
    pub async fn get(&self, key: &StreamKey) -> Option<Arc<StreamBuffer>> {
        self.streams.read().await.get(key).cloned()
    }

    /// Look up a stream, waiting up to `timeout` for it to be published
    pub async fn wait_for(&self, key: &StreamKey, timeout: Duration) -> Option<Arc<StreamBuffer>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a publish in between is
            // not missed.
            let notified = self.published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(buffer) = self.get(key).await {
                return Some(buffer);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Attach a consumer to a stream
    ///
    /// With a non-zero `wait`, a stream about to be published is waited for.
    pub async fn subscribe(
        &self,
        key: &StreamKey,
        wait: Duration,
    ) -> Result<Consumer, RegistryError> {
        let buffer = if wait.is_zero() {
            self.get(key).await
        } else {
            self.wait_for(key, wait).await
        };
        let buffer = buffer.ok_or_else(|| RegistryError::StreamNotFound(key.clone()))?;
        let consumer = buffer.attach()?;

        tracing::info!(
            stream = %key,
            consumer_id = consumer.id(),
            consumers = buffer.consumer_count(),
            catchup_frames = consumer.len(),
            "Subscriber added"
        );

        Ok(consumer)
    }

    /// Check if a stream has an active publisher
    pub async fn has_active_stream(&self, key: &StreamKey) -> bool {
        self.streams.read().await.contains_key(key)
    }

    /// Get stream statistics
    pub async fn stream_stats(&self, key: &StreamKey) -> Option<BufferStats> {
        self.get(key).await.map(|buffer| buffer.stats())
    }

    /// Get total number of streams
    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }

    /// Keys of all live streams
    pub async fn keys(&self) -> Vec<StreamKey> {
        self.streams.read().await.keys().cloned().collect()
    }

    /// Drop every stream and close its buffer
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.streams.write().await.drain().collect();
        for (key, buffer) in drained {
            buffer.close();
            tracing::debug!(stream = %key, "Stream closed on shutdown");
        }
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::registry::frame::Frame;

    #[tokio::test]
    async fn test_register_publisher() {
        let registry = StreamRegistry::new();
        let key = StreamKey::new("live", "test_stream");

        let buffer = registry.register_publisher(&key, 1).await.unwrap();
        assert!(registry.has_active_stream(&key).await);
        assert_eq!(buffer.publisher_id(), 1);

        // Can't register another publisher
        let result = registry.register_publisher(&key, 2).await;
        assert!(matches!(
            result,
            Err(RegistryError::StreamAlreadyPublishing(_))
        ));

        // The first binding is unaffected
        let current = registry.get(&key).await.unwrap();
        assert!(Arc::ptr_eq(&current, &buffer));
        assert!(!buffer.is_closed());
    }

    #[tokio::test]
    async fn test_subscribe_receives_published_frames() {
        let registry = StreamRegistry::new();
        let key = StreamKey::new("live", "test_stream");

        let buffer = registry.register_publisher(&key, 1).await.unwrap();
        let consumer = registry.subscribe(&key, Duration::ZERO).await.unwrap();
        assert!(consumer.is_empty());

        buffer.publish(Frame::video(0, Bytes::from_static(&[0x17, 0x01])));
        let received = consumer.recv().await.unwrap();
        assert_eq!(received.timestamp, 0);

        drop(consumer);
        let stats = registry.stream_stats(&key).await.unwrap();
        assert_eq!(stats.consumers, 0);
        assert_eq!(stats.published, 1);
    }

    #[tokio::test]
    async fn test_subscribe_missing_stream() {
        let registry = StreamRegistry::new();
        let key = StreamKey::new("live", "nobody");

        let result = registry.subscribe(&key, Duration::ZERO).await;
        assert!(matches!(result, Err(RegistryError::StreamNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_times_out() {
        let registry = StreamRegistry::new();
        let key = StreamKey::new("live", "late");

        let start = tokio::time::Instant::now();
        let result = registry.subscribe(&key, Duration::from_millis(500)).await;
        assert!(matches!(result, Err(RegistryError::StreamNotFound(_))));
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_wait_for_sees_publish() {
        let registry = Arc::new(StreamRegistry::new());
        let key = StreamKey::new("live", "soon");

        let waiter = {
            let registry = Arc::clone(&registry);
            let key = key.clone();
            tokio::spawn(async move { registry.wait_for(&key, Duration::from_secs(5)).await })
        };

        tokio::task::yield_now().await;
        registry.register_publisher(&key, 7).await.unwrap();

        let buffer = waiter.await.unwrap().unwrap();
        assert_eq!(buffer.publisher_id(), 7);
    }

    #[tokio::test]
    async fn test_unregister_closes_consumers() {
        let registry = StreamRegistry::new();
        let key = StreamKey::new("live", "test_stream");

        registry.register_publisher(&key, 1).await.unwrap();
        let consumer = registry.subscribe(&key, Duration::ZERO).await.unwrap();

        // Only the owner may unregister
        assert!(matches!(
            registry.unregister_publisher(&key, 2).await,
            Err(RegistryError::PublisherMismatch { session_id: 2, .. })
        ));

        registry.unregister_publisher(&key, 1).await.unwrap();
        assert!(consumer.recv().await.is_none());
        assert!(consumer.stream_ended());
        assert!(!registry.has_active_stream(&key).await);

        // The key is free again
        registry.register_publisher(&key, 2).await.unwrap();
    }

    #[tokio::test]
    async fn test_catchup_frames() {
        let registry = StreamRegistry::new();
        let key = StreamKey::new("live", "test_stream");

        let buffer = registry.register_publisher(&key, 1).await.unwrap();
        buffer.publish(Frame::video(0, Bytes::from_static(&[0x17, 0x00])));
        buffer.publish(Frame::audio(0, Bytes::from_static(&[0xAF, 0x00])));
        buffer.publish(Frame::video(33, Bytes::from_static(&[0x17, 0x01])));

        let consumer = registry.subscribe(&key, Duration::ZERO).await.unwrap();
        assert_eq!(consumer.len(), 2);
        assert!(consumer.try_recv().unwrap().is_sequence_header());
        assert!(consumer.try_recv().unwrap().is_sequence_header());
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = StreamRegistry::new();
        let a = registry
            .register_publisher(&StreamKey::new("live", "a"), 1)
            .await
            .unwrap();
        registry
            .register_publisher(&StreamKey::new("live", "b"), 2)
            .await
            .unwrap();
        assert_eq!(registry.stream_count().await, 2);
        assert_eq!(registry.keys().await.len(), 2);

        registry.close_all().await;
        assert_eq!(registry.stream_count().await, 0);
        assert!(a.is_closed());
    }
}
