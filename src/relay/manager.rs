//! Relay registrations
//!
//! At most one target per local stream. A registration outlives individual
//! publishes: every successful publish for the key starts a relay task, and
//! every unpublish cancels it and puts the registration back to pending.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::config::RelayConfig;
use super::error::RelayError;
use super::task::RelayTask;
use super::RelayStatus;
use crate::addr::Addr;
use crate::client::ClientConfig;
use crate::protocol::pool::BufferPool;
use crate::registry::{StreamBuffer, StreamKey, StreamRegistry};

struct RelayEntry {
    target: Addr,
    status: Arc<watch::Sender<RelayStatus>>,
    /// Token of the current run; cancelled once the run is over
    running: Option<CancellationToken>,
}

impl RelayEntry {
    fn is_running(&self) -> bool {
        self.running.as_ref().is_some_and(|t| !t.is_cancelled())
    }

    fn halt(&mut self) {
        if let Some(token) = self.running.take() {
            token.cancel();
        }
    }
}

/// Owns every relay target of one server
pub struct RelayManager {
    registry: Arc<StreamRegistry>,
    config: RelayConfig,
    client: ClientConfig,
    pool: Arc<BufferPool>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    relays: Mutex<HashMap<StreamKey, RelayEntry>>,
}

impl RelayManager {
    pub fn new(
        registry: Arc<StreamRegistry>,
        config: RelayConfig,
        client: ClientConfig,
        pool: Arc<BufferPool>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            config,
            client,
            pool,
            cancel,
            tracker: TaskTracker::new(),
            relays: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Register `target` as the relay of `local`
    ///
    /// When `local` is live the relay dials right away and the returned
    /// status is the dial outcome. Otherwise the registration stays pending
    /// until the next publish.
    pub async fn forward(&self, local: StreamKey, target: Addr) -> Result<RelayStatus, RelayError> {
        if self.cancel.is_cancelled() {
            return Err(RelayError::ShutDown);
        }

        let mut status_rx = {
            let mut relays = self.relays.lock();
            if let Some(existing) = relays.get(&local) {
                tracing::warn!(
                    stream = %local,
                    target = %existing.target,
                    "Relay already registered"
                );
                return Err(RelayError::AlreadyRegistered(local));
            }
            let (status, status_rx) = watch::channel(RelayStatus::Pending);
            relays.insert(
                local.clone(),
                RelayEntry {
                    target: target.clone(),
                    status: Arc::new(status),
                    running: None,
                },
            );
            status_rx
        };

        tracing::info!(stream = %local, target = %target, "Relay registered");

        let Some(buffer) = self.registry.get(&local).await else {
            return Ok(RelayStatus::Pending);
        };
        self.start(&local, &buffer);

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => return Err(RelayError::ShutDown),
            outcome = status_rx.wait_for(|s| !matches!(s, RelayStatus::Connecting)) => {
                outcome.map(|s| s.clone())
            }
        };

        match outcome {
            Ok(RelayStatus::Failed(reason)) => Err(RelayError::DialFailed {
                target: target.to_string(),
                attempts: self.config.max_attempts,
                reason,
            }),
            Ok(status) => Ok(status),
            // Entry removed while dialing
            Err(_) => Ok(RelayStatus::Stopped),
        }
    }

    /// Start the registered relay of a stream that just went live
    pub fn on_publish(&self, key: &StreamKey, buffer: &Arc<StreamBuffer>) {
        self.start(key, buffer);
    }

    /// Stop the running relay of a stream whose publisher left
    pub fn on_unpublish(&self, key: &StreamKey) {
        let mut relays = self.relays.lock();
        if let Some(entry) = relays.get_mut(key) {
            entry.halt();
            entry.status.send_replace(RelayStatus::Pending);
        }
    }

    fn start(&self, key: &StreamKey, buffer: &Arc<StreamBuffer>) {
        if self.cancel.is_cancelled() {
            return;
        }

        let mut relays = self.relays.lock();
        let Some(entry) = relays.get_mut(key) else {
            return;
        };
        if entry.is_running() {
            return;
        }

        let consumer = match buffer.attach() {
            Ok(consumer) => consumer,
            Err(e) => {
                tracing::debug!(stream = %key, error = %e, "Relay not started");
                return;
            }
        };

        let token = self.cancel.child_token();
        entry.running = Some(token.clone());
        entry.status.send_replace(RelayStatus::Connecting);

        tracing::info!(stream = %key, target = %entry.target, "Relay starting");

        let client = self.client.clone().connect_timeout(self.config.dial_timeout);
        let task = RelayTask::new(
            key.clone(),
            entry.target.clone(),
            consumer,
            Arc::clone(&entry.status),
            token,
            self.config.clone(),
            client,
            Arc::clone(&self.pool),
        );
        self.tracker.spawn(task.run());
    }

    /// Remove the relay of `key`, cancelling it if running
    pub fn stop_relay(&self, key: &StreamKey) -> Result<(), RelayError> {
        let mut entry = self
            .relays
            .lock()
            .remove(key)
            .ok_or_else(|| RelayError::NotRegistered(key.clone()))?;

        entry.halt();
        entry.status.send_replace(RelayStatus::Stopped);
        tracing::info!(stream = %key, target = %entry.target, "Relay stopped");
        Ok(())
    }

    pub fn status(&self, key: &StreamKey) -> Option<RelayStatus> {
        self.relays
            .lock()
            .get(key)
            .map(|entry| entry.status.borrow().clone())
    }

    pub fn target(&self, key: &StreamKey) -> Option<Addr> {
        self.relays.lock().get(key).map(|entry| entry.target.clone())
    }

    /// Number of registered targets
    pub fn len(&self) -> usize {
        self.relays.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.lock().is_empty()
    }

    /// Cancel every relay and wait up to `grace` for the tasks to exit
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();
        for (_, mut entry) in self.relays.lock().drain() {
            entry.halt();
            entry.status.send_replace(RelayStatus::Stopped);
        }

        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                remaining = self.tracker.len(),
                "Relay tasks still running after shutdown grace"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::net::TcpListener;

    use super::*;
    use crate::registry::{Consumer, Frame};
    use crate::server::{AcceptAll, RtmpServer, ServerConfig};

    fn manager(registry: &Arc<StreamRegistry>, config: RelayConfig) -> RelayManager {
        RelayManager::new(
            Arc::clone(registry),
            config,
            ClientConfig::default(),
            Arc::new(BufferPool::new()),
            CancellationToken::new(),
        )
    }

    async fn recv(consumer: &Consumer) -> Option<Frame> {
        tokio::time::timeout(Duration::from_secs(2), consumer.recv())
            .await
            .unwrap()
    }

    fn fast_retry() -> RelayConfig {
        RelayConfig::default()
            .max_attempts(2)
            .initial_backoff(Duration::from_millis(10))
            .dial_timeout(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_pending_registration() {
        let registry = Arc::new(StreamRegistry::new());
        let relays = manager(&registry, fast_retry());
        let key = StreamKey::new("live", "local");
        let target = Addr::parse("127.0.0.1:1/live/remote").unwrap();

        let status = relays.forward(key.clone(), target.clone()).await.unwrap();
        assert_eq!(status, RelayStatus::Pending);
        assert_eq!(relays.status(&key), Some(RelayStatus::Pending));
        assert_eq!(relays.target(&key), Some(target.clone()));

        let err = relays.forward(key.clone(), target).await.unwrap_err();
        assert_eq!(err, RelayError::AlreadyRegistered(key.clone()));

        relays.stop_relay(&key).unwrap();
        assert!(relays.is_empty());
        assert_eq!(relays.status(&key), None);
        assert_eq!(
            relays.stop_relay(&key),
            Err(RelayError::NotRegistered(key.clone()))
        );
    }

    #[tokio::test]
    async fn test_unreachable_target_fails() {
        let registry = Arc::new(StreamRegistry::new());
        let relays = manager(&registry, fast_retry());
        let key = StreamKey::new("live", "local");
        let buffer = registry.register_publisher(&key, 1).await.unwrap();
        let player = buffer.attach().unwrap();

        let target = Addr::parse("127.0.0.1:1/live/remote").unwrap();
        let err = relays.forward(key.clone(), target).await.unwrap_err();
        assert!(matches!(err, RelayError::DialFailed { attempts: 2, .. }));
        assert!(matches!(relays.status(&key), Some(RelayStatus::Failed(_))));

        // The local stream keeps flowing to its other consumers
        buffer.publish(Frame::audio(0, Bytes::from_static(&[0xAF, 0x01, 0x21])));
        assert!(player.try_recv().is_some());
        assert!(!buffer.is_closed());

        // Failed runs release their consumer
        tokio::time::timeout(Duration::from_secs(1), async {
            while buffer.consumer_count() > 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_relay_to_remote_server() {
        let remote = Arc::new(RtmpServer::new(ServerConfig::default(), AcceptAll));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = listener.local_addr().unwrap();
        let serving = Arc::clone(&remote);
        tokio::spawn(async move { serving.serve(listener).await });

        let registry = Arc::new(StreamRegistry::new());
        let relays = manager(&registry, fast_retry());
        let key = StreamKey::new("live", "local");
        let buffer = registry.register_publisher(&key, 1).await.unwrap();
        let header = Frame::video(0, Bytes::from_static(&[0x17, 0x00, 0x00, 0x00, 0x00, 0x01]));
        buffer.publish(header.clone());

        let target = Addr::parse(&format!("rtmp://{remote_addr}/live/remote")).unwrap();
        let status = relays.forward(key.clone(), target).await.unwrap();
        assert_eq!(status, RelayStatus::Active);

        let remote_key = StreamKey::new("live", "remote");
        let consumer = remote
            .registry()
            .subscribe(&remote_key, Duration::from_secs(2))
            .await
            .unwrap();

        let live = Frame::video(40, Bytes::from_static(&[0x27, 0x01, 0x00, 0x00, 0x00, 0xAA]));
        buffer.publish(live.clone());

        assert_eq!(recv(&consumer).await, Some(header));
        assert_eq!(recv(&consumer).await, Some(live));

        relays.on_unpublish(&key);
        assert_eq!(relays.status(&key), Some(RelayStatus::Pending));

        relays.shutdown(Duration::from_secs(1)).await;
        remote.shutdown().await;
    }
}
