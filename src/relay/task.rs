//! One running relay: dial, forward, reconnect

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::config::RelayConfig;
use super::RelayStatus;
use crate::addr::Addr;
use crate::client::{ClientConfig, RtmpConnector};
use crate::error::Result;
use crate::protocol::pool::BufferPool;
use crate::registry::{Consumer, Frame, FrameKind, StreamKey};

/// Frames written per wakeup before flushing
const MAX_BATCH: usize = 64;

enum Outcome {
    /// Local publish ended; the relay waits for the next one
    StreamEnded,
    Cancelled,
    Failed(String),
}

enum Forward {
    StreamEnded,
    Cancelled,
    /// Consumer detached for falling behind
    Detached,
    /// Remote write or read failed
    Broken(crate::error::Error),
}

enum Dial {
    Connected(RtmpConnector),
    Cancelled,
    Failed(String),
}

pub(super) struct RelayTask {
    key: StreamKey,
    target: Addr,
    consumer: Consumer,
    status: Arc<watch::Sender<RelayStatus>>,
    cancel: CancellationToken,
    config: RelayConfig,
    client: ClientConfig,
    pool: Arc<BufferPool>,
    /// Metadata and sequence headers, replayed after a reconnect
    headers: [Option<Frame>; 3],
}

impl RelayTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: StreamKey,
        target: Addr,
        consumer: Consumer,
        status: Arc<watch::Sender<RelayStatus>>,
        cancel: CancellationToken,
        config: RelayConfig,
        client: ClientConfig,
        pool: Arc<BufferPool>,
    ) -> Self {
        Self {
            key,
            target,
            consumer,
            status,
            cancel,
            config,
            client,
            pool,
            headers: [None, None, None],
        }
    }

    pub async fn run(mut self) {
        match self.relay().await {
            Outcome::StreamEnded => {
                tracing::info!(stream = %self.key, target = %self.target, "Local stream ended, relay pending");
                self.set_status(RelayStatus::Pending);
            }
            Outcome::Failed(reason) => {
                tracing::error!(stream = %self.key, target = %self.target, reason = %reason, "Relay failed");
                self.set_status(RelayStatus::Failed(reason));
            }
            Outcome::Cancelled => {
                tracing::debug!(stream = %self.key, target = %self.target, "Relay cancelled");
            }
        }
        // Marks this run finished so the next publish can start a new one
        self.cancel.cancel();
    }

    /// Status writes are skipped once the manager has taken over
    fn set_status(&self, status: RelayStatus) {
        let cancel = &self.cancel;
        self.status.send_if_modified(|current| {
            if cancel.is_cancelled() || *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    async fn relay(&mut self) -> Outcome {
        loop {
            let mut connector = match self.dial().await {
                Dial::Connected(connector) => connector,
                Dial::Cancelled => return Outcome::Cancelled,
                Dial::Failed(reason) => return Outcome::Failed(reason),
            };
            self.set_status(RelayStatus::Active);

            match self.forward(&mut connector).await {
                Forward::StreamEnded => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = connector.close() => {}
                    }
                    return Outcome::StreamEnded;
                }
                // Dropping the connector closes the socket without waiting on the remote
                Forward::Cancelled => return Outcome::Cancelled,
                Forward::Detached => {
                    return Outcome::Failed("relay fell behind the local stream".to_string())
                }
                Forward::Broken(e) => {
                    tracing::warn!(
                        stream = %self.key,
                        target = %self.target,
                        error = %e,
                        "Relay connection lost, reconnecting"
                    );
                    self.set_status(RelayStatus::Connecting);
                }
            }
        }
    }

    async fn dial(&self) -> Dial {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Dial::Cancelled,
                result = tokio::time::timeout(self.config.dial_timeout, self.connect()) => result,
            };

            match result {
                Ok(Ok(connector)) => {
                    tracing::info!(
                        stream = %self.key,
                        target = %self.target,
                        attempt = attempt,
                        "Relay connected"
                    );
                    return Dial::Connected(connector);
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = "dial timed out".to_string(),
            }

            tracing::warn!(
                stream = %self.key,
                target = %self.target,
                attempt = attempt,
                max_attempts = max_attempts,
                error = %last_error,
                "Relay dial failed"
            );

            if attempt < max_attempts {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Dial::Cancelled,
                    _ = tokio::time::sleep(self.config.backoff(attempt)) => {}
                }
            }
        }

        Dial::Failed(last_error)
    }

    async fn connect(&self) -> Result<RtmpConnector> {
        let mut connector =
            RtmpConnector::dial(&self.target, self.client.clone(), Arc::clone(&self.pool)).await?;
        connector.publish(self.target.key()).await?;
        Ok(connector)
    }

    async fn forward(&mut self, connector: &mut RtmpConnector) -> Forward {
        // A fresh remote session needs the decoder config again
        for frame in self.headers.iter().flatten() {
            if let Err(e) = connector.write_frame(frame) {
                return Forward::Broken(e);
            }
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Forward::Cancelled,
                frame = self.consumer.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = self.write_batch(connector, frame) {
                            return Forward::Broken(e);
                        }
                        if let Some(ended) = self.flush(connector).await {
                            return ended;
                        }
                    }
                    None if self.consumer.stream_ended() => return Forward::StreamEnded,
                    None => return Forward::Detached,
                },
                msg = connector.read_message() => {
                    let handled = msg.and_then(|msg| connector.handle_incoming(&msg));
                    if let Err(e) = handled {
                        return Forward::Broken(e);
                    }
                    if let Some(ended) = self.flush(connector).await {
                        return ended;
                    }
                }
            }
        }
    }

    fn write_batch(&mut self, connector: &mut RtmpConnector, first: Frame) -> Result<()> {
        self.remember(&first);
        connector.write_frame(&first)?;
        for _ in 1..MAX_BATCH {
            let Some(frame) = self.consumer.try_recv() else {
                break;
            };
            self.remember(&frame);
            connector.write_frame(&frame)?;
        }
        Ok(())
    }

    /// Flush bounded by the client write timeout; `None` means keep forwarding
    async fn flush(&self, connector: &mut RtmpConnector) -> Option<Forward> {
        tokio::select! {
            _ = self.cancel.cancelled() => Some(Forward::Cancelled),
            result = connector.flush() => result.err().map(Forward::Broken),
        }
    }

    fn remember(&mut self, frame: &Frame) {
        let slot = match frame.kind {
            FrameKind::Metadata => 0,
            FrameKind::Video if frame.is_sequence_header() => 1,
            FrameKind::Audio if frame.is_sequence_header() => 2,
            _ => return,
        };
        self.headers[slot] = Some(frame.clone());
    }
}
