//! Per-stream fan-out
//!
//! A [`StreamBuffer`] exists while one publisher is live on a key. Every
//! attached [`Consumer`] (player session or relay) owns a bounded queue:
//!
//! ```text
//!                       publish(frame)
//!                            │  read lock on the consumer set
//!          ┌─────────────────┼─────────────────┐
//!          ▼                 ▼                 ▼
//!     [queue 1024]      [queue 1024]      [queue 1024]
//!          │                 │                 │
//!     player.recv()     player.recv()     relay.recv()
//! ```
//!
//! The producer never waits. A full queue drops its oldest frame; a queue
//! that has stayed full for longer than the saturation grace period is
//! detached on the next push. Each consumer reads from its own queue head,
//! so a slow one never delays the others.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use super::config::RegistryConfig;
use super::error::RegistryError;
use super::frame::{Frame, FrameKind, StreamKey};

/// Snapshot of a buffer's counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub consumers: usize,
    pub published: u64,
    /// Frames dropped from full consumer queues
    pub dropped: u64,
    /// Consumers detached for staying saturated
    pub detached: u64,
    pub has_metadata: bool,
    pub has_video_header: bool,
    pub has_audio_header: bool,
}

/// Frames a late joiner needs before live data
#[derive(Debug, Default)]
struct CatchUp {
    metadata: Option<Frame>,
    video_header: Option<Frame>,
    audio_header: Option<Frame>,
}

impl CatchUp {
    fn update(&mut self, frame: &Frame) {
        match frame.kind {
            FrameKind::Metadata => self.metadata = Some(frame.clone()),
            FrameKind::Video if frame.is_sequence_header() => {
                self.video_header = Some(frame.clone())
            }
            FrameKind::Audio if frame.is_sequence_header() => {
                self.audio_header = Some(frame.clone())
            }
            _ => {}
        }
    }

    fn frames(&self) -> impl Iterator<Item = Frame> + '_ {
        [&self.metadata, &self.video_header, &self.audio_header]
            .into_iter()
            .flatten()
            .cloned()
    }
}

#[derive(Debug, Default)]
struct QueueState {
    frames: VecDeque<Frame>,
    /// Set on the first overflow, cleared by a push that finds room
    saturated_since: Option<Instant>,
    closed: bool,
    dropped: u64,
}

enum Push {
    Delivered,
    Dropped,
    /// Saturated past the grace period
    Expired,
    Closed,
}

#[derive(Debug)]
struct ConsumerQueue {
    id: u64,
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl ConsumerQueue {
    fn new(id: u64, capacity: usize, initial: impl Iterator<Item = Frame>) -> Self {
        let mut frames = VecDeque::with_capacity(capacity.min(64));
        frames.extend(initial);
        Self {
            id,
            capacity,
            state: Mutex::new(QueueState {
                frames,
                ..QueueState::default()
            }),
            notify: Notify::new(),
        }
    }

    fn push(&self, frame: Frame, now: Instant, grace: Duration) -> Push {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return Push::Closed;
            }
            if state.frames.len() >= self.capacity {
                state.frames.pop_front();
                state.dropped += 1;
                state.frames.push_back(frame);
                let since = *state.saturated_since.get_or_insert(now);
                if now.duration_since(since) > grace {
                    Push::Expired
                } else {
                    Push::Dropped
                }
            } else {
                state.saturated_since = None;
                state.frames.push_back(frame);
                Push::Delivered
            }
        };
        self.notify.notify_one();
        outcome
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }
}

/// Fan-out point for one published stream
#[derive(Debug)]
pub struct StreamBuffer {
    key: StreamKey,
    publisher_id: u64,
    config: RegistryConfig,
    consumers: RwLock<Vec<Arc<ConsumerQueue>>>,
    catch_up: Mutex<CatchUp>,
    closed: AtomicBool,
    next_consumer_id: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
    detached: AtomicU64,
}

impl StreamBuffer {
    pub fn new(key: StreamKey, publisher_id: u64, config: RegistryConfig) -> Self {
        Self {
            key,
            publisher_id,
            config,
            consumers: RwLock::new(Vec::new()),
            catch_up: Mutex::new(CatchUp::default()),
            closed: AtomicBool::new(false),
            next_consumer_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            detached: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Session ID of the producer
    pub fn publisher_id(&self) -> u64 {
        self.publisher_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Attach a new consumer, pre-loaded with metadata and sequence headers
    pub fn attach(self: &Arc<Self>) -> Result<Consumer, RegistryError> {
        let mut consumers = self.consumers.write();
        if self.is_closed() {
            return Err(RegistryError::StreamClosed(self.key.clone()));
        }

        let id = self.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(ConsumerQueue::new(
            id,
            self.config.consumer_capacity,
            self.catch_up.lock().frames(),
        ));
        consumers.push(Arc::clone(&queue));

        tracing::debug!(
            stream = %self.key,
            consumer_id = id,
            consumers = consumers.len(),
            "Consumer attached"
        );

        Ok(Consumer {
            queue,
            buffer: Arc::clone(self),
        })
    }

    /// Remove a consumer; returns false if it was already gone
    pub fn detach(&self, consumer_id: u64) -> bool {
        let removed = {
            let mut consumers = self.consumers.write();
            consumers
                .iter()
                .position(|q| q.id == consumer_id)
                .map(|i| consumers.swap_remove(i))
        };
        match removed {
            Some(queue) => {
                queue.close();
                tracing::debug!(stream = %self.key, consumer_id = consumer_id, "Consumer detached");
                true
            }
            None => false,
        }
    }

    /// Hand a frame to every consumer without waiting
    pub fn publish(&self, frame: Frame) {
        if self.is_closed() {
            return;
        }
        self.published.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let grace = self.config.saturation_grace;
        let mut expired = Vec::new();
        {
            let consumers = self.consumers.read();
            // Updated under the set lock so attach sees either the old cache
            // and this frame, or the new cache only.
            self.catch_up.lock().update(&frame);

            for queue in consumers.iter() {
                match queue.push(frame.clone(), now, grace) {
                    Push::Delivered | Push::Closed => {}
                    Push::Dropped => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    Push::Expired => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        expired.push(queue.id);
                    }
                }
            }
        }

        for id in expired {
            if self.detach(id) {
                self.detached.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    stream = %self.key,
                    consumer_id = id,
                    grace_ms = grace.as_millis() as u64,
                    "Consumer saturated past grace period, detached"
                );
            }
        }
    }

    /// End the stream: detach and wake every consumer
    ///
    /// Consumers still receive what is already queued, then `None`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let consumers = std::mem::take(&mut *self.consumers.write());
        for queue in &consumers {
            queue.close();
        }
        tracing::debug!(stream = %self.key, consumers = consumers.len(), "Stream buffer closed");
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.read().len()
    }

    pub fn stats(&self) -> BufferStats {
        let consumers = self.consumer_count();
        let catch_up = self.catch_up.lock();
        BufferStats {
            consumers,
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            detached: self.detached.load(Ordering::Relaxed),
            has_metadata: catch_up.metadata.is_some(),
            has_video_header: catch_up.video_header.is_some(),
            has_audio_header: catch_up.audio_header.is_some(),
        }
    }
}

/// Receiving end of one consumer attachment
///
/// Dropping it detaches from the buffer.
#[derive(Debug)]
pub struct Consumer {
    queue: Arc<ConsumerQueue>,
    buffer: Arc<StreamBuffer>,
}

impl Consumer {
    pub fn id(&self) -> u64 {
        self.queue.id
    }

    pub fn key(&self) -> &StreamKey {
        self.buffer.key()
    }

    /// Next frame, or `None` once detached or closed and drained
    ///
    /// Cancel-safe: a frame is only removed from the queue when returned.
    pub async fn recv(&self) -> Option<Frame> {
        loop {
            {
                let mut state = self.queue.state.lock();
                if let Some(frame) = state.frames.pop_front() {
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }
            self.queue.notify.notified().await;
        }
    }

    /// Next frame if one is queued
    pub fn try_recv(&self) -> Option<Frame> {
        self.queue.state.lock().frames.pop_front()
    }

    /// Whether the queue has been closed (it may still hold frames)
    pub fn is_closed(&self) -> bool {
        self.queue.state.lock().closed
    }

    /// Whether the stream itself ended, as opposed to this consumer being
    /// detached for falling behind
    pub fn stream_ended(&self) -> bool {
        self.buffer.is_closed()
    }

    /// Frames dropped from this consumer's queue
    pub fn dropped(&self) -> u64 {
        self.queue.state.lock().dropped
    }

    pub fn len(&self) -> usize {
        self.queue.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.buffer.detach(self.queue.id);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn buffer(config: RegistryConfig) -> Arc<StreamBuffer> {
        Arc::new(StreamBuffer::new(StreamKey::new("live", "test"), 1, config))
    }

    fn audio(ts: u32) -> Frame {
        Frame::audio(ts, Bytes::from_static(&[0xAF, 0x01, 0x00]))
    }

    #[tokio::test]
    async fn test_fan_out_in_order() {
        let buffer = buffer(RegistryConfig::default());
        let a = buffer.attach().unwrap();
        let b = buffer.attach().unwrap();
        assert_eq!(buffer.consumer_count(), 2);

        for ts in 0..5 {
            buffer.publish(audio(ts));
        }

        for consumer in [&a, &b] {
            for ts in 0..5 {
                assert_eq!(consumer.recv().await.unwrap().timestamp, ts);
            }
            assert!(consumer.try_recv().is_none());
        }
        assert_eq!(buffer.stats().published, 5);
    }

    #[tokio::test]
    async fn test_late_joiner_gets_catch_up_frames() {
        let buffer = buffer(RegistryConfig::default());

        buffer.publish(Frame::metadata(0, Bytes::from_static(b"meta")));
        buffer.publish(Frame::video(0, Bytes::from_static(&[0x17, 0x00, 0x01])));
        buffer.publish(Frame::audio(0, Bytes::from_static(&[0xAF, 0x00, 0x12])));
        buffer.publish(Frame::video(33, Bytes::from_static(&[0x27, 0x01])));

        let late = buffer.attach().unwrap();
        let kinds: Vec<FrameKind> = std::iter::from_fn(|| late.try_recv())
            .map(|f| f.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![FrameKind::Metadata, FrameKind::Video, FrameKind::Audio]
        );

        let stats = buffer.stats();
        assert!(stats.has_metadata && stats.has_video_header && stats.has_audio_header);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let buffer = buffer(RegistryConfig::default().consumer_capacity(3));
        let consumer = buffer.attach().unwrap();

        for ts in 0..5 {
            buffer.publish(audio(ts));
        }

        assert_eq!(consumer.dropped(), 2);
        assert_eq!(consumer.recv().await.unwrap().timestamp, 2);
        assert_eq!(buffer.stats().dropped, 2);
    }

    #[tokio::test]
    async fn test_saturated_consumer_detached_without_affecting_others() {
        let buffer = buffer(
            RegistryConfig::default()
                .consumer_capacity(4)
                .saturation_grace(Duration::from_millis(50)),
        );
        let slow = buffer.attach().unwrap();
        let fast = buffer.attach().unwrap();

        let mut received = 0;
        for ts in 0..8 {
            buffer.publish(audio(ts));
            while fast.try_recv().is_some() {
                received += 1;
            }
        }
        // Saturated, but still inside the grace period
        assert!(!slow.is_closed());

        tokio::time::sleep(Duration::from_millis(80)).await;
        buffer.publish(audio(8));
        while fast.try_recv().is_some() {
            received += 1;
        }

        assert!(slow.is_closed());
        assert!(!slow.stream_ended());
        assert_eq!(buffer.consumer_count(), 1);
        assert_eq!(buffer.stats().detached, 1);
        assert_eq!(received, 9);

        // The detached consumer drains what it had, then ends
        let mut drained = 0;
        while slow.recv().await.is_some() {
            drained += 1;
        }
        assert_eq!(drained, 4);
    }

    #[tokio::test]
    async fn test_room_clears_saturation() {
        let buffer = buffer(
            RegistryConfig::default()
                .consumer_capacity(1)
                .saturation_grace(Duration::from_millis(30)),
        );
        let consumer = buffer.attach().unwrap();

        buffer.publish(audio(0));
        buffer.publish(audio(1)); // overflow starts the clock
        tokio::time::sleep(Duration::from_millis(50)).await;
        consumer.recv().await.unwrap();
        buffer.publish(audio(2)); // finds room, clock cleared
        consumer.recv().await.unwrap();
        buffer.publish(audio(3));
        buffer.publish(audio(4)); // overflow again, fresh clock

        assert!(!consumer.is_closed());
        assert_eq!(buffer.consumer_count(), 1);
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_consumer() {
        let buffer = buffer(RegistryConfig::default());
        let consumer = buffer.attach().unwrap();

        let waiter = tokio::spawn(async move {
            let frame = consumer.recv().await;
            let ended = consumer.recv().await.is_none();
            (frame, ended, consumer.stream_ended())
        });

        tokio::task::yield_now().await;
        buffer.publish(audio(1));
        buffer.close();

        let (frame, ended, stream_ended) = waiter.await.unwrap();
        assert_eq!(frame.map(|f| f.timestamp), Some(1));
        assert!(ended);
        assert!(stream_ended);
        assert_eq!(buffer.consumer_count(), 0);
        assert!(matches!(
            buffer.attach(),
            Err(RegistryError::StreamClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_drop_detaches() {
        let buffer = buffer(RegistryConfig::default());
        let consumer = buffer.attach().unwrap();
        let id = consumer.id();
        drop(consumer);

        assert_eq!(buffer.consumer_count(), 0);
        assert!(!buffer.detach(id));
    }
}
