//! Size-classed buffer pool for message reassembly
//!
//! Each chunk stream reassembles its current message into a buffer taken
//! from this pool. Buffers are handed out wrapped in [`PooledBuf`], which
//! gives the allocation back on drop, so a connection that dies halfway
//! through a message still returns its buffers.
//!
//! Completed payloads are split off the pooled `BytesMut` and frozen. The
//! frozen `Bytes` keep the allocation alive for as long as consumers hold
//! them; once they are all dropped, `BytesMut::reserve` on the returned
//! handle reclaims the same memory instead of allocating again.
//!
//! Payloads of at most [`COPY_THRESHOLD`] bytes are copied out instead.
//! Audio frames and control messages are tiny, and a split would let each
//! of them pin a whole 4 KiB class buffer for as long as a player queue
//! holds it. The copy costs one small allocation per message and leaves
//! the pooled buffer immediately reusable; larger payloads are worth the
//! zero-copy split.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

/// Smallest size class (4 KiB)
const MIN_CLASS_SHIFT: u32 = 12;

/// Largest size class (16 MiB); bigger requests bypass the pool
const MAX_CLASS_SHIFT: u32 = 24;

const CLASS_COUNT: usize = (MAX_CLASS_SHIFT - MIN_CLASS_SHIFT + 1) as usize;

/// Payloads up to this size are copied out of the pooled buffer
pub const COPY_THRESHOLD: usize = 512;

/// Buffers kept per class before extras are simply freed
const DEFAULT_MAX_PER_CLASS: usize = 32;

/// Shared pool of reassembly buffers
#[derive(Debug)]
pub struct BufferPool {
    classes: Vec<Mutex<Vec<BytesMut>>>,
    max_per_class: usize,
    outstanding: AtomicUsize,
}

impl BufferPool {
    /// Create a pool with the default per-class retention
    pub fn new() -> Self {
        Self::with_max_per_class(DEFAULT_MAX_PER_CLASS)
    }

    /// Create a pool keeping at most `max_per_class` idle buffers per class
    pub fn with_max_per_class(max_per_class: usize) -> Self {
        Self {
            classes: (0..CLASS_COUNT).map(|_| Mutex::new(Vec::new())).collect(),
            max_per_class,
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Size class index and capacity for a requested length
    fn class_for(len: usize) -> Option<(usize, usize)> {
        let shift = len.max(1).next_power_of_two().trailing_zeros().max(MIN_CLASS_SHIFT);
        if shift > MAX_CLASS_SHIFT {
            return None;
        }
        Some(((shift - MIN_CLASS_SHIFT) as usize, 1usize << shift))
    }

    /// Take a buffer with at least `len` bytes of spare capacity
    pub fn acquire(self: &Arc<Self>, len: usize) -> PooledBuf {
        self.outstanding.fetch_add(1, Ordering::Relaxed);

        let Some((class, capacity)) = Self::class_for(len) else {
            return PooledBuf {
                buf: Some(BytesMut::with_capacity(len)),
                class: None,
                pool: Arc::clone(self),
            };
        };

        let mut buf = self.classes[class]
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(capacity));
        buf.clear();
        buf.reserve(capacity);

        PooledBuf {
            buf: Some(buf),
            class: Some(class),
            pool: Arc::clone(self),
        }
    }

    fn release(&self, mut buf: BytesMut, class: Option<usize>) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);

        let Some(class) = class else {
            return;
        };
        buf.clear();
        let mut idle = self.classes[class].lock();
        if idle.len() < self.max_per_class {
            idle.push(buf);
        }
    }

    /// Buffers currently handed out and not yet returned
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Idle buffers held across all classes
    pub fn idle(&self) -> usize {
        self.classes.iter().map(|c| c.lock().len()).sum()
    }

    /// Drop every idle buffer
    pub fn clear(&self) {
        for class in &self.classes {
            class.lock().clear();
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A pool buffer that returns itself to the pool when dropped
#[derive(Debug)]
pub struct PooledBuf {
    buf: Option<BytesMut>,
    class: Option<usize>,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.buf.as_ref().map_or(0, |b| b.len())
    }

    /// Whether nothing has been written yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append bytes
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        if let Some(buf) = self.buf.as_mut() {
            buf.extend_from_slice(data);
        }
    }

    /// Hand out everything written so far as frozen `Bytes`
    ///
    /// Small payloads are copied so they do not hold on to the pooled
    /// allocation. The buffer stays checked out and is released on drop.
    pub fn take_bytes(&mut self) -> Bytes {
        let Some(buf) = self.buf.as_mut() else {
            return Bytes::new();
        };
        if buf.len() <= COPY_THRESHOLD {
            let bytes = Bytes::copy_from_slice(buf);
            buf.clear();
            bytes
        } else {
            buf.split().freeze()
        }
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf, self.class);
        }
    }
}
