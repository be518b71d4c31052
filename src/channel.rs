//! Bounded, drop-oldest hand-off between the capture loop and the
//! frame-writer task.
//!
//! Single producer (capture), single consumer (frame-writer). On overflow
//! the oldest pending frame is evicted and its buffer returned to the
//! [`crate::pool::FrameBufferPool`] — capture must never block waiting for
//! the writer to catch up.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::pool::FrameBufferPool;

pub const FRAME_CHANNEL_CAPACITY: usize = 3;

/// A single captured frame in transit: the rented buffer plus how many of
/// its bytes are valid (normally the full buffer, but kept explicit so a
/// short read is representable without reallocating).
pub struct Frame {
    pub buffer: Vec<u8>,
    pub valid_length: usize,
}

struct Shared {
    pool: Arc<FrameBufferPool>,
    dropped: AtomicU64,
}

pub struct FrameSender {
    inner: HeapProd<Frame>,
    shared: Arc<Shared>,
}

pub struct FrameReceiver {
    inner: HeapCons<Frame>,
    shared: Arc<Shared>,
}

/// Create a bounded frame channel of [`FRAME_CHANNEL_CAPACITY`].
pub fn frame_channel(pool: Arc<FrameBufferPool>) -> (FrameSender, FrameReceiver) {
    let rb = HeapRb::<Frame>::new(FRAME_CHANNEL_CAPACITY);
    let (prod, cons) = rb.split();
    let shared = Arc::new(Shared {
        pool,
        dropped: AtomicU64::new(0),
    });
    (
        FrameSender {
            inner: prod,
            shared: shared.clone(),
        },
        FrameReceiver {
            inner: cons,
            shared,
        },
    )
}

impl FrameSender {
    /// Publish a frame, never blocking. If the channel is full, the oldest
    /// frame is dropped (its buffer returned to the pool) to make room.
    pub fn publish(&mut self, frame: Frame) {
        if let Err(frame) = self.inner.try_push(frame) {
            if let Some(oldest) = self.inner.try_pop() {
                self.shared.pool.release(oldest.buffer);
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
            // Room should now exist; if not (consumer raced us), the frame
            // is simply dropped here and its buffer returned too.
            if let Err(frame) = self.inner.try_push(frame) {
                self.shared.pool.release(frame.buffer);
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl FrameReceiver {
    /// Non-blocking receive; `None` if nothing is pending.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.inner.try_pop()
    }

    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Return a consumed frame's buffer to the shared pool. Every buffer
    /// handed out by [`crate::pool::FrameBufferPool::rent`] must come back
    /// through either this or the drop-oldest path in [`FrameSender::publish`]
    /// exactly once.
    pub fn release_frame(&self, buffer: Vec<u8>) {
        self.shared.pool.release(buffer);
    }
}
