//! SPSC capture ring shared between the render callback and the
//! control thread. The only shared-mutable structure in the engine;
//! everything else crossing the real-time boundary is an atomic or a
//! bounded channel message.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use serde::{Deserialize, Serialize};

/// What happens when the ring fills up.
///
/// The split SPSC producer cannot evict already-buffered samples (only
/// the consumer owns the read index), so the write itself always keeps
/// the oldest contiguous prefix and rejects what does not fit. The
/// policies differ in recovery: `RejectWrite` leaves the buffered
/// prefix for the reader, `DropOldest` has the reader discard its
/// backlog on an observed overrun and resynchronize to live audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrunPolicy {
    RejectWrite,
    DropOldest,
}

/// Build a capture ring, returning the two halves. The writer half
/// moves into the render callback, the reader half stays with the
/// control thread.
pub struct FrameRing;

impl FrameRing {
    pub fn with_capacity(
        capacity: usize,
        policy: OverrunPolicy,
    ) -> (FrameRingWriter, FrameRingReader) {
        let capacity = capacity.max(1);
        let (producer, consumer) = HeapRb::<f32>::new(capacity).split();
        let dropped = Arc::new(AtomicU64::new(0));
        (
            FrameRingWriter {
                producer,
                dropped: Arc::clone(&dropped),
            },
            FrameRingReader {
                consumer,
                dropped,
                consumed: 0,
                capacity,
                policy,
            },
        )
    }
}

/// Write half. Lives inside the render callback; never blocks, never
/// allocates.
pub struct FrameRingWriter {
    producer: HeapProd<f32>,
    dropped: Arc<AtomicU64>,
}

impl FrameRingWriter {
    /// Push as many frames as fit, counting the rest on the shared
    /// overrun counter. Returns the number accepted.
    pub fn push(&mut self, frames: &[f32]) -> usize {
        let accepted = self.producer.push_slice(frames);
        let rejected = frames.len() - accepted;
        if rejected > 0 {
            self.dropped.fetch_add(rejected as u64, Ordering::Release);
        }
        accepted
    }

    /// Total frames dropped at the writer since construction.
    pub fn overruns(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }
}

/// Read half, owned by the control thread.
pub struct FrameRingReader {
    consumer: HeapCons<f32>,
    dropped: Arc<AtomicU64>,
    consumed: u64,
    capacity: usize,
    policy: OverrunPolicy,
}

impl FrameRingReader {
    /// Drain up to `buf.len()` frames, advancing the frame position.
    pub fn pop_chunk(&mut self, buf: &mut [f32]) -> usize {
        let n = self.consumer.pop_slice(buf);
        self.consumed += n as u64;
        n
    }

    /// Discard everything currently buffered. Returns the number of
    /// frames skipped; the frame position advances past them.
    pub fn skip_all(&mut self) -> u64 {
        let occupied = self.consumer.occupied_len();
        let skipped = self.consumer.skip(occupied) as u64;
        self.consumed += skipped;
        skipped
    }

    /// Apply the overrun policy after the drop counter advanced.
    /// Under `DropOldest` the backlog is discarded so the next pop
    /// observes live audio; under `RejectWrite` the buffered prefix is
    /// kept. Returns frames discarded.
    pub fn recover(&mut self) -> u64 {
        match self.policy {
            OverrunPolicy::RejectWrite => 0,
            OverrunPolicy::DropOldest => self.skip_all(),
        }
    }

    /// Absolute frame index of the next sample this reader will
    /// observe: frames consumed plus frames dropped at the writer.
    /// Exact at moments when the ring has just been observed empty;
    /// callers validate longer reads by re-checking `overruns()`
    /// afterwards.
    pub fn stream_frame(&self) -> u64 {
        self.consumed + self.dropped.load(Ordering::Acquire)
    }

    /// Total frames dropped at the writer since construction.
    pub fn overruns(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }

    pub fn occupied(&self) -> usize {
        self.consumer.occupied_len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverrunPolicy {
        self.policy
    }
}
