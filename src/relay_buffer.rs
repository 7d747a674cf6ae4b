//! Fixed-capacity sample queue between the ingest side and the streamer.
//!
//! When the buffer is full, pushing a new sample evicts the oldest one.
//! Memory is bounded at `capacity` samples no matter how hard the device
//! bursts, and neither side ever waits on the other:
//!
//! - the ingest task calls [`RelayBuffer::push`], which never blocks;
//! - the streamer calls [`RelayBuffer::pop_oldest`] once per tick, which
//!   returns `None` on an empty buffer instead of waiting.
//!
//! Backed by a lock-free [`ArrayQueue`], so the two roles share it through
//! an `Arc` with no mutex.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;

use crate::record::Sample;

/// Bounded FIFO of samples with drop-oldest admission.
#[derive(Debug)]
pub struct RelayBuffer {
    queue: ArrayQueue<Sample>,
    evicted: AtomicU64,
}

impl RelayBuffer {
    /// Create a new buffer holding at most `capacity` samples.
    ///
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "RelayBuffer capacity must be > 0");
        Self {
            queue: ArrayQueue::new(capacity),
            evicted: AtomicU64::new(0),
        }
    }

    /// Append `sample`, evicting the oldest entry if the buffer is full.
    ///
    /// Returns the evicted sample, if any.
    pub fn push(&self, sample: Sample) -> Option<Sample> {
        let evicted = self.queue.force_push(sample);
        if evicted.is_some() {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        evicted
    }

    /// Remove and return the earliest-pushed remaining sample.
    pub fn pop_oldest(&self) -> Option<Sample> {
        self.queue.pop()
    }

    /// Current number of buffered samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True if no samples are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Configured maximum capacity in samples.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Samples dropped by overflow since construction.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Discard all buffered samples. Not counted as evictions.
    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
