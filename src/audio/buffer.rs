//! Sample buffers used by the session.
//!
//! * [`ChunkAccumulator`] collects resampled capture audio until an uplink
//!   chunk's worth is available, then hands the whole merged buffer out in one
//!   step.
//! * [`RingBuffer`] keeps the most recent `capacity` output samples for the
//!   volume analyser. When full, new samples overwrite the oldest.
//!
//! # Example
//!
//! ```rust
//! use live_tutor::audio::ChunkAccumulator;
//!
//! let mut acc = ChunkAccumulator::new(4);
//! acc.push(&[0.1, 0.2, 0.3]);
//! assert!(acc.take_chunk().is_none());
//! acc.push(&[0.4, 0.5]);
//! assert_eq!(acc.take_chunk().unwrap().len(), 5);
//! assert!(acc.is_empty());
//! ```

// ---------------------------------------------------------------------------
// ChunkAccumulator
// ---------------------------------------------------------------------------

/// Accumulates resampled uplink samples across capture frames.
///
/// A chunk is released only once at least `threshold` samples are pending;
/// the release drains everything accumulated so far, so the remainder after
/// a release is always empty.
#[derive(Debug)]
pub struct ChunkAccumulator {
    pending: Vec<Vec<f32>>,
    len: usize,
    threshold: usize,
}

impl ChunkAccumulator {
    /// # Panics
    ///
    /// Panics if `threshold == 0`.
    pub fn new(threshold: usize) -> Self {
        assert!(threshold > 0, "ChunkAccumulator threshold must be > 0");
        Self {
            pending: Vec::new(),
            len: 0,
            threshold,
        }
    }

    /// Append one resampled frame.
    pub fn push(&mut self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        self.len += samples.len();
        self.pending.push(samples.to_vec());
    }

    /// Merge and return every pending sample if the threshold is reached.
    pub fn take_chunk(&mut self) -> Option<Vec<f32>> {
        if self.len < self.threshold {
            return None;
        }
        let mut merged = Vec::with_capacity(self.len);
        for part in self.pending.drain(..) {
            merged.extend_from_slice(&part);
        }
        self.len = 0;
        Some(merged)
    }

    /// Discard pending samples without emitting them.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }
}

// ---------------------------------------------------------------------------
// RingBuffer
// ---------------------------------------------------------------------------

/// A fixed-capacity circular buffer.
///
/// ## Overflow behaviour
///
/// When [`push_slice`](Self::push_slice) would exceed `capacity`, the oldest
/// samples are silently overwritten. The buffer never allocates beyond its
/// initial capacity.
pub struct RingBuffer<T> {
    buf: Vec<T>,
    capacity: usize,
    /// Index of the *next* write position (wraps around `capacity`).
    write_pos: usize,
    /// Number of valid samples currently stored (≤ `capacity`).
    len: usize,
}

impl<T: Copy + Default> RingBuffer<T> {
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "RingBuffer capacity must be > 0");
        Self {
            buf: vec![T::default(); capacity],
            capacity,
            write_pos: 0,
            len: 0,
        }
    }

    /// Append `data`, overwriting the oldest samples once full.
    pub fn push_slice(&mut self, data: &[T]) {
        for &item in data {
            self.push(item);
        }
    }

    pub fn push(&mut self, item: T) {
        self.buf[self.write_pos] = item;
        self.write_pos = (self.write_pos + 1) % self.capacity;
        if self.len < self.capacity {
            self.len += 1;
        }
    }

    /// Copy the stored samples in chronological order without consuming them.
    pub fn snapshot(&self) -> Vec<T> {
        // Before the first wrap valid data starts at 0; afterwards the oldest
        // sample sits at `write_pos`.
        let read_pos = if self.len < self.capacity {
            0
        } else {
            self.write_pos
        };

        (0..self.len)
            .map(|i| self.buf[(read_pos + i) % self.capacity])
            .collect()
    }

    /// Discard all samples and reset the write position.
    pub fn clear(&mut self) {
        self.write_pos = 0;
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
