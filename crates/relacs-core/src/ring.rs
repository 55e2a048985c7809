//! Single-producer sample ring with lock-free readers.
//!
//! The ring backs the per-trace history inside `InData`: one drain thread
//! appends converted samples, any number of protocol threads read slices of
//! recent history. The writer publishes the total sample count (the trace's
//! `current_index`) with release ordering; readers acquire it and clip their
//! requests to the window `[current_index - capacity, current_index)`.
//! Anything older has been overwritten and is reported as [`RingError::Overrun`].
//!
//! Samples are stored as `f64` bit patterns in `AtomicU64` cells, so reads
//! never tear and the ring needs no unsafe code. A reader that races a lapping
//! writer detects it by re-checking the head after the copy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::sample::SampleIndex;

/// Error returned by ring reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    /// The requested range reaches past the retained history.
    #[error("requested samples were overwritten (ring overrun)")]
    Overrun,
    /// The requested range ends beyond the last published sample.
    #[error("requested samples have not been acquired yet")]
    NotYetAcquired,
}

struct RingInner {
    cells: Box<[AtomicU64]>,
    /// Total samples ever written; published with release ordering.
    head: AtomicU64,
}

/// Shared handle to a sample ring.
///
/// Cloning shares the underlying storage. Exactly one holder may call
/// [`SampleRing::push`]; every holder may read.
#[derive(Clone)]
pub struct SampleRing {
    inner: Arc<RingInner>,
}

impl SampleRing {
    /// Create a ring retaining `capacity` samples of history.
    ///
    /// Capacity is rounded up to at least one sample.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let cells = (0..capacity)
            .map(|_| AtomicU64::new(0f64.to_bits()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            inner: Arc::new(RingInner {
                cells,
                head: AtomicU64::new(0),
            }),
        }
    }

    /// Number of samples of history the ring retains.
    pub fn capacity(&self) -> usize {
        self.inner.cells.len()
    }

    /// Total samples written so far.
    pub fn head(&self) -> SampleIndex {
        self.inner.head.load(Ordering::Acquire)
    }

    /// Index of the oldest sample still guaranteed readable.
    pub fn tail(&self) -> SampleIndex {
        let head = self.head();
        head.saturating_sub(self.capacity() as u64)
    }

    /// Append samples. Single-producer: only the acquisition drain thread
    /// may call this on a given ring.
    pub fn push(&self, samples: &[f64]) {
        let head = self.inner.head.load(Ordering::Relaxed);
        let cap = self.inner.cells.len() as u64;
        for (i, &v) in samples.iter().enumerate() {
            let idx = ((head + i as u64) % cap) as usize;
            self.inner.cells[idx].store(v.to_bits(), Ordering::Relaxed);
        }
        self.inner
            .head
            .store(head + samples.len() as u64, Ordering::Release);
    }

    /// Read the samples `[from, to)` into a fresh vector.
    ///
    /// Fails with [`RingError::NotYetAcquired`] if `to` lies beyond the head
    /// and with [`RingError::Overrun`] if the start of the range has already
    /// been overwritten (checked again after the copy, so a writer lapping
    /// the reader mid-copy is caught).
    pub fn read(&self, from: SampleIndex, to: SampleIndex) -> Result<Vec<f64>, RingError> {
        if from >= to {
            return Ok(Vec::new());
        }
        let head = self.head();
        if to > head {
            return Err(RingError::NotYetAcquired);
        }
        let cap = self.inner.cells.len() as u64;
        if head.saturating_sub(from) > cap {
            return Err(RingError::Overrun);
        }
        let mut out = Vec::with_capacity((to - from) as usize);
        for i in from..to {
            let bits = self.inner.cells[(i % cap) as usize].load(Ordering::Relaxed);
            out.push(f64::from_bits(bits));
        }
        // A writer may have lapped us while copying; the copied data is then
        // partly new, which counts as an overrun of the requested range.
        let head_after = self.inner.head.load(Ordering::Acquire);
        if head_after.saturating_sub(from) > cap {
            return Err(RingError::Overrun);
        }
        Ok(out)
    }

    /// Read at most the newest `n` samples, clipped to retained history.
    pub fn read_latest(&self, n: usize) -> Vec<f64> {
        let head = self.head();
        let from = head.saturating_sub(n as u64).max(self.tail());
        self.read(from, head).unwrap_or_default()
    }

    /// Clip a requested range to the readable window `[tail, head)`.
    pub fn clip(&self, from: SampleIndex, to: SampleIndex) -> (SampleIndex, SampleIndex) {
        let head = self.head();
        let tail = self.tail();
        (from.clamp(tail, head), to.clamp(tail, head))
    }

    /// Reset the ring to empty. Producer-side operation, used on explicit
    /// clears; readers observe an empty window afterwards only if they
    /// re-fetch the head, so this must not race an active acquisition.
    pub fn clear(&self) {
        self.inner.head.store(0, Ordering::Release);
    }
}

impl std::fmt::Debug for SampleRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleRing")
            .field("capacity", &self.capacity())
            .field("head", &self.head())
            .finish()
    }
}
