//! Framed sample FIFOs between user space and the loop task.
//!
//! Both directions use fixed-size frames of raw counts, one frame per loop
//! cycle, channel layout in chanlist order. The AI FIFO (loop → user) drops
//! its oldest unread frame and counts an overrun when the user side stalls;
//! the AO FIFO (user → loop) reports an empty pop so the loop can fall back
//! to the configured idle value and flag an underrun.
//!
//! The queues are lock-free; a condvar on the user side lets the drain
//! thread sleep until frames arrive or a stop is requested.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};

/// One cycle's worth of raw counts, in chanlist order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub counts: Vec<u32>,
}

impl Frame {
    pub fn new(counts: Vec<u32>) -> Self {
        Self { counts }
    }

    pub fn zeroed(channels: usize) -> Self {
        Self {
            counts: vec![0; channels],
        }
    }

    pub fn channels(&self) -> usize {
        self.counts.len()
    }
}

/// Idle behavior of one AO channel when the FIFO runs dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdleMode {
    /// Hold the last emitted count.
    #[default]
    HoldLast,
    /// Emit the channel's zero count.
    Zero,
}

/// Per-channel idle configuration of an AO subdevice.
#[derive(Debug, Clone, Default)]
pub struct IdlePolicy {
    modes: Vec<IdleMode>,
}

impl IdlePolicy {
    pub fn uniform(channels: usize, mode: IdleMode) -> Self {
        Self {
            modes: vec![mode; channels],
        }
    }

    pub fn per_channel(modes: Vec<IdleMode>) -> Self {
        Self { modes }
    }

    pub fn mode(&self, channel: usize) -> IdleMode {
        self.modes.get(channel).copied().unwrap_or_default()
    }

    /// Fill `out` with idle counts given the last emitted frame and the
    /// per-channel zero counts.
    pub fn fill_idle(&self, last: &[u32], zero: &[u32], out: &mut [u32]) {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = match self.mode(i) {
                IdleMode::HoldLast => last.get(i).copied().unwrap_or(0),
                IdleMode::Zero => zero.get(i).copied().unwrap_or(0),
            };
        }
    }
}

struct FifoInner {
    queue: ArrayQueue<Frame>,
    overruns: AtomicU64,
    pushed: AtomicU64,
    popped: AtomicU64,
    wait_lock: Mutex<()>,
    data_cond: Condvar,
}

/// Single-reader/single-writer frame FIFO.
///
/// Handles are cheap clones of a shared queue; by contract exactly one side
/// pushes and exactly one side pops.
#[derive(Clone)]
pub struct FrameFifo {
    inner: Arc<FifoInner>,
}

impl FrameFifo {
    /// FIFO holding at most `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(FifoInner {
                queue: ArrayQueue::new(capacity.max(1)),
                overruns: AtomicU64::new(0),
                pushed: AtomicU64::new(0),
                popped: AtomicU64::new(0),
                wait_lock: Mutex::new(()),
                data_cond: Condvar::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.queue.capacity()
    }

    pub fn len(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }

    /// Push a frame; when full the oldest unread frame is dropped and the
    /// overrun counter incremented. Returns `true` if a frame was dropped.
    pub fn push(&self, frame: Frame) -> bool {
        let displaced = self.inner.queue.force_push(frame).is_some();
        if displaced {
            self.inner.overruns.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.pushed.fetch_add(1, Ordering::Release);
        self.inner.data_cond.notify_one();
        displaced
    }

    /// Pop the next frame; `None` on empty (caller decides whether that is
    /// an underrun).
    pub fn pop(&self) -> Option<Frame> {
        let frame = self.inner.queue.pop();
        if frame.is_some() {
            self.inner.popped.fetch_add(1, Ordering::Release);
        }
        frame
    }

    /// Block until a frame is available or the timeout elapses. Returns
    /// `true` if data is waiting.
    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        if !self.inner.queue.is_empty() {
            return true;
        }
        let mut guard = self.inner.wait_lock.lock();
        if !self.inner.queue.is_empty() {
            return true;
        }
        self.inner.data_cond.wait_for(&mut guard, timeout);
        !self.inner.queue.is_empty()
    }

    /// Wake a blocked [`FrameFifo::wait_for_data`] caller (stop requests).
    pub fn notify(&self) {
        self.inner.data_cond.notify_all();
    }

    /// Total frames dropped because the reader stalled.
    pub fn overruns(&self) -> u64 {
        self.inner.overruns.load(Ordering::Relaxed)
    }

    /// Total frames ever pushed.
    pub fn pushed(&self) -> u64 {
        self.inner.pushed.load(Ordering::Acquire)
    }

    /// Total frames ever popped.
    pub fn popped(&self) -> u64 {
        self.inner.popped.load(Ordering::Acquire)
    }

    /// Drop all queued frames (restart boundary: no old samples may leak).
    pub fn clear(&self) {
        while self.inner.queue.pop().is_some() {}
    }
}

impl std::fmt::Debug for FrameFifo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameFifo")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("overruns", &self.overruns())
            .finish()
    }
}
