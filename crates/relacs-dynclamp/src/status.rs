//! Loop status publication and jitter accounting.
//!
//! The loop task publishes (rate, loopCount, aoIndex, error counters) into
//! a lock-free status slot once per cycle; user space polls it for progress
//! display and `index()` queries. Counters are written with release
//! ordering after the cycle's data is in place and read with acquire
//! ordering. A `tokio::sync::watch` channel mirrors the slot for slow
//! observers that prefer to await changes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Sentinel in the atomic signal-index cell.
const NO_SIGNAL: u64 = u64::MAX;

/// State machine of the loop task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum LoopState {
    #[default]
    Unconfigured = 0,
    Configured = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
    ErrorFatal = 5,
}

impl LoopState {
    fn from_raw(raw: u64) -> Self {
        match raw {
            1 => Self::Configured,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Stopped,
            5 => Self::ErrorFatal,
            _ => Self::Unconfigured,
        }
    }
}

/// Snapshot of the status slot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct LoopStatus {
    /// Configured loop rate in Hz.
    pub rate: f64,
    /// Cycles completed since start.
    pub loop_count: u64,
    /// AO frames consumed since start.
    pub ao_index: u64,
    /// Recoverable AO underruns so far.
    pub underruns: u64,
    /// AI FIFO overruns so far.
    pub overruns: u64,
    /// Nonzero once a fatal fault stopped the loop.
    pub error_code: i32,
    /// AI index at which the most recent signal's first AO sample went out.
    pub signal_index: Option<u64>,
    pub state: LoopState,
}

/// Lock-free status slot shared between the loop task and user space.
#[derive(Debug, Default)]
pub struct StatusSlot {
    rate_bits: AtomicU64,
    loop_count: AtomicU64,
    ao_index: AtomicU64,
    underruns: AtomicU64,
    overruns: AtomicU64,
    error_code: AtomicU64,
    signal_index: AtomicU64,
    state: AtomicU64,
}

impl StatusSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            signal_index: AtomicU64::new(NO_SIGNAL),
            ..Default::default()
        })
    }

    /// Publish one cycle: all fields first, the loop counter last with
    /// release ordering.
    pub fn publish_cycle(&self, ao_index: u64, underruns: u64, overruns: u64, loop_count: u64) {
        self.ao_index.store(ao_index, Ordering::Relaxed);
        self.underruns.store(underruns, Ordering::Relaxed);
        self.overruns.store(overruns, Ordering::Relaxed);
        self.loop_count.store(loop_count, Ordering::Release);
    }

    pub fn set_rate(&self, rate: f64) {
        self.rate_bits.store(rate.to_bits(), Ordering::Relaxed);
    }

    pub fn set_state(&self, state: LoopState) {
        self.state.store(state as u64, Ordering::Release);
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn set_error_code(&self, code: i32) {
        self.error_code.store(code as u32 as u64, Ordering::Release);
    }

    pub fn set_signal_index(&self, index: u64) {
        self.signal_index.store(index, Ordering::Release);
    }

    pub fn clear_signal_index(&self) {
        self.signal_index.store(NO_SIGNAL, Ordering::Release);
    }

    pub fn signal_index(&self) -> Option<u64> {
        match self.signal_index.load(Ordering::Acquire) {
            NO_SIGNAL => None,
            idx => Some(idx),
        }
    }

    pub fn loop_count(&self) -> u64 {
        self.loop_count.load(Ordering::Acquire)
    }

    pub fn ao_index(&self) -> u64 {
        self.ao_index.load(Ordering::Relaxed)
    }

    pub fn rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Relaxed))
    }

    /// Consistent snapshot: the loop counter is read first with acquire
    /// ordering, so every other field is at least as new as it.
    pub fn snapshot(&self) -> LoopStatus {
        let loop_count = self.loop_count.load(Ordering::Acquire);
        LoopStatus {
            rate: self.rate(),
            loop_count,
            ao_index: self.ao_index.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            error_code: self.error_code.load(Ordering::Relaxed) as u32 as i32,
            signal_index: self.signal_index(),
            state: self.state(),
        }
    }
}

/// Interval statistics of the running loop (jitter accounting).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopTiming {
    pub cycles: u64,
    /// Mean cycle interval in seconds.
    pub mean: f64,
    /// Variance of the cycle interval in seconds squared.
    pub variance: f64,
    pub min: f64,
    pub max: f64,
}

/// Accumulator for cycle intervals, kept by the loop task.
#[derive(Debug, Clone, Default)]
pub struct LoopStats {
    count: u64,
    sum: f64,
    sum_sq: f64,
    min: f64,
    max: f64,
}

impl LoopStats {
    pub fn new() -> Self {
        Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            ..Default::default()
        }
    }

    pub fn record(&mut self, interval: f64) {
        self.count += 1;
        self.sum += interval;
        self.sum_sq += interval * interval;
        self.min = self.min.min(interval);
        self.max = self.max.max(interval);
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn timing(&self) -> LoopTiming {
        if self.count == 0 {
            return LoopTiming::default();
        }
        let mean = self.sum / self.count as f64;
        let variance = (self.sum_sq / self.count as f64 - mean * mean).max(0.0);
        LoopTiming {
            cycles: self.count,
            mean,
            variance,
            min: self.min,
            max: self.max,
        }
    }
}

/// Per-cycle phase durations, recorded when the timing counters are
/// enabled. Published under the named status traces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseTimes {
    pub interval: f64,
    pub ai: f64,
    pub ai_acquisition: f64,
    pub ao: f64,
    pub model: f64,
    pub wait: f64,
}

/// Watch-channel mirror of the status slot for slow observers.
pub struct StatusPublisher {
    tx: tokio::sync::watch::Sender<LoopStatus>,
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (tx, _) = tokio::sync::watch::channel(LoopStatus::default());
        Self { tx }
    }

    pub fn publish(&self, status: LoopStatus) {
        self.tx.send_replace(status);
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<LoopStatus> {
        self.tx.subscribe()
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_and_snapshot() {
        let slot = StatusSlot::new();
        slot.set_rate(20_000.0);
        slot.set_state(LoopState::Running);
        slot.publish_cycle(10, 1, 0, 42);
        let snap = slot.snapshot();
        assert_eq!(snap.rate, 20_000.0);
        assert_eq!(snap.loop_count, 42);
        assert_eq!(snap.ao_index, 10);
        assert_eq!(snap.underruns, 1);
        assert_eq!(snap.state, LoopState::Running);
        assert_eq!(snap.signal_index, None);
    }

    #[test]
    fn test_signal_index_sentinel() {
        let slot = StatusSlot::new();
        assert_eq!(slot.signal_index(), None);
        slot.set_signal_index(123);
        assert_eq!(slot.signal_index(), Some(123));
        slot.clear_signal_index();
        assert_eq!(slot.signal_index(), None);
    }

    #[test]
    fn test_negative_error_code_round_trip() {
        let slot = StatusSlot::new();
        slot.set_error_code(-22);
        assert_eq!(slot.snapshot().error_code, -22);
    }

    #[test]
    fn test_loop_stats() {
        let mut stats = LoopStats::new();
        for v in [1.0, 2.0, 3.0] {
            stats.record(v);
        }
        let t = stats.timing();
        assert_eq!(t.cycles, 3);
        assert!((t.mean - 2.0).abs() < 1e-12);
        assert!((t.variance - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(t.min, 1.0);
        assert_eq!(t.max, 3.0);
        stats.reset();
        assert_eq!(stats.timing().cycles, 0);
    }

    #[tokio::test]
    async fn test_watch_mirror() {
        let publisher = StatusPublisher::new();
        let mut rx = publisher.subscribe();
        publisher.publish(LoopStatus {
            loop_count: 5,
            ..Default::default()
        });
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().loop_count, 5);
    }
}
