//! Recorded input traces.
//!
//! [`InData`] is one recorded channel: its identity, calibration, and a
//! circular history buffer sized for seconds of data. The acquisition drain
//! thread is the single producer; protocol threads read concurrently and
//! clip their requests to the retained window. [`InList`] is the ordered
//! set of all recorded channels of the running acquisition.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{DaqError, ErrorFlags, Result};
use crate::ring::{RingError, SampleRing};
use crate::sample::{index_to_time, time_to_index, ChannelSetup, SampleIndex};

/// Sentinel for "no signal started yet" in the atomic signal-index slot.
const NO_SIGNAL: u64 = u64::MAX;

/// One recorded analog input channel.
pub struct InData {
    ident: String,
    unit: String,
    device: usize,
    channel: u32,
    gain_index: i32,
    setup: ChannelSetup,
    /// Bits of the f64 sample rate; bulk-settable before a restart.
    sample_rate: AtomicU64,
    ring: SampleRing,
    /// AI index of the first sample of the most recently started output
    /// signal, or [`NO_SIGNAL`].
    signal_index: AtomicU64,
    errors: AtomicU64,
    /// AI indices at which the acquisition was restarted.
    restarts: Mutex<Vec<SampleIndex>>,
}

impl InData {
    /// Create a trace retaining `history_secs` of samples at `sample_rate`.
    pub fn new(
        ident: impl Into<String>,
        unit: impl Into<String>,
        device: usize,
        channel: u32,
        sample_rate: f64,
        history_secs: f64,
        setup: ChannelSetup,
    ) -> Self {
        let capacity = (sample_rate * history_secs).ceil().max(1.0) as usize;
        Self {
            ident: ident.into(),
            unit: unit.into(),
            device,
            channel,
            gain_index: 0,
            setup,
            sample_rate: AtomicU64::new(sample_rate.to_bits()),
            ring: SampleRing::new(capacity),
            signal_index: AtomicU64::new(NO_SIGNAL),
            errors: AtomicU64::new(0),
            restarts: Mutex::new(Vec::new()),
        }
    }

    /// Set the hardware gain table index for this trace.
    pub fn with_gain_index(mut self, gain_index: i32) -> Self {
        self.gain_index = gain_index;
        self
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn device(&self) -> usize {
        self.device
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    pub fn gain_index(&self) -> i32 {
        self.gain_index
    }

    pub fn setup(&self) -> &ChannelSetup {
        &self.setup
    }

    pub fn sample_rate(&self) -> f64 {
        f64::from_bits(self.sample_rate.load(Ordering::Relaxed))
    }

    pub fn sample_interval(&self) -> f64 {
        1.0 / self.sample_rate()
    }

    /// Change the sample rate. Only legal while the trace is not being
    /// filled, i.e. before a (re)start of the acquisition.
    pub fn set_sample_rate(&self, rate: f64) {
        self.sample_rate.store(rate.to_bits(), Ordering::Relaxed);
    }

    /// Total samples delivered to this trace so far.
    pub fn current_index(&self) -> SampleIndex {
        self.ring.head()
    }

    /// Oldest still-readable sample index.
    pub fn min_index(&self) -> SampleIndex {
        self.ring.tail()
    }

    /// Seconds of data recorded so far.
    pub fn current_time(&self) -> f64 {
        index_to_time(self.current_index(), self.sample_rate())
    }

    /// Convert a time to a sample index on this trace.
    pub fn index(&self, time: f64) -> SampleIndex {
        time_to_index(time, self.sample_rate())
    }

    /// Convert a sample count to seconds on this trace.
    pub fn interval(&self, samples: SampleIndex) -> f64 {
        index_to_time(samples, self.sample_rate())
    }

    /// AI index of the first sample of the most recent output signal.
    pub fn signal_index(&self) -> Option<SampleIndex> {
        match self.signal_index.load(Ordering::Acquire) {
            NO_SIGNAL => None,
            idx => Some(idx),
        }
    }

    /// Publish the start index of a newly emitted output signal.
    ///
    /// Monotonically non-decreasing across non-restart submissions; the
    /// index can never point past the data delivered so far plus the frames
    /// still in flight, so a later read at `signal_index` resolves.
    pub fn set_signal_index(&self, index: SampleIndex) {
        let previous = self.signal_index.swap(index, Ordering::Release);
        if previous != NO_SIGNAL && index < previous {
            debug!(
                trace = %self.ident,
                previous,
                index,
                "signal index moved backwards (restart)"
            );
        }
    }

    /// Append converted samples. Single producer: the drain thread only.
    pub fn push(&self, samples: &[f64]) {
        self.ring.push(samples);
    }

    /// Record that the acquisition restarted at the current index.
    pub fn mark_restart(&self) {
        self.restarts.lock().push(self.current_index());
    }

    /// AI indices at which restarts occurred, oldest first.
    pub fn restart_indices(&self) -> Vec<SampleIndex> {
        self.restarts.lock().clone()
    }

    /// Read samples `[from, to)`, failing if the range left the window.
    pub fn read(&self, from: SampleIndex, to: SampleIndex) -> Result<Vec<f64>> {
        self.ring.read(from, to).map_err(|e| match e {
            RingError::Overrun => {
                self.add_error(ErrorFlags::OVERRUN);
                DaqError::Overrun { dropped: 0 }
            }
            RingError::NotYetAcquired => DaqError::NoData(format!(
                "trace '{}': samples up to {} requested, {} acquired",
                self.ident,
                to,
                self.current_index()
            )),
        })
    }

    /// Read samples `[from, to)` clipped to the retained window.
    pub fn read_clipped(&self, from: SampleIndex, to: SampleIndex) -> Vec<f64> {
        let (from, to) = self.ring.clip(from, to);
        self.ring.read(from, to).unwrap_or_default()
    }

    /// Minimum over the clipped range, `None` if empty.
    pub fn min(&self, from: SampleIndex, to: SampleIndex) -> Option<f64> {
        self.read_clipped(from, to)
            .into_iter()
            .fold(None, |acc, v| Some(acc.map_or(v, |m: f64| m.min(v))))
    }

    /// Maximum over the clipped range, `None` if empty.
    pub fn max(&self, from: SampleIndex, to: SampleIndex) -> Option<f64> {
        self.read_clipped(from, to)
            .into_iter()
            .fold(None, |acc, v| Some(acc.map_or(v, |m: f64| m.max(v))))
    }

    /// Arithmetic mean over the clipped range, `None` if empty.
    pub fn mean(&self, from: SampleIndex, to: SampleIndex) -> Option<f64> {
        let data = self.read_clipped(from, to);
        if data.is_empty() {
            None
        } else {
            Some(data.iter().sum::<f64>() / data.len() as f64)
        }
    }

    pub fn errors(&self) -> ErrorFlags {
        ErrorFlags::from_bits_truncate(self.errors.load(Ordering::Relaxed))
    }

    pub fn add_error(&self, flags: ErrorFlags) {
        self.errors.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    pub fn clear_errors(&self) {
        self.errors.store(0, Ordering::Relaxed);
    }

    /// Reset the trace. Only on acquisition restart or explicit clear.
    pub fn clear(&self) {
        self.ring.clear();
        self.signal_index.store(NO_SIGNAL, Ordering::Release);
        self.restarts.lock().clear();
        self.clear_errors();
    }
}

impl std::fmt::Debug for InData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InData")
            .field("ident", &self.ident)
            .field("device", &self.device)
            .field("channel", &self.channel)
            .field("sample_rate", &self.sample_rate())
            .field("current_index", &self.current_index())
            .field("signal_index", &self.signal_index())
            .finish()
    }
}

/// Ordered collection of recorded traces.
///
/// Traces are shared (`Arc`) between the drain thread and readers; the
/// list itself is cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct InList {
    traces: Vec<Arc<InData>>,
}

impl InList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: InData) -> usize {
        self.traces.push(Arc::new(data));
        self.traces.len() - 1
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<InData>> {
        self.traces.get(index)
    }

    /// Find a trace by identifier.
    pub fn find(&self, ident: &str) -> Option<&Arc<InData>> {
        self.traces.iter().find(|t| t.ident() == ident)
    }

    pub fn index_of(&self, ident: &str) -> Option<usize> {
        self.traces.iter().position(|t| t.ident() == ident)
    }

    /// Clear error flags on every trace.
    pub fn clear_errors(&self) {
        for t in &self.traces {
            t.clear_errors();
        }
    }

    /// Set the sample rate of every trace (pre-start bulk operation).
    pub fn set_sample_rate(&self, rate: f64) {
        for t in &self.traces {
            t.set_sample_rate(rate);
        }
    }

    /// OR of all per-trace error flags.
    pub fn errors(&self) -> ErrorFlags {
        self.traces
            .iter()
            .fold(ErrorFlags::empty(), |acc, t| acc | t.errors())
    }

    /// True if any trace carries a fatal error flag.
    pub fn failed(&self) -> bool {
        self.errors().is_failed()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<InData>> {
        self.traces.iter()
    }
}

impl std::ops::Index<usize> for InList {
    type Output = Arc<InData>;

    fn index(&self, index: usize) -> &Self::Output {
        &self.traces[index]
    }
}
