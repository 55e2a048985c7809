//! Output stimulus descriptions.
//!
//! [`OutData`] holds one output signal: the waveform samples, the trace it
//! is bound to, its level or attenuation, timing, continuity flags, and a
//! structured description tree used for logging and interactive plotting.
//! [`OutList`] collects the signals of one submission; the command planner
//! consumes it as a unit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::ErrorFlags;
use crate::sample::SampleIndex;

/// How an output signal's amplitude stage is driven.
///
/// Mute and no-intensity are explicit variants, not sentinel magic values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum OutputLevel {
    /// No attenuator in the path; the waveform is emitted as-is.
    #[default]
    NoLevel,
    /// Target intensity in the stimulus unit (e.g. dB SPL); the planner
    /// translates it into an attenuation level.
    Intensity(f64),
    /// Direct attenuation level in decibel.
    Attenuation(f64),
    /// Attenuator muted; the channel stays reserved but silent.
    Muted,
}

impl OutputLevel {
    /// True if an attenuator interaction is required at all.
    pub fn needs_attenuator(&self) -> bool {
        !matches!(self, OutputLevel::NoLevel)
    }

    pub fn is_muted(&self) -> bool {
        matches!(self, OutputLevel::Muted)
    }
}

/// Start source of an output signal or sync command.
///
/// Values beyond `Internal` and `ExternalPfi` are driver-specific; the
/// escape variant carries the raw integer through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StartSource {
    /// Start on the device's internal trigger as soon as armed.
    #[default]
    Internal,
    /// Start together with the analog input start of the given device.
    AiStart { device: usize },
    /// Start on an edge of an external PFI line.
    ExternalPfi { line: u32 },
    /// Driver-specific start source, passed through verbatim.
    DeviceSpecific(i32),
}

/// Binding of an output signal to its target trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TraceBinding {
    /// By symbolic output-trace name, resolved by the planner.
    Name(String),
    /// By output-trace index in the trace registry.
    Index(usize),
}

impl Default for TraceBinding {
    fn default() -> Self {
        TraceBinding::Index(0)
    }
}

/// One output signal.
#[derive(Debug, Clone, Default)]
pub struct OutData {
    /// Identifier used in logs and descriptions.
    pub ident: String,
    /// Target trace.
    pub trace: TraceBinding,
    /// Waveform samples in the physical unit.
    samples: Vec<f64>,
    /// Sample rate of the waveform in Hz.
    sample_rate: f64,
    /// Physical unit of the samples.
    pub unit: String,
    /// Amplitude-stage driving.
    pub level: OutputLevel,
    /// Silent pad before emission, seconds.
    pub delay: f64,
    /// Start source requested by the caller; the planner may override it.
    pub start_source: StartSource,
    /// Repeat the waveform until stopped.
    pub continuous: bool,
    /// Abort the running acquisition cycle to re-arm for this signal.
    pub restart: bool,
    /// Structured stimulus description (key/value tree).
    pub description: Map<String, Value>,
    /// Description keys a protocol may mutate between repeats.
    pub mutable_params: Vec<String>,
    /// Accumulated error flags.
    pub errors: ErrorFlags,
    /// Device index, resolved by the planner from the trace binding.
    pub device: Option<usize>,
    /// Channel number, resolved by the planner from the trace binding.
    pub channel: Option<u32>,
}

impl OutData {
    /// Empty signal bound to nothing; fill via the waveform constructors.
    pub fn new(ident: impl Into<String>) -> Self {
        Self {
            ident: ident.into(),
            ..Default::default()
        }
    }

    /// Constant value for `duration` seconds.
    pub fn constant(mut self, sample_rate: f64, duration: f64, value: f64) -> Self {
        let n = (duration * sample_rate).round().max(0.0) as usize;
        self.samples = vec![value; n];
        self.sample_rate = sample_rate;
        self.describe("type", json!("const"));
        self.describe("amplitude", json!(value));
        self.describe("duration", json!(duration));
        self
    }

    /// Rectangular pulse of `width` seconds at `amplitude`, returning to 0
    /// for the remaining `pause` seconds.
    pub fn pulse(mut self, sample_rate: f64, width: f64, amplitude: f64, pause: f64) -> Self {
        let n_high = (width * sample_rate).round().max(0.0) as usize;
        let n_low = (pause * sample_rate).round().max(0.0) as usize;
        let mut samples = vec![amplitude; n_high];
        samples.extend(std::iter::repeat(0.0).take(n_low));
        self.samples = samples;
        self.sample_rate = sample_rate;
        self.describe("type", json!("pulse"));
        self.describe("amplitude", json!(amplitude));
        self.describe("width", json!(width));
        self.describe("pause", json!(pause));
        self
    }

    /// Sine of `frequency` Hz at `amplitude` for `duration` seconds.
    pub fn sine_wave(
        mut self,
        sample_rate: f64,
        duration: f64,
        frequency: f64,
        amplitude: f64,
    ) -> Self {
        let n = (duration * sample_rate).round().max(0.0) as usize;
        self.samples = (0..n)
            .map(|i| {
                amplitude * (2.0 * std::f64::consts::PI * frequency * i as f64 / sample_rate).sin()
            })
            .collect();
        self.sample_rate = sample_rate;
        self.describe("type", json!("sine"));
        self.describe("frequency", json!(frequency));
        self.describe("amplitude", json!(amplitude));
        self.describe("duration", json!(duration));
        self
    }

    /// Linear ramp from `from` to `to` over `duration` seconds.
    pub fn ramp(mut self, sample_rate: f64, duration: f64, from: f64, to: f64) -> Self {
        let n = (duration * sample_rate).round().max(0.0) as usize;
        self.samples = (0..n)
            .map(|i| {
                if n <= 1 {
                    to
                } else {
                    from + (to - from) * i as f64 / (n - 1) as f64
                }
            })
            .collect();
        self.sample_rate = sample_rate;
        self.describe("type", json!("ramp"));
        self.describe("from", json!(from));
        self.describe("to", json!(to));
        self.describe("duration", json!(duration));
        self
    }

    /// Use a caller-provided waveform.
    pub fn with_samples(mut self, sample_rate: f64, samples: Vec<f64>) -> Self {
        self.samples = samples;
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_trace(mut self, trace: TraceBinding) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_trace_name(mut self, name: impl Into<String>) -> Self {
        self.trace = TraceBinding::Name(name.into());
        self
    }

    pub fn with_level(mut self, level: OutputLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_delay(mut self, delay: f64) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_restart(mut self, restart: bool) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn sample_interval(&self) -> f64 {
        1.0 / self.sample_rate
    }

    /// Change the waveform sample rate (pre-submission bulk operation).
    pub fn set_sample_rate(&mut self, rate: f64) {
        self.sample_rate = rate;
    }

    /// Total stimulus duration in seconds: `len * sample_interval`.
    pub fn duration(&self) -> f64 {
        if self.sample_rate > 0.0 {
            self.samples.len() as f64 / self.sample_rate
        } else {
            0.0
        }
    }

    /// Delay expressed in samples at the waveform rate.
    pub fn delay_samples(&self) -> SampleIndex {
        (self.delay * self.sample_rate).round().max(0.0) as SampleIndex
    }

    /// Set one description entry.
    pub fn describe(&mut self, key: &str, value: Value) {
        self.description.insert(key.to_string(), value);
    }

    pub fn add_error(&mut self, flags: ErrorFlags) {
        self.errors |= flags;
    }

    pub fn clear_errors(&mut self) {
        self.errors = ErrorFlags::empty();
    }

    /// True if a fatal error flag is set (attenuator clipping excluded).
    pub fn failed(&self) -> bool {
        self.errors.is_failed()
    }

    /// Snapshot record for the signal log.
    pub fn info(&self) -> OutDataInfo {
        OutDataInfo {
            ident: self.ident.clone(),
            delay: self.delay,
            duration: self.duration(),
            level: self.level,
            description: self.description.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Log record of a submitted signal; outlives the `OutData` it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutDataInfo {
    pub ident: String,
    pub delay: f64,
    pub duration: f64,
    pub level: OutputLevel,
    pub description: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Ordered collection of output signals forming one submission.
#[derive(Debug, Clone, Default)]
pub struct OutList {
    signals: Vec<OutData>,
}

impl OutList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, signal: OutData) {
        self.signals.push(signal);
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&OutData> {
        self.signals.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut OutData> {
        self.signals.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutData> {
        self.signals.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut OutData> {
        self.signals.iter_mut()
    }

    /// Stable sort by resolved (device, channel). Signals bound to the same
    /// channel keep their relative order; they concatenate on emission.
    /// Unresolved signals sort last.
    pub fn sort_by_device_channel(&mut self) {
        self.signals.sort_by_key(|s| {
            (
                s.device.unwrap_or(usize::MAX),
                s.channel.unwrap_or(u32::MAX),
            )
        });
    }

    /// Set the same delay on every signal.
    pub fn set_delay(&mut self, delay: f64) {
        for s in &mut self.signals {
            s.delay = delay;
        }
    }

    /// Set the same sample rate on every signal.
    pub fn set_sample_rate(&mut self, rate: f64) {
        for s in &mut self.signals {
            s.set_sample_rate(rate);
        }
    }

    /// OR of all member error flags.
    pub fn errors(&self) -> ErrorFlags {
        self.signals
            .iter()
            .fold(ErrorFlags::empty(), |acc, s| acc | s.errors)
    }

    /// True if any member failed.
    pub fn failed(&self) -> bool {
        self.signals.iter().any(|s| s.failed())
    }

    pub fn clear_errors(&mut self) {
        for s in &mut self.signals {
            s.clear_errors();
        }
    }

    /// Longest delay+duration over all members, seconds.
    pub fn max_duration(&self) -> f64 {
        self.signals
            .iter()
            .map(|s| s.delay + s.duration())
            .fold(0.0, f64::max)
    }

    /// True if any member requests an acquisition restart.
    pub fn any_restart(&self) -> bool {
        self.signals.iter().any(|s| s.restart)
    }
}

impl std::ops::Index<usize> for OutList {
    type Output = OutData;

    fn index(&self, index: usize) -> &Self::Output {
        &self.signals[index]
    }
}

impl std::ops::IndexMut<usize> for OutList {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.signals[index]
    }
}

impl FromIterator<OutData> for OutList {
    fn from_iter<T: IntoIterator<Item = OutData>>(iter: T) -> Self {
        Self {
            signals: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pulse_waveform() {
        let sig = OutData::new("pulse").pulse(1000.0, 0.01, 1.0, 0.05);
        assert_eq!(sig.len(), 60);
        assert_eq!(sig.samples()[0], 1.0);
        assert_eq!(sig.samples()[9], 1.0);
        assert_eq!(sig.samples()[10], 0.0);
        assert!((sig.duration() - 0.06).abs() < 1e-12);
        assert_eq!(sig.description["type"], json!("pulse"));
    }

    #[test]
    fn test_sine_waveform() {
        let sig = OutData::new("sine").sine_wave(10_000.0, 0.1, 100.0, 2.0);
        assert_eq!(sig.len(), 1000);
        assert!((sig.samples()[0]).abs() < 1e-12);
        // quarter period of 100 Hz at 10 kHz = sample 25
        assert!((sig.samples()[25] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_ramp_endpoints() {
        let sig = OutData::new("ramp").ramp(100.0, 1.0, -1.0, 1.0);
        assert_eq!(sig.len(), 100);
        assert_eq!(sig.samples()[0], -1.0);
        assert!((sig.samples()[99] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_duration_invariant() {
        let sig = OutData::new("s").with_samples(20_000.0, vec![0.0; 200]);
        assert!((sig.duration() - 0.01).abs() < 1e-12);
        assert_eq!(sig.delay_samples(), 0);
    }

    #[test]
    fn test_level_variants() {
        assert!(!OutputLevel::NoLevel.needs_attenuator());
        assert!(OutputLevel::Muted.needs_attenuator());
        assert!(OutputLevel::Muted.is_muted());
        assert!(OutputLevel::Attenuation(20.0).needs_attenuator());
    }

    #[test]
    fn test_outlist_sort_preserves_same_channel_order() {
        let mut list = OutList::new();
        for (ident, dev, chan) in [("a", 1, 0), ("b", 0, 1), ("c", 0, 1), ("d", 0, 0)] {
            let mut s = OutData::new(ident).constant(1000.0, 0.001, 0.0);
            s.device = Some(dev);
            s.channel = Some(chan);
            list.push(s);
        }
        list.sort_by_device_channel();
        let order: Vec<&str> = list.iter().map(|s| s.ident.as_str()).collect();
        assert_eq!(order, vec!["d", "b", "c", "a"]);
    }

    #[test]
    fn test_outlist_failed_is_or_of_members() {
        let mut list = OutList::new();
        list.push(OutData::new("ok").constant(1000.0, 0.001, 0.0));
        list.push(OutData::new("bad").constant(1000.0, 0.001, 0.0));
        assert!(!list.failed());
        list[1].add_error(ErrorFlags::INVALID_RATE);
        assert!(list.failed());
        // clipping alone does not fail the list
        list.clear_errors();
        list[0].add_error(ErrorFlags::UNDERFLOW);
        assert!(!list.failed());
        assert!(list.errors().contains(ErrorFlags::UNDERFLOW));
    }

    #[test]
    fn test_info_snapshot() {
        let mut sig = OutData::new("tone")
            .sine_wave(10_000.0, 0.5, 440.0, 1.0)
            .with_level(OutputLevel::Intensity(60.0))
            .with_delay(0.1);
        sig.describe("muted", json!(false));
        let info = sig.info();
        assert_eq!(info.ident, "tone");
        assert!((info.duration - 0.5).abs() < 1e-12);
        assert_eq!(info.level, OutputLevel::Intensity(60.0));
        assert_eq!(info.description["muted"], json!(false));
    }

    #[test]
    fn test_bulk_setters() {
        let mut list = OutList::new();
        list.push(OutData::new("a").constant(1000.0, 0.1, 1.0));
        list.push(OutData::new("b").constant(1000.0, 0.2, 1.0));
        list.set_delay(0.05);
        assert_eq!(list[0].delay, 0.05);
        assert!((list.max_duration() - (0.05 + 0.2)).abs() < 1e-12);
        // halving the interval halves every duration
        list.set_sample_rate(2000.0);
        assert_eq!(list[1].sample_rate(), 2000.0);
        assert!((list.max_duration() - (0.05 + 0.1)).abs() < 1e-12);
    }
}
