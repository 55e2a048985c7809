//! Sample indexing, time conversion, and raw-count calibration.
//!
//! A trace is addressed by a monotonically increasing sample index counted
//! from the start of the running acquisition. Time is derived, never stored:
//! `time = index * sample_interval`. Raw DAQ counts become physical values
//! through a [`Converter`] polynomial attached to each channel.

use serde::{Deserialize, Serialize};

/// Index of one sample on one trace, counted from acquisition start.
pub type SampleIndex = u64;

/// Maximum polynomial order supported by channel converters.
pub const MAX_CONVERSION_ORDER: usize = 3;

/// Number of coefficient slots in a converter record.
pub const MAX_CONVERSION_COEFFICIENTS: usize = MAX_CONVERSION_ORDER + 1;

/// Convert a sample index into seconds since acquisition start.
pub fn index_to_time(index: SampleIndex, sample_rate: f64) -> f64 {
    index as f64 / sample_rate
}

/// Convert a time in seconds into the nearest sample index at the given rate.
pub fn time_to_index(time: f64, sample_rate: f64) -> SampleIndex {
    if time <= 0.0 {
        return 0;
    }
    (time * sample_rate).round() as SampleIndex
}

/// Calibration polynomial applied to raw DAQ counts.
///
/// Evaluates `sum_i c_i * (x - origin)^i` for `i <= order`. The direction of
/// the fit is part of the channel setup: input channels carry a counts→volts
/// polynomial, output channels a volts→counts polynomial, so [`Converter::apply`]
/// is all either side ever calls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Converter {
    /// Polynomial order, `0..=MAX_CONVERSION_ORDER`.
    pub order: usize,
    /// Expansion origin subtracted from the argument before evaluation.
    pub expansion_origin: f64,
    /// Coefficients, constant term first. Slots above `order` are ignored.
    pub coefficients: [f64; MAX_CONVERSION_COEFFICIENTS],
}

impl Converter {
    /// Identity conversion (useful as a placeholder for unconfigured channels).
    pub fn identity() -> Self {
        Self::linear(1.0, 0.0)
    }

    /// First-order conversion `y = offset + gain * x`.
    pub fn linear(gain: f64, offset: f64) -> Self {
        Self {
            order: 1,
            expansion_origin: 0.0,
            coefficients: [offset, gain, 0.0, 0.0],
        }
    }

    /// Two-point calibration through `(x0, y0)` and `(x1, y1)`.
    ///
    /// Returns `None` if the abscissae coincide.
    pub fn two_point(x0: f64, y0: f64, x1: f64, y1: f64) -> Option<Self> {
        if (x1 - x0).abs() < f64::EPSILON {
            return None;
        }
        let gain = (y1 - y0) / (x1 - x0);
        let offset = y0 - gain * x0;
        Some(Self::linear(gain, offset))
    }

    /// Evaluate the polynomial at `x` (Horner form).
    pub fn apply(&self, x: f64) -> f64 {
        let order = self.order.min(MAX_CONVERSION_ORDER);
        let dx = x - self.expansion_origin;
        let mut y = self.coefficients[order];
        for i in (0..order).rev() {
            y = y * dx + self.coefficients[i];
        }
        y
    }

    /// Evaluate on a raw integer count.
    pub fn apply_count(&self, count: u32) -> f64 {
        self.apply(count as f64)
    }
}

impl Default for Converter {
    fn default() -> Self {
        Self::identity()
    }
}

/// Per-channel record carried by every device command.
///
/// The quadruple (min_voltage, max_voltage, scale, converter) fixes how the
/// raw counts of this channel relate to the physical trace unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelSetup {
    /// Channel number on the subdevice.
    pub channel: u32,
    /// Lower bound of the configured voltage range.
    pub min_voltage: f64,
    /// Upper bound of the configured voltage range.
    pub max_voltage: f64,
    /// Extra scale factor applied after conversion (unit scaling).
    pub scale: f64,
    /// Count↔voltage polynomial for this channel.
    pub converter: Converter,
}

impl ChannelSetup {
    /// Setup with an identity converter over the given range.
    pub fn new(channel: u32, min_voltage: f64, max_voltage: f64) -> Self {
        Self {
            channel,
            min_voltage,
            max_voltage,
            scale: 1.0,
            converter: Converter::identity(),
        }
    }

    /// Convert a raw count into the physical unit of the trace.
    pub fn to_physical(&self, count: u32) -> f64 {
        self.converter.apply_count(count) * self.scale
    }

    /// Convert a physical value into a raw count, clamped to `0..=maxdata`.
    ///
    /// Assumes the converter of an output channel is fitted in the
    /// volts→counts direction.
    pub fn to_count(&self, value: f64, maxdata: u32) -> u32 {
        let raw = self.converter.apply(value / self.scale);
        raw.round().clamp(0.0, maxdata as f64) as u32
    }
}

/// Timing helpers shared by planners and drivers.
pub mod timing {
    /// Convert a sample rate in Hz to a period in nanoseconds.
    pub fn rate_to_ns(rate_hz: f64) -> u32 {
        (1e9 / rate_hz) as u32
    }

    /// Convert a period in nanoseconds to a sample rate in Hz.
    pub fn ns_to_rate(ns: u32) -> f64 {
        1e9 / ns as f64
    }

    /// Closest rate achievable by dividing `base_clock_hz` by an integer
    /// divisor within `divisor_range`.
    pub fn nearest_rate(base_clock_hz: f64, requested: f64, divisor_range: (u32, u32)) -> f64 {
        let ideal = base_clock_hz / requested;
        let divisor = ideal
            .round()
            .clamp(divisor_range.0 as f64, divisor_range.1 as f64);
        base_clock_hz / divisor
    }

    /// Check that `rate` matches `achievable` within one part of `max_rate`.
    pub fn rate_matches(rate: f64, achievable: f64, max_rate: f64) -> bool {
        (rate - achievable).abs() <= 1.0 / max_rate.max(f64::EPSILON) * achievable.max(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_time_round_trip() {
        let rate = 20_000.0;
        assert_eq!(time_to_index(index_to_time(12345, rate), rate), 12345);
        assert_eq!(time_to_index(-1.0, rate), 0);
    }

    #[test]
    fn test_linear_converter() {
        let c = Converter::linear(2.0, 1.0);
        assert_eq!(c.apply(3.0), 7.0);
        assert_eq!(c.apply_count(0), 1.0);
    }

    #[test]
    fn test_two_point_converter() {
        // 16-bit counts spanning -10..+10 V
        let c = Converter::two_point(0.0, -10.0, 65535.0, 10.0).unwrap();
        assert!((c.apply(32767.5) - 0.0).abs() < 1e-9);
        assert!((c.apply(65535.0) - 10.0).abs() < 1e-9);
        assert!(Converter::two_point(1.0, 0.0, 1.0, 5.0).is_none());
    }

    #[test]
    fn test_polynomial_with_origin() {
        // y = 1 + 2*(x-10) + 0.5*(x-10)^2
        let c = Converter {
            order: 2,
            expansion_origin: 10.0,
            coefficients: [1.0, 2.0, 0.5, 0.0],
        };
        assert!((c.apply(12.0) - (1.0 + 4.0 + 2.0)).abs() < 1e-12);
    }

    #[test]
    fn test_channel_setup_round_trip() {
        // AO channel fitted volts -> counts over +-10 V, 16 bit
        let to_counts = Converter::two_point(-10.0, 0.0, 10.0, 65535.0).unwrap();
        let setup = ChannelSetup {
            channel: 0,
            min_voltage: -10.0,
            max_voltage: 10.0,
            scale: 1.0,
            converter: to_counts,
        };
        let count = setup.to_count(0.0, 65535);
        assert!(count == 32767 || count == 32768);
        assert_eq!(setup.to_count(20.0, 65535), 65535); // clamped
    }

    #[test]
    fn test_nearest_rate() {
        let base = 20_000_000.0;
        let snapped = timing::nearest_rate(base, 90_000.0, (1, 0x00FF_FFFF));
        assert!((snapped - 90_090.09).abs() < 1.0);
        assert!(timing::rate_matches(snapped, snapped, 100_000.0));
    }
}
