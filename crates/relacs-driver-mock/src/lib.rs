//! `relacs-driver-mock`
//!
//! In-memory driver implementing the hardware capability traits against a
//! shared [`bus::LoopbackBus`]: analog outputs publish voltages the wired
//! analog inputs read back, digital writes land in an inspectable log, and
//! the attenuator snaps to a configurable decibel grid. The end-to-end
//! pipeline tests run entirely on this driver.
//!
//! All analog subdevices use one canonical hardware map: 16 bit over
//! ±10 V, so a count emitted on a wired channel is read back exactly.

pub mod analog_input;
pub mod analog_output;
pub mod attenuator;
pub mod bus;
pub mod digital_io;

pub use analog_input::MockAnalogInput;
pub use analog_output::MockAnalogOutput;
pub use attenuator::{LineLevel, MockAttenuator};
pub use bus::LoopbackBus;
pub use digital_io::{DioWrite, MockDigitalIo};

use relacs_core::sample::{ChannelSetup, Converter};

/// Converter resolution of the mock analog subdevices.
pub const MOCK_BITS: u32 = 16;

/// Largest raw count of the mock analog subdevices.
pub const MOCK_MAXDATA: u32 = 65_535;

/// Maximum per-channel rate of the mock analog subdevices, Hz.
pub const MOCK_MAX_RATE: f64 = 100_000.0;

/// Hardware map: raw count → volts (±10 V full scale).
pub fn counts_to_volts(count: u32) -> f64 {
    count as f64 / MOCK_MAXDATA as f64 * 20.0 - 10.0
}

/// Hardware map: volts → raw count, clamped to the converter span.
pub fn volts_to_counts(volts: f64) -> u32 {
    let raw = (volts + 10.0) / 20.0 * MOCK_MAXDATA as f64;
    raw.round().clamp(0.0, MOCK_MAXDATA as f64) as u32
}

/// Counts→volts polynomial matching the mock hardware map (input side).
pub fn ai_converter() -> Converter {
    Converter::two_point(0.0, -10.0, MOCK_MAXDATA as f64, 10.0)
        .unwrap_or_else(Converter::identity)
}

/// Volts→counts polynomial matching the mock hardware map (output side).
pub fn ao_converter() -> Converter {
    Converter::two_point(-10.0, 0.0, 10.0, MOCK_MAXDATA as f64)
        .unwrap_or_else(Converter::identity)
}

/// Channel setup for a mock analog input channel.
pub fn ai_channel_setup(channel: u32) -> ChannelSetup {
    ChannelSetup {
        channel,
        min_voltage: -10.0,
        max_voltage: 10.0,
        scale: 1.0,
        converter: ai_converter(),
    }
}

/// Channel setup for a mock analog output channel.
pub fn ao_channel_setup(channel: u32) -> ChannelSetup {
    ChannelSetup {
        channel,
        min_voltage: -10.0,
        max_voltage: 10.0,
        scale: 1.0,
        converter: ao_converter(),
    }
}
