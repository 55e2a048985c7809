//! Digital I/O capability.
//!
//! Raw line access only. TTL pulse scheduling and the amplifier sync pulse
//! are loop concerns: they live in the real-time module, which drives the
//! lines through [`DigitalIo::write_lines`] at the configured loop events.

use relacs_core::Result;

use crate::device::Device;

/// A subdevice exposing digital lines.
pub trait DigitalIo: Device {
    /// Configure masked lines: a set bit in `direction_mask` makes the
    /// corresponding masked line an output, a clear bit an input.
    fn configure(&mut self, line_mask: u32, direction_mask: u32) -> Result<()>;

    /// Read the masked input lines.
    fn read_lines(&mut self, mask: u32) -> Result<u32>;

    /// Drive the masked output lines to `bits`.
    fn write_lines(&mut self, mask: u32, bits: u32) -> Result<()>;
}
