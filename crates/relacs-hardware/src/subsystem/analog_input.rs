//! Analog input capability.

use relacs_core::Result;

use crate::command::{Chanlist, SyncCommand};
use crate::device::Device;

/// A subdevice that samples analog channels once per loop cycle.
///
/// The real-time loop drives [`AnalogInput::convert`] exactly once per
/// cycle; the chanlist order set by [`AnalogInput::prepare_read`] fixes the
/// layout of the counts written into the scratch frame.
pub trait AnalogInput: Device {
    /// Configure the subdevice for a run. Rejects rates the hardware
    /// cannot achieve and channels outside the subdevice.
    fn prepare_read(&mut self, cmd: &SyncCommand, chanlist: &Chanlist) -> Result<()>;

    /// Arm the subdevice; sampling begins with the next loop cycle.
    fn start_read(&mut self) -> Result<()>;

    /// Stop sampling at the next cycle boundary. Idempotent.
    fn stop_read(&mut self) -> Result<()>;

    /// True while armed and delivering samples.
    fn reading(&self) -> bool;

    /// Sample every chanlist channel, writing raw counts into `counts`
    /// in chanlist order. `counts.len()` equals the chanlist length.
    fn convert(&mut self, counts: &mut [u32]) -> Result<()>;
}
