//! Analog output capability.

use relacs_core::{OutList, Result};

use crate::command::{Chanlist, SyncCommand};
use crate::device::Device;

/// A subdevice that emits one frame of analog samples per loop cycle.
pub trait AnalogOutput: Device {
    /// Configure the subdevice for a run.
    fn prepare_write(&mut self, cmd: &SyncCommand, chanlist: &Chanlist) -> Result<()>;

    /// Arm the subdevice; emission begins when the start source fires.
    fn start_write(&mut self) -> Result<()>;

    /// Stop emission at the next cycle boundary. Idempotent.
    fn stop_write(&mut self) -> Result<()>;

    /// True while armed and emitting.
    fn writing(&self) -> bool;

    /// Emit one frame of raw counts in chanlist order.
    fn emit(&mut self, counts: &[u32]) -> Result<()>;

    /// Immediate, non-queued update of single levels: writes the first
    /// sample of each signal in `list` to its channel, bypassing the
    /// periodic pipeline.
    fn direct_write(&mut self, list: &OutList) -> Result<()>;
}
