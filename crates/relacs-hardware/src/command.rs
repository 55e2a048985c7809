//! Device command records emitted by the planner.
//!
//! A submission compiles, per subdevice, into an ordered sequence:
//! chanlist, then one sync-command, then start. The chanlist fixes the
//! per-cycle frame layout; the sync-command parameterizes the periodic
//! task. DIO and trigger operations are independent records handled by
//! the control plane.

use serde::{Deserialize, Serialize};

use relacs_core::sample::ChannelSetup;
use relacs_core::{DaqError, Result, StartSource};

/// Maximum channels per subdevice chanlist.
pub const MAX_CHANLIST: usize = 128;

/// Analog reference of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AnalogRef {
    #[default]
    Ground,
    Common,
    Differential,
    Other,
}

/// One chanlist slot: channel setup plus range and reference selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChanlistEntry {
    pub setup: ChannelSetup,
    /// Index into the device's range table.
    pub range_index: u32,
    pub aref: AnalogRef,
    /// Hardware gain table index.
    pub gain_index: i32,
}

impl ChanlistEntry {
    pub fn new(setup: ChannelSetup) -> Self {
        Self {
            setup,
            range_index: 0,
            aref: AnalogRef::Ground,
            gain_index: 0,
        }
    }

    pub fn channel(&self) -> u32 {
        self.setup.channel
    }
}

/// Ordered channel list defining the per-cycle frame layout of a subdevice.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chanlist {
    entries: Vec<ChanlistEntry>,
}

impl Chanlist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry; fails beyond [`MAX_CHANLIST`] channels.
    pub fn push(&mut self, entry: ChanlistEntry) -> Result<()> {
        if self.entries.len() >= MAX_CHANLIST {
            return Err(DaqError::Config(format!(
                "chanlist limited to {MAX_CHANLIST} channels"
            )));
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ChanlistEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&ChanlistEntry> {
        self.entries.get(index)
    }

    /// Position of a channel number within the frame layout.
    pub fn position(&self, channel: u32) -> Option<usize> {
        self.entries.iter().position(|e| e.channel() == channel)
    }

    /// Channel numbers in frame order.
    pub fn channels(&self) -> Vec<u32> {
        self.entries.iter().map(|e| e.channel()).collect()
    }
}

impl FromIterator<ChanlistEntry> for Chanlist {
    fn from_iter<T: IntoIterator<Item = ChanlistEntry>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().take(MAX_CHANLIST).collect(),
        }
    }
}

/// Per-subdevice configuration of the periodic task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCommand {
    /// Cycle frequency in Hz.
    pub frequency: f64,
    /// Silent pad before the first emitted sample, seconds.
    pub delay: f64,
    /// Total duration in seconds; ignored when `continuous`.
    pub duration: f64,
    pub start_source: StartSource,
    /// Repeat until stopped.
    pub continuous: bool,
    /// FIFO depth in frames.
    pub buffer_frames: usize,
}

impl SyncCommand {
    /// Duration expressed in cycles at the command frequency.
    pub fn duration_cycles(&self) -> u64 {
        (self.duration * self.frequency).round().max(0.0) as u64
    }

    /// Delay expressed in cycles at the command frequency.
    pub fn delay_cycles(&self) -> u64 {
        (self.delay * self.frequency).round().max(0.0) as u64
    }
}

impl Default for SyncCommand {
    fn default() -> Self {
        Self {
            frequency: 1000.0,
            delay: 0.0,
            duration: 0.0,
            start_source: StartSource::Internal,
            continuous: false,
            buffer_frames: 64,
        }
    }
}
