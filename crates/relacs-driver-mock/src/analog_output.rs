//! Mock analog output subdevice.

use relacs_core::{DaqError, OutList, Result};
use relacs_hardware::command::{Chanlist, SyncCommand};
use relacs_hardware::device::{Device, DeviceOptions};
use relacs_hardware::range::VoltageRange;
use relacs_hardware::subsystem::AnalogOutput;

use crate::bus::LoopbackBus;
use crate::{counts_to_volts, MOCK_BITS, MOCK_MAX_RATE};

/// Analog output publishing its levels onto the loopback bus.
///
/// Every emitted frame is also recorded for test assertions.
pub struct MockAnalogOutput {
    name: String,
    bus: LoopbackBus,
    open: bool,
    channels: u32,
    chanlist: Option<Chanlist>,
    writing: bool,
    emitted: Vec<Vec<u32>>,
}

impl MockAnalogOutput {
    pub fn new(name: impl Into<String>, bus: LoopbackBus, channels: u32) -> Self {
        Self {
            name: name.into(),
            bus,
            open: true,
            channels,
            chanlist: None,
            writing: false,
            emitted: Vec::new(),
        }
    }

    /// All frames emitted so far, oldest first.
    pub fn emitted_frames(&self) -> &[Vec<u32>] {
        &self.emitted
    }

    pub fn clear_emitted(&mut self) {
        self.emitted.clear();
    }
}

impl Device for MockAnalogOutput {
    fn open(&mut self, _path: &str, _options: &DeviceOptions) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
        self.writing = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn device_name(&self) -> &str {
        &self.name
    }

    fn channels(&self) -> u32 {
        self.channels
    }

    fn bits(&self) -> u32 {
        MOCK_BITS
    }

    fn max_rate(&self) -> f64 {
        MOCK_MAX_RATE
    }

    fn max_ranges(&self) -> u32 {
        1
    }

    fn bipolar_range(&self, index: u32) -> Option<VoltageRange> {
        (index == 0).then(|| VoltageRange::bipolar(10.0))
    }

    fn unipolar_range(&self, _index: u32) -> Option<VoltageRange> {
        None
    }
}

impl AnalogOutput for MockAnalogOutput {
    fn prepare_write(&mut self, cmd: &SyncCommand, chanlist: &Chanlist) -> Result<()> {
        if !self.open {
            return Err(DaqError::NotOpen {
                device: self.name.clone(),
            });
        }
        if cmd.frequency > self.max_rate() {
            return Err(DaqError::InvalidRate {
                requested: cmd.frequency,
                achievable: self.max_rate(),
            });
        }
        for entry in chanlist.entries() {
            if entry.channel() >= self.channels {
                return Err(DaqError::InvalidChannel {
                    device: self.name.clone(),
                    channel: entry.channel(),
                    reason: format!("subdevice has {} channels", self.channels),
                });
            }
        }
        self.chanlist = Some(chanlist.clone());
        Ok(())
    }

    fn start_write(&mut self) -> Result<()> {
        if self.chanlist.is_none() {
            return Err(DaqError::Config("analog output not prepared".into()));
        }
        self.writing = true;
        Ok(())
    }

    fn stop_write(&mut self) -> Result<()> {
        self.writing = false;
        Ok(())
    }

    fn writing(&self) -> bool {
        self.writing
    }

    fn emit(&mut self, counts: &[u32]) -> Result<()> {
        if !self.open {
            return Err(DaqError::NotOpen {
                device: self.name.clone(),
            });
        }
        let chanlist = self
            .chanlist
            .as_ref()
            .ok_or_else(|| DaqError::Config("analog output not prepared".into()))?;
        for (i, entry) in chanlist.entries().iter().enumerate() {
            let count = counts.get(i).copied().unwrap_or(0);
            self.bus.publish_ao(entry.channel(), counts_to_volts(count));
        }
        self.emitted.push(counts.to_vec());
        Ok(())
    }

    fn direct_write(&mut self, list: &OutList) -> Result<()> {
        if !self.open {
            return Err(DaqError::NotOpen {
                device: self.name.clone(),
            });
        }
        for signal in list.iter() {
            let channel = signal.channel.ok_or_else(|| DaqError::InvalidChannel {
                device: self.name.clone(),
                channel: u32::MAX,
                reason: "signal channel unresolved".into(),
            })?;
            if channel >= self.channels {
                return Err(DaqError::InvalidChannel {
                    device: self.name.clone(),
                    channel,
                    reason: format!("subdevice has {} channels", self.channels),
                });
            }
            let level = signal.samples().first().copied().unwrap_or(0.0);
            self.bus.publish_ao(channel, level);
        }
        Ok(())
    }
}
