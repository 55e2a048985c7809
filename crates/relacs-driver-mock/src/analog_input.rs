//! Mock analog input subdevice.

use relacs_core::{DaqError, Result};
use relacs_hardware::command::{Chanlist, SyncCommand};
use relacs_hardware::device::{Device, DeviceOptions};
use relacs_hardware::range::VoltageRange;
use relacs_hardware::subsystem::AnalogInput;

use crate::bus::LoopbackBus;
use crate::{volts_to_counts, MOCK_BITS, MOCK_MAX_RATE};

/// Analog input fed from the loopback bus.
pub struct MockAnalogInput {
    name: String,
    bus: LoopbackBus,
    open: bool,
    channels: u32,
    chanlist: Option<Chanlist>,
    reading: bool,
}

impl MockAnalogInput {
    pub fn new(name: impl Into<String>, bus: LoopbackBus, channels: u32) -> Self {
        Self {
            name: name.into(),
            bus,
            open: true,
            channels,
            chanlist: None,
            reading: false,
        }
    }
}

impl Device for MockAnalogInput {
    fn open(&mut self, _path: &str, _options: &DeviceOptions) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
        self.reading = false;
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

impl AnalogInput for MockAnalogInput {
    fn prepare_read(&mut self, cmd: &SyncCommand, chanlist: &Chanlist) -> Result<()> {
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

    fn start_read(&mut self) -> Result<()> {
        if self.chanlist.is_none() {
            return Err(DaqError::Config("analog input not prepared".into()));
        }
        self.reading = true;
        Ok(())
    }

    fn stop_read(&mut self) -> Result<()> {
        self.reading = false;
        Ok(())
    }

    fn reading(&self) -> bool {
        self.reading
    }

    fn convert(&mut self, counts: &mut [u32]) -> Result<()> {
        if !self.reading {
            return Err(DaqError::Read("analog input not started".into()));
        }
        let chanlist = self
            .chanlist
            .as_ref()
            .ok_or_else(|| DaqError::Config("analog input not prepared".into()))?;
        for (i, entry) in chanlist.entries().iter().enumerate() {
            let volts = self.bus.ai_level(entry.channel());
            if let Some(slot) = counts.get_mut(i) {
                *slot = volts_to_counts(volts);
            }
        }
        Ok(())
    }
}
