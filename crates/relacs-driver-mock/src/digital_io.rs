//! Mock digital I/O subdevice with a write log for pulse assertions.

use relacs_core::{DaqError, Result};
use relacs_hardware::device::{Device, DeviceOptions};
use relacs_hardware::range::VoltageRange;
use relacs_hardware::subsystem::DigitalIo;

use crate::bus::LoopbackBus;

/// One recorded line write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DioWrite {
    pub mask: u32,
    pub bits: u32,
    /// Line levels after this write was applied.
    pub lines_after: u32,
}

/// Digital I/O device backed by the loopback bus.
pub struct MockDigitalIo {
    name: String,
    bus: LoopbackBus,
    open: bool,
    lines: u32,
    direction: u32,
    log: Vec<DioWrite>,
}

impl MockDigitalIo {
    pub fn new(name: impl Into<String>, bus: LoopbackBus, lines: u32) -> Self {
        Self {
            name: name.into(),
            bus,
            open: true,
            lines,
            direction: 0,
            log: Vec::new(),
        }
    }

    /// Every write since the last clear, oldest first.
    pub fn write_log(&self) -> &[DioWrite] {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    /// Current line levels.
    pub fn line_state(&self) -> u32 {
        self.bus.dio_lines()
    }
}

impl Device for MockDigitalIo {
    fn open(&mut self, _path: &str, _options: &DeviceOptions) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn device_name(&self) -> &str {
        &self.name
    }

    fn channels(&self) -> u32 {
        self.lines
    }

    fn bits(&self) -> u32 {
        1
    }

    fn max_rate(&self) -> f64 {
        0.0
    }

    fn max_ranges(&self) -> u32 {
        0
    }

    fn bipolar_range(&self, _index: u32) -> Option<VoltageRange> {
        None
    }

    fn unipolar_range(&self, index: u32) -> Option<VoltageRange> {
        (index == 0).then(|| VoltageRange::unipolar(5.0))
    }
}

impl DigitalIo for MockDigitalIo {
    fn configure(&mut self, line_mask: u32, direction_mask: u32) -> Result<()> {
        if !self.open {
            return Err(DaqError::NotOpen {
                device: self.name.clone(),
            });
        }
        self.direction = (self.direction & !line_mask) | (direction_mask & line_mask);
        Ok(())
    }

    fn read_lines(&mut self, mask: u32) -> Result<u32> {
        if !self.open {
            return Err(DaqError::NotOpen {
                device: self.name.clone(),
            });
        }
        Ok(self.bus.dio_lines() & mask)
    }

    fn write_lines(&mut self, mask: u32, bits: u32) -> Result<()> {
        if !self.open {
            return Err(DaqError::NotOpen {
                device: self.name.clone(),
            });
        }
        self.bus.set_dio_lines(mask, bits);
        self.log.push(DioWrite {
            mask,
            bits: bits & mask,
            lines_after: self.bus.dio_lines(),
        });
        Ok(())
    }
}
