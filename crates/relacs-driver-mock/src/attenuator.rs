//! Mock attenuator with a discrete step grid.

use relacs_core::Result;
use relacs_hardware::device::{Device, DeviceOptions};
use relacs_hardware::range::VoltageRange;
use relacs_hardware::subsystem::{AttStatus, Attenuator};

/// State of one attenuator line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LineLevel {
    Unset,
    Level(f64),
    Muted,
}

/// Attenuator snapping requests to a fixed decibel grid.
pub struct MockAttenuator {
    name: String,
    open: bool,
    lines: u32,
    /// Smallest settable attenuation in dB.
    min_level: f64,
    /// Largest settable attenuation in dB.
    max_level: f64,
    /// Grid step in dB.
    step: f64,
    levels: Vec<LineLevel>,
}

impl MockAttenuator {
    pub fn new(name: impl Into<String>, lines: u32) -> Self {
        Self::with_grid(name, lines, -25.0, 100.0, 0.5)
    }

    pub fn with_grid(
        name: impl Into<String>,
        lines: u32,
        min_level: f64,
        max_level: f64,
        step: f64,
    ) -> Self {
        Self {
            name: name.into(),
            open: true,
            lines,
            min_level,
            max_level,
            step,
            levels: vec![LineLevel::Unset; lines as usize],
        }
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn min_level(&self) -> f64 {
        self.min_level
    }

    pub fn max_level(&self) -> f64 {
        self.max_level
    }

    /// State of a line (test probe).
    pub fn line_level(&self, line: u32) -> LineLevel {
        self.levels
            .get(line as usize)
            .copied()
            .unwrap_or(LineLevel::Unset)
    }

    /// Snap a request to the grid, clipping to the level span.
    fn snap(&self, decibel: f64) -> (f64, AttStatus) {
        let snapped = (decibel / self.step).round() * self.step;
        if snapped > self.max_level {
            (self.max_level, AttStatus::Underflow)
        } else if snapped < self.min_level {
            (self.min_level, AttStatus::Overflow)
        } else {
            (snapped, AttStatus::Ok)
        }
    }

    fn check(&self, line: u32) -> Option<AttStatus> {
        if !self.open {
            return Some(AttStatus::NotOpen);
        }
        if line >= self.lines {
            return Some(AttStatus::InvalidDevice);
        }
        None
    }
}

impl Device for MockAttenuator {
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
        0
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

    fn unipolar_range(&self, _index: u32) -> Option<VoltageRange> {
        None
    }
}

impl Attenuator for MockAttenuator {
    fn lines(&self) -> u32 {
        self.lines
    }

    fn attenuate(&mut self, line: u32, decibel: &mut f64) -> AttStatus {
        if let Some(status) = self.check(line) {
            return status;
        }
        let (actual, status) = self.snap(*decibel);
        self.levels[line as usize] = LineLevel::Level(actual);
        *decibel = actual;
        status
    }

    fn test_attenuate(&self, line: u32, decibel: &mut f64) -> AttStatus {
        if let Some(status) = self.check(line) {
            return status;
        }
        let (actual, status) = self.snap(*decibel);
        *decibel = actual;
        status
    }

    fn mute(&mut self, line: u32) -> AttStatus {
        if let Some(status) = self.check(line) {
            return status;
        }
        self.levels[line as usize] = LineLevel::Muted;
        AttStatus::Ok
    }
}
