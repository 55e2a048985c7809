//! Base device capability set and tagged subdevice handles.
//!
//! Concrete drivers implement the capability traits they have; the planner
//! and the real-time loop dispatch on the [`SubdeviceKind`] tag of a
//! [`DeviceHandle`] rather than on an inheritance chain.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use relacs_core::Result;

use crate::range::VoltageRange;
use crate::subsystem::{AnalogInput, AnalogOutput, Attenuator, DigitalIo};

/// Kind tag of a subdevice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubdeviceKind {
    AnalogInput,
    AnalogOutput,
    DigitalIo,
    Attenuator,
}

impl std::fmt::Display for SubdeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SubdeviceKind::AnalogInput => "analog input",
            SubdeviceKind::AnalogOutput => "analog output",
            SubdeviceKind::DigitalIo => "digital i/o",
            SubdeviceKind::Attenuator => "attenuator",
        };
        write!(f, "{label}")
    }
}

/// Free-form open options passed to drivers (driver-specific keys).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceOptions {
    pub params: HashMap<String, String>,
}

impl DeviceOptions {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.insert(key.into(), value.into());
    }
}

/// Capability set common to every subdevice.
pub trait Device: Send {
    /// Open the device node; idempotent opens are driver-defined.
    fn open(&mut self, path: &str, options: &DeviceOptions) -> Result<()>;

    /// Close; further operations fail with `NotOpen`.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    fn device_name(&self) -> &str;

    /// Number of channels on this subdevice.
    fn channels(&self) -> u32;

    /// Converter resolution in bits.
    fn bits(&self) -> u32;

    /// Largest raw count: `2^bits - 1`.
    fn maxdata(&self) -> u32 {
        if self.bits() >= 32 {
            u32::MAX
        } else {
            (1u32 << self.bits()) - 1
        }
    }

    /// Maximum sustained per-channel rate in Hz.
    fn max_rate(&self) -> f64;

    /// Number of entries in the range table.
    fn max_ranges(&self) -> u32;

    /// Bipolar range at table index, `None` if unsupported.
    fn bipolar_range(&self, index: u32) -> Option<VoltageRange>;

    /// Unipolar range at table index, `None` if unsupported.
    fn unipolar_range(&self, index: u32) -> Option<VoltageRange>;
}

/// A registered subdevice, shared between the planner, the control plane,
/// and the real-time loop.
#[derive(Clone)]
pub enum DeviceHandle {
    AnalogInput(Arc<Mutex<dyn AnalogInput>>),
    AnalogOutput(Arc<Mutex<dyn AnalogOutput>>),
    DigitalIo(Arc<Mutex<dyn DigitalIo>>),
    Attenuator(Arc<Mutex<dyn Attenuator>>),
}

impl DeviceHandle {
    pub fn kind(&self) -> SubdeviceKind {
        match self {
            DeviceHandle::AnalogInput(_) => SubdeviceKind::AnalogInput,
            DeviceHandle::AnalogOutput(_) => SubdeviceKind::AnalogOutput,
            DeviceHandle::DigitalIo(_) => SubdeviceKind::DigitalIo,
            DeviceHandle::Attenuator(_) => SubdeviceKind::Attenuator,
        }
    }

    pub fn as_analog_input(&self) -> Option<&Arc<Mutex<dyn AnalogInput>>> {
        match self {
            DeviceHandle::AnalogInput(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_analog_output(&self) -> Option<&Arc<Mutex<dyn AnalogOutput>>> {
        match self {
            DeviceHandle::AnalogOutput(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_digital_io(&self) -> Option<&Arc<Mutex<dyn DigitalIo>>> {
        match self {
            DeviceHandle::DigitalIo(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_attenuator(&self) -> Option<&Arc<Mutex<dyn Attenuator>>> {
        match self {
            DeviceHandle::Attenuator(d) => Some(d),
            _ => None,
        }
    }

    /// Device name as reported by the driver.
    pub fn device_name(&self) -> String {
        match self {
            DeviceHandle::AnalogInput(d) => d.lock().device_name().to_string(),
            DeviceHandle::AnalogOutput(d) => d.lock().device_name().to_string(),
            DeviceHandle::DigitalIo(d) => d.lock().device_name().to_string(),
            DeviceHandle::Attenuator(d) => d.lock().device_name().to_string(),
        }
    }

    pub fn is_open(&self) -> bool {
        match self {
            DeviceHandle::AnalogInput(d) => d.lock().is_open(),
            DeviceHandle::AnalogOutput(d) => d.lock().is_open(),
            DeviceHandle::DigitalIo(d) => d.lock().is_open(),
            DeviceHandle::Attenuator(d) => d.lock().is_open(),
        }
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("kind", &self.kind())
            .field("name", &self.device_name())
            .finish()
    }
}
