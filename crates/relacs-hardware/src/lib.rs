//! `relacs-hardware`
//!
//! Uniform capability abstraction over DAQ subdevices: analog input,
//! analog output, digital I/O, and attenuators, plus the command records
//! (chanlist, sync-command) the planner hands to them, the device
//! registry, and the TOML hardware configuration loader.
//!
//! Drivers implement the capability traits in [`subsystem`] and are
//! registered as tagged [`device::DeviceHandle`]s; everything above
//! dispatches on the tag.

pub mod command;
pub mod config;
pub mod device;
pub mod range;
pub mod registry;
pub mod subsystem;

pub use command::{AnalogRef, Chanlist, ChanlistEntry, SyncCommand, MAX_CHANLIST};
pub use config::{ConfigError, DeviceEntryConfig, HardwareConfig};
pub use device::{Device, DeviceHandle, DeviceOptions, SubdeviceKind};
pub use range::VoltageRange;
pub use registry::{DeviceRegistry, RegistryEntry};
pub use subsystem::{AnalogInput, AnalogOutput, AttStatus, Attenuator, DigitalIo};
