//! Device registry.
//!
//! Subdevices are registered under a unique name; planners address them by
//! name or by (kind, ordinal) and the resulting registry index is the
//! device index carried on traces and signals.

use tracing::{debug, info};

use relacs_core::{DaqError, Result};

use crate::device::{DeviceHandle, SubdeviceKind};

/// One registered subdevice.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub name: String,
    pub handle: DeviceHandle,
}

/// Name-addressed collection of subdevices.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    entries: Vec<RegistryEntry>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subdevice; names must be unique.
    pub fn register(&mut self, name: impl Into<String>, handle: DeviceHandle) -> Result<usize> {
        let name = name.into();
        if self.entries.iter().any(|e| e.name == name) {
            return Err(DaqError::Config(format!(
                "device name '{name}' already registered"
            )));
        }
        debug!(name = %name, kind = %handle.kind(), "registering device");
        self.entries.push(RegistryEntry { name, handle });
        Ok(self.entries.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&RegistryEntry> {
        self.entries.get(index)
    }

    /// Handle at a registry index of the expected kind.
    pub fn handle_of_kind(&self, index: usize, kind: SubdeviceKind) -> Result<&DeviceHandle> {
        let entry = self
            .entries
            .get(index)
            .ok_or_else(|| DaqError::InvalidDevice {
                index,
                reason: format!("registry has {} devices", self.entries.len()),
            })?;
        if entry.handle.kind() != kind {
            return Err(DaqError::InvalidDevice {
                index,
                reason: format!("device '{}' is {}, expected {kind}", entry.name, entry.handle.kind()),
            });
        }
        Ok(&entry.handle)
    }

    /// Find a subdevice by name.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    /// Find the n-th subdevice of a kind.
    pub fn find_kind(&self, kind: SubdeviceKind, nth: usize) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.handle.kind() == kind)
            .nth(nth)
            .map(|(i, _)| i)
    }

    /// All registry indices of a kind, in registration order.
    pub fn indices_of_kind(&self, kind: SubdeviceKind) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.handle.kind() == kind)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.iter()
    }

    /// Close every registered device.
    pub fn close_all(&self) {
        info!(devices = self.entries.len(), "closing all devices");
        for entry in &self.entries {
            match &entry.handle {
                DeviceHandle::AnalogInput(d) => d.lock().close(),
                DeviceHandle::AnalogOutput(d) => d.lock().close(),
                DeviceHandle::DigitalIo(d) => d.lock().close(),
                DeviceHandle::Attenuator(d) => d.lock().close(),
            }
        }
    }
}
