//! The loopback bus connecting mock devices.
//!
//! Mock analog outputs publish their channel voltages here; mock analog
//! inputs read either a wired output channel (loopback cable) or a test
//! source level. All values are physical volts.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct BusInner {
    /// Voltage last emitted on each AO channel.
    ao_levels: HashMap<u32, f64>,
    /// Test source voltage per AI channel (unwired channels).
    sources: HashMap<u32, f64>,
    /// AI channel → AO channel loopback wiring.
    wiring: HashMap<u32, u32>,
    /// Digital lines shared between DIO devices and test probes.
    dio_lines: u32,
}

/// Shared loopback bus. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct LoopbackBus {
    inner: Arc<Mutex<BusInner>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire AI channel `ai_channel` to AO channel `ao_channel`.
    pub fn wire(&self, ai_channel: u32, ao_channel: u32) {
        self.inner.lock().wiring.insert(ai_channel, ao_channel);
    }

    /// Set the test source voltage of an unwired AI channel.
    pub fn set_source(&self, ai_channel: u32, volts: f64) {
        self.inner.lock().sources.insert(ai_channel, volts);
    }

    /// Publish an AO channel voltage (driver side).
    pub fn publish_ao(&self, ao_channel: u32, volts: f64) {
        self.inner.lock().ao_levels.insert(ao_channel, volts);
    }

    /// Voltage seen by an AI channel: wired AO level, else source, else 0 V.
    pub fn ai_level(&self, ai_channel: u32) -> f64 {
        let inner = self.inner.lock();
        if let Some(ao) = inner.wiring.get(&ai_channel) {
            return inner.ao_levels.get(ao).copied().unwrap_or(0.0);
        }
        inner.sources.get(&ai_channel).copied().unwrap_or(0.0)
    }

    /// Last published AO voltage (test probe).
    pub fn ao_level(&self, ao_channel: u32) -> f64 {
        self.inner
            .lock()
            .ao_levels
            .get(&ao_channel)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn set_dio_lines(&self, mask: u32, bits: u32) {
        let mut inner = self.inner.lock();
        inner.dio_lines = (inner.dio_lines & !mask) | (bits & mask);
    }

    pub fn dio_lines(&self) -> u32 {
        self.inner.lock().dio_lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_wiring() {
        let bus = LoopbackBus::new();
        bus.publish_ao(0, 2.5);
        assert_eq!(bus.ai_level(3), 0.0);
        bus.wire(3, 0);
        assert_eq!(bus.ai_level(3), 2.5);
    }

    #[test]
    fn test_sources() {
        let bus = LoopbackBus::new();
        bus.set_source(1, -1.25);
        assert_eq!(bus.ai_level(1), -1.25);
        // wiring takes precedence over a source
        bus.wire(1, 7);
        assert_eq!(bus.ai_level(1), 0.0);
    }

    #[test]
    fn test_dio_lines() {
        let bus = LoopbackBus::new();
        bus.set_dio_lines(0b1111, 0b0101);
        assert_eq!(bus.dio_lines(), 0b0101);
        bus.set_dio_lines(0b0001, 0b0000);
        assert_eq!(bus.dio_lines(), 0b0100);
    }
}
