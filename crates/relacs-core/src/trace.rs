//! Trace registry: the named plumbing between the kernel loop and user space.
//!
//! Every recorded or emitted quantity is a trace. The kernel side exports a
//! symbolic name and unit per trace; user space assigns the device and
//! channel the trace maps onto before the loop starts.

use serde::{Deserialize, Serialize};

/// Maximum length of trace names and units crossing the control plane.
pub const TRACE_NAME_MAX: usize = 127;

/// Role of a trace in the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceKind {
    /// Recorded analog input channel.
    TraceIn,
    /// Emitted analog output channel.
    TraceOut,
    /// Model parameter read back from the kernel.
    ParamIn,
    /// Model parameter written into the kernel.
    ParamOut,
    /// Kernel-internal status quantity (loop timing counters).
    StatusIn,
}

/// Names of the status traces published when the loop's timing counters
/// are enabled.
pub const STATUS_TRACE_NAMES: [&str; 6] = [
    "Interval",
    "AI-time",
    "AI-acquisition-time",
    "AO-time",
    "Model-time",
    "Wait-time",
];

/// One registered trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSpec {
    pub kind: TraceKind,
    /// Kernel-side symbolic name.
    pub name: String,
    pub unit: String,
    /// User-side device assignment, set before start.
    pub device: Option<usize>,
    /// User-side channel assignment, set before start.
    pub channel: Option<u32>,
}

impl TraceSpec {
    pub fn new(kind: TraceKind, name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            unit: unit.into(),
            device: None,
            channel: None,
        }
    }

    /// True once both device and channel are assigned.
    pub fn is_assigned(&self) -> bool {
        self.device.is_some() && self.channel.is_some()
    }
}

/// Ordered collection of trace specs with name lookup and channel assignment.
#[derive(Debug, Clone, Default)]
pub struct TraceRegistry {
    traces: Vec<TraceSpec>,
}

impl TraceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the six loop-timing status traces.
    pub fn with_status_traces() -> Self {
        let mut reg = Self::new();
        for name in STATUS_TRACE_NAMES {
            reg.add(TraceSpec::new(TraceKind::StatusIn, name, "s"));
        }
        reg
    }

    /// Register a trace; returns its index.
    pub fn add(&mut self, spec: TraceSpec) -> usize {
        self.traces.push(spec);
        self.traces.len() - 1
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TraceSpec> {
        self.traces.get(index)
    }

    /// Find a trace by symbolic name.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.traces.iter().position(|t| t.name == name)
    }

    /// Find the n-th trace of a given kind.
    pub fn find_kind(&self, kind: TraceKind, nth: usize) -> Option<usize> {
        self.traces
            .iter()
            .enumerate()
            .filter(|(_, t)| t.kind == kind)
            .nth(nth)
            .map(|(i, _)| i)
    }

    /// Assign the user-side device/channel of a trace.
    pub fn assign_channel(&mut self, index: usize, device: usize, channel: u32) -> bool {
        match self.traces.get_mut(index) {
            Some(t) => {
                t.device = Some(device);
                t.channel = Some(channel);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TraceSpec> {
        self.traces.iter()
    }

    /// All traces of one kind, in registration order.
    pub fn of_kind(&self, kind: TraceKind) -> impl Iterator<Item = &TraceSpec> {
        self.traces.iter().filter(move |t| t.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_find() {
        let mut reg = TraceRegistry::new();
        let v = reg.add(TraceSpec::new(TraceKind::TraceIn, "V-1", "mV"));
        reg.add(TraceSpec::new(TraceKind::TraceOut, "Current-1", "nA"));
        assert_eq!(reg.find("V-1"), Some(v));
        assert_eq!(reg.find("missing"), None);
        assert_eq!(reg.find_kind(TraceKind::TraceOut, 0), Some(1));
    }

    #[test]
    fn test_channel_assignment() {
        let mut reg = TraceRegistry::new();
        let i = reg.add(TraceSpec::new(TraceKind::TraceIn, "V-1", "mV"));
        assert!(!reg.get(i).unwrap().is_assigned());
        assert!(reg.assign_channel(i, 0, 3));
        let t = reg.get(i).unwrap();
        assert_eq!(t.device, Some(0));
        assert_eq!(t.channel, Some(3));
        assert!(!reg.assign_channel(99, 0, 0));
    }

    #[test]
    fn test_status_traces() {
        let reg = TraceRegistry::with_status_traces();
        assert_eq!(reg.of_kind(TraceKind::StatusIn).count(), 6);
        assert!(reg.find("Model-time").is_some());
    }
}
