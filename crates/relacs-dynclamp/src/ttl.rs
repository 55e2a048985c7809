//! TTL pulse routing and the amplifier sync pulse.
//!
//! Digital lines are driven only at the six loop events; a TTL pulse names
//! the event that takes its line high and the event that takes it low. The
//! amplifier sync pulse is a per-cycle pulse on one line, enabled only in
//! amplifier modes selected by a mask, defaulting to high at `EndWrite`
//! and low at `EndRead` (the SEC switch-cycle convention).

use bitflags::bitflags;

use relacs_core::{DaqError, Result};

/// Maximum TTL pulses per DIO subdevice.
pub const MAX_TTL_PULSES: usize = 5;

/// The points of a loop cycle at which digital lines may be driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LoopEvent {
    StartWrite = 0,
    EndWrite = 1,
    StartRead = 2,
    EndRead = 3,
    StartAo = 4,
    EndAo = 5,
    Undefined = 6,
}

impl LoopEvent {
    /// The six schedulable events, in cycle order.
    pub const ALL: [LoopEvent; 6] = [
        LoopEvent::StartWrite,
        LoopEvent::EndWrite,
        LoopEvent::StartRead,
        LoopEvent::EndRead,
        LoopEvent::StartAo,
        LoopEvent::EndAo,
    ];

    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::StartWrite),
            1 => Some(Self::EndWrite),
            2 => Some(Self::StartRead),
            3 => Some(Self::EndRead),
            4 => Some(Self::StartAo),
            5 => Some(Self::EndAo),
            6 => Some(Self::Undefined),
            _ => None,
        }
    }
}

/// One configured TTL pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPulse {
    pub line: u32,
    /// Event driving the line high.
    pub high: LoopEvent,
    /// Event driving the line low.
    pub low: LoopEvent,
}

/// The per-subdevice TTL pulse table.
#[derive(Debug, Clone, Default)]
pub struct TtlScheduler {
    pulses: Vec<TtlPulse>,
}

impl TtlScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pulse; at most [`MAX_TTL_PULSES`] are accepted and the events
    /// must be schedulable (not `Undefined`).
    pub fn add(&mut self, pulse: TtlPulse) -> Result<()> {
        if self.pulses.len() >= MAX_TTL_PULSES {
            return Err(DaqError::Config(format!(
                "at most {MAX_TTL_PULSES} TTL pulses per DIO subdevice"
            )));
        }
        if pulse.high == LoopEvent::Undefined || pulse.low == LoopEvent::Undefined {
            return Err(DaqError::Config("TTL pulse events must be defined".into()));
        }
        self.pulses.push(pulse);
        Ok(())
    }

    /// Remove pulses on `line`; when `event` is given, only those whose
    /// high event matches it.
    pub fn clear(&mut self, line: u32, event: Option<LoopEvent>) {
        self.pulses
            .retain(|p| p.line != line || event.is_some_and(|e| p.high != e));
    }

    pub fn len(&self) -> usize {
        self.pulses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pulses.is_empty()
    }

    pub fn pulses(&self) -> &[TtlPulse] {
        &self.pulses
    }

    /// Line masks to apply at `event`: `(mask, bits)` suitable for a DIO
    /// write — every returned masked line is driven, high where the bit is
    /// set.
    pub fn masks_for(&self, event: LoopEvent) -> (u32, u32) {
        let mut mask = 0u32;
        let mut bits = 0u32;
        for p in &self.pulses {
            if p.high == event {
                mask |= 1 << p.line;
                bits |= 1 << p.line;
            }
            if p.low == event {
                mask |= 1 << p.line;
                bits &= !(1 << p.line);
            }
        }
        (mask, bits)
    }
}

bitflags! {
    /// Amplifier operating modes, as signalled on the mode DIO lines.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AmplifierMode: u8 {
        const BRIDGE = 1 << 0;
        /// Current clamp.
        const CC = 1 << 1;
        /// Dynamic clamp.
        const DC = 1 << 2;
        /// Voltage clamp.
        const VC = 1 << 3;
    }
}

/// How the sync pulse period is derived.
///
/// Only `Fixed` is exercised by the shipped setups; the measured variants
/// are accepted for configuration compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntervalMode {
    /// Pulse period fixed to the configured loop period.
    #[default]
    Fixed,
    /// Period re-measured every cycle.
    PerCycle,
    /// Period averaged over recent cycles.
    Averaged,
}

/// Amplifier sync-pulse configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncPulse {
    pub line: u32,
    /// Pulse width in seconds.
    pub width: f64,
    pub interval_mode: IntervalMode,
    /// Which mode bits participate in the enable comparison.
    pub mode_mask: AmplifierMode,
    /// Required values of the masked mode bits.
    pub mode_bits: AmplifierMode,
    /// Event taking the line high.
    pub high: LoopEvent,
    /// Event taking the line low.
    pub low: LoopEvent,
}

impl SyncPulse {
    /// Sync pulse with the default SEC event reference.
    pub fn new(line: u32, width: f64, mode_mask: AmplifierMode, mode_bits: AmplifierMode) -> Self {
        Self {
            line,
            width,
            interval_mode: IntervalMode::Fixed,
            mode_mask,
            mode_bits,
            high: LoopEvent::EndWrite,
            low: LoopEvent::EndRead,
        }
    }

    /// True if the pulse fires in the given amplifier mode.
    pub fn applies_to(&self, mode: AmplifierMode) -> bool {
        (mode & self.mode_mask) == (self.mode_bits & self.mode_mask)
    }

    /// Line state change at `event`: `Some(level)` if this event drives the
    /// line.
    pub fn level_at(&self, event: LoopEvent, mode: AmplifierMode) -> Option<bool> {
        if !self.applies_to(mode) {
            return None;
        }
        if event == self.high {
            Some(true)
        } else if event == self.low {
            Some(false)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masks_for_event() {
        let mut sched = TtlScheduler::new();
        sched
            .add(TtlPulse {
                line: 3,
                high: LoopEvent::StartWrite,
                low: LoopEvent::EndWrite,
            })
            .unwrap();
        sched
            .add(TtlPulse {
                line: 4,
                high: LoopEvent::StartRead,
                low: LoopEvent::EndRead,
            })
            .unwrap();

        let (mask, bits) = sched.masks_for(LoopEvent::StartWrite);
        assert_eq!(mask, 1 << 3);
        assert_eq!(bits, 1 << 3);
        let (mask, bits) = sched.masks_for(LoopEvent::EndWrite);
        assert_eq!(mask, 1 << 3);
        assert_eq!(bits, 0);
        // read events never touch the write pulse line
        let (mask, _) = sched.masks_for(LoopEvent::EndRead);
        assert_eq!(mask, 1 << 4);
    }

    #[test]
    fn test_pulse_limit() {
        let mut sched = TtlScheduler::new();
        for line in 0..MAX_TTL_PULSES as u32 {
            sched
                .add(TtlPulse {
                    line,
                    high: LoopEvent::StartAo,
                    low: LoopEvent::EndAo,
                })
                .unwrap();
        }
        assert!(sched
            .add(TtlPulse {
                line: 9,
                high: LoopEvent::StartAo,
                low: LoopEvent::EndAo,
            })
            .is_err());
    }

    #[test]
    fn test_undefined_event_rejected() {
        let mut sched = TtlScheduler::new();
        assert!(sched
            .add(TtlPulse {
                line: 0,
                high: LoopEvent::Undefined,
                low: LoopEvent::EndAo,
            })
            .is_err());
    }

    #[test]
    fn test_clear_by_line() {
        let mut sched = TtlScheduler::new();
        sched
            .add(TtlPulse {
                line: 1,
                high: LoopEvent::StartWrite,
                low: LoopEvent::EndWrite,
            })
            .unwrap();
        sched
            .add(TtlPulse {
                line: 1,
                high: LoopEvent::StartRead,
                low: LoopEvent::EndRead,
            })
            .unwrap();
        sched.clear(1, Some(LoopEvent::StartWrite));
        assert_eq!(sched.len(), 1);
        sched.clear(1, None);
        assert!(sched.is_empty());
    }

    #[test]
    fn test_sync_pulse_mode_gating() {
        let pulse = SyncPulse::new(2, 50e-6, AmplifierMode::DC | AmplifierMode::CC, AmplifierMode::DC);
        assert!(pulse.applies_to(AmplifierMode::DC));
        assert!(pulse.applies_to(AmplifierMode::DC | AmplifierMode::VC));
        assert!(!pulse.applies_to(AmplifierMode::CC));
        assert_eq!(pulse.level_at(LoopEvent::EndWrite, AmplifierMode::DC), Some(true));
        assert_eq!(pulse.level_at(LoopEvent::EndRead, AmplifierMode::DC), Some(false));
        assert_eq!(pulse.level_at(LoopEvent::StartRead, AmplifierMode::DC), None);
        assert_eq!(pulse.level_at(LoopEvent::EndWrite, AmplifierMode::CC), None);
    }
}
