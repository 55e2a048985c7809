//! Error taxonomy for the acquisition core.
//!
//! Two layers cooperate here. [`DaqError`] is the structured error returned
//! from fallible calls; it carries the symbolic kind plus a diagnostic
//! string. [`ErrorFlags`] is the per-signal accumulation word kept on
//! `InData`/`OutData`: several faults can pile up on one signal during a
//! submission, and collections report the logical OR of their members.

use bitflags::bitflags;
use thiserror::Error;

/// Maximum length of diagnostic strings crossing the control plane,
/// null terminator excluded. Longer strings are truncated by the caller.
pub const ERROR_STR_MAX: usize = 127;

bitflags! {
    /// Per-signal error accumulation word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ErrorFlags: u64 {
        const NOT_OPEN        = 1 << 0;
        const INVALID_DEVICE  = 1 << 1;
        const INVALID_CHANNEL = 1 << 2;
        const INVALID_RATE    = 1 << 3;
        /// Attenuator: requested level too loud, clipped to minimum attenuation.
        const OVERFLOW        = 1 << 4;
        /// Attenuator: requested level too soft, clipped to maximum attenuation.
        const UNDERFLOW       = 1 << 5;
        /// AI FIFO filled while the user side stalled; oldest frame dropped.
        const OVERRUN         = 1 << 6;
        /// AO FIFO empty when the loop needed a frame; idle value emitted.
        const UNDERRUN        = 1 << 7;
        const READ_ERROR      = 1 << 8;
        const WRITE_ERROR     = 1 << 9;
        const CONFIG_ERROR    = 1 << 10;
        const BUSY            = 1 << 11;
        const NO_DATA         = 1 << 12;
        /// Output was stopped because the analog input it was coupled to stopped.
        const STOPPED_BY_AI   = 1 << 13;
        const ABORTED         = 1 << 14;
        const INTERRUPTED     = 1 << 15;
    }
}

impl ErrorFlags {
    /// True if any fatal (non-clipping) fault is recorded. Attenuator
    /// clipping is non-fatal by contract.
    pub fn is_failed(&self) -> bool {
        !self
            .difference(ErrorFlags::OVERFLOW | ErrorFlags::UNDERFLOW)
            .is_empty()
    }

    /// Symbolic names of the set flags, for diagnostics.
    pub fn names(&self) -> Vec<&'static str> {
        self.iter_names().map(|(name, _)| name).collect()
    }
}

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, DaqError>;

/// Structured error for acquisition operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DaqError {
    #[error("device '{device}' is not open")]
    NotOpen { device: String },

    #[error("invalid device index {index}: {reason}")]
    InvalidDevice { index: usize, reason: String },

    #[error("invalid channel {channel} on device '{device}': {reason}")]
    InvalidChannel {
        device: String,
        channel: u32,
        reason: String,
    },

    #[error("invalid sample rate {requested} Hz (achievable {achievable} Hz)")]
    InvalidRate { requested: f64, achievable: f64 },

    #[error("AI FIFO overrun: {dropped} frame(s) dropped")]
    Overrun { dropped: u64 },

    #[error("AO FIFO underrun at cycle {cycle}")]
    Underrun { cycle: u64 },

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("configuration rejected: {0}")]
    Config(String),

    #[error("device '{device}' is busy")]
    Busy { device: String },

    #[error("no data: {0}")]
    NoData(String),

    #[error("output stopped by analog input restart")]
    StoppedByAi,

    #[error("submission aborted: {0}")]
    Aborted(String),

    #[error("interrupted by user")]
    Interrupted,

    /// Fatal loop fault with a numeric diagnostic code, published through
    /// the status slot and returned to the next caller.
    #[error("fatal loop error {code}: {message}")]
    Fatal { code: i32, message: String },
}

impl DaqError {
    /// The accumulation flag this error maps onto.
    pub fn flags(&self) -> ErrorFlags {
        match self {
            DaqError::NotOpen { .. } => ErrorFlags::NOT_OPEN,
            DaqError::InvalidDevice { .. } => ErrorFlags::INVALID_DEVICE,
            DaqError::InvalidChannel { .. } => ErrorFlags::INVALID_CHANNEL,
            DaqError::InvalidRate { .. } => ErrorFlags::INVALID_RATE,
            DaqError::Overrun { .. } => ErrorFlags::OVERRUN,
            DaqError::Underrun { .. } => ErrorFlags::UNDERRUN,
            DaqError::Read(_) => ErrorFlags::READ_ERROR,
            DaqError::Write(_) => ErrorFlags::WRITE_ERROR,
            DaqError::Config(_) => ErrorFlags::CONFIG_ERROR,
            DaqError::Busy { .. } => ErrorFlags::BUSY,
            DaqError::NoData(_) => ErrorFlags::NO_DATA,
            DaqError::StoppedByAi => ErrorFlags::STOPPED_BY_AI,
            DaqError::Aborted(_) => ErrorFlags::ABORTED,
            DaqError::Interrupted => ErrorFlags::INTERRUPTED,
            DaqError::Fatal { .. } => ErrorFlags::CONFIG_ERROR | ErrorFlags::ABORTED,
        }
    }

    /// Diagnostic string truncated to the control-plane limit.
    pub fn diagnostic(&self) -> String {
        truncate_error_str(&self.to_string())
    }
}

/// Truncate a diagnostic string to [`ERROR_STR_MAX`] bytes on a char boundary.
pub fn truncate_error_str(s: &str) -> String {
    if s.len() <= ERROR_STR_MAX {
        return s.to_string();
    }
    let mut end = ERROR_STR_MAX;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clipping_is_not_failure() {
        let flags = ErrorFlags::OVERFLOW | ErrorFlags::UNDERFLOW;
        assert!(!flags.is_failed());
        assert!((flags | ErrorFlags::WRITE_ERROR).is_failed());
        assert!(!ErrorFlags::empty().is_failed());
    }

    #[test]
    fn test_error_to_flags() {
        let err = DaqError::Underrun { cycle: 7 };
        assert_eq!(err.flags(), ErrorFlags::UNDERRUN);
        assert!(err.to_string().contains('7'));
    }

    #[test]
    fn test_truncate_error_str() {
        let long = "x".repeat(500);
        let truncated = truncate_error_str(&long);
        assert_eq!(truncated.len(), ERROR_STR_MAX);
        assert_eq!(truncate_error_str("short"), "short");
    }

    #[test]
    fn test_flag_names() {
        let flags = ErrorFlags::UNDERRUN | ErrorFlags::BUSY;
        let names = flags.names();
        assert!(names.contains(&"UNDERRUN"));
        assert!(names.contains(&"BUSY"));
    }
}
