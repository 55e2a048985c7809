//! `relacs-core`
//!
//! Data model shared by the acquisition pipeline: sample indexing and
//! calibration, the lock-free sample ring, recorded input traces
//! (`InData`/`InList`), output stimulus descriptions (`OutData`/`OutList`),
//! the trace registry, and the error taxonomy.
//!
//! Everything here is hardware-agnostic. Device capabilities live in
//! `relacs-hardware`, the real-time loop in `relacs-dynclamp`, and the
//! command planner that ties them together in `relacs-acquire`.

pub mod error;
pub mod indata;
pub mod outdata;
pub mod ring;
pub mod sample;
pub mod trace;

pub use error::{DaqError, ErrorFlags, Result};
pub use indata::{InData, InList};
pub use outdata::{OutData, OutDataInfo, OutList, OutputLevel, StartSource, TraceBinding};
pub use ring::SampleRing;
pub use sample::{ChannelSetup, Converter, SampleIndex};
pub use trace::{TraceKind, TraceRegistry, TraceSpec};
