//! `relacs-acquire`
//!
//! The user-space side of the pipeline: the command planner compiling
//! `OutList` submissions into per-subdevice command sequences, the
//! acquisition context owning registry, module, and threads, and the drain
//! thread appending AI frames to the `InData` rings.

pub mod context;
pub mod drain;
pub mod planner;

pub use context::{AcquisitionContext, DeviceFactory};
pub use drain::{drain_once, DrainHandle};
pub use planner::{
    AcquisitionPlan, InTraceConfig, Planner, TakeRelation, WriteOutcome, DEFAULT_FIFO_FRAMES,
};
