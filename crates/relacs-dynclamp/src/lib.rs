//! `relacs-dynclamp`
//!
//! The real-time module: a periodic loop task closing the circuit between
//! analog input and analog output, the framed FIFOs that feed it, the
//! control-request plane that configures it, TTL pulse routing, the
//! amplifier sync pulse, and the lookup-table dynamic-clamp model.
//!
//! The cycle engine ([`rtloop::RtLoop`]) is deterministic and steppable;
//! [`rtloop::RtTask`] runs it on a dedicated thread standing in for the
//! kernel's periodic real-time task. [`control::RtModule`] is the facade
//! user space talks to, one synchronous request at a time.

pub mod control;
pub mod fifo;
pub mod lookup;
pub mod model;
pub mod rtloop;
pub mod status;
pub mod ttl;

pub use control::{ControlReply, ControlRequest, DioOp, RtModule, SubdevId, MAX_SUBDEVS};
pub use fifo::{Frame, FrameFifo, IdleMode, IdlePolicy};
pub use lookup::{LookupTable, LookupTables, MAX_LOOKUP_TABLES};
pub use model::{ClampModel, IntegrationAlgo, LookupClampModel, PassThroughModel};
pub use rtloop::{
    AiEndpoint, AoEndpoint, DioEndpoint, LoopConfig, RtLoop, RtTask, TimerMode, TriggerArm,
    DEFAULT_OVERRUN_WINDOW, MAX_LOOP_FREQUENCY,
};
pub use status::{LoopState, LoopStats, LoopStatus, LoopTiming, PhaseTimes, StatusSlot};
pub use ttl::{
    AmplifierMode, IntervalMode, LoopEvent, SyncPulse, TtlPulse, TtlScheduler, MAX_TTL_PULSES,
};
