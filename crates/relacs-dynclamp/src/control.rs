//! Control plane of the real-time module.
//!
//! User space talks to the module through a typed request set that mirrors
//! a control-ioctl channel: open-subdevice, chanlist, sync-command,
//! start/stop, DIO operations, triggers, trace plumbing, loop statistics,
//! and lookup-table upload. Requests are synchronous and serialized by a
//! single mutex; configuration touches the cycle engine only between
//! cycles (the engine mutex is never taken mid-cycle by anyone else).

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use relacs_core::trace::{TraceRegistry, TraceSpec};
use relacs_core::{DaqError, Result};
use relacs_hardware::command::{Chanlist, SyncCommand};
use relacs_hardware::device::{DeviceHandle, SubdeviceKind};

use crate::fifo::{FrameFifo, IdlePolicy};
use crate::lookup::{LookupTable, LookupTables};
use crate::model::ClampModel;
use crate::rtloop::{AiEndpoint, AoEndpoint, DioEndpoint, LoopConfig, RtLoop, TriggerArm};
use crate::status::{LoopState, LoopStatus, StatusPublisher, StatusSlot};
use crate::ttl::{AmplifierMode, LoopEvent, SyncPulse, TtlPulse};

/// Maximum subdevice slots the module manages.
pub const MAX_SUBDEVS: usize = 8;

/// Handle of an opened subdevice slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubdevId(pub usize);

/// DIO operation codes.
#[derive(Debug, Clone)]
pub enum DioOp {
    Configure { line_mask: u32, direction_mask: u32 },
    Read { mask: u32 },
    Write { mask: u32, bits: u32 },
    AddTtlPulse { line: u32, high: LoopEvent, low: LoopEvent },
    ClearTtlPulse { line: u32, high: Option<LoopEvent> },
    SetSyncPulse(SyncPulse),
    ClearSyncPulse,
}

/// Control requests accepted by the module.
#[derive(Clone)]
pub enum ControlRequest {
    OpenSubdev {
        handle: DeviceHandle,
        fifo_frames: usize,
    },
    SetChanlist {
        subdev: SubdevId,
        chanlist: Chanlist,
    },
    SetSyncCommand {
        subdev: SubdevId,
        command: SyncCommand,
    },
    StartSubdev {
        subdev: SubdevId,
    },
    StopSubdev {
        subdev: SubdevId,
    },
    CheckRunning {
        subdev: SubdevId,
    },
    RequestClose {
        subdev: SubdevId,
    },
    Dio {
        subdev: SubdevId,
        op: DioOp,
    },
    SetTrigger {
        channel: u32,
        level: f64,
    },
    UnsetTrigger,
    GetTraceInfo {
        index: usize,
    },
    SetTraceChannel {
        index: usize,
        device: usize,
        channel: u32,
    },
    GetRate,
    GetLoopCount,
    GetAoIndex,
    GetLoopAvg,
    GetLoopSqAvg,
    GetLoopMin,
    GetLoopMax,
    /// Select the lookup table slot for the following upload.
    SetLookupTable {
        index: usize,
    },
    /// Announce the breakpoint count of the pending upload.
    SetLookupSize {
        size: usize,
    },
    SetLookupX {
        values: Vec<f64>,
    },
    SetLookupY {
        values: Vec<f64>,
    },
}

/// Replies to control requests.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlReply {
    Done,
    Subdev(SubdevId),
    Running(bool),
    Bits(u32),
    Value(f64),
    Count(u64),
    Trace(TraceSpec),
}

impl ControlReply {
    pub fn count(&self) -> Option<u64> {
        match self {
            ControlReply::Count(v) => Some(*v),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            ControlReply::Value(v) => Some(*v),
            _ => None,
        }
    }
}

/// One opened subdevice slot.
struct SubdevSlot {
    kind: SubdeviceKind,
    handle: DeviceHandle,
    chanlist: Option<Chanlist>,
    command: Option<SyncCommand>,
    fifo: FrameFifo,
    /// Index into the engine's AO endpoint list (AO slots).
    ao_slot: Option<usize>,
    /// Index into the engine's DIO endpoint list (DIO slots).
    dio_slot: Option<usize>,
    started: bool,
}

struct ControlState {
    slots: Vec<Option<SubdevSlot>>,
    traces: TraceRegistry,
    lookups: LookupTables,
}

/// The real-time module facade.
///
/// Owns the cycle engine and every subdevice slot; the planner drives it
/// through [`RtModule::ioctl`] or the typed convenience methods.
pub struct RtModule {
    engine: Arc<Mutex<RtLoop>>,
    state: Mutex<ControlState>,
    status: Arc<StatusSlot>,
    publisher: StatusPublisher,
}

impl RtModule {
    pub fn new() -> Self {
        let status = StatusSlot::new();
        let engine = Arc::new(Mutex::new(RtLoop::new(Arc::clone(&status))));
        Self {
            engine,
            state: Mutex::new(ControlState {
                slots: Vec::new(),
                traces: TraceRegistry::with_status_traces(),
                lookups: LookupTables::new(),
            }),
            status,
            publisher: StatusPublisher::new(),
        }
    }

    /// Shared handle to the cycle engine (the loop task and tests step it).
    pub fn engine(&self) -> Arc<Mutex<RtLoop>> {
        Arc::clone(&self.engine)
    }

    pub fn status(&self) -> Arc<StatusSlot> {
        Arc::clone(&self.status)
    }

    /// Latest published status snapshot.
    pub fn status_snapshot(&self) -> LoopStatus {
        self.status.snapshot()
    }

    /// Await-able mirror of the status slot.
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<LoopStatus> {
        self.publisher.subscribe()
    }

    /// Push the current status into the watch mirror.
    pub fn publish_status(&self) {
        self.publisher.publish(self.status.snapshot());
    }

    /// Loop-level configuration (frequency, timing counters, timer mode).
    pub fn configure_loop(&self, config: LoopConfig) -> Result<()> {
        self.engine.lock().configure(config)
    }

    /// Install or remove the in-loop model.
    pub fn set_model(&self, model: Option<Box<dyn ClampModel>>) {
        self.engine.lock().set_model(model);
    }

    /// Current amplifier mode as seen by the sync-pulse gate.
    pub fn set_amplifier_mode(&self, mode: AmplifierMode) {
        self.engine.lock().set_amplifier_mode(mode);
    }

    /// Register an input/output trace the kernel side exports.
    pub fn register_trace(&self, spec: TraceSpec) -> usize {
        self.state.lock().traces.add(spec)
    }

    /// Completed lookup table `k`, if uploaded.
    pub fn lookup_table(&self, k: usize) -> Option<LookupTable> {
        self.state.lock().lookups.get(k).cloned()
    }

    /// The frame FIFO of a subdevice slot (AI: drain side, AO: fill side).
    pub fn fifo(&self, subdev: SubdevId) -> Result<FrameFifo> {
        let state = self.state.lock();
        let slot = slot_ref(&state, subdev)?;
        Ok(slot.fifo.clone())
    }

    /// Reset the engine out of `ErrorFatal`.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        for slot in state.slots.iter_mut().flatten() {
            slot.started = false;
            slot.fifo.clear();
        }
        self.engine.lock().reset();
    }

    /// Handle one control request.
    ///
    /// Serialized against concurrent callers by the control mutex and
    /// against the loop by the engine mutex (taken only between cycles).
    pub fn ioctl(&self, request: ControlRequest) -> Result<ControlReply> {
        match request {
            ControlRequest::OpenSubdev {
                handle,
                fifo_frames,
            } => self.open_subdev(handle, fifo_frames).map(ControlReply::Subdev),
            ControlRequest::SetChanlist { subdev, chanlist } => {
                self.set_chanlist(subdev, chanlist).map(|_| ControlReply::Done)
            }
            ControlRequest::SetSyncCommand { subdev, command } => self
                .set_sync_command(subdev, command)
                .map(|_| ControlReply::Done),
            ControlRequest::StartSubdev { subdev } => {
                self.start_subdev(subdev).map(|_| ControlReply::Done)
            }
            ControlRequest::StopSubdev { subdev } => {
                self.stop_subdev(subdev).map(|_| ControlReply::Done)
            }
            ControlRequest::CheckRunning { subdev } => {
                self.check_running(subdev).map(ControlReply::Running)
            }
            ControlRequest::RequestClose { subdev } => {
                self.request_close(subdev).map(|_| ControlReply::Done)
            }
            ControlRequest::Dio { subdev, op } => self.dio_cmd(subdev, op),
            ControlRequest::SetTrigger { channel, level } => {
                self.set_trigger(channel, level).map(|_| ControlReply::Done)
            }
            ControlRequest::UnsetTrigger => {
                self.engine.lock().set_trigger(None);
                Ok(ControlReply::Done)
            }
            ControlRequest::GetTraceInfo { index } => {
                let state = self.state.lock();
                state
                    .traces
                    .get(index)
                    .cloned()
                    .map(ControlReply::Trace)
                    .ok_or_else(|| DaqError::NoData(format!("no trace {index}")))
            }
            ControlRequest::SetTraceChannel {
                index,
                device,
                channel,
            } => {
                let mut state = self.state.lock();
                if state.traces.assign_channel(index, device, channel) {
                    Ok(ControlReply::Done)
                } else {
                    Err(DaqError::NoData(format!("no trace {index}")))
                }
            }
            ControlRequest::GetRate => Ok(ControlReply::Value(self.status.rate())),
            ControlRequest::GetLoopCount => Ok(ControlReply::Count(self.status.loop_count())),
            ControlRequest::GetAoIndex => Ok(ControlReply::Count(self.status.ao_index())),
            ControlRequest::GetLoopAvg => {
                Ok(ControlReply::Value(self.engine.lock().timing().mean))
            }
            ControlRequest::GetLoopSqAvg => {
                let t = self.engine.lock().timing();
                Ok(ControlReply::Value(t.variance + t.mean * t.mean))
            }
            ControlRequest::GetLoopMin => Ok(ControlReply::Value(self.engine.lock().timing().min)),
            ControlRequest::GetLoopMax => Ok(ControlReply::Value(self.engine.lock().timing().max)),
            ControlRequest::SetLookupTable { index } => {
                self.state.lock().lookups.select(index)?;
                Ok(ControlReply::Done)
            }
            ControlRequest::SetLookupSize { size } => {
                self.state.lock().lookups.announce_size(size);
                Ok(ControlReply::Done)
            }
            ControlRequest::SetLookupX { values } => {
                self.state.lock().lookups.set_x(values)?;
                Ok(ControlReply::Done)
            }
            ControlRequest::SetLookupY { values } => {
                self.state.lock().lookups.set_y(values)?;
                Ok(ControlReply::Done)
            }
        }
    }

    /// Open a subdevice slot around a registered device handle.
    pub fn open_subdev(&self, handle: DeviceHandle, fifo_frames: usize) -> Result<SubdevId> {
        let mut state = self.state.lock();
        let open_slots = state.slots.iter().flatten().count();
        if open_slots >= MAX_SUBDEVS {
            return Err(DaqError::Config(format!(
                "at most {MAX_SUBDEVS} subdevices may be open"
            )));
        }
        if !handle.is_open() {
            return Err(DaqError::NotOpen {
                device: handle.device_name(),
            });
        }
        let kind = handle.kind();
        let slot = SubdevSlot {
            kind,
            handle: handle.clone(),
            chanlist: None,
            command: None,
            fifo: FrameFifo::new(fifo_frames.max(1)),
            ao_slot: None,
            dio_slot: None,
            started: false,
        };
        // DIO subdevices join the engine immediately; they carry no
        // per-acquisition configuration.
        let dio_slot = if let DeviceHandle::DigitalIo(dio) = &handle {
            Some(self.engine.lock().add_dio(DioEndpoint::new(Arc::clone(dio))))
        } else {
            None
        };
        let id = SubdevId(state.slots.len());
        state.slots.push(Some(SubdevSlot { dio_slot, ..slot }));
        debug!(id = id.0, kind = %kind, "subdevice opened");
        Ok(id)
    }

    /// Set the chanlist of an AI/AO slot.
    pub fn set_chanlist(&self, subdev: SubdevId, chanlist: Chanlist) -> Result<()> {
        if chanlist.is_empty() {
            return Err(DaqError::Config("empty chanlist".into()));
        }
        let mut state = self.state.lock();
        let slot = slot_mut(&mut state, subdev)?;
        if slot.kind != SubdeviceKind::AnalogInput && slot.kind != SubdeviceKind::AnalogOutput {
            return Err(DaqError::Config(format!(
                "chanlist not applicable to {} subdevice",
                slot.kind
            )));
        }
        slot.chanlist = Some(chanlist);
        Ok(())
    }

    /// Set the sync command of an AI/AO slot.
    pub fn set_sync_command(&self, subdev: SubdevId, command: SyncCommand) -> Result<()> {
        if command.frequency <= 0.0 {
            return Err(DaqError::InvalidRate {
                requested: command.frequency,
                achievable: 0.0,
            });
        }
        let mut state = self.state.lock();
        let slot = slot_mut(&mut state, subdev)?;
        slot.command = Some(command);
        Ok(())
    }

    /// Start a subdevice: prepares the hardware, installs the endpoint in
    /// the engine, and starts the loop if this is the first started
    /// subdevice.
    pub fn start_subdev(&self, subdev: SubdevId) -> Result<()> {
        let mut state = self.state.lock();
        let slot = slot_mut(&mut state, subdev)?;
        let chanlist = slot
            .chanlist
            .clone()
            .ok_or_else(|| DaqError::Config("chanlist not set".into()))?;
        let command = slot
            .command
            .clone()
            .ok_or_else(|| DaqError::Config("sync command not set".into()))?;
        let mut engine = self.engine.lock();
        // the loop runs at one frequency; every started subdevice must agree
        match engine.state() {
            LoopState::Running | LoopState::Stopping => {
                if (engine.frequency() - command.frequency).abs() > f64::EPSILON {
                    return Err(DaqError::InvalidRate {
                        requested: command.frequency,
                        achievable: engine.frequency(),
                    });
                }
            }
            LoopState::Unconfigured => {
                let current = engine.config();
                engine.configure(LoopConfig {
                    frequency: command.frequency,
                    ..current
                })?;
            }
            _ => {
                if (engine.frequency() - command.frequency).abs() > f64::EPSILON {
                    let current = engine.config();
                    engine.configure(LoopConfig {
                        frequency: command.frequency,
                        ..current
                    })?;
                }
            }
        }
        let handle = slot.handle.clone();
        match &handle {
            DeviceHandle::AnalogInput(dev) => {
                dev.lock().prepare_read(&command, &chanlist)?;
                let endpoint =
                    AiEndpoint::new(Arc::clone(dev), chanlist, command, slot.fifo.clone());
                engine.set_ai(endpoint);
                if engine.state() == LoopState::Running {
                    engine.start_ai()?;
                }
            }
            DeviceHandle::AnalogOutput(dev) => {
                dev.lock().prepare_write(&command, &chanlist)?;
                let channels = chanlist.len();
                let endpoint = AoEndpoint::new(
                    Arc::clone(dev),
                    chanlist,
                    command,
                    slot.fifo.clone(),
                    IdlePolicy::uniform(channels, Default::default()),
                );
                let idx = match slot.ao_slot {
                    Some(idx) => {
                        engine.aos_mut()[idx] = endpoint;
                        idx
                    }
                    None => engine.add_ao(endpoint),
                };
                slot.ao_slot = Some(idx);
                engine.aos_mut()[idx].arm();
                if engine.state() == LoopState::Running {
                    dev.lock().start_write()?;
                }
            }
            _ => {
                return Err(DaqError::Config(format!(
                    "cannot start {} subdevice through a sync command",
                    handle.kind()
                )));
            }
        }
        slot.started = true;
        if engine.state() != LoopState::Running {
            engine.start()?;
        }
        info!(id = subdev.0, "subdevice started");
        Ok(())
    }

    /// Stop a subdevice and drop its undelivered frames.
    pub fn stop_subdev(&self, subdev: SubdevId) -> Result<()> {
        let mut state = self.state.lock();
        let slot = slot_mut(&mut state, subdev)?;
        let mut engine = self.engine.lock();
        match slot.kind {
            SubdeviceKind::AnalogInput => {
                if let Some(ai) = engine.take_ai() {
                    ai.device.lock().stop_read()?;
                }
            }
            SubdeviceKind::AnalogOutput => {
                if let Some(idx) = slot.ao_slot {
                    let ao = &mut engine.aos_mut()[idx];
                    ao.disarm();
                    ao.device.lock().stop_write()?;
                }
            }
            _ => {}
        }
        slot.fifo.clear();
        slot.fifo.notify();
        slot.started = false;
        Ok(())
    }

    pub fn check_running(&self, subdev: SubdevId) -> Result<bool> {
        let state = self.state.lock();
        let slot = slot_ref(&state, subdev)?;
        Ok(slot.started)
    }

    /// Close a slot; the subdevice must be stopped first.
    pub fn request_close(&self, subdev: SubdevId) -> Result<()> {
        let mut state = self.state.lock();
        let slot = slot_mut(&mut state, subdev)?;
        if slot.started {
            return Err(DaqError::Busy {
                device: format!("subdevice {}", subdev.0),
            });
        }
        state.slots[subdev.0] = None;
        Ok(())
    }

    /// Execute a DIO operation on a DIO slot.
    pub fn dio_cmd(&self, subdev: SubdevId, op: DioOp) -> Result<ControlReply> {
        let state = self.state.lock();
        let slot = slot_ref(&state, subdev)?;
        let dio_slot = slot.dio_slot.ok_or_else(|| {
            DaqError::Config(format!("subdevice {} is not digital i/o", subdev.0))
        })?;
        let handle = slot
            .handle
            .as_digital_io()
            .cloned()
            .ok_or_else(|| DaqError::Config("not a digital i/o handle".into()))?;
        drop(state);
        let mut engine = self.engine.lock();
        let dio = &mut engine.dios_mut()[dio_slot];
        match op {
            DioOp::Configure {
                line_mask,
                direction_mask,
            } => {
                handle.lock().configure(line_mask, direction_mask)?;
                Ok(ControlReply::Done)
            }
            DioOp::Read { mask } => {
                let bits = handle.lock().read_lines(mask)?;
                Ok(ControlReply::Bits(bits))
            }
            DioOp::Write { mask, bits } => {
                handle.lock().write_lines(mask, bits)?;
                Ok(ControlReply::Done)
            }
            DioOp::AddTtlPulse { line, high, low } => {
                dio.ttl.add(TtlPulse { line, high, low })?;
                Ok(ControlReply::Done)
            }
            DioOp::ClearTtlPulse { line, high } => {
                dio.ttl.clear(line, high);
                Ok(ControlReply::Done)
            }
            DioOp::SetSyncPulse(pulse) => {
                dio.sync_pulse = Some(pulse);
                Ok(ControlReply::Done)
            }
            DioOp::ClearSyncPulse => {
                dio.sync_pulse = None;
                Ok(ControlReply::Done)
            }
        }
    }

    /// Route an AI threshold crossing to the AO start.
    pub fn set_trigger(&self, channel: u32, level: f64) -> Result<()> {
        let mut engine = self.engine.lock();
        let pos = engine
            .ai()
            .and_then(|ai| ai.chanlist.position(channel))
            .ok_or_else(|| DaqError::InvalidChannel {
                device: "analog input".into(),
                channel,
                reason: "channel not in the active chanlist".into(),
            })?;
        engine.set_trigger(Some(TriggerArm::new(pos, level)));
        Ok(())
    }
}

impl Default for RtModule {
    fn default() -> Self {
        Self::new()
    }
}

fn slot_ref<'a>(state: &'a ControlState, subdev: SubdevId) -> Result<&'a SubdevSlot> {
    state
        .slots
        .get(subdev.0)
        .and_then(Option::as_ref)
        .ok_or_else(|| DaqError::InvalidDevice {
            index: subdev.0,
            reason: "subdevice slot not open".into(),
        })
}

fn slot_mut<'a>(state: &'a mut ControlState, subdev: SubdevId) -> Result<&'a mut SubdevSlot> {
    state
        .slots
        .get_mut(subdev.0)
        .and_then(Option::as_mut)
        .ok_or_else(|| DaqError::InvalidDevice {
            index: subdev.0,
            reason: "subdevice slot not open".into(),
        })
}
