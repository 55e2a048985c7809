//! The command planner.
//!
//! Takes a prepared `OutList` plus the current acquisition and compiles it
//! into the per-subdevice command sequence of the real-time module:
//! chanlist → sync-command → start, followed by the AO FIFO fill. The
//! planner resolves trace bindings, sorts and partitions signals, validates
//! them against the bound hardware, computes the continuity relationship to
//! the running acquisition, resolves the start source from registered
//! take-relations, and runs the attenuator pass. Any failure aborts the
//! whole submission: no subdevice is started and the signals keep their
//! error flags.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use relacs_core::error::ErrorFlags;
use relacs_core::sample::ChannelSetup;
use relacs_core::trace::{TraceKind, TraceRegistry, TraceSpec};
use relacs_core::{
    DaqError, InData, InList, OutData, OutDataInfo, OutList, OutputLevel, Result, StartSource,
    TraceBinding,
};
use relacs_dynclamp::control::{RtModule, SubdevId};
use relacs_dynclamp::fifo::{Frame, FrameFifo};
use relacs_hardware::command::{Chanlist, ChanlistEntry, SyncCommand};
use relacs_hardware::device::{DeviceHandle, SubdeviceKind};
use relacs_hardware::registry::DeviceRegistry;
use relacs_hardware::subsystem::AttStatus;

/// Default FIFO depth in frames for both directions.
pub const DEFAULT_FIFO_FRAMES: usize = 65_536;

/// Two rates are "the same" for take-relations within this fraction.
const TAKE_RATE_TOLERANCE: f64 = 1e-9;

/// One recorded channel of an acquisition plan.
#[derive(Debug, Clone)]
pub struct InTraceConfig {
    pub ident: String,
    pub unit: String,
    /// Registry index of the analog input subdevice.
    pub device: usize,
    pub channel: u32,
    pub gain_index: i32,
    pub setup: ChannelSetup,
}

/// A complete continuous-acquisition plan.
#[derive(Debug, Clone)]
pub struct AcquisitionPlan {
    pub rate: f64,
    /// Seconds of history each trace retains.
    pub history_secs: f64,
    pub traces: Vec<InTraceConfig>,
}

/// A registered cross-device start relation.
#[derive(Debug, Clone, Copy)]
pub struct TakeRelation {
    pub ai_device: usize,
    pub ao_device: usize,
    pub ai_rate: f64,
    pub ao_rate: f64,
    /// PFI line used when the rates differ.
    pub pfi_line: u32,
}

/// Result of a successful submission.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    /// Frames queued into AO FIFOs, summed over subdevices.
    pub frames_queued: u64,
    /// Whether the analog input was stopped and re-armed.
    pub restarted: bool,
    /// Log records of the submitted signals.
    pub infos: Vec<OutDataInfo>,
}

/// Attenuator line bound to an output channel.
#[derive(Debug, Clone, Copy)]
struct AttBinding {
    device: usize,
    line: u32,
}

/// The running analog-input side of the planner.
struct AiPlan {
    slot: SubdevId,
    device: usize,
    chanlist: Chanlist,
    rate: f64,
    in_list: InList,
    fifo: FrameFifo,
    running: bool,
}

/// Command planner and acquisition state.
pub struct Planner {
    registry: DeviceRegistry,
    module: Arc<RtModule>,
    traces: TraceRegistry,
    out_setups: HashMap<(usize, u32), ChannelSetup>,
    att_bindings: HashMap<(usize, u32), AttBinding>,
    takes: Vec<TakeRelation>,
    ai: Option<AiPlan>,
    ao_slots: HashMap<usize, SubdevId>,
    fifo_frames: usize,
    signal_log: Vec<OutDataInfo>,
}

impl Planner {
    pub fn new(registry: DeviceRegistry, module: Arc<RtModule>) -> Self {
        Self {
            registry,
            module,
            traces: TraceRegistry::new(),
            out_setups: HashMap::new(),
            att_bindings: HashMap::new(),
            takes: Vec::new(),
            ai: None,
            ao_slots: HashMap::new(),
            fifo_frames: DEFAULT_FIFO_FRAMES,
            signal_log: Vec::new(),
        }
    }

    /// Override the FIFO depth used for newly opened subdevices.
    pub fn set_fifo_frames(&mut self, frames: usize) {
        self.fifo_frames = frames.max(1);
    }

    pub fn module(&self) -> &Arc<RtModule> {
        &self.module
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn traces(&self) -> &TraceRegistry {
        &self.traces
    }

    /// The recorded traces of the running acquisition.
    pub fn in_list(&self) -> Option<&InList> {
        self.ai.as_ref().map(|ai| &ai.in_list)
    }

    /// The AI FIFO of the running acquisition (drain side).
    pub fn ai_fifo(&self) -> Option<FrameFifo> {
        self.ai.as_ref().map(|ai| ai.fifo.clone())
    }

    pub fn ai_chanlist(&self) -> Option<&Chanlist> {
        self.ai.as_ref().map(|ai| &ai.chanlist)
    }

    /// Log of every signal submitted so far.
    pub fn signal_log(&self) -> &[OutDataInfo] {
        &self.signal_log
    }

    /// Register an output trace: symbolic name, target device/channel, and
    /// the volts→counts setup of the channel.
    pub fn register_out_trace(
        &mut self,
        name: impl Into<String>,
        unit: impl Into<String>,
        device: usize,
        channel: u32,
        setup: ChannelSetup,
    ) -> usize {
        let mut spec = TraceSpec::new(TraceKind::TraceOut, name, unit);
        spec.device = Some(device);
        spec.channel = Some(channel);
        self.out_setups.insert((device, channel), setup);
        self.traces.add(spec)
    }

    /// Bind an attenuator line to an output channel.
    pub fn bind_attenuator(
        &mut self,
        device: usize,
        channel: u32,
        att_device: usize,
        line: u32,
    ) -> Result<()> {
        self.registry
            .handle_of_kind(att_device, SubdeviceKind::Attenuator)?;
        self.att_bindings.insert(
            (device, channel),
            AttBinding {
                device: att_device,
                line,
            },
        );
        Ok(())
    }

    /// Declare that AO on `ao_device` shall start together with AI on
    /// `ai_device`; with differing rates the start is routed over a PFI
    /// line instead.
    pub fn take(&mut self, relation: TakeRelation) {
        self.takes.retain(|t| {
            t.ai_device != relation.ai_device || t.ao_device != relation.ao_device
        });
        self.takes.push(relation);
    }

    /// Prepare and start a continuous acquisition: build the `InData`
    /// registry, program the AI subdevice, and start the loop.
    pub fn prepare_acquisition(&mut self, plan: &AcquisitionPlan) -> Result<InList> {
        if plan.traces.is_empty() {
            return Err(DaqError::NoData("acquisition plan has no traces".into()));
        }
        let device = plan.traces[0].device;
        if plan.traces.iter().any(|t| t.device != device) {
            return Err(DaqError::Config(
                "all recorded traces must live on one analog input subdevice".into(),
            ));
        }
        let handle = self
            .registry
            .handle_of_kind(device, SubdeviceKind::AnalogInput)?
            .clone();

        let mut chanlist = Chanlist::new();
        let mut in_list = InList::new();
        for trace in &plan.traces {
            let mut entry = ChanlistEntry::new(trace.setup);
            entry.gain_index = trace.gain_index;
            chanlist.push(entry)?;
            let data = InData::new(
                trace.ident.clone(),
                trace.unit.clone(),
                trace.device,
                trace.channel,
                plan.rate,
                plan.history_secs,
                trace.setup,
            )
            .with_gain_index(trace.gain_index);
            in_list.push(data);
            let mut spec =
                TraceSpec::new(TraceKind::TraceIn, trace.ident.clone(), trace.unit.clone());
            spec.device = Some(trace.device);
            spec.channel = Some(trace.channel);
            self.traces.add(spec);
        }

        // stop a previous acquisition before re-programming
        if let Some(old) = self.ai.take() {
            if old.running {
                self.module.stop_subdev(old.slot)?;
            }
            self.module.request_close(old.slot)?;
        }

        let slot = self.module.open_subdev(handle, self.fifo_frames)?;
        self.module.set_chanlist(slot, chanlist.clone())?;
        self.module.set_sync_command(
            slot,
            SyncCommand {
                frequency: plan.rate,
                delay: 0.0,
                duration: 0.0,
                start_source: StartSource::Internal,
                continuous: true,
                buffer_frames: self.fifo_frames,
            },
        )?;
        self.module.start_subdev(slot)?;
        let fifo = self.module.fifo(slot)?;

        info!(rate = plan.rate, traces = in_list.len(), "acquisition started");
        self.ai = Some(AiPlan {
            slot,
            device,
            chanlist,
            rate: plan.rate,
            in_list: in_list.clone(),
            fifo,
            running: true,
        });
        Ok(in_list)
    }

    /// Submit a list of output signals.
    ///
    /// On success the signals are queued and armed; on failure nothing was
    /// started, the per-signal error flags are set, and `list.failed()` is
    /// true.
    pub fn write(&mut self, list: &mut OutList) -> Result<WriteOutcome> {
        if list.is_empty() {
            return Err(DaqError::NoData("empty signal list".into()));
        }
        list.clear_errors();

        // 1./2. resolve bindings, sort, partition by subdevice
        self.resolve_bindings(list);
        list.sort_by_device_channel();

        // 3. validation (every subdevice is still checked on failure)
        self.validate(list);
        if list.failed() {
            return Err(DaqError::Aborted(format!(
                "submission rejected: {:?}",
                list.errors().names()
            )));
        }

        // 4. continuity
        let restart = list.any_restart();
        let ai_running = self.ai.as_ref().map(|ai| ai.running).unwrap_or(false);

        // 6. attenuator pass (non-fatal clipping, fatal wire errors)
        self.attenuator_pass(list)?;
        if list.failed() {
            return Err(DaqError::Aborted("attenuator pass failed".into()));
        }

        // stop/reset AI first if this submission restarts the acquisition
        let restarting = restart && ai_running;
        if restarting {
            if let Some(ai) = &mut self.ai {
                self.module.stop_subdev(ai.slot)?;
                ai.running = false;
                for trace in ai.in_list.iter() {
                    trace.mark_restart();
                }
            }
        }

        // 5./7. per-subdevice start source and commit
        let outcome = match self.commit(list, restarting) {
            Ok(frames_queued) => {
                let infos: Vec<OutDataInfo> = list.iter().map(OutData::info).collect();
                self.signal_log.extend(infos.iter().cloned());
                WriteOutcome {
                    frames_queued,
                    restarted: restarting,
                    infos,
                }
            }
            Err(e) => {
                // partial submission is not allowed
                self.rollback();
                for signal in list.iter_mut() {
                    signal.add_error(e.flags());
                }
                return Err(e);
            }
        };

        // re-arm AI as part of the same submission
        if restarting {
            if let Some(ai) = &mut self.ai {
                self.module.start_subdev(ai.slot)?;
                ai.running = true;
            }
        }
        Ok(outcome)
    }

    /// Immediate, non-queued update of single output levels.
    pub fn direct_write(&mut self, list: &mut OutList) -> Result<()> {
        self.resolve_bindings(list);
        if list.failed() {
            return Err(DaqError::Aborted("unresolved trace bindings".into()));
        }
        let mut devices: Vec<usize> = list.iter().filter_map(|s| s.device).collect();
        devices.sort_unstable();
        devices.dedup();
        for device in devices {
            let handle = self
                .registry
                .handle_of_kind(device, SubdeviceKind::AnalogOutput)?;
            let sublist: OutList = list
                .iter()
                .filter(|s| s.device == Some(device))
                .cloned()
                .collect();
            if let DeviceHandle::AnalogOutput(dev) = handle {
                dev.lock().direct_write(&sublist)?;
            }
        }
        Ok(())
    }

    /// Stop every output, the acquisition, and the loop. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        for (_, slot) in self.ao_slots.iter() {
            // a stopped slot stays stopped
            let _ = self.module.stop_subdev(*slot);
        }
        if let Some(ai) = &mut self.ai {
            if ai.running {
                self.module.stop_subdev(ai.slot)?;
                ai.running = false;
            }
        }
        self.module.engine().lock().request_stop();
        Ok(())
    }

    fn resolve_bindings(&self, list: &mut OutList) {
        for signal in list.iter_mut() {
            if signal.device.is_some() && signal.channel.is_some() {
                continue;
            }
            let resolved = match &signal.trace {
                TraceBinding::Name(name) => self
                    .traces
                    .find(name)
                    .and_then(|i| self.traces.get(i))
                    .filter(|spec| spec.kind == TraceKind::TraceOut)
                    .and_then(|spec| Some((spec.device?, spec.channel?))),
                TraceBinding::Index(index) => self
                    .traces
                    .find_kind(TraceKind::TraceOut, *index)
                    .and_then(|i| self.traces.get(i))
                    .and_then(|spec| Some((spec.device?, spec.channel?))),
            };
            match resolved {
                Some((device, channel)) => {
                    signal.device = Some(device);
                    signal.channel = Some(channel);
                }
                None => {
                    warn!(ident = %signal.ident, "output trace binding did not resolve");
                    signal.add_error(ErrorFlags::CONFIG_ERROR);
                }
            }
        }
    }

    fn validate(&self, list: &mut OutList) {
        // group indices by resolved device
        let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
        for (i, signal) in list.iter().enumerate() {
            if let Some(device) = signal.device {
                groups.entry(device).or_default().push(i);
            }
        }
        for (device, indices) in groups {
            let handle = match self
                .registry
                .handle_of_kind(device, SubdeviceKind::AnalogOutput)
            {
                Ok(h) => h.clone(),
                Err(e) => {
                    for &i in &indices {
                        list[i].add_error(e.flags());
                    }
                    continue;
                }
            };
            let (max_rate, channels) = match &handle {
                DeviceHandle::AnalogOutput(dev) => {
                    let dev = dev.lock();
                    (dev.max_rate(), dev.channels())
                }
                _ => continue,
            };
            let rate0 = list[indices[0]].sample_rate();
            let delay0 = list[indices[0]].delay;
            for &i in &indices {
                let signal = &mut list[i];
                let rate = signal.sample_rate();
                if rate <= 0.0 || rate > max_rate {
                    signal.add_error(ErrorFlags::INVALID_RATE);
                }
                if (rate - rate0).abs() > f64::EPSILON {
                    // one sync command per subdevice: rates must agree
                    signal.add_error(ErrorFlags::CONFIG_ERROR);
                }
                if (signal.delay - delay0).abs() > f64::EPSILON {
                    signal.add_error(ErrorFlags::CONFIG_ERROR);
                }
                if signal.is_empty() && !signal.continuous {
                    signal.add_error(ErrorFlags::NO_DATA);
                }
                match signal.channel {
                    Some(channel) if channel < channels => {}
                    _ => {
                        signal.add_error(ErrorFlags::INVALID_CHANNEL);
                    }
                }
                if signal.level.needs_attenuator() {
                    let channel = signal.channel.unwrap_or(u32::MAX);
                    match self.att_bindings.get(&(device, channel)) {
                        None => {
                            signal.add_error(ErrorFlags::CONFIG_ERROR);
                        }
                        Some(binding) => {
                            // pre-flight the level without touching hardware
                            if let OutputLevel::Intensity(level) | OutputLevel::Attenuation(level) =
                                signal.level
                            {
                                let mut db = level;
                                let status = self.test_level(*binding, &mut db);
                                record_att_status(signal, status);
                            }
                        }
                    }
                }
            }
        }
    }

    fn test_level(&self, binding: AttBinding, db: &mut f64) -> AttStatus {
        match self
            .registry
            .handle_of_kind(binding.device, SubdeviceKind::Attenuator)
        {
            Ok(DeviceHandle::Attenuator(att)) => att.lock().test_attenuate(binding.line, db),
            _ => AttStatus::InvalidDevice,
        }
    }

    /// The attenuator pass: set every requested level, writing the actual
    /// value back into the signal description.
    fn attenuator_pass(&mut self, list: &mut OutList) -> Result<()> {
        for signal in list.iter_mut() {
            if !signal.level.needs_attenuator() {
                continue;
            }
            let device = signal.device.unwrap_or(usize::MAX);
            let channel = signal.channel.unwrap_or(u32::MAX);
            let binding = match self.att_bindings.get(&(device, channel)) {
                Some(b) => *b,
                None => {
                    signal.add_error(ErrorFlags::CONFIG_ERROR);
                    continue;
                }
            };
            let att = match self
                .registry
                .handle_of_kind(binding.device, SubdeviceKind::Attenuator)
            {
                Ok(DeviceHandle::Attenuator(att)) => Arc::clone(att),
                _ => {
                    signal.add_error(ErrorFlags::INVALID_DEVICE);
                    continue;
                }
            };
            match signal.level {
                OutputLevel::Muted => {
                    let status = att.lock().mute(binding.line);
                    if !status.is_ok() {
                        record_att_status(signal, status);
                    }
                    signal.describe("muted", json!(true));
                }
                OutputLevel::Intensity(level) | OutputLevel::Attenuation(level) => {
                    let mut db = level;
                    let status = att.lock().attenuate(binding.line, &mut db);
                    record_att_status(signal, status);
                    if status.level_was_set() {
                        signal.describe("requested_level", json!(level));
                        signal.describe("attenuation_db", json!(db));
                        signal.describe("muted", json!(false));
                    }
                }
                OutputLevel::NoLevel => {}
            }
        }
        Ok(())
    }

    /// Resolve the start source of an AO subdevice from the registered
    /// take-relations.
    fn start_source_for(&self, ao_device: usize) -> StartSource {
        let ai_device = match &self.ai {
            Some(ai) => ai.device,
            None => return StartSource::Internal,
        };
        for take in &self.takes {
            if take.ai_device == ai_device && take.ao_device == ao_device {
                let same_rate = (take.ai_rate - take.ao_rate).abs()
                    <= TAKE_RATE_TOLERANCE * take.ai_rate.max(1.0);
                return if same_rate {
                    StartSource::AiStart { device: ai_device }
                } else {
                    StartSource::ExternalPfi {
                        line: take.pfi_line,
                    }
                };
            }
        }
        StartSource::Internal
    }

    /// Per-subdevice command emission and FIFO fill.
    fn commit(&mut self, list: &OutList, _restarting: bool) -> Result<u64> {
        let mut devices: Vec<usize> = list.iter().filter_map(|s| s.device).collect();
        devices.sort_unstable();
        devices.dedup();

        let mut frames_queued = 0u64;
        for device in devices {
            let handle = self
                .registry
                .handle_of_kind(device, SubdeviceKind::AnalogOutput)?
                .clone();
            let signals: Vec<&OutData> = list
                .iter()
                .filter(|s| s.device == Some(device))
                .collect();
            let rate = signals[0].sample_rate();
            let delay = signals[0].delay;
            let continuous = signals.iter().any(|s| s.continuous);

            // chanlist: unique channels in sorted order
            let mut channels: Vec<u32> = signals.iter().filter_map(|s| s.channel).collect();
            channels.sort_unstable();
            channels.dedup();
            let mut chanlist = Chanlist::new();
            for &channel in &channels {
                let setup = self
                    .out_setups
                    .get(&(device, channel))
                    .copied()
                    .ok_or_else(|| {
                        DaqError::Config(format!(
                            "no output setup registered for device {device} channel {channel}"
                        ))
                    })?;
                chanlist.push(ChanlistEntry::new(setup))?;
            }

            // per-channel sample streams; same-channel signals concatenate,
            // muted signals reserve their span with silence
            let mut streams: Vec<Vec<f64>> = vec![Vec::new(); channels.len()];
            for signal in &signals {
                let pos = channels
                    .iter()
                    .position(|&c| Some(c) == signal.channel)
                    .unwrap_or(0);
                if signal.level.is_muted() {
                    streams[pos].extend(std::iter::repeat(0.0).take(signal.len()));
                } else {
                    streams[pos].extend_from_slice(signal.samples());
                }
            }
            let n_frames = streams.iter().map(Vec::len).max().unwrap_or(0);
            let duration = n_frames as f64 / rate;

            let slot = match self.ao_slots.get(&device) {
                Some(slot) => *slot,
                None => {
                    let slot = self.module.open_subdev(handle.clone(), self.fifo_frames)?;
                    self.ao_slots.insert(device, slot);
                    slot
                }
            };
            let command = SyncCommand {
                frequency: rate,
                delay,
                duration,
                start_source: self.start_source_for(device),
                continuous,
                buffer_frames: self.fifo_frames,
            };
            debug!(
                device,
                rate,
                frames = n_frames,
                start_source = ?command.start_source,
                "committing output subdevice"
            );
            self.module.set_chanlist(slot, chanlist.clone())?;
            self.module.set_sync_command(slot, command)?;
            self.module.start_subdev(slot)?;

            // FIFO fill strictly after the control sequence
            let fifo = self.module.fifo(slot)?;
            fifo.clear();
            let maxdata = match &handle {
                DeviceHandle::AnalogOutput(dev) => dev.lock().maxdata(),
                _ => u32::MAX,
            };
            for frame_idx in 0..n_frames {
                let counts: Vec<u32> = chanlist
                    .entries()
                    .iter()
                    .enumerate()
                    .map(|(pos, entry)| {
                        let value = streams[pos].get(frame_idx).copied().unwrap_or(0.0);
                        entry.setup.to_count(value, maxdata)
                    })
                    .collect();
                fifo.push(Frame::new(counts));
            }
            frames_queued += n_frames as u64;
        }
        Ok(frames_queued)
    }

    /// Undo a half-committed submission: disarm every output subdevice.
    fn rollback(&mut self) {
        for slot in self.ao_slots.values() {
            if let Err(e) = self.module.stop_subdev(*slot) {
                warn!(error = %e, "rollback stop failed");
            }
        }
    }
}

fn record_att_status(signal: &mut OutData, status: AttStatus) {
    match status {
        AttStatus::Ok => {}
        AttStatus::Underflow => signal.add_error(ErrorFlags::UNDERFLOW),
        AttStatus::Overflow => signal.add_error(ErrorFlags::OVERFLOW),
        AttStatus::NotOpen => signal.add_error(ErrorFlags::NOT_OPEN),
        AttStatus::InvalidDevice => signal.add_error(ErrorFlags::INVALID_DEVICE),
        AttStatus::WriteError => signal.add_error(ErrorFlags::WRITE_ERROR),
    }
}
