//! The periodic real-time loop.
//!
//! One task runs the whole circuit at a fixed frequency. Each cycle:
//! AI convert → optional model computation → AO emit → sync pulse →
//! FIFO push → accounting → sleep. [`RtLoop`] is the cycle engine and can
//! be stepped deterministically; [`RtTask`] drives it from a dedicated
//! thread with a periodic or re-armed one-shot timer.
//!
//! Control requests never interleave with a cycle: the engine sits behind
//! a mutex that the task holds for exactly one cycle at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use relacs_core::{DaqError, Result, StartSource};
use relacs_hardware::command::{Chanlist, SyncCommand};
use relacs_hardware::subsystem::{AnalogInput, AnalogOutput, DigitalIo};

use crate::fifo::{Frame, FrameFifo, IdlePolicy};
use crate::model::ClampModel;
use crate::status::{LoopState, LoopStats, LoopTiming, PhaseTimes, StatusSlot};
use crate::ttl::{AmplifierMode, LoopEvent, SyncPulse, TtlScheduler};

/// Hard cap on the loop frequency, Hz.
pub const MAX_LOOP_FREQUENCY: f64 = 90_000.0;

/// Consecutive timing overruns tolerated before the loop aborts.
pub const DEFAULT_OVERRUN_WINDOW: u64 = 1000;

/// Timer behavior of the loop task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerMode {
    /// Absolute schedule: each deadline is the previous one plus the period.
    #[default]
    Periodic,
    /// The timer is re-armed from "now" after every cycle.
    OneShot,
}

/// Loop-level configuration.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Cycle frequency in Hz, capped at [`MAX_LOOP_FREQUENCY`].
    pub frequency: f64,
    /// Record per-phase durations into the status traces.
    pub timing_counters: bool,
    /// Consecutive timing overruns before the loop goes fatal.
    pub overrun_window: u64,
    pub timer_mode: TimerMode,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            frequency: 20_000.0,
            timing_counters: false,
            overrun_window: DEFAULT_OVERRUN_WINDOW,
            timer_mode: TimerMode::Periodic,
        }
    }
}

/// The analog input side of the loop.
pub struct AiEndpoint {
    pub device: Arc<Mutex<dyn AnalogInput>>,
    pub chanlist: Chanlist,
    pub command: SyncCommand,
    /// Loop → user frames.
    pub fifo: FrameFifo,
    active: bool,
}

impl AiEndpoint {
    pub fn new(
        device: Arc<Mutex<dyn AnalogInput>>,
        chanlist: Chanlist,
        command: SyncCommand,
        fifo: FrameFifo,
    ) -> Self {
        Self {
            device,
            chanlist,
            command,
            fifo,
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

/// One analog output subdevice driven by the loop.
pub struct AoEndpoint {
    pub device: Arc<Mutex<dyn AnalogOutput>>,
    pub chanlist: Chanlist,
    pub command: SyncCommand,
    /// User → loop frames.
    pub fifo: FrameFifo,
    pub idle: IdlePolicy,
    maxdata: u32,
    armed: bool,
    emitting: bool,
    delay_left: u64,
    emitted: u64,
    /// First frame of the armed signal not yet emitted.
    signal_pending: bool,
    last_frame: Vec<u32>,
    zero_frame: Vec<u32>,
}

impl AoEndpoint {
    pub fn new(
        device: Arc<Mutex<dyn AnalogOutput>>,
        chanlist: Chanlist,
        command: SyncCommand,
        fifo: FrameFifo,
        idle: IdlePolicy,
    ) -> Self {
        let maxdata = device.lock().maxdata();
        // the idle "zero" of each channel is the count of physical zero;
        // before the first output, hold-last holds that same value
        let zero_frame: Vec<u32> = chanlist
            .entries()
            .iter()
            .map(|e| e.setup.to_count(0.0, maxdata))
            .collect();
        Self {
            device,
            chanlist,
            command,
            fifo,
            idle,
            maxdata,
            armed: false,
            emitting: false,
            delay_left: 0,
            emitted: 0,
            signal_pending: false,
            last_frame: zero_frame.clone(),
            zero_frame,
        }
    }

    /// Arm a freshly submitted signal: the delay restarts and the next
    /// emitted frame marks the signal boundary.
    pub fn arm(&mut self) {
        self.armed = true;
        self.emitting = false;
        self.delay_left = self.command.delay_cycles();
        self.emitted = 0;
        self.signal_pending = true;
    }

    pub fn disarm(&mut self) {
        self.armed = false;
        self.emitting = false;
        self.signal_pending = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn is_emitting(&self) -> bool {
        self.emitting
    }

    pub fn emitted_frames(&self) -> u64 {
        self.emitted
    }

    fn start_gate_open(&self, ai_active: bool, trigger_fired: bool) -> bool {
        match self.command.start_source {
            StartSource::Internal => true,
            StartSource::AiStart { .. } => ai_active,
            StartSource::ExternalPfi { .. } => trigger_fired,
            StartSource::DeviceSpecific(_) => true,
        }
    }

    fn idle_frame(&self) -> Vec<u32> {
        let mut counts = vec![0u32; self.chanlist.len()];
        self.idle
            .fill_idle(&self.last_frame, &self.zero_frame, &mut counts);
        counts
    }
}

/// One DIO subdevice with its pulse tables.
pub struct DioEndpoint {
    pub device: Arc<Mutex<dyn DigitalIo>>,
    pub ttl: TtlScheduler,
    pub sync_pulse: Option<SyncPulse>,
}

impl DioEndpoint {
    pub fn new(device: Arc<Mutex<dyn DigitalIo>>) -> Self {
        Self {
            device,
            ttl: TtlScheduler::new(),
            sync_pulse: None,
        }
    }
}

/// Armed analog-threshold trigger routed to the AO start.
#[derive(Debug, Clone)]
pub struct TriggerArm {
    /// Position of the watched channel in the AI chanlist.
    pub channel_pos: usize,
    /// Threshold in the channel's physical unit.
    pub level: f64,
    last: f64,
    fired: bool,
}

impl TriggerArm {
    pub fn new(channel_pos: usize, level: f64) -> Self {
        Self {
            channel_pos,
            level,
            last: f64::NEG_INFINITY,
            fired: false,
        }
    }

    pub fn fired(&self) -> bool {
        self.fired
    }

    fn evaluate(&mut self, value: f64) {
        if !self.fired && self.last < self.level && value >= self.level {
            self.fired = true;
        }
        self.last = value;
    }
}

/// The cycle engine.
pub struct RtLoop {
    config: LoopConfig,
    period: Duration,
    state: LoopState,
    ai: Option<AiEndpoint>,
    aos: Vec<AoEndpoint>,
    dios: Vec<DioEndpoint>,
    model: Option<Box<dyn ClampModel>>,
    amplifier_mode: AmplifierMode,
    trigger: Option<TriggerArm>,
    status: Arc<StatusSlot>,
    stats: LoopStats,
    phase_times: PhaseTimes,
    loop_count: u64,
    ao_index: u64,
    underruns: u64,
    timing_overruns: u64,
    ai_counts: Vec<u32>,
    ai_phys: Vec<f64>,
    ao_phys: Vec<f64>,
    prev_ao_phys: Vec<f64>,
}

impl RtLoop {
    pub fn new(status: Arc<StatusSlot>) -> Self {
        Self {
            config: LoopConfig::default(),
            period: Duration::from_micros(50),
            state: LoopState::Unconfigured,
            ai: None,
            aos: Vec::new(),
            dios: Vec::new(),
            model: None,
            amplifier_mode: AmplifierMode::empty(),
            trigger: None,
            status,
            stats: LoopStats::new(),
            phase_times: PhaseTimes::default(),
            loop_count: 0,
            ao_index: 0,
            underruns: 0,
            timing_overruns: 0,
            ai_counts: Vec::new(),
            ai_phys: Vec::new(),
            ao_phys: Vec::new(),
            prev_ao_phys: Vec::new(),
        }
    }

    /// Configure the loop. Legal while not running.
    pub fn configure(&mut self, config: LoopConfig) -> Result<()> {
        if self.state == LoopState::Running || self.state == LoopState::Stopping {
            return Err(DaqError::Busy {
                device: "loop".into(),
            });
        }
        if config.frequency <= 0.0 {
            return Err(DaqError::InvalidRate {
                requested: config.frequency,
                achievable: MAX_LOOP_FREQUENCY,
            });
        }
        let frequency = config.frequency.min(MAX_LOOP_FREQUENCY);
        if frequency < config.frequency {
            warn!(
                requested = config.frequency,
                capped = frequency,
                "loop frequency capped"
            );
        }
        self.period = Duration::from_secs_f64(1.0 / frequency);
        self.config = LoopConfig {
            frequency,
            ..config
        };
        self.status.set_rate(frequency);
        self.set_state(LoopState::Configured);
        info!(frequency, "loop configured");
        Ok(())
    }

    fn set_state(&mut self, state: LoopState) {
        self.state = state;
        self.status.set_state(state);
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn config(&self) -> LoopConfig {
        self.config.clone()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn frequency(&self) -> f64 {
        self.config.frequency
    }

    pub fn timer_mode(&self) -> TimerMode {
        self.config.timer_mode
    }

    pub fn loop_count(&self) -> u64 {
        self.loop_count
    }

    pub fn ao_index(&self) -> u64 {
        self.ao_index
    }

    pub fn timing(&self) -> LoopTiming {
        self.stats.timing()
    }

    pub fn phase_times(&self) -> PhaseTimes {
        self.phase_times
    }

    pub fn set_amplifier_mode(&mut self, mode: AmplifierMode) {
        self.amplifier_mode = mode;
    }

    pub fn amplifier_mode(&self) -> AmplifierMode {
        self.amplifier_mode
    }

    /// Install the AI endpoint (replaces any previous one).
    pub fn set_ai(&mut self, endpoint: AiEndpoint) {
        let n = endpoint.chanlist.len();
        self.ai_counts = vec![0; n];
        self.ai_phys = vec![0.0; n];
        self.ai = Some(endpoint);
    }

    pub fn ai(&self) -> Option<&AiEndpoint> {
        self.ai.as_ref()
    }

    pub fn ai_mut(&mut self) -> Option<&mut AiEndpoint> {
        self.ai.as_mut()
    }

    pub fn take_ai(&mut self) -> Option<AiEndpoint> {
        self.ai.take()
    }

    /// Add an AO endpoint; returns its slot index.
    pub fn add_ao(&mut self, endpoint: AoEndpoint) -> usize {
        if self.aos.is_empty() {
            let n = endpoint.chanlist.len();
            self.ao_phys = vec![0.0; n];
            self.prev_ao_phys = vec![0.0; n];
        }
        self.aos.push(endpoint);
        self.aos.len() - 1
    }

    pub fn aos(&self) -> &[AoEndpoint] {
        &self.aos
    }

    pub fn aos_mut(&mut self) -> &mut [AoEndpoint] {
        &mut self.aos
    }

    pub fn clear_aos(&mut self) {
        self.aos.clear();
    }

    pub fn add_dio(&mut self, endpoint: DioEndpoint) -> usize {
        self.dios.push(endpoint);
        self.dios.len() - 1
    }

    pub fn dios_mut(&mut self) -> &mut [DioEndpoint] {
        &mut self.dios
    }

    pub fn set_model(&mut self, model: Option<Box<dyn ClampModel>>) {
        self.model = model;
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    pub fn set_trigger(&mut self, trigger: Option<TriggerArm>) {
        self.trigger = trigger;
    }

    pub fn trigger(&self) -> Option<&TriggerArm> {
        self.trigger.as_ref()
    }

    /// Start the loop and every armed subdevice.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            LoopState::Configured | LoopState::Stopped => {}
            LoopState::Running => return Ok(()),
            _ => {
                return Err(DaqError::Config(format!(
                    "cannot start loop in state {:?}",
                    self.state
                )))
            }
        }
        if let Some(ai) = &mut self.ai {
            ai.device.lock().start_read()?;
            ai.active = true;
        }
        for ao in &mut self.aos {
            if ao.armed {
                ao.device.lock().start_write()?;
            }
        }
        self.set_state(LoopState::Running);
        info!(frequency = self.config.frequency, "loop running");
        Ok(())
    }

    /// Start (or re-activate) the AI endpoint while the loop is running,
    /// e.g. after an acquisition restart swapped the endpoint.
    pub fn start_ai(&mut self) -> Result<()> {
        if let Some(ai) = &mut self.ai {
            if !ai.active {
                ai.device.lock().start_read()?;
                ai.active = true;
            }
        }
        Ok(())
    }

    /// Request a stop; the next cycle is still executed (drain) before the
    /// loop transitions to Stopped. Idempotent.
    pub fn request_stop(&mut self) {
        match self.state {
            LoopState::Running => self.set_state(LoopState::Stopping),
            LoopState::Stopping | LoopState::Stopped => {}
            _ => self.set_state(LoopState::Stopped),
        }
    }

    /// Leave `ErrorFatal`; endpoints must be re-armed afterwards.
    pub fn reset(&mut self) {
        self.stop_endpoints();
        self.loop_count = 0;
        self.ao_index = 0;
        self.underruns = 0;
        self.timing_overruns = 0;
        self.stats.reset();
        self.status.set_error_code(0);
        self.status.clear_signal_index();
        self.status.publish_cycle(0, 0, 0, 0);
        if let Some(model) = &mut self.model {
            model.reset();
        }
        self.set_state(LoopState::Configured);
    }

    fn stop_endpoints(&mut self) {
        if let Some(ai) = &mut self.ai {
            if ai.active {
                if let Err(e) = ai.device.lock().stop_read() {
                    warn!(error = %e, "stopping analog input failed");
                }
                ai.active = false;
            }
        }
        for ao in &mut self.aos {
            if ao.armed {
                if let Err(e) = ao.device.lock().stop_write() {
                    warn!(error = %e, "stopping analog output failed");
                }
                ao.disarm();
            }
        }
    }

    fn fatal(&mut self, err: &DaqError) {
        error!(error = %err, "loop fatal");
        self.status.set_error_code(fatal_code(err));
        self.stop_endpoints();
        self.set_state(LoopState::ErrorFatal);
    }

    /// Drive every configured digital line for `event`.
    fn fire_event(&mut self, event: LoopEvent) {
        let mode = self.amplifier_mode;
        for dio in &mut self.dios {
            let (mut mask, mut bits) = dio.ttl.masks_for(event);
            if let Some(sp) = &dio.sync_pulse {
                if let Some(level) = sp.level_at(event, mode) {
                    let line_bit = 1u32 << sp.line;
                    mask |= line_bit;
                    if level {
                        bits |= line_bit;
                    } else {
                        bits &= !line_bit;
                    }
                }
            }
            if mask != 0 {
                if let Err(e) = dio.device.lock().write_lines(mask, bits) {
                    warn!(error = %e, "TTL write failed");
                }
            }
        }
    }

    /// Execute one cycle. `interval` is the measured time since the
    /// previous cycle (pass the nominal period when stepping
    /// deterministically).
    pub fn step(&mut self, interval: Duration) -> Result<()> {
        if self.state != LoopState::Running && self.state != LoopState::Stopping {
            return Ok(());
        }
        let timing = self.config.timing_counters;
        let cycle_start = Instant::now();
        let interval_s = interval.as_secs_f64();

        // 1. AI acquire
        let ai_start = Instant::now();
        let ai_active = self.ai.as_ref().map(|a| a.active).unwrap_or(false);
        let mut ai_frame: Option<Frame> = None;
        let ai_device = self.ai.as_ref().map(|a| Arc::clone(&a.device));
        if let (true, Some(device)) = (ai_active, ai_device) {
            self.fire_event(LoopEvent::StartRead);
            let convert_start = Instant::now();
            let res = device.lock().convert(&mut self.ai_counts);
            if timing {
                self.phase_times.ai_acquisition = convert_start.elapsed().as_secs_f64();
            }
            self.fire_event(LoopEvent::EndRead);
            if let Err(e) = res {
                self.fatal(&e);
                return Err(e);
            }
            if let Some(ai) = self.ai.as_ref() {
                for (i, entry) in ai.chanlist.entries().iter().enumerate() {
                    self.ai_phys[i] = entry.setup.to_physical(self.ai_counts[i]);
                }
            }
            ai_frame = Some(Frame::new(self.ai_counts.clone()));
        }
        if timing {
            self.phase_times.ai = ai_start.elapsed().as_secs_f64();
        }

        // trigger evaluation on the fresh AI values
        if ai_active {
            if let Some(trigger) = self.trigger.as_mut() {
                let value = self
                    .ai_phys
                    .get(trigger.channel_pos)
                    .copied()
                    .unwrap_or(0.0);
                trigger.evaluate(value);
            }
        }
        let trigger_fired = self.trigger.as_ref().map(TriggerArm::fired).unwrap_or(false);

        // 2. model computation
        let model_start = Instant::now();
        let model_active = if let Some(model) = self.model.as_mut() {
            model.compute(&self.ai_phys, &self.prev_ao_phys, &mut self.ao_phys);
            true
        } else {
            false
        };
        if timing {
            self.phase_times.model = model_start.elapsed().as_secs_f64();
        }

        // A signal boundary happens on the cycle the first real frame of an
        // armed signal goes out: gate open and delay exhausted.
        let signal_starting = self.aos.iter().any(|ao| {
            ao.armed
                && ao.signal_pending
                && !ao.emitting
                && ao.delay_left == 0
                && ao.start_gate_open(ai_active, trigger_fired)
        });
        if signal_starting {
            self.status.set_signal_index(self.loop_count);
            self.fire_event(LoopEvent::StartAo);
        }

        // 3. AO emit
        let ao_start = Instant::now();
        let will_write = self
            .aos
            .iter()
            .any(|ao| ao.armed && ao.start_gate_open(ai_active, trigger_fired));
        if will_write {
            self.fire_event(LoopEvent::StartWrite);
        }
        let mut aos = std::mem::take(&mut self.aos);
        let mut consumed: u64 = 0;
        let mut fatal_err: Option<DaqError> = None;
        let mut signal_finished = false;
        for ao in &mut aos {
            if !ao.armed || !ao.start_gate_open(ai_active, trigger_fired) {
                continue;
            }
            if !ao.emitting {
                if ao.delay_left > 0 {
                    // silent pad before the signal
                    ao.delay_left -= 1;
                    if let Err(e) = ao.device.lock().emit(&ao.idle_frame()) {
                        fatal_err = Some(e);
                        break;
                    }
                    continue;
                }
                ao.emitting = true;
                ao.signal_pending = false;
            }
            let counts: Vec<u32> = if model_active {
                ao.chanlist
                    .entries()
                    .iter()
                    .enumerate()
                    .map(|(i, entry)| {
                        entry
                            .setup
                            .to_count(self.ao_phys.get(i).copied().unwrap_or(0.0), ao.maxdata)
                    })
                    .collect()
            } else {
                match ao.fifo.pop() {
                    Some(frame) if frame.counts.len() == ao.chanlist.len() => {
                        consumed += 1;
                        frame.counts
                    }
                    Some(short) => {
                        // short frame: idle-fill the missing channels
                        let mut counts = ao.idle_frame();
                        let n = short.counts.len().min(counts.len());
                        counts[..n].copy_from_slice(&short.counts[..n]);
                        self.underruns += 1;
                        consumed += 1;
                        counts
                    }
                    None => {
                        self.underruns += 1;
                        ao.idle_frame()
                    }
                }
            };
            if model_active {
                consumed += 1;
            }
            let emit_res = ao.device.lock().emit(&counts);
            if let Err(e) = emit_res {
                fatal_err = Some(e);
                break;
            }
            ao.last_frame.copy_from_slice(&counts);
            ao.emitted += 1;
            if !ao.command.continuous && ao.emitted >= ao.command.duration_cycles() {
                signal_finished = true;
                ao.disarm();
                if let Err(e) = ao.device.lock().stop_write() {
                    warn!(error = %e, "stopping finished output failed");
                }
            }
        }
        self.aos = aos;
        if will_write {
            self.fire_event(LoopEvent::EndWrite);
        }
        if signal_finished {
            self.fire_event(LoopEvent::EndAo);
        }
        if let Some(e) = fatal_err {
            self.fatal(&e);
            return Err(e);
        }
        if timing {
            self.phase_times.ao = ao_start.elapsed().as_secs_f64();
        }
        if model_active {
            self.prev_ao_phys.copy_from_slice(&self.ao_phys);
        }

        // 5. FIFO push and counters
        if let (Some(ai), Some(frame)) = (self.ai.as_ref(), ai_frame) {
            ai.fifo.push(frame);
        }
        self.loop_count += 1;
        self.ao_index += consumed;
        let overruns = self.ai.as_ref().map(|a| a.fifo.overruns()).unwrap_or(0);
        self.status
            .publish_cycle(self.ao_index, self.underruns, overruns, self.loop_count);

        // 6. accounting
        self.stats.record(interval_s);
        if interval > self.period + self.period / 2 {
            self.timing_overruns += 1;
            if self.timing_overruns >= self.config.overrun_window {
                let err = DaqError::Fatal {
                    code: -62,
                    message: format!(
                        "cycle time exceeded the period for {} consecutive cycles",
                        self.timing_overruns
                    ),
                };
                self.fatal(&err);
                return Err(err);
            }
        } else {
            self.timing_overruns = 0;
        }
        if timing {
            self.phase_times.interval = interval_s;
            self.phase_times.wait = (interval_s - cycle_start.elapsed().as_secs_f64()).max(0.0);
        }

        // Stopping drains exactly this one cycle
        if self.state == LoopState::Stopping {
            self.stop_endpoints();
            self.set_state(LoopState::Stopped);
            debug!(loop_count = self.loop_count, "loop stopped");
        }
        Ok(())
    }

    /// Step `n` cycles at the nominal period (deterministic driving).
    pub fn step_cycles(&mut self, n: u64) -> Result<()> {
        let period = self.period;
        for _ in 0..n {
            self.step(period)?;
            if self.state != LoopState::Running && self.state != LoopState::Stopping {
                break;
            }
        }
        Ok(())
    }
}

fn fatal_code(err: &DaqError) -> i32 {
    match err {
        DaqError::Fatal { code, .. } => *code,
        DaqError::Read(_) => -5,
        DaqError::Write(_) => -6,
        DaqError::Config(_) => -22,
        DaqError::Overrun { .. } => -75,
        DaqError::Underrun { .. } => -74,
        _ => -1,
    }
}

/// Thread runner for the loop engine.
pub struct RtTask {
    engine: Arc<Mutex<RtLoop>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RtTask {
    pub fn new(engine: Arc<Mutex<RtLoop>>) -> Self {
        Self {
            engine,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn engine(&self) -> Arc<Mutex<RtLoop>> {
        Arc::clone(&self.engine)
    }

    /// Start the loop thread. The engine must be configured and started.
    pub fn spawn(&mut self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(DaqError::Busy {
                device: "rt task".into(),
            });
        }
        let engine = Arc::clone(&self.engine);
        let running = Arc::clone(&self.running);
        let handle = std::thread::Builder::new()
            .name("rt-loop".into())
            .spawn(move || {
                let (period, timer_mode) = {
                    let guard = engine.lock();
                    (guard.period(), guard.timer_mode())
                };
                let mut last = Instant::now();
                let mut deadline = last + period;
                loop {
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    let now = Instant::now();
                    let interval = now - last;
                    last = now;
                    {
                        let mut guard = engine.lock();
                        match guard.state() {
                            LoopState::Running | LoopState::Stopping => {
                                if guard.step(interval).is_err() {
                                    break;
                                }
                                if guard.state() == LoopState::Stopped {
                                    break;
                                }
                            }
                            _ => break,
                        }
                    }
                    // 7. sleep
                    match timer_mode {
                        TimerMode::Periodic => {
                            deadline += period;
                            let now = Instant::now();
                            if deadline > now {
                                std::thread::sleep(deadline - now);
                            }
                        }
                        TimerMode::OneShot => {
                            std::thread::sleep(period);
                        }
                    }
                }
                running.store(false, Ordering::SeqCst);
                debug!("rt task exiting");
            })
            .map_err(|e| DaqError::Fatal {
                code: -12,
                message: format!("failed to spawn loop thread: {e}"),
            })?;
        self.handle = Some(handle);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the engine and join the thread. The task drains one more cycle
    /// (the Stopping state) before it exits.
    pub fn stop(&mut self) {
        self.engine.lock().request_stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("rt task panicked");
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Drop for RtTask {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}
