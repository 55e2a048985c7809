//! Cycle-level tests of the real-time loop against the loopback driver.

use std::sync::Arc;

use parking_lot::Mutex;

use relacs_core::StartSource;
use relacs_driver_mock::{
    ai_channel_setup, ao_channel_setup, volts_to_counts, LoopbackBus, MockAnalogInput,
    MockAnalogOutput, MockDigitalIo,
};
use relacs_dynclamp::control::{DioOp, RtModule, SubdevId};
use relacs_dynclamp::rtloop::{LoopConfig, RtLoop, RtTask};
use relacs_dynclamp::status::{LoopState, StatusSlot};
use relacs_dynclamp::ttl::{AmplifierMode, LoopEvent, SyncPulse};
use relacs_dynclamp::{Frame, PassThroughModel};
use relacs_hardware::command::{Chanlist, ChanlistEntry, SyncCommand};
use relacs_hardware::device::{Device, DeviceHandle};
use relacs_hardware::subsystem::{AnalogInput, AnalogOutput, DigitalIo};

struct Rig {
    module: RtModule,
    bus: LoopbackBus,
    ai: Arc<Mutex<MockAnalogInput>>,
    ao: Arc<Mutex<MockAnalogOutput>>,
    dio: Arc<Mutex<MockDigitalIo>>,
}

fn ai_chanlist(channels: &[u32]) -> Chanlist {
    channels
        .iter()
        .map(|&c| ChanlistEntry::new(ai_channel_setup(c)))
        .collect()
}

fn ao_chanlist(channels: &[u32]) -> Chanlist {
    channels
        .iter()
        .map(|&c| ChanlistEntry::new(ao_channel_setup(c)))
        .collect()
}

fn sync(frequency: f64, duration: f64, continuous: bool) -> SyncCommand {
    SyncCommand {
        frequency,
        delay: 0.0,
        duration,
        start_source: StartSource::Internal,
        continuous,
        buffer_frames: 1024,
    }
}

impl Rig {
    fn new() -> Self {
        let bus = LoopbackBus::new();
        Self {
            module: RtModule::new(),
            ai: Arc::new(Mutex::new(MockAnalogInput::new("ai0", bus.clone(), 8))),
            ao: Arc::new(Mutex::new(MockAnalogOutput::new("ao0", bus.clone(), 8))),
            dio: Arc::new(Mutex::new(MockDigitalIo::new("dio0", bus.clone(), 8))),
            bus,
        }
    }

    fn open_ai(&mut self, channels: &[u32], cmd: SyncCommand) -> SubdevId {
        let handle =
            DeviceHandle::AnalogInput(Arc::clone(&self.ai) as Arc<Mutex<dyn AnalogInput>>);
        let slot = self.module.open_subdev(handle, 1024).unwrap();
        self.module.set_chanlist(slot, ai_chanlist(channels)).unwrap();
        self.module.set_sync_command(slot, cmd).unwrap();
        slot
    }

    fn open_ao(&mut self, channels: &[u32], cmd: SyncCommand) -> SubdevId {
        let handle =
            DeviceHandle::AnalogOutput(Arc::clone(&self.ao) as Arc<Mutex<dyn AnalogOutput>>);
        let slot = self.module.open_subdev(handle, 1024).unwrap();
        self.module.set_chanlist(slot, ao_chanlist(channels)).unwrap();
        self.module.set_sync_command(slot, cmd).unwrap();
        slot
    }

    fn open_dio(&mut self) -> SubdevId {
        let handle =
            DeviceHandle::DigitalIo(Arc::clone(&self.dio) as Arc<Mutex<dyn DigitalIo>>);
        self.module.open_subdev(handle, 1).unwrap()
    }

    fn step(&self, n: u64) {
        self.module.engine().lock().step_cycles(n).unwrap();
    }
}

#[test]
fn loop_state_machine_transitions() {
    let status = StatusSlot::new();
    let mut engine = RtLoop::new(Arc::clone(&status));
    assert_eq!(engine.state(), LoopState::Unconfigured);

    engine
        .configure(LoopConfig {
            frequency: 1000.0,
            ..LoopConfig::default()
        })
        .unwrap();
    assert_eq!(engine.state(), LoopState::Configured);

    engine.start().unwrap();
    assert_eq!(engine.state(), LoopState::Running);
    assert_eq!(status.state(), LoopState::Running);

    engine.request_stop();
    assert_eq!(engine.state(), LoopState::Stopping);
    // stop is idempotent
    engine.request_stop();
    assert_eq!(engine.state(), LoopState::Stopping);

    // the stopping state drains exactly one more cycle
    engine.step(engine.period()).unwrap();
    assert_eq!(engine.state(), LoopState::Stopped);
    assert_eq!(engine.loop_count(), 1);

    // and can be restarted
    engine.start().unwrap();
    assert_eq!(engine.state(), LoopState::Running);
}

#[test]
fn loop_frequency_is_capped() {
    let mut engine = RtLoop::new(StatusSlot::new());
    engine
        .configure(LoopConfig {
            frequency: 200_000.0,
            ..LoopConfig::default()
        })
        .unwrap();
    assert_eq!(engine.frequency(), 90_000.0);
    assert!(engine.configure(LoopConfig {
        frequency: 0.0,
        ..LoopConfig::default()
    })
    .is_err());
}

#[test]
fn underrun_recovery_keeps_loop_running() {
    // 90 kHz loop, zero AO frames pushed: every cycle emits the idle value,
    // counts one underrun, and the loop stays in Running.
    let mut rig = Rig::new();
    let slot = rig.open_ao(&[0], sync(90_000.0, 0.0, true));
    rig.module.start_subdev(slot).unwrap();
    rig.step(1000);

    let status = rig.module.status_snapshot();
    assert_eq!(status.underruns, 1000);
    assert_eq!(status.ao_index, 0);
    assert_eq!(status.loop_count, 1000);
    assert_eq!(status.state, LoopState::Running);
    // the idle value for a fresh channel is the zero count of 0 V
    let emitted = rig.ao.lock().emitted_frames().to_vec();
    assert_eq!(emitted.len(), 1000);
    assert_eq!(emitted[0][0], volts_to_counts(0.0));
}

#[test]
fn loopback_round_trip_reproduces_counts() {
    // AO frames pushed by the user come back on the wired AI channel one
    // cycle later (the conversion delay of the loop ordering).
    let mut rig = Rig::new();
    rig.bus.wire(0, 0);
    let n = 50u32;
    let ao_slot = rig.open_ao(&[0], sync(10_000.0, n as f64 / 10_000.0, false));
    let ai_slot = rig.open_ai(&[0], sync(10_000.0, 0.0, true));
    rig.module.start_subdev(ao_slot).unwrap();
    let ao_fifo = rig.module.fifo(ao_slot).unwrap();
    let pushed: Vec<u32> = (0..n).map(|i| 30_000 + i * 7).collect();
    for &c in &pushed {
        ao_fifo.push(Frame::new(vec![c]));
    }
    rig.module.start_subdev(ai_slot).unwrap();
    rig.step(n as u64 + 10);

    let ai_fifo = rig.module.fifo(ai_slot).unwrap();
    let mut got = Vec::new();
    while let Some(frame) = ai_fifo.pop() {
        got.push(frame.counts[0]);
    }
    assert_eq!(got.len() as u64, n as u64 + 10);
    // delay of one cycle, then the exact pushed counts
    assert_eq!(&got[1..=n as usize], pushed.as_slice());
    // after the signal ends the line holds its last value
    assert_eq!(got[n as usize + 1], pushed[n as usize - 1]);

    // the signal boundary was published on the first emitted frame
    assert_eq!(rig.module.status().signal_index(), Some(0));
    // exactly n real frames were consumed
    assert_eq!(rig.module.status_snapshot().ao_index, n as u64);
    assert_eq!(rig.module.status_snapshot().underruns, 0);
}

#[test]
fn ao_signals_on_one_subdevice_share_cycles() {
    // Two channels submitted together: sample k of both goes out on the
    // same cycle.
    let mut rig = Rig::new();
    rig.bus.wire(0, 0);
    rig.bus.wire(1, 1);
    let n = 20;
    let ao_slot = rig.open_ao(&[0, 1], sync(10_000.0, n as f64 / 10_000.0, false));
    let ai_slot = rig.open_ai(&[0, 1], sync(10_000.0, 0.0, true));
    rig.module.start_subdev(ao_slot).unwrap();
    let ao_fifo = rig.module.fifo(ao_slot).unwrap();
    for k in 0..n {
        ao_fifo.push(Frame::new(vec![
            volts_to_counts(k as f64 * 0.01),
            volts_to_counts(-(k as f64) * 0.01),
        ]));
    }
    rig.module.start_subdev(ai_slot).unwrap();
    rig.step(n + 5);

    let ai_fifo = rig.module.fifo(ai_slot).unwrap();
    let mut frames = Vec::new();
    while let Some(frame) = ai_fifo.pop() {
        frames.push(frame.counts);
    }
    for k in 0..n as usize {
        // frame k+1 on AI carries sample k of both channels
        assert_eq!(frames[k + 1][0], volts_to_counts(k as f64 * 0.01));
        assert_eq!(frames[k + 1][1], volts_to_counts(-(k as f64) * 0.01));
    }
}

#[test]
fn ttl_pulses_fire_at_their_phases_without_overlap() {
    let mut rig = Rig::new();
    let dio_slot = rig.open_dio();
    let ai_slot = rig.open_ai(&[0], sync(5000.0, 0.0, true));
    let ao_slot = rig.open_ao(&[0], sync(5000.0, 0.0, true));
    rig.module
        .dio_cmd(
            dio_slot,
            DioOp::AddTtlPulse {
                line: 3,
                high: LoopEvent::StartWrite,
                low: LoopEvent::EndWrite,
            },
        )
        .unwrap();
    rig.module
        .dio_cmd(
            dio_slot,
            DioOp::AddTtlPulse {
                line: 4,
                high: LoopEvent::StartRead,
                low: LoopEvent::EndRead,
            },
        )
        .unwrap();
    rig.module.start_subdev(ai_slot).unwrap();
    rig.module.start_subdev(ao_slot).unwrap();
    let cycles = 25u64;
    rig.step(cycles);

    let log = rig.dio.lock().write_log().to_vec();
    let line3_highs = log
        .iter()
        .filter(|w| w.mask & (1 << 3) != 0 && w.bits & (1 << 3) != 0)
        .count() as u64;
    assert_eq!(line3_highs, cycles, "write pulse rises once per cycle");
    // whenever the write pulse is high the read pulse is low and vice versa
    for w in &log {
        let write_high = w.lines_after & (1 << 3) != 0;
        let read_high = w.lines_after & (1 << 4) != 0;
        assert!(
            !(write_high && read_high),
            "write and read TTL pulses must not overlap"
        );
    }
    // within each cycle the read pulse completes before the write pulse
    let first_read_high = log
        .iter()
        .position(|w| w.mask & (1 << 4) != 0 && w.bits & (1 << 4) != 0)
        .unwrap();
    let first_write_high = log
        .iter()
        .position(|w| w.mask & (1 << 3) != 0 && w.bits & (1 << 3) != 0)
        .unwrap();
    assert!(first_read_high < first_write_high);
}

#[test]
fn sync_pulse_obeys_amplifier_mode_gate() {
    let mut rig = Rig::new();
    let dio_slot = rig.open_dio();
    let ao_slot = rig.open_ao(&[0], sync(5000.0, 0.0, true));
    rig.module
        .dio_cmd(
            dio_slot,
            DioOp::SetSyncPulse(SyncPulse::new(
                2,
                50e-6,
                AmplifierMode::DC,
                AmplifierMode::DC,
            )),
        )
        .unwrap();
    rig.module.start_subdev(ao_slot).unwrap();

    // wrong amplifier mode: the sync line never moves
    rig.module.set_amplifier_mode(AmplifierMode::CC);
    rig.step(10);
    assert!(rig
        .dio
        .lock()
        .write_log()
        .iter()
        .all(|w| w.mask & (1 << 2) == 0));

    // dynamic clamp mode: high at EndWrite, low at EndRead, every cycle
    rig.dio.lock().clear_log();
    rig.module.set_amplifier_mode(AmplifierMode::DC);
    rig.step(10);
    let log = rig.dio.lock().write_log().to_vec();
    let highs = log
        .iter()
        .filter(|w| w.mask & (1 << 2) != 0 && w.bits & (1 << 2) != 0)
        .count();
    assert_eq!(highs, 10);

    // clearing removes it again
    rig.module
        .dio_cmd(dio_slot, DioOp::ClearSyncPulse)
        .unwrap();
    rig.dio.lock().clear_log();
    rig.step(5);
    assert!(rig
        .dio
        .lock()
        .write_log()
        .iter()
        .all(|w| w.mask & (1 << 2) == 0));
}

#[test]
fn analog_trigger_gates_external_start() {
    let mut rig = Rig::new();
    let ai_slot = rig.open_ai(&[0], sync(1000.0, 0.0, true));
    let ao_cmd = SyncCommand {
        start_source: StartSource::ExternalPfi { line: 0 },
        ..sync(1000.0, 0.005, false)
    };
    let ao_slot = rig.open_ao(&[0], ao_cmd);
    rig.module.start_subdev(ai_slot).unwrap();
    rig.module.start_subdev(ao_slot).unwrap();
    rig.module.set_trigger(0, 1.0).unwrap();
    let ao_fifo = rig.module.fifo(ao_slot).unwrap();
    for _ in 0..5 {
        ao_fifo.push(Frame::new(vec![volts_to_counts(2.0)]));
    }

    // below threshold: the output stays quiet
    rig.bus.set_source(0, 0.0);
    rig.step(10);
    assert_eq!(rig.ao.lock().emitted_frames().len(), 0);
    assert_eq!(rig.module.status_snapshot().underruns, 0);

    // crossing fires the trigger; emission begins the same cycle
    rig.bus.set_source(0, 2.0);
    rig.step(10);
    assert_eq!(rig.module.status_snapshot().ao_index, 5);
    assert!(rig.module.engine().lock().trigger().unwrap().fired());
}

#[test]
fn pass_through_model_closes_the_loop() {
    // With the model installed the AO frame is computed from the AI frame
    // instead of the FIFO: dynamic clamp pass-through.
    let mut rig = Rig::new();
    rig.bus.set_source(0, 1.5);
    let ai_slot = rig.open_ai(&[0], sync(2000.0, 0.0, true));
    let ao_slot = rig.open_ao(&[0], sync(2000.0, 0.0, true));
    rig.module.set_model(Some(Box::new(PassThroughModel)));
    rig.module.start_subdev(ai_slot).unwrap();
    rig.module.start_subdev(ao_slot).unwrap();
    rig.step(10);

    // no FIFO data, yet no underruns: the model supplies every frame
    assert_eq!(rig.module.status_snapshot().underruns, 0);
    let volts = rig.bus.ao_level(0);
    assert!((volts - 1.5).abs() < 1e-3, "model echoed {volts} V");
}

#[test]
fn fatal_device_error_stops_the_loop() {
    let mut rig = Rig::new();
    let ai_slot = rig.open_ai(&[0], sync(1000.0, 0.0, true));
    rig.module.start_subdev(ai_slot).unwrap();
    rig.step(3);
    // ripping the device out mid-acquisition is unrecoverable
    rig.ai.lock().close();
    {
        let engine = rig.module.engine();
        let mut engine = engine.lock();
        let period = engine.period();
        assert!(engine.step(period).is_err());
        assert_eq!(engine.state(), LoopState::ErrorFatal);
    }
    let status = rig.module.status_snapshot();
    assert_ne!(status.error_code, 0);

    // reset returns to Configured
    rig.ai.lock().open("", &Default::default()).unwrap();
    rig.module.reset();
    assert_eq!(rig.module.status_snapshot().state, LoopState::Configured);
}

#[test]
fn rt_task_runs_and_stops_cleanly() {
    let mut rig = Rig::new();
    let ai_slot = rig.open_ai(&[0], sync(1000.0, 0.0, true));
    rig.module.start_subdev(ai_slot).unwrap();

    let mut task = RtTask::new(rig.module.engine());
    task.spawn().unwrap();
    std::thread::sleep(std::time::Duration::from_millis(100));
    assert!(task.is_running());
    task.stop();

    let status = rig.module.status_snapshot();
    assert_eq!(status.state, LoopState::Stopped);
    assert!(status.loop_count > 10, "ran {} cycles", status.loop_count);
    let timing = rig.module.engine().lock().timing();
    assert!(timing.cycles > 0);
    assert!(timing.mean > 0.0);
}
