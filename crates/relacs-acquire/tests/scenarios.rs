//! End-to-end pipeline scenarios on the loopback driver: protocol builds
//! signals, the planner compiles and commits them, the loop is stepped
//! deterministically, and the recorded traces are checked.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use relacs_acquire::{AcquisitionContext, AcquisitionPlan, InTraceConfig, TakeRelation};
use relacs_core::error::ErrorFlags;
use relacs_core::{OutData, OutList, OutputLevel, StartSource};
use relacs_driver_mock::{
    ai_channel_setup, ao_channel_setup, LineLevel, LoopbackBus, MockAnalogInput, MockAnalogOutput,
    MockAttenuator, MockDigitalIo,
};
use relacs_dynclamp::status::LoopState;
use relacs_hardware::device::DeviceHandle;
use relacs_hardware::registry::DeviceRegistry;
use relacs_hardware::subsystem::{AnalogInput, AnalogOutput, Attenuator, DigitalIo};

/// Registry indices of the rig devices.
const DEV_AI: usize = 0;
const DEV_AO: usize = 1;
const DEV_ATT: usize = 2;
#[allow(dead_code)]
const DEV_DIO: usize = 3;
const DEV_AO_B: usize = 4;

struct Rig {
    ctx: AcquisitionContext,
    bus: LoopbackBus,
    ao: Arc<Mutex<MockAnalogOutput>>,
    ao_b: Arc<Mutex<MockAnalogOutput>>,
    att: Arc<Mutex<MockAttenuator>>,
}

impl Rig {
    fn new() -> Self {
        let bus = LoopbackBus::new();
        let ai = Arc::new(Mutex::new(MockAnalogInput::new("ai-0", bus.clone(), 8)));
        let ao = Arc::new(Mutex::new(MockAnalogOutput::new("ao-0", bus.clone(), 8)));
        let att = Arc::new(Mutex::new(MockAttenuator::new("att-0", 2)));
        let dio = Arc::new(Mutex::new(MockDigitalIo::new("dio-0", bus.clone(), 8)));
        let ao_b = Arc::new(Mutex::new(MockAnalogOutput::new("ao-1", bus.clone(), 8)));

        let mut registry = DeviceRegistry::new();
        registry
            .register(
                "ai-0",
                DeviceHandle::AnalogInput(Arc::clone(&ai) as Arc<Mutex<dyn AnalogInput>>),
            )
            .unwrap();
        registry
            .register(
                "ao-0",
                DeviceHandle::AnalogOutput(Arc::clone(&ao) as Arc<Mutex<dyn AnalogOutput>>),
            )
            .unwrap();
        registry
            .register(
                "att-0",
                DeviceHandle::Attenuator(Arc::clone(&att) as Arc<Mutex<dyn Attenuator>>),
            )
            .unwrap();
        registry
            .register(
                "dio-0",
                DeviceHandle::DigitalIo(Arc::clone(&dio) as Arc<Mutex<dyn DigitalIo>>),
            )
            .unwrap();
        registry
            .register(
                "ao-1",
                DeviceHandle::AnalogOutput(Arc::clone(&ao_b) as Arc<Mutex<dyn AnalogOutput>>),
            )
            .unwrap();

        let mut ctx = AcquisitionContext::init(registry);
        let planner = ctx.planner_mut();
        planner.register_out_trace("Current-1", "V", DEV_AO, 0, ao_channel_setup(0));
        planner.register_out_trace("Sound", "V", DEV_AO_B, 4, ao_channel_setup(4));
        planner.bind_attenuator(DEV_AO, 0, DEV_ATT, 0).unwrap();

        Self {
            ctx,
            bus,
            ao,
            ao_b,
            att,
        }
    }

    fn plan(rate: f64) -> AcquisitionPlan {
        AcquisitionPlan {
            rate,
            history_secs: 5.0,
            traces: vec![InTraceConfig {
                ident: "V-1".into(),
                unit: "V".into(),
                device: DEV_AI,
                channel: 0,
                gain_index: 0,
                setup: ai_channel_setup(0),
            }],
        }
    }
}

#[test]
fn one_channel_pulse() {
    let mut rig = Rig::new();
    rig.bus.wire(0, 0);
    let rate = 20_000.0;
    let in_list = rig.ctx.start_acquisition_manual(&Rig::plan(rate)).unwrap();

    let mut list = OutList::new();
    list.push(
        OutData::new("pulse")
            .pulse(rate, 0.010, 1.0, 0.050)
            .with_trace_name("Current-1")
            .with_delay(0.010),
    );
    let outcome = rig.ctx.write(&mut list).unwrap();
    // 10 ms pulse + 50 ms pause at 20 kHz
    assert_eq!(outcome.frames_queued, 1200);
    assert!(!list.failed());

    // 200 delay cycles, then the 200-frame pulse
    rig.ctx.step_cycles(400).unwrap();
    assert_eq!(rig.ctx.status().ao_index, 200, "pulse fully consumed");
    assert_eq!(rig.ctx.status().underruns, 0);

    // let the pause play out and drain everything
    rig.ctx.step_cycles(1100).unwrap();
    rig.ctx.drain_now();

    let trace = &in_list[0];
    let signal_index = trace.signal_index().expect("signal boundary published");
    assert_eq!(signal_index, 200);

    // frames before the signal boundary are baseline
    let baseline = trace.read(0, 200).unwrap();
    assert!(baseline.iter().all(|v| v.abs() < 1e-3));
    // the rising edge appears within one frame of the boundary
    let edge = trace.read(signal_index, signal_index + 2).unwrap();
    assert!(
        edge.iter().any(|v| (v - 1.0).abs() < 1e-3),
        "rising edge near signal index, got {edge:?}"
    );
    // mid-pulse samples sit at the pulse amplitude
    let mid = trace.read(signal_index + 50, signal_index + 150).unwrap();
    assert!(mid.iter().all(|v| (v - 1.0).abs() < 1e-3));
    // and the pause returns to baseline
    let pause = trace.read(signal_index + 250, signal_index + 400).unwrap();
    assert!(pause.iter().all(|v| v.abs() < 1e-3));
}

#[test]
fn attenuator_mute_reserves_the_channel() {
    let mut rig = Rig::new();
    rig.bus.wire(0, 0);
    let rate = 10_000.0;
    rig.ctx.start_acquisition_manual(&Rig::plan(rate)).unwrap();

    let mut list = OutList::new();
    list.push(
        OutData::new("muted-tone")
            .sine_wave(rate, 0.02, 440.0, 1.0)
            .with_trace_name("Current-1")
            .with_level(OutputLevel::Muted),
    );
    rig.ctx.write(&mut list).unwrap();
    assert!(!list.failed());
    assert_eq!(rig.att.lock().line_level(0), LineLevel::Muted);
    assert_eq!(list[0].description["muted"], json!(true));

    // the channel is reserved but silent: frames carry the idle value
    rig.ctx.step_cycles(250).unwrap();
    assert!(rig.bus.ao_level(0).abs() < 1e-3);
    let emitted = rig.ao.lock().emitted_frames().len();
    assert!(emitted >= 200, "muted signal still occupies its cycles");
}

#[test]
fn attenuator_clipping_is_recorded_not_fatal() {
    let mut rig = Rig::new();
    let rate = 10_000.0;
    rig.ctx.start_acquisition_manual(&Rig::plan(rate)).unwrap();

    let step = rig.att.lock().step();
    let max_level = rig.att.lock().max_level();

    // a reasonable level snaps to the grid
    let mut list = OutList::new();
    list.push(
        OutData::new("tone")
            .sine_wave(rate, 0.01, 1000.0, 1.0)
            .with_trace_name("Current-1")
            .with_level(OutputLevel::Attenuation(20.3)),
    );
    rig.ctx.write(&mut list).unwrap();
    let actual = list[0].description["attenuation_db"].as_f64().unwrap();
    assert!((20.3 - actual).abs() <= step);

    // an absurdly high attenuation clips to the maximum and flags underflow
    let mut list = OutList::new();
    list.push(
        OutData::new("quiet")
            .sine_wave(rate, 0.01, 1000.0, 1.0)
            .with_trace_name("Current-1")
            .with_level(OutputLevel::Attenuation(1.0e4)),
    );
    rig.ctx.write(&mut list).unwrap();
    assert!(list[0].errors.contains(ErrorFlags::UNDERFLOW));
    assert!(!list.failed(), "clipping is not a failure");
    let actual = list[0].description["attenuation_db"].as_f64().unwrap();
    assert_eq!(actual, max_level);
}

#[test]
fn restart_mid_signal() {
    let mut rig = Rig::new();
    rig.bus.wire(0, 0);
    let rate = 10_000.0;
    let in_list = rig.ctx.start_acquisition_manual(&Rig::plan(rate)).unwrap();

    // a 100 ms sine, submitted and half played
    let mut list = OutList::new();
    list.push(
        OutData::new("sine")
            .sine_wave(rate, 0.1, 50.0, 1.0)
            .with_trace_name("Current-1"),
    );
    rig.ctx.write(&mut list).unwrap();
    rig.ctx.step_cycles(500).unwrap();
    rig.ctx.drain_now();
    let first_signal = in_list[0].signal_index().unwrap();
    let index_before = in_list[0].current_index();
    let loops_before = rig.ctx.status().loop_count;

    // second signal aborts and re-arms the acquisition
    let mut second = OutList::new();
    second.push(
        OutData::new("pulse")
            .pulse(rate, 0.005, 0.5, 0.0)
            .with_trace_name("Current-1")
            .with_restart(true),
    );
    let outcome = rig.ctx.write(&mut second).unwrap();
    assert!(outcome.restarted);
    let loops_after = rig.ctx.status().loop_count;
    assert!(loops_after - loops_before <= 2, "restart gap stays tight");

    // no samples leaked across the restart boundary
    rig.ctx.drain_now();
    assert_eq!(in_list[0].current_index(), index_before);
    assert_eq!(in_list[0].restart_indices(), vec![index_before]);

    rig.ctx.step_cycles(100).unwrap();
    rig.ctx.drain_now();
    let second_signal = in_list[0].signal_index().unwrap();
    assert!(
        second_signal > first_signal,
        "signal indices stay monotone across restarts"
    );
    assert!(
        !in_list[0].errors().contains(ErrorFlags::STOPPED_BY_AI),
        "a requested restart is not an AI fault"
    );
    assert_eq!(rig.ctx.status().state, LoopState::Running);
}

#[test]
fn cross_device_start_via_take() {
    let mut rig = Rig::new();
    let rate = 10_000.0;
    rig.ctx.start_acquisition_manual(&Rig::plan(rate)).unwrap();

    // same-rate take: AO on device B starts with the AI start of device A
    rig.ctx.planner_mut().take(TakeRelation {
        ai_device: DEV_AI,
        ao_device: DEV_AO_B,
        ai_rate: rate,
        ao_rate: rate,
        pfi_line: 6,
    });
    let mut list = OutList::new();
    list.push(
        OutData::new("beep")
            .sine_wave(rate, 0.01, 500.0, 1.0)
            .with_trace_name("Sound"),
    );
    rig.ctx.write(&mut list).unwrap();
    {
        let engine = rig.ctx.module().engine();
        let engine = engine.lock();
        let source = engine.aos()[0].command.start_source;
        assert_eq!(source, StartSource::AiStart { device: DEV_AI });
    }
    let submit_cycle = rig.ctx.status().loop_count;
    rig.ctx.step_cycles(5).unwrap();
    // AI is running, so the output started on the very next cycle
    let signal_index = rig.ctx.module().status().signal_index().unwrap();
    assert!(signal_index <= submit_cycle + 1, "AO start aligned with AI");
    assert!(!rig.ao_b.lock().emitted_frames().is_empty());

    // differing rates route the start over a PFI line instead
    rig.ctx.planner_mut().take(TakeRelation {
        ai_device: DEV_AI,
        ao_device: DEV_AO_B,
        ai_rate: rate,
        ao_rate: 4.0 * rate,
        pfi_line: 6,
    });
    let mut list = OutList::new();
    list.push(
        OutData::new("beep2")
            .sine_wave(rate, 0.01, 500.0, 1.0)
            .with_trace_name("Sound"),
    );
    rig.ctx.write(&mut list).unwrap();
    {
        let engine = rig.ctx.module().engine();
        let engine = engine.lock();
        let source = engine.aos()[0].command.start_source;
        assert_eq!(source, StartSource::ExternalPfi { line: 6 });
    }
}

#[test]
fn invalid_submissions_abort_without_starting_anything() {
    let mut rig = Rig::new();
    let rate = 10_000.0;
    rig.ctx.start_acquisition_manual(&Rig::plan(rate)).unwrap();
    let armed_before = {
        let engine = rig.ctx.module().engine();
        let n = engine.lock().aos().iter().filter(|a| a.is_armed()).count();
        n
    };

    // unresolved trace binding
    let mut list = OutList::new();
    list.push(
        OutData::new("nowhere")
            .constant(rate, 0.01, 1.0)
            .with_trace_name("NoSuchTrace"),
    );
    assert!(rig.ctx.write(&mut list).is_err());
    assert!(list.failed());
    assert!(list[0].errors.contains(ErrorFlags::CONFIG_ERROR));

    // rate beyond the subdevice
    let mut list = OutList::new();
    list.push(
        OutData::new("too-fast")
            .constant(500_000.0, 0.001, 1.0)
            .with_trace_name("Current-1"),
    );
    assert!(rig.ctx.write(&mut list).is_err());
    assert!(list[0].errors.contains(ErrorFlags::INVALID_RATE));

    // empty waveform
    let mut list = OutList::new();
    list.push(OutData::new("empty").with_trace_name("Current-1"));
    assert!(rig.ctx.write(&mut list).is_err());
    assert!(list[0].errors.contains(ErrorFlags::NO_DATA));

    // a failed submission armed nothing new
    let engine = rig.ctx.module().engine();
    let armed_after = engine.lock().aos().iter().filter(|a| a.is_armed()).count();
    assert_eq!(armed_before, armed_after);
    assert!(rig.ao.lock().emitted_frames().is_empty());
}

#[test]
fn signal_log_records_submissions() {
    let mut rig = Rig::new();
    let rate = 10_000.0;
    rig.ctx.start_acquisition_manual(&Rig::plan(rate)).unwrap();

    let mut list = OutList::new();
    list.push(
        OutData::new("tone-a")
            .sine_wave(rate, 0.02, 200.0, 0.5)
            .with_trace_name("Current-1")
            .with_delay(0.001),
    );
    let outcome = rig.ctx.write(&mut list).unwrap();
    assert_eq!(outcome.infos.len(), 1);
    let log = rig.ctx.planner().signal_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].ident, "tone-a");
    assert!((log[0].duration - 0.02).abs() < 1e-9);
    assert!((log[0].delay - 0.001).abs() < 1e-12);
    assert_eq!(log[0].description["type"], json!("sine"));
}

#[test]
fn threaded_acquisition_fills_traces() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut rig = Rig::new();
    rig.bus.set_source(0, 0.25);
    let in_list = rig.ctx.start_acquisition(&Rig::plan(1000.0)).unwrap();
    rig.ctx.spawn_task().unwrap();
    std::thread::sleep(std::time::Duration::from_millis(150));
    rig.ctx.stop().unwrap();

    let trace = &in_list[0];
    assert!(trace.current_index() > 20, "drain thread appended samples");
    let data = trace.read_clipped(0, trace.current_index());
    assert!(data.iter().all(|v| (v - 0.25).abs() < 1e-3));
    assert_eq!(rig.ctx.status().state, LoopState::Stopped);
}
