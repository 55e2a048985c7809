//! The acquisition drain thread.
//!
//! Moves AI frames from the module FIFO into the `InData` rings: one frame
//! per loop cycle, counts converted through the chanlist calibration. The
//! thread also forwards the module's published signal index and overrun
//! count onto the traces. It suspends on the FIFO's data-wait condition
//! and wakes on new frames or a stop request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error};

use relacs_core::error::ErrorFlags;
use relacs_core::InList;
use relacs_dynclamp::fifo::FrameFifo;
use relacs_dynclamp::status::StatusSlot;
use relacs_hardware::command::Chanlist;

const DRAIN_WAIT: Duration = Duration::from_millis(10);

/// Handle of a running drain thread.
pub struct DrainHandle {
    stop: Arc<AtomicBool>,
    fifo: FrameFifo,
    handle: Option<JoinHandle<()>>,
}

impl DrainHandle {
    /// Spawn the drain thread for an acquisition.
    ///
    /// `chanlist` fixes the frame layout; trace `i` of `in_list` receives
    /// the samples of chanlist position `i`.
    pub fn spawn(
        fifo: FrameFifo,
        chanlist: Chanlist,
        in_list: InList,
        status: Arc<StatusSlot>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread_fifo = fifo.clone();
        let handle = std::thread::Builder::new()
            .name("acq-drain".into())
            .spawn(move || {
                drain_loop(thread_fifo, chanlist, in_list, status, stop_flag);
            })
            .ok();
        if handle.is_none() {
            error!("failed to spawn drain thread");
        }
        Self {
            stop,
            fifo,
            handle,
        }
    }

    /// Request a stop and join. Remaining queued frames are still drained.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.fifo.notify();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("drain thread panicked");
            }
        }
    }
}

fn drain_loop(
    fifo: FrameFifo,
    chanlist: Chanlist,
    in_list: InList,
    status: Arc<StatusSlot>,
    stop: Arc<AtomicBool>,
) {
    let setups: Vec<_> = chanlist.entries().iter().map(|e| e.setup).collect();
    let mut last_overruns = 0u64;
    let mut last_signal: Option<u64> = None;
    loop {
        let stopping = stop.load(Ordering::SeqCst);
        let mut drained = false;
        while let Some(frame) = fifo.pop() {
            drained = true;
            for (i, setup) in setups.iter().enumerate() {
                if let (Some(trace), Some(&count)) = (in_list.get(i), frame.counts.get(i)) {
                    trace.push(&[setup.to_physical(count)]);
                }
            }
        }
        // propagate the module-published signal boundary onto the traces
        let signal = status.signal_index();
        if signal != last_signal {
            if let Some(index) = signal {
                for trace in in_list.iter() {
                    trace.set_signal_index(index);
                }
            }
            last_signal = signal;
        }
        // a grown overrun count means frames were lost while we stalled
        let overruns = fifo.overruns();
        if overruns > last_overruns {
            for trace in in_list.iter() {
                trace.add_error(ErrorFlags::OVERRUN);
            }
            last_overruns = overruns;
        }
        if stopping && !drained && fifo.is_empty() {
            break;
        }
        if !drained && !stopping {
            fifo.wait_for_data(DRAIN_WAIT);
        }
    }
    debug!("drain thread exiting");
}

/// Drain whatever is queued right now, synchronously (deterministic tests
/// step the loop by hand and then call this instead of running a thread).
pub fn drain_once(fifo: &FrameFifo, chanlist: &Chanlist, in_list: &InList, status: &StatusSlot) {
    let setups: Vec<_> = chanlist.entries().iter().map(|e| e.setup).collect();
    while let Some(frame) = fifo.pop() {
        for (i, setup) in setups.iter().enumerate() {
            if let (Some(trace), Some(&count)) = (in_list.get(i), frame.counts.get(i)) {
                trace.push(&[setup.to_physical(count)]);
            }
        }
    }
    if let Some(index) = status.signal_index() {
        for trace in in_list.iter() {
            trace.set_signal_index(index);
        }
    }
    if fifo.overruns() > 0 {
        for trace in in_list.iter() {
            trace.add_error(ErrorFlags::OVERRUN);
        }
    }
}
