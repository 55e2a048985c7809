//! The acquisition context.
//!
//! Owns everything a running experiment needs: the device registry, the
//! real-time module, the planner, the drain thread, and (optionally) the
//! loop task thread. Protocols receive a reference to the context instead
//! of reaching for globals; `init`/`teardown` bracket its lifetime.

use std::sync::Arc;

use tracing::info;

use relacs_core::{InList, OutList, Result};
use relacs_dynclamp::control::RtModule;
use relacs_dynclamp::rtloop::{LoopConfig, RtTask};
use relacs_dynclamp::status::LoopStatus;
use relacs_hardware::config::{DeviceEntryConfig, HardwareConfig};
use relacs_hardware::device::DeviceHandle;
use relacs_hardware::registry::DeviceRegistry;

use crate::drain::{drain_once, DrainHandle};
use crate::planner::{AcquisitionPlan, Planner, WriteOutcome};

/// Builds device handles from configuration entries.
///
/// Driver crates implement this for their hardware; the context wires the
/// resulting handles into the registry.
pub trait DeviceFactory {
    fn create(&self, entry: &DeviceEntryConfig) -> Result<DeviceHandle>;
}

/// The per-experiment context.
pub struct AcquisitionContext {
    planner: Planner,
    drain: Option<DrainHandle>,
    task: Option<RtTask>,
}

impl AcquisitionContext {
    /// Initialize around an already-built device registry.
    pub fn init(registry: DeviceRegistry) -> Self {
        let module = Arc::new(RtModule::new());
        Self {
            planner: Planner::new(registry, module),
            drain: None,
            task: None,
        }
    }

    /// Initialize from a hardware configuration and a driver factory.
    pub fn from_config(config: &HardwareConfig, factory: &dyn DeviceFactory) -> Result<Self> {
        let mut registry = DeviceRegistry::new();
        for entry in &config.devices {
            let handle = factory.create(entry)?;
            registry.register(entry.name.clone(), handle)?;
        }
        Ok(Self::init(registry))
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    pub fn planner_mut(&mut self) -> &mut Planner {
        &mut self.planner
    }

    pub fn module(&self) -> Arc<RtModule> {
        Arc::clone(self.planner.module())
    }

    /// Latest loop status snapshot.
    pub fn status(&self) -> LoopStatus {
        self.planner.module().status_snapshot()
    }

    /// Loop-level configuration; call before the first acquisition to set
    /// timing counters or the timer mode.
    pub fn configure_loop(&self, config: LoopConfig) -> Result<()> {
        self.planner.module().configure_loop(config)
    }

    /// Start a continuous acquisition and its drain thread.
    pub fn start_acquisition(&mut self, plan: &AcquisitionPlan) -> Result<InList> {
        if let Some(drain) = self.drain.take() {
            drain.stop();
        }
        let in_list = self.planner.prepare_acquisition(plan)?;
        let fifo = self
            .planner
            .ai_fifo()
            .ok_or_else(|| relacs_core::DaqError::NoData("no acquisition".into()))?;
        let chanlist = self
            .planner
            .ai_chanlist()
            .cloned()
            .ok_or_else(|| relacs_core::DaqError::NoData("no acquisition".into()))?;
        self.drain = Some(DrainHandle::spawn(
            fifo,
            chanlist,
            in_list.clone(),
            self.planner.module().status(),
        ));
        Ok(in_list)
    }

    /// Start an acquisition without a drain thread; the caller steps the
    /// loop and calls [`AcquisitionContext::drain_now`] (deterministic tests).
    pub fn start_acquisition_manual(&mut self, plan: &AcquisitionPlan) -> Result<InList> {
        self.planner.prepare_acquisition(plan)
    }

    /// Synchronously drain queued AI frames into the `InData` buffers.
    pub fn drain_now(&self) {
        if let (Some(fifo), Some(chanlist), Some(in_list)) = (
            self.planner.ai_fifo(),
            self.planner.ai_chanlist(),
            self.planner.in_list(),
        ) {
            drain_once(&fifo, chanlist, in_list, &self.planner.module().status());
        }
    }

    /// Submit output signals.
    pub fn write(&mut self, list: &mut OutList) -> Result<WriteOutcome> {
        self.planner.write(list)
    }

    /// Spawn the loop task thread (threaded mode).
    pub fn spawn_task(&mut self) -> Result<()> {
        if self.task.is_some() {
            return Ok(());
        }
        let mut task = RtTask::new(self.planner.module().engine());
        task.spawn()?;
        self.task = Some(task);
        Ok(())
    }

    /// Step the loop engine `n` cycles at its nominal period
    /// (deterministic mode; do not mix with a spawned task).
    pub fn step_cycles(&self, n: u64) -> Result<()> {
        self.planner.module().engine().lock().step_cycles(n)
    }

    /// Stop outputs, acquisition, loop, and drain. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        self.planner.stop()?;
        if let Some(mut task) = self.task.take() {
            task.stop();
        }
        if let Some(drain) = self.drain.take() {
            drain.stop();
        }
        Ok(())
    }

    /// Tear the context down: stop everything and close all devices.
    pub fn teardown(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "stop during teardown failed");
        }
        self.planner.registry().close_all();
        info!("acquisition context torn down");
    }
}

impl Drop for AcquisitionContext {
    fn drop(&mut self) {
        if self.task.is_some() || self.drain.is_some() {
            self.teardown();
        }
    }
}
