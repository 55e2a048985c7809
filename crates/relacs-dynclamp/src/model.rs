//! In-loop dynamic-clamp models.
//!
//! When a model is enabled the loop computes each cycle's AO frame from the
//! just-read AI frame and the previous cycle's AO frame, instead of playing
//! frames from the AO FIFO. Models see physical values (the loop converts
//! counts at the chanlist calibration) and must stay free of transcendental
//! math; nonlinearities come from uploaded lookup tables.

use crate::lookup::LookupTable;

/// Integration algorithm of the model state update.
///
/// Only Euler is exercised by the shipped models; the other two are
/// accepted and treated identically for now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntegrationAlgo {
    #[default]
    Euler,
    Midpoint,
    Rk4,
}

/// Per-cycle model computation.
pub trait ClampModel: Send {
    /// Compute the AO frame for this cycle.
    ///
    /// `ai`: physical values of the AI frame just read, chanlist order.
    /// `prev_ao`: physical values of the previous cycle's AO frame.
    /// `ao`: output slot for this cycle, chanlist order.
    fn compute(&mut self, ai: &[f64], prev_ao: &[f64], ao: &mut [f64]);

    /// Reset internal state (acquisition restart).
    fn reset(&mut self) {}
}

/// Trivial model: AO channel i mirrors AI channel i (zero where AI is
/// shorter). Used to validate the loop plumbing.
#[derive(Debug, Default)]
pub struct PassThroughModel;

impl ClampModel for PassThroughModel {
    fn compute(&mut self, ai: &[f64], _prev_ao: &[f64], ao: &mut [f64]) {
        for (i, slot) in ao.iter_mut().enumerate() {
            *slot = ai.get(i).copied().unwrap_or(0.0);
        }
    }
}

/// Conductance-style clamp: the injected current on AO channel 0 is
/// `g(V) * (E - V)` with the voltage-dependent conductance `g` tabulated.
///
/// `V` is read from AI channel `voltage_channel`; the state variable is
/// integrated with the configured algorithm (Euler step in practice).
pub struct LookupClampModel {
    gate: LookupTable,
    reversal: f64,
    gain: f64,
    /// Gate time constant in seconds; zero means instantaneous.
    tau: f64,
    voltage_channel: usize,
    algo: IntegrationAlgo,
    dt: f64,
    state: f64,
}

impl LookupClampModel {
    pub fn new(
        gate: LookupTable,
        reversal: f64,
        gain: f64,
        tau: f64,
        voltage_channel: usize,
        algo: IntegrationAlgo,
        sample_rate: f64,
    ) -> Self {
        Self {
            gate,
            reversal,
            gain,
            tau,
            voltage_channel,
            algo,
            dt: 1.0 / sample_rate,
            state: 0.0,
        }
    }

    fn steady_state(&self, v: f64) -> f64 {
        self.gate.interpolate(v)
    }
}

impl ClampModel for LookupClampModel {
    fn compute(&mut self, ai: &[f64], _prev_ao: &[f64], ao: &mut [f64]) {
        let v = ai.get(self.voltage_channel).copied().unwrap_or(0.0);
        let target = self.steady_state(v);
        if self.tau > 0.0 {
            // Midpoint and RK4 collapse to Euler for this linear relaxation.
            let _ = self.algo;
            self.state += (target - self.state) * self.dt / self.tau;
        } else {
            self.state = target;
        }
        let current = self.gain * self.state * (self.reversal - v);
        if let Some(slot) = ao.first_mut() {
            *slot = current;
        }
        for slot in ao.iter_mut().skip(1) {
            *slot = 0.0;
        }
    }

    fn reset(&mut self) {
        self.state = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_through() {
        let mut model = PassThroughModel;
        let mut ao = vec![0.0; 3];
        model.compute(&[1.0, 2.0], &[9.0, 9.0, 9.0], &mut ao);
        assert_eq!(ao, vec![1.0, 2.0, 0.0]);
    }

    #[test]
    fn test_lookup_clamp_instantaneous() {
        // g(V): 0 below -50, ramping to 1 at 0 mV
        let gate = LookupTable::new(vec![-50.0, 0.0], vec![0.0, 1.0]).unwrap();
        let mut model = LookupClampModel::new(gate, 0.0, 2.0, 0.0, 0, IntegrationAlgo::Euler, 1000.0);
        let mut ao = vec![0.0];
        model.compute(&[-25.0], &[], &mut ao);
        // g = 0.5, I = 2 * 0.5 * (0 - (-25)) = 25
        assert!((ao[0] - 25.0).abs() < 1e-12);
    }

    #[test]
    fn test_lookup_clamp_relaxation() {
        let gate = LookupTable::new(vec![-100.0, 100.0], vec![1.0, 1.0]).unwrap();
        let mut model =
            LookupClampModel::new(gate, 0.0, 1.0, 0.010, 0, IntegrationAlgo::Euler, 1000.0);
        let mut ao = vec![0.0];
        model.compute(&[-10.0], &[], &mut ao);
        // one Euler step towards g=1 with dt/tau = 0.1
        assert!((ao[0] - 0.1 * 10.0).abs() < 1e-9);
        model.reset();
        model.compute(&[-10.0], &[], &mut ao);
        assert!((ao[0] - 1.0).abs() < 1e-9);
    }
}
