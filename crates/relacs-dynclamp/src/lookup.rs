//! Lookup tables for the in-loop model.
//!
//! The loop task must not call transcendental math on the hot path, so
//! nonlinearities are tabulated: user space computes X/Y breakpoint arrays
//! and uploads them through the control plane (select table k, announce the
//! size, then transfer X and Y). Evaluation is a binary search plus linear
//! interpolation, clamped at the table ends.

use relacs_core::{DaqError, Result};

/// Maximum number of lookup tables the module accepts.
pub const MAX_LOOKUP_TABLES: usize = 100;

/// One tabulated nonlinearity.
#[derive(Debug, Clone, Default)]
pub struct LookupTable {
    x: Vec<f64>,
    y: Vec<f64>,
}

impl LookupTable {
    /// Build from breakpoint arrays; `x` must be strictly increasing and
    /// the arrays equally long.
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> Result<Self> {
        if x.len() != y.len() {
            return Err(DaqError::Config(format!(
                "lookup table arrays differ in length: {} vs {}",
                x.len(),
                y.len()
            )));
        }
        if x.len() < 2 {
            return Err(DaqError::Config(
                "lookup table needs at least two breakpoints".into(),
            ));
        }
        if x.windows(2).any(|w| w[1] <= w[0]) {
            return Err(DaqError::Config(
                "lookup table abscissae must be strictly increasing".into(),
            ));
        }
        Ok(Self { x, y })
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Interpolate at `x`, clamping outside the tabulated span.
    pub fn interpolate(&self, x: f64) -> f64 {
        let n = self.x.len();
        if x <= self.x[0] {
            return self.y[0];
        }
        if x >= self.x[n - 1] {
            return self.y[n - 1];
        }
        // partition_point: first index with x[i] > x
        let hi = self.x.partition_point(|&v| v <= x);
        let lo = hi - 1;
        let t = (x - self.x[lo]) / (self.x[hi] - self.x[lo]);
        self.y[lo] + t * (self.y[hi] - self.y[lo])
    }
}

/// Staged upload state of one table slot.
#[derive(Debug, Clone, Default)]
struct Staged {
    announced: usize,
    x: Option<Vec<f64>>,
    y: Option<Vec<f64>>,
}

/// The module's table bank with the staged upload protocol.
#[derive(Debug, Default)]
pub struct LookupTables {
    tables: Vec<Option<LookupTable>>,
    selected: usize,
    staged: Staged,
}

impl LookupTables {
    pub fn new() -> Self {
        Self {
            tables: Vec::new(),
            selected: 0,
            staged: Staged::default(),
        }
    }

    /// Select table slot `k` for the following upload steps.
    pub fn select(&mut self, k: usize) -> Result<()> {
        if k >= MAX_LOOKUP_TABLES {
            return Err(DaqError::Config(format!(
                "lookup table index {k} exceeds maximum {MAX_LOOKUP_TABLES}"
            )));
        }
        self.selected = k;
        self.staged = Staged::default();
        Ok(())
    }

    /// Announce the breakpoint count of the pending upload.
    pub fn announce_size(&mut self, n: usize) {
        self.staged.announced = n;
        self.staged.x = None;
        self.staged.y = None;
    }

    /// Transfer the X array; completes the table if Y already arrived.
    pub fn set_x(&mut self, x: Vec<f64>) -> Result<()> {
        if x.len() != self.staged.announced {
            return Err(DaqError::Config(format!(
                "lookup X array has {} entries, {} announced",
                x.len(),
                self.staged.announced
            )));
        }
        self.staged.x = Some(x);
        self.try_complete()
    }

    /// Transfer the Y array; completes the table if X already arrived.
    pub fn set_y(&mut self, y: Vec<f64>) -> Result<()> {
        if y.len() != self.staged.announced {
            return Err(DaqError::Config(format!(
                "lookup Y array has {} entries, {} announced",
                y.len(),
                self.staged.announced
            )));
        }
        self.staged.y = Some(y);
        self.try_complete()
    }

    fn try_complete(&mut self) -> Result<()> {
        if let (Some(x), Some(y)) = (self.staged.x.take(), self.staged.y.take()) {
            let table = LookupTable::new(x, y)?;
            if self.tables.len() <= self.selected {
                self.tables.resize_with(self.selected + 1, || None);
            }
            self.tables[self.selected] = Some(table);
            self.staged = Staged::default();
        } else {
            // put back whatever half arrived
            if self.staged.x.is_none() && self.staged.y.is_none() {
                return Ok(());
            }
        }
        Ok(())
    }

    pub fn get(&self, k: usize) -> Option<&LookupTable> {
        self.tables.get(k).and_then(Option::as_ref)
    }

    /// Number of completed tables.
    pub fn completed(&self) -> usize {
        self.tables.iter().filter(|t| t.is_some()).count()
    }
}
