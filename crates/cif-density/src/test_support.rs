//! Instrumented base densities for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cif_core::{Batch, ConstrainedSubmodule, Density, Error, Mode, RefreshOutcome, Result};

/// Shared observation handles, cloned before the density is boxed.
#[derive(Clone, Default)]
pub(crate) struct Probe {
    /// Training-path objective calls (running-statistic updates).
    pub stat_updates: Arc<AtomicUsize>,
    /// Every batch that reached the base density's objective.
    pub inputs: Arc<Mutex<Vec<Batch>>>,
    /// Constants read by the forward pass, one entry per objective call.
    pub constants_seen: Arc<Mutex<Vec<Vec<f64>>>>,
    /// Total refreshes across all constraints.
    pub refreshes: Arc<AtomicUsize>,
}

impl Probe {
    pub fn stat_updates(&self) -> usize {
        self.stat_updates.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn last_input(&self) -> Option<Batch> {
        self.inputs.lock().unwrap().last().cloned()
    }
}

/// Constraint whose recomputed constant is the global refresh counter value.
pub(crate) struct CountingConstraint {
    refreshes: Arc<AtomicUsize>,
    constant: f64,
    converges: bool,
}

impl ConstrainedSubmodule for CountingConstraint {
    fn lipschitz_constant(&self) -> f64 {
        self.constant
    }

    fn refresh_lipschitz_constant(&mut self) -> RefreshOutcome {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.converges {
            self.constant = n as f64;
            RefreshOutcome::Converged { constant: self.constant, iterations: 1 }
        } else {
            RefreshOutcome::Stale { constant: self.constant, iterations: 10 }
        }
    }
}

/// Base model with `score(x) = -sum(x)` and a column-mean running statistic that is
/// updated only on the training code path.
pub(crate) struct SumDensity {
    n_cols: usize,
    mode: Mode,
    running_mean: Vec<f64>,
    generated: usize,
    constraints: Vec<CountingConstraint>,
    probe: Probe,
}

impl SumDensity {
    pub fn new(n_cols: usize) -> Self {
        Self::with_probe(n_cols, Probe::default())
    }

    pub fn with_probe(n_cols: usize, probe: Probe) -> Self {
        Self {
            n_cols,
            mode: Mode::Train,
            running_mean: vec![0.0; n_cols],
            generated: 0,
            constraints: Vec::new(),
            probe,
        }
    }

    pub fn with_constraints(mut self, n: usize, converges: bool) -> Self {
        for _ in 0..n {
            self.constraints.push(CountingConstraint {
                refreshes: Arc::clone(&self.probe.refreshes),
                constant: 0.0,
                converges,
            });
        }
        self
    }
}

impl Density for SumDensity {
    fn name(&self) -> &str {
        "sum"
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn set_mode(&mut self, mode: Mode) -> Result<()> {
        self.mode = mode;
        Ok(())
    }

    fn evaluate_objective_in(&mut self, batch: &mut Batch, path: Mode) -> Result<Vec<f64>> {
        batch.expect_cols(self.n_cols)?;
        self.probe.inputs.lock().unwrap().push(batch.clone());
        self.probe
            .constants_seen
            .lock()
            .unwrap()
            .push(self.constraints.iter().map(|c| c.lipschitz_constant()).collect());

        if path.is_train() && !batch.is_empty() {
            self.probe.stat_updates.fetch_add(1, Ordering::SeqCst);
            let n = batch.n_rows() as f64;
            for (j, m) in self.running_mean.iter_mut().enumerate() {
                *m = batch.rows().map(|r| r[j]).sum::<f64>() / n;
            }
        }
        Ok(batch.rows().map(|r| -r.iter().sum::<f64>()).collect())
    }

    fn generate(&mut self, count: usize) -> Result<Batch> {
        let mut data = Vec::with_capacity(count * self.n_cols);
        for _ in 0..count {
            self.generated += 1;
            data.extend(std::iter::repeat_n(self.generated as f64, self.n_cols));
        }
        Batch::from_flat(count, self.n_cols, data)
    }

    fn generate_deterministic(&mut self, noise: &Batch) -> Result<Batch> {
        noise.expect_cols(self.n_cols)?;
        let mut out = noise.clone();
        for row in out.as_mut_slice().chunks_mut(self.n_cols.max(1)) {
            for (x, m) in row.iter_mut().zip(&self.running_mean) {
                *x += m;
            }
        }
        Ok(out)
    }

    fn constrained_submodules(&mut self) -> Vec<&mut dyn ConstrainedSubmodule> {
        self.constraints.iter_mut().map(|c| c as &mut dyn ConstrainedSubmodule).collect()
    }
}

/// Density that supports no generation at all.
pub(crate) struct ObjectiveOnly;

impl Density for ObjectiveOnly {
    fn name(&self) -> &str {
        "objective-only"
    }

    fn mode(&self) -> Mode {
        Mode::Train
    }

    fn set_mode(&mut self, _mode: Mode) -> Result<()> {
        Ok(())
    }

    fn evaluate_objective_in(&mut self, batch: &mut Batch, _path: Mode) -> Result<Vec<f64>> {
        Ok(vec![0.0; batch.n_rows()])
    }

    fn generate(&mut self, _count: usize) -> Result<Batch> {
        Err(Error::ContractViolation("objective-only density cannot generate".into()))
    }

    fn generate_deterministic(&mut self, _noise: &Batch) -> Result<Batch> {
        Err(Error::ContractViolation("objective-only density cannot generate".into()))
    }
}
