//! Just-in-time Lipschitz constant refresh.
//!
//! Residual maps `x ↦ x + g(x)` stay invertible only while `Lip(g) < 1`. Weights change
//! between calls, so [`RefreshConstraints`] recomputes the constant of every
//! [`ConstrainedSubmodule`] found under the inner density right before each capability
//! call, and the submodule's forward pass consumes the freshly cached value.
//!
//! Refresh is best effort. A submodule whose estimate does not converge keeps its previous
//! constant; nothing is raised.

use cif_core::{Batch, ConstrainedSubmodule, Density, Error, Mode, RefreshOutcome, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;

use crate::wrapper::{DensityLayer, WrapperDensity};

/// Default power-iteration budget.
pub const DEFAULT_MAX_ITERATIONS: usize = 100;
/// Default relative tolerance between successive spectral-norm estimates.
pub const DEFAULT_TOLERANCE: f64 = 1e-6;

/// Layer refreshing every constrained submodule before each capability call.
#[derive(Debug, Clone, Default)]
pub struct RefreshConstraints {
    refreshes: u64,
    stale: u64,
}

impl RefreshConstraints {
    /// New layer with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total submodule refreshes performed.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes
    }

    /// Refreshes that did not converge and left a stale constant in place.
    pub fn stale_count(&self) -> u64 {
        self.stale
    }

    fn refresh(&mut self, inner: &mut dyn Density) {
        let outcomes: Vec<RefreshOutcome> = inner
            .constrained_submodules()
            .into_par_iter()
            .map(|m| m.refresh_lipschitz_constant())
            .collect();

        for outcome in &outcomes {
            if let RefreshOutcome::Stale { constant, iterations } = *outcome {
                self.stale += 1;
                log::debug!(
                    "Lipschitz refresh did not converge after {iterations} iterations; \
                     keeping stale constant {constant}"
                );
            }
        }
        self.refreshes += outcomes.len() as u64;
    }
}

impl DensityLayer for RefreshConstraints {
    fn name(&self) -> &str {
        "update-lipschitz-before-forward"
    }

    fn evaluate_objective(
        &mut self,
        inner: &mut dyn Density,
        batch: &mut Batch,
        path: Mode,
    ) -> Result<Vec<f64>> {
        self.refresh(inner);
        inner.evaluate_objective_in(batch, path)
    }

    fn generate(&mut self, inner: &mut dyn Density, count: usize) -> Result<Batch> {
        self.refresh(inner);
        inner.generate(count)
    }

    fn generate_deterministic(&mut self, inner: &mut dyn Density, noise: &Batch) -> Result<Batch> {
        self.refresh(inner);
        inner.generate_deterministic(noise)
    }
}

/// Density that refreshes nested Lipschitz constants before every call.
pub type ConstraintRefreshDensity = WrapperDensity<RefreshConstraints>;

impl WrapperDensity<RefreshConstraints> {
    /// Wrap `inner`.
    pub fn new(inner: Box<dyn Density>) -> Self {
        Self::with_layer(RefreshConstraints::new(), inner)
    }

    /// Total submodule refreshes performed.
    pub fn refresh_count(&self) -> u64 {
        self.layer().refresh_count()
    }
}

/// Linear map `W` (`n_out × n_in`) rescaled to a target Lipschitz bound.
///
/// The spectral norm `σ(W)` is estimated by power iteration on `WᵀW`, warm-started from
/// the previous iterate. The forward pass computes `min(1, c / σ) · W x`, so the map has
/// Lipschitz constant at most `c` whenever `σ` is a good estimate.
#[derive(Debug, Clone)]
pub struct SpectralNormConstraint {
    n_out: usize,
    n_in: usize,
    weight: Vec<f64>,
    target: f64,
    sigma: f64,
    v: Vec<f64>,
    max_iterations: usize,
    tolerance: f64,
}

impl SpectralNormConstraint {
    /// Create from a row-major weight. `target` is the Lipschitz bound `c`.
    ///
    /// The cached estimate starts at the Frobenius norm, an upper bound on `σ(W)`.
    pub fn new(n_out: usize, n_in: usize, weight: Vec<f64>, target: f64) -> Result<Self> {
        Self::with_seed(n_out, n_in, weight, target, 0)
    }

    /// As [`new`](Self::new) with an explicit seed for the power-iteration start vector.
    pub fn with_seed(
        n_out: usize,
        n_in: usize,
        weight: Vec<f64>,
        target: f64,
        seed: u64,
    ) -> Result<Self> {
        if n_out == 0 || n_in == 0 {
            return Err(Error::Validation(format!(
                "SpectralNormConstraint needs a non-empty weight, got {n_out}x{n_in}"
            )));
        }
        if weight.len() != n_out * n_in {
            return Err(Error::Validation(format!(
                "weight length mismatch: expected {}, got {}",
                n_out * n_in,
                weight.len()
            )));
        }
        if !target.is_finite() || target <= 0.0 {
            return Err(Error::Validation(format!(
                "Lipschitz target must be finite and > 0, got {target}"
            )));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut v: Vec<f64> = (0..n_in).map(|_| StandardNormal.sample(&mut rng)).collect();
        normalize(&mut v);
        let sigma = weight.iter().map(|w| w * w).sum::<f64>().sqrt();

        Ok(Self {
            n_out,
            n_in,
            weight,
            target,
            sigma,
            v,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tolerance: DEFAULT_TOLERANCE,
        })
    }

    /// Override the power-iteration budget and tolerance.
    pub fn with_budget(mut self, max_iterations: usize, tolerance: f64) -> Self {
        self.max_iterations = max_iterations;
        self.tolerance = tolerance;
        self
    }

    /// Install new parameters. The cached constant is not touched until the next refresh.
    pub fn set_weight(&mut self, weight: Vec<f64>) -> Result<()> {
        if weight.len() != self.n_out * self.n_in {
            return Err(Error::Validation(format!(
                "weight length mismatch: expected {}, got {}",
                self.n_out * self.n_in,
                weight.len()
            )));
        }
        self.weight = weight;
        Ok(())
    }

    /// Row-major weight.
    pub fn weight(&self) -> &[f64] {
        &self.weight
    }

    /// Target bound `c`.
    pub fn target(&self) -> f64 {
        self.target
    }

    /// Scale applied to `W` in the forward pass.
    pub fn scale(&self) -> f64 {
        if self.sigma > self.target { self.target / self.sigma } else { 1.0 }
    }

    /// `out = scale · W x`.
    pub fn forward(&self, x: &[f64], out: &mut [f64]) -> Result<()> {
        if x.len() != self.n_in || out.len() != self.n_out {
            return Err(Error::ContractViolation(format!(
                "SpectralNormConstraint expects input {} / output {}, got {} / {}",
                self.n_in,
                self.n_out,
                x.len(),
                out.len()
            )));
        }
        let scale = self.scale();
        for (o, row) in out.iter_mut().zip(self.weight.chunks_exact(self.n_in)) {
            *o = scale * dot(row, x);
        }
        Ok(())
    }

    fn apply_gram(&self, v: &[f64]) -> Vec<f64> {
        let wv: Vec<f64> = self.weight.chunks_exact(self.n_in).map(|row| dot(row, v)).collect();
        let mut out = vec![0.0; self.n_in];
        for (row, &s) in self.weight.chunks_exact(self.n_in).zip(&wv) {
            for (o, &w) in out.iter_mut().zip(row) {
                *o += w * s;
            }
        }
        out
    }
}

impl ConstrainedSubmodule for SpectralNormConstraint {
    fn lipschitz_constant(&self) -> f64 {
        self.sigma
    }

    fn refresh_lipschitz_constant(&mut self) -> RefreshOutcome {
        let mut estimate = f64::NAN;
        for iteration in 1..=self.max_iterations {
            let mut next = self.apply_gram(&self.v);
            // ||WᵀW v|| with unit v converges to σ².
            let norm = normalize(&mut next);
            if !norm.is_finite() || norm == 0.0 {
                return RefreshOutcome::Stale { constant: self.sigma, iterations: iteration };
            }
            self.v = next;
            let sigma = norm.sqrt();
            if (sigma - estimate).abs() <= self.tolerance * sigma {
                self.sigma = sigma;
                return RefreshOutcome::Converged { constant: sigma, iterations: iteration };
            }
            estimate = sigma;
        }
        RefreshOutcome::Stale { constant: self.sigma, iterations: self.max_iterations }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Normalize in place, returning the original Euclidean norm.
fn normalize(v: &mut [f64]) -> f64 {
    let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    norm
}
