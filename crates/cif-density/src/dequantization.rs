//! Uniform dequantization.
//!
//! Continuous densities are ill-defined on lattice-valued data. Adding `u ~ U[0, 1)` to every
//! element before evaluating the inner objective turns it into a lower bound on the discrete
//! log-likelihood.

use cif_core::{Batch, Density, Mode, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::wrapper::{DensityLayer, WrapperDensity};

/// Layer adding uniform noise to the objective input, in place.
pub struct Dequantize {
    rng: StdRng,
}

impl Dequantize {
    /// Noise seeded from the operating system.
    pub fn new() -> Self {
        Self { rng: StdRng::from_os_rng() }
    }

    /// Reproducible noise stream.
    pub fn with_seed(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }
}

impl Default for Dequantize {
    fn default() -> Self {
        Self::new()
    }
}

impl DensityLayer for Dequantize {
    fn name(&self) -> &str {
        "dequantization"
    }

    fn evaluate_objective(
        &mut self,
        inner: &mut dyn Density,
        batch: &mut Batch,
        path: Mode,
    ) -> Result<Vec<f64>> {
        for x in batch.as_mut_slice() {
            *x += self.rng.random::<f64>();
        }
        inner.evaluate_objective_in(batch, path)
    }
}

/// Density whose objective sees dequantized input. The caller's batch is modified.
pub type DequantizationDensity = WrapperDensity<Dequantize>;

impl WrapperDensity<Dequantize> {
    /// Wrap `inner` with OS-seeded dequantization noise.
    pub fn new(inner: Box<dyn Density>) -> Self {
        Self::with_layer(Dequantize::new(), inner)
    }

    /// Wrap `inner` with a reproducible noise stream.
    pub fn seeded(inner: Box<dyn Density>, seed: u64) -> Self {
        Self::with_layer(Dequantize::with_seed(seed), inner)
    }
}
