//! Shared fixtures for cif-density integration tests.

#![allow(dead_code)]

use cif_core::{Batch, ConstrainedSubmodule, Density, Mode, Result};
use cif_density::SpectralNormConstraint;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};

/// Single residual block with batch-norm style centering.
///
/// `score(x) = -½‖z + scale·W z‖²` with `z = x - μ`, where `μ` is the batch mean on the
/// training path and the running mean on the eval path. The training path also stores the
/// batch mean as the new running mean.
pub struct ResidualFlow {
    n_cols: usize,
    mode: Mode,
    running_mean: Vec<f64>,
    block: SpectralNormConstraint,
    rng: StdRng,
    pub train_passes: usize,
}

impl ResidualFlow {
    pub fn new(n_cols: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let weight: Vec<f64> =
            (0..n_cols * n_cols).map(|_| StandardNormal.sample(&mut rng)).collect();
        let block = SpectralNormConstraint::with_seed(n_cols, n_cols, weight, 0.9, seed)
            .expect("valid block");
        Self {
            n_cols,
            mode: Mode::Train,
            running_mean: vec![0.0; n_cols],
            block,
            rng,
            train_passes: 0,
        }
    }

    pub fn running_mean(&self) -> &[f64] {
        &self.running_mean
    }

    pub fn block(&self) -> &SpectralNormConstraint {
        &self.block
    }

    fn score_row(&self, row: &[f64], centre: &[f64]) -> Result<f64> {
        let z: Vec<f64> = row.iter().zip(centre).map(|(x, m)| x - m).collect();
        let mut wz = vec![0.0; self.n_cols];
        self.block.forward(&z, &mut wz)?;
        Ok(-0.5 * z.iter().zip(&wz).map(|(a, b)| (a + b).powi(2)).sum::<f64>())
    }
}

impl Density for ResidualFlow {
    fn name(&self) -> &str {
        "residual-flow"
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
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let centre = if path.is_train() {
            let n = batch.n_rows() as f64;
            let mean: Vec<f64> =
                (0..self.n_cols).map(|j| batch.rows().map(|r| r[j]).sum::<f64>() / n).collect();
            self.running_mean = mean.clone();
            self.train_passes += 1;
            mean
        } else {
            self.running_mean.clone()
        };
        batch.rows().map(|row| self.score_row(row, &centre)).collect()
    }

    fn generate(&mut self, count: usize) -> Result<Batch> {
        let noise: Vec<f64> =
            (0..count * self.n_cols).map(|_| StandardNormal.sample(&mut self.rng)).collect();
        let noise = Batch::from_flat(count, self.n_cols, noise)?;
        self.generate_deterministic(&noise)
    }

    fn generate_deterministic(&mut self, noise: &Batch) -> Result<Batch> {
        noise.expect_cols(self.n_cols)?;
        let mut out = noise.clone();
        for row in out.as_mut_slice().chunks_mut(self.n_cols) {
            for (x, m) in row.iter_mut().zip(&self.running_mean) {
                *x += m;
            }
        }
        Ok(out)
    }

    fn constrained_submodules(&mut self) -> Vec<&mut dyn ConstrainedSubmodule> {
        vec![&mut self.block as &mut dyn ConstrainedSubmodule]
    }
}

/// Row `i` is `[i, i + 0.5, ...]`, integer-valued in the first column.
pub fn indexed_batch(n_rows: usize, n_cols: usize) -> Batch {
    let data = (0..n_rows)
        .flat_map(|i| (0..n_cols).map(move |j| i as f64 + 0.5 * j as f64))
        .collect();
    Batch::from_flat(n_rows, n_cols, data).expect("consistent shape")
}
