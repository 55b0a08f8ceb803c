//! Statistic warm-up on the transition to evaluation mode.
//!
//! Some base models keep running statistics (e.g. batch-norm moments) that are only
//! advanced on the training code path. Before such a model is switched to
//! [`Mode::Eval`], this layer pushes a fixed reference batch through the inner objective
//! on the training path, then performs the real recursive mode switch:
//!
//! 1. `inner.evaluate_objective_in(reference.clone(), Mode::Train)`, result discarded;
//! 2. `inner.set_mode(Mode::Eval)`.
//!
//! The training path is requested explicitly, so no component is ever left in a
//! temporarily inconsistent mode. Switching to [`Mode::Train`] is a plain propagated
//! transition. Every switch to `Eval` warms up again, even if already in `Eval`.

use cif_core::{Batch, Density, Error, Mode, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::wrapper::{DensityLayer, WrapperDensity};

/// Whether the reference batch may change after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferencePolicy {
    /// Fixed for the wrapper's lifetime.
    #[default]
    Frozen,
    /// May be replaced between transitions via [`WarmupBeforeEval::replace_reference`].
    Replaceable,
}

/// Layer running one training-path objective pass before every switch to `Eval`.
#[derive(Debug, Clone)]
pub struct WarmupBeforeEval {
    reference: Batch,
    policy: ReferencePolicy,
    warmups: u64,
}

impl WarmupBeforeEval {
    /// Warm up with `reference`, frozen.
    pub fn new(reference: Batch) -> Self {
        Self::with_policy(reference, ReferencePolicy::Frozen)
    }

    /// Warm up with `reference` under an explicit policy.
    pub fn with_policy(reference: Batch, policy: ReferencePolicy) -> Self {
        Self { reference, policy, warmups: 0 }
    }

    /// Draw a reference batch of `min(max_points, n_rows)` random rows from `data`.
    pub fn subsample(
        data: &Batch,
        max_points: usize,
        policy: ReferencePolicy,
        seed: Option<u64>,
    ) -> Result<Self> {
        let amount = max_points.min(data.n_rows());
        let mut rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_os_rng(),
        };
        let indices = rand::seq::index::sample(&mut rng, data.n_rows(), amount).into_vec();
        Ok(Self::with_policy(data.select_rows(&indices)?, policy))
    }

    /// The reference batch.
    pub fn reference(&self) -> &Batch {
        &self.reference
    }

    /// Reference policy in effect.
    pub fn policy(&self) -> ReferencePolicy {
        self.policy
    }

    /// Number of warm-up passes run so far.
    pub fn warmup_count(&self) -> u64 {
        self.warmups
    }

    /// Install a new reference batch. Rejected under [`ReferencePolicy::Frozen`].
    pub fn replace_reference(&mut self, reference: Batch) -> Result<()> {
        match self.policy {
            ReferencePolicy::Frozen => Err(Error::ContractViolation(
                "reference batch is frozen for the lifetime of the wrapper".into(),
            )),
            ReferencePolicy::Replaceable => {
                if !self.reference.is_empty() && reference.n_cols() != self.reference.n_cols() {
                    return Err(Error::ContractViolation(format!(
                        "replacement reference has {} columns, expected {}",
                        reference.n_cols(),
                        self.reference.n_cols()
                    )));
                }
                self.reference = reference;
                Ok(())
            }
        }
    }
}

impl DensityLayer for WarmupBeforeEval {
    fn name(&self) -> &str {
        "passthrough-before-eval"
    }

    fn set_mode(&mut self, inner: &mut dyn Density, mode: Mode) -> Result<()> {
        if mode == Mode::Eval {
            // Inner layers may modify their input in place.
            let mut reference = self.reference.clone();
            inner.evaluate_objective_in(&mut reference, Mode::Train)?;
            self.warmups += 1;
            log::debug!(
                "warm-up pass #{} over {} reference rows before eval",
                self.warmups,
                self.reference.n_rows()
            );
        }
        inner.set_mode(mode)
    }
}

/// Density that warms inner running statistics before entering evaluation mode.
pub type ModeAwareWarmupDensity = WrapperDensity<WarmupBeforeEval>;

impl WrapperDensity<WarmupBeforeEval> {
    /// Wrap `inner` with a frozen reference batch.
    pub fn new(inner: Box<dyn Density>, reference: Batch) -> Self {
        Self::with_layer(WarmupBeforeEval::new(reference), inner)
    }

    /// Number of warm-up passes run so far.
    pub fn warmup_count(&self) -> u64 {
        self.layer().warmup_count()
    }
}
