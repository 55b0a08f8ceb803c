//! Core traits for density composition
//!
//! Every base model and every wrapper implements [`Density`], so a caller can hold a
//! single `Box<dyn Density>` regardless of how deep or in which order the stack of
//! wrappers around the base model is.

use crate::types::{Batch, Mode};
use crate::Result;

/// Capability contract shared by base models and wrappers.
///
/// Wrapping never changes the shape or meaning of these operations, only what happens
/// around them.
pub trait Density: Send {
    /// Short identifier used in logs and by [`composition_names`].
    fn name(&self) -> &str;

    /// Current mode of this density.
    fn mode(&self) -> Mode;

    /// Switch mode, recursively for every nested component.
    fn set_mode(&mut self, mode: Mode) -> Result<()>;

    /// Per-example objective (an ELBO) taking the code path selected by `path`.
    ///
    /// The result has one entry per row of `batch`. Layers may modify `batch` in place.
    fn evaluate_objective_in(&mut self, batch: &mut Batch, path: Mode) -> Result<Vec<f64>>;

    /// Per-example objective on the code path of the current mode.
    fn evaluate_objective(&mut self, batch: &mut Batch) -> Result<Vec<f64>> {
        let path = self.mode();
        self.evaluate_objective_in(batch, path)
    }

    /// Draw `count` fresh examples.
    fn generate(&mut self, count: usize) -> Result<Batch>;

    /// Examples determined solely by `noise` (one example per noise row).
    fn generate_deterministic(&mut self, noise: &Batch) -> Result<Batch>;

    /// Constrained submodules owned by this density or anything it wraps.
    fn constrained_submodules(&mut self) -> Vec<&mut dyn ConstrainedSubmodule> {
        Vec::new()
    }

    /// The density wrapped by this one, if any.
    fn inner(&self) -> Option<&dyn Density> {
        None
    }
}

/// Result of recomputing a Lipschitz constant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RefreshOutcome {
    /// A new constant was computed and cached.
    Converged {
        /// Newly cached constant.
        constant: f64,
        /// Iterations used.
        iterations: usize,
    },
    /// The budget ran out; the previously cached constant stays in use.
    Stale {
        /// Constant still cached.
        constant: f64,
        /// Iterations used.
        iterations: usize,
    },
}

impl RefreshOutcome {
    /// Constant cached after the refresh.
    pub fn constant(&self) -> f64 {
        match *self {
            RefreshOutcome::Converged { constant, .. } | RefreshOutcome::Stale { constant, .. } => {
                constant
            }
        }
    }

    /// `true` if the refresh converged.
    pub fn converged(&self) -> bool {
        matches!(self, RefreshOutcome::Converged { .. })
    }
}

/// Nested component whose Lipschitz constant must be recomputed from its current
/// parameters before use.
///
/// The cached constant is written only by [`refresh_lipschitz_constant`] and read by the
/// component's own forward computation.
///
/// [`refresh_lipschitz_constant`]: ConstrainedSubmodule::refresh_lipschitz_constant
pub trait ConstrainedSubmodule: Send {
    /// Currently cached constant.
    fn lipschitz_constant(&self) -> f64;

    /// Recompute the constant. Best effort: never fails, reports staleness instead.
    fn refresh_lipschitz_constant(&mut self) -> RefreshOutcome;
}

/// Names of every layer of a composition, outermost first.
pub fn composition_names(density: &dyn Density) -> Vec<String> {
    let mut names = vec![density.name().to_string()];
    let mut current = density.inner();
    while let Some(d) = current {
        names.push(d.name().to_string());
        current = d.inner();
    }
    names
}
