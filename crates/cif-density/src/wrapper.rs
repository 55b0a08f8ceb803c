//! Base decorator for densities.
//!
//! A [`WrapperDensity`] owns exactly one inner density and a [`DensityLayer`] value. Every
//! hook on the layer defaults to plain delegation, so a layer overrides only the
//! operations it changes and everything else behaves exactly like the inner density.

use cif_core::{Batch, ConstrainedSubmodule, Density, Mode, Result};

/// Behavior injected by a [`WrapperDensity`] around its inner density.
pub trait DensityLayer: Send {
    /// Layer identifier, reported as the wrapper's [`Density::name`].
    fn name(&self) -> &str;

    /// Hook for [`Density::evaluate_objective_in`].
    fn evaluate_objective(
        &mut self,
        inner: &mut dyn Density,
        batch: &mut Batch,
        path: Mode,
    ) -> Result<Vec<f64>> {
        inner.evaluate_objective_in(batch, path)
    }

    /// Hook for [`Density::generate`].
    fn generate(&mut self, inner: &mut dyn Density, count: usize) -> Result<Batch> {
        inner.generate(count)
    }

    /// Hook for [`Density::generate_deterministic`].
    fn generate_deterministic(&mut self, inner: &mut dyn Density, noise: &Batch) -> Result<Batch> {
        inner.generate_deterministic(noise)
    }

    /// Hook for [`Density::set_mode`]. Implementations must propagate to `inner`.
    fn set_mode(&mut self, inner: &mut dyn Density, mode: Mode) -> Result<()> {
        inner.set_mode(mode)
    }
}

/// Layer that overrides nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl DensityLayer for Passthrough {
    fn name(&self) -> &str {
        "wrapper"
    }
}

/// Decorator holding one owned inner density.
pub struct WrapperDensity<L> {
    layer: L,
    inner: Box<dyn Density>,
}

impl<L: DensityLayer> WrapperDensity<L> {
    /// Wrap `inner` with `layer`.
    pub fn with_layer(layer: L, inner: Box<dyn Density>) -> Self {
        Self { layer, inner }
    }

    /// The injected layer.
    pub fn layer(&self) -> &L {
        &self.layer
    }

    /// Mutable access to the injected layer.
    pub fn layer_mut(&mut self) -> &mut L {
        &mut self.layer
    }

    /// The wrapped density.
    pub fn inner_density(&self) -> &dyn Density {
        self.inner.as_ref()
    }

    /// Unwrap, returning the layer and the inner density.
    pub fn into_parts(self) -> (L, Box<dyn Density>) {
        (self.layer, self.inner)
    }
}

impl WrapperDensity<Passthrough> {
    /// Fully transparent wrapper.
    pub fn new(inner: Box<dyn Density>) -> Self {
        Self::with_layer(Passthrough, inner)
    }
}

impl<L: DensityLayer> Density for WrapperDensity<L> {
    fn name(&self) -> &str {
        self.layer.name()
    }

    fn mode(&self) -> Mode {
        self.inner.mode()
    }

    fn set_mode(&mut self, mode: Mode) -> Result<()> {
        self.layer.set_mode(self.inner.as_mut(), mode)
    }

    fn evaluate_objective_in(&mut self, batch: &mut Batch, path: Mode) -> Result<Vec<f64>> {
        self.layer.evaluate_objective(self.inner.as_mut(), batch, path)
    }

    fn generate(&mut self, count: usize) -> Result<Batch> {
        self.layer.generate(self.inner.as_mut(), count)
    }

    fn generate_deterministic(&mut self, noise: &Batch) -> Result<Batch> {
        self.layer.generate_deterministic(self.inner.as_mut(), noise)
    }

    fn constrained_submodules(&mut self) -> Vec<&mut dyn ConstrainedSubmodule> {
        self.inner.constrained_submodules()
    }

    fn inner(&self) -> Option<&dyn Density> {
        Some(self.inner.as_ref())
    }
}
