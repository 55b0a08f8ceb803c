//! # cif-density
//!
//! Decorator layers for density estimators.
//!
//! Every layer wraps one inner [`Density`](cif_core::Density) and is itself a `Density`,
//! so layers compose in any order around a base model:
//! - [`DequantizationDensity`]: uniform noise on the objective input.
//! - [`ModeAwareWarmupDensity`]: one training-path objective pass before entering eval.
//! - [`ConstraintRefreshDensity`]: Lipschitz constants recomputed before every call.
//! - [`ReplicatedDensity`]: the objective split across devices, generation on the primary.
//!
//! [`RunConfig`] and [`build_density`] assemble a stack from a run configuration.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod dequantization;
pub mod lipschitz;
pub mod replicated;
pub mod warmup;
pub mod wrapper;

pub use config::{LayerSpec, RunConfig, build_density, build_replicated};
pub use dequantization::{Dequantize, DequantizationDensity};
pub use lipschitz::{ConstraintRefreshDensity, RefreshConstraints, SpectralNormConstraint};
pub use replicated::{Device, ReplicatedDensity, partition};
pub use warmup::{ModeAwareWarmupDensity, ReferencePolicy, WarmupBeforeEval};
pub use wrapper::{DensityLayer, Passthrough, WrapperDensity};

#[cfg(test)]
mod test_support;
