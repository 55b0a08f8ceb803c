//! Run-configuration driven composition.
//!
//! A run configuration is a flat JSON object of hyperparameters. Only the keys that decide
//! which wrappers to build are read here; everything else (optimizer, epochs, architecture)
//! belongs to other collaborators and is ignored.
//!
//! ```json
//! {
//!   "dequantize": true,
//!   "batch_norm": true,
//!   "batch_norm_use_running_averages": false,
//!   "lipschitz_constant": 0.9,
//!   "num_passthrough_data_points": 100000,
//!   "warmup_reference": "frozen"
//! }
//! ```

use std::path::Path;

use cif_core::{Batch, Density, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dequantization::DequantizationDensity;
use crate::lipschitz::ConstraintRefreshDensity;
use crate::replicated::{Device, ReplicatedDensity};
use crate::warmup::{ModeAwareWarmupDensity, ReferencePolicy, WarmupBeforeEval};
use crate::wrapper::WrapperDensity;

/// Default size of the warm-up reference batch.
pub const DEFAULT_PASSTHROUGH_POINTS: usize = 100_000;

fn default_passthrough_points() -> usize {
    DEFAULT_PASSTHROUGH_POINTS
}

/// Composition-relevant subset of a run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Add uniform dequantization noise to the objective input.
    pub dequantize: bool,
    /// The base model uses batch normalization.
    pub batch_norm: bool,
    /// Batch normalization evaluates with accumulated running averages, so no warm-up
    /// pass is needed.
    pub batch_norm_use_running_averages: bool,
    /// Target Lipschitz bound of residual blocks; `Some` enables refresh before each call.
    pub lipschitz_constant: Option<f64>,
    /// Maximum number of training rows in the warm-up reference batch.
    #[serde(default = "default_passthrough_points")]
    pub num_passthrough_data_points: usize,
    /// Whether the warm-up reference batch may be replaced later.
    pub warmup_reference: ReferencePolicy,
    /// Seed for dequantization noise and reference subsampling.
    pub seed: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            dequantize: false,
            batch_norm: false,
            batch_norm_use_running_averages: false,
            lipschitz_constant: None,
            num_passthrough_data_points: DEFAULT_PASSTHROUGH_POINTS,
            warmup_reference: ReferencePolicy::Frozen,
            seed: None,
        }
    }
}

impl RunConfig {
    /// Read from a hyperparameter mapping.
    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        let config: RunConfig = serde_json::from_value(Value::Object(map.clone()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read from a JSON object string.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(s)?;
        match value {
            Value::Object(map) => Self::from_map(&map),
            other => Err(Error::Validation(format!(
                "run configuration must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Read from a `config.json` file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if let Some(c) = self.lipschitz_constant {
            if !c.is_finite() || c <= 0.0 {
                return Err(Error::Validation(format!(
                    "lipschitz_constant must be finite and > 0, got {c}"
                )));
            }
        }
        if self.batch_norm
            && !self.batch_norm_use_running_averages
            && self.num_passthrough_data_points == 0
        {
            return Err(Error::Validation(
                "num_passthrough_data_points must be > 0 when warm-up is enabled".into(),
            ));
        }
        Ok(())
    }

    /// Wrapper layers to build, outermost first.
    pub fn schema(&self) -> Vec<LayerSpec> {
        let mut schema = Vec::new();
        if self.batch_norm && !self.batch_norm_use_running_averages {
            schema.push(LayerSpec::PassthroughBeforeEval {
                num_passthrough_data_points: self.num_passthrough_data_points,
                reference_policy: self.warmup_reference,
            });
        }
        if self.dequantize {
            schema.push(LayerSpec::Dequantization);
        }
        if self.lipschitz_constant.is_some() {
            schema.push(LayerSpec::LipschitzRefresh);
        }
        schema
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// One wrapper layer of a composition schema.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LayerSpec {
    /// [`ModeAwareWarmupDensity`] over a random subset of the training data.
    PassthroughBeforeEval {
        /// Maximum reference rows.
        num_passthrough_data_points: usize,
        /// Reference batch policy.
        #[serde(default)]
        reference_policy: ReferencePolicy,
    },
    /// [`DequantizationDensity`].
    Dequantization,
    /// [`ConstraintRefreshDensity`].
    LipschitzRefresh,
}

/// Wrap `base` with `schema` (outermost first).
///
/// `x_train` supplies the warm-up reference rows; `seed` makes noise and subsampling
/// reproducible.
pub fn build_density(
    schema: &[LayerSpec],
    base: Box<dyn Density>,
    x_train: &Batch,
    seed: Option<u64>,
) -> Result<Box<dyn Density>> {
    let warmups = draw_warmups(schema, x_train, seed)?;
    wrap(schema, base, &warmups, seed)
}

/// Build one full per-device stack with `make_base` and replicate it over `devices`.
///
/// Warm-up reference batches are drawn once and shared by every replica, so all replicas
/// end up with the same running statistics. Only the dequantization noise streams differ
/// per replica.
pub fn build_replicated<F>(
    schema: &[LayerSpec],
    devices: Vec<Device>,
    mut make_base: F,
    x_train: &Batch,
    seed: Option<u64>,
) -> Result<ReplicatedDensity>
where
    F: FnMut(&Device) -> Result<Box<dyn Density>>,
{
    let warmups = draw_warmups(schema, x_train, seed)?;
    let stride = schema.len() as u64 + 1;
    let mut replica = 0u64;
    ReplicatedDensity::from_factory(devices, |device| {
        let base = make_base(device)?;
        // The primary replica uses `seed` itself, matching a single `build_density` stack.
        let replica_seed = seed.map(|s| s.wrapping_add(replica * stride));
        replica += 1;
        wrap(schema, base, &warmups, replica_seed)
    })
}

fn layer_seed(seed: Option<u64>, depth: usize) -> Option<u64> {
    seed.map(|s| s.wrapping_add(depth as u64))
}

/// Warm-up layers for every `PassthroughBeforeEval` entry, indexed like `schema`.
fn draw_warmups(
    schema: &[LayerSpec],
    x_train: &Batch,
    seed: Option<u64>,
) -> Result<Vec<Option<WarmupBeforeEval>>> {
    schema
        .iter()
        .enumerate()
        .map(|(depth, spec)| match *spec {
            LayerSpec::PassthroughBeforeEval { num_passthrough_data_points, reference_policy } => {
                WarmupBeforeEval::subsample(
                    x_train,
                    num_passthrough_data_points,
                    reference_policy,
                    layer_seed(seed, depth),
                )
                .map(Some)
            }
            _ => Ok(None),
        })
        .collect()
}

fn wrap(
    schema: &[LayerSpec],
    base: Box<dyn Density>,
    warmups: &[Option<WarmupBeforeEval>],
    seed: Option<u64>,
) -> Result<Box<dyn Density>> {
    let mut density = base;
    for (depth, spec) in schema.iter().enumerate().rev() {
        let wrapped: Box<dyn Density> = match *spec {
            LayerSpec::PassthroughBeforeEval { .. } => {
                let layer = warmups.get(depth).cloned().flatten().ok_or_else(|| {
                    Error::Validation(format!("no warm-up reference drawn for layer {depth}"))
                })?;
                let warmup: ModeAwareWarmupDensity = WrapperDensity::with_layer(layer, density);
                Box::new(warmup)
            }
            LayerSpec::Dequantization => match layer_seed(seed, depth) {
                Some(s) => Box::new(DequantizationDensity::seeded(density, s)),
                None => Box::new(DequantizationDensity::new(density)),
            },
            LayerSpec::LipschitzRefresh => Box::new(ConstraintRefreshDensity::new(density)),
        };
        density = wrapped;
    }
    Ok(density)
}
