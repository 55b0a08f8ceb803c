//! Data-parallel replication across compute devices.
//!
//! A [`ReplicatedDensity`] holds one replica per device. Only the objective is
//! parallelized: the batch is split into contiguous row chunks, each chunk runs on its
//! device's replica in a scoped worker thread, and the per-example results are gathered
//! back in input order. Generation goes straight to the primary replica.
//!
//! ```text
//! batch [M rows] ──partition──► chunk 0 ─► replica 0 (primary) ─┐
//!                               chunk 1 ─► replica 1            ├─► gather [M scores]
//!                               ...                             │
//!                               chunk D-1 ─► replica D-1 ───────┘
//! ```
//!
//! Keeping non-primary replicas in sync with the primary's parameters is the job of
//! whoever updates those parameters.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cif_core::{Batch, ConstrainedSubmodule, Density, Error, Mode, Result};

/// Handle to a compute device.
///
/// Clones share the availability flag, so marking a device unavailable is visible to
/// every replicated density that was built over it.
#[derive(Debug, Clone)]
pub struct Device {
    id: usize,
    available: Arc<AtomicBool>,
}

impl Device {
    /// Available device with the given id.
    pub fn new(id: usize) -> Self {
        Self { id, available: Arc::new(AtomicBool::new(true)) }
    }

    /// `n` devices with ids `0..n`.
    pub fn range(n: usize) -> Vec<Device> {
        (0..n).map(Device::new).collect()
    }

    /// Device id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Whether the device can currently run work.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Mark the device (un)available.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }
}

/// Contiguous row ranges for `n_devices` chunks of `n_rows` examples.
///
/// The first `n_rows % n_devices` ranges hold one extra row. Trailing ranges are empty
/// when there are fewer rows than devices.
pub fn partition(n_rows: usize, n_devices: usize) -> Vec<Range<usize>> {
    if n_devices == 0 {
        return Vec::new();
    }
    let base = n_rows / n_devices;
    let remainder = n_rows % n_devices;
    let mut start = 0;
    (0..n_devices)
        .map(|i| {
            let len = base + usize::from(i < remainder);
            let range = start..start + len;
            start += len;
            range
        })
        .collect()
}

/// One logical density replicated over a fixed set of devices.
pub struct ReplicatedDensity {
    devices: Vec<Device>,
    primary: Box<dyn Density>,
    replicas: Vec<Box<dyn Density>>,
}

impl ReplicatedDensity {
    /// Build from one density per device. `densities[0]` lives on `devices[0]`, the
    /// primary device.
    pub fn new(devices: Vec<Device>, densities: Vec<Box<dyn Density>>) -> Result<Self> {
        if devices.is_empty() {
            return Err(Error::Validation("ReplicatedDensity requires at least one device".into()));
        }
        if devices.len() != densities.len() {
            return Err(Error::Validation(format!(
                "ReplicatedDensity: {} devices but {} replicas",
                devices.len(),
                densities.len()
            )));
        }
        let mut ids = HashSet::with_capacity(devices.len());
        for d in &devices {
            if !ids.insert(d.id()) {
                return Err(Error::Validation(format!("duplicate device id {}", d.id())));
            }
        }

        let mut densities = densities.into_iter();
        let primary = densities.next().ok_or_else(|| {
            Error::Validation("ReplicatedDensity requires a primary replica".into())
        })?;
        Ok(Self { devices, primary, replicas: densities.collect() })
    }

    /// Build one replica per device with `factory`.
    pub fn from_factory<F>(devices: Vec<Device>, mut factory: F) -> Result<Self>
    where
        F: FnMut(&Device) -> Result<Box<dyn Density>>,
    {
        let densities = devices.iter().map(&mut factory).collect::<Result<Vec<_>>>()?;
        Self::new(devices, densities)
    }

    /// Configured devices, primary first.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Number of replicas.
    pub fn n_devices(&self) -> usize {
        self.devices.len()
    }

    /// The primary replica.
    pub fn primary(&self) -> &dyn Density {
        self.primary.as_ref()
    }

    /// Mutable access to the primary replica.
    pub fn primary_mut(&mut self) -> &mut dyn Density {
        self.primary.as_mut()
    }

    fn check_devices(&self) -> Result<()> {
        let missing: Vec<usize> =
            self.devices.iter().filter(|d| !d.is_available()).map(Device::id).collect();
        if !missing.is_empty() {
            log::warn!("replicated objective rejected: devices {missing:?} unavailable");
            return Err(Error::DeviceMismatch(format!(
                "configured devices {:?} unavailable",
                missing
            )));
        }
        Ok(())
    }
}

impl Density for ReplicatedDensity {
    fn name(&self) -> &str {
        "data-parallel"
    }

    fn mode(&self) -> Mode {
        self.primary.mode()
    }

    fn set_mode(&mut self, mode: Mode) -> Result<()> {
        self.primary.set_mode(mode)?;
        for replica in &mut self.replicas {
            replica.set_mode(mode)?;
        }
        Ok(())
    }

    fn evaluate_objective_in(&mut self, batch: &mut Batch, path: Mode) -> Result<Vec<f64>> {
        self.check_devices()?;
        if self.replicas.is_empty() {
            return self.primary.evaluate_objective_in(batch, path);
        }

        let ranges = partition(batch.n_rows(), self.devices.len());
        log::debug!(
            "partitioned {} rows over {} devices: {:?}",
            batch.n_rows(),
            ranges.len(),
            ranges.iter().map(|r| r.len()).collect::<Vec<_>>()
        );
        let chunks =
            ranges.iter().map(|r| batch.slice_rows(r.clone())).collect::<Result<Vec<_>>>()?;

        let replicas = std::iter::once(&mut self.primary).chain(self.replicas.iter_mut());
        let results: Vec<std::thread::Result<(Batch, Result<Vec<f64>>)>> =
            std::thread::scope(|scope| {
                let handles: Vec<_> = chunks
                    .into_iter()
                    .zip(replicas)
                    .map(|(mut chunk, replica)| {
                        scope.spawn(move || {
                            if chunk.is_empty() {
                                return (chunk, Ok(Vec::new()));
                            }
                            let scores = replica.evaluate_objective_in(&mut chunk, path);
                            (chunk, scores)
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join()).collect()
            });

        let mut scores = Vec::with_capacity(batch.n_rows());
        for ((result, range), device) in results.into_iter().zip(&ranges).zip(&self.devices) {
            let (chunk, chunk_scores) = result.map_err(|_| {
                Error::Computation(format!("replica on device {} panicked", device.id()))
            })?;
            let chunk_scores = chunk_scores?;
            if chunk_scores.len() != range.len() {
                return Err(Error::ContractViolation(format!(
                    "replica on device {} returned {} scores for {} rows",
                    device.id(),
                    chunk_scores.len(),
                    range.len()
                )));
            }
            // Preserve in-place modifications made by the replicas' layers.
            batch.write_rows(range.start, &chunk)?;
            scores.extend(chunk_scores);
        }
        Ok(scores)
    }

    fn generate(&mut self, count: usize) -> Result<Batch> {
        self.primary.generate(count)
    }

    fn generate_deterministic(&mut self, noise: &Batch) -> Result<Batch> {
        self.primary.generate_deterministic(noise)
    }

    fn constrained_submodules(&mut self) -> Vec<&mut dyn ConstrainedSubmodule> {
        let mut out = self.primary.constrained_submodules();
        for replica in &mut self.replicas {
            out.extend(replica.constrained_submodules());
        }
        out
    }

    fn inner(&self) -> Option<&dyn Density> {
        Some(self.primary.as_ref())
    }
}
