//! # cif-core
//!
//! Shared vocabulary for composable density estimators:
//! - [`Density`]: the capability contract implemented by base models and wrappers.
//! - [`ConstrainedSubmodule`]: components with a Lipschitz constant that needs refreshing.
//! - [`Batch`] and [`Mode`]: the data and state every call is expressed in.
//! - [`Error`] / [`Result`]: error handling for the whole workspace.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use traits::{ConstrainedSubmodule, Density, RefreshOutcome, composition_names};
pub use types::{Batch, Mode};
