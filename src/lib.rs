//! Differentiable Sequential Monte Carlo for state-space models.
//!
//! [`smc::Smc`] runs a particle filter over batches of observation sequences and returns a
//! log-evidence estimate that gradients flow through, so `-mean(log Z)` can be minimized
//! directly to fit transition, emission and proposal parameters.

pub mod chi_square;
pub mod distributions;
pub mod encoder;
pub mod errors;
pub mod flow;
pub mod kalman;
pub mod resampling;
pub mod smc;
pub mod stats;
pub mod transformations;

pub use errors::{SmcError, SmcResult};
pub use smc::{Smc, SmcConfig, SmcOutput};
