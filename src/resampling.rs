/*!
Systematic resampling of weighted particle sets.

For each batch element one offset `u ~ U[0, 1)` is drawn and output slot `k` receives the
particle `i` with `cumsum[i-1] <= (k + u) / n < cumsum[i]`, where `cumsum` is the cumulative
sum of normalized weights. Each particle is selected either `floor(n w_i)` or
`ceil(n w_i)` times.

Ancestor selection is a stop-gradient boundary: indices are computed on the host from
detached weights, then the selected particle values are gathered, which keeps their
gradient path intact.
*/

use crate::errors::{check_shape, SmcError, SmcResult};
use burn::prelude::*;
use burn::tensor::Int;
use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::Rng;

/// When to resample between two time steps.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ResamplingPolicy {
    /// Resample at every step.
    #[default]
    Always,
    /// Resample a batch element only when its effective sample size drops below the given
    /// fraction of `n_particles`.
    EssBelow(f32),
}

impl ResamplingPolicy {
    /// Whether a batch element with effective sample size `ess` out of `n_particles`
    /// should be resampled.
    pub fn should_resample(&self, ess: f32, n_particles: usize) -> bool {
        match *self {
            ResamplingPolicy::Always => true,
            ResamplingPolicy::EssBelow(fraction) => ess < fraction * n_particles as f32,
        }
    }

    pub(crate) fn validate(&self) -> SmcResult<()> {
        match *self {
            ResamplingPolicy::Always => Ok(()),
            ResamplingPolicy::EssBelow(fraction) if fraction > 0.0 && fraction <= 1.0 => Ok(()),
            ResamplingPolicy::EssBelow(fraction) => Err(SmcError::config(format!(
                "ESS threshold fraction must lie in (0, 1], got {fraction}"
            ))),
        }
    }
}

/// Systematic selection of `n_out` indices from normalized `weights` with offset `u`.
pub fn systematic_indices(weights: &[f64], n_out: usize, u: f64) -> Vec<usize> {
    let last = weights.len().saturating_sub(1);
    let mut indices = Vec::with_capacity(n_out);
    let mut i = 0;
    let mut cumsum = weights.first().copied().unwrap_or(0.0);
    for k in 0..n_out {
        let target = (k as f64 + u) / n_out as f64;
        while cumsum <= target && i < last {
            i += 1;
            cumsum += weights[i];
        }
        indices.push(i);
    }
    indices
}

/// Normalizes log-weights into probabilities, in `f64`.
fn normalized_column(log_weights: &[f64], batch: usize) -> SmcResult<Vec<f64>> {
    let max = log_weights
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() || log_weights.iter().any(|w| w.is_nan()) {
        return Err(SmcError::DegenerateWeights { batch });
    }
    let unnorm: Vec<f64> = log_weights.iter().map(|w| (w - max).exp()).collect();
    let total: f64 = unnorm.iter().sum();
    Ok(unnorm.into_iter().map(|w| w / total).collect())
}

/// Ancestor indices for a single batch element with (unnormalized) `log_weights`.
pub fn batch_ancestors(
    log_weights: &[f64],
    batch: usize,
    rng: &mut SmallRng,
) -> SmcResult<Vec<usize>> {
    let weights = normalized_column(log_weights, batch)?;
    let u: f64 = rng.gen();
    Ok(systematic_indices(&weights, log_weights.len(), u))
}

/// Draws ancestor indices for every batch element from log-weights of shape
/// `[n_particles, batch_size]`. The result has shape `[batch_size, n_particles]`.
///
/// The weights are detached before they are read, so no gradient flows through the
/// selection.
pub fn systematic_ancestors<B: Backend>(
    log_weights: Tensor<B, 2>,
    rng: &mut SmallRng,
) -> SmcResult<Array2<usize>> {
    let [n, b] = log_weights.dims();
    let lw: Vec<f64> = log_weights
        .detach()
        .into_data()
        .iter::<f32>()
        .map(f64::from)
        .collect();

    let mut ancestors = Array2::<usize>::zeros((b, n));
    for j in 0..b {
        let column: Vec<f64> = (0..n).map(|i| lw[i * b + j]).collect();
        for (k, idx) in batch_ancestors(&column, j, rng)?.into_iter().enumerate() {
            ancestors[[j, k]] = idx;
        }
    }
    Ok(ancestors)
}

/// Gathers `particles[ancestors[j, k], j, :]` into slot `(k, j)`.
pub fn gather_ancestors<B: Backend>(
    particles: Tensor<B, 3>,
    ancestors: &Array2<usize>,
) -> SmcResult<Tensor<B, 3>> {
    let [n, b, d] = particles.dims();
    check_shape("ancestor indices", &[b, n], &[ancestors.nrows(), ancestors.ncols()])?;
    let mut idx = Vec::with_capacity(n * b * d);
    for k in 0..n {
        for j in 0..b {
            let a = ancestors[[j, k]] as i64;
            idx.extend(std::iter::repeat(a).take(d));
        }
    }
    let idx = Tensor::<B, 3, Int>::from_data(TensorData::new(idx, [n, b, d]), &particles.device());
    Ok(particles.gather(0, idx))
}

/// Resamples `particles` (`[n, batch, D]`) according to `log_weights` (`[n, batch]`).
///
/// # Returns
///
/// The resampled particles and the ancestor indices of shape `[batch, n]`.
pub fn resample<B: Backend>(
    particles: Tensor<B, 3>,
    log_weights: Tensor<B, 2>,
    rng: &mut SmallRng,
) -> SmcResult<(Tensor<B, 3>, Array2<usize>)> {
    let [n, b, _] = particles.dims();
    check_shape("resampling log-weights", &[n, b], &log_weights.dims())?;
    let ancestors = systematic_ancestors(log_weights, rng)?;
    let resampled = gather_ancestors(particles, &ancestors)?;
    Ok((resampled, ancestors))
}
