//! Host-side diagnostics for particle filter output.
//!
//! Shapes follow the engine's output: particles `[T, n_particles, batch, D]`, log-weights
//! `[T, n_particles, batch]` and ancestors `[T-1, batch, n_particles]`.

use burn::prelude::*;
use ndarray::prelude::*;
use ndarray::s;
use ndarray_stats::QuantileExt;

/// Copies a tensor to the host as an `f32` array of the same shape.
pub fn to_array2<B: Backend>(t: Tensor<B, 2>) -> Array2<f32> {
    let [a, b] = t.dims();
    let v: Vec<f32> = t.into_data().iter::<f32>().collect();
    Array2::from_shape_vec((a, b), v).expect("Expected tensor data to match its shape")
}

pub fn to_array3<B: Backend>(t: Tensor<B, 3>) -> Array3<f32> {
    let [a, b, c] = t.dims();
    let v: Vec<f32> = t.into_data().iter::<f32>().collect();
    Array3::from_shape_vec((a, b, c), v).expect("Expected tensor data to match its shape")
}

pub fn to_array4<B: Backend>(t: Tensor<B, 4>) -> Array4<f32> {
    let [a, b, c, d] = t.dims();
    let v: Vec<f32> = t.into_data().iter::<f32>().collect();
    Array4::from_shape_vec((a, b, c, d), v).expect("Expected tensor data to match its shape")
}

/// Numerically stable `log Σ exp(v)`. Returns NaN if any entry is NaN and `-∞` for an
/// empty or all `-∞` input.
pub fn log_sum_exp(values: ArrayView1<f32>) -> f32 {
    let max = match values.max() {
        Ok(m) => *m,
        Err(ndarray_stats::errors::MinMaxError::EmptyInput) => return f32::NEG_INFINITY,
        Err(ndarray_stats::errors::MinMaxError::UndefinedOrder) => return f32::NAN,
    };
    if max == f32::NEG_INFINITY {
        return f32::NEG_INFINITY;
    }
    if max.is_infinite() {
        return max;
    }
    max + values.mapv(|v| (v - max).exp()).sum().ln()
}

/// `softmax(log_weights)`.
pub fn normalize_log_weights(log_weights: ArrayView1<f32>) -> Array1<f32> {
    let lse = log_sum_exp(log_weights);
    log_weights.mapv(|w| (w - lse).exp())
}

/// `1 / Σ w²` for normalized weights `w`.
pub fn effective_sample_size(weights: ArrayView1<f32>) -> f32 {
    1.0 / weights.mapv(|w| w * w).sum()
}

/// Normalizes `[T, n, batch]` log-weights over the particle axis.
pub fn normalized_weights(log_weights: &Array3<f32>) -> Array3<f32> {
    let mut out = Array3::<f32>::zeros(log_weights.raw_dim());
    for t in 0..log_weights.shape()[0] {
        for j in 0..log_weights.shape()[2] {
            let w = normalize_log_weights(log_weights.slice(s![t, .., j]));
            out.slice_mut(s![t, .., j]).assign(&w);
        }
    }
    out
}

/// Weighted particle means `Σ_i w_i x_i`, shape `[T, batch, D]`.
pub fn filtering_means(particles: &Array4<f32>, log_weights: &Array3<f32>) -> Array3<f32> {
    let (t_len, n, b, d) = particles.dim();
    let w = normalized_weights(log_weights);
    let mut means = Array3::<f32>::zeros((t_len, b, d));
    for t in 0..t_len {
        for i in 0..n {
            for j in 0..b {
                let x = particles.slice(s![t, i, j, ..]);
                let mut m = means.slice_mut(s![t, j, ..]);
                m.scaled_add(w[[t, i, j]], &x);
            }
        }
    }
    means
}

/// Follows the ancestor indices backwards from the final particle set.
///
/// Slot `[t, k, j]` of the result holds the state at time `t` on the genealogy of final
/// particle `k` in batch element `j`.
pub fn reconstruct_trajectories(particles: &Array4<f32>, ancestors: &Array3<usize>) -> Array4<f32> {
    let (t_len, n, b, _) = particles.dim();
    let mut out = Array4::<f32>::zeros(particles.raw_dim());
    if t_len == 0 {
        return out;
    }
    for j in 0..b {
        for k in 0..n {
            let mut idx = k;
            for t in (0..t_len).rev() {
                out.slice_mut(s![t, k, j, ..])
                    .assign(&particles.slice(s![t, idx, j, ..]));
                if t > 0 {
                    idx = ancestors[[t - 1, j, idx]];
                }
            }
        }
    }
    out
}

/// Mean squared error and coefficient of determination of `prediction` against `target`
/// (same shape, last axis is the observation dimension). R² uses per-dimension means of
/// the target.
pub fn mse_r_squared(prediction: &Array3<f32>, target: &Array3<f32>) -> (f32, f32) {
    let sse = (prediction - target).mapv(|e| e * e).sum();
    let dy = target.shape()[2];
    let count = target.len().max(1) as f32;
    let mut sst = 0.0;
    for c in 0..dy {
        let col = target.slice(s![.., .., c]);
        let mean = col.mean().unwrap_or(0.0);
        sst += col.mapv(|v| (v - mean) * (v - mean)).sum();
    }
    let r_squared = if sst > 0.0 { 1.0 - sse / sst } else { f32::NAN };
    (sse / count, r_squared)
}
