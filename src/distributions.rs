/*!
Conditional distributions over batched particle tensors.

Each distribution is bound to a [`Transformation`] that maps the conditioning state to its
location parameter. A distribution is evaluated under a [`Conditioning`]: either the initial
step (no previous state, the distribution's own initial location `x_0` is used) or a tensor
of previous states of shape `[n_particles, batch_size, input_dim]`.

Samples have shape `[n_particles, batch_size, event_dim]` and log-densities have shape
`[n_particles, batch_size]`.

# Examples

```rust
use burn::backend::NdArray;
use burn::prelude::*;
use mini_smc::distributions::{Conditioning, ConditionalDistribution, MvNormal};
use mini_smc::transformations::LinearTransformation;
use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::SeedableRng;

type B = NdArray;
let device = Default::default();

let f = MvNormal::new(
    LinearTransformation::<B>::identity(2, &device),
    &Array2::eye(2),
    1e-3,
    &device,
)
.unwrap();

let mut rng = SmallRng::seed_from_u64(42);
let prev = Conditioning::State(Tensor::<B, 3>::zeros([100, 3, 2], &device));
let x = f.sample(&prev, &mut rng).unwrap();
let log_p = f.log_prob(&prev, x).unwrap();
assert_eq!(log_p.dims(), [100, 3]);
```
*/

use crate::errors::{check_shape, SmcError, SmcResult};
use crate::flow::NormalizingFlow;
use crate::transformations::Transformation;
use burn::module::Param;
use burn::prelude::*;
use burn::tensor::activation::softplus;
use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use statrs::function::gamma::ln_gamma;
use std::f32::consts::PI;

/// What a distribution is conditioned on.
#[derive(Debug, Clone)]
pub enum Conditioning<B: Backend> {
    /// The first time step: no previous state exists.
    Initial {
        n_particles: usize,
        batch_size: usize,
    },
    /// Previous states of shape `[n_particles, batch_size, input_dim]`.
    State(Tensor<B, 3>),
}

impl<B: Backend> Conditioning<B> {
    /// Returns `[n_particles, batch_size]`.
    pub fn leading_dims(&self) -> [usize; 2] {
        match self {
            Conditioning::Initial {
                n_particles,
                batch_size,
            } => [*n_particles, *batch_size],
            Conditioning::State(x) => {
                let [n, b, _] = x.dims();
                [n, b]
            }
        }
    }
}

/// A distribution over `event_dim`-dimensional events, conditioned on a state.
pub trait ConditionalDistribution<B: Backend> {
    /// Size of the last axis of a sample.
    fn event_dim(&self) -> usize;

    /// Size of the last axis of the conditioning state.
    fn input_dim(&self) -> usize;

    /// Location parameter (the mean for every variant here) under `cond`.
    fn loc(&self, cond: &Conditioning<B>) -> SmcResult<Tensor<B, 3>>;

    /// Draws one sample per (particle, batch) pair.
    fn sample(&self, cond: &Conditioning<B>, rng: &mut SmallRng) -> SmcResult<Tensor<B, 3>>;

    /// Log-density of `x` (`[n_particles, batch_size, event_dim]`) under `cond`.
    fn log_prob(&self, cond: &Conditioning<B>, x: Tensor<B, 3>) -> SmcResult<Tensor<B, 2>>;
}

/// Multivariate normal `N(T(state), L Lᵀ)`.
///
/// The lower-triangular factor is parameterized as
/// `L = strict_lower(M) + diag(|diag(M)| + sigma_min)` with a trainable raw matrix `M`, so
/// its diagonal never drops below `sigma_min`.
///
/// With a [`Module`] transformation the whole distribution is a burn module, so its
/// parameters can be handed to an optimizer.
#[derive(Module, Debug)]
pub struct MvNormal<B: Backend, T> {
    pub transformation: T,
    pub x_0: Option<Param<Tensor<B, 1>>>,
    pub raw_scale: Param<Tensor<B, 2>>,
    sigma_min: f32,
}

impl<B: Backend, T: Transformation<B>> MvNormal<B, T> {
    /// Creates the distribution with an initial scale factor `scale_tril` (its upper triangle
    /// is ignored).
    ///
    /// # Parameters
    ///
    /// * `transformation`: Maps conditioning states to the mean. Its output size is the
    ///   event size.
    /// * `scale_tril`: Desired initial lower-triangular factor of the covariance.
    /// * `sigma_min`: Additive floor on the diagonal of the factor.
    /// * `device`: Device the parameters live on.
    pub fn new(
        transformation: T,
        scale_tril: &Array2<f32>,
        sigma_min: f32,
        device: &B::Device,
    ) -> SmcResult<Self> {
        let (rows, cols) = scale_tril.dim();
        if rows != cols {
            return Err(SmcError::DimensionMismatch {
                context: "Gaussian scale factor columns",
                expected: rows,
                found: cols,
            });
        }
        if rows != transformation.out_dim() {
            return Err(SmcError::DimensionMismatch {
                context: "Gaussian event size vs transformation output",
                expected: transformation.out_dim(),
                found: rows,
            });
        }
        if !(sigma_min >= 0.0 && sigma_min.is_finite()) {
            return Err(SmcError::config(format!(
                "sigma_min must be finite and non-negative, got {sigma_min}"
            )));
        }
        let raw = Array2::from_shape_fn((rows, cols), |(i, j)| match i.cmp(&j) {
            std::cmp::Ordering::Greater => scale_tril[[i, j]],
            std::cmp::Ordering::Equal => (scale_tril[[i, i]].abs() - sigma_min).max(0.0),
            std::cmp::Ordering::Less => 0.0,
        });
        Ok(Self {
            transformation,
            x_0: None,
            raw_scale: Param::from_tensor(matrix_tensor(&raw, device)),
            sigma_min,
        })
    }

    /// Sets the trainable location used under [`Conditioning::Initial`].
    pub fn with_initial_location(mut self, x_0: &[f32], device: &B::Device) -> SmcResult<Self> {
        self.x_0 = Some(initial_location(x_0, self.transformation.out_dim(), device)?);
        Ok(self)
    }

    pub fn sigma_min(&self) -> f32 {
        self.sigma_min
    }

    /// The lower-triangular factor `L` with `Σ = L Lᵀ`.
    pub fn scale_tril(&self) -> Tensor<B, 2> {
        let raw = self.raw_scale.val();
        let d = raw.dims()[0];
        let device = raw.device();
        let eye = eye_tensor::<B>(d, &device);
        let strict = strict_lower_tensor::<B>(d, &device);
        raw.clone() * strict + raw.abs().add_scalar(self.sigma_min) * eye
    }
}

impl<B: Backend, T: Transformation<B>> ConditionalDistribution<B> for MvNormal<B, T> {
    fn event_dim(&self) -> usize {
        self.transformation.out_dim()
    }

    fn input_dim(&self) -> usize {
        self.transformation.in_dim()
    }

    fn loc(&self, cond: &Conditioning<B>) -> SmcResult<Tensor<B, 3>> {
        transformed_loc(&self.transformation, self.x_0.as_ref(), cond, "Gaussian conditioning")
    }

    fn sample(&self, cond: &Conditioning<B>, rng: &mut SmallRng) -> SmcResult<Tensor<B, 3>> {
        let loc = self.loc(cond)?;
        let [n, b, d] = loc.dims();
        let eps = standard_normal::<B, 2>([n * b, d], rng, &loc.device());
        let noise = eps.matmul(self.scale_tril().transpose()).reshape([n, b, d]);
        Ok(loc + noise)
    }

    fn log_prob(&self, cond: &Conditioning<B>, x: Tensor<B, 3>) -> SmcResult<Tensor<B, 2>> {
        let loc = self.loc(cond)?;
        let [n, b, d] = loc.dims();
        check_shape("Gaussian log_prob input", &[n, b, d], &x.dims())?;
        let m = n * b;
        let diff = (x - loc).reshape([m, d]);
        let l = self.scale_tril();

        // Forward substitution for L z = diff, one column at a time.
        let mut cols: Vec<Tensor<B, 2>> = Vec::with_capacity(d);
        for i in 0..d {
            let mut r = diff.clone().narrow(1, i, 1);
            for (j, z_j) in cols.iter().enumerate() {
                let l_ij = l.clone().narrow(0, i, 1).narrow(1, j, 1).expand([m, 1]);
                r = r - z_j.clone() * l_ij;
            }
            let l_ii = l.clone().narrow(0, i, 1).narrow(1, i, 1).expand([m, 1]);
            cols.push(r / l_ii);
        }
        let z = Tensor::cat(cols, 1);

        let eye = eye_tensor::<B>(d, &l.device());
        let log_det = (l * eye).sum_dim(1).log().sum().reshape([1, 1]).expand([m, 1]);
        let log_p = (z.powi_scalar(2).sum_dim(1).mul_scalar(-0.5) - log_det)
            .sub_scalar(0.5 * d as f32 * (2.0 * PI).ln());
        Ok(log_p.reshape([n, b]))
    }
}

/// Link function mapping the transformation output to a positive rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoissonLink {
    #[default]
    Softplus,
    Exp,
}

/// Independent Poisson counts with rates `link(T(state))`.
#[derive(Debug, Clone)]
pub struct Poisson<T> {
    pub transformation: T,
    pub link: PoissonLink,
}

impl<T> Poisson<T> {
    pub fn new(transformation: T, link: PoissonLink) -> Self {
        Self {
            transformation,
            link,
        }
    }
}

impl<T> Poisson<T> {
    fn rate<B: Backend>(&self, cond: &Conditioning<B>) -> SmcResult<Tensor<B, 3>>
    where
        T: Transformation<B>,
    {
        let eta = transformed_loc(&self.transformation, None, cond, "Poisson conditioning")?;
        Ok(match self.link {
            PoissonLink::Softplus => softplus(eta, 1.0),
            PoissonLink::Exp => eta.exp(),
        })
    }
}

impl<B: Backend, T: Transformation<B>> ConditionalDistribution<B> for Poisson<T> {
    fn event_dim(&self) -> usize {
        self.transformation.out_dim()
    }

    fn input_dim(&self) -> usize {
        self.transformation.in_dim()
    }

    fn loc(&self, cond: &Conditioning<B>) -> SmcResult<Tensor<B, 3>> {
        self.rate(cond)
    }

    fn sample(&self, cond: &Conditioning<B>, rng: &mut SmallRng) -> SmcResult<Tensor<B, 3>> {
        let rate = self.rate(cond)?;
        let shape = rate.dims();
        let device = rate.device();
        let counts = rate
            .into_data()
            .iter::<f32>()
            .map(|lambda| {
                if !(lambda > 0.0 && lambda.is_finite()) {
                    return Err(SmcError::InvalidParameter {
                        context: "Poisson rate",
                        value: lambda,
                    });
                }
                let poisson = rand_distr::Poisson::new(lambda as f64).map_err(|_| {
                    SmcError::InvalidParameter {
                        context: "Poisson rate",
                        value: lambda,
                    }
                })?;
                Ok(poisson.sample(&mut *rng) as f32)
            })
            .collect::<SmcResult<Vec<f32>>>()?;
        Ok(Tensor::from_data(TensorData::new(counts, shape), &device))
    }

    fn log_prob(&self, cond: &Conditioning<B>, y: Tensor<B, 3>) -> SmcResult<Tensor<B, 2>> {
        let rate = self.rate(cond)?;
        let shape = rate.dims();
        check_shape("Poisson log_prob input", &shape, &y.dims())?;
        let log_factorial: Vec<f32> = y
            .clone()
            .into_data()
            .iter::<f32>()
            .map(|k| ln_gamma(k as f64 + 1.0) as f32)
            .collect();
        let log_factorial = Tensor::from_data(TensorData::new(log_factorial, shape), &y.device());
        let log_p = y * rate.clone().log() - rate - log_factorial;
        Ok(log_p.sum_dim(2).squeeze(2))
    }
}

/// Point mass at `T(state)`.
///
/// `log_prob` is identically zero: the deterministic map contributes no term to an
/// importance ratio.
#[derive(Module, Debug)]
pub struct DiracDelta<B: Backend, T> {
    pub transformation: T,
    pub x_0: Option<Param<Tensor<B, 1>>>,
}

impl<B: Backend, T: Transformation<B>> DiracDelta<B, T> {
    pub fn new(transformation: T) -> Self {
        Self {
            transformation,
            x_0: None,
        }
    }

    /// Sets the trainable location used under [`Conditioning::Initial`].
    pub fn with_initial_location(mut self, x_0: &[f32], device: &B::Device) -> SmcResult<Self> {
        self.x_0 = Some(initial_location(x_0, self.transformation.out_dim(), device)?);
        Ok(self)
    }
}

impl<B: Backend, T: Transformation<B>> ConditionalDistribution<B> for DiracDelta<B, T> {
    fn event_dim(&self) -> usize {
        self.transformation.out_dim()
    }

    fn input_dim(&self) -> usize {
        self.transformation.in_dim()
    }

    fn loc(&self, cond: &Conditioning<B>) -> SmcResult<Tensor<B, 3>> {
        transformed_loc(&self.transformation, self.x_0.as_ref(), cond, "Dirac conditioning")
    }

    fn sample(&self, cond: &Conditioning<B>, _rng: &mut SmallRng) -> SmcResult<Tensor<B, 3>> {
        self.loc(cond)
    }

    fn log_prob(&self, cond: &Conditioning<B>, x: Tensor<B, 3>) -> SmcResult<Tensor<B, 2>> {
        let [n, b] = cond.leading_dims();
        check_shape("Dirac log_prob input", &[n, b, self.event_dim()], &x.dims())?;
        Ok(Tensor::zeros([n, b], &x.device()))
    }
}

/// A base distribution pushed through a normalizing flow.
///
/// Sampling applies `flow.forward` to a base sample; the density follows the change of
/// variables `log p(x) = log p_base(flow⁻¹(x)) + log|det ∂flow⁻¹/∂x|`.
#[derive(Module, Debug)]
pub struct FlowTransformed<B: Backend, D> {
    pub base: D,
    pub flow: NormalizingFlow<B>,
}

impl<B: Backend, D: ConditionalDistribution<B>> FlowTransformed<B, D> {
    pub fn new(base: D, flow: NormalizingFlow<B>) -> SmcResult<Self> {
        if flow.event_size() != base.event_dim() {
            return Err(SmcError::DimensionMismatch {
                context: "flow event size vs base distribution",
                expected: base.event_dim(),
                found: flow.event_size(),
            });
        }
        Ok(Self { base, flow })
    }
}

impl<B: Backend, D: ConditionalDistribution<B>> ConditionalDistribution<B>
    for FlowTransformed<B, D>
{
    fn event_dim(&self) -> usize {
        self.base.event_dim()
    }

    fn input_dim(&self) -> usize {
        self.base.input_dim()
    }

    /// The image of the base location under the flow.
    fn loc(&self, cond: &Conditioning<B>) -> SmcResult<Tensor<B, 3>> {
        Ok(self.flow.forward(self.base.loc(cond)?)?.0)
    }

    fn sample(&self, cond: &Conditioning<B>, rng: &mut SmallRng) -> SmcResult<Tensor<B, 3>> {
        let z = self.base.sample(cond, rng)?;
        Ok(self.flow.forward(z)?.0)
    }

    fn log_prob(&self, cond: &Conditioning<B>, x: Tensor<B, 3>) -> SmcResult<Tensor<B, 2>> {
        let (z, log_det_inv) = self.flow.inverse(x)?;
        Ok(self.base.log_prob(cond, z)? + log_det_inv)
    }
}

/// Diagonal normal with fixed per-batch parameters, independent of the conditioning state.
///
/// `loc` and `scale` have shape `[batch_size, event_dim]`; `input_dim` is zero.
#[derive(Debug, Clone)]
pub struct DiagNormal<B: Backend> {
    pub loc: Tensor<B, 2>,
    pub scale: Tensor<B, 2>,
}

impl<B: Backend> DiagNormal<B> {
    pub fn new(loc: Tensor<B, 2>, scale: Tensor<B, 2>) -> SmcResult<Self> {
        check_shape("diagonal normal scale", &loc.dims(), &scale.dims())?;
        Ok(Self { loc, scale })
    }

    fn expanded(&self, t: &Tensor<B, 2>, cond: &Conditioning<B>) -> SmcResult<Tensor<B, 3>> {
        let [n, b] = cond.leading_dims();
        let [b_own, d] = t.dims();
        check_shape("diagonal normal batch size", &[b_own], &[b])?;
        Ok(t.clone().reshape([1, b, d]).expand([n, b, d]))
    }
}

impl<B: Backend> ConditionalDistribution<B> for DiagNormal<B> {
    fn event_dim(&self) -> usize {
        self.loc.dims()[1]
    }

    fn input_dim(&self) -> usize {
        0
    }

    fn loc(&self, cond: &Conditioning<B>) -> SmcResult<Tensor<B, 3>> {
        self.expanded(&self.loc, cond)
    }

    fn sample(&self, cond: &Conditioning<B>, rng: &mut SmallRng) -> SmcResult<Tensor<B, 3>> {
        let loc = self.expanded(&self.loc, cond)?;
        let scale = self.expanded(&self.scale, cond)?;
        let eps = standard_normal::<B, 3>(loc.dims(), rng, &loc.device());
        Ok(loc + scale * eps)
    }

    fn log_prob(&self, cond: &Conditioning<B>, x: Tensor<B, 3>) -> SmcResult<Tensor<B, 2>> {
        let loc = self.expanded(&self.loc, cond)?;
        let scale = self.expanded(&self.scale, cond)?;
        let dims = loc.dims();
        check_shape("diagonal normal log_prob input", &dims, &x.dims())?;
        let z = (x - loc) / scale.clone();
        let log_p = (z.powi_scalar(2).mul_scalar(-0.5) - scale.log())
            .sub_scalar(0.5 * (2.0 * PI).ln());
        Ok(log_p.sum_dim(2).squeeze(2))
    }
}

/// The location under `cond`: `x_0` broadcast over particles and batch at the initial step,
/// `transformation(state)` otherwise.
fn transformed_loc<B: Backend, T: Transformation<B>>(
    transformation: &T,
    x_0: Option<&Param<Tensor<B, 1>>>,
    cond: &Conditioning<B>,
    context: &'static str,
) -> SmcResult<Tensor<B, 3>> {
    match cond {
        Conditioning::Initial {
            n_particles,
            batch_size,
        } => {
            let x_0 = x_0.ok_or_else(|| {
                SmcError::config(format!(
                    "{context}: no initial location x_0 for the first time step"
                ))
            })?;
            let x_0 = x_0.val();
            let d = x_0.dims()[0];
            Ok(x_0.reshape([1, 1, d]).expand([*n_particles, *batch_size, d]))
        }
        Conditioning::State(x) => {
            let [n, b, d] = x.dims();
            check_shape(context, &[n, b, transformation.in_dim()], &[n, b, d])?;
            Ok(transformation.apply(x.clone()))
        }
    }
}

fn initial_location<B: Backend>(
    x_0: &[f32],
    event_dim: usize,
    device: &B::Device,
) -> SmcResult<Param<Tensor<B, 1>>> {
    if x_0.len() != event_dim {
        return Err(SmcError::DimensionMismatch {
            context: "initial location x_0",
            expected: event_dim,
            found: x_0.len(),
        });
    }
    let data = TensorData::new(x_0.to_vec(), [event_dim]);
    Ok(Param::from_tensor(Tensor::from_data(data, device)))
}

/// Standard normal noise drawn on the host from `rng`.
pub(crate) fn standard_normal<B: Backend, const D: usize>(
    shape: [usize; D],
    rng: &mut SmallRng,
    device: &B::Device,
) -> Tensor<B, D> {
    let values: Vec<f32> = (0..shape.iter().product::<usize>())
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();
    Tensor::from_data(TensorData::new(values, shape), device)
}

fn matrix_tensor<B: Backend>(matrix: &Array2<f32>, device: &B::Device) -> Tensor<B, 2> {
    let (rows, cols) = matrix.dim();
    let data = TensorData::new(matrix.iter().copied().collect::<Vec<f32>>(), [rows, cols]);
    Tensor::from_data(data, device)
}

fn eye_tensor<B: Backend>(d: usize, device: &B::Device) -> Tensor<B, 2> {
    matrix_tensor(&Array2::eye(d), device)
}

fn strict_lower_tensor<B: Backend>(d: usize, device: &B::Device) -> Tensor<B, 2> {
    let mask = Array2::from_shape_fn((d, d), |(i, j)| if i > j { 1.0 } else { 0.0 });
    matrix_tensor(&mask, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowConfig, FlowType};
    use crate::transformations::LinearTransformation;
    use approx::assert_abs_diff_eq;
    use burn::backend::NdArray;
    use ndarray::arr2;
    use rand::SeedableRng;
    use statrs::distribution::Discrete;

    type B = NdArray;

    fn values<const D: usize>(t: Tensor<B, D>) -> Vec<f32> {
        t.into_data().iter::<f32>().collect()
    }

    fn tensor3(v: Vec<f32>, shape: [usize; 3]) -> Tensor<B, 3> {
        Tensor::from_data(TensorData::new(v, shape), &Default::default())
    }

    fn gaussian(l: &Array2<f32>) -> MvNormal<B, LinearTransformation<B>> {
        let device = Default::default();
        MvNormal::new(LinearTransformation::identity(l.nrows(), &device), l, 0.0, &device).unwrap()
    }

    #[test]
    fn test_scale_tril_round_trip() {
        let l = arr2(&[[2.0f32, 9.0], [0.5, 1.5]]);
        let device = Default::default();
        let dist = MvNormal::<B, _>::new(LinearTransformation::identity(2, &device), &l, 0.1, &device)
            .unwrap();
        let got = values(dist.scale_tril());
        // Upper triangle dropped, diagonal restored through the sigma_min floor.
        let expected = [2.0, 0.0, 0.5, 1.5];
        for (g, e) in got.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*g, *e, epsilon = 1e-6);
        }

        // A diagonal below sigma_min is lifted to sigma_min.
        let tiny = MvNormal::<B, _>::new(
            LinearTransformation::identity(1, &device),
            &arr2(&[[0.01f32]]),
            0.1,
            &device,
        )
        .unwrap();
        assert_abs_diff_eq!(values(tiny.scale_tril())[0], 0.1, epsilon = 1e-7);
    }

    #[test]
    fn test_gaussian_log_prob_closed_form() {
        let l = arr2(&[[2.0f32, 0.0], [0.5, 1.5]]);
        let dist = gaussian(&l);
        let cond = Conditioning::State(tensor3(vec![0.0, 0.0, 1.0, -1.0], [2, 1, 2]));
        let x = tensor3(vec![1.0, 2.0, 0.0, 0.0], [2, 1, 2]);
        let got = values(dist.log_prob(&cond, x).unwrap());

        // Σ = L Lᵀ = [[4, 1], [1, 2.5]], det = 9.
        let log_density = |d0: f64, d1: f64| {
            let (a, b, c) = (4.0, 1.0, 2.5);
            let det: f64 = a * c - b * b;
            let maha = (c * d0 * d0 - 2.0 * b * d0 * d1 + a * d1 * d1) / det;
            -0.5 * maha - 0.5 * det.ln() - (2.0 * std::f64::consts::PI).ln()
        };
        assert_abs_diff_eq!(got[0] as f64, log_density(1.0, 2.0), epsilon = 1e-5);
        assert_abs_diff_eq!(got[1] as f64, log_density(-1.0, 1.0), epsilon = 1e-5);
    }

    #[test]
    fn test_gaussian_sample_moments() {
        let l = arr2(&[[1.0f32, 0.0], [0.8, 0.6]]);
        let dist = gaussian(&l);
        let mut rng = SmallRng::seed_from_u64(42);
        let n = 20_000;
        let cond = Conditioning::State(Tensor::<B, 3>::ones([n, 1, 2], &Default::default()));
        let x = values(dist.sample(&cond, &mut rng).unwrap());

        let (mut m0, mut m1) = (0.0f64, 0.0f64);
        for p in x.chunks(2) {
            m0 += p[0] as f64;
            m1 += p[1] as f64;
        }
        m0 /= n as f64;
        m1 /= n as f64;
        let cov01 = x
            .chunks(2)
            .map(|p| (p[0] as f64 - m0) * (p[1] as f64 - m1))
            .sum::<f64>()
            / n as f64;
        assert_abs_diff_eq!(m0, 1.0, epsilon = 0.05);
        assert_abs_diff_eq!(m1, 1.0, epsilon = 0.05);
        assert_abs_diff_eq!(cov01, 0.8, epsilon = 0.05);
    }

    #[test]
    fn test_gaussian_initial_conditioning() {
        let device = Default::default();
        let dist = gaussian(&Array2::eye(2));
        let cond = Conditioning::<B>::Initial {
            n_particles: 4,
            batch_size: 3,
        };
        let err = dist.loc(&cond).unwrap_err();
        assert!(err.is_configuration());

        let dist = dist.with_initial_location(&[1.0, -2.0], &device).unwrap();
        let loc = dist.loc(&cond).unwrap();
        assert_eq!(loc.dims(), [4, 3, 2]);
        assert!(values(loc).chunks(2).all(|p| p == [1.0, -2.0]));

        assert!(matches!(
            gaussian(&Array2::eye(2)).with_initial_location(&[1.0], &device),
            Err(SmcError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_gaussian_dimension_checks() {
        let device = Default::default();
        let err = MvNormal::<B, _>::new(
            LinearTransformation::identity(3, &device),
            &Array2::eye(2),
            0.0,
            &device,
        )
        .unwrap_err();
        assert!(err.is_configuration());

        let dist = gaussian(&Array2::eye(2));
        let cond = Conditioning::State(Tensor::<B, 3>::zeros([5, 2, 3], &device));
        assert!(matches!(dist.loc(&cond), Err(SmcError::Shape { .. })));
    }

    #[test]
    fn test_parameter_counts() {
        let device = Default::default();
        // Transition matrix, raw scale factor and initial location.
        let dist = gaussian(&Array2::eye(2))
            .with_initial_location(&[0.0, 0.0], &device)
            .unwrap();
        assert_eq!(dist.num_params(), 4 + 4 + 2);
        assert_eq!(gaussian(&Array2::eye(3)).num_params(), 9 + 9);

        let dirac = DiracDelta::<B, _>::new(LinearTransformation::<B>::identity(3, &device));
        assert_eq!(dirac.num_params(), 9);

        let mut rng = SmallRng::seed_from_u64(2);
        let config = FlowConfig::new(1, FlowType::RealNvp).hidden_layers(vec![4]);
        let flow = NormalizingFlow::<B>::new(2, &config, &mut rng, &device).unwrap();
        let flow_params = flow.num_params();
        let q = FlowTransformed::new(gaussian(&Array2::eye(2)), flow).unwrap();
        assert_eq!(q.num_params(), 8 + flow_params);
    }

    #[test]
    fn test_poisson_log_prob_matches_statrs() {
        let device = Default::default();
        let dist = Poisson::new(LinearTransformation::<B>::identity(2, &device), PoissonLink::Exp);
        let cond = Conditioning::State(tensor3(vec![0.5, -1.0], [1, 1, 2]));
        let y = tensor3(vec![3.0, 0.0], [1, 1, 2]);
        let got = values(ConditionalDistribution::<B>::log_prob(&dist, &cond, y).unwrap())[0];

        let p0 = statrs::distribution::Poisson::new(0.5f64.exp()).unwrap();
        let p1 = statrs::distribution::Poisson::new((-1.0f64).exp()).unwrap();
        assert_abs_diff_eq!(got as f64, p0.ln_pmf(3) + p1.ln_pmf(0), epsilon = 1e-4);
    }

    #[test]
    fn test_poisson_softplus_samples() {
        let device = Default::default();
        let dist = Poisson::new(LinearTransformation::<B>::identity(1, &device), PoissonLink::Softplus);
        let n = 10_000;
        let eta = 3.0f32;
        let cond = Conditioning::State(Tensor::<B, 3>::full([n, 1, 1], eta, &device));
        let mut rng = SmallRng::seed_from_u64(7);
        let y = values(ConditionalDistribution::<B>::sample(&dist, &cond, &mut rng).unwrap());
        assert!(y.iter().all(|k| *k >= 0.0 && k.fract() == 0.0));
        let mean = y.iter().map(|&k| k as f64).sum::<f64>() / n as f64;
        let rate = (1.0 + (eta as f64).exp()).ln();
        assert_abs_diff_eq!(mean, rate, epsilon = 0.1);
    }

    #[test]
    fn test_poisson_zero_rate_is_rejected() {
        let device = Default::default();
        let dist = Poisson::new(LinearTransformation::<B>::identity(1, &device), PoissonLink::Exp);
        let cond = Conditioning::State(Tensor::<B, 3>::full([2, 1, 1], -200.0, &device));
        let mut rng = SmallRng::seed_from_u64(0);
        let err = ConditionalDistribution::<B>::sample(&dist, &cond, &mut rng).unwrap_err();
        assert!(err.is_numerical());
    }

    #[test]
    fn test_dirac_delta() {
        let device = Default::default();
        let a = LinearTransformation::<B>::from_array(&arr2(&[[2.0, 0.0], [0.0, 3.0]]), &device);
        let dist = DiracDelta::<B, _>::new(a);
        let cond = Conditioning::State(tensor3(vec![1.0, 1.0, -1.0, 2.0], [2, 1, 2]));
        let mut rng = SmallRng::seed_from_u64(0);
        let x = dist.sample(&cond, &mut rng).unwrap();
        assert_eq!(values(x.clone()), vec![2.0, 3.0, -2.0, 6.0]);
        assert_eq!(values(dist.log_prob(&cond, x).unwrap()), vec![0.0, 0.0]);
    }

    #[test]
    fn test_flow_transformed_density_integrates_to_one() {
        let device = Default::default();
        let mut rng = SmallRng::seed_from_u64(5);
        let config = FlowConfig::new(1, FlowType::RealNvp).hidden_layers(vec![8]);
        let mut flow = NormalizingFlow::<B>::new(2, &config, &mut rng, &device).unwrap();
        flow.sharpen(10.0, 0.2);
        let dist = FlowTransformed::new(gaussian(&Array2::eye(2)), flow).unwrap();

        let (lo, hi, k) = (-10.0f32, 10.0f32, 200usize);
        let step = (hi - lo) / k as f32;
        let grid: Vec<f32> = (0..k)
            .flat_map(|i| (0..k).flat_map(move |j| [lo + (i as f32 + 0.5) * step, lo + (j as f32 + 0.5) * step]))
            .collect();
        let x = tensor3(grid, [k * k, 1, 2]);
        let cond = Conditioning::State(Tensor::<B, 3>::zeros([k * k, 1, 2], &device));
        let mass: f64 = values(dist.log_prob(&cond, x).unwrap())
            .iter()
            .map(|lp| (*lp as f64).exp() * (step as f64).powi(2))
            .sum();
        assert_abs_diff_eq!(mass, 1.0, epsilon = 2e-2);
    }

    #[test]
    fn test_flow_event_size_mismatch() {
        let device = Default::default();
        let mut rng = SmallRng::seed_from_u64(0);
        let flow = NormalizingFlow::<B>::new(3, &FlowConfig::default(), &mut rng, &device).unwrap();
        let err = FlowTransformed::new(gaussian(&Array2::eye(2)), flow).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_diag_normal() {
        let device = Default::default();
        let loc = Tensor::<B, 2>::from_data(TensorData::new(vec![0.0f32, 1.0], [1, 2]), &device);
        let scale = Tensor::<B, 2>::from_data(TensorData::new(vec![1.0f32, 2.0], [1, 2]), &device);
        let dist = DiagNormal::new(loc, scale).unwrap();
        let cond = Conditioning::Initial {
            n_particles: 1,
            batch_size: 1,
        };
        let x = tensor3(vec![1.0, 1.0], [1, 1, 2]);
        let got = values(dist.log_prob(&cond, x).unwrap())[0];
        let expected = -0.5 - 2.0f32.ln() - (2.0 * PI).ln();
        assert_abs_diff_eq!(got, expected, epsilon = 1e-5);

        let wrong_batch = Conditioning::<B>::Initial {
            n_particles: 1,
            batch_size: 2,
        };
        assert!(dist.loc(&wrong_batch).is_err());
    }
}
