/*!
Deterministic maps that turn a conditioning state into the location parameter of a
distribution.

Every transformation works on batched particle tensors of shape
`[n_particles, batch_size, in_dim]` and returns `[n_particles, batch_size, out_dim]`.
Transformations are pure: they hold parameters but no state across calls.

# Examples

```rust
use burn::backend::NdArray;
use burn::prelude::*;
use mini_smc::transformations::{LorenzTransformation, Transformation};

type B = NdArray;

let lorenz = LorenzTransformation::new(10.0, 28.0, 8.0 / 3.0, 0.01);
let x = Tensor::<B, 3>::ones([4, 2, 3], &Default::default());
let next = Transformation::<B>::apply(&lorenz, x);
assert_eq!(next.dims(), [4, 2, 3]);
```
*/

use burn::module::Param;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;
use ndarray::Array2;

/// A map from conditioning states to location parameters.
///
/// # Type Parameters
///
/// * `B`: The `burn` backend the tensors live on.
pub trait Transformation<B: Backend> {
    /// Size of the last axis of the input.
    fn in_dim(&self) -> usize;

    /// Size of the last axis of the output.
    fn out_dim(&self) -> usize;

    /// Applies the map to a tensor of shape `[n_particles, batch_size, in_dim]`.
    fn apply(&self, x: Tensor<B, 3>) -> Tensor<B, 3>;
}

/// `x ↦ A x` with a trainable matrix `A` of shape `[out_dim, in_dim]`.
#[derive(Module, Debug)]
pub struct LinearTransformation<B: Backend> {
    pub weight: Param<Tensor<B, 2>>,
}

impl<B: Backend> LinearTransformation<B> {
    /// Wraps `weight` (shape `[out_dim, in_dim]`) as a trainable parameter.
    pub fn new(weight: Tensor<B, 2>) -> Self {
        Self {
            weight: Param::from_tensor(weight),
        }
    }

    /// Builds the map from a host matrix.
    pub fn from_array(matrix: &Array2<f32>, device: &B::Device) -> Self {
        let (rows, cols) = matrix.dim();
        let data = TensorData::new(matrix.iter().copied().collect::<Vec<f32>>(), [rows, cols]);
        Self::new(Tensor::from_data(data, device))
    }

    /// The identity map on `dim` coordinates.
    pub fn identity(dim: usize, device: &B::Device) -> Self {
        Self::from_array(&Array2::eye(dim), device)
    }
}

impl<B: Backend> Transformation<B> for LinearTransformation<B> {
    fn in_dim(&self) -> usize {
        self.weight.val().dims()[1]
    }

    fn out_dim(&self) -> usize {
        self.weight.val().dims()[0]
    }

    fn apply(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [n, b, d_in] = x.dims();
        let weight = self.weight.val();
        let d_out = weight.dims()[0];
        x.reshape([n * b, d_in])
            .matmul(weight.transpose())
            .reshape([n, b, d_out])
    }
}

/// A feed-forward network: ReLU hidden layers followed by a linear output layer.
#[derive(Module, Debug)]
pub struct MlpTransformation<B: Backend> {
    hidden: Vec<Linear<B>>,
    output: Linear<B>,
}

impl<B: Backend> MlpTransformation<B> {
    /// Creates a network `in_dim → hidden_layers… → out_dim`.
    pub fn new(in_dim: usize, hidden_layers: &[usize], out_dim: usize, device: &B::Device) -> Self {
        let mut hidden = Vec::with_capacity(hidden_layers.len());
        let mut width = in_dim;
        for &h in hidden_layers {
            hidden.push(LinearConfig::new(width, h).init(device));
            width = h;
        }
        let output = LinearConfig::new(width, out_dim).init(device);
        Self { hidden, output }
    }
}

impl<B: Backend> Transformation<B> for MlpTransformation<B> {
    fn in_dim(&self) -> usize {
        self.hidden
            .first()
            .unwrap_or(&self.output)
            .weight
            .val()
            .dims()[0]
    }

    fn out_dim(&self) -> usize {
        self.output.weight.val().dims()[1]
    }

    fn apply(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let h = self
            .hidden
            .iter()
            .fold(x, |h, layer| relu(layer.forward(h)));
        self.output.forward(h)
    }
}

/// One explicit Euler step of the FitzHugh–Nagumo neuron model on states `(v, w)`:
///
/// `v' = v + dt (v - v³/3 - w + I)`, `w' = w + dt a (b v - c w)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FhnTransformation {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub i_ext: f32,
    pub dt: f32,
}

impl FhnTransformation {
    pub fn new(a: f32, b: f32, c: f32, i_ext: f32, dt: f32) -> Self {
        Self { a, b, c, i_ext, dt }
    }
}

impl<B: Backend> Transformation<B> for FhnTransformation {
    fn in_dim(&self) -> usize {
        2
    }

    fn out_dim(&self) -> usize {
        2
    }

    fn apply(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let v = x.clone().narrow(2, 0, 1);
        let w = x.narrow(2, 1, 1);

        let dv = (v.clone() - v.clone().powi_scalar(3).div_scalar(3.0) - w.clone())
            .add_scalar(self.i_ext);
        let dw = (v.clone().mul_scalar(self.b) - w.clone().mul_scalar(self.c)).mul_scalar(self.a);

        Tensor::cat(
            vec![v + dv.mul_scalar(self.dt), w + dw.mul_scalar(self.dt)],
            2,
        )
    }
}

/// One explicit Euler step of the Lorenz system on states `(x, y, z)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LorenzTransformation {
    pub sigma: f32,
    pub rho: f32,
    pub beta: f32,
    pub dt: f32,
}

impl LorenzTransformation {
    pub fn new(sigma: f32, rho: f32, beta: f32, dt: f32) -> Self {
        Self {
            sigma,
            rho,
            beta,
            dt,
        }
    }
}

impl<B: Backend> Transformation<B> for LorenzTransformation {
    fn in_dim(&self) -> usize {
        3
    }

    fn out_dim(&self) -> usize {
        3
    }

    fn apply(&self, state: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = state.clone().narrow(2, 0, 1);
        let y = state.clone().narrow(2, 1, 1);
        let z = state.narrow(2, 2, 1);

        let dx = (y.clone() - x.clone()).mul_scalar(self.sigma);
        let dy = x.clone() * (z.clone().neg().add_scalar(self.rho)) - y.clone();
        let dz = x.clone() * y.clone() - z.clone().mul_scalar(self.beta);

        Tensor::cat(
            vec![
                x + dx.mul_scalar(self.dt),
                y + dy.mul_scalar(self.dt),
                z + dz.mul_scalar(self.dt),
            ],
            2,
        )
    }
}

impl<B: Backend, T: Transformation<B> + ?Sized> Transformation<B> for &T {
    fn in_dim(&self) -> usize {
        (**self).in_dim()
    }

    fn out_dim(&self) -> usize {
        (**self).out_dim()
    }

    fn apply(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        (**self).apply(x)
    }
}
