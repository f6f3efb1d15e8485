//! Normalizing flows built from affine autoregressive or coupling bijections.
//!
//! A flow is a composition of `n_layers` bijections. Consecutive layers are separated by the
//! cyclic permutation `[1, 2, …, D-1, 0]` so that across layers every coordinate is eventually
//! conditioned on every other one. No permutation follows the last layer.
//!
//! Each bijection computes a shift and a log-scale for some coordinates from the remaining
//! ones with a small ReLU network and transforms those coordinates affinely:
//!
//! * **MAF** (masked autoregressive flow): `inverse` takes one network pass, `forward` takes
//!   `D` sequential passes.
//! * **IAF** (inverse autoregressive flow): the opposite trade-off, `forward` is a single pass.
//! * **RealNVP**: a coupling layer, both directions take one pass. Needs `D >= 2`.
//!
//! [`NormalizingFlow::reversed`] swaps the two directions of any flow.

use crate::errors::{check_shape, SmcError, SmcResult};
use burn::module::{Ignored, Param};
use burn::prelude::*;
use burn::tensor::activation::relu;
use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::StandardNormal;
use std::fmt;
use std::str::FromStr;

const LOG_SCALE_MIN: f32 = -5.0;
const LOG_SCALE_MAX: f32 = 3.0;
const OUTPUT_INIT_STD: f32 = 0.01;

/// The family of bijection used in every layer of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    Maf,
    Iaf,
    RealNvp,
}

impl FromStr for FlowType {
    type Err = SmcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "maf" => Ok(FlowType::Maf),
            "iaf" => Ok(FlowType::Iaf),
            "realnvp" | "real_nvp" => Ok(FlowType::RealNvp),
            _ => Err(SmcError::UnknownFlowType(s.to_string())),
        }
    }
}

impl fmt::Display for FlowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlowType::Maf => "MAF",
            FlowType::Iaf => "IAF",
            FlowType::RealNvp => "RealNVP",
        };
        write!(f, "{name}")
    }
}

/// Shape of a flow: number of layers, hidden widths of each conditioner network and the
/// bijection family.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowConfig {
    pub n_layers: usize,
    pub hidden_layers: Vec<usize>,
    pub flow_type: FlowType,
}

impl FlowConfig {
    pub fn new(n_layers: usize, flow_type: FlowType) -> Self {
        Self {
            n_layers,
            hidden_layers: vec![32],
            flow_type,
        }
    }

    /// Sets the hidden widths of the conditioner networks.
    pub fn hidden_layers(mut self, hidden_layers: Vec<usize>) -> Self {
        self.hidden_layers = hidden_layers;
        self
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self::new(4, FlowType::Iaf)
    }
}

/// Masked autoencoder (MADE) producing autoregressive shifts and log-scales.
///
/// Output `i` of each head only depends on inputs `0..i`.
#[derive(Module, Debug)]
pub struct Made<B: Backend> {
    weights: Vec<Param<Tensor<B, 2>>>,
    biases: Vec<Param<Tensor<B, 1>>>,
}

impl<B: Backend> Made<B> {
    pub fn new(
        event_size: usize,
        hidden_layers: &[usize],
        rng: &mut SmallRng,
        device: &B::Device,
    ) -> Self {
        let (weights, biases) = init_dense(event_size, hidden_layers, 2 * event_size, rng, device);
        Self { weights, biases }
    }

    pub fn event_size(&self) -> usize {
        self.weights[0].val().dims()[0]
    }

    fn hidden_sizes(&self) -> Vec<usize> {
        self.weights[..self.weights.len() - 1]
            .iter()
            .map(|w| w.val().dims()[1])
            .collect()
    }

    /// Returns `(shift, log_scale)`, each of shape `[n, event_size]`.
    pub fn shift_and_log_scale(&self, x: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let d = self.event_size();
        let masks = made_masks::<B>(d, &self.hidden_sizes(), &x.device());
        let out = dense_forward(x, &self.weights, &self.biases, Some(&masks));
        let shift = out.clone().narrow(1, 0, d);
        let log_scale = clip_log_scale(out.narrow(1, d, d));
        (shift, log_scale)
    }
}

/// Unmasked conditioner of a coupling layer: maps the first `num_masked` coordinates to a
/// shift and log-scale for the rest.
#[derive(Module, Debug)]
pub struct CouplingNet<B: Backend> {
    weights: Vec<Param<Tensor<B, 2>>>,
    biases: Vec<Param<Tensor<B, 1>>>,
    num_masked: usize,
}

impl<B: Backend> CouplingNet<B> {
    pub fn new(
        num_masked: usize,
        event_size: usize,
        hidden_layers: &[usize],
        rng: &mut SmallRng,
        device: &B::Device,
    ) -> Self {
        let n_out = event_size - num_masked;
        let (weights, biases) = init_dense(num_masked, hidden_layers, 2 * n_out, rng, device);
        Self {
            weights,
            biases,
            num_masked,
        }
    }

    /// Number of leading coordinates passed through unchanged.
    pub fn num_masked(&self) -> usize {
        self.num_masked
    }

    fn shift_and_log_scale(&self, x1: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let out = dense_forward(x1, &self.weights, &self.biases, None);
        let n_out = out.dims()[1] / 2;
        let shift = out.clone().narrow(1, 0, n_out);
        let log_scale = clip_log_scale(out.narrow(1, n_out, n_out));
        (shift, log_scale)
    }

    /// Affine coupling in either direction, returning the log-determinant as `[n, 1]`.
    fn couple(&self, inp: Tensor<B, 2>, inverse: bool) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let d = inp.dims()[1];
        let kept = inp.clone().narrow(1, 0, self.num_masked);
        let moved = inp.narrow(1, self.num_masked, d - self.num_masked);
        let (shift, log_scale) = self.shift_and_log_scale(kept.clone());
        if inverse {
            let moved = (moved - shift) * log_scale.clone().neg().exp();
            (Tensor::cat(vec![kept, moved], 1), log_scale.sum_dim(1).neg())
        } else {
            let moved = moved * log_scale.clone().exp() + shift;
            (Tensor::cat(vec![kept, moved], 1), log_scale.sum_dim(1))
        }
    }
}

/// Trainable parameters of a conditioner network, layer by layer.
pub trait Conditioner<B: Backend> {
    fn weights(&self) -> &[Param<Tensor<B, 2>>];
    fn biases(&self) -> &[Param<Tensor<B, 1>>];
}

impl<B: Backend> Conditioner<B> for Made<B> {
    fn weights(&self) -> &[Param<Tensor<B, 2>>] {
        &self.weights
    }

    fn biases(&self) -> &[Param<Tensor<B, 1>>] {
        &self.biases
    }
}

impl<B: Backend> Conditioner<B> for CouplingNet<B> {
    fn weights(&self) -> &[Param<Tensor<B, 2>>] {
        &self.weights
    }

    fn biases(&self) -> &[Param<Tensor<B, 1>>] {
        &self.biases
    }
}

/// `out = (inp - shift(inp)) · exp(-log_scale(inp))`, one network pass.
fn autoregressive_one_pass<B: Backend>(
    made: &Made<B>,
    inp: Tensor<B, 2>,
) -> (Tensor<B, 2>, Tensor<B, 2>) {
    let (shift, log_scale) = made.shift_and_log_scale(inp.clone());
    let out = (inp - shift) * log_scale.clone().neg().exp();
    (out, log_scale.sum_dim(1).neg())
}

/// Solves `out = inp · exp(log_scale(out)) + shift(out)` coordinate by coordinate.
fn autoregressive_sequential<B: Backend>(
    made: &Made<B>,
    inp: Tensor<B, 2>,
) -> (Tensor<B, 2>, Tensor<B, 2>) {
    let [n, d] = inp.dims();
    let mut out = Tensor::<B, 2>::zeros([n, d], &inp.device());
    let mut log_scale = Tensor::<B, 2>::zeros([n, d], &inp.device());
    for _ in 0..d {
        let (shift, ls) = made.shift_and_log_scale(out);
        out = inp.clone() * ls.clone().exp() + shift;
        log_scale = ls;
    }
    (out, log_scale.sum_dim(1))
}

/// Stack of invertible layers with tractable log-determinants.
///
/// The flow is a burn [`Module`]: its conditioners can be visited, mapped and stepped by an
/// optimizer like any other module. Autoregressive flows (MAF, IAF) keep their layers in
/// `autoregressive`, RealNVP flows in `coupling`; the other list is empty.
#[derive(Module, Debug)]
pub struct NormalizingFlow<B: Backend> {
    autoregressive: Vec<Made<B>>,
    coupling: Vec<CouplingNet<B>>,
    flow_type: Ignored<FlowType>,
    event_size: usize,
    reversed: bool,
}

impl<B: Backend> NormalizingFlow<B> {
    /// Creates a flow on `event_size` coordinates with randomly initialized conditioners.
    ///
    /// The output layers of the conditioners start close to zero so a fresh flow is close to
    /// the identity.
    pub fn new(
        event_size: usize,
        config: &FlowConfig,
        rng: &mut SmallRng,
        device: &B::Device,
    ) -> SmcResult<Self> {
        if event_size == 0 {
            return Err(SmcError::config("flow event size must be at least 1"));
        }
        if config.n_layers == 0 {
            return Err(SmcError::config("flow needs at least one layer"));
        }
        if config.hidden_layers.iter().any(|&h| h == 0) {
            return Err(SmcError::config("flow hidden layers must have positive width"));
        }
        if config.flow_type == FlowType::RealNvp && event_size < 2 {
            return Err(SmcError::DimensionMismatch {
                context: "RealNVP event size (minimum)",
                expected: 2,
                found: event_size,
            });
        }

        let (autoregressive, coupling) = match config.flow_type {
            FlowType::Maf | FlowType::Iaf => {
                let layers = (0..config.n_layers)
                    .map(|_| Made::new(event_size, &config.hidden_layers, rng, device))
                    .collect();
                (layers, Vec::new())
            }
            FlowType::RealNvp => {
                let num_masked = event_size / 2;
                let layers = (0..config.n_layers)
                    .map(|_| {
                        CouplingNet::new(num_masked, event_size, &config.hidden_layers, rng, device)
                    })
                    .collect();
                (Vec::new(), layers)
            }
        };

        Ok(Self {
            autoregressive,
            coupling,
            flow_type: Ignored(config.flow_type),
            event_size,
            reversed: false,
        })
    }

    /// Returns the same flow with `forward` and `inverse` swapped. Parameters are shared by
    /// value (the layers are cloned).
    pub fn reversed(&self) -> Self {
        Self {
            reversed: !self.reversed,
            ..self.clone()
        }
    }

    pub fn flow_type(&self) -> FlowType {
        self.flow_type.0
    }

    pub fn event_size(&self) -> usize {
        self.event_size
    }

    pub fn n_layers(&self) -> usize {
        self.autoregressive.len() + self.coupling.len()
    }

    pub fn is_reversed(&self) -> bool {
        self.reversed
    }

    /// The conditioner network of every layer, first layer first.
    pub fn conditioners(&self) -> Vec<&dyn Conditioner<B>> {
        self.autoregressive
            .iter()
            .map(|m| m as &dyn Conditioner<B>)
            .chain(self.coupling.iter().map(|c| c as &dyn Conditioner<B>))
            .collect()
    }

    /// Maps base samples `z` (`[n, batch, D]`) to `x`, with `log|det ∂x/∂z|` of shape `[n, batch]`.
    pub fn forward(&self, z: Tensor<B, 3>) -> SmcResult<(Tensor<B, 3>, Tensor<B, 2>)> {
        self.apply(z, !self.reversed)
    }

    /// Maps `x` (`[n, batch, D]`) back to `z`, with `log|det ∂z/∂x|` of shape `[n, batch]`.
    pub fn inverse(&self, x: Tensor<B, 3>) -> SmcResult<(Tensor<B, 3>, Tensor<B, 2>)> {
        self.apply(x, self.reversed)
    }

    fn apply(&self, t: Tensor<B, 3>, forward: bool) -> SmcResult<(Tensor<B, 3>, Tensor<B, 2>)> {
        let [n, b, d] = t.dims();
        check_shape("flow input event size", &[self.event_size], &[d])?;
        let flat = t.reshape([n * b, d]);
        let (out, log_det) = if forward {
            self.forward_flat(flat)
        } else {
            self.inverse_flat(flat)
        };
        Ok((out.reshape([n, b, d]), log_det.reshape([n, b])))
    }

    /// Maps `z ↦ x` through layer `i`, returning `log|det ∂x/∂z|` of shape `[n, 1]`.
    fn layer_forward(&self, i: usize, z: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        match self.flow_type() {
            FlowType::Iaf => autoregressive_one_pass(&self.autoregressive[i], z),
            FlowType::Maf => autoregressive_sequential(&self.autoregressive[i], z),
            FlowType::RealNvp => self.coupling[i].couple(z, false),
        }
    }

    /// Maps `x ↦ z` through layer `i`, returning `log|det ∂z/∂x|` of shape `[n, 1]`.
    fn layer_inverse(&self, i: usize, x: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        match self.flow_type() {
            FlowType::Iaf => autoregressive_sequential(&self.autoregressive[i], x),
            FlowType::Maf => autoregressive_one_pass(&self.autoregressive[i], x),
            FlowType::RealNvp => self.coupling[i].couple(x, true),
        }
    }

    fn forward_flat(&self, mut z: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let mut log_det = Tensor::<B, 2>::zeros([z.dims()[0], 1], &z.device());
        let last = self.n_layers() - 1;
        for i in 0..=last {
            let (out, ld) = self.layer_forward(i, z);
            log_det = log_det + ld;
            z = if i < last { permute(out) } else { out };
        }
        (z, log_det)
    }

    fn inverse_flat(&self, mut x: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let mut log_det = Tensor::<B, 2>::zeros([x.dims()[0], 1], &x.device());
        let last = self.n_layers() - 1;
        for i in (0..=last).rev() {
            if i < last {
                x = unpermute(x);
            }
            let (out, ld) = self.layer_inverse(i, x);
            log_det = log_det + ld;
            x = out;
        }
        (x, log_det)
    }
}

#[cfg(test)]
impl<B: Backend> NormalizingFlow<B> {
    /// Scales the output weights and shifts the output biases of every conditioner.
    pub(crate) fn sharpen(&mut self, weight_factor: f32, bias_shift: f32) {
        let made = self
            .autoregressive
            .iter_mut()
            .map(|m| (&mut m.weights, &mut m.biases));
        let coupling = self
            .coupling
            .iter_mut()
            .map(|c| (&mut c.weights, &mut c.biases));
        for (weights, biases) in made.chain(coupling) {
            let last = weights.len() - 1;
            let w = weights[last].val().mul_scalar(weight_factor);
            weights[last] = Param::from_tensor(w);
            let b = biases[last].val().add_scalar(bias_shift);
            biases[last] = Param::from_tensor(b);
        }
    }
}

/// `y_i = x_{(i + 1) mod D}`.
fn permute<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let d = x.dims()[1];
    if d < 2 {
        return x;
    }
    Tensor::cat(vec![x.clone().narrow(1, 1, d - 1), x.narrow(1, 0, 1)], 1)
}

fn unpermute<B: Backend>(y: Tensor<B, 2>) -> Tensor<B, 2> {
    let d = y.dims()[1];
    if d < 2 {
        return y;
    }
    Tensor::cat(vec![y.clone().narrow(1, d - 1, 1), y.narrow(1, 0, d - 1)], 1)
}

/// Clips to `[LOG_SCALE_MIN, LOG_SCALE_MAX]` in the forward pass while letting the gradient
/// through unchanged.
fn clip_log_scale<B: Backend>(log_scale: Tensor<B, 2>) -> Tensor<B, 2> {
    let clipped = log_scale.clone().clamp(LOG_SCALE_MIN, LOG_SCALE_MAX);
    log_scale.clone() + (clipped - log_scale).detach()
}

type DenseParams<B> = (Vec<Param<Tensor<B, 2>>>, Vec<Param<Tensor<B, 1>>>);

fn init_dense<B: Backend>(
    n_in: usize,
    hidden_layers: &[usize],
    n_out: usize,
    rng: &mut SmallRng,
    device: &B::Device,
) -> DenseParams<B> {
    let mut weights = Vec::with_capacity(hidden_layers.len() + 1);
    let mut biases = Vec::with_capacity(hidden_layers.len() + 1);
    let mut width = n_in;
    for &h in hidden_layers {
        let std = (2.0 / width.max(1) as f32).sqrt();
        weights.push(random_param([width, h], std, rng, device));
        biases.push(Param::from_tensor(Tensor::zeros([h], device)));
        width = h;
    }
    weights.push(random_param([width, n_out], OUTPUT_INIT_STD, rng, device));
    biases.push(Param::from_tensor(Tensor::zeros([n_out], device)));
    (weights, biases)
}

fn random_param<B: Backend>(
    shape: [usize; 2],
    std: f32,
    rng: &mut SmallRng,
    device: &B::Device,
) -> Param<Tensor<B, 2>> {
    let values: Vec<f32> = (0..shape[0] * shape[1])
        .map(|_| std * rng.sample::<f32, _>(StandardNormal))
        .collect();
    Param::from_tensor(Tensor::from_data(TensorData::new(values, shape), device))
}

fn dense_forward<B: Backend>(
    x: Tensor<B, 2>,
    weights: &[Param<Tensor<B, 2>>],
    biases: &[Param<Tensor<B, 1>>],
    masks: Option<&[Tensor<B, 2>]>,
) -> Tensor<B, 2> {
    let last = weights.len() - 1;
    let mut h = x;
    for (i, (w, b)) in weights.iter().zip(biases).enumerate() {
        let mut w = w.val();
        if let Some(masks) = masks {
            w = w * masks[i].clone();
        }
        let n = h.dims()[0];
        let n_out = w.dims()[1];
        h = h.matmul(w) + b.val().reshape([1, n_out]).expand([n, n_out]);
        if i < last {
            h = relu(h);
        }
    }
    h
}

/// Connectivity masks for a MADE network with inputs of degree `1..=D`, hidden units of
/// degree `k mod max(D - 1, 1) + 1` and two output heads of degree `1..=D`.
fn made_masks<B: Backend>(
    event_size: usize,
    hidden_layers: &[usize],
    device: &B::Device,
) -> Vec<Tensor<B, 2>> {
    let max_hidden_degree = event_size.saturating_sub(1).max(1);
    let mut prev: Vec<usize> = (1..=event_size).collect();
    let mut masks = Vec::with_capacity(hidden_layers.len() + 1);
    for &h in hidden_layers {
        let degrees: Vec<usize> = (0..h).map(|k| k % max_hidden_degree + 1).collect();
        masks.push(mask_tensor(&prev, &degrees, |d_in, d_out| d_out >= d_in, device));
        prev = degrees;
    }
    let out_degrees: Vec<usize> = (1..=event_size).chain(1..=event_size).collect();
    masks.push(mask_tensor(&prev, &out_degrees, |d_in, d_out| d_out > d_in, device));
    masks
}

fn mask_tensor<B: Backend>(
    in_degrees: &[usize],
    out_degrees: &[usize],
    connected: impl Fn(usize, usize) -> bool,
    device: &B::Device,
) -> Tensor<B, 2> {
    let connected = &connected;
    let values: Vec<f32> = in_degrees
        .iter()
        .flat_map(|&d_in| {
            out_degrees
                .iter()
                .map(move |&d_out| if connected(d_in, d_out) { 1.0 } else { 0.0 })
        })
        .collect();
    let shape = [in_degrees.len(), out_degrees.len()];
    Tensor::from_data(TensorData::new(values, shape), device)
}
