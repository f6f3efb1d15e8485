/*!
Amortized proposals computed from the observation sequence.

An [`Encoder`] sees the whole observation batch `[batch, T, Dy]` once per forward pass and
returns per-timestep proposal parameters. The engine only reads these through
[`EncodedProposals::proposal_params`]; the encoder never sees particles or weights.
*/

use crate::distributions::DiagNormal;
use crate::errors::{check_shape, SmcError, SmcResult};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::{relu, softplus};

/// Mean and scale of a diagonal Gaussian proposal for one time step, each `[batch, Dx]`.
#[derive(Debug, Clone)]
pub struct ProposalParams<B: Backend> {
    pub loc: Tensor<B, 2>,
    pub scale: Tensor<B, 2>,
}

impl<B: Backend> ProposalParams<B> {
    pub fn into_distribution(self) -> SmcResult<DiagNormal<B>> {
        DiagNormal::new(self.loc, self.scale)
    }
}

/// Proposal parameters for every time step, stored as `[T, batch, Dx]` tensors.
#[derive(Debug, Clone)]
pub struct EncodedProposals<B: Backend> {
    loc: Tensor<B, 3>,
    scale: Tensor<B, 3>,
}

impl<B: Backend> EncodedProposals<B> {
    pub fn new(loc: Tensor<B, 3>, scale: Tensor<B, 3>) -> SmcResult<Self> {
        check_shape("encoded proposal scale", &loc.dims(), &scale.dims())?;
        Ok(Self { loc, scale })
    }

    /// Number of time steps.
    pub fn len(&self) -> usize {
        self.loc.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn batch_size(&self) -> usize {
        self.loc.dims()[1]
    }

    pub fn state_dim(&self) -> usize {
        self.loc.dims()[2]
    }

    pub fn proposal_params(&self, t: usize) -> SmcResult<ProposalParams<B>> {
        let [t_len, b, d] = self.loc.dims();
        if t >= t_len {
            return Err(SmcError::Shape {
                context: "encoded proposal time index",
                expected: vec![t_len],
                found: vec![t],
            });
        }
        Ok(ProposalParams {
            loc: self.loc.clone().narrow(0, t, 1).reshape([b, d]),
            scale: self.scale.clone().narrow(0, t, 1).reshape([b, d]),
        })
    }
}

/// Produces proposal parameters from a batch of observation sequences.
pub trait Encoder<B: Backend> {
    /// Size of the proposed states.
    fn state_dim(&self) -> usize;

    /// Size of one observation.
    fn obs_dim(&self) -> usize;

    /// Encodes observations of shape `[batch, T, Dy]`.
    fn encode(&self, obs: Tensor<B, 3>) -> SmcResult<EncodedProposals<B>>;
}

/// One-hidden-layer network over a centered window of `2 * window + 1` observations.
///
/// Observations outside the sequence are zero-padded. The scale head is
/// `softplus(·) + sigma_min`.
#[derive(Module, Debug)]
pub struct MlpEncoder<B: Backend> {
    hidden: Linear<B>,
    loc_head: Linear<B>,
    scale_head: Linear<B>,
    window: usize,
    sigma_min: f32,
}

impl<B: Backend> MlpEncoder<B> {
    pub fn new(
        obs_dim: usize,
        state_dim: usize,
        hidden_size: usize,
        window: usize,
        sigma_min: f32,
        device: &B::Device,
    ) -> SmcResult<Self> {
        if obs_dim == 0 || state_dim == 0 || hidden_size == 0 {
            return Err(SmcError::config(
                "encoder observation, state and hidden sizes must be positive",
            ));
        }
        if !(sigma_min >= 0.0 && sigma_min.is_finite()) {
            return Err(SmcError::config(format!(
                "encoder sigma_min must be finite and non-negative, got {sigma_min}"
            )));
        }
        let n_in = obs_dim * (2 * window + 1);
        Ok(Self {
            hidden: LinearConfig::new(n_in, hidden_size).init(device),
            loc_head: LinearConfig::new(hidden_size, state_dim).init(device),
            scale_head: LinearConfig::new(hidden_size, state_dim).init(device),
            window,
            sigma_min,
        })
    }

    /// Stacks the `2 * window + 1` neighbours of every time step on the last axis.
    fn windows(&self, obs: Tensor<B, 3>) -> Tensor<B, 3> {
        let [b, t_len, dy] = obs.dims();
        let w = self.window;
        if w == 0 {
            return obs;
        }
        let pad = Tensor::<B, 3>::zeros([b, w, dy], &obs.device());
        let padded = Tensor::cat(vec![pad.clone(), obs, pad], 1);
        let shifted = (0..2 * w + 1)
            .map(|s| padded.clone().narrow(1, s, t_len))
            .collect();
        Tensor::cat(shifted, 2)
    }
}

impl<B: Backend> Encoder<B> for MlpEncoder<B> {
    fn state_dim(&self) -> usize {
        self.loc_head.weight.val().dims()[1]
    }

    fn obs_dim(&self) -> usize {
        self.hidden.weight.val().dims()[0] / (2 * self.window + 1)
    }

    fn encode(&self, obs: Tensor<B, 3>) -> SmcResult<EncodedProposals<B>> {
        let [b, t_len, dy] = obs.dims();
        check_shape("encoder observations", &[b, t_len, self.obs_dim()], &[b, t_len, dy])?;
        let h = relu(self.hidden.forward(self.windows(obs)));
        let loc = self.loc_head.forward(h.clone());
        let scale = softplus(self.scale_head.forward(h), 1.0).add_scalar(self.sigma_min);
        EncodedProposals::new(loc.swap_dims(0, 1), scale.swap_dims(0, 1))
    }
}
