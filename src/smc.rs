//! Sequential Monte Carlo estimation of the log marginal likelihood of state-space models.
//!
//! A model is a triple of [`ConditionalDistribution`]s: the proposal `q`, the transition `f`
//! and the emission `g`. One forward pass over observations `y_0, …, y_{T-1}` propagates
//! `n_particles` particles per sequence:
//!
//! 1. resample the particles of step `t-1` (for `t >= 1`),
//! 2. propose `X_t` from `q` (or an encoder, or `f` itself under the bootstrap proposal),
//! 3. weight `log W_t = log f(X_t | X_{t-1}) + log g(y_t | X_t) - log q(X_t | X_{t-1}, y_t)`,
//! 4. accumulate `log Z += logsumexp(log w̄_{t-1} + log W_t)`.
//!
//! `log w̄_{t-1}` is the carried normalized log-weight, `-log n` after resampling. The result
//! `log Z` is differentiable with respect to every parameter of the model except through
//! ancestor selection, which is a stop-gradient boundary.
//!
//! # Examples
//!
//! ```rust
//! use burn::backend::{Autodiff, NdArray};
//! use burn::prelude::*;
//! use mini_smc::distributions::MvNormal;
//! use mini_smc::smc::{Smc, SmcConfig};
//! use mini_smc::transformations::LinearTransformation;
//! use ndarray::Array2;
//!
//! type B = Autodiff<NdArray>;
//! let device = Default::default();
//!
//! let f = MvNormal::new(LinearTransformation::<B>::identity(2, &device), &Array2::eye(2), 1e-3, &device)
//!     .unwrap()
//!     .with_initial_location(&[0.0, 0.0], &device)
//!     .unwrap();
//! let g = MvNormal::new(LinearTransformation::<B>::identity(2, &device), &Array2::eye(2), 1e-3, &device)
//!     .unwrap();
//!
//! let smc = Smc::bootstrap(&f, &g, SmcConfig::new(64)).unwrap();
//! let obs = Tensor::<B, 3>::zeros([3, 10, 2], &device);
//! let out = smc.run_seeded(obs, None, 42).unwrap();
//! assert_eq!(out.log_zsmc.dims(), [3]);
//!
//! // Training objective.
//! let _grads = out.loss().backward();
//! ```

use crate::distributions::{ConditionalDistribution, Conditioning};
use crate::encoder::{EncodedProposals, Encoder};
use crate::errors::{check_shape, SmcError, SmcResult};
use crate::resampling::{batch_ancestors, gather_ancestors, ResamplingPolicy};
use crate::stats;
use burn::prelude::*;
use burn::tensor::activation::log_softmax;
use burn::tensor::Bool;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array1, Array2, Array3, Array4, Axis};
use rand::rngs::SmallRng;
use rand::SeedableRng;

/// Settings of a forward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SmcConfig {
    /// Particles per sequence, at least 1.
    pub n_particles: usize,
    /// Propose from the transition `f`; the weight reduces to the emission term.
    pub use_bootstrap: bool,
    /// Condition the static proposal on `concat(X_{t-1}, y_t)` instead of `X_{t-1}`.
    pub q_use_y: bool,
    /// Condition proposal and transition on the true hidden state `hidden_{t-1}`.
    pub use_true_x: bool,
    /// When to resample a batch element: at every step or below an ESS fraction.
    pub resampling: ResamplingPolicy,
    /// Let NaN/Inf log-weights propagate into `log Z` (with a warning) instead of failing.
    pub allow_non_finite: bool,
}

impl SmcConfig {
    /// Bootstrap proposal, resampling at every step.
    pub fn new(n_particles: usize) -> Self {
        Self {
            n_particles,
            use_bootstrap: true,
            q_use_y: false,
            use_true_x: false,
            resampling: ResamplingPolicy::Always,
            allow_non_finite: false,
        }
    }

    /// Switches the bootstrap proposal on or off. Turning it on also turns `q_use_y` off.
    pub fn set_bootstrap(mut self, use_bootstrap: bool) -> Self {
        self.use_bootstrap = use_bootstrap;
        if use_bootstrap {
            self.q_use_y = false;
        }
        self
    }

    pub fn set_q_use_y(mut self, q_use_y: bool) -> Self {
        self.q_use_y = q_use_y;
        self
    }

    pub fn set_use_true_x(mut self, use_true_x: bool) -> Self {
        self.use_true_x = use_true_x;
        self
    }

    pub fn set_resampling(mut self, resampling: ResamplingPolicy) -> Self {
        self.resampling = resampling;
        self
    }

    pub fn set_allow_non_finite(mut self, allow_non_finite: bool) -> Self {
        self.allow_non_finite = allow_non_finite;
        self
    }

    fn q_uses_y(&self) -> bool {
        self.q_use_y && !self.use_bootstrap
    }

    pub fn validate(&self) -> SmcResult<()> {
        if self.n_particles < 1 {
            return Err(SmcError::config("n_particles must be at least 1"));
        }
        self.resampling.validate()
    }
}

/// Everything a forward pass produces.
#[derive(Debug, Clone)]
pub struct SmcOutput<B: Backend> {
    /// Log-evidence estimate per sequence, `[batch]`.
    pub log_zsmc: Tensor<B, 1>,
    /// Proposed particles before resampling, `[T, n_particles, batch, Dx]`.
    pub particles: Tensor<B, 4>,
    /// Unnormalized log-weights, `[T, n_particles, batch]`.
    pub log_weights: Tensor<B, 3>,
    /// Normalized log-weights of the filtering distribution at each step,
    /// `log_softmax(log w̄_{t-1} + log W_t)` over particles, `[T, n_particles, batch]`.
    /// Batch elements that skipped resampling keep the weight carried from earlier steps.
    pub filter_log_weights: Tensor<B, 3>,
    /// `ancestors[t-1, j, k]` is the particle of step `t-1` that particle `k` of step `t`
    /// descends from, `[T-1, batch, n_particles]`.
    pub ancestors: Array3<usize>,
    /// Effective sample size of the carried weights after each step, `[T, batch]`.
    pub ess: Array2<f32>,
}

impl<B: Backend> SmcOutput<B> {
    /// Mean log-evidence over the batch, shape `[1]`.
    pub fn mean_log_evidence(&self) -> Tensor<B, 1> {
        self.log_zsmc.clone().mean()
    }

    /// Training loss `-mean(log Z)`.
    pub fn loss(&self) -> Tensor<B, 1> {
        self.mean_log_evidence().neg()
    }

    pub fn log_evidence_values(&self) -> Vec<f32> {
        self.log_zsmc.clone().detach().into_data().iter::<f32>().collect()
    }

    /// Host copy of the particle genealogies ending in the final particle set.
    pub fn trajectories(&self) -> Array4<f32> {
        let particles = stats::to_array4(self.particles.clone().detach());
        stats::reconstruct_trajectories(&particles, &self.ancestors)
    }

    /// Weighted particle means per step under the filtering weights, `[T, batch, Dx]`.
    pub fn filtering_means(&self) -> Array3<f32> {
        stats::filtering_means(
            &stats::to_array4(self.particles.clone().detach()),
            &stats::to_array3(self.filter_log_weights.clone().detach()),
        )
    }
}

/// Prediction error `k` steps ahead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictionError {
    pub k: usize,
    pub mse: f32,
    pub r_squared: f32,
}

/// The particle filter over a model triple `(q, f, g)`.
///
/// The engine holds references only; parameters stay owned by the caller, who may update
/// them between passes.
///
/// # Type Parameters
///
/// * `B`: The `burn` backend. Use an autodiff backend to train through `log Z`.
/// * `Q`: Proposal distribution.
/// * `F`: Transition distribution.
/// * `G`: Emission distribution.
pub struct Smc<'a, B: Backend, Q, F, G> {
    q: &'a Q,
    f: &'a F,
    g: &'a G,
    encoder: Option<&'a dyn Encoder<B>>,
    config: SmcConfig,
}

impl<'a, B, F, G> Smc<'a, B, F, F, G>
where
    B: Backend,
    F: ConditionalDistribution<B>,
    G: ConditionalDistribution<B>,
{
    /// Creates a filter that proposes from the transition `f`.
    pub fn bootstrap(f: &'a F, g: &'a G, config: SmcConfig) -> SmcResult<Self> {
        Self::new(f, f, g, config.set_bootstrap(true))
    }
}

impl<'a, B, Q, F, G> Smc<'a, B, Q, F, G>
where
    B: Backend,
    Q: ConditionalDistribution<B>,
    F: ConditionalDistribution<B>,
    G: ConditionalDistribution<B>,
{
    /// Creates the filter after checking that the three distributions agree on their sizes.
    ///
    /// # Parameters
    ///
    /// * `q`: Proposal. Its event size is `Dx`; its input size is `Dx`, or `Dx + Dy` with
    ///   `q_use_y`. Ignored under the bootstrap proposal.
    /// * `f`: Transition with event and input size `Dx`.
    /// * `g`: Emission with input size `Dx` and event size `Dy`.
    /// * `config`: Settings of every pass.
    pub fn new(q: &'a Q, f: &'a F, g: &'a G, config: SmcConfig) -> SmcResult<Self> {
        config.validate()?;
        let dx = f.event_dim();
        let dy = g.event_dim();
        dims_agree("transition input vs state size", dx, f.input_dim())?;
        dims_agree("emission input vs state size", dx, g.input_dim())?;
        if !config.use_bootstrap {
            dims_agree("proposal event size vs state size", dx, q.event_dim())?;
            let q_in = if config.q_uses_y() { dx + dy } else { dx };
            dims_agree("proposal input size", q_in, q.input_dim())?;
        }
        Ok(Self {
            q,
            f,
            g,
            encoder: None,
            config,
        })
    }

    /// Proposes from the encoder's per-timestep diagonal Gaussians instead of `q`.
    pub fn with_encoder(mut self, encoder: &'a dyn Encoder<B>) -> SmcResult<Self> {
        if self.config.use_bootstrap {
            return Err(SmcError::config(
                "an encoder proposal cannot be combined with the bootstrap proposal",
            ));
        }
        dims_agree("encoder state size", self.f.event_dim(), encoder.state_dim())?;
        dims_agree("encoder observation size", self.g.event_dim(), encoder.obs_dim())?;
        self.encoder = Some(encoder);
        Ok(self)
    }

    pub fn config(&self) -> &SmcConfig {
        &self.config
    }

    pub fn state_dim(&self) -> usize {
        self.f.event_dim()
    }

    pub fn obs_dim(&self) -> usize {
        self.g.event_dim()
    }

    /// Runs one forward pass with a generator seeded from `seed`.
    pub fn run_seeded(
        &self,
        obs: Tensor<B, 3>,
        hidden: Option<Tensor<B, 3>>,
        seed: u64,
    ) -> SmcResult<SmcOutput<B>> {
        let mut rng = SmallRng::seed_from_u64(seed);
        self.run(obs, hidden, &mut rng)
    }

    /// Runs one forward pass.
    ///
    /// # Parameters
    ///
    /// * `obs`: Observations of shape `[batch, T, Dy]`.
    /// * `hidden`: True states `[batch, T, Dx]`. Required with `use_true_x`, ignored otherwise.
    /// * `rng`: Source of all randomness in the pass.
    ///
    /// # Returns
    ///
    /// The log-evidence per sequence together with particles, weights and genealogy.
    pub fn run(
        &self,
        obs: Tensor<B, 3>,
        hidden: Option<Tensor<B, 3>>,
        rng: &mut SmallRng,
    ) -> SmcResult<SmcOutput<B>> {
        let [b, t_len, dy] = obs.dims();
        let n = self.config.n_particles;
        let dx = self.state_dim();
        check_shape("observations", &[b, t_len, self.obs_dim()], &[b, t_len, dy])?;
        if t_len == 0 {
            return Err(SmcError::config(
                "observation sequences need at least one time step",
            ));
        }
        let hidden = if self.config.use_true_x {
            let h = hidden.ok_or_else(|| {
                SmcError::config("use_true_x requires the hidden state sequence")
            })?;
            check_shape("hidden states", &[b, t_len, dx], &h.dims())?;
            Some(h)
        } else {
            None
        };
        let proposals = match self.encoder {
            Some(encoder) => {
                let p = encoder.encode(obs.clone())?;
                check_shape(
                    "encoded proposals",
                    &[t_len, b, dx],
                    &[p.len(), p.batch_size(), p.state_dim()],
                )?;
                Some(p)
            }
            None => None,
        };

        let device = obs.device();
        let log_n = (n as f32).ln();
        let uniform = Tensor::<B, 2>::full([n, b], -log_n, &device);
        let mut carry = uniform.clone();
        let mut log_z = Tensor::<B, 1>::zeros([b], &device);
        let mut particles = Vec::with_capacity(t_len);
        let mut log_weights = Vec::with_capacity(t_len);
        let mut filter_log_weights = Vec::with_capacity(t_len);
        let mut ancestors = Vec::with_capacity(t_len - 1);
        let mut ess = Array2::<f32>::zeros((t_len, b));
        let mut prev: Option<(Tensor<B, 3>, Tensor<B, 2>)> = None;

        for t in 0..t_len {
            let y_t = obs
                .clone()
                .narrow(1, t, 1)
                .reshape([1, b, dy])
                .expand([n, b, dy]);

            let mut n_resampled = 0;
            let cond = match prev.take() {
                None => Conditioning::Initial {
                    n_particles: n,
                    batch_size: b,
                },
                Some((x_prev, post_prev)) => {
                    let ess_prev = ess.row(t - 1).to_vec();
                    let (x_res, anc, resampled) =
                        self.resample_step(x_prev, &post_prev, &ess_prev, rng)?;
                    n_resampled = resampled.iter().filter(|&&r| r).count();
                    carry = if n_resampled == b {
                        uniform.clone()
                    } else if n_resampled == 0 {
                        post_prev
                    } else {
                        let mask: Vec<bool> = (0..n * b).map(|i| resampled[i % b]).collect();
                        let mask =
                            Tensor::<B, 2, Bool>::from_data(TensorData::new(mask, [n, b]), &device);
                        post_prev.mask_fill(mask, -log_n)
                    };
                    ancestors.push(anc);
                    let state = match &hidden {
                        Some(h) => h
                            .clone()
                            .narrow(1, t - 1, 1)
                            .reshape([1, b, dx])
                            .expand([n, b, dx]),
                        None => x_res,
                    };
                    Conditioning::State(state)
                }
            };

            let (x_t, log_w) = self.propose_and_weight(t, &cond, y_t, proposals.as_ref(), rng)?;
            self.check_finite(t, &log_w)?;

            let joint = carry.clone() + log_w.clone();
            log_z = log_z + log_sum_exp_particles(joint.clone());
            let post = log_softmax(joint, 0);

            let w = stats::to_array2(post.clone().detach());
            for j in 0..b {
                ess[[t, j]] = stats::effective_sample_size(w.column(j).mapv(f32::exp).view());
            }
            log::debug!(
                "t={t}: mean ESS {:.1}/{n}, resampled {n_resampled}/{b}",
                ess.row(t).mean().unwrap_or(f32::NAN)
            );

            particles.push(x_t.clone());
            log_weights.push(log_w);
            filter_log_weights.push(post.clone());
            prev = Some((x_t, post));
        }

        let output = SmcOutput {
            log_zsmc: log_z,
            particles: Tensor::stack(particles, 0),
            log_weights: Tensor::stack(log_weights, 0),
            filter_log_weights: Tensor::stack(filter_log_weights, 0),
            ancestors: stack_ancestors(ancestors, b, n),
            ess,
        };

        let values = output.log_evidence_values();
        let non_finite = values.iter().filter(|v| !v.is_finite()).count();
        if non_finite > 0 {
            if !self.config.allow_non_finite {
                return Err(SmcError::NonFiniteLogEvidence { count: non_finite });
            }
            log::warn!("{non_finite} of {b} log-evidence values are not finite");
        }
        log::info!(
            "SMC pass: T={t_len}, n_particles={n}, batch={b}, mean log Z={:.3}",
            values.iter().sum::<f32>() / b.max(1) as f32
        );
        Ok(output)
    }

    /// Selects ancestors for every batch element the policy asks to resample and gathers the
    /// particles. Other batch elements keep the identity genealogy.
    fn resample_step(
        &self,
        x_prev: Tensor<B, 3>,
        post_prev: &Tensor<B, 2>,
        ess_prev: &[f32],
        rng: &mut SmallRng,
    ) -> SmcResult<(Tensor<B, 3>, Array2<usize>, Vec<bool>)> {
        let [n, b, _] = x_prev.dims();
        let lw = stats::to_array2(post_prev.clone().detach());
        let mut ancestors = Array2::<usize>::zeros((b, n));
        let mut resampled = vec![false; b];
        for j in 0..b {
            let mut row: Vec<usize> = (0..n).collect();
            if self.config.resampling.should_resample(ess_prev[j], n) {
                let column: Vec<f64> = lw.column(j).iter().map(|&v| f64::from(v)).collect();
                match batch_ancestors(&column, j, rng) {
                    Ok(idx) => {
                        row = idx;
                        resampled[j] = true;
                    }
                    Err(err) if self.config.allow_non_finite => {
                        log::warn!("Skipping resampling: {err}");
                    }
                    Err(err) => return Err(err),
                }
            }
            ancestors.row_mut(j).assign(&Array1::from(row));
        }
        let x_res = gather_ancestors(x_prev, &ancestors)?;
        Ok((x_res, ancestors, resampled))
    }

    /// Samples `X_t` and returns it with its unnormalized log-weight.
    fn propose_and_weight(
        &self,
        t: usize,
        cond: &Conditioning<B>,
        y_t: Tensor<B, 3>,
        proposals: Option<&EncodedProposals<B>>,
        rng: &mut SmallRng,
    ) -> SmcResult<(Tensor<B, 3>, Tensor<B, 2>)> {
        let emission =
            |x: &Tensor<B, 3>| self.g.log_prob(&Conditioning::State(x.clone()), y_t.clone());

        if let Some(p) = proposals {
            let q_t = p.proposal_params(t)?.into_distribution()?;
            let x = q_t.sample(cond, rng)?;
            let log_q = q_t.log_prob(cond, x.clone())?;
            let log_f = self.f.log_prob(cond, x.clone())?;
            let log_g = emission(&x)?;
            return Ok((x, log_f + log_g - log_q));
        }

        if self.config.use_bootstrap {
            let x = self.f.sample(cond, rng)?;
            let log_g = emission(&x)?;
            return Ok((x, log_g));
        }

        let q_cond = match cond {
            Conditioning::State(state) if self.config.q_uses_y() => {
                Conditioning::State(Tensor::cat(vec![state.clone(), y_t.clone()], 2))
            }
            other => other.clone(),
        };
        let x = self.q.sample(&q_cond, rng)?;
        let log_q = self.q.log_prob(&q_cond, x.clone())?;
        let log_f = self.f.log_prob(cond, x.clone())?;
        let log_g = emission(&x)?;
        Ok((x, log_f + log_g - log_q))
    }

    fn check_finite(&self, t: usize, log_w: &Tensor<B, 2>) -> SmcResult<()> {
        let count = log_w
            .clone()
            .detach()
            .into_data()
            .iter::<f32>()
            .filter(|v| !v.is_finite())
            .count();
        if count == 0 {
            return Ok(());
        }
        if self.config.allow_non_finite {
            log::warn!("{count} non-finite log-weights at time step {t}");
            Ok(())
        } else {
            Err(SmcError::NonFiniteLogWeights { t, count })
        }
    }

    /// One transition step from arbitrary states: the location of `f(· | points)`.
    ///
    /// `points` has shape `[m, Dx]`; so does the result.
    pub fn next_x(&self, points: Tensor<B, 2>) -> SmcResult<Tensor<B, 2>> {
        let [m, d] = points.dims();
        check_shape("vector field query", &[m, self.state_dim()], &[m, d])?;
        let next = self.f.loc(&Conditioning::State(points.reshape([1, m, d])))?;
        Ok(next.reshape([m, self.state_dim()]))
    }

    /// Average log-evidence over a dataset of `N` sequences, processed in batches.
    ///
    /// # Parameters
    ///
    /// * `obs`: Observations of shape `[N, T, Dy]`.
    /// * `hidden`: True states `[N, T, Dx]`, only used with `use_true_x`.
    /// * `batch_size`: Sequences per forward pass.
    /// * `rng`: Source of randomness for all passes.
    pub fn evaluate(
        &self,
        obs: Tensor<B, 3>,
        hidden: Option<Tensor<B, 3>>,
        batch_size: usize,
        rng: &mut SmallRng,
    ) -> SmcResult<f32> {
        self.evaluate_batches(obs, hidden, batch_size, rng, None)
    }

    /// Same as [`Smc::evaluate`], with a progress bar showing the running mean.
    pub fn evaluate_progress(
        &self,
        obs: Tensor<B, 3>,
        hidden: Option<Tensor<B, 3>>,
        batch_size: usize,
        rng: &mut SmallRng,
    ) -> SmcResult<f32> {
        let pb = ProgressBar::new(obs.dims()[0] as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:8} {bar:40.white} ETA {eta:3} | {msg}")
                .map_err(|e| SmcError::config(e.to_string()))?
                .progress_chars("=>-"),
        );
        pb.set_prefix("SMC");
        let mean = self.evaluate_batches(obs, hidden, batch_size, rng, Some(&pb))?;
        pb.finish_with_message(format!("log Z≈{mean:.3}"));
        Ok(mean)
    }

    fn evaluate_batches(
        &self,
        obs: Tensor<B, 3>,
        hidden: Option<Tensor<B, 3>>,
        batch_size: usize,
        rng: &mut SmallRng,
        pb: Option<&ProgressBar>,
    ) -> SmcResult<f32> {
        if batch_size == 0 {
            return Err(SmcError::config("evaluation batch size must be at least 1"));
        }
        let n_seq = obs.dims()[0];
        if n_seq == 0 {
            return Err(SmcError::config("evaluation needs at least one sequence"));
        }
        let mut total = 0.0f64;
        let mut start = 0;
        while start < n_seq {
            let len = batch_size.min(n_seq - start);
            let batch_obs = obs.clone().narrow(0, start, len);
            let batch_hidden = hidden.as_ref().map(|h| h.clone().narrow(0, start, len));
            let out = self.run(batch_obs, batch_hidden, rng)?;
            total += out
                .log_evidence_values()
                .iter()
                .map(|&v| f64::from(v))
                .sum::<f64>();
            start += len;
            if let Some(pb) = pb {
                pb.inc(len as u64);
                pb.set_message(format!("log Z≈{:.3}", total / start as f64));
            }
        }
        Ok((total / n_seq as f64) as f32)
    }

    /// Scores `k`-step-ahead predictions for `k = 0..=max_k`.
    ///
    /// From the weighted particles of step `t`, the transition location is applied `k` times
    /// and the emission location of the result, averaged with the filtering weights, is
    /// compared to `y_{t+k}`.
    pub fn k_step_mse(
        &self,
        output: &SmcOutput<B>,
        obs: Tensor<B, 3>,
        max_k: usize,
    ) -> SmcResult<Vec<PredictionError>> {
        let [t_len, n, b, dx] = output.particles.dims();
        let dy = self.obs_dim();
        check_shape("prediction targets", &[b, t_len, dy], &obs.dims())?;
        let log_weights = stats::to_array3(output.filter_log_weights.clone().detach());

        let mut errors = Vec::with_capacity(max_k + 1);
        for k in 0..=max_k.min(t_len - 1) {
            let m = t_len - k;
            let mut x = output
                .particles
                .clone()
                .detach()
                .narrow(0, 0, m)
                .reshape([m * n, b, dx]);
            for _ in 0..k {
                x = self.f.loc(&Conditioning::State(x))?;
            }
            let y_hat = self.g.loc(&Conditioning::State(x))?.reshape([m, n, b, dy]);
            let prediction = stats::filtering_means(
                &stats::to_array4(y_hat),
                &log_weights.slice_axis(Axis(0), (0..m).into()).to_owned(),
            );
            let target = stats::to_array3(obs.clone().narrow(1, k, m).swap_dims(0, 1));
            let (mse, r_squared) = stats::mse_r_squared(&prediction, &target);
            errors.push(PredictionError { k, mse, r_squared });
        }
        Ok(errors)
    }
}

fn dims_agree(context: &'static str, expected: usize, found: usize) -> SmcResult<()> {
    if expected == found {
        Ok(())
    } else {
        Err(SmcError::DimensionMismatch {
            context,
            expected,
            found,
        })
    }
}

/// `log Σ_i exp(t[i, j])` over the particle axis, with the max detached.
fn log_sum_exp_particles<B: Backend>(t: Tensor<B, 2>) -> Tensor<B, 1> {
    let [n, b] = t.dims();
    let max = t.clone().detach().max_dim(0);
    let shifted = t - max.clone().expand([n, b]);
    (shifted.exp().sum_dim(0).log() + max).reshape([b])
}

fn stack_ancestors(ancestors: Vec<Array2<usize>>, b: usize, n: usize) -> Array3<usize> {
    let mut out = Array3::<usize>::zeros((ancestors.len(), b, n));
    for (t, a) in ancestors.iter().enumerate() {
        out.index_axis_mut(Axis(0), t).assign(a);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{DiracDelta, MvNormal};
    use crate::transformations::LinearTransformation;
    use approx::assert_abs_diff_eq;
    use burn::backend::{Autodiff, NdArray};
    use ndarray::{arr2, Array2};

    type B = NdArray;
    type BackendType = Autodiff<NdArray>;

    fn gaussian<Bk: Backend>(
        a: &Array2<f32>,
        scale: f32,
        x_0: Option<&[f32]>,
    ) -> MvNormal<Bk, LinearTransformation<Bk>> {
        let device = Default::default();
        let d = a.nrows();
        let dist = MvNormal::new(
            LinearTransformation::from_array(a, &device),
            &(Array2::<f32>::eye(d) * scale),
            0.0,
            &device,
        )
        .unwrap();
        match x_0 {
            Some(x) => dist.with_initial_location(x, &device).unwrap(),
            None => dist,
        }
    }

    fn observations<Bk: Backend>(b: usize, t_len: usize, d: usize) -> Tensor<Bk, 3> {
        let v: Vec<f32> = (0..b * t_len * d).map(|i| (i as f32 * 0.37).sin()).collect();
        Tensor::from_data(TensorData::new(v, [b, t_len, d]), &Default::default())
    }

    #[test]
    fn test_config_validation() {
        assert!(SmcConfig::new(0).validate().unwrap_err().is_configuration());
        let cfg = SmcConfig::new(10).set_q_use_y(true).set_bootstrap(true);
        assert!(!cfg.q_use_y);
        assert!(SmcConfig::new(10)
            .set_resampling(ResamplingPolicy::EssBelow(2.0))
            .validate()
            .is_err());
    }

    #[test]
    fn test_dimension_mismatch_fails_fast() {
        let f = gaussian::<B>(&Array2::eye(2), 1.0, Some(&[0.0, 0.0]));
        let g3 = gaussian::<B>(&Array2::eye(3), 1.0, None);
        let err = Smc::bootstrap(&f, &g3, SmcConfig::new(5)).err().unwrap();
        assert_eq!(
            err,
            SmcError::DimensionMismatch {
                context: "emission input vs state size",
                expected: 2,
                found: 3
            }
        );

        let g = gaussian::<B>(&Array2::eye(2), 1.0, None);
        let q = gaussian::<B>(&Array2::eye(2), 1.0, Some(&[0.0, 0.0]));
        let cfg = SmcConfig::new(5).set_bootstrap(false).set_q_use_y(true);
        assert!(Smc::new(&q, &f, &g, cfg).err().unwrap().is_configuration());
    }

    #[test]
    fn test_shapes_and_weights() {
        let f = gaussian::<B>(&arr2(&[[0.9, 0.0], [0.1, 0.8]]), 1.0, Some(&[0.0, 0.0]));
        let g = gaussian::<B>(&Array2::eye(2), 0.5, None);
        let smc = Smc::bootstrap(&f, &g, SmcConfig::new(16)).unwrap();
        let out = smc.run_seeded(observations(3, 6, 2), None, 1).unwrap();

        assert_eq!(out.log_zsmc.dims(), [3]);
        assert_eq!(out.particles.dims(), [6, 16, 3, 2]);
        assert_eq!(out.log_weights.dims(), [6, 16, 3]);
        assert_eq!(out.ancestors.dim(), (5, 3, 16));
        assert_eq!(out.ess.dim(), (6, 3));
        assert!(out.ancestors.iter().all(|&a| a < 16));
        assert!(out.ess.iter().all(|&e| (1.0 - 1e-3..=16.0 + 1e-3).contains(&e)));

        let w = stats::normalized_weights(&stats::to_array3(out.log_weights.clone()));
        for t in 0..6 {
            for j in 0..3 {
                assert_abs_diff_eq!(w.slice(ndarray::s![t, .., j]).sum(), 1.0, epsilon = 1e-4);
            }
        }
        assert_eq!(out.trajectories().dim(), (6, 16, 3, 2));
        assert_eq!(out.filtering_means().dim(), (6, 3, 2));
    }

    #[test]
    fn test_single_time_step() {
        let f = gaussian::<B>(&Array2::eye(1), 1.0, Some(&[0.0]));
        let g = gaussian::<B>(&Array2::eye(1), 1.0, None);
        let smc = Smc::bootstrap(&f, &g, SmcConfig::new(8)).unwrap();
        let out = smc.run_seeded(observations(2, 1, 1), None, 0).unwrap();
        assert_eq!(out.ancestors.dim(), (0, 2, 8));
    }

    #[test]
    fn test_non_finite_weights_are_reported() {
        // A NaN observation at t = 1 poisons every weight of that step.
        let f = gaussian::<B>(&Array2::eye(1), 1.0, Some(&[0.0]));
        let g = gaussian::<B>(&Array2::eye(1), 1.0, None);
        let obs = Tensor::<B, 3>::from_data(
            TensorData::new(vec![0.0f32, f32::NAN, 0.0], [1, 3, 1]),
            &Default::default(),
        );
        let smc = Smc::bootstrap(&f, &g, SmcConfig::new(4)).unwrap();
        let err = smc.run_seeded(obs.clone(), None, 0).err().unwrap();
        assert_eq!(err, SmcError::NonFiniteLogWeights { t: 1, count: 4 });

        let lenient = Smc::bootstrap(&f, &g, SmcConfig::new(4).set_allow_non_finite(true)).unwrap();
        let out = lenient.run_seeded(obs, None, 0).unwrap();
        assert!(out.log_evidence_values()[0].is_nan());
    }

    #[test]
    fn test_use_true_x_requires_hidden() {
        let f = gaussian::<B>(&Array2::eye(2), 1.0, Some(&[0.0, 0.0]));
        let g = gaussian::<B>(&Array2::eye(2), 1.0, None);
        let smc = Smc::bootstrap(&f, &g, SmcConfig::new(4).set_use_true_x(true)).unwrap();
        let err = smc.run_seeded(observations(1, 3, 2), None, 0).err().unwrap();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_dirac_transition_with_true_states() {
        // With f a point mass conditioned on the true states, every particle sits on A h_{t-1}.
        let a = arr2(&[[0.5f32, 0.0], [0.0, 2.0]]);
        let f = DiracDelta::<B, _>::new(LinearTransformation::from_array(&a, &Default::default()))
            .with_initial_location(&[0.0, 0.0], &Default::default())
            .unwrap();
        let g = gaussian::<B>(&Array2::eye(2), 1.0, None);
        let hidden = observations::<B>(1, 4, 2);
        let smc = Smc::bootstrap(&f, &g, SmcConfig::new(3).set_use_true_x(true)).unwrap();
        let out = smc
            .run_seeded(observations(1, 4, 2), Some(hidden.clone()), 0)
            .unwrap();

        let particles = stats::to_array4(out.particles);
        let h = stats::to_array3(hidden);
        for t in 1..4 {
            for i in 0..3 {
                assert_abs_diff_eq!(particles[[t, i, 0, 0]], 0.5 * h[[0, t - 1, 0]], epsilon = 1e-6);
                assert_abs_diff_eq!(particles[[t, i, 0, 1]], 2.0 * h[[0, t - 1, 1]], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_ess_policy_skips_resampling_for_uniform_weights() {
        // Huge observation noise keeps the weights close to uniform.
        let f = gaussian::<B>(&Array2::eye(1), 1.0, Some(&[0.0]));
        let g = gaussian::<B>(&Array2::eye(1), 1e4, None);
        let cfg = SmcConfig::new(10).set_resampling(ResamplingPolicy::EssBelow(0.5));
        let smc = Smc::bootstrap(&f, &g, cfg).unwrap();
        let out = smc.run_seeded(observations(2, 5, 1), None, 3).unwrap();
        for t in 0..4 {
            for j in 0..2 {
                for k in 0..10 {
                    assert_eq!(out.ancestors[[t, j, k]], k);
                }
            }
        }
    }

    #[test]
    fn test_filtering_weights_accumulate_without_resampling() {
        // ESS never drops below 0.05 n = 0.5 particles, so no batch element is resampled and
        // the filtering weights are the normalized running sums of the log-weights.
        let f = gaussian::<B>(&Array2::eye(1), 1.0, Some(&[0.0]));
        let g = gaussian::<B>(&Array2::eye(1), 0.5, None);
        let cfg = SmcConfig::new(10).set_resampling(ResamplingPolicy::EssBelow(0.05));
        let smc = Smc::bootstrap(&f, &g, cfg).unwrap();
        let out = smc.run_seeded(observations(2, 5, 1), None, 4).unwrap();
        assert!(out.ancestors.indexed_iter().all(|((_, _, k), &a)| a == k));

        let raw = stats::to_array3(out.log_weights.clone());
        let filter = stats::to_array3(out.filter_log_weights.clone());
        let particles = stats::to_array4(out.particles.clone());
        let means = out.filtering_means();
        for j in 0..2 {
            let mut running = Array1::<f32>::zeros(10);
            for t in 0..5 {
                running += &raw.slice(ndarray::s![t, .., j]);
                let w = stats::normalize_log_weights(running.view());
                let mut mean = 0.0;
                for i in 0..10 {
                    assert_abs_diff_eq!(filter[[t, i, j]].exp(), w[i], epsilon = 1e-5);
                    mean += w[i] * particles[[t, i, j, 0]];
                }
                assert_abs_diff_eq!(means[[t, j, 0]], mean, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn test_next_x() {
        let a = arr2(&[[1.0f32, 2.0], [0.0, -1.0]]);
        let f = gaussian::<B>(&a, 1.0, Some(&[0.0, 0.0]));
        let g = gaussian::<B>(&Array2::eye(2), 1.0, None);
        let smc = Smc::bootstrap(&f, &g, SmcConfig::new(2)).unwrap();
        let points = Tensor::<B, 2>::from_data(
            TensorData::new(vec![1.0f32, 1.0, 2.0, 0.5], [2, 2]),
            &Default::default(),
        );
        let next: Vec<f32> = smc.next_x(points).unwrap().into_data().iter::<f32>().collect();
        assert_eq!(next, vec![3.0, -1.0, 3.0, -0.5]);

        let wrong = Tensor::<B, 2>::zeros([2, 3], &Default::default());
        assert!(smc.next_x(wrong).is_err());
    }

    #[test]
    fn test_evaluate_matches_single_pass_mean() {
        let f = gaussian::<B>(&Array2::eye(1), 1.0, Some(&[0.0]));
        let g = gaussian::<B>(&Array2::eye(1), 1.0, None);
        // n = 1 makes each pass deterministic given the rng stream.
        let smc = Smc::bootstrap(&f, &g, SmcConfig::new(1)).unwrap();
        let obs = observations::<B>(5, 4, 1);

        let mut rng = SmallRng::seed_from_u64(11);
        let mean = smc.evaluate(obs.clone(), None, 2, &mut rng).unwrap();
        let mut rng = SmallRng::seed_from_u64(11);
        let mut expected = 0.0;
        for (start, len) in [(0, 2), (2, 2), (4, 1)] {
            let out = smc.run(obs.clone().narrow(0, start, len), None, &mut rng).unwrap();
            expected += out.log_evidence_values().iter().sum::<f32>();
        }
        assert_abs_diff_eq!(mean, expected / 5.0, epsilon = 1e-4);
        assert!(smc.evaluate(obs, None, 0, &mut rng).is_err());
    }

    #[test]
    fn test_k_step_mse() {
        let f = gaussian::<B>(&Array2::eye(1), 0.1, Some(&[0.0]));
        let g = gaussian::<B>(&Array2::eye(1), 0.1, None);
        let smc = Smc::bootstrap(&f, &g, SmcConfig::new(50)).unwrap();
        let obs = observations::<B>(2, 8, 1);
        let out = smc.run_seeded(obs.clone(), None, 5).unwrap();
        let errors = smc.k_step_mse(&out, obs, 3).unwrap();
        assert_eq!(errors.iter().map(|e| e.k).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert!(errors.iter().all(|e| e.mse.is_finite() && e.mse >= 0.0));
    }

    #[test]
    fn test_gradient_reaches_transition_matrix() {
        let f = gaussian::<BackendType>(&arr2(&[[0.9, 0.0], [0.0, 0.5]]), 1.0, Some(&[0.0, 0.0]));
        let g = gaussian::<BackendType>(&Array2::eye(2), 1.0, None);
        let smc = Smc::bootstrap(&f, &g, SmcConfig::new(32)).unwrap();
        let out = smc.run_seeded(observations(2, 5, 2), None, 9).unwrap();
        let grads = out.loss().backward();
        let grad: Vec<f32> = f
            .transformation
            .weight
            .val()
            .grad(&grads)
            .expect("Expected a gradient for the transition matrix")
            .into_data()
            .iter::<f32>()
            .collect();
        assert!(grad.iter().all(|v| v.is_finite()));
        assert!(grad.iter().any(|v| v.abs() > 0.0));
    }
}
