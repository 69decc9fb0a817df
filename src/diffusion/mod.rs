//! # Gaussian diffusion
//!
//! The forward (noising) process, the model's reverse-step distribution and
//! everything the training loss and the samplers share. Latents are shaped
//! `(batch, frame, channel, h, w)` and timesteps are `Int64` tensors holding
//! one schedule index per batch element.
//!
//! Denoising Diffusion Probabilistic Models, J. Ho et al, 2020.
//! https://arxiv.org/abs/2006.11239
//!
//! Improved Denoising Diffusion Probabilistic Models, A. Nichol, P. Dhariwal, 2021.
//! https://arxiv.org/abs/2102.09672
use crate::error::{Error, Result};
use crate::models::{Conditioning, DenoisingModel};
use crate::schedulers::{extract, space_timesteps, BetaSchedule, NoiseSchedule};
use serde::{Deserialize, Serialize};
use tch::{Kind, Tensor};

pub mod losses;
pub mod sampling;
pub mod training;

pub use sampling::{SamplerKind, SamplerState};
pub use training::TrainingLosses;

/// Axis of the latent channels in `(batch, frame, channel, h, w)` tensors.
pub const CHANNEL_DIM: i64 = 2;

/// What the backbone predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelMeanType {
    /// The previous sample x_{t-1}.
    PreviousX,
    /// The clean sample x_0.
    StartX,
    /// The noise that was added.
    Epsilon,
}

/// How the variance of the reverse step is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVarType {
    /// The model outputs the log-variance directly.
    Learned,
    /// Posterior variance of the forward process.
    FixedSmall,
    /// Betas, the posterior variance being used at t=0.
    FixedLarge,
    /// The model outputs values in [-1, 1] interpolating the log-variance
    /// between the two fixed choices.
    LearnedRange,
}

impl ModelVarType {
    pub fn is_learned(&self) -> bool {
        matches!(self, Self::Learned | Self::LearnedRange)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossType {
    /// Raw MSE, plus the variational bound when the variance is learned.
    Mse,
    /// MSE, with the variational bound scaled as if the schedule had 1000
    /// steps.
    RescaledMse,
    /// The variational lower bound.
    Kl,
    /// The variational lower bound scaled by the number of timesteps.
    RescaledKl,
}

impl LossType {
    pub fn is_vb(&self) -> bool {
        matches!(self, Self::Kl | Self::RescaledKl)
    }
}

/// The options selecting the schedule and the parameterization, mirroring
/// the usual `create_diffusion` helper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffusionConfig {
    /// Number of steps used to define the schedule during training.
    pub diffusion_steps: usize,
    pub noise_schedule: BetaSchedule,
    /// Respacing spec, see [`space_timesteps`]. Empty keeps every step.
    pub timestep_respacing: String,
    pub use_kl: bool,
    pub sigma_small: bool,
    pub predict_xstart: bool,
    pub learn_sigma: bool,
    pub rescale_learned_sigmas: bool,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            diffusion_steps: 1000,
            noise_schedule: BetaSchedule::Linear,
            timestep_respacing: String::new(),
            use_kl: false,
            sigma_small: false,
            predict_xstart: false,
            learn_sigma: true,
            rescale_learned_sigmas: false,
        }
    }
}

impl DiffusionConfig {
    pub fn with_respacing(respacing: impl Into<String>) -> Self {
        Self { timestep_respacing: respacing.into(), ..Default::default() }
    }
}

/// Builds the diffusion process described by `config`, respacing the
/// schedule when asked to.
pub fn create_diffusion(config: &DiffusionConfig) -> Result<GaussianDiffusion> {
    let schedule = NoiseSchedule::from_kind(config.noise_schedule, config.diffusion_steps)?;
    let use_timesteps = space_timesteps(config.diffusion_steps, &config.timestep_respacing)?;
    let schedule = if use_timesteps.len() == config.diffusion_steps {
        schedule
    } else {
        schedule.respace(&use_timesteps)?
    };
    let loss_type = match (config.use_kl, config.rescale_learned_sigmas) {
        (true, _) => LossType::RescaledKl,
        (false, true) => LossType::RescaledMse,
        (false, false) => LossType::Mse,
    };
    let model_mean_type =
        if config.predict_xstart { ModelMeanType::StartX } else { ModelMeanType::Epsilon };
    let model_var_type = match (config.learn_sigma, config.sigma_small) {
        (true, _) => ModelVarType::LearnedRange,
        (false, true) => ModelVarType::FixedSmall,
        (false, false) => ModelVarType::FixedLarge,
    };
    Ok(GaussianDiffusion::new(schedule, model_mean_type, model_var_type, loss_type))
}

/// Mean, variance and log-variance of a diagonal Gaussian over latents.
#[derive(Debug)]
pub struct GaussianStats {
    pub mean: Tensor,
    pub variance: Tensor,
    pub log_variance: Tensor,
}

/// The model's distribution for `x_{t-1}` given `x_t`.
#[derive(Debug)]
pub struct ReverseStep {
    pub mean: Tensor,
    pub variance: Tensor,
    pub log_variance: Tensor,
    pub pred_xstart: Tensor,
    /// The part of the model output predicting the mean (noise, x_0 or
    /// x_{t-1} depending on the mean type).
    pub mean_output: Tensor,
    pub aligned_features: Option<Vec<Tensor>>,
}

/// A diffusion process over a (possibly respaced) schedule.
#[derive(Debug, Clone)]
pub struct GaussianDiffusion {
    schedule: NoiseSchedule,
    pub model_mean_type: ModelMeanType,
    pub model_var_type: ModelVarType,
    pub loss_type: LossType,
}

impl GaussianDiffusion {
    pub fn new(
        schedule: NoiseSchedule,
        model_mean_type: ModelMeanType,
        model_var_type: ModelVarType,
        loss_type: LossType,
    ) -> Self {
        Self { schedule, model_mean_type, model_var_type, loss_type }
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    pub fn num_timesteps(&self) -> usize {
        self.schedule.num_timesteps()
    }

    /// Draws one timestep per batch element uniformly in `[0, T)`.
    pub fn sample_timesteps(&self, batch_size: i64, device: tch::Device) -> Tensor {
        Tensor::randint(self.num_timesteps() as i64, [batch_size], (Kind::Int64, device))
    }

    /// Returns the distribution `q(x_t | x_0)`.
    pub fn q_mean_variance(&self, x_start: &Tensor, t: &Tensor) -> GaussianStats {
        let s = &self.schedule;
        let mean = extract(&s.sqrt_alphas_cumprod, t, x_start) * x_start;
        let variance =
            (1f64 - extract(s.alphas_cumprod(), t, x_start)).expand_as(x_start).contiguous();
        let log_variance =
            extract(&s.log_one_minus_alphas_cumprod, t, x_start).expand_as(x_start).contiguous();
        GaussianStats { mean, variance, log_variance }
    }

    /// Diffuses the data for a given number of diffusion steps, that is
    /// samples from `q(x_t | x_0)`.
    pub fn q_sample(&self, x_start: &Tensor, t: &Tensor, noise: Option<&Tensor>) -> Result<Tensor> {
        let noise = match noise {
            Some(noise) => {
                if noise.size() != x_start.size() {
                    return Err(Error::shape("q_sample noise", &x_start.size(), &noise.size()));
                }
                noise.shallow_clone()
            }
            None => Tensor::randn_like(x_start),
        };
        let s = &self.schedule;
        Ok(extract(&s.sqrt_alphas_cumprod, t, x_start) * x_start
            + extract(&s.sqrt_one_minus_alphas_cumprod, t, x_start) * noise)
    }

    /// Returns the posterior `q(x_{t-1} | x_t, x_0)`.
    pub fn q_posterior_mean_variance(
        &self,
        x_start: &Tensor,
        x_t: &Tensor,
        t: &Tensor,
    ) -> Result<GaussianStats> {
        if x_start.size() != x_t.size() {
            return Err(Error::shape("q_posterior", &x_t.size(), &x_start.size()));
        }
        let s = &self.schedule;
        let mean = extract(&s.posterior_mean_coef1, t, x_t) * x_start
            + extract(&s.posterior_mean_coef2, t, x_t) * x_t;
        let variance = extract(&s.posterior_variance, t, x_t).expand_as(x_t).contiguous();
        let log_variance =
            extract(&s.posterior_log_variance_clipped, t, x_t).expand_as(x_t).contiguous();
        Ok(GaussianStats { mean, variance, log_variance })
    }

    pub(crate) fn predict_xstart_from_eps(&self, x_t: &Tensor, t: &Tensor, eps: &Tensor) -> Tensor {
        let s = &self.schedule;
        extract(&s.sqrt_recip_alphas_cumprod, t, x_t) * x_t
            - extract(&s.sqrt_recipm1_alphas_cumprod, t, x_t) * eps
    }

    pub(crate) fn predict_xstart_from_xprev(
        &self,
        x_t: &Tensor,
        t: &Tensor,
        xprev: &Tensor,
    ) -> Tensor {
        let s = &self.schedule;
        let coef1 = extract(&s.posterior_mean_coef1, t, x_t);
        let coef2 = extract(&s.posterior_mean_coef2, t, x_t);
        (xprev - coef2 * x_t) / coef1
    }

    pub(crate) fn predict_eps_from_xstart(
        &self,
        x_t: &Tensor,
        t: &Tensor,
        pred_xstart: &Tensor,
    ) -> Tensor {
        let s = &self.schedule;
        (extract(&s.sqrt_recip_alphas_cumprod, t, x_t) * x_t - pred_xstart)
            / extract(&s.sqrt_recipm1_alphas_cumprod, t, x_t)
    }

    /// Translates schedule indices into the training timesteps the backbone
    /// was conditioned on.
    pub fn model_timesteps(&self, t: &Tensor) -> Tensor {
        let map = Tensor::from_slice(self.schedule.timestep_map()).to_device(t.device());
        map.index_select(0, t)
    }

    /// Runs the backbone and splits its output into the mean part and, for
    /// learned variances, the variance values.
    pub(crate) fn run_model<M: DenoisingModel + ?Sized>(
        &self,
        model: &M,
        x: &Tensor,
        t: &Tensor,
        cond: &Conditioning,
    ) -> Result<(Tensor, Option<Tensor>, Option<Vec<Tensor>>)> {
        let out = model.forward(x, &self.model_timesteps(t), cond)?;
        let size = x.size();
        let channels = size[CHANNEL_DIM as usize];
        if self.model_var_type.is_learned() {
            let mut expected = size.clone();
            expected[CHANNEL_DIM as usize] = 2 * channels;
            if out.prediction.size() != expected {
                return Err(Error::shape("model output", &expected, &out.prediction.size()));
            }
            let mean_output = out.prediction.narrow(CHANNEL_DIM, 0, channels);
            let var_values = out.prediction.narrow(CHANNEL_DIM, channels, channels);
            Ok((mean_output, Some(var_values), out.aligned_features))
        } else {
            if out.prediction.size() != size {
                return Err(Error::shape("model output", &size, &out.prediction.size()));
            }
            Ok((out.prediction, None, out.aligned_features))
        }
    }

    /// Turns the raw model output into the reverse-step distribution.
    pub(crate) fn reverse_step_from_output(
        &self,
        x: &Tensor,
        t: &Tensor,
        mean_output: Tensor,
        var_values: Option<&Tensor>,
        clip_denoised: bool,
    ) -> Result<ReverseStep> {
        let s = &self.schedule;
        let (variance, log_variance) = match (self.model_var_type, var_values) {
            (ModelVarType::Learned, Some(values)) => (values.exp(), values.shallow_clone()),
            (ModelVarType::LearnedRange, Some(values)) => {
                let min_log = extract(&s.posterior_log_variance_clipped, t, x);
                let max_log = extract(s.betas(), t, x).log();
                // The model output is in [-1, 1].
                let frac = (values + 1.) / 2.;
                let log_variance = &frac * max_log + (1f64 - &frac) * min_log;
                (log_variance.exp(), log_variance)
            }
            (ModelVarType::FixedLarge, None) => {
                // The posterior variance at t=0 keeps the decoder term well
                // defined.
                let mut variance = s.betas().to_vec();
                variance[0] = s.posterior_variance.get(1).copied().unwrap_or(variance[0]);
                let log_variance: Vec<f64> = variance.iter().map(|v| v.ln()).collect();
                (
                    extract(&variance, t, x).expand_as(x).contiguous(),
                    extract(&log_variance, t, x).expand_as(x).contiguous(),
                )
            }
            (ModelVarType::FixedSmall, None) => (
                extract(&s.posterior_variance, t, x).expand_as(x).contiguous(),
                extract(&s.posterior_log_variance_clipped, t, x).expand_as(x).contiguous(),
            ),
            (var_type, _) => {
                return Err(Error::Config(format!(
                    "variance values do not match variance type {var_type:?}"
                )))
            }
        };

        let process_xstart = |xs: Tensor| if clip_denoised { xs.clamp(-1., 1.) } else { xs };
        let (pred_xstart, mean) = match self.model_mean_type {
            ModelMeanType::PreviousX => {
                let pred_xstart =
                    process_xstart(self.predict_xstart_from_xprev(x, t, &mean_output));
                (pred_xstart, mean_output.shallow_clone())
            }
            ModelMeanType::StartX | ModelMeanType::Epsilon => {
                let pred_xstart = match self.model_mean_type {
                    ModelMeanType::StartX => process_xstart(mean_output.shallow_clone()),
                    _ => process_xstart(self.predict_xstart_from_eps(x, t, &mean_output)),
                };
                let posterior = self.q_posterior_mean_variance(&pred_xstart, x, t)?;
                (pred_xstart, posterior.mean)
            }
        };
        Ok(ReverseStep {
            mean,
            variance,
            log_variance,
            pred_xstart,
            mean_output,
            aligned_features: None,
        })
    }

    /// Applies the model to get `p(x_{t-1} | x_t)`, as well as a prediction
    /// of the initial x.
    pub fn p_mean_variance<M: DenoisingModel + ?Sized>(
        &self,
        model: &M,
        x: &Tensor,
        t: &Tensor,
        clip_denoised: bool,
        cond: &Conditioning,
    ) -> Result<ReverseStep> {
        let (mean_output, var_values, aligned_features) = self.run_model(model, x, t, cond)?;
        let mut step =
            self.reverse_step_from_output(x, t, mean_output, var_values.as_ref(), clip_denoised)?;
        step.aligned_features = aligned_features;
        Ok(step)
    }
}
