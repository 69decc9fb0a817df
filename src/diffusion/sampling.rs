//! The reverse process: iteratively denoises pure noise into a clean latent.
//!
//! Two samplers are available, the ancestral DDPM sampler walking the whole
//! Markov chain and the DDIM sampler which, combined with a respaced
//! schedule, needs far fewer steps.
use super::GaussianDiffusion;
use crate::error::{Error, Result};
use crate::models::{Conditioning, DenoisingModel};
use crate::schedulers::{ddim, ddpm};
use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};

/// Which reverse process to run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplerKind {
    /// Full ancestral sampling, noise is added at every step but the last.
    Ancestral,
    /// DDIM updates. `eta = 0` gives a deterministic sampler.
    Accelerated { eta: f64 },
}

/// The sampler names accepted in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleMethod {
    Ddpm,
    Ddim,
}

impl SampleMethod {
    pub fn sampler(&self, eta: f64) -> SamplerKind {
        match self {
            Self::Ddpm => SamplerKind::Ancestral,
            Self::Ddim => SamplerKind::Accelerated { eta },
        }
    }
}

/// The latent being denoised. Each step consumes the state and returns the
/// next one.
#[derive(Debug)]
pub struct SamplerState {
    pub sample: Tensor,
    /// The clean sample estimated at the last step, if any step ran.
    pub pred_xstart: Option<Tensor>,
}

impl SamplerState {
    pub fn new(sample: Tensor) -> Self {
        Self { sample, pred_xstart: None }
    }
}

impl SamplerKind {
    pub fn step<M: DenoisingModel + ?Sized>(
        &self,
        diffusion: &GaussianDiffusion,
        model: &M,
        state: SamplerState,
        timestep: usize,
        clip_denoised: bool,
        cond: &Conditioning,
    ) -> Result<SamplerState> {
        let out = match *self {
            Self::Ancestral => {
                ddpm::step(diffusion, model, &state.sample, timestep, clip_denoised, cond)?
            }
            Self::Accelerated { eta } => {
                ddim::step(diffusion, model, &state.sample, timestep, eta, clip_denoised, cond)?
            }
        };
        Ok(SamplerState { sample: out.prev_sample, pred_xstart: Some(out.pred_xstart) })
    }
}

impl GaussianDiffusion {
    fn initial_noise(
        &self,
        shape: &[i64],
        noise: Option<Tensor>,
        device: Device,
    ) -> Result<Tensor> {
        match noise {
            Some(noise) if noise.size() != shape => {
                Err(Error::shape("initial noise", shape, &noise.size()))
            }
            Some(noise) => Ok(noise),
            None => Ok(Tensor::randn(shape, (Kind::Float, device))),
        }
    }

    /// Generates samples by running `kind` over every timestep of the
    /// schedule, from `T - 1` down to `0`.
    ///
    /// `noise` is the starting point, drawn from a standard normal when not
    /// provided. `progress` is called after each step with the number of
    /// remaining steps. Re-running from the same noise is the only way to
    /// restart a sampling run.
    #[allow(clippy::too_many_arguments)]
    pub fn sample_loop<M: DenoisingModel + ?Sized>(
        &self,
        kind: SamplerKind,
        model: &M,
        shape: &[i64],
        noise: Option<Tensor>,
        device: Device,
        clip_denoised: bool,
        cond: &Conditioning,
        mut progress: impl FnMut(usize),
    ) -> Result<Tensor> {
        let _no_grad_guard = tch::no_grad_guard();
        let mut state = SamplerState::new(self.initial_noise(shape, noise, device)?);
        let num_timesteps = self.num_timesteps();
        for (index, timestep) in (0..num_timesteps).rev().enumerate() {
            tracing::debug!(timestep, ?kind, "reverse step");
            state = kind.step(self, model, state, timestep, clip_denoised, cond)?;
            progress(num_timesteps - index - 1);
        }
        Ok(state.sample)
    }

    /// Ancestral sampling over the whole schedule.
    #[allow(clippy::too_many_arguments)]
    pub fn p_sample_loop<M: DenoisingModel + ?Sized>(
        &self,
        model: &M,
        shape: &[i64],
        noise: Option<Tensor>,
        device: Device,
        clip_denoised: bool,
        cond: &Conditioning,
        progress: impl FnMut(usize),
    ) -> Result<Tensor> {
        let kind = SamplerKind::Ancestral;
        self.sample_loop(kind, model, shape, noise, device, clip_denoised, cond, progress)
    }

    /// DDIM sampling over the whole (usually respaced) schedule.
    #[allow(clippy::too_many_arguments)]
    pub fn ddim_sample_loop<M: DenoisingModel + ?Sized>(
        &self,
        model: &M,
        shape: &[i64],
        noise: Option<Tensor>,
        device: Device,
        clip_denoised: bool,
        cond: &Conditioning,
        eta: f64,
        progress: impl FnMut(usize),
    ) -> Result<Tensor> {
        let kind = SamplerKind::Accelerated { eta };
        self.sample_loop(kind, model, shape, noise, device, clip_denoised, cond, progress)
    }

    /// Maps a clean latent to the noise that the deterministic DDIM sampler
    /// would turn back into it.
    pub fn ddim_reverse_sample_loop<M: DenoisingModel + ?Sized>(
        &self,
        model: &M,
        x_start: &Tensor,
        clip_denoised: bool,
        cond: &Conditioning,
    ) -> Result<Tensor> {
        let _no_grad_guard = tch::no_grad_guard();
        let mut sample = x_start.shallow_clone();
        for timestep in 0..self.num_timesteps() {
            sample = ddim::reverse_step(self, model, &sample, timestep, 0., clip_denoised, cond)?
                .prev_sample;
        }
        Ok(sample)
    }
}
