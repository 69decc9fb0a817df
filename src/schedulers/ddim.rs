//! # Denoising Diffusion Implicit Models
//!
//! The Denoising Diffusion Implicit Models (DDIM) is a simple scheduler
//! similar to Denoising Diffusion Probabilistic Models (DDPM). The DDPM
//! generative process is the reverse of a Markovian process, DDIM generalizes
//! this to non-Markovian guidance.
//!
//! With `eta = 0` the update is deterministic, `eta = 1` recovers the
//! ancestral sampler's amount of noise. Usually combined with a respaced
//! schedule to sample in far fewer steps than used for training.
//!
//! Denoising Diffusion Implicit Models, J. Song et al, 2020.
//! https://arxiv.org/abs/2010.02502
use super::{timestep_tensor, StepOutput};
use crate::diffusion::{GaussianDiffusion, ReverseStep};
use crate::error::{Error, Result};
use crate::models::{Conditioning, DenoisingModel};
use tch::Tensor;

/// Computes `x_{t-1}` from the predicted clean sample. Noise is only drawn
/// when `eta > 0` and `timestep > 0`.
pub fn step_from_output(
    diffusion: &GaussianDiffusion,
    out: &ReverseStep,
    sample: &Tensor,
    timestep: usize,
    eta: f64,
) -> Tensor {
    let schedule = diffusion.schedule();
    let t = timestep_tensor(timestep, sample);
    // Re-derive the noise in case the prediction was clipped.
    let eps = diffusion.predict_eps_from_xstart(sample, &t, &out.pred_xstart);

    let alpha_prod_t = schedule.alphas_cumprod()[timestep];
    let alpha_prod_t_prev = schedule.alphas_cumprod_prev()[timestep];
    let std_dev_t = eta
        * ((1. - alpha_prod_t_prev) / (1. - alpha_prod_t)).sqrt()
        * (1. - alpha_prod_t / alpha_prod_t_prev).sqrt();

    let pred_sample_direction =
        (1. - alpha_prod_t_prev - std_dev_t * std_dev_t).max(0.).sqrt() * eps;
    let prev_sample = alpha_prod_t_prev.sqrt() * &out.pred_xstart + pred_sample_direction;
    if eta > 0. && timestep > 0 {
        &prev_sample + Tensor::randn_like(&prev_sample) * std_dev_t
    } else {
        prev_sample
    }
}

/// Performs a backward step during inference.
pub fn step<M: DenoisingModel + ?Sized>(
    diffusion: &GaussianDiffusion,
    model: &M,
    sample: &Tensor,
    timestep: usize,
    eta: f64,
    clip_denoised: bool,
    cond: &Conditioning,
) -> Result<StepOutput> {
    let t = timestep_tensor(timestep, sample);
    let out = diffusion.p_mean_variance(model, sample, &t, clip_denoised, cond)?;
    let prev_sample = step_from_output(diffusion, &out, sample, timestep, eta);
    Ok(StepOutput { prev_sample, pred_xstart: out.pred_xstart })
}

/// Runs the deterministic ODE one step forward, from `x_t` to `x_{t+1}`.
/// Used to invert a clean sample back to its noise.
pub fn reverse_step<M: DenoisingModel + ?Sized>(
    diffusion: &GaussianDiffusion,
    model: &M,
    sample: &Tensor,
    timestep: usize,
    eta: f64,
    clip_denoised: bool,
    cond: &Conditioning,
) -> Result<StepOutput> {
    if eta != 0. {
        return Err(Error::Config(format!("reverse DDIM steps require eta = 0, got {eta}")));
    }
    let schedule = diffusion.schedule();
    let t = timestep_tensor(timestep, sample);
    let out = diffusion.p_mean_variance(model, sample, &t, clip_denoised, cond)?;
    let eps = diffusion.predict_eps_from_xstart(sample, &t, &out.pred_xstart);
    let alpha_bar_next = schedule.alphas_cumprod_next()[timestep];
    let next_sample = alpha_bar_next.sqrt() * &out.pred_xstart + (1. - alpha_bar_next).sqrt() * eps;
    Ok(StepOutput { prev_sample: next_sample, pred_xstart: out.pred_xstart })
}
