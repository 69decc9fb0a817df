//! # Denoising Diffusion Probabilistic Models
//!
//! Ancestral sampling: each reverse step draws `x_{t-1}` from the model's
//! Gaussian `p(x_{t-1} | x_t)`, with the (fixed or learned) variance. The last
//! step is deterministic and returns the posterior mean.
//!
//! Denoising Diffusion Probabilistic Models, J. Ho et al, 2020.
//! https://arxiv.org/abs/2006.11239
use super::{timestep_tensor, StepOutput};
use crate::diffusion::{GaussianDiffusion, ReverseStep};
use crate::error::Result;
use crate::models::{Conditioning, DenoisingModel};
use tch::Tensor;

/// Samples `x_{t-1}` given the model's reverse-step distribution at
/// `timestep`. No noise is drawn at `timestep == 0`.
pub fn step_from_output(out: &ReverseStep, timestep: usize) -> Tensor {
    if timestep == 0 {
        return out.mean.shallow_clone();
    }
    let noise = Tensor::randn_like(&out.mean);
    &out.mean + (0.5f64 * &out.log_variance).exp() * noise
}

/// Performs a backward step during inference.
pub fn step<M: DenoisingModel + ?Sized>(
    diffusion: &GaussianDiffusion,
    model: &M,
    sample: &Tensor,
    timestep: usize,
    clip_denoised: bool,
    cond: &Conditioning,
) -> Result<StepOutput> {
    let t = timestep_tensor(timestep, sample);
    let out = diffusion.p_mean_variance(model, sample, &t, clip_denoised, cond)?;
    let prev_sample = step_from_output(&out, timestep);
    Ok(StepOutput { prev_sample, pred_xstart: out.pred_xstart })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diffusion::{create_diffusion, DiffusionConfig, CHANNEL_DIM};
    use crate::models::ModelOutput;
    use tch::{Device, Kind};

    fn constant_model(xs: &Tensor, _: &Tensor, _: &Conditioning) -> Result<ModelOutput> {
        Ok(Tensor::cat(&[xs.full_like(0.1), xs.zeros_like()], CHANNEL_DIM).into())
    }

    #[test]
    fn last_step_adds_no_noise() -> Result<()> {
        let diffusion = create_diffusion(&DiffusionConfig::default())?;
        let x = Tensor::randn([1, 2, 4, 4, 4], (Kind::Float, Device::Cpu));
        let cond = Conditioning::default();
        let first = step(&diffusion, &constant_model, &x, 0, false, &cond)?;
        let second = step(&diffusion, &constant_model, &x, 0, false, &cond)?;
        assert!(first.prev_sample.equal(&second.prev_sample));

        let t = timestep_tensor(0, &x);
        let out = diffusion.p_mean_variance(&constant_model, &x, &t, false, &cond)?;
        assert!(first.prev_sample.equal(&out.mean));
        Ok(())
    }

    #[test]
    fn intermediate_steps_are_stochastic() -> Result<()> {
        let diffusion = create_diffusion(&DiffusionConfig::default())?;
        let x = Tensor::randn([1, 2, 4, 4, 4], (Kind::Float, Device::Cpu));
        let cond = Conditioning::default();
        let first = step(&diffusion, &constant_model, &x, 500, false, &cond)?;
        let second = step(&diffusion, &constant_model, &x, 500, false, &cond)?;
        assert!(!first.prev_sample.equal(&second.prev_sample));
        assert_eq!(first.prev_sample.size(), x.size());
        Ok(())
    }

    #[test]
    fn clipping_bounds_predicted_start() -> Result<()> {
        let diffusion = create_diffusion(&DiffusionConfig::default())?;
        let x = Tensor::full([1, 1, 4, 2, 2], 5., (Kind::Float, Device::Cpu));
        let out = step(&diffusion, &constant_model, &x, 10, true, &Conditioning::default())?;
        assert!(out.pred_xstart.abs().max().double_value(&[]) <= 1.);
        Ok(())
    }
}
