//! # Noise schedules
//!
//! The variance schedule `beta_t` and every quantity derived from it, shared
//! read-only by the forward process, the loss and the reverse samplers.
//! Respacing selects a subsequence of the training timesteps so that sampling
//! can run with fewer steps than training.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tch::Tensor;

pub mod ddim;
pub mod ddpm;

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Linear interpolation, rescaled so that any number of timesteps covers
    /// the same range as the 1000 step schedule.
    Linear,
    /// Glide cosine schedule
    #[serde(alias = "cosine")]
    SquaredcosCapV2,
}

impl BetaSchedule {
    pub fn betas(&self, num_diffusion_timesteps: usize) -> Vec<f64> {
        match self {
            Self::Linear => {
                let scale = 1000. / num_diffusion_timesteps as f64;
                linspace(scale * 0.0001, scale * 0.02, num_diffusion_timesteps)
            }
            Self::SquaredcosCapV2 => betas_for_alpha_bar(num_diffusion_timesteps, 0.999),
        }
    }
}

fn linspace(start: f64, end: f64, steps: usize) -> Vec<f64> {
    match steps {
        0 => vec![],
        1 => vec![start],
        _ => {
            let delta = (end - start) / (steps - 1) as f64;
            (0..steps).map(|i| start + delta * i as f64).collect()
        }
    }
}

/// Create a beta schedule that discretizes the given alpha_t_bar function,
/// which defines the cumulative product of `(1-beta)` over time from
/// `t = [0,1]`.
///
/// Contains a function `alpha_bar` that takes an argument `t` and transforms
/// it to the cumulative product of `(1-beta)` up to that part of the
/// diffusion process.
pub(crate) fn betas_for_alpha_bar(num_diffusion_timesteps: usize, max_beta: f64) -> Vec<f64> {
    let alpha_bar =
        |t: f64| f64::cos((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).powi(2);
    (0..num_diffusion_timesteps)
        .map(|i| {
            let t1 = i as f64 / num_diffusion_timesteps as f64;
            let t2 = (i + 1) as f64 / num_diffusion_timesteps as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect()
}

/// The variance schedule and its derived arrays.
///
/// Once built the schedule is never mutated; respacing creates a new one.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    betas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    alphas_cumprod_prev: Vec<f64>,
    alphas_cumprod_next: Vec<f64>,
    timestep_map: Vec<i64>,
    pub(crate) sqrt_alphas_cumprod: Vec<f64>,
    pub(crate) sqrt_one_minus_alphas_cumprod: Vec<f64>,
    pub(crate) log_one_minus_alphas_cumprod: Vec<f64>,
    pub(crate) sqrt_recip_alphas_cumprod: Vec<f64>,
    pub(crate) sqrt_recipm1_alphas_cumprod: Vec<f64>,
    pub(crate) posterior_variance: Vec<f64>,
    pub(crate) posterior_log_variance_clipped: Vec<f64>,
    pub(crate) posterior_mean_coef1: Vec<f64>,
    pub(crate) posterior_mean_coef2: Vec<f64>,
}

impl NoiseSchedule {
    /// Builds a schedule from its betas, the cumulative products being
    /// computed in double precision.
    pub fn new(betas: Vec<f64>) -> Result<Self> {
        let mut alphas_cumprod = Vec::with_capacity(betas.len());
        let mut cumprod = 1.0;
        for beta in betas.iter() {
            cumprod *= 1.0 - beta;
            alphas_cumprod.push(cumprod);
        }
        let timestep_map = (0..betas.len() as i64).collect();
        Self::from_parts(betas, alphas_cumprod, timestep_map)
    }

    pub fn from_kind(kind: BetaSchedule, num_diffusion_timesteps: usize) -> Result<Self> {
        Self::new(kind.betas(num_diffusion_timesteps))
    }

    fn from_parts(
        betas: Vec<f64>,
        alphas_cumprod: Vec<f64>,
        timestep_map: Vec<i64>,
    ) -> Result<Self> {
        if betas.is_empty() {
            return Err(Error::InvalidSchedule("no timesteps".to_string()));
        }
        if let Some((t, beta)) = betas.iter().enumerate().find(|&(_, &b)| !(b > 0. && b < 1.)) {
            return Err(Error::InvalidSchedule(format!("beta at t={t} is {beta}, outside (0, 1)")));
        }
        if let Some(t) = alphas_cumprod.windows(2).position(|w| w[1] >= w[0]) {
            return Err(Error::InvalidSchedule(format!(
                "alphas_cumprod is not strictly decreasing at t={}",
                t + 1
            )));
        }
        let n = betas.len();
        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();
        let alphas_cumprod_prev: Vec<f64> =
            std::iter::once(1.0).chain(alphas_cumprod[..n - 1].iter().copied()).collect();
        let alphas_cumprod_next: Vec<f64> =
            alphas_cumprod[1..].iter().copied().chain(std::iter::once(0.0)).collect();

        let from_ac = |f: fn(f64) -> f64| alphas_cumprod.iter().map(|&a| f(a)).collect::<Vec<_>>();
        let sqrt_alphas_cumprod = from_ac(|a| a.sqrt());
        let sqrt_one_minus_alphas_cumprod = from_ac(|a| (1.0 - a).sqrt());
        let log_one_minus_alphas_cumprod = from_ac(|a| (1.0 - a).ln());
        let sqrt_recip_alphas_cumprod = from_ac(|a| (1.0 / a).sqrt());
        let sqrt_recipm1_alphas_cumprod = from_ac(|a| (1.0 / a - 1.0).sqrt());

        let mut posterior_variance = Vec::with_capacity(n);
        let mut posterior_mean_coef1 = Vec::with_capacity(n);
        let mut posterior_mean_coef2 = Vec::with_capacity(n);
        for t in 0..n {
            let (beta, ac, ac_prev) = (betas[t], alphas_cumprod[t], alphas_cumprod_prev[t]);
            posterior_variance.push(beta * (1.0 - ac_prev) / (1.0 - ac));
            posterior_mean_coef1.push(beta * ac_prev.sqrt() / (1.0 - ac));
            posterior_mean_coef2.push((1.0 - ac_prev) * alphas[t].sqrt() / (1.0 - ac));
        }
        // The posterior variance is 0 at the start of the chain.
        let posterior_log_variance_clipped = (0..n)
            .map(|t| {
                let v = if t == 0 && n > 1 { posterior_variance[1] } else { posterior_variance[t] };
                v.max(1e-20).ln()
            })
            .collect();

        Ok(Self {
            betas,
            alphas_cumprod,
            alphas_cumprod_prev,
            alphas_cumprod_next,
            timestep_map,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
            log_one_minus_alphas_cumprod,
            sqrt_recip_alphas_cumprod,
            sqrt_recipm1_alphas_cumprod,
            posterior_variance,
            posterior_log_variance_clipped,
            posterior_mean_coef1,
            posterior_mean_coef2,
        })
    }

    /// Keeps only the timesteps in `use_timesteps`.
    ///
    /// The cumulative products at the kept indices are copied over as-is and
    /// the betas are re-derived from them, so training and sampling see the
    /// exact same `alphas_cumprod`.
    pub fn respace(&self, use_timesteps: &BTreeSet<usize>) -> Result<Self> {
        if let Some(&last) = use_timesteps.iter().next_back() {
            if last >= self.num_timesteps() {
                return Err(Error::InvalidSchedule(format!(
                    "cannot keep timestep {last} out of {}",
                    self.num_timesteps()
                )));
            }
        }
        let mut last_alpha_cumprod = 1.0;
        let mut betas = Vec::with_capacity(use_timesteps.len());
        let mut alphas_cumprod = Vec::with_capacity(use_timesteps.len());
        let mut timestep_map = Vec::with_capacity(use_timesteps.len());
        for &t in use_timesteps.iter() {
            let alpha_cumprod = self.alphas_cumprod[t];
            betas.push(1.0 - alpha_cumprod / last_alpha_cumprod);
            alphas_cumprod.push(alpha_cumprod);
            timestep_map.push(self.timestep_map[t]);
            last_alpha_cumprod = alpha_cumprod;
        }
        Self::from_parts(betas, alphas_cumprod, timestep_map)
    }

    pub fn num_timesteps(&self) -> usize {
        self.betas.len()
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    pub fn alphas_cumprod_prev(&self) -> &[f64] {
        &self.alphas_cumprod_prev
    }

    pub fn alphas_cumprod_next(&self) -> &[f64] {
        &self.alphas_cumprod_next
    }

    pub fn posterior_variance(&self) -> &[f64] {
        &self.posterior_variance
    }

    pub fn posterior_log_variance_clipped(&self) -> &[f64] {
        &self.posterior_log_variance_clipped
    }

    /// Maps each schedule index to the training timestep it stands for.
    pub fn timestep_map(&self) -> &[i64] {
        &self.timestep_map
    }
}

/// Picks the training timesteps to keep when sampling with fewer steps.
///
/// `spec` is either empty (keep all of them), `"ddimN"` (a fixed integer
/// stride yielding exactly N steps) or a comma separated list of step counts,
/// one per equally sized section of the original schedule. For instance with
/// 300 timesteps, `"10,15,20"` keeps 10 steps out of the first 100, 15 out of
/// the next 100 and 20 out of the last 100.
pub fn space_timesteps(num_timesteps: usize, spec: &str) -> Result<BTreeSet<usize>> {
    let spec = spec.trim();
    let err = |reason: String| Error::InvalidRespacing {
        num_timesteps,
        spec: spec.to_string(),
        reason,
    };
    if spec.is_empty() {
        return Ok((0..num_timesteps).collect());
    }
    if let Some(count) = spec.strip_prefix("ddim") {
        let desired: usize = count.parse().map_err(|_| err(format!("bad step count {count:?}")))?;
        for stride in 1..num_timesteps.max(2) {
            if (0..num_timesteps).step_by(stride).len() == desired {
                return Ok((0..num_timesteps).step_by(stride).collect());
            }
        }
        return Err(err(format!("no integer stride yields exactly {desired} steps")));
    }

    let section_counts = spec
        .split(',')
        .map(|s| s.trim().parse::<usize>().map_err(|_| err(format!("bad step count {s:?}"))))
        .collect::<Result<Vec<_>>>()?;
    let size_per = num_timesteps / section_counts.len();
    let extra = num_timesteps % section_counts.len();
    let mut start_idx = 0;
    let mut all_steps = BTreeSet::new();
    for (i, &section_count) in section_counts.iter().enumerate() {
        let size = size_per + usize::from(i < extra);
        if size < section_count {
            return Err(err(format!("cannot divide section of {size} steps into {section_count}")));
        }
        let frac_stride =
            if section_count <= 1 { 1. } else { (size - 1) as f64 / (section_count - 1) as f64 };
        let mut cur_idx = 0.0f64;
        for _ in 0..section_count {
            all_steps.insert(start_idx + cur_idx.round_ties_even() as usize);
            cur_idx += frac_stride;
        }
        start_idx += size;
    }
    Ok(all_steps)
}

/// The result of a single reverse step.
#[derive(Debug)]
pub struct StepOutput {
    /// The sample for the next (lower) timestep.
    pub prev_sample: Tensor,
    /// The model's estimate of the clean sample at this step.
    pub pred_xstart: Tensor,
}

/// A timestep shared by the whole batch of `like`.
pub(crate) fn timestep_tensor(timestep: usize, like: &Tensor) -> Tensor {
    let batch_size = like.size()[0];
    Tensor::full([batch_size], timestep as i64, (tch::Kind::Int64, like.device()))
}

/// Gathers `values[t]` for each batch element and reshapes the result so that
/// it broadcasts against `like`.
pub(crate) fn extract(values: &[f64], timesteps: &Tensor, like: &Tensor) -> Tensor {
    let device = timesteps.device();
    let mut shape = vec![-1i64];
    shape.resize(like.dim(), 1);
    Tensor::from_slice(values)
        .to_device(device)
        .index_select(0, timesteps)
        .to_kind(like.kind())
        .view(shape.as_slice())
}
