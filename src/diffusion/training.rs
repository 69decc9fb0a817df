//! The training objective: noise regression, the variational bound on the
//! learned variance and the representation alignment term.
use super::losses::{discretized_gaussian_log_likelihood, mean_flat, normal_kl};
use super::{GaussianDiffusion, LossType, ModelMeanType};
use crate::error::{Error, Result};
use crate::models::{Conditioning, DenoisingModel};
use std::f64::consts::LN_2;
use tch::{Kind, Tensor};

/// Weight of the representation alignment term in the total loss.
pub const DEFAULT_PRR_WEIGHT: f64 = 0.1;

/// The individual terms of the training loss. `mse`, `vb` and `loss` hold one
/// value per batch element.
#[derive(Debug)]
pub struct TrainingLosses {
    pub mse: Tensor,
    pub vb: Tensor,
    /// Representation alignment, `None` when not applicable.
    pub prr: Option<Tensor>,
    pub loss: Tensor,
}

impl TrainingLosses {
    /// The scalar to backpropagate: the batch mean of `loss` plus the
    /// weighted alignment term.
    pub fn total(&self, prr_weight: f64) -> Tensor {
        let loss = self.loss.mean(Kind::Float);
        match &self.prr {
            Some(prr) => loss + prr_weight * prr,
            None => loss,
        }
    }
}

/// Mean over the feature layers of `1 - cos(aligned, target)`, computed along
/// the last dimension.
///
/// Returns `None` when no alignment mode is selected, when no target features
/// were extracted, or when the backbone did not return aligned features.
pub fn representation_loss(
    aligned: Option<&[Tensor]>,
    cond: &Conditioning,
) -> Result<Option<Tensor>> {
    let (Some(_), Some(targets), Some(aligned)) = (cond.mode, cond.features.as_ref(), aligned)
    else {
        return Ok(None);
    };
    if aligned.len() != targets.len() || aligned.is_empty() {
        return Err(Error::shape(
            "aligned feature layers",
            &[targets.len() as i64],
            &[aligned.len() as i64],
        ));
    }
    let mut total: Option<Tensor> = None;
    for (projected, target) in aligned.iter().zip(targets.iter()) {
        if projected.size() != target.size() {
            return Err(Error::shape("aligned features", &target.size(), &projected.size()));
        }
        let cos = Tensor::cosine_similarity(projected, &target.to_kind(projected.kind()), -1, 1e-8);
        let term = (1f64 - cos).mean(Kind::Float);
        total = Some(match total {
            Some(total) => total + term,
            None => term,
        });
    }
    Ok(total.map(|total| total / aligned.len() as f64))
}

impl GaussianDiffusion {
    /// Terms of the variational lower bound in bits per dimension, one value
    /// per batch element: the KL to the true posterior, or the decoder
    /// negative log-likelihood at the first timestep.
    fn vb_terms_bpd(
        &self,
        x_start: &Tensor,
        x_t: &Tensor,
        t: &Tensor,
        mean_output: Tensor,
        var_values: Option<&Tensor>,
    ) -> Result<Tensor> {
        let true_posterior = self.q_posterior_mean_variance(x_start, x_t, t)?;
        let out = self.reverse_step_from_output(x_t, t, mean_output, var_values, false)?;
        let kl = normal_kl(
            &true_posterior.mean,
            &true_posterior.log_variance,
            &out.mean,
            &out.log_variance,
        );
        let kl = mean_flat(&kl) / LN_2;
        let decoder_nll =
            -discretized_gaussian_log_likelihood(x_start, &out.mean, &(0.5 * &out.log_variance));
        let decoder_nll = mean_flat(&decoder_nll) / LN_2;
        Ok(decoder_nll.where_self(&t.eq(0), &kl))
    }

    /// Computes the training losses for a single timestep per batch element.
    ///
    /// `noise` defaults to a standard normal draw shaped like `x_start`.
    pub fn training_losses<M: DenoisingModel + ?Sized>(
        &self,
        model: &M,
        x_start: &Tensor,
        t: &Tensor,
        cond: &Conditioning,
        noise: Option<&Tensor>,
    ) -> Result<TrainingLosses> {
        let noise = match noise {
            Some(noise) => noise.shallow_clone(),
            None => Tensor::randn_like(x_start),
        };
        let x_t = self.q_sample(x_start, t, Some(&noise))?;
        let (mean_output, var_values, aligned) = self.run_model(model, &x_t, t, cond)?;
        let prr = representation_loss(aligned.as_deref(), cond)?;
        let num_timesteps = self.num_timesteps() as f64;

        if self.loss_type.is_vb() {
            let vb = self.vb_terms_bpd(x_start, &x_t, t, mean_output, var_values.as_ref())?;
            let vb = match self.loss_type {
                LossType::RescaledKl => vb * num_timesteps,
                _ => vb,
            };
            return Ok(TrainingLosses {
                mse: vb.zeros_like(),
                vb: vb.shallow_clone(),
                prr,
                loss: vb,
            });
        }

        let vb = match var_values.as_ref() {
            // Only the variance is trained through the bound, the mean is
            // trained by the MSE alone.
            Some(values) => {
                let vb = self.vb_terms_bpd(x_start, &x_t, t, mean_output.detach(), Some(values))?;
                match self.loss_type {
                    LossType::RescaledMse => vb * (num_timesteps / 1000.0),
                    _ => vb,
                }
            }
            None => Tensor::zeros([x_start.size()[0]], (Kind::Float, x_start.device())),
        };

        let target = match self.model_mean_type {
            ModelMeanType::PreviousX => self.q_posterior_mean_variance(x_start, &x_t, t)?.mean,
            ModelMeanType::StartX => x_start.shallow_clone(),
            ModelMeanType::Epsilon => noise,
        };
        if target.size() != mean_output.size() {
            return Err(Error::shape("training target", &target.size(), &mean_output.size()));
        }
        let mse = mean_flat(&(target - &mean_output).square());
        let loss = &mse + &vb;
        Ok(TrainingLosses { mse, vb, prr, loss })
    }
}
