//! Classifier-free guidance.
//!
//! The backbone is run once on a doubled batch, the first half conditioned on
//! the requested labels and the second half on the null class. The two noise
//! predictions are then mixed with the guidance scale.
use crate::diffusion::CHANNEL_DIM;
use crate::error::{Error, Result};
use crate::models::{Conditioning, DenoisingModel, ModelOutput};
use tch::{Kind, Tensor};

/// The label the backbone was trained to treat as "no class".
pub const DEFAULT_NULL_LABEL: i64 = 101;

/// Mixes conditional and unconditional predictions. Returns `cond` untouched
/// when `scale <= 1`.
pub fn mix_guidance(uncond: &Tensor, cond: &Tensor, scale: f64) -> Tensor {
    if scale <= 1.0 {
        return cond.shallow_clone();
    }
    uncond + scale * (cond - uncond)
}

/// A backbone wrapped with classifier-free guidance. A scale set on the
/// [`Conditioning`] takes precedence over the one given at construction.
#[derive(Debug)]
pub struct GuidedModel<'a, M: ?Sized> {
    inner: &'a M,
    scale: f64,
    null_label: i64,
}

impl<'a, M: DenoisingModel + ?Sized> GuidedModel<'a, M> {
    pub fn new(inner: &'a M, scale: f64) -> Self {
        Self { inner, scale, null_label: DEFAULT_NULL_LABEL }
    }

    pub fn with_null_label(mut self, null_label: i64) -> Self {
        self.null_label = null_label;
        self
    }

    fn guided_forward(
        &self,
        xs: &Tensor,
        timesteps: &Tensor,
        cond: &Conditioning,
        scale: f64,
    ) -> Result<ModelOutput> {
        let labels = cond.labels.as_ref().ok_or_else(|| {
            Error::Config("classifier-free guidance requires class labels".to_string())
        })?;
        let batch_size = xs.size()[0];
        let channels = xs.size()[CHANNEL_DIM as usize];
        let null_labels =
            Tensor::full([batch_size], self.null_label, (Kind::Int64, labels.device()));
        let doubled = Conditioning {
            labels: Some(Tensor::cat(&[labels.to_kind(Kind::Int64), null_labels], 0)),
            guidance_scale: None,
            reference_latent: cond
                .reference_latent
                .as_ref()
                .map(|c| Tensor::cat(&[c, c], 0)),
            features: None,
            ..cond.shallow_clone()
        };
        let out = self.inner.forward(
            &Tensor::cat(&[xs, xs], 0),
            &Tensor::cat(&[timesteps, timesteps], 0),
            &doubled,
        )?;

        let out_size = out.prediction.size();
        if out_size.len() != 5 || out_size[0] != 2 * batch_size || out_size[2] < channels {
            let mut expected = xs.size();
            expected[0] *= 2;
            return Err(Error::shape("guided model output", &expected, &out_size));
        }
        let eps = out.prediction.narrow(CHANNEL_DIM, 0, channels);
        let rest = out.prediction.narrow(CHANNEL_DIM, channels, out_size[2] - channels);
        let cond_eps = eps.narrow(0, 0, batch_size);
        let uncond_eps = eps.narrow(0, batch_size, batch_size);
        let guided_eps = mix_guidance(&uncond_eps, &cond_eps, scale);
        let prediction = Tensor::cat(&[guided_eps, rest.narrow(0, 0, batch_size)], CHANNEL_DIM);
        let aligned_features = out
            .aligned_features
            .map(|fs| fs.iter().map(|f| f.narrow(0, 0, batch_size)).collect());
        Ok(ModelOutput { prediction, aligned_features })
    }
}

impl<M: DenoisingModel + ?Sized> DenoisingModel for GuidedModel<'_, M> {
    fn forward(&self, xs: &Tensor, timesteps: &Tensor, cond: &Conditioning) -> Result<ModelOutput> {
        let scale = cond.guidance_scale.unwrap_or(self.scale);
        if scale <= 1.0 {
            return self.inner.forward(xs, timesteps, cond);
        }
        self.guided_forward(xs, timesteps, cond, scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tch::Device;

    // Noise channels are the input scaled by the label, variance channels a
    // constant.
    fn label_scaled(xs: &Tensor, _: &Tensor, cond: &Conditioning) -> Result<ModelOutput> {
        let labels = match &cond.labels {
            Some(labels) => labels.to_kind(xs.kind()),
            None => Tensor::ones([xs.size()[0]], (xs.kind(), xs.device())),
        };
        let eps = xs * labels.view([-1, 1, 1, 1, 1]);
        Ok(Tensor::cat(&[eps, xs.full_like(0.7)], CHANNEL_DIM).into())
    }

    #[test]
    fn mix_is_identity_below_one() {
        let uncond = Tensor::randn([2, 3], (Kind::Float, Device::Cpu));
        let cond = Tensor::randn([2, 3], (Kind::Float, Device::Cpu));
        assert!(mix_guidance(&uncond, &cond, 1.0).equal(&cond));
        assert!(mix_guidance(&uncond, &cond, 0.5).equal(&cond));
        let mixed = mix_guidance(&uncond, &cond, 4.0);
        let expected = &uncond + (&cond - &uncond) * 4.0;
        assert!((mixed - expected).abs().max().double_value(&[]) < 1e-6);
    }

    #[test]
    fn scale_one_calls_backbone_directly() -> Result<()> {
        let calls = Cell::new(0);
        let model = |xs: &Tensor, t: &Tensor, cond: &Conditioning| -> Result<ModelOutput> {
            calls.set(calls.get() + 1);
            assert_eq!(xs.size()[0], 1);
            label_scaled(xs, t, cond)
        };
        let guided = GuidedModel::new(&model, 1.0);
        let xs = Tensor::randn([1, 2, 4, 3, 3], (Kind::Float, Device::Cpu));
        let t = Tensor::from_slice(&[7i64]);
        let cond = Conditioning { labels: Some(Tensor::from_slice(&[2i64])), ..Default::default() };
        let out = guided.forward(&xs, &t, &cond)?;
        let direct = label_scaled(&xs, &t, &cond)?;
        assert!(out.prediction.equal(&direct.prediction));
        assert_eq!(calls.get(), 1);
        Ok(())
    }

    #[test]
    fn guided_forward_mixes_noise_channels_only() -> Result<()> {
        let calls = Cell::new(0);
        let model = |xs: &Tensor, t: &Tensor, cond: &Conditioning| -> Result<ModelOutput> {
            calls.set(calls.get() + 1);
            assert_eq!(xs.size()[0], 2);
            let labels = Vec::<i64>::try_from(cond.labels.as_ref().unwrap())?;
            assert_eq!(labels, [2, 0]);
            assert_eq!(cond.reference_latent.as_ref().map(|c| c.size()[0]), Some(2));
            label_scaled(xs, t, cond)
        };
        let guided = GuidedModel::new(&model, 3.0).with_null_label(0);
        let xs = Tensor::randn([1, 2, 4, 3, 3], (Kind::Float, Device::Cpu));
        let cond = Conditioning {
            labels: Some(Tensor::from_slice(&[2i64])),
            reference_latent: Some(xs.zeros_like()),
            ..Default::default()
        };
        let out = guided.forward(&xs, &Tensor::from_slice(&[7i64]), &cond)?;
        assert_eq!(calls.get(), 1);
        assert_eq!(out.prediction.size(), [1, 2, 8, 3, 3]);
        // uncond = 0, cond = 2x, guided = 3 * 2x.
        let eps = out.prediction.narrow(CHANNEL_DIM, 0, 4);
        assert!((eps - &xs * 6.0).abs().max().double_value(&[]) < 1e-5);
        let var = out.prediction.narrow(CHANNEL_DIM, 4, 4);
        assert!((var - 0.7).abs().max().double_value(&[]) < 1e-6);
        Ok(())
    }

    #[test]
    fn conditioning_scale_overrides_the_default() -> Result<()> {
        let guided = GuidedModel::new(&label_scaled, 1.0).with_null_label(0);
        let xs = Tensor::randn([1, 2, 4, 3, 3], (Kind::Float, Device::Cpu));
        let t = Tensor::from_slice(&[3i64]);
        let cond = Conditioning {
            labels: Some(Tensor::from_slice(&[2i64])),
            guidance_scale: Some(5.0),
            ..Default::default()
        };
        let out = guided.forward(&xs, &t, &cond)?;
        let eps = out.prediction.narrow(CHANNEL_DIM, 0, 4);
        assert!((eps - &xs * 10.0).abs().max().double_value(&[]) < 1e-5);

        let cond = Conditioning { guidance_scale: Some(1.0), ..cond };
        let guided = GuidedModel::new(&label_scaled, 4.0);
        let out = guided.forward(&xs, &t, &cond)?;
        let eps = out.prediction.narrow(CHANNEL_DIM, 0, 4);
        assert!((eps - &xs * 2.0).abs().max().double_value(&[]) < 1e-5);
        Ok(())
    }

    #[test]
    fn guidance_without_labels_is_rejected() {
        let guided = GuidedModel::new(&label_scaled, 2.0);
        let xs = Tensor::zeros([1, 2, 4, 3, 3], (Kind::Float, Device::Cpu));
        let res = guided.forward(&xs, &Tensor::from_slice(&[0i64]), &Conditioning::default());
        assert!(matches!(res, Err(Error::Config(_))));
    }
}
