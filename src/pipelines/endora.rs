//! Video generation from a trained checkpoint.
//!
//! For every clip, the matching mask video is encoded as the reference
//! latent, a latent is denoised from pure noise with the configured sampler
//! and the result is decoded back to frames.
use crate::config::SampleConfig;
use crate::diffusion::{create_diffusion, GaussianDiffusion};
use crate::error::{Error, Result};
use crate::guidance::GuidedModel;
use crate::models::vae::{decode_video, encode_video};
use crate::models::{Conditioning, DenoisingModel, LatentCodec};
use crate::train::checkpoint::{load_intersection, Checkpoint, LoadReport};
use crate::video::{save_frames, ClipSampling};
use rand::Rng;
use std::path::PathBuf;
use tch::{nn, Device, Kind, Tensor};
use tracing::{debug, info};

/// Channels of the auto-encoder latents.
pub const LATENT_CHANNELS: i64 = 4;

/// Reads `config.ckpt`. Fails with [`Error::MissingCheckpoint`] when no
/// checkpoint is set or the file does not exist, so that nothing gets loaded
/// or computed without trained weights.
pub fn sampling_checkpoint(config: &SampleConfig) -> Result<Checkpoint> {
    let path = config.ckpt.as_ref().ok_or(Error::MissingCheckpoint(None))?;
    Checkpoint::load(path)
}

/// Copies the EMA weights into `vs`, then converts every variable to half
/// precision when `use_fp16` is set.
pub fn load_ema_weights(
    config: &SampleConfig,
    checkpoint: &Checkpoint,
    vs: &mut nn::VarStore,
) -> LoadReport {
    info!("Loading EMA weights from {:?}", checkpoint.path);
    let report = load_intersection(vs, &checkpoint.ema);
    if config.use_fp16 {
        vs.half();
    }
    report
}

pub struct VideoSampler<'a, M: ?Sized, C: ?Sized> {
    config: &'a SampleConfig,
    diffusion: GaussianDiffusion,
    model: &'a M,
    codec: &'a C,
    device: Device,
}

impl<'a, M, C> VideoSampler<'a, M, C>
where
    M: DenoisingModel + ?Sized,
    C: LatentCodec + ?Sized,
{
    pub fn new(
        config: &'a SampleConfig,
        model: &'a M,
        codec: &'a C,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;
        let diffusion = create_diffusion(&config.sampling_diffusion())?;
        Ok(Self { config, diffusion, model, codec, device })
    }

    pub fn diffusion(&self) -> &GaussianDiffusion {
        &self.diffusion
    }

    /// `(1, frames, 4, h / 8, w / 8)`
    pub fn latent_shape(&self) -> [i64; 5] {
        let latent_size = self.config.latent_size() as i64;
        [1, self.config.num_frames as i64, LATENT_CHANNELS, latent_size, latent_size]
    }

    fn guidance_scale(&self) -> Option<f64> {
        Some(self.config.cfg_scale).filter(|&scale| scale > 1.)
    }

    /// Generates one clip shaped `(1, frames, 3, h, w)` in `[-1, 1]`.
    ///
    /// `reference` is a mask video in pixel space, `labels` are only needed
    /// with guidance. `noise` defaults to a standard normal draw.
    pub fn sample(
        &self,
        reference: Option<&Tensor>,
        labels: Option<Tensor>,
        noise: Option<Tensor>,
    ) -> Result<Tensor> {
        let _no_grad_guard = tch::no_grad_guard();
        let reference_latent = match reference {
            Some(reference) => Some(encode_video(self.codec, &reference.to_device(self.device))?),
            None => None,
        };
        let cond = Conditioning {
            labels,
            guidance_scale: self.guidance_scale(),
            use_fp16: self.config.use_fp16,
            reference_latent,
            mode: self.config.mode,
            ..Default::default()
        };
        let kind = self.config.sample_method.sampler(self.config.eta);
        let shape = self.latent_shape();
        let progress = |remaining: usize| debug!(remaining, "sampling");
        let latents = match self.guidance_scale() {
            Some(scale) => {
                let guided =
                    GuidedModel::new(self.model, scale).with_null_label(self.config.null_label);
                self.diffusion.sample_loop(
                    kind,
                    &guided,
                    &shape,
                    noise,
                    self.device,
                    self.config.clip_denoised,
                    &cond,
                    progress,
                )?
            }
            None => self.diffusion.sample_loop(
                kind,
                self.model,
                &shape,
                noise,
                self.device,
                self.config.clip_denoised,
                &cond,
                progress,
            )?,
        };
        decode_video(self.codec, &latents.to_kind(Kind::Float))
    }

    /// Samples clips `1..=num_clips`, conditioned on the mask videos
    /// `<mask_path>/00001`, ... and writes each one to
    /// `<save_video_path>/sample_01`, ... Returns the clip directories.
    pub fn run<R: Rng>(&self, rng: &mut R) -> Result<Vec<PathBuf>> {
        let sampling = ClipSampling {
            num_frames: self.config.num_frames,
            frame_interval: self.config.frame_interval,
            image_size: self.config.image_size,
        };
        let mut outputs = Vec::with_capacity(self.config.num_clips);
        for index in 1..=self.config.num_clips {
            let mask = sampling.load(self.config.mask_path.join(format!("{index:05}")), rng)?;
            let labels = match self.guidance_scale() {
                Some(_) => {
                    let label = rng.gen_range(0..self.config.num_classes);
                    Some(Tensor::from_slice(&[label]).to_device(self.device))
                }
                None => None,
            };
            let video = self.sample(Some(&mask.unsqueeze(0)), labels, None)?;
            let dir = self.config.save_video_path.join(format!("sample_{index:02}"));
            save_frames(&video.get(0), &dir)?;
            info!("Saved clip {index}/{} to {dir:?}", self.config.num_clips);
            outputs.push(dir);
        }
        Ok(outputs)
    }
}
