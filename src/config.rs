//! JSON configuration for the training session and the sampling pipeline.
//!
//! Every field has a default so that a config file only needs to list what
//! differs from the reference setup.
use crate::diffusion::sampling::SampleMethod;
use crate::diffusion::training::DEFAULT_PRR_WEIGHT;
use crate::diffusion::DiffusionConfig;
use crate::error::{Error, Result};
use crate::guidance::DEFAULT_NULL_LABEL;
use crate::models::{AlignmentMode, DEFAULT_FEATURE_LAYERS};
use crate::utils::file_open;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The VAE downsamples frames by this factor.
pub const VAE_DOWNSAMPLING: usize = 8;

fn from_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = file_open(path)?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

fn check_image_size(image_size: usize) -> Result<()> {
    if image_size == 0 || image_size % VAE_DOWNSAMPLING != 0 {
        return Err(Error::Config(format!(
            "image size must be a positive multiple of {VAE_DOWNSAMPLING}, got {image_size}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Model name, only used to name the experiment directory.
    pub model: String,
    /// TorchScript export of the backbone.
    pub backbone: PathBuf,
    /// TorchScript export of the VAE.
    pub vae: PathBuf,
    /// TorchScript export of the DINO ViT.
    pub feature_extractor: PathBuf,
    pub dataset: String,
    /// Directory holding one sub-directory of frames per video.
    pub data_path: PathBuf,
    /// Optional directory of mask videos, laid out like `data_path`, encoded
    /// as the reference latent.
    pub mask_path: Option<PathBuf>,
    pub results_dir: PathBuf,
    pub num_frames: usize,
    pub frame_interval: usize,
    pub image_size: usize,
    pub local_batch_size: usize,
    pub max_train_steps: usize,
    pub global_seed: u64,
    pub log_every: usize,
    pub ckpt_every: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub clip_max_norm: f64,
    /// Gradients are only clipped from this step on, before that the norm is
    /// just reported.
    pub start_clip_iter: usize,
    pub ema_decay: f64,
    pub prr_weight: f64,
    pub mode: Option<AlignmentMode>,
    pub feature_layers: Vec<i64>,
    /// Only train the parameters whose names contain one of
    /// `trainable_modules`.
    pub fixed_spatial: bool,
    pub trainable_modules: Vec<String>,
    /// Checkpoint used as a warm start, loaded by name intersection.
    pub pretrained: Option<PathBuf>,
    pub resume_from_checkpoint: Option<PathBuf>,
    /// Overrides the step count read from the resumed checkpoint.
    pub resume_step: Option<usize>,
    /// Consecutive non-finite losses tolerated before giving up.
    pub max_consecutive_skips: usize,
    pub diffusion: DiffusionConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            model: "EnDora-XL/2".to_string(),
            backbone: PathBuf::from("data/endora_backbone.pt"),
            vae: PathBuf::from("data/vae.pt"),
            feature_extractor: PathBuf::from("data/dino_vits8.pt"),
            dataset: "col".to_string(),
            data_path: PathBuf::from("data/frames"),
            mask_path: None,
            results_dir: PathBuf::from("results"),
            num_frames: 16,
            frame_interval: 3,
            image_size: 128,
            local_batch_size: 2,
            max_train_steps: 1_000_000,
            global_seed: 3407,
            log_every: 50,
            ckpt_every: 1000,
            learning_rate: 1e-4,
            weight_decay: 0.,
            clip_max_norm: 0.1,
            start_clip_iter: 20_000,
            ema_decay: 0.9999,
            prr_weight: DEFAULT_PRR_WEIGHT,
            mode: Some(AlignmentMode::TypeCnn),
            feature_layers: DEFAULT_FEATURE_LAYERS.to_vec(),
            fixed_spatial: false,
            trainable_modules: vec!["attn_temp".to_string()],
            pretrained: None,
            resume_from_checkpoint: None,
            resume_step: None,
            max_consecutive_skips: 10,
            diffusion: DiffusionConfig::default(),
        }
    }
}

impl TrainConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = from_json_file(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        check_image_size(self.image_size)?;
        if self.log_every == 0 || self.ckpt_every == 0 {
            return Err(Error::Config("log_every and ckpt_every must be positive".to_string()));
        }
        if self.num_frames == 0 || self.frame_interval == 0 || self.local_batch_size == 0 {
            return Err(Error::Config(
                "num_frames, frame_interval and local_batch_size must be positive".to_string(),
            ));
        }
        if !(0. ..1.).contains(&self.ema_decay) {
            return Err(Error::Config(format!("ema decay {} not in [0, 1)", self.ema_decay)));
        }
        Ok(())
    }

    pub fn latent_size(&self) -> usize {
        self.image_size / VAE_DOWNSAMPLING
    }

    /// Experiment directory name, e.g. `001-EnDora-XL-2-F16S3-col`.
    pub fn experiment_name(&self, index: usize) -> String {
        format!(
            "{index:03}-{}-F{}S{}-{}",
            self.model.replace('/', "-"),
            self.num_frames,
            self.frame_interval,
            self.dataset
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleConfig {
    /// Checkpoint holding the EMA weights, sampling refuses to start without
    /// one.
    pub ckpt: Option<PathBuf>,
    pub backbone: PathBuf,
    pub vae: PathBuf,
    /// Directory of mask videos, one frame directory per clip, named
    /// `00001`, `00002`, ...
    pub mask_path: PathBuf,
    pub save_video_path: PathBuf,
    pub num_frames: usize,
    pub frame_interval: usize,
    pub image_size: usize,
    /// Clips `1..=num_clips` are sampled.
    pub num_clips: usize,
    pub num_classes: i64,
    pub null_label: i64,
    pub cfg_scale: f64,
    pub sample_method: SampleMethod,
    pub eta: f64,
    pub num_sampling_steps: usize,
    pub clip_denoised: bool,
    pub use_fp16: bool,
    pub seed: u64,
    pub mode: Option<AlignmentMode>,
    pub diffusion: DiffusionConfig,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            ckpt: None,
            backbone: PathBuf::from("data/endora_backbone.pt"),
            vae: PathBuf::from("data/vae.pt"),
            mask_path: PathBuf::from("data/mask_video"),
            save_video_path: PathBuf::from("sample_videos"),
            num_frames: 16,
            frame_interval: 3,
            image_size: 128,
            num_clips: 16,
            num_classes: 101,
            null_label: DEFAULT_NULL_LABEL,
            cfg_scale: 1.0,
            sample_method: SampleMethod::Ddpm,
            eta: 0.,
            num_sampling_steps: 250,
            clip_denoised: false,
            use_fp16: false,
            seed: 0,
            mode: None,
            diffusion: DiffusionConfig::default(),
        }
    }
}

impl SampleConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = from_json_file(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        check_image_size(self.image_size)?;
        let steps = self.num_sampling_steps;
        if steps == 0 || steps > self.diffusion.diffusion_steps {
            return Err(Error::Config(format!(
                "cannot sample with {} steps out of {}",
                self.num_sampling_steps, self.diffusion.diffusion_steps
            )));
        }
        if self.cfg_scale > 1. && self.num_classes <= 0 {
            return Err(Error::Config(format!(
                "guidance with scale {} draws labels from {} classes",
                self.cfg_scale, self.num_classes
            )));
        }
        Ok(())
    }

    pub fn latent_size(&self) -> usize {
        self.image_size / VAE_DOWNSAMPLING
    }

    /// The diffusion process respaced to `num_sampling_steps`.
    pub fn sampling_diffusion(&self) -> DiffusionConfig {
        let respacing = match self.sample_method {
            SampleMethod::Ddim => format!("ddim{}", self.num_sampling_steps),
            SampleMethod::Ddpm => self.num_sampling_steps.to_string(),
        };
        DiffusionConfig { timestep_respacing: respacing, ..self.diffusion.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_train_config_uses_defaults() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, r#"{{"dataset": "cvc", "num_frames": 8, "mode": "type1"}}"#)?;
        let config = TrainConfig::from_json_file(file.path())?;
        assert_eq!(config.dataset, "cvc");
        assert_eq!(config.num_frames, 8);
        assert_eq!(config.mode, Some(AlignmentMode::Type1));
        assert_eq!(config.prr_weight, 0.1);
        assert_eq!(config.feature_layers, [2, 5, 8, 11]);
        assert_eq!(config.diffusion.diffusion_steps, 1000);
        assert_eq!(config.experiment_name(1), "001-EnDora-XL-2-F8S3-cvc");
        Ok(())
    }

    #[test]
    fn image_size_must_match_vae() {
        let config = TrainConfig { image_size: 100, ..Default::default() };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        let config = SampleConfig { image_size: 257, ..Default::default() };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn sample_config_respacing() -> anyhow::Result<()> {
        let config: SampleConfig =
            serde_json::from_str(r#"{"sample_method": "ddim", "num_sampling_steps": 50}"#)?;
        config.validate()?;
        assert_eq!(config.sampling_diffusion().timestep_respacing, "ddim50");
        let config = SampleConfig { num_sampling_steps: 2000, ..Default::default() };
        assert!(config.validate().is_err());
        Ok(())
    }

    #[test]
    fn guidance_needs_classes() -> anyhow::Result<()> {
        let config = SampleConfig { cfg_scale: 4., num_classes: 0, ..Default::default() };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        let config = SampleConfig { cfg_scale: 1., ..config };
        config.validate()?;
        let config = SampleConfig { cfg_scale: 4., num_classes: 1, ..config };
        config.validate()?;
        Ok(())
    }

    #[test]
    fn missing_config_file() {
        let res = TrainConfig::from_json_file("/nonexistent/endora.json");
        assert!(matches!(res, Err(Error::Io(_))));
    }
}
