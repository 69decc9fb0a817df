//! # Training
//!
//! One training step encodes a batch of clips to latents, extracts the
//! frozen ViT features used by the alignment term, draws a timestep per clip
//! and backpropagates the diffusion loss. An exponential moving average of
//! the weights is kept alongside and periodically checkpointed.
use crate::config::TrainConfig;
use crate::diffusion::GaussianDiffusion;
use crate::error::{Error, Result};
use crate::models::vae::encode_video;
use crate::models::{Conditioning, DenoisingModel, FeatureExtractor, LatentCodec};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tch::nn::{self, OptimizerConfig};
use tch::Tensor;
use tracing::{info, warn};

pub mod checkpoint;
pub mod distributed;
pub mod ema;

pub use distributed::{ProcessGroup, SingleProcess};
pub use ema::Ema;

/// Patch size of the ViT feature extractor, frames are cropped to a
/// multiple of it.
pub const PATCH_SIZE: i64 = 8;

/// A batch of clips shaped `(batch, frame, 3, h, w)` in `[-1, 1]`.
#[derive(Debug)]
pub struct VideoBatch {
    pub video: Tensor,
    /// Mask clips, shaped like `video`, encoded as the reference latent.
    pub mask: Option<Tensor>,
    pub labels: Option<Tensor>,
}

/// A source of training batches, organized in epochs.
pub trait VideoLoader {
    /// Number of complete batches this worker sees per epoch.
    fn batches_per_epoch(&self) -> usize;

    /// Reshuffles the data for `epoch`.
    fn set_epoch(&mut self, epoch: usize);

    fn batch(&mut self, index: usize) -> Result<VideoBatch>;
}

/// Runs the feature extractor on every frame of `video` and drops the class
/// token of each returned activation.
pub fn prepare_features<F: FeatureExtractor + ?Sized>(
    extractor: &F,
    video: &Tensor,
    layers: &[i64],
) -> Result<Vec<Tensor>> {
    let frames = video.flatten(0, 1);
    let (_, _, height, width) = frames.size4()?;
    let frames = frames
        .narrow(2, 0, height - height % PATCH_SIZE)
        .narrow(3, 0, width - width % PATCH_SIZE);
    let features = tch::no_grad(|| extractor.extract_layers(&frames, layers))?;
    features
        .into_iter()
        .map(|feature| {
            let size = feature.size();
            if size.len() != 3 || size[1] < 2 {
                return Err(Error::shape("extracted features", &[-1, -1, -1], &size));
            }
            Ok(feature.narrow(1, 1, size[1] - 1))
        })
        .collect()
}

/// Computes the global norm of the gradients of the trainable variables and,
/// when `clip` is set, rescales them so that the norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(vs: &nn::VarStore, max_norm: f64, clip: bool) -> f64 {
    let _no_grad_guard = tch::no_grad_guard();
    let grads: Vec<Tensor> =
        vs.trainable_variables().iter().map(Tensor::grad).filter(Tensor::defined).collect();
    let total_norm = grads
        .iter()
        .map(|g| g.norm().double_value(&[]).powi(2))
        .sum::<f64>()
        .sqrt();
    let clip_coef = max_norm / (total_norm + 1e-6);
    if clip && clip_coef < 1. {
        for mut grad in grads {
            let clipped = &grad * clip_coef;
            grad.copy_(&clipped);
        }
    }
    total_norm
}

/// Stops the gradients of every variable whose name contains none of
/// `trainable`. Returns the number of variables left trainable.
pub fn freeze_except(vs: &nn::VarStore, trainable: &[String]) -> usize {
    let mut kept = 0;
    for (name, var) in vs.variables() {
        if trainable.iter().any(|module| name.contains(module.as_str())) {
            info!("Only training {name}");
            kept += 1;
        } else {
            let _ = var.set_requires_grad(false);
        }
    }
    kept
}

/// Creates `<results>/<NNN-model-FxSy-dataset>/checkpoints`, the index being
/// one more than the number of existing experiments, and stores the config
/// next to it. Returns the checkpoint directory on the main worker, `None`
/// elsewhere as only the main worker touches the results directory.
pub fn create_experiment_dir(
    config: &TrainConfig,
    group: &dyn ProcessGroup,
) -> Result<Option<PathBuf>> {
    if !group.is_main() {
        return Ok(None);
    }
    std::fs::create_dir_all(&config.results_dir)?;
    let index = std::fs::read_dir(&config.results_dir)?.count() + 1;
    let experiment_dir = config.results_dir.join(config.experiment_name(index));
    let checkpoint_dir = experiment_dir.join("checkpoints");
    std::fs::create_dir_all(&checkpoint_dir)?;
    let file = std::fs::File::create(experiment_dir.join("config.json"))?;
    serde_json::to_writer_pretty(file, config)?;
    info!("Experiment directory created at {experiment_dir:?}");
    Ok(Some(checkpoint_dir))
}

/// The scalar values of a training step, for logging.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    pub loss: f64,
    pub mse: f64,
    pub vb: f64,
    pub prr: Option<f64>,
    pub grad_norm: f64,
}

/// Counters carried across steps.
#[derive(Debug)]
pub struct TrainingSession {
    /// Optimizer steps taken so far, resumed ones included.
    pub train_steps: usize,
    pub epoch: usize,
    pub skipped_steps: usize,
    pub consecutive_skips: usize,
    running_loss: f64,
    log_steps: usize,
    log_start: Instant,
}

impl TrainingSession {
    pub fn new(train_steps: usize) -> Self {
        Self {
            train_steps,
            epoch: 0,
            skipped_steps: 0,
            consecutive_skips: 0,
            running_loss: 0.,
            log_steps: 0,
            log_start: Instant::now(),
        }
    }

    fn record(&mut self, loss: f64) {
        self.running_loss += loss;
        self.log_steps += 1;
        self.train_steps += 1;
        self.consecutive_skips = 0;
    }

    /// Average loss and steps per second since the last call.
    fn take_log_window(&mut self) -> (f64, f64) {
        let elapsed = self.log_start.elapsed().as_secs_f64();
        let steps = self.log_steps.max(1) as f64;
        let window = (self.running_loss / steps, self.log_steps as f64 / elapsed.max(1e-9));
        self.running_loss = 0.;
        self.log_steps = 0;
        self.log_start = Instant::now();
        window
    }
}

/// Ties the diffusion process, the networks and the optimizer together.
pub struct Trainer<'a> {
    config: TrainConfig,
    diffusion: GaussianDiffusion,
    model: &'a dyn DenoisingModel,
    vs: &'a nn::VarStore,
    codec: &'a dyn LatentCodec,
    feature_extractor: Option<&'a dyn FeatureExtractor>,
    group: &'a dyn ProcessGroup,
    optimizer: nn::Optimizer,
    ema: Ema,
    checkpoint_dir: Option<PathBuf>,
}

impl<'a> Trainer<'a> {
    /// `model` must read its parameters from `vs`.
    pub fn new(
        config: TrainConfig,
        diffusion: GaussianDiffusion,
        model: &'a dyn DenoisingModel,
        vs: &'a nn::VarStore,
        codec: &'a dyn LatentCodec,
        feature_extractor: Option<&'a dyn FeatureExtractor>,
        group: &'a dyn ProcessGroup,
    ) -> Result<Self> {
        config.validate()?;
        if let Some(pretrained) = &config.pretrained {
            let checkpoint = checkpoint::Checkpoint::load(pretrained)?;
            let report = checkpoint::load_intersection(vs, &checkpoint.ema);
            if report.loaded == 0 {
                return Err(Error::Config(format!(
                    "no tensor of {pretrained:?} matches a model parameter"
                )));
            }
            info!("Successfully loaded model at {pretrained:?}");
        }
        if config.fixed_spatial {
            let kept = freeze_except(vs, &config.trainable_modules);
            warn!("Only training {kept} variables matching {:?}", config.trainable_modules);
        }
        group.broadcast_parameters(vs)?;
        let num_params: usize = vs.trainable_variables().iter().map(Tensor::numel).sum();
        info!("Model parameters: {num_params}");

        let mut adamw = nn::AdamW::default();
        adamw.wd = config.weight_decay;
        let optimizer = adamw.build(vs, config.learning_rate)?;
        let ema = Ema::new(vs, config.ema_decay);
        Ok(Self {
            config,
            diffusion,
            model,
            vs,
            codec,
            feature_extractor,
            group,
            optimizer,
            ema,
            checkpoint_dir: None,
        })
    }

    /// Writes a checkpoint every `ckpt_every` steps to `dir`.
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    pub fn ema(&self) -> &Ema {
        &self.ema
    }

    pub fn diffusion(&self) -> &GaussianDiffusion {
        &self.diffusion
    }

    /// Loads the EMA weights of a checkpoint into both the live model and
    /// the average, and returns a session starting at the checkpoint step.
    pub fn resume<P: AsRef<Path>>(&mut self, path: P) -> Result<TrainingSession> {
        let checkpoint = checkpoint::Checkpoint::load(path.as_ref())?;
        let train_steps = match self.config.resume_step.or_else(|| checkpoint.resume_step()) {
            Some(train_steps) => train_steps,
            None => {
                return Err(Error::Config(format!(
                    "cannot tell the step of {:?}, set resume_step",
                    path.as_ref()
                )))
            }
        };
        checkpoint::load_intersection(self.vs, &checkpoint.ema);
        self.ema.load(&checkpoint.ema);
        info!("Resuming from {:?} at step {train_steps}", path.as_ref());
        Ok(TrainingSession::new(train_steps))
    }

    fn conditioning(&self, batch: &VideoBatch) -> Result<Conditioning> {
        let device = self.vs.device();
        let features = match (self.config.mode, self.feature_extractor) {
            (Some(_), Some(extractor)) => Some(prepare_features(
                extractor,
                &batch.video.to_device(device),
                &self.config.feature_layers,
            )?),
            _ => None,
        };
        let reference_latent = match &batch.mask {
            Some(mask) => {
                Some(tch::no_grad(|| encode_video(self.codec, &mask.to_device(device)))?)
            }
            None => None,
        };
        Ok(Conditioning {
            labels: batch.labels.as_ref().map(|l| l.to_device(device)),
            reference_latent,
            features,
            feature_layers: self.config.feature_layers.clone(),
            mode: self.config.mode,
            ..Default::default()
        })
    }

    /// Runs one optimizer step. Returns `None` when the loss was not finite
    /// and the step was skipped.
    pub fn train_step(
        &mut self,
        session: &mut TrainingSession,
        batch: &VideoBatch,
    ) -> Result<Option<StepReport>> {
        let device = self.vs.device();
        let cond = self.conditioning(batch)?;
        let x_start = tch::no_grad(|| encode_video(self.codec, &batch.video.to_device(device)))?;
        let t = self.diffusion.sample_timesteps(x_start.size()[0], device);
        let losses = self.diffusion.training_losses(self.model, &x_start, &t, &cond, None)?;
        let total = losses.total(self.config.prr_weight);
        let loss = total.double_value(&[]);

        self.optimizer.zero_grad();
        if !loss.is_finite() {
            session.skipped_steps += 1;
            session.consecutive_skips += 1;
            warn!(
                step = session.train_steps,
                skipped = session.consecutive_skips,
                "skipping step with non-finite loss {loss}"
            );
            if session.consecutive_skips >= self.config.max_consecutive_skips {
                return Err(Error::NonFiniteLoss {
                    step: session.train_steps,
                    skipped: session.consecutive_skips,
                });
            }
            return Ok(None);
        }

        total.backward();
        self.group.average_gradients(self.vs)?;
        let clip = session.train_steps >= self.config.start_clip_iter;
        let grad_norm = clip_grad_norm(self.vs, self.config.clip_max_norm, clip);
        self.optimizer.step();
        self.ema.update(self.vs);
        session.record(loss);

        Ok(Some(StepReport {
            loss,
            mse: losses.mse.mean(tch::Kind::Float).double_value(&[]),
            vb: losses.vb.mean(tch::Kind::Float).double_value(&[]),
            prr: losses.prr.as_ref().map(|p| p.double_value(&[])),
            grad_norm,
        }))
    }

    fn save_checkpoint(&self, train_steps: usize) -> Result<()> {
        if let (true, Some(dir)) = (self.group.is_main(), &self.checkpoint_dir) {
            let path = checkpoint::checkpoint_path(dir, train_steps);
            checkpoint::save(&path, self.ema.tensors(), train_steps)?;
            info!("Saved checkpoint to {path:?}");
        }
        self.group.barrier()
    }

    /// Trains until `max_train_steps` optimizer steps have been taken,
    /// logging every `log_every` steps and checkpointing every `ckpt_every`.
    pub fn fit<L: VideoLoader + ?Sized>(
        &mut self,
        loader: &mut L,
        session: &mut TrainingSession,
    ) -> Result<()> {
        let batches_per_epoch = loader.batches_per_epoch();
        if batches_per_epoch == 0 {
            return Err(Error::Config("not enough videos for a single batch".to_string()));
        }
        let first_epoch = session.train_steps / batches_per_epoch;
        info!(
            first_epoch,
            batches_per_epoch,
            max_train_steps = self.config.max_train_steps,
            "Training"
        );
        let mut epoch = first_epoch;
        while session.train_steps < self.config.max_train_steps {
            session.epoch = epoch;
            loader.set_epoch(epoch);
            for index in 0..batches_per_epoch {
                if session.train_steps >= self.config.max_train_steps {
                    break;
                }
                let batch = loader.batch(index)?;
                let Some(report) = self.train_step(session, &batch)? else {
                    continue;
                };
                let train_steps = session.train_steps;
                if train_steps % self.config.log_every == 0 {
                    let (avg_loss, steps_per_sec) = session.take_log_window();
                    let avg_loss = self.group.all_reduce_mean(avg_loss)?;
                    info!(
                        "(step={train_steps:07}/epoch={epoch:04}) Total L: {avg_loss:.4}, \
                         MSE L: {:.4}, VB L: {:.4}, PRR L: {:.4}, Gradient Norm: {:.4}, \
                         Train Steps/Sec: {steps_per_sec:.2}",
                        report.mse,
                        report.vb,
                        report.prr.unwrap_or(f64::NAN),
                        report.grad_norm,
                    );
                }
                if train_steps % self.config.ckpt_every == 0 {
                    self.save_checkpoint(train_steps)?;
                }
            }
            epoch += 1;
        }
        info!(skipped_steps = session.skipped_steps, "Done!");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diffusion::{create_diffusion, DiffusionConfig, CHANNEL_DIM};
    use crate::models::{AlignmentMode, DiagonalGaussianDistribution, ModelOutput};
    use tch::{Device, Kind};

    /// Keeps the first 4 channels of a 4x downsampled frame as the latent.
    struct StrideCodec;

    impl LatentCodec for StrideCodec {
        fn encode(&self, xs: &Tensor) -> Result<DiagonalGaussianDistribution> {
            let pooled = xs.slice(2, 0, None, 4).slice(3, 0, None, 4);
            let mean = Tensor::cat(&[&pooled, &pooled.narrow(1, 0, 1)], 1);
            DiagonalGaussianDistribution::new(&Tensor::cat(&[&mean, &mean.full_like(-30.)], 1))
        }

        fn decode(&self, xs: &Tensor) -> Result<Tensor> {
            Ok(xs.narrow(1, 0, 3))
        }
    }

    /// Returns 3 layers of 1 + 4 tokens of width 6.
    struct TokenExtractor;

    impl FeatureExtractor for TokenExtractor {
        fn extract_layers(&self, images: &Tensor, layers: &[i64]) -> Result<Vec<Tensor>> {
            assert_eq!(images.size()[2] % PATCH_SIZE, 0);
            assert_eq!(images.size()[3] % PATCH_SIZE, 0);
            let n = images.size()[0];
            let layer = || Tensor::randn([n, 5, 6], (Kind::Float, Device::Cpu));
            Ok(layers.iter().map(|_| layer()).collect())
        }
    }

    struct RandomLoader {
        batches: usize,
        epochs_seen: Vec<usize>,
    }

    impl VideoLoader for RandomLoader {
        fn batches_per_epoch(&self) -> usize {
            self.batches
        }

        fn set_epoch(&mut self, epoch: usize) {
            self.epochs_seen.push(epoch);
        }

        fn batch(&mut self, _index: usize) -> Result<VideoBatch> {
            let video = Tensor::rand([2, 2, 3, 16, 16], (Kind::Float, Device::Cpu)) * 2. - 1.;
            Ok(VideoBatch { video, mask: None, labels: None })
        }
    }

    fn test_config(dir: &Path) -> TrainConfig {
        TrainConfig {
            results_dir: dir.to_path_buf(),
            image_size: 16,
            num_frames: 2,
            max_train_steps: 5,
            log_every: 2,
            ckpt_every: 2,
            mode: None,
            ..Default::default()
        }
    }

    struct SecondWorker;

    impl ProcessGroup for SecondWorker {
        fn rank(&self) -> usize {
            1
        }

        fn world_size(&self) -> usize {
            2
        }

        fn all_reduce_mean(&self, value: f64) -> Result<f64> {
            Ok(value)
        }

        fn average_gradients(&self, _vs: &nn::VarStore) -> Result<()> {
            Ok(())
        }

        fn broadcast_parameters(&self, _vs: &nn::VarStore) -> Result<()> {
            Ok(())
        }

        fn barrier(&self) -> Result<()> {
            Ok(())
        }
    }

    fn scaled_backbone(
        vs: &nn::VarStore,
    ) -> impl Fn(&Tensor, &Tensor, &Conditioning) -> Result<ModelOutput> {
        let w = vs.root().var("blocks_0_attn_temp_weight", &[1], nn::Init::Const(0.5));
        let b = vs.root().var("blocks_0_mlp_bias", &[1], nn::Init::Const(0.));
        move |xs: &Tensor, _: &Tensor, _: &Conditioning| -> Result<ModelOutput> {
            let eps = xs * &w + &b;
            Ok(Tensor::cat(&[&eps, &eps.zeros_like()], CHANNEL_DIM).into())
        }
    }

    #[test]
    fn features_drop_class_token() -> Result<()> {
        let video = Tensor::zeros([1, 2, 3, 18, 20], (Kind::Float, Device::Cpu));
        let features = prepare_features(&TokenExtractor, &video, &[2, 5, 8])?;
        assert_eq!(features.len(), 3);
        assert_eq!(features[0].size(), [2, 4, 6]);
        Ok(())
    }

    #[test]
    fn grad_norm_is_clipped() {
        let vs = nn::VarStore::new(Device::Cpu);
        let w = vs.root().var("w", &[2], nn::Init::Const(0.));
        (&w * Tensor::from_slice(&[3f32, 4.])).sum(Kind::Float).backward();
        let norm = clip_grad_norm(&vs, 1.0, false);
        assert!((norm - 5.).abs() < 1e-5);
        let norm = clip_grad_norm(&vs, 1.0, true);
        assert!((norm - 5.).abs() < 1e-5);
        let clipped = w.grad().norm().double_value(&[]);
        assert!((clipped - 1.).abs() < 1e-4, "{clipped}");
    }

    #[test]
    fn freezing_keeps_temporal_attention() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _model = scaled_backbone(&vs);
        assert_eq!(freeze_except(&vs, &["attn_temp".to_string()]), 1);
        let vars = vs.variables();
        assert!(vars["blocks_0_attn_temp_weight"].requires_grad());
        assert!(!vars["blocks_0_mlp_bias"].requires_grad());
    }

    #[test]
    fn fit_runs_exactly_max_steps_and_checkpoints() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = test_config(dir.path());
        let checkpoint_dir = create_experiment_dir(&config, &SingleProcess)?.expect("main worker");
        assert!(checkpoint_dir.ends_with("001-EnDora-XL-2-F2S3-col/checkpoints"));

        let vs = nn::VarStore::new(Device::Cpu);
        let model = scaled_backbone(&vs);
        let diffusion = create_diffusion(&DiffusionConfig::default())?;
        let group = SingleProcess;
        let mut trainer =
            Trainer::new(config, diffusion, &model, &vs, &StrideCodec, None, &group)?
                .with_checkpoint_dir(&checkpoint_dir);
        let mut loader = RandomLoader { batches: 2, epochs_seen: vec![] };
        let mut session = TrainingSession::new(0);
        trainer.fit(&mut loader, &mut session)?;

        assert_eq!(session.train_steps, 5);
        assert_eq!(loader.epochs_seen, [0, 1, 2]);
        assert!(checkpoint_dir.join("0000002.pt").is_file());
        assert!(checkpoint_dir.join("0000004.pt").is_file());
        assert!(!checkpoint_dir.join("0000005.pt").exists());

        let checkpoint = checkpoint::Checkpoint::load(checkpoint_dir.join("0000004.pt"))?;
        assert_eq!(checkpoint.train_steps, Some(4));
        assert!(checkpoint.ema.contains_key("blocks_0_attn_temp_weight"));
        Ok(())
    }

    #[test]
    fn resume_continues_from_checkpoint_step() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("0000003.pt");
        let mut ema = std::collections::BTreeMap::new();
        ema.insert("blocks_0_attn_temp_weight".to_string(), Tensor::from_slice(&[2f32]));
        checkpoint::save(&path, &ema, 3)?;

        let vs = nn::VarStore::new(Device::Cpu);
        let model = scaled_backbone(&vs);
        let diffusion = create_diffusion(&DiffusionConfig::with_respacing("100"))?;
        let group = SingleProcess;
        let mut trainer = Trainer::new(
            test_config(dir.path()),
            diffusion,
            &model,
            &vs,
            &StrideCodec,
            None,
            &group,
        )?;
        let mut session = trainer.resume(&path)?;
        assert_eq!(session.train_steps, 3);
        assert_eq!(vs.variables()["blocks_0_attn_temp_weight"].double_value(&[0]), 2.);
        assert_eq!(trainer.ema().tensors()["blocks_0_attn_temp_weight"].double_value(&[0]), 2.);

        let mut loader = RandomLoader { batches: 2, epochs_seen: vec![] };
        trainer.fit(&mut loader, &mut session)?;
        assert_eq!(session.train_steps, 5);
        assert_eq!(loader.epochs_seen, [1]);
        Ok(())
    }

    #[test]
    fn only_the_main_worker_creates_the_experiment() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = test_config(&dir.path().join("results"));
        assert_eq!(create_experiment_dir(&config, &SecondWorker)?, None);
        assert!(!config.results_dir.exists());
        Ok(())
    }

    #[test]
    fn pretrained_plain_parameters_are_loaded() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pretrained.pt");
        let named = vec![
            ("blocks_0_mlp_bias".to_string(), Tensor::from_slice(&[0.25f32])),
            ("pos_embed".to_string(), Tensor::zeros([1, 4], (Kind::Float, Device::Cpu))),
        ];
        Tensor::save_multi(named.as_slice(), &path)?;
        let config = TrainConfig { pretrained: Some(path), ..test_config(dir.path()) };
        let vs = nn::VarStore::new(Device::Cpu);
        let model = scaled_backbone(&vs);
        let diffusion = create_diffusion(&DiffusionConfig::default())?;
        let trainer =
            Trainer::new(config, diffusion, &model, &vs, &StrideCodec, None, &SingleProcess)?;
        assert_eq!(vs.variables()["blocks_0_mlp_bias"].double_value(&[0]), 0.25);
        assert_eq!(trainer.ema().tensors()["blocks_0_mlp_bias"].double_value(&[0]), 0.25);
        Ok(())
    }

    #[test]
    fn pretrained_without_matching_parameters_fails() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("other.pt");
        let weight = Tensor::ones([3], (Kind::Float, Device::Cpu));
        let named = vec![("unet_conv_in_weight".to_string(), weight)];
        Tensor::save_multi(named.as_slice(), &path)?;
        let config = TrainConfig { pretrained: Some(path), ..test_config(dir.path()) };
        let vs = nn::VarStore::new(Device::Cpu);
        let model = scaled_backbone(&vs);
        let diffusion = create_diffusion(&DiffusionConfig::default())?;
        let res = Trainer::new(config, diffusion, &model, &vs, &StrideCodec, None, &SingleProcess);
        assert!(matches!(res, Err(Error::Config(_))));
        Ok(())
    }

    #[test]
    fn alignment_term_flows_through_a_step() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = TrainConfig { mode: Some(AlignmentMode::Type0), ..test_config(dir.path()) };
        let vs = nn::VarStore::new(Device::Cpu);
        let w = vs.root().var("proj", &[1], nn::Init::Const(1.));
        let model = move |xs: &Tensor, _: &Tensor, cond: &Conditioning| -> Result<ModelOutput> {
            let n = xs.size()[0] * xs.size()[1];
            let aligned = cond
                .feature_layers
                .iter()
                .map(|_| Tensor::ones([n, 4, 6], (Kind::Float, Device::Cpu)) * &w)
                .collect();
            let prediction = Tensor::cat(&[xs * &w, xs.zeros_like()], CHANNEL_DIM);
            Ok(ModelOutput { prediction, aligned_features: Some(aligned) })
        };
        let group = SingleProcess;
        let mut trainer = Trainer::new(
            config,
            create_diffusion(&DiffusionConfig::default())?,
            &model,
            &vs,
            &StrideCodec,
            Some(&TokenExtractor),
            &group,
        )?;
        let mut session = TrainingSession::new(0);
        let batch = RandomLoader { batches: 1, epochs_seen: vec![] }.batch(0)?;
        let report = trainer.train_step(&mut session, &batch)?.expect("finite loss");
        let prr = report.prr.expect("alignment term");
        assert!((0. ..=2.).contains(&prr));
        assert_eq!(session.train_steps, 1);
        Ok(())
    }

    #[test]
    fn non_finite_losses_are_skipped_then_abort() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = TrainConfig { max_consecutive_skips: 3, ..test_config(dir.path()) };
        let vs = nn::VarStore::new(Device::Cpu);
        let w = vs.root().var("w", &[1], nn::Init::Const(1.));
        let model = move |xs: &Tensor, _: &Tensor, _: &Conditioning| -> Result<ModelOutput> {
            let eps = xs * &w * f64::NAN;
            Ok(Tensor::cat(&[&eps, &eps], CHANNEL_DIM).into())
        };
        let group = SingleProcess;
        let mut trainer = Trainer::new(
            config,
            create_diffusion(&DiffusionConfig::default())?,
            &model,
            &vs,
            &StrideCodec,
            None,
            &group,
        )?;
        let before = trainer.ema().tensors()["w"].double_value(&[0]);
        let mut session = TrainingSession::new(0);
        let mut loader = RandomLoader { batches: 4, epochs_seen: vec![] };
        let batch = loader.batch(0)?;
        assert!(trainer.train_step(&mut session, &batch)?.is_none());
        assert_eq!(session.skipped_steps, 1);
        assert_eq!(session.train_steps, 0);
        assert_eq!(trainer.ema().tensors()["w"].double_value(&[0]), before);

        let res = trainer.fit(&mut loader, &mut session);
        assert!(matches!(res, Err(Error::NonFiniteLoss { step: 0, skipped: 3 })));
        Ok(())
    }
}
