// Trains the EnDora backbone on a directory of videos stored as frames.
//
// The backbone, the VAE and the DINO feature extractor are TorchScript
// exports, see the `backbone`, `vae` and `feature_extractor` fields of the
// config. The backbone `forward` takes `(x, t, y, y_image, mode)`, the VAE
// exposes `encode` and `decode`, the feature extractor
// `get_special_layers(images, layers)`.
//
//   cargo run --release --example train --features clap,tracing-subscriber -- \
//     --config configs/col/col_train.json
use anyhow::Context;
use clap::Parser;
use endora::config::TrainConfig;
use endora::diffusion::create_diffusion;
use endora::models::scripted::{ScriptedBackbone, ScriptedCodec, ScriptedFeatureExtractor};
use endora::models::FeatureExtractor;
use endora::train::checkpoint::latest_checkpoint;
use endora::train::{
    create_experiment_dir, ProcessGroup, SingleProcess, Trainer, TrainingSession,
};
use endora::utils::DeviceSetup;
use endora::video::{ClipSampling, FrameFolderDataset, FrameFolderLoader};
use std::path::PathBuf;
use tch::nn;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON training config, every field not set keeps its default value.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// The networks to run on the CPU rather than on the GPU, `all` for
    /// every one of them.
    #[arg(long)]
    cpu: Vec<String>,

    /// Resume from this checkpoint, or from the latest one in this
    /// directory.
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Overrides the number of optimizer steps.
    #[arg(long)]
    max_train_steps: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();
    tch::maybe_init_cuda();
    info!("Cuda available: {}", tch::Cuda::is_available());

    let mut config = match &args.config {
        Some(path) => TrainConfig::from_json_file(path)
            .with_context(|| format!("cannot read the config {path:?}"))?,
        None => TrainConfig::default(),
    };
    if let Some(max_train_steps) = args.max_train_steps {
        config.max_train_steps = max_train_steps;
    }
    if let Some(resume) = args.resume {
        config.resume_from_checkpoint = Some(resume);
    }
    config.validate()?;
    let group = SingleProcess;
    tch::manual_seed(group.worker_seed(config.global_seed) as i64);

    let devices = DeviceSetup::new(args.cpu);
    let device = devices.get("backbone");
    let vs = nn::VarStore::new(device);
    let mut backbone = ScriptedBackbone::load(&config.backbone, vs.root())
        .with_context(|| format!("cannot load the backbone {:?}", config.backbone))?;
    backbone.set_train();
    let codec = ScriptedCodec::load(&config.vae, devices.get("vae"))?;
    let feature_extractor = match config.mode {
        Some(_) => Some(ScriptedFeatureExtractor::load(
            &config.feature_extractor,
            devices.get("feature_extractor"),
        )?),
        None => None,
    };

    let sampling = ClipSampling {
        num_frames: config.num_frames,
        frame_interval: config.frame_interval,
        image_size: config.image_size,
    };
    let dataset = FrameFolderDataset::new(&config.data_path, config.mask_path.clone(), sampling)?;
    info!("Dataset contains {} videos ({:?})", dataset.len(), config.data_path);
    let mut loader = FrameFolderLoader::new(
        dataset,
        config.local_batch_size,
        config.global_seed,
        group.rank(),
        group.world_size(),
    );

    let checkpoint_dir = create_experiment_dir(&config, &group)?;
    let resume = match config.resume_from_checkpoint.clone() {
        Some(path) if path.is_dir() => Some(
            latest_checkpoint(&path)?
                .ok_or_else(|| anyhow::anyhow!("no checkpoint found in {path:?}"))?,
        ),
        other => other,
    };
    let diffusion = create_diffusion(&config.diffusion)?;
    let mut trainer = Trainer::new(
        config,
        diffusion,
        &backbone,
        &vs,
        &codec,
        feature_extractor.as_ref().map(|f| f as &dyn FeatureExtractor),
        &group,
    )?;
    if let Some(checkpoint_dir) = checkpoint_dir {
        trainer = trainer.with_checkpoint_dir(checkpoint_dir);
    }
    let mut session = match resume {
        Some(path) => trainer.resume(path)?,
        None => TrainingSession::new(0),
    };
    trainer.fit(&mut loader, &mut session)?;
    Ok(())
}
