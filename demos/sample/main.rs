// Generates videos with a trained EnDora checkpoint, each clip being
// conditioned on a mask video.
//
//   cargo run --release --example sample --features clap,tracing-subscriber -- \
//     --config configs/col/col_sample.json \
//     --ckpt results/001-EnDora-XL-2-F16S3-col/checkpoints/0100000.pt
use anyhow::Context;
use clap::Parser;
use endora::config::SampleConfig;
use endora::diffusion::sampling::SampleMethod;
use endora::models::scripted::{ScriptedBackbone, ScriptedCodec};
use endora::pipelines::{load_ema_weights, sampling_checkpoint, VideoSampler};
use endora::utils::DeviceSetup;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use tch::nn;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON sampling config, every field not set keeps its default value.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// The checkpoint holding the EMA weights.
    #[arg(long, value_name = "FILE")]
    ckpt: Option<PathBuf>,

    /// The networks to run on the CPU rather than on the GPU, `all` for
    /// every one of them.
    #[arg(long)]
    cpu: Vec<String>,

    /// Use DDIM rather than the ancestral sampler.
    #[arg(long)]
    ddim: bool,

    /// The number of steps to run the diffusion for.
    #[arg(long)]
    n_steps: Option<usize>,

    #[arg(long)]
    cfg_scale: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();
    tch::maybe_init_cuda();

    let mut config = match &args.config {
        Some(path) => SampleConfig::from_json_file(path)
            .with_context(|| format!("cannot read the config {path:?}"))?,
        None => SampleConfig::default(),
    };
    if args.ckpt.is_some() {
        config.ckpt = args.ckpt;
    }
    if args.ddim {
        config.sample_method = SampleMethod::Ddim;
    }
    if let Some(n_steps) = args.n_steps {
        config.num_sampling_steps = n_steps;
    }
    if let Some(cfg_scale) = args.cfg_scale {
        config.cfg_scale = cfg_scale;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    config.validate()?;

    let checkpoint = sampling_checkpoint(&config).context("sampling needs a trained checkpoint")?;

    let devices = DeviceSetup::new(args.cpu);
    let device = devices.get("backbone");
    let mut vs = nn::VarStore::new(device);
    let mut backbone = ScriptedBackbone::load(&config.backbone, vs.root())?;
    let report = load_ema_weights(&config, &checkpoint, &mut vs);
    info!("Loaded {} EMA tensors, ignored {}", report.loaded, report.ignored);
    backbone.set_eval();
    let codec = ScriptedCodec::load(&config.vae, devices.get("vae"))?;
    let codec = if config.use_fp16 { codec.half() } else { codec };

    tch::manual_seed(config.seed as i64);
    let mut rng = StdRng::seed_from_u64(config.seed);
    let sampler = VideoSampler::new(&config, &backbone, &codec, device)?;
    let start = std::time::Instant::now();
    let outputs = sampler.run(&mut rng)?;
    info!("Sampled {} clips in {:.2}s", outputs.len(), start.elapsed().as_secs_f64());
    Ok(())
}
