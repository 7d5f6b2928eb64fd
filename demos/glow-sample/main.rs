// Samples images from a Glow model.
//
// Weights saved by `GlowPipeline::save` can be passed with `--weights`. When no
// weights are given, a fresh model is initialized on a random batch, which
// is mostly useful to check that everything runs end to end:
//
//   cargo run --release --example glow-sample --features clap,tracing-subscriber -- --cpu
//
// Set RUST_LOG=glow=debug to follow the ActNorm initialization.
use clap::Parser;
use glow::pipelines::{GlowPipeline, GlowPipelineConfig};
use glow::preprocessing::{dequantize, postprocess};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use tch::{Device, Kind, Tensor};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Weights saved from a trained pipeline.
    #[arg(long, value_name = "FILE")]
    weights: Option<String>,

    /// Use the small model rather than the 64x64 CelebA one.
    #[arg(long)]
    tiny: bool,

    /// When set, use the CPU even if some CUDA devices are available.
    #[arg(long)]
    cpu: bool,

    /// The number of images to sample.
    #[arg(long, default_value_t = 4)]
    num_samples: i64,

    /// Overrides the sampling temperature of the configuration.
    #[arg(long)]
    temperature: Option<f64>,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// The name of the generated image, samples are laid out side by side.
    #[arg(long, value_name = "FILE", default_value = "glow-samples.png")]
    output: String,
}

fn build_pipeline(
    config: &GlowPipelineConfig,
    weights: Option<&str>,
    device: Device,
    rng: &mut dyn RngCore,
) -> anyhow::Result<GlowPipeline> {
    match weights {
        Some(weights) => config.build_from_weights(weights, device),
        None => {
            let (height, width, channels) = config.image_shape();
            tch::manual_seed(config.seed as i64);
            let pixels = Tensor::randint(256, [16, height, width, channels], (Kind::Uint8, device));
            let example = dequantize(&pixels, config.num_bits, Some(rng));
            let pipeline = config.build(&example, device)?;
            let (_, objective) = tch::no_grad(|| pipeline.objective(&example))?;
            tracing::info!(bits_per_dim = objective.bits_per_dim(), "untrained model");
            Ok(pipeline)
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    tch::maybe_init_cuda();
    let device = if args.cpu { Device::Cpu } else { Device::cuda_if_available() };
    tracing::info!(?device, "running glow");

    let mut config =
        if args.tiny { GlowPipelineConfig::tiny() } else { GlowPipelineConfig::celeba_64() };
    if let Some(temperature) = args.temperature {
        config.sampling_temperature = temperature;
    }
    let mut rng = StdRng::seed_from_u64(args.seed);
    let pipeline = build_pipeline(&config, args.weights.as_deref(), device, &mut rng)?;

    let samples = pipeline.sample(args.num_samples, &mut rng)?;
    let (n, height, width, channels) = samples.size4()?;
    let image = postprocess(&samples, config.num_bits)
        .permute([3, 1, 0, 2])
        .reshape([channels, height, n * width])
        .to_device(Device::Cpu);
    tch::vision::image::save(&image, &args.output)?;
    tracing::info!(output = %args.output, temperature = config.sampling_temperature, "saved samples");
    Ok(())
}
