use crate::error::Result;
use crate::likelihood::{self, Objective};
use crate::models::glow::{FlowOutput, Glow, GlowConfig, LowerLatents};
use crate::utils::{dims4, file_open};
use rand::{RngCore, SeedableRng};
use tch::{nn, Device, Kind, Tensor};

#[derive(Clone, Debug)]
pub struct GlowPipelineConfig {
    pub image_size: i64,
    pub num_channels: i64,
    /// Number of bits the images are quantized to.
    pub num_bits: u32,
    pub sampling_temperature: f64,
    /// Seed for the random rotations initializing the 1x1 convolutions.
    pub seed: u64,
    pub glow: GlowConfig,
}

impl GlowPipelineConfig {
    /// 64x64 CelebA faces on a single GPU, with shallower flows than the paper.
    pub fn celeba_64() -> Self {
        let glow = GlowConfig { num_steps: 16, num_scales: 3, nn_width: 512, learn_top_prior: true };
        Self {
            image_size: 64,
            num_channels: 3,
            num_bits: 5,
            sampling_temperature: 0.7,
            seed: 0,
            glow,
        }
    }

    /// A small model, fast enough to run on the CPU.
    pub fn tiny() -> Self {
        let glow = GlowConfig { num_steps: 2, num_scales: 2, nn_width: 16, learn_top_prior: true };
        Self {
            image_size: 16,
            num_channels: 3,
            num_bits: 5,
            sampling_temperature: 0.7,
            seed: 0,
            glow,
        }
    }

    pub fn image_shape(&self) -> (i64, i64, i64) {
        (self.image_size, self.image_size, self.num_channels)
    }

    /// The shapes of the latent slices for a batch: the spatial size is halved
    /// and the channel count doubled at every scale, the top scale keeps twice
    /// as many channels since nothing is split off.
    pub fn latent_shapes(&self, batch_size: i64) -> Vec<[i64; 4]> {
        let num_scales = self.glow.num_scales;
        (0..num_scales)
            .map(|i| {
                let size = self.image_size >> (i + 1);
                let channels = self.num_channels << (i + 1);
                let channels = if i + 1 == num_scales { 2 * channels } else { channels };
                [batch_size, size, size, channels]
            })
            .collect()
    }

    /// Builds a fresh model, initializing the ActNorm layers from `example`.
    pub fn build(&self, example: &Tensor, device: Device) -> anyhow::Result<GlowPipeline> {
        let (_, height, width, channels) = dims4(example)?;
        anyhow::ensure!(
            (height, width, channels) == self.image_shape(),
            "example of shape {:?} for a {}x{}x{} model",
            example.size(),
            self.image_size,
            self.image_size,
            self.num_channels
        );
        let vs = nn::VarStore::new(device);
        let mut rng = rand::rngs::StdRng::seed_from_u64(self.seed);
        let model = Glow::init(vs.root(), &example.to_device(device), self.glow, &mut rng)?;
        Ok(GlowPipeline { vs, model, config: self.clone() })
    }

    /// Builds a model and restores its weights, including the ActNorm
    /// initialization state.
    pub fn build_from_weights(&self, weights: &str, device: Device) -> anyhow::Result<GlowPipeline> {
        file_open(weights)?;
        let mut vs = nn::VarStore::new(device);
        let mut rng = rand::rngs::StdRng::seed_from_u64(self.seed);
        let model = Glow::new(vs.root(), self.image_shape(), self.glow, &mut rng)?;
        vs.load(weights)?;
        tracing::info!(weights, "loaded glow weights");
        Ok(GlowPipeline { vs, model, config: self.clone() })
    }
}

pub struct GlowPipeline {
    pub vs: nn::VarStore,
    pub model: Glow,
    pub config: GlowPipelineConfig,
}

impl GlowPipeline {
    pub fn device(&self) -> Device {
        self.vs.device()
    }

    pub fn encode(&self, xs: &Tensor) -> Result<FlowOutput> {
        self.model.forward(xs)
    }

    /// Encodes a batch and evaluates the objective on it.
    pub fn objective(&self, xs: &Tensor) -> Result<(FlowOutput, Objective)> {
        let output = self.model.forward(xs)?;
        let objective =
            likelihood::objective(&output, self.model.image_shape(), self.config.num_bits)?;
        Ok((output, objective))
    }

    /// Draws images at the configured sampling temperature.
    pub fn sample(&self, batch_size: i64, rng: &mut dyn RngCore) -> Result<Tensor> {
        let temperature = self.config.sampling_temperature;
        tch::no_grad(|| self.model.sample(batch_size, temperature, self.device(), rng))
    }

    /// Encodes then decodes a batch, keeping every latent slice.
    pub fn reconstruct(&self, xs: &Tensor) -> Result<Tensor> {
        tch::no_grad(|| {
            let output = self.model.forward(xs)?;
            self.model.inverse(&output.output, LowerLatents::Given(&output.latents), 1.)
        })
    }

    /// Decodes `num_points` images along the straight line between the latent
    /// hierarchies of `first` and `second`, two single image batches. The
    /// first point decodes `first` and the last one decodes `second`.
    pub fn interpolate(&self, first: &Tensor, second: &Tensor, num_points: i64) -> Result<Tensor> {
        tch::no_grad(|| {
            let pair = Tensor::cat(&[first, second], 0);
            let output = self.model.forward(&pair)?;
            let ts = Tensor::linspace(0., 1., num_points, (Kind::Float, pair.device()))
                .reshape([num_points, 1, 1, 1]);
            let latents: Vec<Tensor> = output
                .latents
                .iter()
                .map(|z| {
                    let start = z.narrow(0, 0, 1);
                    let end = z.narrow(0, 1, 1);
                    &start + &ts * (end - &start)
                })
                .collect();
            let z_top = &latents[latents.len() - 1];
            self.model.inverse(z_top, LowerLatents::Given(&latents), 1.)
        })
    }

    pub fn save(&self, path: &str) -> anyhow::Result<()> {
        self.vs.save(path)?;
        Ok(())
    }
}
