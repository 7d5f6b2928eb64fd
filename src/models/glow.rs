//! # Glow
//!
//! The multi-scale flow: at each of the `L` scales the input is squeezed, goes
//! through `K` flow steps, then half of its channels are factored out as a
//! latent slice. The last scale keeps all of its channels as the top latent.
//! The inverse pass runs the mirror sequence with the same parameters, either
//! from a full list of latents (exact reconstruction) or from the top latent
//! only, drawing the lower slices from their priors.
//!
//! Glow: Generative Flow with Invertible 1x1 Convolutions, D. P. Kingma et al, 2018.
//! https://arxiv.org/abs/1807.03039
use crate::error::{FlowError, Result};
use crate::models::flow_step::FlowStep;
use crate::models::prior::{GaussianPrior, Split, TopPrior};
use crate::models::squeeze::{squeeze, unsqueeze};
use crate::utils::{check_finite, dims4, randn};
use rand::{Rng, RngCore};
use tch::{nn, Device, Kind, Tensor};

#[derive(Debug, Clone, Copy)]
pub struct GlowConfig {
    /// Number of flow steps per scale, `K`.
    pub num_steps: usize,
    /// Number of scales, `L`.
    pub num_scales: usize,
    /// Number of hidden channels in the coupling sub-networks.
    pub nn_width: i64,
    /// Learn the prior of the top latent rather than using a standard normal.
    pub learn_top_prior: bool,
}

impl Default for GlowConfig {
    fn default() -> Self {
        Self { num_steps: 32, num_scales: 3, nn_width: 512, learn_top_prior: true }
    }
}

#[derive(Debug)]
struct GlowScale {
    steps: Vec<FlowStep>,
    // None for the last scale.
    split: Option<Split>,
}

/// Everything produced by the forward (encoding) pass.
#[derive(Debug)]
pub struct FlowOutput {
    /// The tensor left at the end of the last scale, equal to the top latent.
    pub output: Tensor,
    /// One latent slice per scale, from the finest to the coarsest.
    pub latents: Vec<Tensor>,
    /// The accumulated log-determinant, one value per batch element.
    pub logdet: Tensor,
    /// The prior of each latent slice.
    pub priors: Vec<GaussianPrior>,
}

/// Where the inverse pass takes the latent slices of the lower scales from.
pub enum LowerLatents<'a> {
    /// The latents returned by a forward pass, for exact reconstruction.
    Given(&'a [Tensor]),
    /// Standard normal noise, one tensor per scale, turned into samples from
    /// the priors.
    Noise(&'a [Tensor]),
    /// Noise drawn from this generator.
    Draw(&'a mut dyn RngCore),
}

#[derive(Debug)]
pub struct Glow {
    scales: Vec<GlowScale>,
    top_prior: TopPrior,
    // (height, width, channels) of the images.
    image_shape: (i64, i64, i64),
    pub config: GlowConfig,
}

impl Glow {
    /// Creates the parameters for images of the given `(height, width, channels)`
    /// shape. The ActNorm layers are left uninitialized, see [`Glow::init`].
    pub fn new<R: Rng + ?Sized>(
        vs: nn::Path,
        image_shape: (i64, i64, i64),
        config: GlowConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let (height, width, channels) = image_shape;
        if config.num_scales == 0 {
            return Err(FlowError::Shape("glow needs at least one scale".to_string()));
        }
        let factor = u32::try_from(config.num_scales).ok().and_then(|n| 2i64.checked_pow(n));
        let divisible = |factor: i64| height % factor == 0 && width % factor == 0;
        if !factor.map_or(false, divisible) {
            return Err(FlowError::Shape(format!(
                "image size {height}x{width} is not divisible by 2^{}",
                config.num_scales
            )));
        }
        let vs = &vs / "flow";
        let mut scales = Vec::with_capacity(config.num_scales);
        let mut num_channels = channels;
        for index in 0..config.num_scales {
            num_channels *= 4;
            let vs_scale = &vs / format!("scale_{index}");
            let steps = (0..config.num_steps)
                .map(|k| {
                    let vs_step = &vs_scale / format!("step_{k}");
                    FlowStep::new(vs_step, num_channels, config.nn_width, &mut *rng)
                })
                .collect::<Result<Vec<_>>>()?;
            let split = if index + 1 < config.num_scales {
                let split = Split::new(&vs_scale / "split", num_channels)?;
                num_channels /= 2;
                Some(split)
            } else {
                None
            };
            scales.push(GlowScale { steps, split });
        }
        let top_prior = TopPrior::new(&vs / "top_prior", num_channels, config.learn_top_prior);
        Ok(Self { scales, top_prior, image_shape, config })
    }

    /// Creates the parameters with shapes inferred from `example` and runs a
    /// first forward pass on it, which sets the ActNorm layers from its
    /// statistics.
    pub fn init<R: Rng + ?Sized>(
        vs: nn::Path,
        example: &Tensor,
        config: GlowConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let (_, height, width, channels) = dims4(example)?;
        let glow = Self::new(vs, (height, width, channels), config, rng)?;
        tch::no_grad(|| glow.forward(example))?;
        tracing::info!(
            num_scales = config.num_scales,
            num_steps = config.num_steps,
            latent_shapes = ?glow.latent_shapes(1),
            "initialized glow model"
        );
        Ok(glow)
    }

    pub fn image_shape(&self) -> (i64, i64, i64) {
        self.image_shape
    }

    /// The shapes of the latent slices for a batch of `batch_size` images.
    pub fn latent_shapes(&self, batch_size: i64) -> Vec<[i64; 4]> {
        let (mut height, mut width, mut channels) = self.image_shape;
        let mut shapes = Vec::with_capacity(self.scales.len());
        for scale in self.scales.iter() {
            height /= 2;
            width /= 2;
            channels *= 4;
            if scale.split.is_some() {
                channels /= 2;
            }
            shapes.push([batch_size, height, width, channels]);
        }
        shapes
    }

    /// The prior over the top latent for a batch of `batch_size` images.
    pub fn top_prior(&self, batch_size: i64, device: Device) -> Result<GaussianPrior> {
        let shapes = self.latent_shapes(batch_size);
        let top = shapes.last().ok_or_else(|| FlowError::Shape("no scales".to_string()))?;
        self.top_prior.prior(top, device)
    }

    /// Encodes a batch of images.
    pub fn forward(&self, xs: &Tensor) -> Result<FlowOutput> {
        let (n, height, width, channels) = dims4(xs)?;
        if (height, width, channels) != self.image_shape {
            return Err(FlowError::Shape(format!(
                "glow built for {:?} images got {:?}",
                self.image_shape,
                xs.size()
            )));
        }
        let mut logdet = Tensor::zeros([n], (Kind::Float, xs.device()));
        let mut latents = Vec::with_capacity(self.scales.len());
        let mut priors = Vec::with_capacity(self.scales.len());
        let mut xs = xs.shallow_clone();
        for scale in self.scales.iter() {
            xs = squeeze(&xs)?;
            for step in scale.steps.iter() {
                let (ys, step_logdet) = step.forward(&xs)?;
                xs = ys;
                logdet = logdet + step_logdet;
            }
            match &scale.split {
                Some(split) => {
                    let (z, remainder, prior) = split.forward(&xs)?;
                    latents.push(z);
                    priors.push(prior);
                    xs = remainder;
                }
                None => {
                    priors.push(self.top_prior.prior(&xs.size(), xs.device())?);
                    latents.push(xs.shallow_clone());
                }
            }
        }
        check_finite(&logdet, "log-determinant")?;
        for (index, z) in latents.iter().enumerate() {
            check_finite(z, &format!("latent {index}"))?;
        }
        Ok(FlowOutput { output: xs, latents, logdet, priors })
    }

    /// Decodes from the top latent `z_top`. The lower latent slices come from
    /// `lower`, sampled ones use a standard deviation scaled by `temperature`.
    pub fn inverse(
        &self,
        z_top: &Tensor,
        mut lower: LowerLatents<'_>,
        temperature: f64,
    ) -> Result<Tensor> {
        let (n, _, _, _) = dims4(z_top)?;
        let shapes = self.latent_shapes(n);
        if let Some(top) = shapes.last() {
            if z_top.size() != top {
                return Err(FlowError::Shape(format!(
                    "expected a top latent of shape {top:?}, got {:?}",
                    z_top.size()
                )));
            }
        }
        // The latent lists may or may not include the top latent.
        let num_lower = self.scales.len() - 1;
        match &lower {
            LowerLatents::Given(zs) | LowerLatents::Noise(zs)
                if zs.len() != num_lower && zs.len() != num_lower + 1 =>
            {
                return Err(FlowError::Shape(format!(
                    "expected {num_lower} lower latents, got {}",
                    zs.len()
                )));
            }
            _ => {}
        }

        let mut xs = z_top.shallow_clone();
        for (index, scale) in self.scales.iter().enumerate().rev() {
            if let Some(split) = &scale.split {
                let z = match &mut lower {
                    LowerLatents::Given(zs) => zs[index].shallow_clone(),
                    LowerLatents::Noise(eps) => {
                        split.prior(&xs)?.sample_with_noise(&eps[index], temperature)?
                    }
                    LowerLatents::Draw(rng) => {
                        let eps = randn(&xs.size(), xs.device(), &mut **rng);
                        split.prior(&xs)?.sample_with_noise(&eps, temperature)?
                    }
                };
                xs = split.inverse(&z, &xs)?;
            }
            for step in scale.steps.iter().rev() {
                xs = step.inverse(&xs)?;
            }
            xs = unsqueeze(&xs)?;
        }
        check_finite(&xs, "decoded images")?;
        Ok(xs)
    }

    /// Draws `batch_size` images, every latent slice being sampled from its
    /// prior at the given temperature.
    pub fn sample(
        &self,
        batch_size: i64,
        temperature: f64,
        device: Device,
        rng: &mut dyn RngCore,
    ) -> Result<Tensor> {
        let top_prior = self.top_prior(batch_size, device)?;
        let eps = randn(&top_prior.mean.size(), device, &mut *rng);
        let z_top = top_prior.sample_with_noise(&eps, temperature)?;
        self.inverse(&z_top, LowerLatents::Draw(rng), temperature)
    }

    /// Same as [`Glow::sample`] with pre-drawn standard normal noise, one tensor
    /// per scale shaped as returned by [`Glow::latent_shapes`].
    pub fn sample_with_noise(&self, eps: &[Tensor], temperature: f64) -> Result<Tensor> {
        let eps_top = eps.last().ok_or_else(|| FlowError::Shape("empty noise list".to_string()))?;
        let (n, _, _, _) = dims4(eps_top)?;
        let top_prior = self.top_prior(n, eps_top.device())?;
        let z_top = top_prior.sample_with_noise(eps_top, temperature)?;
        self.inverse(&z_top, LowerLatents::Noise(eps), temperature)
    }
}
