//! # Likelihoods
//!
//! The change of variables formula gives `log p(x) = log p(z) + logdet`. The
//! objective is reported in bits per dimension, accounting for the
//! dequantization of the inputs to `num_bits` bits.
use crate::error::{FlowError, Result};
use crate::models::glow::FlowOutput;
use crate::models::prior::GaussianPrior;
use crate::utils::{check_finite, dims4};
use tch::{Kind, Tensor};

/// The log-density of a latent hierarchy under its priors, one value per batch
/// element.
pub fn latent_log_prob(latents: &[Tensor], priors: &[GaussianPrior]) -> Result<Tensor> {
    if latents.len() != priors.len() || latents.is_empty() {
        return Err(FlowError::Shape(format!(
            "{} latents for {} priors",
            latents.len(),
            priors.len()
        )));
    }
    let mut log_prob: Option<Tensor> = None;
    for (z, prior) in latents.iter().zip(priors.iter()) {
        let lp = prior.log_prob(z)?;
        log_prob = Some(match log_prob {
            None => lp,
            Some(acc) => acc + lp,
        });
    }
    log_prob.ok_or_else(|| FlowError::Shape("empty latent hierarchy".to_string()))
}

/// The batch averaged terms of the log-likelihood, in bits per dimension.
#[derive(Debug)]
pub struct Objective {
    pub log_px: Tensor,
    pub log_pz: Tensor,
    pub logdet: Tensor,
}

impl Objective {
    /// The loss to minimize, `-log p(x)` in bits per dimension.
    pub fn loss(&self) -> Tensor {
        -&self.log_px
    }

    pub fn bits_per_dim(&self) -> f64 {
        -self.log_px.double_value(&[])
    }
}

/// Computes the objective from the result of a forward pass on images of the
/// given `(height, width, channels)` shape, dequantized to `num_bits` bits.
pub fn objective(
    output: &FlowOutput,
    image_shape: (i64, i64, i64),
    num_bits: u32,
) -> Result<Objective> {
    let (height, width, channels) = image_shape;
    let norm = std::f64::consts::LN_2 * (height * width * channels) as f64;
    let log_pz = latent_log_prob(&output.latents, &output.priors)?.mean(Kind::Float) / norm;
    let logdet = output.logdet.mean(Kind::Float) / norm;
    let log_px = &log_pz + &logdet - num_bits as f64;
    check_finite(&log_px, "objective")?;
    Ok(Objective { log_px, log_pz, logdet })
}

/// Same as [`objective`], reading the image shape from the encoded batch.
pub fn objective_for(xs: &Tensor, output: &FlowOutput, num_bits: u32) -> Result<Objective> {
    let (_, height, width, channels) = dims4(xs)?;
    objective(output, (height, width, channels), num_bits)
}
