//! # Split and Gaussian Priors
//!
//! At every scale but the last, half of the channels are factored out as a
//! latent slice `z_i` whose diagonal Gaussian prior is predicted from the other
//! half by a zero initialized convolution. The top latent gets either a learned
//! per-channel prior or a fixed standard normal one.
use crate::error::{FlowError, Result};
use crate::models::layers::Conv2dNhwc;
use crate::utils::{check_even_channels, dims4};
use tch::{nn, nn::Module, Kind, Tensor};

/// A diagonal Gaussian over a latent slice, with parameters shaped like the slice.
#[derive(Debug)]
pub struct GaussianPrior {
    pub mean: Tensor,
    pub log_scale: Tensor,
}

impl GaussianPrior {
    pub fn standard(shape: &[i64], device: tch::Device) -> Self {
        let mean = Tensor::zeros(shape, (Kind::Float, device));
        let log_scale = Tensor::zeros(shape, (Kind::Float, device));
        Self { mean, log_scale }
    }

    /// Splits a `(..., 2C)` tensor into a `(mean, log_scale)` pair.
    pub fn from_parameters(parameters: &Tensor) -> Result<Self> {
        let c = check_even_channels(parameters)?;
        let mean = parameters.narrow(3, 0, c / 2);
        let log_scale = parameters.narrow(3, c / 2, c / 2);
        Ok(Self { mean, log_scale })
    }

    /// Turns standard normal noise into a draw from this prior with its standard
    /// deviation scaled by `temperature`. The mean is not affected.
    pub fn sample_with_noise(&self, eps: &Tensor, temperature: f64) -> Result<Tensor> {
        if eps.size() != self.mean.size() {
            return Err(FlowError::Shape(format!(
                "noise of shape {:?} for a prior of shape {:?}",
                eps.size(),
                self.mean.size()
            )));
        }
        Ok(&self.mean + self.log_scale.exp() * eps * temperature)
    }

    /// The log-density of `z`, summed over every position, one value per
    /// batch element.
    pub fn log_prob(&self, z: &Tensor) -> Result<Tensor> {
        if z.size() != self.mean.size() {
            return Err(FlowError::Shape(format!(
                "latent of shape {:?} for a prior of shape {:?}",
                z.size(),
                self.mean.size()
            )));
        }
        let log_2pi = (2. * std::f64::consts::PI).ln();
        let log_density: Tensor = -&self.log_scale
            - 0.5 * log_2pi
            - 0.5 * (z - &self.mean).square() / (&self.log_scale * 2.).exp();
        Ok(log_density.sum_dim_intlist(Some([1, 2, 3].as_slice()), false, Kind::Float))
    }
}

/// Factors half of the channels out at an intermediate scale.
#[derive(Debug)]
pub struct Split {
    conv: Conv2dNhwc,
    num_channels: i64,
}

impl Split {
    pub fn new(vs: nn::Path, num_channels: i64) -> Result<Self> {
        if num_channels % 2 != 0 {
            return Err(FlowError::Shape(format!("cannot split {num_channels} channels")));
        }
        let conv = Conv2dNhwc::zeros(&vs / "conv", num_channels / 2, num_channels, 3);
        Ok(Self { conv, num_channels })
    }

    /// The prior of the factored out half, predicted from the remainder.
    pub fn prior(&self, remainder: &Tensor) -> Result<GaussianPrior> {
        let (_, _, _, c) = dims4(remainder)?;
        if 2 * c != self.num_channels {
            return Err(FlowError::Shape(format!(
                "split of {} channels got a remainder with {c} channels",
                self.num_channels
            )));
        }
        GaussianPrior::from_parameters(&self.conv.forward(remainder))
    }

    /// Returns `(z, remainder, prior)`.
    pub fn forward(&self, xs: &Tensor) -> Result<(Tensor, Tensor, GaussianPrior)> {
        let c = check_even_channels(xs)?;
        let z = xs.narrow(3, 0, c / 2);
        let remainder = xs.narrow(3, c / 2, c / 2);
        let prior = self.prior(&remainder)?;
        Ok((z, remainder, prior))
    }

    pub fn inverse(&self, z: &Tensor, remainder: &Tensor) -> Result<Tensor> {
        if z.size() != remainder.size() {
            return Err(FlowError::Shape(format!(
                "cannot merge a latent of shape {:?} with a remainder of shape {:?}",
                z.size(),
                remainder.size()
            )));
        }
        Ok(Tensor::cat(&[z, remainder], 3))
    }
}

/// The prior over the last latent, where there is no remainder to condition on.
#[derive(Debug)]
pub enum TopPrior {
    StandardNormal,
    // The learned transform of a constant input reduces to a bias vector holding
    // the per-channel mean and log-scale.
    Learned(Tensor),
}

impl TopPrior {
    pub fn new(vs: nn::Path, num_channels: i64, learned: bool) -> Self {
        if learned {
            TopPrior::Learned(vs.zeros("bias", &[2 * num_channels]))
        } else {
            TopPrior::StandardNormal
        }
    }

    pub fn prior(&self, shape: &[i64], device: tch::Device) -> Result<GaussianPrior> {
        match self {
            TopPrior::StandardNormal => Ok(GaussianPrior::standard(shape, device)),
            TopPrior::Learned(bias) => {
                let c = shape.last().copied().unwrap_or(0);
                if bias.size() != [2 * c] {
                    return Err(FlowError::Shape(format!(
                        "top prior of size {:?} for a latent of shape {shape:?}",
                        bias.size()
                    )));
                }
                let mean = bias.narrow(0, 0, c).expand(shape, false);
                let log_scale = bias.narrow(0, c, c).expand(shape, false);
                Ok(GaussianPrior { mean, log_scale })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn standard_normal_log_prob() -> Result<()> {
        let prior = GaussianPrior::standard(&[2, 1, 1, 2], Device::Cpu);
        let z = Tensor::from_slice(&[0f32, 0., 1., -2.]).reshape([2, 1, 1, 2]);
        let log_prob = Vec::<f64>::try_from(prior.log_prob(&z)?.to_kind(Kind::Double))?;
        let log_2pi = (2. * std::f64::consts::PI).ln();
        assert!((log_prob[0] + log_2pi).abs() < 1e-5);
        assert!((log_prob[1] + log_2pi + 2.5).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn temperature_scales_the_spread_only() -> Result<()> {
        let mean = Tensor::full([1, 2, 2, 3], 0.5, (Kind::Float, Device::Cpu));
        let log_scale = Tensor::full([1, 2, 2, 3], 0.2f64.ln(), (Kind::Float, Device::Cpu));
        let prior = GaussianPrior { mean: mean.shallow_clone(), log_scale };
        let eps = Tensor::randn([1, 2, 2, 3], (Kind::Float, Device::Cpu));
        assert!(prior.sample_with_noise(&eps, 0.)?.equal(&mean));
        let cold = prior.sample_with_noise(&eps, 0.5)? - &mean;
        let hot = prior.sample_with_noise(&eps, 1.0)? - &mean;
        assert!((hot - cold * 2.).abs().max().double_value(&[]) < 1e-6);
        Ok(())
    }

    #[test]
    fn split_starts_with_standard_prior() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let split = Split::new(vs.root(), 6)?;
        let xs = Tensor::randn([2, 2, 2, 6], (Kind::Float, Device::Cpu));
        let (z, remainder, prior) = split.forward(&xs)?;
        assert_eq!(z.size(), [2, 2, 2, 3]);
        assert!(prior.mean.equal(&z.zeros_like()));
        assert!(prior.log_scale.equal(&z.zeros_like()));
        assert!(split.inverse(&z, &remainder)?.equal(&xs));
        Ok(())
    }

    #[test]
    fn learned_top_prior_broadcasts() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let top = TopPrior::new(vs.root(), 2, true);
        tch::no_grad(|| {
            if let TopPrior::Learned(bias) = &top {
                bias.shallow_clone().copy_(&Tensor::from_slice(&[1f32, -1., 0.1, 0.2]));
            }
        });
        let prior = top.prior(&[3, 2, 2, 2], Device::Cpu)?;
        assert_eq!(prior.mean.size(), [3, 2, 2, 2]);
        assert_eq!(Vec::<f32>::try_from(prior.mean.get(2).get(1).get(0))?, [1., -1.]);
        assert!(matches!(top.prior(&[3, 2, 2, 4], Device::Cpu), Err(FlowError::Shape(_))));
        Ok(())
    }
}
