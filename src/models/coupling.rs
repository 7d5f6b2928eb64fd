//! # Affine Coupling
//!
//! The input channels are split in two halves `(x_a, x_b)`. A sub-network
//! reading `x_b` produces `(log_sigma, mu)` and the first half is transformed
//! as `y_a = exp(log_sigma) * x_a + mu` while `x_b` is passed through, which
//! makes the inverse available by re-running the sub-network on `x_b`.
use crate::error::{FlowError, Result};
use crate::models::layers::CouplingNetwork;
use crate::utils::check_even_channels;
use tch::{nn, nn::Module, Kind, Tensor};

#[derive(Debug)]
pub struct AffineCoupling {
    network: CouplingNetwork,
    num_channels: i64,
}

impl AffineCoupling {
    pub fn new(vs: nn::Path, num_channels: i64, nn_width: i64) -> Result<Self> {
        if num_channels % 2 != 0 {
            return Err(FlowError::Shape(format!(
                "affine coupling needs an even channel count, got {num_channels}"
            )));
        }
        let half = num_channels / 2;
        let network = CouplingNetwork::new(&vs / "nn", half, 2 * half, nn_width);
        Ok(Self { network, num_channels })
    }

    fn split(&self, xs: &Tensor) -> Result<(Tensor, Tensor)> {
        let c = check_even_channels(xs)?;
        if c != self.num_channels {
            return Err(FlowError::Shape(format!(
                "affine coupling expects {} channels, got {c}",
                self.num_channels
            )));
        }
        Ok((xs.narrow(3, 0, c / 2), xs.narrow(3, c / 2, c / 2)))
    }

    /// Evaluates the sub-network on the pass-through half, returning
    /// `(log_sigma, mu)`.
    fn scale_and_shift(&self, xs_b: &Tensor) -> (Tensor, Tensor) {
        let out = self.network.forward(xs_b);
        let half = self.num_channels / 2;
        (out.narrow(3, 0, half), out.narrow(3, half, half))
    }

    pub fn forward(&self, xs: &Tensor) -> Result<(Tensor, Tensor)> {
        let (xs_a, xs_b) = self.split(xs)?;
        let (log_sigma, mu) = self.scale_and_shift(&xs_b);
        let ys_a = log_sigma.exp() * xs_a + mu;
        let logdet = log_sigma.sum_dim_intlist(Some([1, 2, 3].as_slice()), false, Kind::Float);
        Ok((Tensor::cat(&[ys_a, xs_b], 3), logdet))
    }

    pub fn inverse(&self, ys: &Tensor) -> Result<Tensor> {
        let (ys_a, xs_b) = self.split(ys)?;
        let (log_sigma, mu) = self.scale_and_shift(&xs_b);
        let xs_a = (ys_a - mu) * (-log_sigma).exp();
        Ok(Tensor::cat(&[xs_a, xs_b], 3))
    }
}
