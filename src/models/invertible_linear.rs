//! # Invertible 1x1 Convolution
//!
//! A learned channel mixing `y = W x` applied at every spatial location, with
//! `W` kept in the LU form `W = P L (U + diag(sign * exp(log_magnitude)))`:
//! - `P` a permutation matrix, fixed after initialization,
//! - `L` lower triangular with a unit diagonal,
//! - `U` strictly upper triangular.
//!
//! The log-determinant is then `H * W * sum(log_magnitude)` and the inverse only
//! needs two triangular solves, both directions reading the same factors.
//!
//! Glow: Generative Flow with Invertible 1x1 Convolutions, D. P. Kingma et al, 2018.
//! https://arxiv.org/abs/1807.03039
use crate::error::{FlowError, Result};
use crate::utils::{dims4, per_example, randn};
use rand::Rng;
use tch::{nn, Kind, Tensor};

#[derive(Debug)]
pub struct InvertibleLinear {
    permutation: Tensor,
    lower: Tensor,
    upper: Tensor,
    sign: Tensor,
    log_magnitude: Tensor,
    num_channels: i64,
}

impl InvertibleLinear {
    /// Creates the layer from a random rotation decomposed once in LU form.
    pub fn new<R: Rng + ?Sized>(vs: nn::Path, num_channels: i64, rng: &mut R) -> Result<Self> {
        let c = num_channels;
        let device = vs.device();
        let (p, l, u) = tch::no_grad(|| -> Result<_> {
            let gaussian = randn(&[c, c], device, rng);
            let (rotation, _) = Tensor::f_linalg_qr(&gaussian, "reduced")?;
            Ok(Tensor::f_linalg_lu(&rotation, true)?)
        })?;
        let diagonal = u.diagonal(0, 0, 1);

        let permutation = vs.zeros_no_train("permutation", &[c, c]);
        let lower = vs.zeros("lower", &[c, c]);
        let upper = vs.zeros("upper", &[c, c]);
        let sign = vs.zeros_no_train("sign", &[c]);
        let log_magnitude = vs.zeros("log_magnitude", &[c]);
        tch::no_grad(|| -> Result<()> {
            permutation.shallow_clone().f_copy_(&p)?;
            lower.shallow_clone().f_copy_(&l.tril(-1))?;
            upper.shallow_clone().f_copy_(&u.triu(1))?;
            sign.shallow_clone().f_copy_(&diagonal.sign())?;
            log_magnitude.shallow_clone().f_copy_(&diagonal.abs().log())?;
            Ok(())
        })?;
        Ok(Self { permutation, lower, upper, sign, log_magnitude, num_channels })
    }

    fn check_log_magnitude(&self) -> Result<()> {
        if crate::utils::is_finite(&self.log_magnitude) {
            Ok(())
        } else {
            Err(FlowError::SingularMatrix("invertible linear layer".to_string()))
        }
    }

    fn check_channels(&self, xs: &Tensor) -> Result<(i64, i64, i64)> {
        let (n, h, w, c) = dims4(xs)?;
        if c != self.num_channels {
            return Err(FlowError::Shape(format!(
                "invertible linear layer expects {} channels, got {c}",
                self.num_channels
            )));
        }
        Ok((n, h, w))
    }

    // The masks keep the factors triangular whatever the optimizer did to the
    // entries outside of them.
    fn lower_factor(&self) -> Tensor {
        let eye = Tensor::eye(self.num_channels, (Kind::Float, self.lower.device()));
        self.lower.tril(-1) + eye
    }

    fn upper_factor(&self) -> Tensor {
        let diagonal = &self.sign * self.log_magnitude.exp();
        self.upper.triu(1) + diagonal.diag_embed(0, -2, -1)
    }

    /// The dense matrix `W`, only used for the forward product.
    pub fn weight(&self) -> Tensor {
        self.permutation.matmul(&self.lower_factor()).matmul(&self.upper_factor())
    }

    /// `log |det W|`, the contribution of a single spatial location.
    pub fn log_abs_det(&self) -> Tensor {
        self.log_magnitude.sum(Kind::Float)
    }

    pub fn forward(&self, xs: &Tensor) -> Result<(Tensor, Tensor)> {
        let (n, h, w) = self.check_channels(xs)?;
        self.check_log_magnitude()?;
        // Row vectors over the channel axis: y^T = x^T W^T.
        let ys = xs.matmul(&self.weight().transpose(0, 1));
        let logdet = per_example(&(self.log_abs_det() * (h * w) as f64), n);
        Ok((ys, logdet))
    }

    /// Solves `W x = y` with `x = U^-1 L^-1 P^T y`.
    pub fn inverse(&self, ys: &Tensor) -> Result<Tensor> {
        let (n, h, w) = self.check_channels(ys)?;
        self.check_log_magnitude()?;
        let c = self.num_channels;
        // Columns are the per-pixel channel vectors.
        let columns = ys.reshape([-1, c]).matmul(&self.permutation).transpose(0, 1);
        let columns = self.lower_factor().f_linalg_solve_triangular(&columns, false, true, true)?;
        let columns = self.upper_factor().f_linalg_solve_triangular(&columns, true, true, false)?;
        Ok(columns.transpose(0, 1).reshape([n, h, w, c]))
    }
}
