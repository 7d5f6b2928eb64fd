//! # Glow normalizing flows
//!
//! This is a Rust implementation of the Glow multi-scale normalizing flow using
//! Torch via [tch-rs](https://github.com/LaurentMazare/tch-rs).
//!
//! Every transform is exactly invertible and reports the log-determinant of its
//! Jacobian, so the model gives exact log-likelihoods and reconstructs its
//! inputs up to floating point errors.
//!
//! This library includes:
//! - The flow transforms: squeeze, ActNorm, invertible 1x1 convolutions and
//!   affine couplings.
//! - The multi-scale model with learned Gaussian priors on the factored out
//!   latents, in both the encoding and the sampling direction.
//! - Log-likelihood evaluation in bits per dimension.
//!
//! Training loops, datasets and image decoding are left to the caller, the
//! parameters live in a `tch::nn::VarStore` so any tch optimizer can be used.

pub mod error;
pub mod likelihood;
pub mod models;
pub mod pipelines;
pub mod preprocessing;
pub mod utils;

pub use error::{FlowError, Result};
