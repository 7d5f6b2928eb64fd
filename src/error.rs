//! # Errors
//!
//! All the failures that the flow transforms can detect. They are raised
//! synchronously by the call that observes them and never recovered from
//! inside the crate.

/// The error type returned by the invertible transforms and the model.
#[derive(thiserror::Error, Debug)]
pub enum FlowError {
    /// Dimension mismatch, odd spatial size, odd channel count.
    #[error("shape error: {0}")]
    Shape(String),

    /// A channel had a zero standard deviation when initializing an ActNorm layer.
    #[error("degenerate input: channel {channel} has zero variance in the initialization batch")]
    DegenerateInput { channel: usize },

    /// Some log-magnitude of an invertible linear transform is not finite.
    #[error("singular matrix: non-finite log-magnitude in {0}")]
    SingularMatrix(String),

    /// A non-finite log-determinant, latent or output was produced.
    #[error("numerical divergence: non-finite values in {0}")]
    NumericalDivergence(String),

    #[error(transparent)]
    Torch(#[from] tch::TchError),
}

pub type Result<T> = std::result::Result<T, FlowError>;
