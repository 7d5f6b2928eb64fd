//! # Pipelines
//!
//! Preset model configurations and the helpers built on top of a model:
//! sampling, reconstruction, interpolation and weights persistence.

pub mod glow;

pub use self::glow::{GlowPipeline, GlowPipelineConfig};
