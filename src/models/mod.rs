//! # Models
//!
//! The invertible transforms and the multi-scale flow composing them.

pub mod actnorm;
pub mod coupling;
pub mod flow_step;
pub mod glow;
pub mod invertible_linear;
pub mod layers;
pub mod prior;
pub mod squeeze;
