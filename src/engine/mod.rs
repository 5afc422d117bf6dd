//! Diffusion sampling engine.
//!
//! - [`solver`]: noise schedule and multistep latent updates
//! - [`config`]: stage files, geometry and schedule parameters
//! - [`pipeline`]: stage loading and slot wiring
//! - [`generate`]: the per-request [`Context`]

pub mod config;
pub mod generate;
pub mod pipeline;
pub mod solver;

pub use config::{OutputRange, PipelineConfig};
pub use generate::{Context, State};
pub use pipeline::DiffusionPipeline;
pub use solver::DpmSolver;
