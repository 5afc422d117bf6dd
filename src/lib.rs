pub mod error;
pub mod tensor;
pub mod graph;
pub mod backend;
pub mod tokenizer;
pub mod engine;
pub mod cli;

pub use error::{DiffusionError, ErrorCode};
pub use engine::{Context, PipelineConfig};
pub use backend::select_backend;
