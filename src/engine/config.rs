//! Pipeline configuration.
//!
//! Defaults describe Stable Diffusion 1.5: 4 latent channels at 64x64, an
//! 8x decoder, 77 prompt tokens, and the scaled-linear schedule over 1000
//! timesteps. A models directory may carry a `pipeline.json` overriding any
//! subset of fields.
//!
//! # Models Directory
//!
//! Resolved (in priority order) from:
//! 1. an explicit path (`--models-dir`),
//! 2. the `STRATA_DIFFUSION_MODELS_DIR` environment variable,
//! 3. `~/.strata/diffusion/`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DiffusionError;
use crate::tokenizer::DEFAULT_CONTEXT_LEN;

/// Name of the optional override file inside a models directory.
pub const CONFIG_FILE: &str = "pipeline.json";

/// How decoder output values map to pixel bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputRange {
    /// Values in `[0, 1]`: `round(255 * v)`.
    Unit,
    /// Values in `[-1, 1]`: `round(255 * (v / 2 + 0.5))`.
    #[default]
    Signed,
}

impl OutputRange {
    /// Map one decoder value to a byte, clamping to `[0, 255]`.
    pub fn to_byte(&self, v: f32) -> u8 {
        let unit = match self {
            OutputRange::Unit => v,
            OutputRange::Signed => v / 2.0 + 0.5,
        };
        let scaled = (255.0 * unit).round();
        if scaled.is_nan() {
            0
        } else {
            scaled.clamp(0.0, 255.0) as u8
        }
    }
}

/// Stage files, geometry and schedule parameters for one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory holding the stage files and vocabulary. Not serialized.
    #[serde(skip)]
    pub models_dir: PathBuf,

    /// Text encoder stage file.
    pub text_encoder: String,
    /// Timestep-embedding stage file.
    pub time_embedding: String,
    /// Denoiser sub-stage files, in execution order.
    pub denoiser: Vec<String>,
    /// Decoder stage file.
    pub decoder: String,
    /// Tokenizer vocabulary file.
    pub vocabulary: String,

    pub latent_channels: usize,
    /// Latent height and width.
    pub latent_spatial: usize,
    /// Decoder output size relative to the latent.
    pub upscale_factor: usize,

    pub steps: usize,
    pub context_len: usize,
    pub timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,

    /// Multiplier applied to the final latent before decoding.
    pub decoder_latent_scale: f32,
    pub output_range: OutputRange,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::new(),
            text_encoder: "cond_model.bin".to_string(),
            time_embedding: "time_embedding.bin".to_string(),
            denoiser: vec![
                "sd_unet_inputs.bin".to_string(),
                "sd_unet_middle.bin".to_string(),
                "sd_unet_outputs.bin".to_string(),
                "sd_unet_head.bin".to_string(),
            ],
            decoder: "decoder.bin".to_string(),
            vocabulary: "ctokenizer.txt".to_string(),
            latent_channels: 4,
            latent_spatial: 64,
            upscale_factor: 8,
            steps: 20,
            context_len: DEFAULT_CONTEXT_LEN,
            timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            decoder_latent_scale: 1.0 / 0.18215,
            output_range: OutputRange::Signed,
        }
    }
}

impl PipelineConfig {
    /// Load the configuration for `dir`: defaults, overridden by
    /// `dir/pipeline.json` when present.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, DiffusionError> {
        let dir = dir.as_ref();
        let path = dir.join(CONFIG_FILE);
        let mut config = if path.is_file() {
            let json = fs::read_to_string(&path)?;
            let config: Self = serde_json::from_str(&json)?;
            debug!(path = %path.display(), "Loaded pipeline config");
            config
        } else {
            Self::default()
        };
        config.models_dir = dir.to_path_buf();
        Ok(config)
    }

    /// Full path of a file in the models directory.
    pub fn path_of(&self, file: &str) -> PathBuf {
        self.models_dir.join(file)
    }

    /// Elements in one latent tensor.
    pub fn latent_len(&self) -> usize {
        self.latent_channels * self.latent_spatial * self.latent_spatial
    }

    /// Output image height and width in pixels.
    pub fn image_size(&self) -> usize {
        self.latent_spatial * self.upscale_factor
    }

    /// Bytes in one RGB output image.
    pub fn output_len(&self) -> usize {
        3 * self.image_size() * self.image_size()
    }

    /// Reject configurations no pipeline can be built from.
    pub fn validate(&self) -> Result<(), DiffusionError> {
        let mut problems = Vec::new();
        if self.latent_channels == 0 || self.latent_spatial == 0 || self.upscale_factor == 0 {
            problems.push("latent geometry must be non-zero".to_string());
        }
        if self.denoiser.is_empty() {
            problems.push("at least one denoiser stage is required".to_string());
        }
        if self.context_len < 2 {
            problems.push(format!("context_len must be at least 2, got {}", self.context_len));
        }
        if !self.decoder_latent_scale.is_finite() {
            problems.push("decoder_latent_scale must be finite".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(DiffusionError::invalid_argument("config", problems.join("; ")))
        }
    }
}

/// Default models directory.
///
/// Resolution order:
/// 1. `STRATA_DIFFUSION_MODELS_DIR` environment variable
/// 2. `~/.strata/diffusion/`
pub fn default_models_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("STRATA_DIFFUSION_MODELS_DIR") {
        return PathBuf::from(dir);
    }
    match home_dir() {
        Some(home) => home.join(".strata").join("diffusion"),
        None => PathBuf::from(".strata/diffusion"),
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}
