//! Generation context: prompt → RGB pixels.
//!
//! [`Context`] owns one [`DiffusionPipeline`] and drives it per request:
//! conditioning, the guided denoising loop and decoding. Errors are recorded
//! in the context's [`ErrorTable`]; a failure inside a request leaves the
//! context unusable for generation but still queryable.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use tracing::{debug, error, info};

use crate::backend::{GraphBackend, PerformanceMode};
use crate::error::{DiffusionError, ErrorCode, ErrorTable};

use super::config::PipelineConfig;
use super::pipeline::DiffusionPipeline;
use super::solver::SUPPORTED_STEPS;

/// Where a context is in its current (or last) request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Conditioning,
    Sampling { step: usize },
    Decoding,
    Done,
    /// Absorbing: no further generation on this context.
    Failed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Idle => write!(f, "idle"),
            State::Conditioning => write!(f, "conditioning"),
            State::Sampling { step } => write!(f, "sampling (step {})", step),
            State::Decoding => write!(f, "decoding"),
            State::Done => write!(f, "done"),
            State::Failed => write!(f, "failed"),
        }
    }
}

/// Requests burst performance for its lifetime.
struct BurstGuard {
    backend: Arc<dyn GraphBackend>,
}

impl BurstGuard {
    fn new(backend: Arc<dyn GraphBackend>) -> Self {
        backend.set_performance_mode(PerformanceMode::Burst);
        debug!(backend = backend.name(), "Burst mode on");
        Self { backend }
    }
}

impl Drop for BurstGuard {
    fn drop(&mut self) {
        self.backend.set_performance_mode(PerformanceMode::Normal);
        debug!(backend = self.backend.name(), "Burst mode off");
    }
}

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}

/// A text-to-image generation context.
pub struct Context {
    config: PipelineConfig,
    backend: Arc<dyn GraphBackend>,
    pipeline: Option<DiffusionPipeline>,
    state: State,
    errors: ErrorTable,
    rng: StdRng,
    latent: Vec<f32>,
    noise: Vec<f32>,
}

impl Context {
    /// Create an uninitialized context. Nothing is loaded until
    /// [`initialize`](Self::initialize).
    pub fn new(config: PipelineConfig, backend: Arc<dyn GraphBackend>) -> Self {
        let latent_len = config.latent_len();
        Self {
            config,
            backend,
            pipeline: None,
            state: State::Idle,
            errors: ErrorTable::new(),
            rng: StdRng::from_entropy(),
            latent: vec![0.0; latent_len],
            noise: vec![0.0; latent_len],
        }
    }

    /// Create and initialize a context in one call.
    pub fn setup(config: PipelineConfig, backend: Arc<dyn GraphBackend>) -> Result<Self, DiffusionError> {
        let mut ctx = Self::new(config, backend);
        ctx.initialize()?;
        Ok(ctx)
    }

    /// Load and wire every stage, then prepare the configured step count.
    ///
    /// On failure the context is marked failed; the error stays available
    /// through [`last_error`](Self::last_error).
    pub fn initialize(&mut self) -> Result<(), DiffusionError> {
        if self.state == State::Failed {
            return Err(self.invalid_context("initialize"));
        }
        if self.pipeline.is_some() {
            return Ok(());
        }
        let start = Instant::now();
        info!(
            models_dir = %self.config.models_dir.display(),
            backend = self.backend.name(),
            "Initializing diffusion context"
        );
        let result = DiffusionPipeline::load(&self.config, Arc::clone(&self.backend)).and_then(|mut p| {
            p.prepare_schedule(self.config.steps)?;
            Ok(p)
        });
        match result {
            Ok(pipeline) => {
                self.pipeline = Some(pipeline);
                info!(elapsed_ms = elapsed_ms(start), "Context initialized");
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Rebuild the schedule and time embeddings for `steps` steps.
    ///
    /// An unsupported step count is rejected without touching the current
    /// schedule.
    pub fn prepare_schedule(&mut self, steps: usize) -> Result<(), DiffusionError> {
        if steps != SUPPORTED_STEPS {
            let err = DiffusionError::invalid_argument(
                "prepare_schedule",
                format!("unsupported step count: {} (only {} is supported)", steps, SUPPORTED_STEPS),
            );
            self.errors.record(&err);
            return Err(err);
        }
        self.ensure_usable("prepare_schedule")?;
        let result = match self.pipeline.as_mut() {
            Some(p) => p.prepare_schedule(steps),
            None => return Err(self.invalid_context("prepare_schedule")),
        };
        match result {
            Ok(()) => {
                self.config.steps = steps;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Alias of [`prepare_schedule`](Self::prepare_schedule).
    pub fn set_steps(&mut self, steps: usize) -> Result<(), DiffusionError> {
        self.prepare_schedule(steps)
    }

    /// Reseed the latent-noise generator.
    pub fn set_seed(&mut self, seed: u64) {
        debug!(seed, "Seeding latent noise");
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Tokenize `text` with the loaded vocabulary.
    pub fn tokenize(&mut self, text: &str) -> Result<Vec<u32>, DiffusionError> {
        let result = match self.pipeline.as_ref() {
            Some(p) => p.tokenize(text),
            None => return Err(self.invalid_context("tokenize")),
        };
        result.map_err(|e| {
            self.errors.record(&e);
            e
        })
    }

    /// Generate one image into a new buffer of [`output_len`](Self::output_len) bytes.
    pub fn generate(&mut self, prompt: &str, guidance: f32) -> Result<Vec<u8>, DiffusionError> {
        let mut out = vec![0u8; self.output_len()];
        self.generate_into(prompt, guidance, &mut out)?;
        Ok(out)
    }

    /// Generate one image into `out`. Returns the number of bytes written.
    pub fn generate_into(&mut self, prompt: &str, guidance: f32, out: &mut [u8]) -> Result<usize, DiffusionError> {
        self.ensure_usable("generate")?;
        let needed = self.output_len();
        if out.len() < needed {
            let err = DiffusionError::invalid_argument(
                "generate",
                format!("Provided buffer is too small, missing {} bytes", needed - out.len()),
            );
            self.errors.record(&err);
            return Err(err);
        }
        if !guidance.is_finite() {
            let err = DiffusionError::invalid_argument("generate", format!("guidance must be finite, got {}", guidance));
            self.errors.record(&err);
            return Err(err);
        }

        let _burst = BurstGuard::new(Arc::clone(&self.backend));
        match self.run(prompt, guidance, out) {
            Ok(n) => {
                self.state = State::Done;
                Ok(n)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn run(&mut self, prompt: &str, guidance: f32, out: &mut [u8]) -> Result<usize, DiffusionError> {
        let pipeline = self
            .pipeline
            .as_mut()
            .ok_or_else(|| DiffusionError::invalid_context("generate", "context is not initialized"))?;
        let steps = pipeline
            .steps()
            .ok_or_else(|| DiffusionError::internal("generate", "no schedule prepared"))?;
        let start = Instant::now();
        info!(steps, guidance, "Generating image");

        self.state = State::Conditioning;
        let tick = Instant::now();
        pipeline.condition(prompt)?;
        info!(stage = "Conditioning", elapsed_ms = elapsed_ms(tick), "Stage finished");

        for v in self.latent.iter_mut() {
            *v = self.rng.sample(StandardNormal);
        }
        pipeline.solver_mut().reset();

        for step in 0..steps {
            self.state = State::Sampling { step };
            let tick = Instant::now();
            pipeline.denoise(step, &self.latent, guidance, &mut self.noise)?;
            pipeline.solver_mut().update(step, &mut self.latent, &mut self.noise)?;
            debug!(step, elapsed_ms = elapsed_ms(tick), "Iteration finished");
        }

        self.state = State::Decoding;
        let tick = Instant::now();
        let written = pipeline.decode(&self.latent, out)?;
        info!(stage = "Decoding", elapsed_ms = elapsed_ms(tick), "Stage finished");
        info!(elapsed_ms = elapsed_ms(start), bytes = written, "Image generated");
        Ok(written)
    }

    /// Bytes in one generated image (`3 × H × W`).
    pub fn output_len(&self) -> usize {
        self.config.output_len()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_failed(&self) -> bool {
        self.state == State::Failed
    }

    /// Most recent message recorded for `code`.
    pub fn last_error(&self, code: ErrorCode) -> Option<&str> {
        self.errors.last(code)
    }

    fn ensure_usable(&mut self, op: &'static str) -> Result<(), DiffusionError> {
        if self.state == State::Failed || self.pipeline.is_none() {
            return Err(self.invalid_context(op));
        }
        Ok(())
    }

    fn invalid_context(&mut self, op: &'static str) -> DiffusionError {
        let reason = if self.state == State::Failed {
            "context has failed and cannot be used"
        } else {
            "context is not initialized"
        };
        let err = DiffusionError::invalid_context(op, reason);
        self.errors.record(&err);
        err
    }

    fn fail(&mut self, err: DiffusionError) -> DiffusionError {
        error!(state = %self.state, error = %err, "Diffusion context failed");
        self.errors.record(&err);
        self.state = State::Failed;
        err
    }
}
