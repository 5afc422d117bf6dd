//! Stage loading and slot wiring.
//!
//! [`DiffusionPipeline::load`] deserializes every stage, the vocabulary and
//! the base noise schedule on scoped worker threads, then wires the stages
//! together on the calling thread. Wiring is by slot name:
//!
//! | name             | produced by             | consumed by                |
//! |------------------|-------------------------|----------------------------|
//! | `tokens`         | host                    | text encoder               |
//! | `context`        | text encoder            | denoiser stages            |
//! | `timestep`       | host                    | time-embedding stage       |
//! | `time_embedding` | time-embedding stage    | denoiser stages            |
//! | `latent`         | host                    | first denoiser stage(s), decoder |
//! | `noise`          | last denoiser stage     | host                       |
//! | `image`          | decoder                 | host                       |
//!
//! Any other denoiser output is an intermediate activation, aliased onto every
//! later denoiser input with the same name. Nothing is copied between stages.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::backend::GraphBackend;
use crate::error::DiffusionError;
use crate::graph::{Bindings, GraphDesc, GraphId, Slot, TensorId};
use crate::tokenizer::{ClipTokenizer, Tokenizer};

use super::config::PipelineConfig;
use super::solver::DpmSolver;

pub const TOKENS: &str = "tokens";
pub const CONTEXT: &str = "context";
pub const TIMESTEP: &str = "timestep";
pub const TIME_EMBEDDING: &str = "time_embedding";
pub const LATENT: &str = "latent";
pub const NOISE: &str = "noise";
pub const IMAGE: &str = "image";

/// Load a stage file and keep its first graph.
fn load_stage(backend: &dyn GraphBackend, path: &Path) -> Result<GraphDesc, DiffusionError> {
    info!(path = %path.display(), "Loading stage");
    let mut graphs = backend.load(path)?;
    if graphs.is_empty() {
        return Err(DiffusionError::invalid_argument(
            "load",
            format!("deserialized stage {} does not contain any graphs", path.display()),
        ));
    }
    if graphs.len() > 1 {
        warn!(
            path = %path.display(),
            graphs = graphs.len(),
            "Stage contains more than one graph, only the first one will be used"
        );
    }
    Ok(graphs.swap_remove(0))
}

fn join<T>(handle: thread::ScopedJoinHandle<'_, Result<T, DiffusionError>>) -> Result<T, DiffusionError> {
    handle
        .join()
        .unwrap_or_else(|_| Err(DiffusionError::internal("setup", "loader thread panicked")))
}

/// Per-step time embedding: the tensor written by the time-embedding stage
/// and its inactive aliases on every denoiser `time_embedding` input.
#[derive(Debug, Clone)]
struct StepEmbedding {
    source: TensorId,
    aliases: Vec<TensorId>,
}

/// Loaded, wired pipeline: stages, tokenizer and solver.
pub struct DiffusionPipeline {
    config: PipelineConfig,
    bindings: Bindings,
    tokenizer: ClipTokenizer,
    solver: DpmSolver,

    text_encoder: GraphId,
    time_embedding: GraphId,
    denoiser: Vec<GraphId>,
    decoder: GraphId,

    tokens: TensorId,
    cond_context: TensorId,
    uncond_context: TensorId,
    cond_aliases: Vec<TensorId>,
    uncond_aliases: Vec<TensorId>,
    uncond_ready: bool,

    timestep: TensorId,
    time_embedding_out: Slot,
    time_embedding_targets: Vec<(GraphId, Slot)>,
    step_embeddings: Vec<StepEmbedding>,
    steps: Option<usize>,

    latent: TensorId,
    noise: TensorId,
    /// Inactive tensor on the noise output slot; holds the guidance blend.
    guidance_acc: TensorId,
    decoder_latent: TensorId,
    image: TensorId,
}

/// Look up a required slot by name.
fn required(desc: &GraphDesc, name: &str, input: bool) -> Result<Slot, DiffusionError> {
    let slot = if input {
        desc.input_named(name)
    } else {
        desc.output_named(name)
    };
    slot.ok_or_else(|| {
        DiffusionError::runtime(
            "setup",
            format!(
                "stage '{}' has no {} named '{}'",
                desc.name,
                if input { "input" } else { "output" },
                name
            ),
        )
    })
}

/// Check that `tensor` holds exactly `expected` elements.
fn expect_len(
    bindings: &Bindings,
    tensor: TensorId,
    expected: usize,
    what: &str,
) -> Result<(), DiffusionError> {
    let actual = bindings.element_count(tensor)?;
    if actual != expected {
        return Err(DiffusionError::runtime(
            "setup",
            format!("{} holds {} elements, expected {}", what, actual, expected),
        ));
    }
    Ok(())
}

impl DiffusionPipeline {
    /// Load every stage, the vocabulary and the base schedule in parallel,
    /// then allocate and wire all tensors.
    pub fn load(config: &PipelineConfig, backend: Arc<dyn GraphBackend>) -> Result<Self, DiffusionError> {
        config.validate()?;
        let start = Instant::now();

        let mut files = Vec::with_capacity(config.denoiser.len() + 3);
        files.push(config.text_encoder.as_str());
        files.push(config.time_embedding.as_str());
        files.extend(config.denoiser.iter().map(String::as_str));
        files.push(config.decoder.as_str());

        let (stages, tokenizer, solver) = thread::scope(|scope| {
            let loaders: Vec<_> = files
                .iter()
                .map(|file| {
                    let path = config.path_of(file);
                    let backend = backend.as_ref();
                    scope.spawn(move || load_stage(backend, &path))
                })
                .collect();
            let vocab_path = config.path_of(&config.vocabulary);
            let vocab = scope.spawn(move || ClipTokenizer::from_file(vocab_path));
            let solver = scope.spawn(|| DpmSolver::new(config.timesteps, config.beta_start, config.beta_end));

            let stages: Vec<_> = loaders.into_iter().map(join).collect();
            (stages, join(vocab), join(solver))
        });

        let mut loaded = Vec::with_capacity(stages.len());
        for (file, stage) in files.iter().zip(stages) {
            match stage {
                Ok(desc) => loaded.push(desc),
                Err(e) => {
                    warn!(file, error = %e, "Failed to load stage");
                    return Err(e);
                }
            }
        }
        let tokenizer = tokenizer?;
        let solver = solver?;
        info!(elapsed_ms = start.elapsed().as_millis() as u64, "All stages loaded");

        let decoder = loaded
            .pop()
            .ok_or_else(|| DiffusionError::internal("setup", "decoder stage missing"))?;
        let mut loaded = loaded.into_iter();
        let (text_encoder, time_embedding) = match (loaded.next(), loaded.next()) {
            (Some(enc), Some(te)) => (enc, te),
            _ => return Err(DiffusionError::internal("setup", "encoder stages missing")),
        };
        let denoiser: Vec<GraphDesc> = loaded.collect();

        let pipeline = Self::wire(
            config.clone(),
            Bindings::new(backend),
            tokenizer,
            solver,
            text_encoder,
            time_embedding,
            denoiser,
            decoder,
        )?;
        info!(
            stages = pipeline.denoiser.len() + 3,
            tensors = pipeline.bindings.num_tensors(),
            buffers = pipeline.bindings.num_buffers(),
            "Input/output buffers created and wired"
        );
        Ok(pipeline)
    }

    #[allow(clippy::too_many_arguments)]
    fn wire(
        config: PipelineConfig,
        mut b: Bindings,
        tokenizer: ClipTokenizer,
        solver: DpmSolver,
        text_encoder: GraphDesc,
        time_embedding: GraphDesc,
        denoiser: Vec<GraphDesc>,
        decoder: GraphDesc,
    ) -> Result<Self, DiffusionError> {
        // Text encoder: tokens in, context out (conditional and unconditional).
        let tokens_slot = required(&text_encoder, TOKENS, true)?;
        let context_slot = required(&text_encoder, CONTEXT, false)?;
        let extra_encoder_inputs: Vec<&str> = text_encoder
            .inputs
            .iter()
            .map(|s| s.name.as_str())
            .filter(|n| *n != TOKENS)
            .collect();
        if !extra_encoder_inputs.is_empty() {
            return Err(DiffusionError::runtime(
                "setup",
                format!(
                    "text encoder '{}' has unsupported inputs: {}",
                    text_encoder.name,
                    extra_encoder_inputs.join(", ")
                ),
            ));
        }
        let num_encoder_outputs = text_encoder.outputs.len();
        let enc = b.add_graph(text_encoder);
        let tokens = b.allocate(enc, tokens_slot, 1)?;
        b.activate(tokens)?;
        expect_len(&b, tokens, config.context_len, "text encoder 'tokens' input")?;
        let cond_context = b.allocate(enc, context_slot, 1)?;
        let uncond_context = b.allocate(enc, context_slot, 1)?;
        b.activate(cond_context)?;
        for j in (0..num_encoder_outputs).filter(|&j| Slot::Output(j) != context_slot) {
            let scratch = b.allocate(enc, Slot::Output(j), 1)?;
            b.activate(scratch)?;
        }

        // Time-embedding stage: timestep in, embedding out (per-step tensors).
        let timestep_slot = required(&time_embedding, TIMESTEP, true)?;
        let time_embedding_out = required(&time_embedding, TIME_EMBEDDING, false)?;
        if time_embedding.inputs.len() != 1 {
            return Err(DiffusionError::runtime(
                "setup",
                format!(
                    "time-embedding stage '{}' must take only '{}'",
                    time_embedding.name, TIMESTEP
                ),
            ));
        }
        let num_te_outputs = time_embedding.outputs.len();
        let te = b.add_graph(time_embedding);
        let timestep = b.allocate(te, timestep_slot, 1)?;
        b.activate(timestep)?;
        for j in (0..num_te_outputs).filter(|&j| Slot::Output(j) != time_embedding_out) {
            let scratch = b.allocate(te, Slot::Output(j), 1)?;
            b.activate(scratch)?;
        }

        // Denoiser sub-stages, in execution order.
        let mut denoiser_ids = Vec::with_capacity(denoiser.len());
        let mut cond_aliases = Vec::new();
        let mut uncond_aliases = Vec::new();
        let mut time_embedding_targets = Vec::new();
        let mut latent: Option<TensorId> = None;
        let mut noise: Option<(GraphId, Slot, TensorId)> = None;
        let mut produced: HashMap<String, TensorId> = HashMap::new();

        for desc in denoiser {
            let input_names: Vec<String> = desc.inputs.iter().map(|s| s.name.clone()).collect();
            let output_names: Vec<String> = desc.outputs.iter().map(|s| s.name.clone()).collect();
            let stage_name = desc.name.clone();
            let g = b.add_graph(desc);

            for (i, name) in input_names.iter().enumerate() {
                let slot = Slot::Input(i);
                match name.as_str() {
                    CONTEXT => {
                        cond_aliases.push(b.bind(g, slot, cond_context, true)?);
                        uncond_aliases.push(b.bind(g, slot, uncond_context, false)?);
                    }
                    TIME_EMBEDDING => time_embedding_targets.push((g, slot)),
                    LATENT => match latent {
                        Some(t) => {
                            b.bind(g, slot, t, true)?;
                        }
                        None => {
                            let t = b.allocate(g, slot, 1)?;
                            b.activate(t)?;
                            latent = Some(t);
                        }
                    },
                    other => match produced.get(other) {
                        Some(&t) => {
                            b.bind(g, slot, t, true)?;
                        }
                        None => {
                            return Err(DiffusionError::runtime(
                                "setup",
                                format!(
                                    "denoiser stage '{}' input '{}' is neither a pipeline input nor produced by an earlier stage",
                                    stage_name, other
                                ),
                            ));
                        }
                    },
                }
            }

            for (j, name) in output_names.iter().enumerate() {
                let slot = Slot::Output(j);
                let t = b.allocate(g, slot, 1)?;
                b.activate(t)?;
                if name == NOISE {
                    if noise.is_some() {
                        return Err(DiffusionError::runtime(
                            "setup",
                            format!("more than one denoiser stage produces '{}'", NOISE),
                        ));
                    }
                    noise = Some((g, slot, t));
                } else {
                    produced.insert(name.clone(), t);
                }
            }
            debug!(stage = %stage_name, "Wired denoiser stage");
            denoiser_ids.push(g);
        }

        let latent = latent.ok_or_else(|| {
            DiffusionError::runtime("setup", format!("no denoiser stage takes '{}'", LATENT))
        })?;
        let (noise_graph, noise_slot, noise) = noise.ok_or_else(|| {
            DiffusionError::runtime("setup", format!("no denoiser stage produces '{}'", NOISE))
        })?;
        if cond_aliases.is_empty() {
            warn!("No denoiser stage takes '{}'; guidance has no effect", CONTEXT);
        }
        let latent_len = config.latent_len();
        expect_len(&b, latent, latent_len, "denoiser 'latent' input")?;
        expect_len(&b, noise, latent_len, "denoiser 'noise' output")?;
        let guidance_acc = b.allocate(noise_graph, noise_slot, 1)?;

        // Decoder: latent in, image out.
        let decoder_latent_slot = required(&decoder, LATENT, true)?;
        let image_slot = required(&decoder, IMAGE, false)?;
        if decoder.inputs.len() != 1 {
            return Err(DiffusionError::runtime(
                "setup",
                format!("decoder '{}' must take only '{}'", decoder.name, LATENT),
            ));
        }
        let num_decoder_outputs = decoder.outputs.len();
        let dec = b.add_graph(decoder);
        let decoder_latent = b.allocate(dec, decoder_latent_slot, 1)?;
        b.activate(decoder_latent)?;
        let image = b.allocate(dec, image_slot, 1)?;
        b.activate(image)?;
        for j in (0..num_decoder_outputs).filter(|&j| Slot::Output(j) != image_slot) {
            let scratch = b.allocate(dec, Slot::Output(j), 1)?;
            b.activate(scratch)?;
        }
        expect_len(&b, decoder_latent, latent_len, "decoder 'latent' input")?;
        expect_len(&b, image, config.output_len(), "decoder 'image' output")?;

        b.verify(enc)?;
        b.verify(dec)?;

        Ok(Self {
            config,
            bindings: b,
            tokenizer,
            solver,
            text_encoder: enc,
            time_embedding: te,
            denoiser: denoiser_ids,
            decoder: dec,
            tokens,
            cond_context,
            uncond_context,
            cond_aliases,
            uncond_aliases,
            uncond_ready: false,
            timestep,
            time_embedding_out,
            time_embedding_targets,
            step_embeddings: Vec::new(),
            steps: None,
            latent,
            noise,
            guidance_acc,
            decoder_latent,
            image,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> &ClipTokenizer {
        &self.tokenizer
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    pub fn solver(&self) -> &DpmSolver {
        &self.solver
    }

    /// Prepared step count, if any.
    pub fn steps(&self) -> Option<usize> {
        self.steps
    }

    /// Tokenize with the pipeline's context length.
    pub fn tokenize(&self, text: &str) -> Result<Vec<u32>, DiffusionError> {
        self.tokenizer.tokenize(text, self.config.context_len)
    }

    /// Prepare the solver for `steps` and precompute one time embedding per
    /// step by running the time-embedding stage. Step 0's embedding is left
    /// active on every denoiser stage.
    pub fn prepare_schedule(&mut self, steps: usize) -> Result<(), DiffusionError> {
        let start = Instant::now();
        let model_ts = self.solver.prepare(steps)?.model_ts.clone();
        self.steps = None;

        let b = &mut self.bindings;
        let timestep_len = b.element_count(self.timestep)?;
        for (step, &t) in model_ts.iter().take(steps).enumerate() {
            if step == self.step_embeddings.len() {
                let source = b.allocate(self.time_embedding, self.time_embedding_out, 1)?;
                let mut aliases = Vec::with_capacity(self.time_embedding_targets.len());
                for &(g, slot) in &self.time_embedding_targets {
                    aliases.push(b.bind(g, slot, source, false)?);
                }
                self.step_embeddings.push(StepEmbedding { source, aliases });
            }
            let source = self.step_embeddings[step].source;
            b.activate(source)?;
            b.write(self.timestep, &vec![t; timestep_len], 1.0, false)?;
            b.execute(self.time_embedding)?;
        }

        self.activate_step(0)?;
        for &g in &self.denoiser {
            self.bindings.verify(g)?;
        }
        self.steps = Some(steps);
        info!(steps, elapsed_ms = start.elapsed().as_millis() as u64, "Time schedule prepared");
        Ok(())
    }

    fn activate_step(&mut self, step: usize) -> Result<(), DiffusionError> {
        let embedding = self.step_embeddings.get(step).ok_or_else(|| {
            DiffusionError::invalid_argument(
                "denoise",
                format!("no time embedding prepared for step {}", step),
            )
        })?;
        for &alias in &embedding.aliases {
            self.bindings.activate(alias)?;
        }
        Ok(())
    }

    fn use_context(&mut self, conditional: bool) -> Result<(), DiffusionError> {
        let aliases = if conditional {
            &self.cond_aliases
        } else {
            &self.uncond_aliases
        };
        for &alias in aliases {
            self.bindings.activate(alias)?;
        }
        Ok(())
    }

    fn encode(&mut self, text: &str, target: TensorId) -> Result<(), DiffusionError> {
        let ids = self.tokenize(text)?;
        self.bindings.activate(target)?;
        self.bindings.write(self.tokens, &ids, 1.0, false)?;
        self.bindings.execute(self.text_encoder)
    }

    /// Run the text encoder for `prompt`, and once per pipeline for the
    /// empty prompt used by unconditional passes.
    pub fn condition(&mut self, prompt: &str) -> Result<(), DiffusionError> {
        self.encode(prompt, self.cond_context)?;
        if !self.uncond_ready {
            self.encode("", self.uncond_context)?;
            self.bindings.activate(self.cond_context)?;
            self.uncond_ready = true;
            debug!("Unconditional embedding cached");
        }
        Ok(())
    }

    fn run_denoiser(&mut self) -> Result<(), DiffusionError> {
        for i in 0..self.denoiser.len() {
            self.bindings.execute(self.denoiser[i])?;
        }
        Ok(())
    }

    /// Compute the (guided) noise estimate for `x` at `step` into `out`.
    ///
    /// With `guidance == 1` this is a single conditional pass. Otherwise the
    /// result is `guidance * cond + (1 - guidance) * uncond`, blended in the
    /// accumulator tensor.
    pub fn denoise(
        &mut self,
        step: usize,
        x: &[f32],
        guidance: f32,
        out: &mut [f32],
    ) -> Result<(), DiffusionError> {
        if !self.uncond_ready {
            return Err(DiffusionError::invalid_argument("denoise", "pipeline has not been conditioned"));
        }
        self.activate_step(step)?;
        self.bindings.write(self.latent, x, 1.0, false)?;
        self.use_context(true)?;
        self.run_denoiser()?;
        self.bindings.read(self.noise, out)?;
        if guidance == 1.0 {
            return Ok(());
        }

        self.bindings.write(self.guidance_acc, out, guidance, false)?;
        self.use_context(false)?;
        let result = self.run_denoiser().and_then(|_| self.bindings.read(self.noise, out));
        self.use_context(true)?;
        result?;
        self.bindings.write(self.guidance_acc, out, 1.0 - guidance, true)?;
        self.bindings.read(self.guidance_acc, out)
    }

    /// Decode the final latent into interleaved RGB bytes. Returns the
    /// number of bytes written.
    pub fn decode(&mut self, x: &[f32], out: &mut [u8]) -> Result<usize, DiffusionError> {
        let needed = self.config.output_len();
        if out.len() < needed {
            return Err(DiffusionError::invalid_argument(
                "decode",
                format!("Provided buffer is too small, missing {} bytes", needed - out.len()),
            ));
        }
        self.bindings
            .write(self.decoder_latent, x, self.config.decoder_latent_scale, false)?;
        self.bindings.execute(self.decoder)?;
        let mut pixels = vec![0.0f32; needed];
        self.bindings.read(self.image, &mut pixels)?;
        let range = self.config.output_range;
        for (byte, &v) in out.iter_mut().zip(&pixels) {
            *byte = range.to_byte(v);
        }
        Ok(needed)
    }

    /// Solver access for the sampling loop.
    pub(crate) fn solver_mut(&mut self) -> &mut DpmSolver {
        &mut self.solver
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::backend::host::HostBackend;
    use crate::error::ErrorCode;
    use std::fs;

    fn load(dir: &Path) -> DiffusionPipeline {
        let config = PipelineConfig::from_dir(dir).unwrap();
        DiffusionPipeline::load(&config, Arc::new(HostBackend::new())).unwrap()
    }

    #[test]
    fn test_load_and_wire() {
        let dir = tempfile::tempdir().unwrap();
        write_models(dir.path());
        let backend = Arc::new(RecordingBackend::new());
        let config = PipelineConfig::from_dir(dir.path()).unwrap();
        let p = DiffusionPipeline::load(&config, backend.clone()).unwrap();

        assert_eq!(backend.loads.load(std::sync::atomic::Ordering::SeqCst), 5);
        assert_eq!(p.denoiser.len(), 2);
        assert_eq!(p.tokenizer().start_token_id(), 516);
        // Both denoiser stages see the conditional context; the unconditional
        // aliases share the other encoder buffer.
        assert_eq!(p.cond_aliases.len(), 2);
        for (&c, &u) in p.cond_aliases.iter().zip(&p.uncond_aliases) {
            assert!(p.bindings.is_active(c));
            assert!(!p.bindings.is_active(u));
            assert_eq!(p.bindings.buffer_of(c), p.bindings.buffer_of(p.cond_context));
            assert_eq!(p.bindings.buffer_of(u), p.bindings.buffer_of(p.uncond_context));
        }
        assert!(!p.bindings.is_active(p.guidance_acc));
        assert_eq!(p.time_embedding_targets.len(), 2);
        assert_eq!(p.steps(), None);
    }

    #[test]
    fn test_prepare_schedule_builds_step_embeddings() {
        let dir = tempfile::tempdir().unwrap();
        write_models(dir.path());
        let mut p = load(dir.path());
        p.prepare_schedule(20).unwrap();

        assert_eq!(p.steps(), Some(20));
        assert_eq!(p.step_embeddings.len(), 20);
        for (step, e) in p.step_embeddings.iter().enumerate() {
            assert_eq!(e.aliases.len(), 2);
            for &alias in &e.aliases {
                assert_eq!(p.bindings.is_active(alias), step == 0);
                assert_eq!(p.bindings.buffer_of(alias), p.bindings.buffer_of(e.source));
            }
        }

        // Each embedding is tanh(0.001 * model_t).
        let model_ts = p.solver().schedule().unwrap().model_ts.clone();
        let mut emb = [0.0f32; 4];
        p.bindings.read(p.step_embeddings[0].source, &mut emb).unwrap();
        assert!((emb[0] - (0.001 * model_ts[0]).tanh()).abs() < 1e-6);
        p.bindings.read(p.step_embeddings[19].source, &mut emb).unwrap();
        assert!((emb[3] - (0.001 * model_ts[19]).tanh()).abs() < 1e-6);

        // Re-preparing reuses the per-step tensors.
        let tensors = p.bindings.num_tensors();
        p.prepare_schedule(20).unwrap();
        assert_eq!(p.bindings.num_tensors(), tensors);
    }

    #[test]
    fn test_prepare_schedule_rejects_unsupported_steps() {
        let dir = tempfile::tempdir().unwrap();
        write_models(dir.path());
        let mut p = load(dir.path());
        let err = p.prepare_schedule(10).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        assert_eq!(p.steps(), None);
    }

    #[test]
    fn test_guidance_one_is_conditional_estimate() {
        let dir = tempfile::tempdir().unwrap();
        write_models(dir.path());
        let backend = Arc::new(RecordingBackend::new());
        let config = PipelineConfig::from_dir(dir.path()).unwrap();
        let mut p = DiffusionPipeline::load(&config, backend.clone()).unwrap();
        p.prepare_schedule(20).unwrap();
        p.condition("cat").unwrap();

        let x = [0.1f32, -0.2, 0.3, -0.4];
        let mut guided = [0.0f32; 4];
        let before = backend.count("unet_out");
        p.denoise(3, &x, 1.0, &mut guided).unwrap();
        assert_eq!(backend.count("unet_out") - before, 1);

        // Same pass by hand.
        p.activate_step(3).unwrap();
        p.bindings.write(p.latent, &x, 1.0, false).unwrap();
        p.use_context(true).unwrap();
        p.run_denoiser().unwrap();
        let mut cond = [0.0f32; 4];
        p.bindings.read(p.noise, &mut cond).unwrap();
        assert_eq!(guided, cond);
    }

    #[test]
    fn test_guidance_blends_two_passes() {
        let dir = tempfile::tempdir().unwrap();
        write_models(dir.path());
        let mut p = load(dir.path());
        p.prepare_schedule(20).unwrap();
        p.condition("dog").unwrap();

        let x = [0.5f32, 0.25, -0.75, 1.0];
        let mut cond = [0.0f32; 4];
        let mut uncond = [0.0f32; 4];
        p.denoise(5, &x, 1.0, &mut cond).unwrap();
        p.use_context(false).unwrap();
        p.run_denoiser().unwrap();
        p.bindings.read(p.noise, &mut uncond).unwrap();
        p.use_context(true).unwrap();
        assert_ne!(cond, uncond);

        let mut guided = [0.0f32; 4];
        p.denoise(5, &x, 7.5, &mut guided).unwrap();
        for i in 0..4 {
            let want = 7.5 * cond[i] + (1.0 - 7.5) * uncond[i];
            assert!((guided[i] - want).abs() < 1e-5, "{} vs {}", guided[i], want);
        }
        // The conditional embedding is active again afterwards.
        assert!(p.cond_aliases.iter().all(|&t| p.bindings.is_active(t)));
    }

    #[test]
    fn test_unconditional_encoding_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        write_models(dir.path());
        let backend = Arc::new(RecordingBackend::new());
        let config = PipelineConfig::from_dir(dir.path()).unwrap();
        let mut p = DiffusionPipeline::load(&config, backend.clone()).unwrap();
        p.condition("cat").unwrap();
        p.condition("dog").unwrap();
        assert_eq!(backend.count("text_encoder"), 3);
    }

    #[test]
    fn test_denoise_requires_conditioning() {
        let dir = tempfile::tempdir().unwrap();
        write_models(dir.path());
        let mut p = load(dir.path());
        p.prepare_schedule(20).unwrap();
        let mut out = [0.0f32; 4];
        assert!(p.denoise(0, &[0.0; 4], 1.0, &mut out).is_err());
    }

    #[test]
    fn test_decode_maps_signed_output() {
        let dir = tempfile::tempdir().unwrap();
        write_models(dir.path());
        let mut p = load(dir.path());
        let mut out = vec![0u8; p.config().output_len()];
        assert_eq!(out.len(), 48);
        let n = p.decode(&[0.0, 0.0, 0.0, 0.0], &mut out).unwrap();
        assert_eq!(n, 48);
        // tanh(0) = 0 maps to mid grey.
        assert!(out.iter().all(|&v| v == 128));

        let mut short = vec![0u8; 40];
        let err = p.decode(&[0.0; 4], &mut short).unwrap_err();
        assert!(err.to_string().contains("missing 8 bytes"));
    }

    #[test]
    fn test_missing_stage_file() {
        let dir = tempfile::tempdir().unwrap();
        write_models(dir.path());
        fs::remove_file(dir.path().join("unet_out.json")).unwrap();
        let config = PipelineConfig::from_dir(dir.path()).unwrap();
        let err = DiffusionPipeline::load(&config, Arc::new(HostBackend::new())).err().unwrap();
        assert_eq!(err.code(), ErrorCode::RuntimeError);
    }

    #[test]
    fn test_unknown_denoiser_input() {
        let dir = tempfile::tempdir().unwrap();
        write_models(dir.path());
        fs::write(
            dir.path().join("unet_out.json"),
            r#"{ "name": "unet_out",
                 "inputs": [{ "name": "skip", "shape": [1, 4], "dtype": "float32" }],
                 "outputs": [{ "name": "noise", "shape": [1, 1, 2, 2], "dtype": "float32" }] }"#,
        )
        .unwrap();
        let config = PipelineConfig::from_dir(dir.path()).unwrap();
        let err = DiffusionPipeline::load(&config, Arc::new(HostBackend::new())).err().unwrap();
        assert_eq!(err.code(), ErrorCode::RuntimeError);
        assert!(err.to_string().contains("'skip'"));
    }

    #[test]
    fn test_decoder_size_must_match_output() {
        let dir = tempfile::tempdir().unwrap();
        write_models(dir.path());
        fs::write(
            dir.path().join("decoder.json"),
            r#"{ "name": "decoder",
                 "inputs": [{ "name": "latent", "shape": [1, 1, 2, 2], "dtype": "float32" }],
                 "outputs": [{ "name": "image", "shape": [1, 2, 2, 3], "dtype": "float32" }] }"#,
        )
        .unwrap();
        let config = PipelineConfig::from_dir(dir.path()).unwrap();
        let err = DiffusionPipeline::load(&config, Arc::new(HostBackend::new())).err().unwrap();
        assert!(err.to_string().contains("decoder 'image' output"));
    }

    #[test]
    fn test_empty_prompt_round_trip_through_identity_stage() {
        let dir = tempfile::tempdir().unwrap();
        write_models(dir.path());
        let p = load(dir.path());
        let ids = p.tokenize("").unwrap();

        let mut b = Bindings::new(Arc::new(HostBackend::new()));
        let g = b.add_graph(
            HostBackend::graph_from_json(
                r#"{ "name": "echo",
                     "inputs": [{ "name": "tokens", "shape": [1, 8], "dtype": "int32" }],
                     "outputs": [{ "name": "tokens_out", "shape": [1, 8], "dtype": "int32" }] }"#,
            )
            .unwrap(),
        );
        let input = b.allocate(g, Slot::Input(0), 1).unwrap();
        let output = b.allocate(g, Slot::Output(0), 1).unwrap();
        b.activate(input).unwrap();
        b.activate(output).unwrap();
        b.write(input, &ids, 1.0, false).unwrap();
        b.execute(g).unwrap();
        let mut echoed = vec![0u32; CONTEXT_LEN];
        b.read(output, &mut echoed).unwrap();

        assert_eq!(echoed, ids);
        assert_eq!(echoed[0], 516);
        assert!(echoed[1..].iter().all(|&id| id == 517));
    }
}
