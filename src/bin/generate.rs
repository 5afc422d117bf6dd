//! strata-diffusion-generate: Generate an image from a text prompt.

use std::path::PathBuf;
use std::process;
use std::time::Instant;

use clap::Parser;
use image::{ImageBuffer, Rgb};
use serde::Serialize;

use strata_diffusion::cli;
use strata_diffusion::engine::config::PipelineConfig;
use strata_diffusion::Context;

#[derive(Parser)]
#[command(name = "strata-diffusion-generate", about = "Generate an image from a text prompt")]
struct Args {
    /// Prompt text
    #[arg(short = 'p', long, conflicts_with_all = ["file", "stdin"])]
    prompt: Option<String>,

    /// Read prompt from file
    #[arg(short = 'f', long, conflicts_with = "stdin")]
    file: Option<PathBuf>,

    /// Read prompt from stdin
    #[arg(long)]
    stdin: bool,

    /// Directory with stage files and vocabulary
    /// (default: $STRATA_DIFFUSION_MODELS_DIR or ~/.strata/diffusion)
    #[arg(short = 'm', long)]
    models_dir: Option<PathBuf>,

    /// Output PNG path
    #[arg(short = 'o', long, default_value = "output.png")]
    output: PathBuf,

    /// Denoising steps (only 20 is supported)
    #[arg(long)]
    steps: Option<usize>,

    /// Classifier-free guidance scale (1.0 = conditional only)
    #[arg(short = 'g', long, default_value = "7.5")]
    guidance: f32,

    /// Random seed for the initial latent
    #[arg(short = 's', long)]
    seed: Option<u64>,

    /// Graph backend: auto, host
    #[arg(long, default_value = "auto")]
    backend: String,

    /// Output format: text or json
    #[arg(long, default_value = "text", value_parser = cli::validate_output_format)]
    output_format: String,

    /// Suppress all logging
    #[arg(long)]
    log_disable: bool,
}

#[derive(Serialize)]
struct JsonOutput {
    prompt: String,
    output: String,
    width: usize,
    height: usize,
    steps: usize,
    guidance: f32,
    seed: Option<u64>,
    elapsed_ms: f64,
}

fn main() {
    let args = Args::parse();
    cli::init_logging(args.log_disable);

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let prompt = cli::read_prompt(args.prompt.as_deref(), args.file.as_deref(), args.stdin)?;
    let models_dir = cli::resolve_models_dir(args.models_dir.as_deref());
    let backend = cli::backend::resolve_backend(Some(&args.backend))?;

    let mut config = PipelineConfig::from_dir(&models_dir)?;
    if let Some(steps) = args.steps {
        config.steps = steps;
    }
    let steps = config.steps;
    let size = config.image_size();

    let start = Instant::now();
    let mut ctx = Context::setup(config, backend)?;
    if let Some(seed) = args.seed {
        ctx.set_seed(seed);
    }
    let pixels = ctx.generate(&prompt, args.guidance)?;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_raw(size as u32, size as u32, pixels)
        .ok_or("generated pixel buffer does not match the image size")?;
    img.save(&args.output)?;

    match args.output_format.as_str() {
        "json" => {
            let json = JsonOutput {
                prompt,
                output: args.output.display().to_string(),
                width: size,
                height: size,
                steps,
                guidance: args.guidance,
                seed: args.seed,
                elapsed_ms,
            };
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        _ => {
            println!(
                "Wrote {}x{} image to {} ({} steps, guidance {}, {:.0} ms)",
                size,
                size,
                args.output.display(),
                steps,
                args.guidance,
                elapsed_ms
            );
        }
    }

    Ok(())
}
