//! strata-diffusion-tokenize: Tokenize a prompt with the CLIP vocabulary.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use serde::Serialize;

use strata_diffusion::cli;
use strata_diffusion::engine::config::PipelineConfig;
use strata_diffusion::tokenizer::{ClipTokenizer, Tokenizer};

#[derive(Parser)]
#[command(name = "strata-diffusion-tokenize", about = "Tokenize a prompt with the CLIP vocabulary")]
struct Args {
    /// Text to tokenize
    #[arg(short = 'p', long, conflicts_with_all = ["file", "stdin"])]
    prompt: Option<String>,

    /// Read text from file
    #[arg(short = 'f', long, conflicts_with = "stdin")]
    file: Option<PathBuf>,

    /// Read text from stdin
    #[arg(long)]
    stdin: bool,

    /// Directory holding the vocabulary file
    #[arg(short = 'm', long)]
    models_dir: Option<PathBuf>,

    /// Vocabulary file, overriding the models directory
    #[arg(long)]
    vocab: Option<PathBuf>,

    /// Sequence length (default: the pipeline's context length)
    #[arg(short = 'c', long)]
    context_len: Option<usize>,

    /// Output only token IDs in list format: [1, 2, 3]
    #[arg(long)]
    ids: bool,

    /// Output format: text or json
    #[arg(long, default_value = "text", value_parser = cli::validate_output_format)]
    output_format: String,

    /// Suppress all logging
    #[arg(long)]
    log_disable: bool,
}

#[derive(Serialize)]
struct TokenEntry {
    id: u32,
    text: String,
}

#[derive(Serialize)]
struct JsonOutput {
    tokens: Vec<TokenEntry>,
    context_len: usize,
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
    let input = cli::read_prompt(args.prompt.as_deref(), args.file.as_deref(), args.stdin)?;
    let config = PipelineConfig::from_dir(cli::resolve_models_dir(args.models_dir.as_deref()))?;
    let vocab = args
        .vocab
        .clone()
        .unwrap_or_else(|| config.path_of(&config.vocabulary));
    let context_len = args.context_len.unwrap_or(config.context_len);

    let tokenizer = ClipTokenizer::from_file(&vocab)?;
    let token_ids = tokenizer.tokenize(&input, context_len)?;

    match args.output_format.as_str() {
        "json" => {
            let tokens = token_ids
                .iter()
                .map(|&id| TokenEntry {
                    id,
                    text: tokenizer.decode(&[id]),
                })
                .collect();
            let output = JsonOutput { tokens, context_len };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        _ => {
            if args.ids {
                let id_strs: Vec<String> = token_ids.iter().map(|id| id.to_string()).collect();
                println!("[{}]", id_strs.join(", "));
            } else {
                let end = tokenizer.end_token_id();
                let content = token_ids.iter().skip(1).take_while(|&&id| id != end).count();
                let shown = (content + 2).min(token_ids.len());
                for &id in &token_ids[..shown] {
                    println!("{:>6} -> '{}'", id, tokenizer.decode(&[id]));
                }
                println!("({} content tokens, padded to {})", content, context_len);
            }
        }
    }

    Ok(())
}
