//! Tokenizer trait for turning prompts into fixed-length id sequences.
//!
//! The text encoder stage consumes exactly `context_len` ids: a start token,
//! the prompt's pieces, and end-token padding. [`ClipTokenizer`] is the
//! byte-level BPE implementation used by the pipeline.

pub mod bpe;

pub use bpe::ClipTokenizer;

use crate::error::DiffusionError;

/// Sequence length consumed by CLIP text encoders.
pub const DEFAULT_CONTEXT_LEN: usize = 77;

/// A tokenizer producing fixed-length sequences.
///
/// Implementations must be thread-safe (`Send + Sync`); the vocabulary is
/// loaded on a worker thread during pipeline setup.
pub trait Tokenizer: Send + Sync {
    /// Encode `text` into exactly `context_len` ids, starting with the start
    /// token and right-padded with the end token.
    fn tokenize(&self, text: &str, context_len: usize) -> Result<Vec<u32>, DiffusionError>;

    /// Decode ids back into text, skipping special tokens.
    fn decode(&self, ids: &[u32]) -> String;

    /// Total number of ids, including the special tokens.
    fn vocab_size(&self) -> usize;

    fn start_token_id(&self) -> u32;

    fn end_token_id(&self) -> u32;
}
