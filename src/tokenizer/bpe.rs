//! Byte-level BPE tokenizer for CLIP text encoders.
//!
//! The vocabulary file is plain UTF-8 text, one entry per line:
//! - a bare token (`a`, `a</w>`, ...), or
//! - a merge pair `first second`, which also defines the token `firstsecond`.
//!
//! Every line takes the next token id in file order, and merge pairs
//! additionally take the next merge rank. After the last line two ids are
//! reserved for the start and end tokens. The CLIP vocabulary yields
//! start = 49406 and end = 49407.
//!
//! Text is normalized (NFC, trimmed, blank runs collapsed, lowercased), split
//! into words, remapped byte-by-byte into printable characters, and merged
//! with the standard rank-ordered BPE loop.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, trace};
use unicode_normalization::UnicodeNormalization;

use crate::error::DiffusionError;

use super::Tokenizer;

/// Marker appended to the last character of every word.
const END_OF_WORD: &str = "</w>";

const START_TOKEN: &str = "<|startoftext|>";
const END_TOKEN: &str = "<|endoftext|>";

/// CLIP tokenizer with a rank-based merge table.
pub struct ClipTokenizer {
    /// Piece -> token id. The first occurrence of a duplicated line wins.
    token_to_id: HashMap<String, u32>,
    /// Token id -> piece, including the two special tokens.
    id_to_token: Vec<String>,
    /// (left, right) -> merge rank; lower merges first.
    merge_ranks: HashMap<(String, String), u32>,
    byte_encoder: [char; 256],
    byte_decoder: HashMap<char, u8>,
    start_id: u32,
    end_id: u32,
}

impl ClipTokenizer {
    /// Load a vocabulary file.
    ///
    /// A missing file is an invalid argument; any other read failure is a
    /// runtime error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DiffusionError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => DiffusionError::invalid_argument(
                "tokenizer",
                format!("Tokenizer file {} does not exist", path.display()),
            ),
            _ => DiffusionError::runtime(
                "tokenizer",
                format!("could not read tokenizer file {}: {}", path.display(), e),
            ),
        })?;
        let tokenizer = Self::from_vocab_str(&contents);
        debug!(path = %path.display(), vocab_size = tokenizer.vocab_size(), "Loaded vocabulary");
        Ok(tokenizer)
    }

    /// Build a tokenizer from vocabulary file contents.
    pub fn from_vocab_str(contents: &str) -> Self {
        let mut token_to_id = HashMap::new();
        let mut id_to_token = Vec::new();
        let mut merge_ranks = HashMap::new();
        let mut next_rank = 0u32;

        for line in contents.lines() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.trim().is_empty() {
                continue;
            }
            let id = id_to_token.len() as u32;
            let piece = match line.split_once(' ') {
                Some((first, second)) => {
                    merge_ranks
                        .entry((first.to_string(), second.to_string()))
                        .or_insert(next_rank);
                    next_rank += 1;
                    format!("{}{}", first, second)
                }
                None => line.to_string(),
            };
            token_to_id.entry(piece.clone()).or_insert(id);
            id_to_token.push(piece);
        }

        let start_id = id_to_token.len() as u32;
        id_to_token.push(START_TOKEN.to_string());
        let end_id = id_to_token.len() as u32;
        id_to_token.push(END_TOKEN.to_string());

        let byte_encoder = bytes_to_unicode();
        let byte_decoder = byte_encoder
            .iter()
            .enumerate()
            .map(|(b, &c)| (c, b as u8))
            .collect();

        debug!(
            vocab_size = id_to_token.len(),
            merge_count = merge_ranks.len(),
            start_id,
            end_id,
            "CLIP tokenizer initialized"
        );

        Self {
            token_to_id,
            id_to_token,
            merge_ranks,
            byte_encoder,
            byte_decoder,
            start_id,
            end_id,
        }
    }

    /// Id of a vocabulary piece, if present.
    pub fn token_id(&self, piece: &str) -> Option<u32> {
        self.token_to_id.get(piece).copied()
    }

    /// Tokenize raw bytes, rejecting malformed UTF-8.
    pub fn tokenize_bytes(&self, bytes: &[u8], context_len: usize) -> Result<Vec<u32>, DiffusionError> {
        let text = std::str::from_utf8(bytes).map_err(|e| {
            DiffusionError::invalid_argument("tokenize", format!("Invalid UTF-8 string: {}", e))
        })?;
        self.tokenize(text, context_len)
    }

    /// Remap a word's UTF-8 bytes into printable characters.
    fn byte_encode(&self, word: &str) -> String {
        word.bytes().map(|b| self.byte_encoder[b as usize]).collect()
    }

    /// Merge one byte-encoded word and append its ids to `out`, stopping once
    /// `out` holds `max_len` ids.
    fn bpe(&self, word: &str, out: &mut Vec<u32>, max_len: usize) -> Result<(), DiffusionError> {
        let mut symbols: Vec<String> = word.chars().map(String::from).collect();
        match symbols.last_mut() {
            Some(last) => last.push_str(END_OF_WORD),
            None => return Ok(()),
        }

        while symbols.len() > 1 {
            let best = symbols
                .windows(2)
                .filter_map(|pair| {
                    self.merge_ranks
                        .get(&(pair[0].clone(), pair[1].clone()))
                        .map(|&rank| (rank, pair[0].clone(), pair[1].clone()))
                })
                .min_by_key(|(rank, _, _)| *rank);
            let Some((_, first, second)) = best else {
                break;
            };

            // Merge every occurrence of the pair, left to right.
            let mut merged = Vec::with_capacity(symbols.len());
            let mut i = 0;
            while i < symbols.len() {
                if i + 1 < symbols.len() && symbols[i] == first && symbols[i + 1] == second {
                    merged.push(format!("{}{}", first, second));
                    i += 2;
                } else {
                    merged.push(std::mem::take(&mut symbols[i]));
                    i += 1;
                }
            }
            symbols = merged;
        }

        for piece in &symbols {
            if out.len() >= max_len {
                break;
            }
            let id = self.token_to_id.get(piece).ok_or_else(|| {
                DiffusionError::internal(
                    "bpe",
                    format!("piece '{}' of word '{}' is not in the vocabulary", piece, word),
                )
            })?;
            out.push(*id);
        }
        Ok(())
    }
}

impl Tokenizer for ClipTokenizer {
    fn tokenize(&self, text: &str, context_len: usize) -> Result<Vec<u32>, DiffusionError> {
        if context_len < 2 {
            return Err(DiffusionError::invalid_argument(
                "tokenize",
                format!("context length must be at least 2, got {}", context_len),
            ));
        }
        let max_len = context_len - 1;
        let mut out = Vec::with_capacity(context_len);
        out.push(self.start_id);

        let normalized = normalize(text);
        for word in clip_pre_tokenize(&normalized) {
            if out.len() >= max_len {
                break;
            }
            self.bpe(&self.byte_encode(&word), &mut out, max_len)?;
        }
        let content = out.len() - 1;
        out.resize(context_len, self.end_id);
        trace!(content, context_len, "Tokenized prompt");
        Ok(out)
    }

    fn decode(&self, ids: &[u32]) -> String {
        let mut encoded = String::new();
        for &id in ids {
            if id == self.start_id || id == self.end_id {
                continue;
            }
            if let Some(piece) = self.id_to_token.get(id as usize) {
                encoded.push_str(piece);
            }
        }
        let mut bytes = Vec::with_capacity(encoded.len());
        for word in encoded.split_inclusive(END_OF_WORD) {
            let (body, boundary) = match word.strip_suffix(END_OF_WORD) {
                Some(body) => (body, true),
                None => (word, false),
            };
            bytes.extend(body.chars().filter_map(|c| self.byte_decoder.get(&c).copied()));
            if boundary {
                bytes.push(b' ');
            }
        }
        String::from_utf8_lossy(&bytes).trim_end().to_string()
    }

    fn vocab_size(&self) -> usize {
        self.id_to_token.len()
    }

    fn start_token_id(&self) -> u32 {
        self.start_id
    }

    fn end_token_id(&self) -> u32 {
        self.end_id
    }
}

/// The reversible byte -> printable character table from CLIP.
///
/// Printable Latin-1 bytes map to themselves; the remaining 68 bytes map, in
/// order, to U+0100 onwards.
pub fn bytes_to_unicode() -> [char; 256] {
    let mut table = ['\0'; 256];
    let mut shifted = 0u32;
    for b in 0..=255u8 {
        let printable = matches!(b, 33..=126 | 161..=172 | 174..=255);
        table[b as usize] = if printable {
            char::from(b)
        } else {
            let c = char::from_u32(256 + shifted).unwrap_or(char::REPLACEMENT_CHARACTER);
            shifted += 1;
            c
        };
    }
    table
}

/// NFC, trim, collapse whitespace runs to one space, lowercase.
fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for ch in text.nfc() {
        if ch.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.extend(ch.to_lowercase());
    }
    out
}

// ---------------------------------------------------------------------------
// Pre-tokenization (no regex dependency)
// ---------------------------------------------------------------------------

/// Character classes of the CLIP word pattern.
#[derive(PartialEq, Eq, Clone, Copy)]
enum CharCategory {
    Letter,
    Numeric,
    Space,
    Other,
}

fn char_category(ch: char) -> CharCategory {
    if ch.is_alphabetic() {
        CharCategory::Letter
    } else if ch.is_numeric() {
        CharCategory::Numeric
    } else if ch.is_whitespace() {
        CharCategory::Space
    } else {
        CharCategory::Other
    }
}

/// Split normalized text into words: contractions, letter runs, single
/// numeric characters, and runs of anything else. Whitespace separates
/// words and is dropped.
fn clip_pre_tokenize(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let mut pieces = Vec::new();
    let mut i = 0;

    while i < len {
        if let Some((contraction, consumed)) = try_contraction(&chars, i) {
            pieces.push(contraction);
            i += consumed;
            continue;
        }
        match char_category(chars[i]) {
            CharCategory::Space => i += 1,
            CharCategory::Numeric => {
                pieces.push(chars[i].to_string());
                i += 1;
            }
            cat => {
                let start = i;
                while i < len && char_category(chars[i]) == cat {
                    i += 1;
                }
                pieces.push(chars[start..i].iter().collect());
            }
        }
    }

    pieces
}

/// Match `'s 't 'm 'd 're 've 'll` at position `i`. Returns the contraction
/// and the number of chars consumed.
fn try_contraction(chars: &[char], i: usize) -> Option<(String, usize)> {
    if chars.get(i) != Some(&'\'') {
        return None;
    }
    let next = *chars.get(i + 1)?;
    if matches!(next, 's' | 't' | 'm' | 'd') {
        return Some((chars[i..i + 2].iter().collect(), 2));
    }
    let next2 = *chars.get(i + 2)?;
    match (next, next2) {
        ('r', 'e') | ('v', 'e') | ('l', 'l') => Some((chars[i..i + 3].iter().collect(), 3)),
        _ => None,
    }
}
