use std::collections::HashMap;
use std::path::Path;

use anyhow::{ensure, Result};

/// Reserved token IDs. Everything loaded from a vocabulary file starts
/// after these.
pub const PAD_TOKEN: usize = 0;
pub const UNK_TOKEN: usize = 1;
pub const SOS_TOKEN: usize = 2;
pub const EOS_TOKEN: usize = 3;

const NUM_RESERVED: usize = 4;

/// LaTeX token table. Maps whitespace-delimited LaTeX tokens (`\frac`,
/// `x`, `+`, ...) to dense integer IDs and back.
#[derive(Debug, Clone)]
pub struct Vocab {
    word_to_index: HashMap<String, usize>,
    index_to_word: Vec<String>,
}

impl Vocab {
    /// Build from an ordered token list. Duplicates are a caller error.
    pub fn new<S: AsRef<str>, I: IntoIterator<Item = S>>(tokens: I) -> Result<Self> {
        let mut index_to_word = vec![
            "<pad>".to_string(),
            "<unk>".to_string(),
            "<sos>".to_string(),
            "<eos>".to_string(),
        ];
        let mut word_to_index = HashMap::new();
        for tok in tokens {
            let tok = tok.as_ref();
            ensure!(
                !word_to_index.contains_key(tok),
                "Duplicate vocabulary token: {tok}"
            );
            word_to_index.insert(tok.to_string(), index_to_word.len());
            index_to_word.push(tok.to_string());
        }
        ensure!(
            index_to_word.len() > NUM_RESERVED,
            "Vocabulary file contained no tokens"
        );
        Ok(Self {
            word_to_index,
            index_to_word,
        })
    }

    /// Load from a file with one token per line; blank lines are skipped.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::new(data.lines().map(str::trim).filter(|l| !l.is_empty()))
    }

    /// Total number of IDs, reserved ones included. This is the model's
    /// vocab_size.
    pub fn len(&self) -> usize {
        self.index_to_word.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index_to_word.is_empty()
    }

    pub fn token_id(&self, token: &str) -> usize {
        self.word_to_index
            .get(token)
            .copied()
            .unwrap_or(UNK_TOKEN)
    }

    pub fn token(&self, id: usize) -> Option<&str> {
        self.index_to_word.get(id).map(String::as_str)
    }

    /// Encode a ground-truth label into IDs, without sos/eos framing.
    /// Unknown tokens map to `UNK_TOKEN`.
    pub fn encode(&self, label: &str) -> Vec<usize> {
        label
            .split_whitespace()
            .map(|tok| self.token_id(tok))
            .collect()
    }

    /// Render an ID sequence as a LaTeX string: pad and sos are skipped,
    /// decoding stops at the first eos, tokens are joined by single
    /// spaces.
    pub fn convert_to_string(&self, ids: &[usize]) -> String {
        let mut out = String::new();
        for &id in ids {
            if id == PAD_TOKEN || id == SOS_TOKEN {
                continue;
            }
            if id == EOS_TOKEN {
                break;
            }
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(self.token(id).unwrap_or("<unk>"));
        }
        out
    }
}
