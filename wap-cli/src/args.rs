use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Example of a trained checkpoint to try.
const DEFAULT_MODEL: &str = "./wap-crohme.safetensors";

/// Vocabulary file: one LaTeX token per line.
const DEFAULT_VOCAB: &str = "./latex_vocab.txt";

#[derive(Clone, Debug, Parser)]
/// Simple commandline interface to the WAP handwritten-equation recognizer
pub struct Args {
    /// Model filename (must be in SafeTensors format)
    #[arg(short = 'm', long, default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Vocabulary filename
    #[arg(short = 'v', long, default_value = DEFAULT_VOCAB)]
    pub vocab: String,

    /// Image of a handwritten equation to translate
    #[arg(short = 'i', long)]
    pub image: PathBuf,

    /// Number of threads to use when evaluating the model. 0 means one per logical core.
    #[arg(long, default_value_t = 0)]
    pub max_eval_threads: usize,

    /// Directory to write one attention-overlay PNG per decoded token.
    #[arg(long)]
    pub dump_attention: Option<PathBuf>,

    /// Upsampling used when stretching attention maps to image resolution.
    #[arg(long, value_enum, default_value_t = AttentionScale::Bilinear)]
    pub attention_scale: AttentionScale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum AttentionScale {
    Nearest,
    Bilinear,
}

impl From<AttentionScale> for wap::attention::Upsample {
    fn from(scale: AttentionScale) -> Self {
        match scale {
            AttentionScale::Nearest => Self::Nearest,
            AttentionScale::Bilinear => Self::Bilinear,
        }
    }
}
