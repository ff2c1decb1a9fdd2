/// Model hyperparameters and validation.
pub mod config;

/// Model structure (watcher, embedder, parser) and initialization.
pub mod model;

/// Forward math for the model components.
pub mod model_impls;

/// Decode loop (teacher forcing / greedy) and the masked training loss.
pub mod decode;

/// Reconstructing per-step attention maps at image resolution.
pub mod attention;

/// LaTeX token vocabulary.
pub mod vocab;

/// Validation bookkeeping: running averages and token error rate.
pub mod metric;

/// Model plus vocabulary, the inference entry point.
pub mod context;

/// Functions related to loading checkpoints.
pub mod loader;

/// Utility functions.
pub mod util;
