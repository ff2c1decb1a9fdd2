use anyhow::{ensure, Result};

/// Hyperparameters for the WAP model. Immutable once validated; every
/// per-layer list must have exactly `num_layers` entries.
#[derive(Debug, Clone, PartialEq)]
pub struct WapConfig {
    /// Channels in the input image (1 for grayscale).
    pub input_channels: usize,
    /// Input image spatial size as (height, width).
    pub input_dims: (usize, usize),
    /// Number of conv blocks in the watcher.
    pub num_layers: usize,
    /// Output channels per conv block. The last entry is D, the feature
    /// dimension attended over by the parser. Must be divisible by 4 for
    /// the 2-D positional encoding's channel quarters.
    pub num_features_map: Vec<usize>,
    /// Square conv kernel size per block.
    pub feature_kernel_size: Vec<usize>,
    pub feature_kernel_stride: Vec<usize>,
    pub feature_padding: Vec<usize>,
    /// Whether a batch-norm step follows the conv in each block.
    pub batch_norm: Vec<bool>,
    /// Max-pool kernel per block; None skips pooling for that block.
    pub feature_pooling_kernel_size: Vec<Option<usize>>,
    pub feature_pooling_stride: Vec<usize>,
    /// Spatial size (H', W') of the watcher output. Checked against what
    /// the conv stack actually produces.
    pub output_dim: (usize, usize),
    pub embedding_dim: usize,
    pub hidden_dim: usize,
    pub cell_dim: usize,
    pub vocab_size: usize,
    /// Hard cap on decode steps per sequence.
    pub max_len: usize,
}

impl WapConfig {
    /// The architecture used for the CROHME handwritten-math dataset:
    /// four conv blocks, each halving the spatial size through pooling.
    pub fn crohme(vocab_size: usize) -> Self {
        Self {
            input_channels: 1,
            input_dims: (128, 512),
            num_layers: 4,
            num_features_map: vec![32, 64, 64, 128],
            feature_kernel_size: vec![3, 3, 3, 3],
            feature_kernel_stride: vec![1, 1, 1, 1],
            feature_padding: vec![1, 1, 1, 1],
            batch_norm: vec![true, true, true, true],
            feature_pooling_kernel_size: vec![Some(2), Some(2), Some(2), Some(2)],
            feature_pooling_stride: vec![2, 2, 2, 2],
            output_dim: (8, 32),
            embedding_dim: 256,
            hidden_dim: 256,
            cell_dim: 256,
            vocab_size,
            max_len: 150,
        }
    }

    /// Feature dimension D (channels of the last conv block).
    pub fn feature_dim(&self) -> usize {
        *self
            .num_features_map
            .last()
            .expect("Validated config has at least one layer")
    }

    /// Number of attended spatial locations L = H' * W'.
    pub fn num_locations(&self) -> usize {
        self.output_dim.0 * self.output_dim.1
    }

    /// Spatial size actually produced by folding the configured conv and
    /// pooling stack over the input dims.
    pub fn conv_stack_output(&self) -> (usize, usize) {
        let fold = |mut len: usize| {
            for i in 0..self.num_layers {
                let (k, s, p) = (
                    self.feature_kernel_size[i],
                    self.feature_kernel_stride[i],
                    self.feature_padding[i],
                );
                len = (len + 2 * p - k) / s + 1;
                if let Some(pk) = self.feature_pooling_kernel_size[i] {
                    len = (len - pk) / self.feature_pooling_stride[i] + 1;
                }
            }
            len
        };
        (fold(self.input_dims.0), fold(self.input_dims.1))
    }

    /// Fail fast on an inconsistent configuration. Called by every model
    /// construction path; nothing downstream re-checks these.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.num_layers > 0, "Watcher needs at least one layer");
        let lists = [
            ("num_features_map", self.num_features_map.len()),
            ("feature_kernel_size", self.feature_kernel_size.len()),
            ("feature_kernel_stride", self.feature_kernel_stride.len()),
            ("feature_padding", self.feature_padding.len()),
            ("batch_norm", self.batch_norm.len()),
            (
                "feature_pooling_kernel_size",
                self.feature_pooling_kernel_size.len(),
            ),
            ("feature_pooling_stride", self.feature_pooling_stride.len()),
        ];
        for (name, len) in lists {
            ensure!(
                len == self.num_layers,
                "Config list {name} has {len} entries, expected num_layers = {}",
                self.num_layers
            );
        }
        let d = self.feature_dim();
        ensure!(
            d % 4 == 0,
            "Feature dimension {d} must be divisible by 4 for 2-D positional encoding"
        );
        let produced = self.conv_stack_output();
        ensure!(
            produced == self.output_dim,
            "output_dim {:?} disagrees with conv stack output {:?}",
            self.output_dim,
            produced
        );
        // The LSTM threads a single state width; W_3/W_4 sizes assume it too.
        ensure!(
            self.cell_dim == self.hidden_dim,
            "cell_dim {} must equal hidden_dim {}",
            self.cell_dim,
            self.hidden_dim
        );
        ensure!(self.vocab_size > 4, "Vocabulary has no non-reserved tokens");
        ensure!(self.max_len > 0, "max_len must be positive");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crohme_config_is_valid() {
        let config = WapConfig::crohme(120);
        config.validate().unwrap();
        assert_eq!(config.feature_dim(), 128);
        assert_eq!(config.num_locations(), 8 * 32);
    }

    #[test]
    fn mismatched_layer_lists_rejected() {
        let mut config = WapConfig::crohme(120);
        config.feature_kernel_size.pop();
        assert!(config.validate().is_err());
    }

    #[test]
    fn feature_dim_must_be_divisible_by_four() {
        let mut config = WapConfig::crohme(120);
        config.num_features_map[3] = 126;
        assert!(config.validate().is_err());
    }

    #[test]
    fn output_dim_checked_against_stack() {
        let mut config = WapConfig::crohme(120);
        config.output_dim = (9, 32);
        assert!(config.validate().is_err());
    }

    #[test]
    fn cell_dim_must_match_hidden_dim() {
        let mut config = WapConfig::crohme(120);
        config.cell_dim = 128;
        assert!(config.validate().is_err());
    }
}
