#![allow(clippy::upper_case_acronyms)]
use anyhow::Result;
use ndarray::{Array1, Array2, Array3, Array4};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{config::WapConfig, util::ReqOps, vocab::SOS_TOKEN};

/// A dense projection y = x W^T (+ b).
/// Corresponds to: `parser.w_*.{weight,bias}` in a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Linear<T> {
    /// (out_features, in_features), torch layout.
    pub weight: Array2<T>,
    pub bias: Option<Array1<T>>,
}

/// Single-step LSTM cell, torch gate order (input, forget, cell, output).
/// Corresponds to: `parser.lstm.{weight_ih,weight_hh,bias_ih,bias_hh}`.
#[derive(Debug, Clone, PartialEq)]
pub struct LstmCell<T> {
    /// (4 * hidden, embedding + hidden)
    pub weight_ih: Array2<T>,
    /// (4 * hidden, hidden)
    pub weight_hh: Array2<T>,
    pub bias_ih: Array1<T>,
    pub bias_hh: Array1<T>,
}

/// Inference-mode batch normalization over the channel axis.
/// Corresponds to: `watcher.bn{i}.{weight,bias,running_mean,running_var}`.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNorm<T> {
    pub weight: Array1<T>,
    pub bias: Array1<T>,
    pub running_mean: Array1<T>,
    pub running_var: Array1<T>,
    pub eps: T,
}

/// One watcher stage: conv, optional batch-norm, relu, optional max-pool.
/// Corresponds to: `watcher.conv{i}.{weight,bias}` plus the BatchNorm keys.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvBlock<T> {
    /// (out_channels, in_channels, k, k)
    pub weight: Array4<T>,
    pub bias: Array1<T>,
    pub stride: usize,
    pub padding: usize,
    pub norm: Option<BatchNorm<T>>,
    /// (kernel, stride) of the trailing max-pool, if any.
    pub pool: Option<(usize, usize)>,
}

/// The convolutional feature extractor.
#[derive(Debug, Clone, PartialEq)]
pub struct Watcher<T> {
    pub blocks: Vec<ConvBlock<T>>,
}

/// Token-ID to dense-vector table. Row 0 is the padding token and stays
/// all zeros.
/// Corresponds to: `embedder.weight`.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedder<T> {
    /// (vocab_size, embedding_dim)
    pub weight: Array2<T>,
}

/// The attention decoder. Every projection the step uses, by name — the
/// keys are always present so a mapping would only obscure them.
#[derive(Debug, Clone, PartialEq)]
pub struct Parser<T> {
    /// W_h: D -> hidden, initializes h from the mean feature.
    pub init_hidden: Linear<T>,
    /// W_c: D -> hidden, initializes c from the mean feature.
    pub init_cell: Linear<T>,
    pub lstm: LstmCell<T>,
    /// W_1: hidden -> L, hidden-state half of the attention score.
    pub attn_query: Linear<T>,
    /// W_2: D -> 1, per-location half of the attention score.
    pub attn_key: Linear<T>,
    /// W_3: hidden + D -> hidden, no bias, fuses hidden state and context.
    pub fusion: Linear<T>,
    /// W_4: hidden -> vocab, no bias.
    pub output: Linear<T>,
}

/// The full Watch-Attend-Parse model.
#[derive(Debug, Clone, PartialEq)]
pub struct Wap<T> {
    pub watcher: Watcher<T>,
    /// Fixed 2-D sinusoidal encoding (D, H', W'), computed once from the
    /// config and added to every feature volume.
    pub positional: Array3<T>,
    pub embedder: Embedder<T>,
    pub parser: Parser<T>,
    pub config: WapConfig,
}

/// State threaded across decode steps: one value in, one value out per
/// step, so the step function stays pure.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderState<T> {
    /// (batch, hidden)
    pub h: Array2<T>,
    /// (batch, hidden)
    pub c: Array2<T>,
    /// (batch, hidden) previous output context, zeros before step 0.
    pub o: Array2<T>,
    /// (batch,) token fed at the upcoming step.
    pub y: Array1<usize>,
}

impl<T: ReqOps> DecoderState<T> {
    /// The parser derives h/c from the features; this only covers o and y.
    pub(crate) fn fresh(h: Array2<T>, c: Array2<T>, batch: usize, hidden: usize) -> Self {
        Self {
            h,
            c,
            o: Array2::zeros((batch, hidden)),
            y: Array1::from_elem(batch, SOS_TOKEN),
        }
    }
}

fn uniform<T: ReqOps>(rng: &mut StdRng, bound: f64) -> T {
    T::from_f64(rng.gen_range(-bound..bound)).expect("Impossible: float conversion failed")
}

fn rand_array1<T: ReqOps>(rng: &mut StdRng, len: usize, bound: f64) -> Array1<T> {
    Array1::from_shape_simple_fn(len, || uniform(rng, bound))
}

fn rand_array2<T: ReqOps>(rng: &mut StdRng, shape: (usize, usize), bound: f64) -> Array2<T> {
    Array2::from_shape_simple_fn(shape, || uniform(rng, bound))
}

impl<T: ReqOps> Linear<T> {
    fn init(rng: &mut StdRng, out_features: usize, in_features: usize, bias: bool) -> Self {
        let bound = 1.0 / (in_features as f64).sqrt();
        Self {
            weight: rand_array2(rng, (out_features, in_features), bound),
            bias: bias.then(|| rand_array1(rng, out_features, bound)),
        }
    }
}

impl<T: ReqOps> Wap<T> {
    /// Build a model with fresh (seeded) weights from a validated config.
    /// Loading a trained checkpoint goes through [crate::loader] instead.
    pub fn new(config: WapConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);

        let mut blocks = Vec::with_capacity(config.num_layers);
        let mut in_channels = config.input_channels;
        for i in 0..config.num_layers {
            let out_channels = config.num_features_map[i];
            let k = config.feature_kernel_size[i];
            let bound = 1.0 / ((in_channels * k * k) as f64).sqrt();
            blocks.push(ConvBlock {
                weight: Array4::from_shape_simple_fn((out_channels, in_channels, k, k), || {
                    uniform(&mut rng, bound)
                }),
                bias: rand_array1(&mut rng, out_channels, bound),
                stride: config.feature_kernel_stride[i],
                padding: config.feature_padding[i],
                norm: config.batch_norm[i].then(|| BatchNorm {
                    weight: Array1::ones(out_channels),
                    bias: Array1::zeros(out_channels),
                    running_mean: Array1::zeros(out_channels),
                    running_var: Array1::ones(out_channels),
                    eps: T::from_f64(1e-5).expect("Impossible: float conversion failed"),
                }),
                pool: config.feature_pooling_kernel_size[i]
                    .map(|pk| (pk, config.feature_pooling_stride[i])),
            });
            in_channels = out_channels;
        }

        let d = config.feature_dim();
        let l = config.num_locations();
        let hidden = config.hidden_dim;
        let emb_bound = 0.1;
        let mut embedder = Embedder {
            weight: rand_array2(&mut rng, (config.vocab_size, config.embedding_dim), emb_bound),
        };
        // Padding embedding is fixed at zero and gets no gradient.
        embedder.weight.row_mut(0).fill(T::zero());

        let lstm_bound = 1.0 / (hidden as f64).sqrt();
        let parser = Parser {
            init_hidden: Linear::init(&mut rng, hidden, d, true),
            init_cell: Linear::init(&mut rng, hidden, d, true),
            lstm: LstmCell {
                weight_ih: rand_array2(
                    &mut rng,
                    (4 * hidden, config.embedding_dim + hidden),
                    lstm_bound,
                ),
                weight_hh: rand_array2(&mut rng, (4 * hidden, hidden), lstm_bound),
                bias_ih: rand_array1(&mut rng, 4 * hidden, lstm_bound),
                bias_hh: rand_array1(&mut rng, 4 * hidden, lstm_bound),
            },
            attn_query: Linear::init(&mut rng, l, hidden, true),
            attn_key: Linear::init(&mut rng, 1, d, true),
            fusion: Linear::init(&mut rng, hidden, hidden + d, false),
            output: Linear::init(&mut rng, config.vocab_size, hidden, false),
        };

        Ok(Self {
            watcher: Watcher { blocks },
            positional: crate::model_impls::positional_encoding(
                d,
                config.output_dim.0,
                config.output_dim.1,
            ),
            embedder,
            parser,
            config,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A model small enough for the step/decode tests to run instantly:
    /// 8x8 grayscale input, one conv block, D = 8, L = 16.
    pub(crate) fn tiny_config() -> WapConfig {
        WapConfig {
            input_channels: 1,
            input_dims: (8, 8),
            num_layers: 1,
            num_features_map: vec![8],
            feature_kernel_size: vec![3],
            feature_kernel_stride: vec![1],
            feature_padding: vec![1],
            batch_norm: vec![false],
            feature_pooling_kernel_size: vec![Some(2)],
            feature_pooling_stride: vec![2],
            output_dim: (4, 4),
            embedding_dim: 6,
            hidden_dim: 10,
            cell_dim: 10,
            vocab_size: 9,
            max_len: 7,
        }
    }

    pub(crate) fn tiny_model(seed: u64) -> Wap<f32> {
        Wap::new(tiny_config(), seed).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn construction_is_deterministic_per_seed() {
        assert_eq!(tiny_model(7), tiny_model(7));
        assert_ne!(tiny_model(7), tiny_model(8));
    }

    #[test]
    fn padding_embedding_is_zero() {
        let model = tiny_model(1);
        assert!(model.embedder.weight.row(0).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn invalid_config_fails_construction() {
        let mut config = tiny_config();
        config.batch_norm.push(true);
        assert!(Wap::<f32>::new(config, 0).is_err());
    }

    #[test]
    fn parser_shapes_follow_config() {
        let model = tiny_model(2);
        let config = tiny_config();
        assert_eq!(
            model.parser.attn_query.weight.dim(),
            (config.num_locations(), config.hidden_dim)
        );
        assert_eq!(
            model.parser.fusion.weight.dim(),
            (config.hidden_dim, config.hidden_dim + config.feature_dim())
        );
        assert!(model.parser.fusion.bias.is_none());
        assert!(model.parser.output.bias.is_none());
    }
}
