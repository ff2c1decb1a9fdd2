#![allow(clippy::upper_case_acronyms)]
use anyhow::{ensure, Result};
use ndarray::{concatenate, s, Array2, Array3, Array4, Axis, Zip};

use crate::{
    model::*,
    util::{sigmoid, softmax_rows, ReqOps},
};

fn fl<T: ReqOps>(v: f64) -> T {
    T::from_f64(v).expect("Impossible: float conversion failed")
}

/// Fixed 2-D sinusoidal positional encoding of shape (D, H', W').
///
/// The channel axis splits into four quarters: channels {2i, 2i+1} carry
/// sin/cos of the first spatial axis at frequency 10000^(4i/D), channels
/// {2i + D/2, 2i + 1 + D/2} the same for the second axis. Depends only on
/// the configuration, so it is computed once at construction.
pub fn positional_encoding<T: ReqOps>(d: usize, height: usize, width: usize) -> Array3<T> {
    assert_eq!(d % 4, 0, "Feature dimension must be divisible by 4");
    let mut pe = Array3::zeros((d, height, width));
    for i in 0..d / 4 {
        let freq = 10000f64.powf(4.0 * i as f64 / d as f64);
        for x in 0..height {
            let v = x as f64 * freq;
            for y in 0..width {
                pe[[2 * i, x, y]] = fl(v.sin());
                pe[[2 * i + 1, x, y]] = fl(v.cos());
            }
        }
        for y in 0..width {
            let v = y as f64 * freq;
            for x in 0..height {
                pe[[2 * i + d / 2, x, y]] = fl(v.sin());
                pe[[2 * i + 1 + d / 2, x, y]] = fl(v.cos());
            }
        }
    }
    pe
}

impl<T: ReqOps> Linear<T> {
    /// (batch, in) -> (batch, out).
    pub fn forward(&self, x: &Array2<T>) -> Array2<T> {
        let out = x.dot(&self.weight.t());
        match &self.bias {
            Some(b) => out + b,
            None => out,
        }
    }
}

impl<T: ReqOps> LstmCell<T> {
    /// One recurrent update. x is (batch, embedding + hidden); returns the
    /// new (h, c).
    pub fn step(&self, x: &Array2<T>, h: &Array2<T>, c: &Array2<T>) -> (Array2<T>, Array2<T>) {
        let hidden = self.weight_hh.shape()[1];
        let gates = x.dot(&self.weight_ih.t()) + h.dot(&self.weight_hh.t())
            + &self.bias_ih
            + &self.bias_hh;

        let i = sigmoid(gates.slice(s![.., 0..hidden]).to_owned());
        let f = sigmoid(gates.slice(s![.., hidden..2 * hidden]).to_owned());
        let g = gates
            .slice(s![.., 2 * hidden..3 * hidden])
            .mapv(|el| el.tanh());
        let o = sigmoid(gates.slice(s![.., 3 * hidden..4 * hidden]).to_owned());

        let c_new = f * c + i * g;
        let h_new = o * c_new.mapv(|el| el.tanh());
        (h_new, c_new)
    }
}

impl<T: ReqOps> BatchNorm<T> {
    /// Per-channel inference normalization on a (B, C, H, W) volume.
    pub fn forward(&self, mut x: Array4<T>) -> Array4<T> {
        let channels = x.shape()[1];
        for ci in 0..channels {
            let scale = self.weight[ci] / (self.running_var[ci] + self.eps).sqrt();
            let shift = self.bias[ci] - self.running_mean[ci] * scale;
            x.slice_mut(s![.., ci, .., ..])
                .mapv_inplace(|el| el * scale + shift);
        }
        x
    }
}

/// Plain strided 2-D convolution with zero padding.
fn conv2d<T: ReqOps>(
    input: &Array4<T>,
    weight: &Array4<T>,
    bias: &ndarray::Array1<T>,
    stride: usize,
    padding: usize,
) -> Array4<T> {
    let (batch, in_channels, in_h, in_w) = input.dim();
    let (out_channels, _, k, _) = weight.dim();
    let out_h = (in_h + 2 * padding - k) / stride + 1;
    let out_w = (in_w + 2 * padding - k) / stride + 1;

    let mut out = Array4::zeros((batch, out_channels, out_h, out_w));
    Zip::indexed(out.view_mut()).par_for_each(|(bi, co, oy, ox), el| {
        let mut acc = bias[co];
        for ci in 0..in_channels {
            for ky in 0..k {
                let iy = oy * stride + ky;
                if iy < padding || iy - padding >= in_h {
                    continue;
                }
                for kx in 0..k {
                    let ix = ox * stride + kx;
                    if ix < padding || ix - padding >= in_w {
                        continue;
                    }
                    acc = acc
                        + input[[bi, ci, iy - padding, ix - padding]] * weight[[co, ci, ky, kx]];
                }
            }
        }
        *el = acc;
    });
    out
}

/// Spatial max-pooling.
fn max_pool2d<T: ReqOps>(input: &Array4<T>, kernel: usize, stride: usize) -> Array4<T> {
    let (batch, channels, in_h, in_w) = input.dim();
    let out_h = (in_h - kernel) / stride + 1;
    let out_w = (in_w - kernel) / stride + 1;

    let mut out = Array4::zeros((batch, channels, out_h, out_w));
    Zip::indexed(out.view_mut()).par_for_each(|(bi, ci, oy, ox), el| {
        let mut acc = T::neg_infinity();
        for ky in 0..kernel {
            for kx in 0..kernel {
                acc = acc.max(input[[bi, ci, oy * stride + ky, ox * stride + kx]]);
            }
        }
        *el = acc;
    });
    out
}

impl<T: ReqOps> ConvBlock<T> {
    pub fn forward(&self, x: &Array4<T>) -> Array4<T> {
        let mut x = conv2d(x, &self.weight, &self.bias, self.stride, self.padding);
        if let Some(norm) = &self.norm {
            x = norm.forward(x);
        }
        x.mapv_inplace(|el| el.max(T::zero()));
        if let Some((kernel, stride)) = self.pool {
            x = max_pool2d(&x, kernel, stride);
        }
        x
    }
}

impl<T: ReqOps> Watcher<T> {
    /// (B, input_channels, H, W) -> (B, D, H', W').
    pub fn forward(&self, images: &Array4<T>) -> Array4<T> {
        let mut x = self.blocks[0].forward(images);
        for block in &self.blocks[1..] {
            x = block.forward(&x);
        }
        x
    }
}

impl<T: ReqOps> Embedder<T> {
    /// (batch,) token IDs -> (batch, embedding_dim). Out-of-vocabulary IDs
    /// are a caller bug and panic like any other index error.
    pub fn forward(&self, y: &ndarray::Array1<usize>) -> Array2<T> {
        let mut out = Array2::zeros((y.len(), self.weight.shape()[1]));
        for (mut row, &id) in out.rows_mut().into_iter().zip(y.iter()) {
            row.assign(&self.weight.row(id));
        }
        out
    }
}

impl<T: ReqOps> Parser<T> {
    /// Initial decoder state for a sequence: h and c from the spatially
    /// averaged features through affine+tanh, o zeroed, y at sos.
    pub fn init_state(&self, x: &Array3<T>) -> DecoderState<T> {
        let mean = x
            .mean_axis(Axis(2))
            .expect("Impossible: empty feature volume");
        let h = self.init_hidden.forward(&mean).mapv(|el| el.tanh());
        let c = self.init_cell.forward(&mean).mapv(|el| el.tanh());
        let batch = x.shape()[0];
        let hidden = h.shape()[1];
        DecoderState::fresh(h, c, batch, hidden)
    }
}

impl<T: ReqOps> Wap<T> {
    /// Run the watcher and positional encoding, flattening the feature
    /// volume to the (B, D, L) sequence the parser attends over.
    pub fn watch(&self, images: &Array4<T>) -> Result<Array3<T>> {
        let (batch, channels, in_h, in_w) = images.dim();
        ensure!(
            channels == self.config.input_channels
                && (in_h, in_w) == self.config.input_dims,
            "Image batch shape ({channels}, {in_h}, {in_w}) does not match configured ({}, {:?})",
            self.config.input_channels,
            self.config.input_dims,
        );
        let features = self.watcher.forward(images);
        let x = features + &self.positional.view().insert_axis(Axis(0));
        let (d, l) = (self.config.feature_dim(), self.config.num_locations());
        Ok(x.into_shape((batch, d, l))?)
    }

    /// One parser step. Consumes the previous state, returns the token
    /// distribution, the attention weights over the L locations, and the
    /// next state. `y` in the returned state is untouched; the decode
    /// loop decides what to feed next.
    pub fn parse(
        &self,
        x: &Array3<T>,
        state: &DecoderState<T>,
    ) -> (Array2<T>, Array2<T>, DecoderState<T>) {
        let (batch, _, locations) = x.dim();

        let w = self.embedder.forward(&state.y);
        let input = concatenate![Axis(1), w, state.o];
        let (h, c) = self.parser.lstm.step(&input, &state.h, &state.c);

        // e_l = tanh(W_1 h + W_2 x_l), broadcast over the L locations.
        let query = self.parser.attn_query.forward(&h);
        let key_weight = self.parser.attn_key.weight.row(0);
        let key_bias = self
            .parser
            .attn_key
            .bias
            .as_ref()
            .map(|b| b[0])
            .unwrap_or_else(T::zero);
        let mut keys = Array2::zeros((batch, locations));
        Zip::indexed(keys.view_mut()).par_for_each(|(bi, li), el| {
            *el = x.slice(s![bi, .., li]).dot(&key_weight) + key_bias;
        });
        let scores = (query + keys).mapv(|el| el.tanh());
        let alpha = softmax_rows(&scores);

        // Context: attention-weighted sum of the spatial features.
        let mut ctx = Array2::zeros((batch, x.shape()[1]));
        Zip::indexed(ctx.view_mut()).par_for_each(|(bi, di), el| {
            *el = x.slice(s![bi, di, ..]).dot(&alpha.row(bi));
        });

        let o = self
            .parser
            .fusion
            .forward(&concatenate![Axis(1), h, ctx])
            .mapv(|el| el.tanh());
        let probs = softmax_rows(&self.parser.output.forward(&o));

        let next = DecoderState {
            h,
            c,
            o,
            y: state.y.clone(),
        };
        (probs, alpha, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing::{tiny_config, tiny_model};
    use ndarray::{array, Array1, Array4};

    #[test]
    fn positional_encoding_pins_sin_cos_pairs() {
        let pe = positional_encoding::<f64>(8, 2, 2);
        // Channel 0 at x=1: sin(1 * 10000^0) = sin(1); channel 1: cos(1).
        assert!((pe[[0, 1, 0]] - 1f64.sin()).abs() < 1e-12);
        assert!((pe[[1, 1, 0]] - 1f64.cos()).abs() < 1e-12);
        // Second-axis half at y=1.
        assert!((pe[[4, 0, 1]] - 1f64.sin()).abs() < 1e-12);
        assert!((pe[[5, 0, 1]] - 1f64.cos()).abs() < 1e-12);
        // Position zero encodes as sin(0)=0 / cos(0)=1.
        assert_eq!(pe[[0, 0, 0]], 0.0);
        assert_eq!(pe[[1, 0, 0]], 1.0);
    }

    #[test]
    fn conv2d_known_values() {
        // 1x1x2x2 input, identity-ish 1x1 kernel with bias.
        let input = Array4::from_shape_vec((1, 1, 2, 2), vec![1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let weight = Array4::from_shape_vec((1, 1, 1, 1), vec![2.0f32]).unwrap();
        let bias = Array1::from(vec![0.5f32]);
        let out = conv2d(&input, &weight, &bias, 1, 0);
        assert_eq!(out.dim(), (1, 1, 2, 2));
        assert_eq!(out[[0, 0, 1, 1]], 8.5);
    }

    #[test]
    fn conv2d_padding_and_stride() {
        // 3x3 ones kernel over 3x3 ones input, pad 1, stride 2: corners of
        // the padded product see a 2x2 window.
        let input = Array4::from_elem((1, 1, 3, 3), 1.0f32);
        let weight = Array4::from_elem((1, 1, 3, 3), 1.0f32);
        let bias = Array1::zeros(1);
        let out = conv2d(&input, &weight, &bias, 2, 1);
        assert_eq!(out.dim(), (1, 1, 2, 2));
        assert_eq!(out[[0, 0, 0, 0]], 4.0);
    }

    #[test]
    fn max_pool_picks_window_max() {
        let input =
            Array4::from_shape_vec((1, 1, 2, 4), vec![1.0f32, 5.0, 2.0, 0.0, 3.0, 4.0, 9.0, 1.0])
                .unwrap();
        let out = max_pool2d(&input, 2, 2);
        assert_eq!(out.dim(), (1, 1, 1, 2));
        assert_eq!(out[[0, 0, 0, 0]], 5.0);
        assert_eq!(out[[0, 0, 0, 1]], 9.0);
    }

    #[test]
    fn batch_norm_default_params_are_identity() {
        let norm = BatchNorm {
            weight: Array1::ones(1),
            bias: Array1::zeros(1),
            running_mean: Array1::zeros(1),
            running_var: Array1::ones(1),
            eps: 0.0f32,
        };
        let input = Array4::from_shape_vec((1, 1, 1, 2), vec![3.0f32, -2.0]).unwrap();
        assert_eq!(norm.forward(input.clone()), input);
    }

    #[test]
    fn lstm_step_shapes_and_bounds() {
        let model = tiny_model(3);
        let config = tiny_config();
        let batch = 2;
        let x = Array2::from_elem((batch, config.embedding_dim + config.hidden_dim), 0.1f32);
        let h = Array2::zeros((batch, config.hidden_dim));
        let c = Array2::zeros((batch, config.hidden_dim));
        let (h_new, c_new) = model.parser.lstm.step(&x, &h, &c);
        assert_eq!(h_new.dim(), (batch, config.hidden_dim));
        assert_eq!(c_new.dim(), (batch, config.hidden_dim));
        // h = o * tanh(c) stays in (-1, 1).
        assert!(h_new.iter().all(|v| v.abs() < 1.0));
    }

    #[test]
    fn watch_produces_flattened_sequence() {
        let model = tiny_model(4);
        let config = tiny_config();
        let images = Array4::from_elem((2, 1, 8, 8), 0.5f32);
        let x = model.watch(&images).unwrap();
        assert_eq!(x.dim(), (2, config.feature_dim(), config.num_locations()));
    }

    #[test]
    fn watch_rejects_wrong_image_shape() {
        let model = tiny_model(4);
        let images = Array4::from_elem((1, 1, 8, 9), 0.5f32);
        assert!(model.watch(&images).is_err());
    }

    #[test]
    fn parse_step_distributions_normalize() {
        let model = tiny_model(5);
        let config = tiny_config();
        let images = Array4::from_elem((2, 1, 8, 8), 0.25f32);
        let x = model.watch(&images).unwrap();
        let state = model.parser.init_state(&x);
        let (probs, alpha, next) = model.parse(&x, &state);

        assert_eq!(probs.dim(), (2, config.vocab_size));
        assert_eq!(alpha.dim(), (2, config.num_locations()));
        for row in probs.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
        for row in alpha.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
        assert_eq!(next.y, state.y);
        assert_ne!(next.h, state.h);
    }

    #[test]
    fn embedder_pads_to_zero_vector() {
        let model = tiny_model(6);
        let out = model.embedder.forward(&array![0usize, 4]);
        assert!(out.row(0).iter().all(|v| *v == 0.0));
        assert!(out.row(1).iter().any(|v| *v != 0.0));
    }
}
