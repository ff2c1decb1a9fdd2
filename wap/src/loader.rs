use std::{
    collections::HashMap,
    ops::{Deref, DerefMut},
};

use anyhow::{anyhow, bail, ensure, Error, Ok, Result};
use ndarray::Axis;
use safetensors::{tensor as st, SafeTensors};
use tracing::info;

use crate::{
    config::WapConfig,
    model::{BatchNorm, ConvBlock, Embedder, Linear, LstmCell, Parser, Wap, Watcher},
    model_impls::positional_encoding,
    util::ConvertTensor,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorType {
    BFloat16,
    Float32,
}

#[derive(Clone)]
pub struct TensorData<'a> {
    pub name: String,
    pub dtype: TensorType,
    pub shape: Vec<usize>,
    pub data: &'a [u8],
}

#[derive(Clone)]
pub struct TensorDataMap<'a>(pub HashMap<String, TensorData<'a>>);

impl<'a> Deref for TensorDataMap<'a> {
    type Target = HashMap<String, TensorData<'a>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'a> DerefMut for TensorDataMap<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// This trait implementation converts a tuple of SafeTensors metadata
/// plus slice of bytes to a [TensorDataMap] which can be used to load the
/// model.
impl<'a> TryFrom<(st::Metadata, &'a [u8])> for TensorDataMap<'a> {
    type Error = Error;

    fn try_from((metadata, data): (st::Metadata, &'a [u8])) -> Result<Self, Self::Error> {
        Ok(Self(
            metadata
                .tensors()
                .into_iter()
                .map(|(name, ti)| {
                    let (dtype, isize) = match ti.dtype {
                        st::Dtype::BF16 => (TensorType::BFloat16, 2),
                        st::Dtype::F32 => (TensorType::Float32, 4),
                        dt => bail!("Unsupported tensor type {dt:?} for {name}"),
                    };
                    let (soffs, eoffs) = ti.data_offsets;
                    let bcount: usize = ti.shape.iter().product::<usize>() * isize;
                    ensure!(bcount == (eoffs - soffs), "Unexpected tensor length.");

                    Ok((
                        name.clone(),
                        TensorData {
                            name,
                            dtype,
                            shape: ti.shape.clone(),
                            data: &data[soffs..eoffs],
                        },
                    ))
                })
                .collect::<Result<HashMap<_, _>>>()?,
        ))
    }
}

/// This trait implementation converts a tuple of filename + slice of bytes
/// to a [TensorDataMap] which can be used to load the model.
impl<'a> TryFrom<(String, &'a [u8])> for TensorDataMap<'a> {
    type Error = Error;

    fn try_from((filename, data): (String, &'a [u8])) -> Result<Self, Self::Error> {
        if filename.ends_with(".st") || filename.ends_with(".safetensors") {
            let (headersize, md) = SafeTensors::read_metadata(data)?;
            // Why is it necessary to randomly add 8 here? Because FU, that's why.
            // This is an undocumented requirement as far as I can tell.
            (md, &data[headersize + 8..]).try_into()
        } else {
            bail!("Unknown file type")
        }
    }
}

/// TensorMap helper type to avoid repetition.
type TM<'a> = HashMap<String, TensorData<'a>>;

/// Helper function for extracting a tensor from the HashMap by string key.
fn gk<'a, 'b>(m: &'b TM<'a>, k: &str) -> Result<&'b TensorData<'a>> {
    m.get(k).ok_or_else(|| anyhow!("Missing tensor: {k}"))
}

fn linear<T: ConvertTensor>(
    tm: &TM<'_>,
    prefix: &str,
    out_features: usize,
    in_features: usize,
    bias: bool,
) -> Result<Linear<T>> {
    let weight = T::tensor_to_array2(gk(tm, &format!("{prefix}.weight"))?)?;
    ensure!(
        weight.dim() == (out_features, in_features),
        "{prefix}.weight has shape {:?}, expected ({out_features}, {in_features})",
        weight.dim()
    );
    let bias = if bias {
        let b = T::tensor_to_array1(gk(tm, &format!("{prefix}.bias"))?)?;
        ensure!(
            b.len() == out_features,
            "{prefix}.bias has length {}, expected {out_features}",
            b.len()
        );
        Some(b)
    } else {
        None
    };
    Ok(Linear { weight, bias })
}

impl<T: ConvertTensor> TryFrom<(usize, &WapConfig, &TM<'_>)> for ConvBlock<T> {
    type Error = Error;

    fn try_from((idx, config, tm): (usize, &WapConfig, &TM<'_>)) -> Result<Self> {
        let in_channels = if idx == 0 {
            config.input_channels
        } else {
            config.num_features_map[idx - 1]
        };
        let out_channels = config.num_features_map[idx];
        let k = config.feature_kernel_size[idx];

        let weight = T::tensor_to_array4(gk(tm, &format!("watcher.conv{idx}.weight"))?)?;
        ensure!(
            weight.dim() == (out_channels, in_channels, k, k),
            "watcher.conv{idx}.weight has shape {:?}, expected ({out_channels}, {in_channels}, {k}, {k})",
            weight.dim()
        );
        let bias = T::tensor_to_array1(gk(tm, &format!("watcher.conv{idx}.bias"))?)?;
        ensure!(
            bias.len() == out_channels,
            "watcher.conv{idx}.bias has length {}, expected {out_channels}",
            bias.len()
        );

        let norm = if config.batch_norm[idx] {
            let bn = BatchNorm {
                weight: T::tensor_to_array1(gk(tm, &format!("watcher.bn{idx}.weight"))?)?,
                bias: T::tensor_to_array1(gk(tm, &format!("watcher.bn{idx}.bias"))?)?,
                running_mean: T::tensor_to_array1(gk(tm, &format!("watcher.bn{idx}.running_mean"))?)?,
                running_var: T::tensor_to_array1(gk(tm, &format!("watcher.bn{idx}.running_var"))?)?,
                eps: T::from_f64(1e-5).expect("Impossible: float conversion failed"),
            };
            ensure!(
                bn.weight.len() == out_channels
                    && bn.bias.len() == out_channels
                    && bn.running_mean.len() == out_channels
                    && bn.running_var.len() == out_channels,
                "watcher.bn{idx} parameter lengths disagree with {out_channels} channels"
            );
            Some(bn)
        } else {
            None
        };

        Ok(ConvBlock {
            weight,
            bias,
            stride: config.feature_kernel_stride[idx],
            padding: config.feature_padding[idx],
            norm,
            pool: config.feature_pooling_kernel_size[idx]
                .map(|pk| (pk, config.feature_pooling_stride[idx])),
        })
    }
}

impl<T: ConvertTensor> TryFrom<(&WapConfig, &TM<'_>)> for Parser<T> {
    type Error = Error;

    fn try_from((config, tm): (&WapConfig, &TM<'_>)) -> Result<Self> {
        let d = config.feature_dim();
        let l = config.num_locations();
        let hidden = config.hidden_dim;

        // W_2 projects each D-dim location to one score; its (1, D) weight
        // gets squeezed away by the 2-D conversion, so load it flat.
        let key_weight = T::tensor_to_array1(gk(tm, "parser.w_2.weight")?)?;
        ensure!(
            key_weight.len() == d,
            "parser.w_2.weight has length {}, expected {d}",
            key_weight.len()
        );
        let key_bias = T::tensor_to_array1(gk(tm, "parser.w_2.bias")?)?;
        ensure!(
            key_bias.len() == 1,
            "parser.w_2.bias has length {}, expected 1",
            key_bias.len()
        );

        Ok(Parser {
            init_hidden: linear(tm, "parser.w_h", hidden, d, true)?,
            init_cell: linear(tm, "parser.w_c", hidden, d, true)?,
            lstm: {
                let lstm = LstmCell {
                    weight_ih: T::tensor_to_array2(gk(tm, "parser.lstm.weight_ih")?)?,
                    weight_hh: T::tensor_to_array2(gk(tm, "parser.lstm.weight_hh")?)?,
                    bias_ih: T::tensor_to_array1(gk(tm, "parser.lstm.bias_ih")?)?,
                    bias_hh: T::tensor_to_array1(gk(tm, "parser.lstm.bias_hh")?)?,
                };
                ensure!(
                    lstm.weight_ih.dim() == (4 * hidden, config.embedding_dim + hidden)
                        && lstm.weight_hh.dim() == (4 * hidden, hidden)
                        && lstm.bias_ih.len() == 4 * hidden
                        && lstm.bias_hh.len() == 4 * hidden,
                    "parser.lstm tensor shapes disagree with hidden {hidden}"
                );
                lstm
            },
            attn_query: linear(tm, "parser.w_1", l, hidden, true)?,
            attn_key: Linear {
                weight: key_weight.insert_axis(Axis(0)),
                bias: Some(key_bias),
            },
            fusion: linear(tm, "parser.w_3", hidden, hidden + d, false)?,
            output: linear(tm, "parser.w_4", config.vocab_size, hidden, false)?,
        })
    }
}

impl<T: ConvertTensor> TryFrom<(&WapConfig, TensorDataMap<'_>)> for Wap<T> {
    type Error = Error;

    fn try_from((config, tensors): (&WapConfig, TensorDataMap<'_>)) -> Result<Self> {
        config.validate()?;
        let tm = &tensors.0;

        info!("Loading watcher ({} conv blocks)", config.num_layers);
        let blocks = (0..config.num_layers)
            .map(|idx| ConvBlock::try_from((idx, config, tm)))
            .collect::<Result<Vec<_>>>()?;

        info!("Loading embedder and parser");
        let mut embedder = Embedder {
            weight: T::tensor_to_array2(gk(tm, "embedder.weight")?)?,
        };
        ensure!(
            embedder.weight.dim() == (config.vocab_size, config.embedding_dim),
            "embedder.weight has shape {:?}, expected ({}, {})",
            embedder.weight.dim(),
            config.vocab_size,
            config.embedding_dim
        );
        // The padding embedding is fixed at zero regardless of what the
        // checkpoint carries.
        embedder.weight.row_mut(0).fill(T::zero());

        let parser = Parser::try_from((config, tm))?;
        let d = config.feature_dim();

        Ok(Wap {
            watcher: Watcher { blocks },
            positional: positional_encoding(d, config.output_dim.0, config.output_dim.1),
            embedder,
            parser,
            config: config.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing::tiny_config;

    /// Little-endian f32 payload for an all-`value` tensor.
    fn payload(len: usize, value: f32) -> Vec<u8> {
        std::iter::repeat(value)
            .take(len)
            .flat_map(f32::to_le_bytes)
            .collect()
    }

    fn tensor_specs() -> Vec<(&'static str, Vec<usize>)> {
        vec![
            ("watcher.conv0.weight", vec![8, 1, 3, 3]),
            ("watcher.conv0.bias", vec![8]),
            ("embedder.weight", vec![9, 6]),
            ("parser.w_h.weight", vec![10, 8]),
            ("parser.w_h.bias", vec![10]),
            ("parser.w_c.weight", vec![10, 8]),
            ("parser.w_c.bias", vec![10]),
            ("parser.w_1.weight", vec![16, 10]),
            ("parser.w_1.bias", vec![16]),
            ("parser.w_2.weight", vec![1, 8]),
            ("parser.w_2.bias", vec![1]),
            ("parser.w_3.weight", vec![10, 18]),
            ("parser.w_4.weight", vec![9, 10]),
            ("parser.lstm.weight_ih", vec![40, 16]),
            ("parser.lstm.weight_hh", vec![40, 10]),
            ("parser.lstm.bias_ih", vec![40]),
            ("parser.lstm.bias_hh", vec![40]),
        ]
    }

    fn build_map(buffers: &[(String, Vec<usize>, Vec<u8>)]) -> TensorDataMap<'_> {
        TensorDataMap(
            buffers
                .iter()
                .map(|(name, shape, data)| {
                    (
                        name.clone(),
                        TensorData {
                            name: name.clone(),
                            dtype: TensorType::Float32,
                            shape: shape.clone(),
                            data,
                        },
                    )
                })
                .collect(),
        )
    }

    fn buffers(fill: f32) -> Vec<(String, Vec<usize>, Vec<u8>)> {
        tensor_specs()
            .into_iter()
            .map(|(name, shape)| {
                let len = shape.iter().product();
                (name.to_string(), shape, payload(len, fill))
            })
            .collect()
    }

    #[test]
    fn loads_tiny_checkpoint() {
        let bufs = buffers(0.25);
        let model: Wap<f32> = (&tiny_config(), build_map(&bufs)).try_into().unwrap();
        assert_eq!(model.watcher.blocks.len(), 1);
        assert_eq!(model.parser.attn_key.weight.dim(), (1, 8));
        // Pad row forced to zero even though the checkpoint had 0.25s.
        assert!(model.embedder.weight.row(0).iter().all(|v| *v == 0.0));
        assert_eq!(model.embedder.weight[[1, 0]], 0.25);
    }

    #[test]
    fn missing_tensor_is_an_error() {
        let mut bufs = buffers(0.0);
        bufs.retain(|(name, ..)| name != "parser.w_3.weight");
        let res: Result<Wap<f32>> = (&tiny_config(), build_map(&bufs)).try_into();
        assert!(res.is_err());
    }

    #[test]
    fn wrong_shape_is_an_error() {
        let mut bufs = buffers(0.0);
        for buf in bufs.iter_mut() {
            if buf.0 == "parser.w_4.weight" {
                buf.1 = vec![9, 11];
                buf.2 = payload(9 * 11, 0.0);
            }
        }
        let res: Result<Wap<f32>> = (&tiny_config(), build_map(&bufs)).try_into();
        assert!(res.is_err());
    }
}
