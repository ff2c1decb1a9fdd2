use std::ops::{Add, Sub};

use anyhow::{anyhow, Result};
use memmap2::MmapOptions;
use ndarray::{Array1, Array2, Array4, NdFloat, ScalarOperand};
use num_traits::FromPrimitive;

use crate::loader::{TensorData, TensorType};

/// Basically all the math stuff ndarray supports and we need for evaluating
/// WAP.
pub trait ReqOps: Sized + Default + Clone
where
    Self: NdFloat + ScalarOperand + FromPrimitive,
    Self: for<'a> Sub<&'a Array1<Self>, Output = Array1<Self>>,
    Self: for<'a> Add<&'a Array1<Self>, Output = Array1<Self>>,
{
}

impl ReqOps for f32 {}
impl ReqOps for f64 {}

/// Converting checkpoint tensors to arrays of float (only implemented for
/// f32). Both bfloat16 and float32 payloads are accepted since exporters
/// disagree about which to write.
pub trait ConvertTensor: ReqOps {
    fn tensor_to_array1(tensor: &TensorData<'_>) -> Result<Array1<Self>>;
    fn tensor_to_array2(tensor: &TensorData<'_>) -> Result<Array2<Self>>;
    fn tensor_to_array4(tensor: &TensorData<'_>) -> Result<Array4<Self>>;
}

impl ConvertTensor for f32 {
    fn tensor_to_array1(tensor: &TensorData<'_>) -> Result<Array1<Self>> {
        Ok(Array1::from(tensor_to_f32(tensor)?))
    }

    fn tensor_to_array2(tensor: &TensorData<'_>) -> Result<Array2<Self>> {
        // Squeeze all the things.
        let shp = tensor
            .shape
            .iter()
            .copied()
            .filter(|i| i != &1)
            .collect::<Vec<usize>>();
        anyhow::ensure!(shp.len() == 2, "Bad shape for tensor {}", tensor.name);
        Array2::from_shape_vec((shp[0], shp[1]), tensor_to_f32(tensor)?)
            .map_err(|e| anyhow!("Failed to build tensor in tensor_to_array2: {e}"))
    }

    fn tensor_to_array4(tensor: &TensorData<'_>) -> Result<Array4<Self>> {
        anyhow::ensure!(
            tensor.shape.len() == 4,
            "Bad shape for tensor {}",
            tensor.name
        );
        let shp = (
            tensor.shape[0],
            tensor.shape[1],
            tensor.shape[2],
            tensor.shape[3],
        );
        Array4::from_shape_vec(shp, tensor_to_f32(tensor)?)
            .map_err(|e| anyhow!("Failed to build tensor in tensor_to_array4: {e}"))
    }
}

/// Helper function for opening a file and mmaping it.
pub fn mmap_file(s: &str) -> Result<memmap2::Mmap> {
    let fp = std::fs::File::open(s)?;
    unsafe { MmapOptions::new().map(&fp).map_err(|e| anyhow!(e)) }
}

/// Uses a pool to run a function with a limited number of threads.
pub fn run_threadlimited<R, F>(max_threads: usize, f: F) -> R
where
    R: Send,
    F: FnOnce() -> R + Send,
{
    rayon::ThreadPoolBuilder::new()
        .num_threads(max_threads)
        .build()
        .expect("Building thread pool failed!")
        .install(f)
}

/// Helper function to convert a checkpoint TensorData into a flat vector of
/// f32. The number of dimensions doesn't matter at this point.
fn tensor_to_f32(tensor: &TensorData<'_>) -> Result<Vec<f32>> {
    match tensor.dtype {
        TensorType::BFloat16 => {
            anyhow::ensure!(
                tensor.data.len() & 1 != 1,
                "Odd size for BF16 tensor input"
            );
            Ok(tensor
                .data
                .chunks(2)
                .map(|i| half::bf16::from_le_bytes([i[0], i[1]]).to_f32())
                .collect::<Vec<f32>>())
        }
        TensorType::Float32 => {
            anyhow::ensure!(
                tensor.data.len() & 3 == 0,
                "Bad size for F32 tensor input"
            );
            Ok(tensor
                .data
                .chunks(4)
                .map(|i| f32::from_le_bytes([i[0], i[1], i[2], i[3]]))
                .collect::<Vec<f32>>())
        }
    }
}

pub fn sigmoid<T: ReqOps>(x: Array2<T>) -> Array2<T> {
    let o = T::one();
    x.map(|val| o / (o + (-(*val)).exp()))
}

/// Row-wise stabilized softmax. Each row of the result sums to one.
pub fn softmax_rows<T: ReqOps>(x: &Array2<T>) -> Array2<T> {
    let mut out = x.to_owned();
    for mut row in out.rows_mut() {
        let max = row.iter().copied().fold(T::neg_infinity(), T::max);
        row.mapv_inplace(|el| (el - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|el| el / sum);
    }
    out
}

/// Index of the largest element in each row.
pub fn argmax_rows<T: ReqOps>(x: &Array2<T>) -> Array1<usize> {
    x.rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0usize, T::neg_infinity()), |acc, (idx, el)| {
                    if *el > acc.1 {
                        (idx, *el)
                    } else {
                        acc
                    }
                })
                .0
        })
        .collect()
}
