use std::path::Path;

use anyhow::{Context, Result};
use image::{imageops::FilterType, Rgb, RgbImage};
use ndarray::Array2;

/// Used for non-quantized tensors and values.
pub type FloatType = f32;

/// Read an image, convert to grayscale, resize to the model's input
/// dimensions and normalize to [0, 1].
pub fn load_grayscale(path: &Path, dims: (usize, usize)) -> Result<Array2<FloatType>> {
    let (height, width) = dims;
    let img = image::open(path)
        .with_context(|| format!("Failed to open image {}", path.display()))?
        .into_luma8();
    let img = image::imageops::resize(&img, width as u32, height as u32, FilterType::Triangle);
    Ok(Array2::from_shape_fn((height, width), |(y, x)| {
        FloatType::from(img.get_pixel(x as u32, y as u32).0[0]) / 255.0
    }))
}

/// Write the input image with an attention map blended over it in red.
/// The map is normalized by its own peak so something is visible even
/// when attention is spread thin.
pub fn write_overlay(
    path: &Path,
    gray: &Array2<FloatType>,
    attention: &Array2<FloatType>,
) -> Result<()> {
    let (height, width) = gray.dim();
    let peak = attention
        .iter()
        .copied()
        .fold(FloatType::MIN, FloatType::max)
        .max(FloatType::MIN_POSITIVE);

    let mut img = RgbImage::new(width as u32, height as u32);
    for (y, row) in gray.rows().into_iter().enumerate() {
        for (x, &v) in row.iter().enumerate() {
            let base = (v * 255.0) as u8;
            let heat = (attention[[y, x]] / peak).clamp(0.0, 1.0);
            let r = (FloatType::from(base) * (1.0 - heat) + 255.0 * heat) as u8;
            img.put_pixel(x as u32, y as u32, Rgb([r, base, base]));
        }
    }
    img.save(path)
        .with_context(|| format!("Failed to write overlay {}", path.display()))?;
    Ok(())
}

/// Keep only characters that are safe in a filename; LaTeX tokens are
/// full of backslashes and braces.
pub fn sanitize_token(token: &str) -> String {
    let cleaned: String = token
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '+' || *c == '-' || *c == '=')
        .collect();
    if cleaned.is_empty() {
        "tok".to_string()
    } else {
        cleaned
    }
}
