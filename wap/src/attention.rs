use anyhow::{ensure, Result};
use ndarray::{Array2, ArrayView1};

use crate::util::ReqOps;

/// How to stretch the attention grid back to image resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsample {
    Nearest,
    Bilinear,
}

/// Reshape one step's attention weights (length L = H' * W') to the
/// watcher's grid and upsample to the original image's (H, W) so the map
/// can be overlaid on it. Pure transform; only the visualization path
/// calls it.
pub fn reconstruct_attention<T: ReqOps>(
    alpha: ArrayView1<'_, T>,
    grid: (usize, usize),
    image_dims: (usize, usize),
    mode: Upsample,
) -> Result<Array2<T>> {
    let (gh, gw) = grid;
    let (ih, iw) = image_dims;
    ensure!(
        alpha.len() == gh * gw,
        "Attention vector length {} does not match grid {:?}",
        alpha.len(),
        grid
    );
    ensure!(ih >= gh && iw >= gw, "Cannot upsample {grid:?} to {image_dims:?}");

    let coarse = alpha
        .to_owned()
        .into_shape((gh, gw))
        .expect("Impossible: length checked above");

    let out = match mode {
        Upsample::Nearest => Array2::from_shape_fn((ih, iw), |(y, x)| {
            coarse[[y * gh / ih, x * gw / iw]]
        }),
        Upsample::Bilinear => {
            let sy = gh as f64 / ih as f64;
            let sx = gw as f64 / iw as f64;
            Array2::from_shape_fn((ih, iw), |(y, x)| {
                // Half-pixel-centered source coordinates, edge clamped.
                let fy = ((y as f64 + 0.5) * sy - 0.5).clamp(0.0, (gh - 1) as f64);
                let fx = ((x as f64 + 0.5) * sx - 0.5).clamp(0.0, (gw - 1) as f64);
                let y0 = fy.floor() as usize;
                let x0 = fx.floor() as usize;
                let y1 = (y0 + 1).min(gh - 1);
                let x1 = (x0 + 1).min(gw - 1);
                let wy = T::from_f64(fy - y0 as f64).expect("Impossible: float conversion failed");
                let wx = T::from_f64(fx - x0 as f64).expect("Impossible: float conversion failed");
                let one = T::one();
                coarse[[y0, x0]] * (one - wy) * (one - wx)
                    + coarse[[y0, x1]] * (one - wy) * wx
                    + coarse[[y1, x0]] * wy * (one - wx)
                    + coarse[[y1, x1]] * wy * wx
            })
        }
    };
    Ok(out)
}
