use anyhow::{ensure, Result};
use ndarray::{Array1, Array2, Array4, Axis};
use tracing::info;

use crate::{model::Wap, util::ReqOps, vocab::Vocab};

/// Context that couples a WAP model with its vocabulary. This is the
/// entry point the display application drives.
pub struct WapContext<T> {
    /// The model data — immutable.
    pub model: Wap<T>,
    /// The LaTeX token table.
    pub vocab: Vocab,
}

/// Result of translating a single image.
#[derive(Debug, Clone)]
pub struct ImageTranslation<T> {
    /// Whitespace-joined LaTeX token string.
    pub latex: String,
    /// Raw decoded IDs, eos included.
    pub tokens: Vec<usize>,
    /// One attention map over the L feature locations per decoded step.
    pub alphas: Vec<Array1<T>>,
}

impl<T: ReqOps> WapContext<T> {
    pub fn new(model: Wap<T>, vocab: Vocab) -> Result<Self> {
        ensure!(
            vocab.len() == model.config.vocab_size,
            "Vocabulary has {} IDs but the model was built for {}",
            vocab.len(),
            model.config.vocab_size
        );
        Ok(Self { model, vocab })
    }

    /// Greedily decode one grayscale image (H, W), already normalized the
    /// way the model was trained (values in [0, 1]).
    pub fn translate(&self, image: &Array2<T>) -> Result<ImageTranslation<T>> {
        let (in_h, in_w) = self.model.config.input_dims;
        ensure!(
            image.dim() == (in_h, in_w),
            "Image is {:?}, model expects ({in_h}, {in_w})",
            image.dim()
        );
        let batch = image
            .view()
            .insert_axis(Axis(0))
            .insert_axis(Axis(0))
            .to_owned();
        let out = self.model.translate(&batch)?;

        let tokens: Vec<usize> = out.tokens.row(0).to_vec();
        let latex = self.vocab.convert_to_string(&tokens);
        let alphas = out
            .alphas
            .iter()
            .map(|alpha| alpha.row(0).to_owned())
            .collect();
        info!("Decoded {} token(s): {latex}", tokens.len());
        Ok(ImageTranslation {
            latex,
            tokens,
            alphas,
        })
    }

    /// Decode a batch and render each row as a LaTeX string, for metric
    /// computation against ground-truth labels.
    pub fn translate_batch(&self, images: &Array4<T>) -> Result<Vec<String>> {
        let out = self.model.translate(images)?;
        Ok(out
            .tokens
            .rows()
            .into_iter()
            .map(|row| self.vocab.convert_to_string(&row.to_vec()))
            .collect())
    }
}
