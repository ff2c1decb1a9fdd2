use anyhow::{bail, ensure, Result};
use ndarray::{Array1, Array2, Array3, Array4, ArrayView2, Axis};

use crate::{
    model::Wap,
    util::{argmax_rows, ReqOps},
    vocab::EOS_TOKEN,
};

/// Where the decode loop gets the token fed at each step. Training uses
/// ground-truth lookup, inference the argmax of the previous distribution;
/// the loop itself is shared.
pub trait NextTokenSource<T> {
    /// Token per batch row to feed at `step` (step >= 1; step 0 always
    /// feeds sos), given the distribution emitted at `step - 1`.
    fn next_tokens(&mut self, step: usize, prev_probs: &Array2<T>) -> Array1<usize>;

    /// Inspect the distribution emitted at `step`. Returning true stops
    /// the loop before max_len.
    fn complete(&mut self, step: usize, probs: &Array2<T>) -> bool {
        let _ = (step, probs);
        false
    }
}

/// Ground-truth lookup: position t-1 of the label feeds step t.
pub struct TeacherForcing<'a> {
    target: ArrayView2<'a, usize>,
}

impl<'a> TeacherForcing<'a> {
    pub fn new(target: ArrayView2<'a, usize>) -> Self {
        Self { target }
    }
}

impl<T: ReqOps> NextTokenSource<T> for TeacherForcing<'_> {
    fn next_tokens(&mut self, step: usize, _prev_probs: &Array2<T>) -> Array1<usize> {
        self.target.column(step - 1).to_owned()
    }
}

/// Greedy self-feeding: argmax of the previous distribution. Rows that
/// have produced eos keep re-emitting eos so batch shapes stay uniform;
/// decoding completes once every row is done.
pub struct Greedy {
    done: Vec<bool>,
    emitted: Vec<Array1<usize>>,
}

impl Greedy {
    pub fn new(batch: usize) -> Self {
        Self {
            done: vec![false; batch],
            emitted: Vec::new(),
        }
    }

    /// Tokens recorded so far, one (batch,) row per step.
    pub fn into_tokens(self) -> Vec<Array1<usize>> {
        self.emitted
    }
}

impl<T: ReqOps> NextTokenSource<T> for Greedy {
    fn next_tokens(&mut self, _step: usize, _prev_probs: &Array2<T>) -> Array1<usize> {
        // complete() already recorded the masked argmax for the previous
        // step; feeding it back is what makes the decode self-sustaining.
        self.emitted
            .last()
            .expect("Impossible: next_tokens before any complete()")
            .clone()
    }

    fn complete(&mut self, _step: usize, probs: &Array2<T>) -> bool {
        let mut tokens = argmax_rows(probs);
        for (tok, done) in tokens.iter_mut().zip(self.done.iter_mut()) {
            if *done {
                *tok = EOS_TOKEN;
            } else if *tok == EOS_TOKEN {
                *done = true;
            }
        }
        self.emitted.push(tokens);
        self.done.iter().all(|d| *d)
    }
}

/// Greedy decode result: the token sequence plus everything the attention
/// visualizer needs.
#[derive(Debug, Clone)]
pub struct Translation<T> {
    /// (batch, steps) decoded IDs; rows finished early are padded with eos.
    pub tokens: Array2<usize>,
    /// One (batch, L) attention map per emitted step.
    pub alphas: Vec<Array2<T>>,
}

struct DecodeRun<T> {
    probs: Array3<T>,
    alphas: Vec<Array2<T>>,
    steps: usize,
}

impl<T: ReqOps> Wap<T> {
    /// The shared stepping loop behind both decode modes.
    fn decode<S: NextTokenSource<T>>(
        &self,
        x: &Array3<T>,
        source: &mut S,
    ) -> Result<DecodeRun<T>> {
        let (batch, _, _) = x.dim();
        let max_len = self.config.max_len;
        let mut probs = Array3::zeros((batch, max_len, self.config.vocab_size));
        let mut alphas = Vec::with_capacity(max_len);
        let mut state = self.parser.init_state(x);
        let mut steps = 0;

        for step in 0..max_len {
            if step > 0 {
                let prev = probs.index_axis(Axis(1), step - 1).to_owned();
                state.y = source.next_tokens(step, &prev);
            }
            let (p, alpha, next) = self.parse(x, &state);
            probs.index_axis_mut(Axis(1), step).assign(&p);
            alphas.push(alpha);
            state = next;
            steps = step + 1;
            if source.complete(step, &probs.index_axis(Axis(1), step).to_owned()) {
                break;
            }
        }
        Ok(DecodeRun {
            probs,
            alphas,
            steps,
        })
    }

    /// Teacher-forced training forward. `target` must cover every fed
    /// position, i.e. have at least max_len - 1 columns. Returns
    /// (batch, max_len, vocab_size) of per-step distributions.
    pub fn forward(&self, images: &Array4<T>, target: ArrayView2<'_, usize>) -> Result<Array3<T>> {
        ensure!(
            target.nrows() == images.shape()[0],
            "Target batch {} does not match image batch {}",
            target.nrows(),
            images.shape()[0]
        );
        ensure!(
            target.ncols() + 1 >= self.config.max_len,
            "Target has {} positions, teacher forcing needs at least max_len - 1 = {}",
            target.ncols(),
            self.config.max_len - 1
        );
        let x = self.watch(images)?;
        let mut source = TeacherForcing::new(target);
        Ok(self.decode(&x, &mut source)?.probs)
    }

    /// Greedy self-feeding inference: decode until every row has emitted
    /// eos or max_len steps have elapsed.
    pub fn translate(&self, images: &Array4<T>) -> Result<Translation<T>> {
        let x = self.watch(images)?;
        let batch = images.shape()[0];
        let mut source = Greedy::new(batch);
        let run = self.decode(&x, &mut source)?;

        let rows = source.into_tokens();
        let mut tokens = Array2::from_elem((batch, run.steps), EOS_TOKEN);
        for (step, row) in rows.iter().enumerate() {
            tokens.column_mut(step).assign(row);
        }
        Ok(Translation {
            tokens,
            alphas: run.alphas.into_iter().take(run.steps).collect(),
        })
    }
}

/// Masked token-level negative log-likelihood.
///
/// Sums -ln p(ground truth) over unpadded positions (mask == 1) and
/// normalizes by the total true length of the batch. An all-padding batch
/// has no defined loss and is an invalid-usage error rather than a NaN.
pub fn masked_nll<T: ReqOps>(
    probs: &Array3<T>,
    target: &Array2<usize>,
    seq_len: &Array1<usize>,
    mask: &Array2<T>,
) -> Result<T> {
    let (batch, steps, vocab) = probs.dim();
    ensure!(
        target.dim() == mask.dim() && target.nrows() == batch && seq_len.len() == batch,
        "Loss input shapes disagree: probs {:?}, target {:?}, mask {:?}, seq_len {}",
        probs.dim(),
        target.dim(),
        mask.dim(),
        seq_len.len()
    );
    ensure!(
        target.ncols() <= steps,
        "Target length {} exceeds decoded steps {}",
        target.ncols(),
        steps
    );
    let total = seq_len.iter().sum::<usize>();
    if total == 0 {
        bail!("Masked loss over an all-padding batch is undefined");
    }

    let mut acc = T::zero();
    for bi in 0..batch {
        for t in 0..target.ncols() {
            let id = target[[bi, t]];
            ensure!(id < vocab, "Target ID {id} out of vocabulary ({vocab})");
            acc = acc + mask[[bi, t]] * probs[[bi, t, id]].ln();
        }
    }
    Ok(-acc / T::from_usize(total).expect("Impossible: float conversion failed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing::{tiny_config, tiny_model};
    use crate::vocab::SOS_TOKEN;
    use ndarray::{array, Array4};

    fn images(batch: usize) -> Array4<f32> {
        Array4::from_shape_fn((batch, 1, 8, 8), |(b, _, y, x)| {
            ((b + 1) * (y * 8 + x)) as f32 / 128.0
        })
    }

    #[test]
    fn teacher_forced_output_shape_and_normalization() {
        let model = tiny_model(11);
        let config = tiny_config();
        let target = Array2::from_elem((2, config.max_len), 4usize);
        let probs = model.forward(&images(2), target.view()).unwrap();
        assert_eq!(probs.dim(), (2, config.max_len, config.vocab_size));
        for bi in 0..2 {
            for t in 0..config.max_len {
                let sum: f32 = probs.index_axis(Axis(0), bi).index_axis(Axis(0), t).sum();
                assert!((sum - 1.0).abs() < 1e-4, "step {t} sums to {sum}");
            }
        }
    }

    #[test]
    fn teacher_forcing_feeds_ground_truth() {
        let target = array![[4usize, 5, 6], [7, 8, 3]];
        let mut source = TeacherForcing::new(target.view());
        let dummy = Array2::<f32>::zeros((2, 9));
        assert_eq!(
            NextTokenSource::<f32>::next_tokens(&mut source, 1, &dummy),
            array![4usize, 7]
        );
        assert_eq!(
            NextTokenSource::<f32>::next_tokens(&mut source, 3, &dummy),
            array![6usize, 3]
        );
        // Teacher forcing never stops the loop early.
        assert!(!NextTokenSource::<f32>::complete(&mut source, 0, &dummy));
    }

    #[test]
    fn greedy_source_masks_finished_rows() {
        let mut source = Greedy::new(2);
        // Step 0: row 0 argmaxes to eos (ID 3), row 1 to 5.
        let probs = array![[0.0f32, 0.0, 0.0, 0.9, 0.05, 0.05], [
            0.0, 0.0, 0.0, 0.1, 0.1, 0.8
        ]];
        assert!(!NextTokenSource::<f32>::complete(&mut source, 0, &probs));
        assert_eq!(
            NextTokenSource::<f32>::next_tokens(&mut source, 1, &probs),
            array![3usize, 5]
        );
        // Step 1: row 0 would argmax to 4, but it is done and stays at eos;
        // row 1 reaches eos so the whole batch completes.
        let probs = array![[0.0f32, 0.0, 0.0, 0.1, 0.9, 0.0], [
            0.0, 0.0, 0.0, 0.9, 0.05, 0.05
        ]];
        assert!(NextTokenSource::<f32>::complete(&mut source, 1, &probs));
        assert_eq!(source.into_tokens()[1], array![3usize, 3]);
    }

    #[test]
    fn greedy_decode_is_deterministic() {
        let model = tiny_model(12);
        let a = model.translate(&images(2)).unwrap();
        let b = model.translate(&images(2)).unwrap();
        assert_eq!(a.tokens, b.tokens);
        assert_eq!(a.alphas.len(), b.alphas.len());
    }

    #[test]
    fn greedy_alphas_cover_each_step_and_normalize() {
        let model = tiny_model(13);
        let config = tiny_config();
        let out = model.translate(&images(2)).unwrap();
        assert_eq!(out.alphas.len(), out.tokens.ncols());
        assert!(out.tokens.ncols() <= config.max_len);
        for alpha in &out.alphas {
            assert_eq!(alpha.dim(), (2, config.num_locations()));
            for row in alpha.rows() {
                assert!((row.sum() - 1.0).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn greedy_feeds_sos_first() {
        let model = tiny_model(14);
        let x = model.watch(&images(1)).unwrap();
        let state = model.parser.init_state(&x);
        assert_eq!(state.y, array![SOS_TOKEN]);
    }

    #[test]
    fn masked_nll_perfect_prediction_is_zero() {
        // Two sequences, true lengths 3 and 5, one-hot probs matching.
        let vocab = 6;
        let steps = 5;
        let target = array![[4usize, 5, 3, 0, 0], [5, 5, 4, 4, 3]];
        let seq_len = array![3usize, 5];
        let mask = array![[1.0f64, 1.0, 1.0, 0.0, 0.0], [1.0, 1.0, 1.0, 1.0, 1.0]];
        let mut probs = Array3::<f64>::from_elem((2, steps, vocab), 1e-9);
        for bi in 0..2 {
            for t in 0..steps {
                probs[[bi, t, target[[bi, t]]]] = 1.0;
            }
        }
        let loss = masked_nll(&probs, &target, &seq_len, &mask).unwrap();
        assert!(loss.abs() < 1e-12);
    }

    #[test]
    fn masked_nll_ignores_positions_past_eos() {
        let target = array![[4usize, 3, 0]];
        let seq_len = array![2usize];
        let mask = array![[1.0f64, 1.0, 0.0]];
        let mut probs = Array3::<f64>::from_elem((1, 3, 6), 0.5);
        probs[[0, 0, 4]] = 1.0;
        probs[[0, 1, 3]] = 1.0;
        let base = masked_nll(&probs, &target, &seq_len, &mask).unwrap();
        // Perturbing a masked position changes nothing.
        probs[[0, 2, 0]] = 1e-12;
        let perturbed = masked_nll(&probs, &target, &seq_len, &mask).unwrap();
        assert_eq!(base, perturbed);
        assert!(base.abs() < 1e-12);
    }

    #[test]
    fn masked_nll_all_padding_is_an_error() {
        let target = array![[0usize, 0]];
        let seq_len = array![0usize];
        let mask = array![[0.0f64, 0.0]];
        let probs = Array3::<f64>::from_elem((1, 2, 6), 1.0 / 6.0);
        assert!(masked_nll(&probs, &target, &seq_len, &mask).is_err());
    }
}
