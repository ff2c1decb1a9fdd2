use anyhow::{ensure, Result};

/// Which direction counts as an improvement for best-score tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BestMode {
    Min,
    Max,
}

/// Running average of a scalar metric with optional best-value tracking.
/// Querying before any update is an error, not a silent default.
#[derive(Debug, Clone)]
pub struct AverageMeter {
    total: f64,
    count: usize,
    best: Option<f64>,
    best_mode: Option<BestMode>,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self {
            total: 0.0,
            count: 0,
            best: None,
            best_mode: None,
        }
    }

    /// A meter that also remembers its best epoch average.
    pub fn with_best(mode: BestMode) -> Self {
        Self {
            best_mode: Some(mode),
            ..Self::new()
        }
    }

    /// Clears the running average. The best value survives resets so it
    /// can compare across epochs.
    pub fn reset(&mut self) {
        self.total = 0.0;
        self.count = 0;
    }

    pub fn update(&mut self, value: f64) {
        self.total += value;
        self.count += 1;
    }

    pub fn compute(&self) -> Result<f64> {
        ensure!(self.count > 0, "Metric queried before any update");
        Ok(self.total / self.count as f64)
    }

    /// Whether the current average beats the best seen so far, recording
    /// it if so. The first query after an update always records and
    /// returns true.
    pub fn is_best(&mut self) -> Result<bool> {
        ensure!(
            self.best_mode.is_some(),
            "Meter was not constructed with best tracking"
        );
        let current = self.compute()?;
        let improved = match (self.best, self.best_mode) {
            (None, _) => true,
            (Some(best), Some(BestMode::Min)) => current < best,
            (Some(best), Some(BestMode::Max)) => current > best,
            (Some(_), None) => unreachable!(),
        };
        if improved {
            self.best = Some(current);
        }
        Ok(improved)
    }
}

impl Default for AverageMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Word-level edit distance between two whitespace-tokenized strings.
fn edit_distance(a: &[&str], b: &[&str]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, wa) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, wb) in b.iter().enumerate() {
            let sub = prev[j] + usize::from(wa != wb);
            curr[j + 1] = sub.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Token-level error rate over (predicted, ground-truth) string pairs:
/// total edit distance divided by total ground-truth length.
pub fn token_error_rate<'a, I>(pairs: I) -> Result<f64>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut errors = 0usize;
    let mut length = 0usize;
    for (pred, truth) in pairs {
        let pred: Vec<&str> = pred.split_whitespace().collect();
        let truth: Vec<&str> = truth.split_whitespace().collect();
        errors += edit_distance(&pred, &truth);
        length += truth.len();
    }
    ensure!(length > 0, "Error rate over empty ground truth is undefined");
    Ok(errors as f64 / length as f64)
}
