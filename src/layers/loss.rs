//! Classification losses over a score matrix `(N, K)`.

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{LayerError, LayerResult};

/// Which data loss a network is trained against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    /// Softmax cross-entropy
    #[default]
    Softmax,
    /// Multiclass hinge loss with margin 1
    Svm,
}

impl LossKind {
    /// Evaluates the selected loss; returns `(loss, dscores)`.
    pub fn evaluate(self, scores: &Array2<f64>, labels: &[usize]) -> LayerResult<(f64, Array2<f64>)> {
        match self {
            LossKind::Softmax => softmax_loss(scores, labels),
            LossKind::Svm => svm_loss(scores, labels),
        }
    }
}

/// Softmax cross-entropy averaged over the batch.
///
/// Scores are shifted by their row maximum before exponentiation.
/// `dx = (softmax(x) − onehot(y)) / N`.
///
/// # Examples
///
/// ```
/// use convnet_core::layers::softmax_loss;
/// use ndarray::Array2;
///
/// let (loss, _) = softmax_loss(&Array2::zeros((4, 10)), &[0, 3, 6, 9]).unwrap();
/// assert!((loss - 10f64.ln()).abs() < 1e-12);
/// ```
pub fn softmax_loss(x: &Array2<f64>, y: &[usize]) -> LayerResult<(f64, Array2<f64>)> {
    check_labels(x, y)?;
    let n = x.nrows() as f64;

    let mut probs = x.to_owned();
    let mut loss = 0.0;
    for (mut row, &label) in probs.axis_iter_mut(Axis(0)).zip(y) {
        let max = row.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| v - max);
        // log-sum-exp: finite even when p[label] underflows
        let log_total = row.fold(0.0_f64, |acc, &v| acc + v.exp()).ln();
        loss += log_total - row[label];
        row.mapv_inplace(|v| (v - log_total).exp());
    }
    let loss = loss / n;

    let mut dx = probs;
    for (i, &label) in y.iter().enumerate() {
        dx[[i, label]] -= 1.0;
    }
    dx /= n;
    Ok((loss, dx))
}

/// Multiclass SVM (hinge) loss with margin 1, averaged over the batch.
pub fn svm_loss(x: &Array2<f64>, y: &[usize]) -> LayerResult<(f64, Array2<f64>)> {
    check_labels(x, y)?;
    let n = x.nrows() as f64;

    let mut dx = Array2::zeros(x.raw_dim());
    let mut loss = 0.0;
    for (i, (row, &label)) in x.axis_iter(Axis(0)).zip(y).enumerate() {
        let correct = row[label];
        let mut positive = 0usize;
        for (j, &score) in row.iter().enumerate() {
            if j == label {
                continue;
            }
            let margin = score - correct + 1.0;
            if margin > 0.0 {
                loss += margin;
                positive += 1;
                dx[[i, j]] = 1.0;
            }
        }
        dx[[i, label]] = -(positive as f64);
    }
    dx /= n;
    Ok((loss / n, dx))
}

fn check_labels(x: &Array2<f64>, y: &[usize]) -> LayerResult<()> {
    let (n, k) = x.dim();
    if y.len() != n {
        return Err(LayerError::LabelCountMismatch {
            expected: n,
            got: y.len(),
        });
    }
    if n == 0 {
        return Err(LayerError::shape_mismatch("loss scores", &[1, k], &[0, k]));
    }
    if let Some((index, &label)) = y.iter().enumerate().find(|&(_, &label)| label >= k) {
        return Err(LayerError::InvalidLabel {
            index,
            label,
            num_classes: k,
        });
    }
    Ok(())
}
