//! Centred finite-difference gradients for validating backward passes.
//!
//! ```text
//! ∂f/∂x_i ≈ (f(x + h·e_i) − f(x − h·e_i)) / 2h
//! ```
//!
//! These walk every element of the input, so they are meant for small
//! tensors in tests and diagnostics.

use std::fmt;

use ndarray::{Array, Array4, ArrayD, Dimension, IxDyn, Zip};

use crate::error::LayerResult;
use crate::network::{ConvNet, ParamId};

/// Numeric gradient of a scalar-valued `f` at `x`.
pub fn eval_numerical_gradient<F>(mut f: F, x: &ArrayD<f64>, h: f64) -> ArrayD<f64>
where
    F: FnMut(&ArrayD<f64>) -> f64,
{
    let mut probe = x.to_owned();
    let mut grad = ArrayD::zeros(x.raw_dim());
    for (idx, g) in grad.indexed_iter_mut() {
        let i = idx.slice();
        let original = probe[i];
        probe[i] = original + h;
        let plus = f(&probe);
        probe[i] = original - h;
        let minus = f(&probe);
        probe[i] = original;
        *g = (plus - minus) / (2.0 * h);
    }
    grad
}

/// Numeric gradient of `Σ f(x) · dout` for an array-valued `f`, i.e. the
/// vector-Jacobian product a backward pass computes.
pub fn eval_numerical_gradient_array<F>(mut f: F, x: &ArrayD<f64>, dout: &ArrayD<f64>, h: f64) -> ArrayD<f64>
where
    F: FnMut(&ArrayD<f64>) -> ArrayD<f64>,
{
    let mut probe = x.to_owned();
    let mut grad = ArrayD::zeros(x.raw_dim());
    for (idx, g) in grad.indexed_iter_mut() {
        let i = idx.slice();
        let original = probe[i];
        probe[i] = original + h;
        let plus = f(&probe);
        probe[i] = original - h;
        let minus = f(&probe);
        probe[i] = original;
        *g = ((plus - minus) * dout).sum() / (2.0 * h);
    }
    grad
}

/// Largest elementwise `|a − b| / max(1e-8, |a| + |b|)`.
///
/// Arrays of different shape compare as infinitely far apart.
///
/// # Examples
///
/// ```
/// use convnet_core::gradient_check::rel_error;
/// use ndarray::arr1;
///
/// assert_eq!(rel_error(&arr1(&[1.0, 2.0]), &arr1(&[1.0, 2.0])), 0.0);
/// assert!((rel_error(&arr1(&[1.0]), &arr1(&[3.0])) - 0.5).abs() < 1e-12);
/// ```
pub fn rel_error<D: Dimension>(a: &Array<f64, D>, b: &Array<f64, D>) -> f64 {
    if a.shape() != b.shape() {
        return f64::INFINITY;
    }
    Zip::from(a).and(b).fold(0.0, |worst: f64, &x, &y| {
        let err = (x - y).abs() / (x.abs() + y.abs()).max(1e-8);
        worst.max(err)
    })
}

/// Agreement between the analytic and numeric gradient of one parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientCheck {
    pub parameter: ParamId,
    pub relative_error: f64,
}

impl fmt::Display for GradientCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} relative error: {:.2e}", self.parameter, self.relative_error)
    }
}

/// Compares every parameter gradient of `net` on `(x, y)` against a
/// finite-difference estimate.
///
/// Each probe runs a full train-mode loss, so running statistics advance as a
/// side effect. The loss must be deterministic in the parameters, which rules
/// out networks configured with dropout.
pub fn check_network_gradients(
    net: &mut ConvNet,
    x: &Array4<f64>,
    y: &[usize],
    h: f64,
) -> LayerResult<Vec<GradientCheck>> {
    let (_, analytic) = net.loss_and_grads(x, y)?;
    let ids: Vec<ParamId> = net.params().named().into_iter().map(|(id, _)| id).collect();

    let mut report = Vec::with_capacity(ids.len());
    for id in ids {
        let Some(target) = analytic.get(id) else {
            continue;
        };
        let target = target.to_owned();
        let mut numeric = ArrayD::zeros(target.raw_dim());
        let indices: Vec<IxDyn> = numeric.indexed_iter().map(|(idx, _)| idx).collect();
        for idx in indices {
            let i = idx.slice();
            let original = match net.params().get(id) {
                Some(view) => view[i],
                None => continue,
            };
            let plus = probe_loss(net, x, y, id, i, original + h)?;
            let minus = probe_loss(net, x, y, id, i, original - h)?;
            set_param(net, id, i, original);
            numeric[i] = (plus - minus) / (2.0 * h);
        }

        let relative_error = rel_error(&target, &numeric);
        tracing::debug!(parameter = %id, relative_error, "gradient check");
        report.push(GradientCheck {
            parameter: id,
            relative_error,
        });
    }
    Ok(report)
}

fn probe_loss(net: &mut ConvNet, x: &Array4<f64>, y: &[usize], id: ParamId, i: &[usize], value: f64) -> LayerResult<f64> {
    set_param(net, id, i, value);
    net.loss_and_grads(x, y).map(|(loss, _)| loss)
}

fn set_param(net: &mut ConvNet, id: ParamId, i: &[usize], value: f64) {
    if let Some(mut view) = net.params_mut().get_mut(id) {
        view[i] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_numeric_gradient_of_quadratic() {
        let x = arr1(&[1.0, -2.0, 0.5]).into_dyn();
        let grad = eval_numerical_gradient(|v| v.mapv(|e| e * e).sum(), &x, 1e-5);
        let expected = arr1(&[2.0, -4.0, 1.0]).into_dyn();
        assert!(rel_error(&grad, &expected) < 1e-9);
    }

    #[test]
    fn test_numeric_vjp_of_elementwise_square() {
        let x = arr2(&[[1.0, 2.0], [3.0, -1.0]]).into_dyn();
        let dout = arr2(&[[1.0, 0.5], [-1.0, 2.0]]).into_dyn();
        let grad = eval_numerical_gradient_array(|v| v.mapv(|e| e * e), &x, &dout, 1e-5);
        let expected = arr2(&[[2.0, 2.0], [-6.0, -4.0]]).into_dyn();
        assert!(rel_error(&grad, &expected) < 1e-9);
    }

    #[test]
    fn test_probe_is_restored() {
        let x = arr1(&[3.0, 4.0]).into_dyn();
        let mut seen = Vec::new();
        eval_numerical_gradient(
            |v| {
                seen.push(v.clone());
                0.0
            },
            &x,
            0.5,
        );
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[2], arr1(&[3.0, 4.5]).into_dyn());
        assert_eq!(seen[3], arr1(&[3.0, 3.5]).into_dyn());
    }

    #[test]
    fn test_rel_error_floor_and_shape() {
        let zeros = arr1(&[0.0, 0.0]);
        assert_eq!(rel_error(&zeros, &zeros), 0.0);
        assert_eq!(rel_error(&arr1(&[1.0]), &arr1(&[1.0, 2.0])), f64::INFINITY);
    }
}
