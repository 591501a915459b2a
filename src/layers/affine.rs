//! Fully-connected (affine) layer.

use ndarray::{Array1, Array2, ArrayD, Axis, IxDyn};

use crate::error::{ensure_shape, LayerError, LayerResult};
use crate::tensor::flatten_batch;

/// Values retained by [`affine_forward`] for [`affine_backward`].
#[derive(Debug, Clone)]
pub struct AffineCache {
    /// Input in its original `(N, d_1, ..., d_k)` shape
    pub x: ArrayD<f64>,
    pub w: Array2<f64>,
    pub b: Array1<f64>,
}

/// Computes `x_flat · w + b`.
///
/// `x` has shape `(N, d_1, ..., d_k)` and is flattened to `(N, D)` with
/// `D = d_1 * ... * d_k`; `w` is `(D, M)` and `b` is `(M,)`. The output is
/// `(N, M)`.
///
/// # Examples
///
/// ```
/// use convnet_core::layers::affine_forward;
/// use ndarray::{arr1, arr2};
///
/// let x = arr2(&[[1.0, 2.0]]).into_dyn();
/// let w = arr2(&[[1.0, 0.0, 1.0], [0.0, 1.0, 1.0]]);
/// let b = arr1(&[0.5, 0.5, 0.5]);
/// let (out, _cache) = affine_forward(&x, &w, &b).unwrap();
/// assert_eq!(out, arr2(&[[1.5, 2.5, 3.5]]));
/// ```
pub fn affine_forward(
    x: &ArrayD<f64>,
    w: &Array2<f64>,
    b: &Array1<f64>,
) -> LayerResult<(Array2<f64>, AffineCache)> {
    let x_flat = flatten_batch(x)?;
    let (d, m) = w.dim();
    if x_flat.ncols() != d {
        return Err(LayerError::shape_mismatch(
            "affine weight rows vs flattened input",
            &[x_flat.ncols(), m],
            &[d, m],
        ));
    }
    ensure_shape("affine bias", &[m], b.shape())?;

    let out = x_flat.dot(w) + b;
    let cache = AffineCache {
        x: x.clone(),
        w: w.clone(),
        b: b.clone(),
    };
    Ok((out, cache))
}

/// Backward pass for [`affine_forward`].
///
/// Returns `(dx, dw, db)` with `dx` reshaped back to the original input shape.
pub fn affine_backward(
    dout: &Array2<f64>,
    cache: &AffineCache,
) -> LayerResult<(ArrayD<f64>, Array2<f64>, Array1<f64>)> {
    let n = cache.x.shape()[0];
    let m = cache.w.ncols();
    ensure_shape("affine upstream gradient", &[n, m], dout.shape())?;

    let x_flat = flatten_batch(&cache.x)?;
    let dx = dout
        .dot(&cache.w.t())
        .into_shape(IxDyn(cache.x.shape()))
        .map_err(|_| LayerError::shape_mismatch("affine dx", cache.x.shape(), &[n, cache.w.nrows()]))?;
    let dw = x_flat.t().dot(dout);
    let db = dout.sum_axis(Axis(0));
    Ok((dx, dw, db))
}
