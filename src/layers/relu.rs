//! Rectified linear activation.

use ndarray::{Array, Dimension, Zip};

use crate::error::{ensure_shape, LayerResult};

/// Pre-activation input kept for [`relu_backward`].
#[derive(Debug, Clone)]
pub struct ReluCache<D: Dimension> {
    pub x: Array<f64, D>,
}

/// Elementwise `max(0, x)` over an array of any dimension.
pub fn relu_forward<D: Dimension>(x: &Array<f64, D>) -> (Array<f64, D>, ReluCache<D>) {
    let out = x.mapv(|v| v.max(0.0));
    (out, ReluCache { x: x.clone() })
}

/// Passes `dout` where the cached input was strictly positive, zero elsewhere.
pub fn relu_backward<D: Dimension>(
    dout: &Array<f64, D>,
    cache: &ReluCache<D>,
) -> LayerResult<Array<f64, D>> {
    ensure_shape("relu upstream gradient", cache.x.shape(), dout.shape())?;
    let mut dx = dout.clone();
    Zip::from(&mut dx).and(&cache.x).for_each(|g, &x| {
        if x <= 0.0 {
            *g = 0.0;
        }
    });
    Ok(dx)
}
