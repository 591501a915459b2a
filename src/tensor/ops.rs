use ndarray::{s, Array2, Array3, ArrayD, ArrayView3};

use crate::error::{LayerError, LayerResult};

/// Zero-pads the two trailing (spatial) axes of a `(C, H, W)` view by `pad`
/// on every side.
pub fn pad_spatial(x: ArrayView3<f64>, pad: usize) -> Array3<f64> {
    let (c, h, w) = x.dim();
    if pad == 0 {
        return x.to_owned();
    }
    let mut padded = Array3::zeros((c, h + 2 * pad, w + 2 * pad));
    padded
        .slice_mut(s![.., pad..pad + h, pad..pad + w])
        .assign(&x);
    padded
}

/// Inverse of [`pad_spatial`]: removes `pad` cells from every spatial border.
pub fn crop_spatial(x: ArrayView3<f64>, pad: usize) -> Array3<f64> {
    let (_, hp, wp) = x.dim();
    x.slice(s![.., pad..hp - pad, pad..wp - pad]).to_owned()
}

/// Reshapes an `(N, d_1, ..., d_k)` batch into `(N, d_1 * ... * d_k)`.
pub fn flatten_batch(x: &ArrayD<f64>) -> LayerResult<Array2<f64>> {
    let shape = x.shape();
    if shape.is_empty() {
        return Err(LayerError::shape_mismatch(
            "flatten batch (need a leading batch axis)",
            &[0, 0],
            shape,
        ));
    }
    let n = shape[0];
    let d: usize = shape[1..].iter().product();
    x.as_standard_layout()
        .into_owned()
        .into_shape((n, d))
        .map_err(|_| LayerError::shape_mismatch("flatten batch", &[n, d], shape))
}
