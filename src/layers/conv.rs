//! Convolution layer (cross-correlation, no filter flip).
//!
//! Images in a batch are independent, so both passes fan out over the batch
//! axis with rayon. Per-image weight gradients are reduced afterwards in batch
//! order, which keeps the result identical from run to run.

use ndarray::{s, Array1, Array3, Array4, ArrayView3, Axis, Zip};
use rayon::prelude::*;

use crate::error::{ensure_shape, LayerError, LayerResult};
use crate::tensor::{crop_spatial, pad_spatial};

/// Stride and zero padding of a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvParam {
    pub stride: usize,
    pub pad: usize,
}

impl ConvParam {
    pub fn new(stride: usize, pad: usize) -> Self {
        Self { stride, pad }
    }

    /// Stride 1 with the padding that keeps the spatial size unchanged for an
    /// odd `filter_size`.
    pub fn same(filter_size: usize) -> LayerResult<Self> {
        if filter_size == 0 || filter_size % 2 == 0 {
            return Err(LayerError::invalid_config(
                "filter_size",
                filter_size,
                "same-size convolution needs an odd filter size",
            ));
        }
        Ok(Self::new(1, (filter_size - 1) / 2))
    }
}

/// Output extent `1 + (input + 2·pad − kernel) / stride` along one axis.
///
/// Fails unless the division is exact.
///
/// # Examples
///
/// ```
/// use convnet_core::layers::conv_output_dim;
///
/// assert_eq!(conv_output_dim(32, 7, 3, 1).unwrap(), 32);
/// assert_eq!(conv_output_dim(32, 7, 0, 1).unwrap(), 26);
/// assert!(conv_output_dim(5, 2, 0, 2).is_err());
/// ```
pub fn conv_output_dim(input: usize, kernel: usize, pad: usize, stride: usize) -> LayerResult<usize> {
    if stride == 0 {
        return Err(LayerError::invalid_config("stride", stride, "must be positive"));
    }
    let padded = input + 2 * pad;
    if kernel == 0 || kernel > padded {
        return Err(LayerError::invalid_config(
            "kernel",
            kernel,
            format!("must be between 1 and the padded input extent {}", padded),
        ));
    }
    let span = padded - kernel;
    if span % stride != 0 {
        return Err(LayerError::invalid_config(
            "stride",
            stride,
            format!(
                "(input {} + 2*pad {} - kernel {}) is not divisible by the stride",
                input, pad, kernel
            ),
        ));
    }
    Ok(1 + span / stride)
}

/// Values retained by [`conv_forward`] for [`conv_backward`].
#[derive(Debug, Clone)]
pub struct ConvCache {
    pub x: Array4<f64>,
    pub w: Array4<f64>,
    pub param: ConvParam,
}

/// Convolves `x: (N, C, H, W)` with `w: (F, C, HH, WW)` and adds `b: (F,)`.
///
/// Returns `(N, F, H', W')` where `H' = 1 + (H + 2·pad − HH) / stride` and
/// likewise for `W'`.
pub fn conv_forward(
    x: &Array4<f64>,
    w: &Array4<f64>,
    b: &Array1<f64>,
    param: &ConvParam,
) -> LayerResult<(Array4<f64>, ConvCache)> {
    let (n, c, h, width) = x.dim();
    let (f, wc, hh, ww) = w.dim();
    if wc != c {
        return Err(LayerError::shape_mismatch(
            "conv filter channels",
            &[f, c, hh, ww],
            w.shape(),
        ));
    }
    ensure_shape("conv bias", &[f], b.shape())?;
    let h_out = conv_output_dim(h, hh, param.pad, param.stride)?;
    let w_out = conv_output_dim(width, ww, param.pad, param.stride)?;
    let stride = param.stride;

    let mut out = Array4::zeros((n, f, h_out, w_out));
    Zip::from(out.axis_iter_mut(Axis(0)))
        .and(x.axis_iter(Axis(0)))
        .par_for_each(|mut out_n, x_n| {
            let padded = pad_spatial(x_n, param.pad);
            for k in 0..f {
                let filter = w.index_axis(Axis(0), k);
                for i in 0..h_out {
                    let r = i * stride;
                    for j in 0..w_out {
                        let col = j * stride;
                        let patch = padded.slice(s![.., r..r + hh, col..col + ww]);
                        out_n[[k, i, j]] = correlate(patch, filter) + b[k];
                    }
                }
            }
        });

    let cache = ConvCache {
        x: x.clone(),
        w: w.clone(),
        param: *param,
    };
    Ok((out, cache))
}

/// Backward pass for [`conv_forward`]; returns `(dx, dw, db)`.
pub fn conv_backward(
    dout: &Array4<f64>,
    cache: &ConvCache,
) -> LayerResult<(Array4<f64>, Array4<f64>, Array1<f64>)> {
    let ConvCache { x, w, param } = cache;
    let (n, _, h, width) = x.dim();
    let (f, _, hh, ww) = w.dim();
    let h_out = conv_output_dim(h, hh, param.pad, param.stride)?;
    let w_out = conv_output_dim(width, ww, param.pad, param.stride)?;
    ensure_shape("conv upstream gradient", &[n, f, h_out, w_out], dout.shape())?;
    let stride = param.stride;

    let partials: Vec<(Array3<f64>, Array4<f64>, Array1<f64>)> = (0..n)
        .into_par_iter()
        .map(|idx| {
            let padded = pad_spatial(x.index_axis(Axis(0), idx), param.pad);
            let dout_n = dout.index_axis(Axis(0), idx);
            let mut dpad = Array3::zeros(padded.raw_dim());
            let mut dw = Array4::zeros(w.raw_dim());
            let mut db = Array1::zeros(f);

            for k in 0..f {
                let filter = w.index_axis(Axis(0), k);
                for i in 0..h_out {
                    let r = i * stride;
                    for j in 0..w_out {
                        let col = j * stride;
                        let g = dout_n[[k, i, j]];
                        dw.index_axis_mut(Axis(0), k)
                            .scaled_add(g, &padded.slice(s![.., r..r + hh, col..col + ww]));
                        dpad.slice_mut(s![.., r..r + hh, col..col + ww])
                            .scaled_add(g, &filter);
                        db[k] += g;
                    }
                }
            }

            (crop_spatial(dpad.view(), param.pad), dw, db)
        })
        .collect();

    let mut dx = Array4::zeros(x.raw_dim());
    let mut dw = Array4::zeros(w.raw_dim());
    let mut db = Array1::zeros(f);
    for (idx, (dx_n, dw_n, db_n)) in partials.into_iter().enumerate() {
        dx.index_axis_mut(Axis(0), idx).assign(&dx_n);
        dw += &dw_n;
        db += &db_n;
    }
    Ok((dx, dw, db))
}

fn correlate(patch: ArrayView3<f64>, filter: ArrayView3<f64>) -> f64 {
    Zip::from(&patch)
        .and(&filter)
        .fold(0.0, |acc, &p, &q| acc + p * q)
}
