//! Max-pooling layer with argmax routing.

use ndarray::{Array4, Axis, Zip};

use crate::error::{ensure_shape, LayerResult};
use crate::layers::conv::conv_output_dim;

/// Window size and stride of a max-pooling layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolParam {
    pub pool_height: usize,
    pub pool_width: usize,
    pub stride: usize,
}

impl PoolParam {
    pub fn new(pool_height: usize, pool_width: usize, stride: usize) -> Self {
        Self {
            pool_height,
            pool_width,
            stride,
        }
    }

    /// Non-overlapping 2×2 windows.
    pub fn halving() -> Self {
        Self::new(2, 2, 2)
    }
}

/// Output extent `1 + (input − window) / stride`; fails unless exact.
pub fn pool_output_dim(input: usize, window: usize, stride: usize) -> LayerResult<usize> {
    conv_output_dim(input, window, 0, stride)
}

/// Values retained by [`max_pool_forward`] for [`max_pool_backward`].
///
/// `argmax[[n, c, i, j]]` is the row-major offset of the winning element
/// inside window `(i, j)`.
#[derive(Debug, Clone)]
pub struct PoolCache {
    pub input_dim: (usize, usize, usize, usize),
    pub argmax: Array4<usize>,
    pub param: PoolParam,
}

/// Max-pools `x: (N, C, H, W)` into `(N, C, H', W')`.
///
/// Ties resolve to the first maximum in row-major scan order.
pub fn max_pool_forward(x: &Array4<f64>, param: &PoolParam) -> LayerResult<(Array4<f64>, PoolCache)> {
    let (n, c, h, w) = x.dim();
    let (ph, pw, stride) = (param.pool_height, param.pool_width, param.stride);
    let h_out = pool_output_dim(h, ph, stride)?;
    let w_out = pool_output_dim(w, pw, stride)?;

    let mut out = Array4::zeros((n, c, h_out, w_out));
    let mut argmax = Array4::zeros((n, c, h_out, w_out));
    Zip::from(out.axis_iter_mut(Axis(0)))
        .and(argmax.axis_iter_mut(Axis(0)))
        .and(x.axis_iter(Axis(0)))
        .par_for_each(|mut out_n, mut arg_n, x_n| {
            for ch in 0..c {
                for i in 0..h_out {
                    for j in 0..w_out {
                        let (r0, c0) = (i * stride, j * stride);
                        let mut best = f64::NEG_INFINITY;
                        let mut best_idx = 0;
                        for dr in 0..ph {
                            for dc in 0..pw {
                                let v = x_n[[ch, r0 + dr, c0 + dc]];
                                if v > best || (dr == 0 && dc == 0) {
                                    best = v;
                                    best_idx = dr * pw + dc;
                                }
                            }
                        }
                        out_n[[ch, i, j]] = best;
                        arg_n[[ch, i, j]] = best_idx;
                    }
                }
            }
        });

    let cache = PoolCache {
        input_dim: (n, c, h, w),
        argmax,
        param: *param,
    };
    Ok((out, cache))
}

/// Routes each upstream value to the input position that won its window.
pub fn max_pool_backward(dout: &Array4<f64>, cache: &PoolCache) -> LayerResult<Array4<f64>> {
    ensure_shape("max-pool upstream gradient", cache.argmax.shape(), dout.shape())?;
    let PoolParam {
        pool_width: pw,
        stride,
        ..
    } = cache.param;

    let mut dx = Array4::zeros(cache.input_dim);
    Zip::from(dx.axis_iter_mut(Axis(0)))
        .and(dout.axis_iter(Axis(0)))
        .and(cache.argmax.axis_iter(Axis(0)))
        .par_for_each(|mut dx_n, dout_n, arg_n| {
            for ((ch, i, j), &offset) in arg_n.indexed_iter() {
                let r = i * stride + offset / pw;
                let col = j * stride + offset % pw;
                dx_n[[ch, r, col]] += dout_n[[ch, i, j]];
            }
        });
    Ok(dx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LayerError;
    use crate::gradient_check::{eval_numerical_gradient_array, rel_error};
    use ndarray::{arr2, Array};

    fn scenario_input() -> Array4<f64> {
        arr2(&[
            [1.0, 2.0, 5.0, 6.0],
            [3.0, 4.0, 7.0, 8.0],
            [9.0, 1.0, 2.0, 3.0],
            [1.0, 1.0, 4.0, 2.0],
        ])
        .into_shape((1, 1, 4, 4))
        .expect("reshape")
    }

    #[test]
    fn test_pooling_scenario() {
        let x = scenario_input();
        let (out, cache) = max_pool_forward(&x, &PoolParam::halving()).expect("forward");
        let expected = arr2(&[[4.0, 8.0], [9.0, 4.0]]).into_shape((1, 1, 2, 2)).expect("reshape");
        assert_eq!(out, expected);

        let dx = max_pool_backward(&Array4::ones((1, 1, 2, 2)), &cache).expect("backward");
        let expected_dx = arr2(&[
            [0.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 1.0],
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ])
        .into_shape((1, 1, 4, 4))
        .expect("reshape");
        assert_eq!(dx, expected_dx);
    }

    #[test]
    fn test_ties_pick_first_in_scan_order() {
        let x = Array4::from_elem((1, 1, 2, 2), 3.0);
        let (_, cache) = max_pool_forward(&x, &PoolParam::halving()).expect("forward");
        assert_eq!(cache.argmax[[0, 0, 0, 0]], 0);
    }

    #[test]
    fn test_pool_forward_matches_reference() {
        let x = Array::linspace(-0.3, 0.4, 2 * 3 * 4 * 4)
            .into_shape((2, 3, 4, 4))
            .expect("reshape");
        let (out, _) = max_pool_forward(&x, &PoolParam::halving()).expect("forward");
        let expected = Array::from_shape_vec(
            (2, 3, 2, 2),
            vec![
                -0.26315789, -0.24842105, -0.20421053, -0.18947368, //
                -0.14526316, -0.13052632, -0.08631579, -0.07157895, //
                -0.02736842, -0.01263158, 0.03157895, 0.04631579, //
                0.09052632, 0.10526316, 0.14947368, 0.16421053, //
                0.20842105, 0.22315789, 0.26736842, 0.28210526, //
                0.32631579, 0.34105263, 0.38526316, 0.4,
            ],
        )
        .expect("reshape");
        assert!(rel_error(&out, &expected) < 1e-6);
    }

    #[test]
    fn test_pool_backward_numeric() {
        let x = Array4::from_shape_fn((3, 2, 8, 8), |(a, b, c, d)| {
            ((a * 131 + b * 61 + c * 8 + d) as f64 * 1.618).sin()
        });
        let param = PoolParam::halving();
        let (out, cache) = max_pool_forward(&x, &param).expect("forward");
        let dout = out.mapv(|v| (v * 5.0).cos());
        let dx = max_pool_backward(&dout, &cache).expect("backward");
        assert_eq!(dx.dim(), x.dim());

        let dx_num = eval_numerical_gradient_array(
            |xv| {
                let xv: Array4<f64> = xv.clone().into_dimensionality().expect("4d");
                max_pool_forward(&xv, &param).expect("forward").0.into_dyn()
            },
            &x.clone().into_dyn(),
            &dout.into_dyn(),
            1e-6,
        );
        assert!(rel_error(&dx.into_dyn(), &dx_num) < 1e-6);
    }

    #[test]
    fn test_overlapping_windows_accumulate() {
        let x = arr2(&[[0.0, 0.0, 0.0], [0.0, 5.0, 0.0], [0.0, 0.0, 0.0]])
            .into_shape((1, 1, 3, 3))
            .expect("reshape");
        let (out, cache) = max_pool_forward(&x, &PoolParam::new(2, 2, 1)).expect("forward");
        assert!(out.iter().all(|&v| v == 5.0));
        let dx = max_pool_backward(&Array4::ones((1, 1, 2, 2)), &cache).expect("backward");
        assert_eq!(dx[[0, 0, 1, 1]], 4.0);
        assert_eq!(dx.sum(), 4.0);
    }

    #[test]
    fn test_non_integral_output_is_rejected() {
        let x = Array4::zeros((1, 1, 5, 5));
        let err = max_pool_forward(&x, &PoolParam::halving()).expect_err("odd extent");
        assert!(matches!(err, LayerError::InvalidConfiguration { .. }));
    }
}
