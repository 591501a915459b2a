//! Batch normalization, per feature and per channel (spatial).
//!
//! Train mode normalises with the statistics of the current batch and folds
//! them into [`RunningStats`]; eval mode normalises with the running
//! statistics and leaves them untouched.
//!
//! ```text
//! x̂   = (x − μ) / √(σ² + eps)
//! out = γ · x̂ + β
//! running = momentum · running + (1 − momentum) · batch
//! ```

use ndarray::{Array1, Array2, Array4, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{ensure_shape, LayerError, LayerResult};
use crate::layers::Mode;

/// Static hyperparameters of a batch-norm layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchNormParam {
    /// Added to the variance before the square root
    pub eps: f64,
    /// Weight of the previous running value in each update
    pub momentum: f64,
}

impl Default for BatchNormParam {
    fn default() -> Self {
        Self {
            eps: 1e-5,
            momentum: 0.9,
        }
    }
}

impl BatchNormParam {
    /// Rejects non-positive `eps` and `momentum` outside `[0, 1]`.
    pub fn validate(&self) -> LayerResult<()> {
        if !(self.eps.is_finite() && self.eps > 0.0) {
            return Err(LayerError::invalid_config("eps", self.eps, "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.momentum) {
            return Err(LayerError::invalid_config(
                "momentum",
                self.momentum,
                "must lie in [0, 1]",
            ));
        }
        Ok(())
    }
}

/// Exponentially decayed per-feature mean and variance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    pub mean: Array1<f64>,
    pub var: Array1<f64>,
}

impl RunningStats {
    /// Zero mean and zero variance for `features` features.
    pub fn new(features: usize) -> Self {
        Self {
            mean: Array1::zeros(features),
            var: Array1::zeros(features),
        }
    }

    pub fn features(&self) -> usize {
        self.mean.len()
    }

    fn update(&mut self, mean: &Array1<f64>, var: &Array1<f64>, momentum: f64) {
        self.mean = &self.mean * momentum + &(mean * (1.0 - momentum));
        self.var = &self.var * momentum + &(var * (1.0 - momentum));
    }
}

/// Values retained by [`batchnorm_forward`] for the backward passes.
#[derive(Debug, Clone)]
pub enum BatchNormCache {
    Train {
        x_centered: Array2<f64>,
        x_hat: Array2<f64>,
        var: Array1<f64>,
        inv_std: Array1<f64>,
        gamma: Array1<f64>,
        eps: f64,
    },
    Eval {
        x_hat: Array2<f64>,
        inv_std: Array1<f64>,
        gamma: Array1<f64>,
    },
}

impl BatchNormCache {
    fn x_hat(&self) -> &Array2<f64> {
        match self {
            BatchNormCache::Train { x_hat, .. } | BatchNormCache::Eval { x_hat, .. } => x_hat,
        }
    }
}

/// Normalises `x: (N, D)` per feature and applies `gamma`/`beta`.
///
/// In [`Mode::Train`] `stats` is updated as a side effect; in [`Mode::Eval`]
/// it is only read.
pub fn batchnorm_forward(
    x: &Array2<f64>,
    gamma: &Array1<f64>,
    beta: &Array1<f64>,
    param: &BatchNormParam,
    mode: Mode,
    stats: &mut RunningStats,
) -> LayerResult<(Array2<f64>, BatchNormCache)> {
    let (n, d) = x.dim();
    ensure_shape("batchnorm gamma", &[d], gamma.shape())?;
    ensure_shape("batchnorm beta", &[d], beta.shape())?;
    ensure_shape("batchnorm running mean", &[d], stats.mean.shape())?;
    ensure_shape("batchnorm running var", &[d], stats.var.shape())?;

    match mode {
        Mode::Train => {
            let mean = x
                .mean_axis(Axis(0))
                .ok_or_else(|| LayerError::shape_mismatch("batchnorm batch", &[1, d], &[n, d]))?;
            let x_centered = x - &mean;
            let var = x_centered
                .mapv(|v| v * v)
                .mean_axis(Axis(0))
                .ok_or_else(|| LayerError::shape_mismatch("batchnorm batch", &[1, d], &[n, d]))?;
            let inv_std = var.mapv(|v| 1.0 / (v + param.eps).sqrt());
            let x_hat = &x_centered * &inv_std;
            let out = &x_hat * gamma + beta;

            stats.update(&mean, &var, param.momentum);

            let cache = BatchNormCache::Train {
                x_centered,
                x_hat,
                var,
                inv_std,
                gamma: gamma.clone(),
                eps: param.eps,
            };
            Ok((out, cache))
        }
        Mode::Eval => {
            if d > 0 && stats.var.iter().all(|&v| v == 0.0) {
                tracing::warn!(
                    "batch norm evaluated with all-zero running variance; statistics were never updated"
                );
            }
            let inv_std = stats.var.mapv(|v| 1.0 / (v + param.eps).sqrt());
            let x_hat = (x - &stats.mean) * &inv_std;
            let out = &x_hat * gamma + beta;
            let cache = BatchNormCache::Eval {
                x_hat,
                inv_std,
                gamma: gamma.clone(),
            };
            Ok((out, cache))
        }
    }
}

/// Backward pass for [`batchnorm_forward`], following the computation graph
/// node by node. Returns `(dx, dgamma, dbeta)`.
pub fn batchnorm_backward(
    dout: &Array2<f64>,
    cache: &BatchNormCache,
) -> LayerResult<(Array2<f64>, Array1<f64>, Array1<f64>)> {
    ensure_shape("batchnorm upstream gradient", cache.x_hat().shape(), dout.shape())?;
    let dbeta = dout.sum_axis(Axis(0));
    let dgamma = (dout * cache.x_hat()).sum_axis(Axis(0));

    let dx = match cache {
        BatchNormCache::Train {
            x_centered,
            var,
            inv_std,
            gamma,
            eps,
            ..
        } => {
            let n = dout.nrows() as f64;
            let std = var.mapv(|v| (v + eps).sqrt());

            let dx_hat = dout * gamma;
            let mut dx_centered = &dx_hat * inv_std;
            let dinv_std = (&dx_hat * x_centered).sum_axis(Axis(0));
            let dstd = -&dinv_std / &std.mapv(|s| s * s);
            let dvar = &dstd / &(&std * 2.0);
            let dsquares = dvar / n;
            dx_centered = dx_centered + &(x_centered * &dsquares * 2.0);
            let dmean = -dx_centered.sum_axis(Axis(0));
            dx_centered + &(dmean / n)
        }
        BatchNormCache::Eval { inv_std, gamma, .. } => dout * &(gamma * inv_std),
    };
    Ok((dx, dgamma, dbeta))
}

/// Backward pass for [`batchnorm_forward`] in simplified closed form:
///
/// ```text
/// dx = γ / (N·√(σ² + eps)) · (N·dout − Σ dout − x̂ · Σ(dout · x̂))
/// ```
pub fn batchnorm_backward_alt(
    dout: &Array2<f64>,
    cache: &BatchNormCache,
) -> LayerResult<(Array2<f64>, Array1<f64>, Array1<f64>)> {
    ensure_shape("batchnorm upstream gradient", cache.x_hat().shape(), dout.shape())?;
    let x_hat = cache.x_hat();
    let dbeta = dout.sum_axis(Axis(0));
    let dgamma = (dout * x_hat).sum_axis(Axis(0));

    let dx = match cache {
        BatchNormCache::Train { inv_std, gamma, .. } => {
            let n = dout.nrows() as f64;
            let scale = gamma * inv_std / n;
            (dout * n - &dbeta - &(x_hat * &dgamma)) * &scale
        }
        BatchNormCache::Eval { inv_std, gamma, .. } => dout * &(gamma * inv_std),
    };
    Ok((dx, dgamma, dbeta))
}

/// Values retained by [`spatial_batchnorm_forward`].
#[derive(Debug, Clone)]
pub struct SpatialBatchNormCache {
    pub inner: BatchNormCache,
    pub input_dim: (usize, usize, usize, usize),
}

/// Batch normalization over `(N, C, H, W)` with statistics per channel,
/// pooled over the batch and both spatial axes.
pub fn spatial_batchnorm_forward(
    x: &Array4<f64>,
    gamma: &Array1<f64>,
    beta: &Array1<f64>,
    param: &BatchNormParam,
    mode: Mode,
    stats: &mut RunningStats,
) -> LayerResult<(Array4<f64>, SpatialBatchNormCache)> {
    let input_dim = x.dim();
    let rows = channels_last_rows(x)?;
    let (out_rows, inner) = batchnorm_forward(&rows, gamma, beta, param, mode, stats)?;
    let out = channels_first(out_rows, input_dim)?;
    Ok((out, SpatialBatchNormCache { inner, input_dim }))
}

/// Backward pass for [`spatial_batchnorm_forward`]; returns `(dx, dgamma, dbeta)`.
pub fn spatial_batchnorm_backward(
    dout: &Array4<f64>,
    cache: &SpatialBatchNormCache,
) -> LayerResult<(Array4<f64>, Array1<f64>, Array1<f64>)> {
    let (n, c, h, w) = cache.input_dim;
    ensure_shape("spatial batchnorm upstream gradient", &[n, c, h, w], dout.shape())?;
    let rows = channels_last_rows(dout)?;
    let (dx_rows, dgamma, dbeta) = batchnorm_backward_alt(&rows, &cache.inner)?;
    let dx = channels_first(dx_rows, cache.input_dim)?;
    Ok((dx, dgamma, dbeta))
}

/// `(N, C, H, W)` → `(N·H·W, C)`.
fn channels_last_rows(x: &Array4<f64>) -> LayerResult<Array2<f64>> {
    let (n, c, h, w) = x.dim();
    x.view()
        .permuted_axes([0, 2, 3, 1])
        .as_standard_layout()
        .into_owned()
        .into_shape((n * h * w, c))
        .map_err(|_| LayerError::shape_mismatch("spatial batchnorm rows", &[n * h * w, c], x.shape()))
}

/// `(N·H·W, C)` → `(N, C, H, W)`.
fn channels_first(
    rows: Array2<f64>,
    (n, c, h, w): (usize, usize, usize, usize),
) -> LayerResult<Array4<f64>> {
    let got = rows.shape().to_vec();
    let nhwc = rows
        .into_shape((n, h, w, c))
        .map_err(|_| LayerError::shape_mismatch("spatial batchnorm output", &[n * h * w, c], &got))?;
    Ok(nhwc.permuted_axes([0, 3, 1, 2]).as_standard_layout().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradient_check::{eval_numerical_gradient_array, rel_error};
    use crate::tensor::gaussian;
    use ndarray::{arr1, Array};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sample(shape: (usize, usize), seed: u64, shift: f64, scale: f64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        gaussian(shape, 1.0, &mut rng).expect("normal").mapv(|v| v * scale + shift)
    }

    #[test]
    fn test_train_forward_normalises_batch() {
        let x = sample((200, 3), 1, 12.0, 7.0);
        let gamma = arr1(&[1.0, 2.0, 3.0]);
        let beta = arr1(&[11.0, 12.0, 13.0]);
        let mut stats = RunningStats::new(3);
        let (out, _) = batchnorm_forward(&x, &gamma, &beta, &BatchNormParam::default(), Mode::Train, &mut stats)
            .expect("forward");

        let mean = out.mean_axis(Axis(0)).expect("mean");
        let std = out.std_axis(Axis(0), 0.0);
        for j in 0..3 {
            assert!((mean[j] - beta[j]).abs() < 1e-8);
            assert!((std[j] - gamma[j]).abs() < 1e-3);
        }
    }

    #[test]
    fn test_running_stats_update_with_momentum() {
        let x = Array::from_shape_vec((2, 2), vec![1.0, 10.0, 3.0, 30.0]).expect("shape");
        let mut stats = RunningStats::new(2);
        let param = BatchNormParam {
            eps: 1e-5,
            momentum: 0.9,
        };
        batchnorm_forward(&x, &Array1::ones(2), &Array1::zeros(2), &param, Mode::Train, &mut stats)
            .expect("forward");
        assert!((stats.mean[0] - 0.2).abs() < 1e-12);
        assert!((stats.mean[1] - 2.0).abs() < 1e-12);
        assert!((stats.var[0] - 0.1).abs() < 1e-12);
        assert!((stats.var[1] - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_eval_uses_running_statistics() {
        let param = BatchNormParam::default();
        let gamma = Array1::ones(4);
        let beta = Array1::zeros(4);
        let mut stats = RunningStats::new(4);
        for seed in 0..200 {
            let x = sample((50, 4), seed, 5.0, 3.0);
            batchnorm_forward(&x, &gamma, &beta, &param, Mode::Train, &mut stats).expect("train");
        }

        let frozen = stats.clone();
        let x = sample((500, 4), 9_999, 5.0, 3.0);
        let (out, _) = batchnorm_forward(&x, &gamma, &beta, &param, Mode::Eval, &mut stats).expect("eval");
        let (again, _) = batchnorm_forward(&x, &gamma, &beta, &param, Mode::Eval, &mut stats).expect("eval");

        assert_eq!(stats, frozen);
        assert_eq!(out, again);
        let mean = out.mean_axis(Axis(0)).expect("mean");
        let std = out.std_axis(Axis(0), 0.0);
        for j in 0..4 {
            assert!(mean[j].abs() < 0.2, "mean {}", mean[j]);
            assert!((std[j] - 1.0).abs() < 0.2, "std {}", std[j]);
        }
    }

    #[test]
    fn test_backward_numeric() {
        let x = sample((4, 5), 3, 5.0, 2.0);
        let gamma = sample((1, 5), 4, 0.0, 1.0).row(0).to_owned();
        let beta = sample((1, 5), 5, 0.0, 1.0).row(0).to_owned();
        let dout = sample((4, 5), 6, 0.0, 1.0);
        let param = BatchNormParam::default();

        let fwd = |x: &Array2<f64>, g: &Array1<f64>, b: &Array1<f64>| {
            let mut stats = RunningStats::new(5);
            batchnorm_forward(x, g, b, &param, Mode::Train, &mut stats)
                .expect("forward")
                .0
                .into_dyn()
        };

        let mut stats = RunningStats::new(5);
        let (_, cache) = batchnorm_forward(&x, &gamma, &beta, &param, Mode::Train, &mut stats).expect("forward");
        let (dx, dgamma, dbeta) = batchnorm_backward(&dout, &cache).expect("backward");

        let dout_d = dout.clone().into_dyn();
        let dx_num = eval_numerical_gradient_array(
            |xv| fwd(&xv.clone().into_dimensionality().expect("2d"), &gamma, &beta),
            &x.clone().into_dyn(),
            &dout_d,
            1e-5,
        );
        let dgamma_num = eval_numerical_gradient_array(
            |gv| fwd(&x, &gv.clone().into_dimensionality().expect("1d"), &beta),
            &gamma.clone().into_dyn(),
            &dout_d,
            1e-5,
        );
        let dbeta_num = eval_numerical_gradient_array(
            |bv| fwd(&x, &gamma, &bv.clone().into_dimensionality().expect("1d")),
            &beta.clone().into_dyn(),
            &dout_d,
            1e-5,
        );

        assert!(rel_error(&dx.into_dyn(), &dx_num) < 1e-6);
        assert!(rel_error(&dgamma.into_dyn(), &dgamma_num) < 1e-6);
        assert!(rel_error(&dbeta.into_dyn(), &dbeta_num) < 1e-6);
    }

    #[test]
    fn test_closed_form_agrees_with_graph_form() {
        let x = sample((50, 6), 7, -3.0, 4.0);
        let gamma = sample((1, 6), 8, 1.0, 0.5).row(0).to_owned();
        let beta = sample((1, 6), 9, 0.0, 1.0).row(0).to_owned();
        let dout = sample((50, 6), 10, 0.0, 1.0);
        let mut stats = RunningStats::new(6);
        let (_, cache) = batchnorm_forward(&x, &gamma, &beta, &BatchNormParam::default(), Mode::Train, &mut stats)
            .expect("forward");

        let (dx1, dgamma1, dbeta1) = batchnorm_backward(&dout, &cache).expect("graph");
        let (dx2, dgamma2, dbeta2) = batchnorm_backward_alt(&dout, &cache).expect("closed form");
        assert!(rel_error(&dx1, &dx2) < 1e-9);
        assert!(rel_error(&dgamma1, &dgamma2) < 1e-12);
        assert!(rel_error(&dbeta1, &dbeta2) < 1e-12);
    }

    #[test]
    fn test_eval_backward_numeric() {
        let x = sample((3, 4), 11, 0.0, 1.0);
        let gamma = arr1(&[0.5, 1.5, -1.0, 2.0]);
        let beta = arr1(&[0.1, 0.2, 0.3, 0.4]);
        let dout = sample((3, 4), 12, 0.0, 1.0);
        let param = BatchNormParam::default();
        let mut stats = RunningStats {
            mean: arr1(&[0.1, -0.2, 0.3, 0.0]),
            var: arr1(&[1.0, 2.0, 0.5, 4.0]),
        };

        let (_, cache) = batchnorm_forward(&x, &gamma, &beta, &param, Mode::Eval, &mut stats).expect("forward");
        let (dx, _, _) = batchnorm_backward(&dout, &cache).expect("backward");
        let (dx_alt, _, _) = batchnorm_backward_alt(&dout, &cache).expect("backward");
        let dx_num = eval_numerical_gradient_array(
            |xv| {
                let xv: Array2<f64> = xv.clone().into_dimensionality().expect("2d");
                let mut s = stats.clone();
                batchnorm_forward(&xv, &gamma, &beta, &param, Mode::Eval, &mut s)
                    .expect("forward")
                    .0
                    .into_dyn()
            },
            &x.clone().into_dyn(),
            &dout.into_dyn(),
            1e-5,
        );
        assert!(rel_error(&dx.clone().into_dyn(), &dx_num) < 1e-6);
        assert_eq!(dx, dx_alt);
    }

    fn sample4(shape: (usize, usize, usize, usize), seed: u64, shift: f64, scale: f64) -> Array4<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        gaussian(shape, 1.0, &mut rng).expect("normal").mapv(|v| v * scale + shift)
    }

    #[test]
    fn test_spatial_train_forward_per_channel() {
        let x = sample4((10, 3, 4, 5), 13, 10.0, 4.0);
        let gamma = arr1(&[3.0, 4.0, 5.0]);
        let beta = arr1(&[6.0, 7.0, 8.0]);
        let mut stats = RunningStats::new(3);
        let (out, _) =
            spatial_batchnorm_forward(&x, &gamma, &beta, &BatchNormParam::default(), Mode::Train, &mut stats)
                .expect("forward");
        assert_eq!(out.dim(), x.dim());

        for ch in 0..3 {
            let channel = out.index_axis(Axis(1), ch);
            let mean = channel.mean().expect("mean");
            let std = channel.mapv(|v| (v - mean) * (v - mean)).mean().expect("var").sqrt();
            assert!((mean - beta[ch]).abs() < 1e-8);
            assert!((std - gamma[ch]).abs() < 1e-3);
        }
        assert!(stats.mean.iter().all(|&m| (m - 1.0).abs() < 0.3));
    }

    #[test]
    fn test_spatial_backward_numeric() {
        let x = sample4((2, 3, 4, 5), 14, 2.0, 3.0);
        let gamma = arr1(&[1.2, -0.7, 0.4]);
        let beta = arr1(&[0.3, 0.0, -0.5]);
        let dout = sample4((2, 3, 4, 5), 15, 0.0, 1.0);
        let param = BatchNormParam::default();

        let mut stats = RunningStats::new(3);
        let (_, cache) =
            spatial_batchnorm_forward(&x, &gamma, &beta, &param, Mode::Train, &mut stats).expect("forward");
        let (dx, dgamma, dbeta) = spatial_batchnorm_backward(&dout, &cache).expect("backward");
        assert_eq!(dx.dim(), x.dim());
        assert_eq!(dgamma.dim(), 3);
        assert_eq!(dbeta.dim(), 3);

        let dx_num = eval_numerical_gradient_array(
            |xv| {
                let xv: Array4<f64> = xv.clone().into_dimensionality().expect("4d");
                let mut s = RunningStats::new(3);
                spatial_batchnorm_forward(&xv, &gamma, &beta, &param, Mode::Train, &mut s)
                    .expect("forward")
                    .0
                    .into_dyn()
            },
            &x.clone().into_dyn(),
            &dout.clone().into_dyn(),
            1e-5,
        );
        let dgamma_num = eval_numerical_gradient_array(
            |gv| {
                let gv: Array1<f64> = gv.clone().into_dimensionality().expect("1d");
                let mut s = RunningStats::new(3);
                spatial_batchnorm_forward(&x, &gv, &beta, &param, Mode::Train, &mut s)
                    .expect("forward")
                    .0
                    .into_dyn()
            },
            &gamma.clone().into_dyn(),
            &dout.clone().into_dyn(),
            1e-5,
        );
        let dbeta_num = eval_numerical_gradient_array(
            |bv| {
                let bv: Array1<f64> = bv.clone().into_dimensionality().expect("1d");
                let mut s = RunningStats::new(3);
                spatial_batchnorm_forward(&x, &gamma, &bv, &param, Mode::Train, &mut s)
                    .expect("forward")
                    .0
                    .into_dyn()
            },
            &beta.clone().into_dyn(),
            &dout.into_dyn(),
            1e-5,
        );
        assert!(rel_error(&dx.into_dyn(), &dx_num) < 1e-6);
        assert!(rel_error(&dgamma.into_dyn(), &dgamma_num) < 1e-6);
        assert!(rel_error(&dbeta.into_dyn(), &dbeta_num) < 1e-6);
    }

    #[test]
    fn test_parameter_shape_mismatch() {
        let x = Array2::zeros((4, 3));
        let mut stats = RunningStats::new(3);
        let err = batchnorm_forward(
            &x,
            &Array1::ones(2),
            &Array1::zeros(3),
            &BatchNormParam::default(),
            Mode::Train,
            &mut stats,
        )
        .expect_err("gamma has 2 entries");
        assert!(matches!(err, LayerError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_param_validation() {
        assert!(BatchNormParam::default().validate().is_ok());
        let bad = BatchNormParam {
            eps: 0.0,
            momentum: 0.9,
        };
        assert!(bad.validate().is_err());
        let bad = BatchNormParam {
            eps: 1e-5,
            momentum: 1.5,
        };
        assert!(bad.validate().is_err());
    }
}
