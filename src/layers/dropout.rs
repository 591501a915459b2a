//! Dropout with a per-feature mask shared across the batch.
//!
//! `p` is the probability that a feature is dropped. Surviving features pass
//! through unscaled, so train-mode activations are on average `(1 − p)` times
//! their eval-mode value.

use ndarray::{ArrayD, IxDyn};
use rand::distributions::{Bernoulli, Distribution};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{ensure_shape, LayerError, LayerResult};
use crate::layers::Mode;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DropoutParam {
    /// Drop probability in `[0, 1]`
    pub p: f64,
    /// When set, every forward call draws its mask from a fresh RNG seeded
    /// with this value
    pub seed: Option<u64>,
}

impl DropoutParam {
    pub fn new(p: f64) -> Self {
        Self { p, seed: None }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> LayerResult<()> {
        self.distribution().map(|_| ())
    }

    fn distribution(&self) -> LayerResult<Bernoulli> {
        Bernoulli::new(self.p)
            .map_err(|_| LayerError::invalid_config("dropout p", self.p, "must lie in [0, 1]"))
    }
}

/// Mode and keep-mask retained by [`dropout_forward`].
#[derive(Debug, Clone)]
pub struct DropoutCache {
    pub mode: Mode,
    /// 1.0 for kept features, 0.0 for dropped ones; shaped like one sample.
    /// `None` in eval mode.
    pub mask: Option<ArrayD<f64>>,
    pub input_shape: Vec<usize>,
}

/// Applies dropout to `x: (N, ...)`.
///
/// Train mode draws one Bernoulli(p) flag per feature and zeroes the dropped
/// features in every sample. Eval mode returns `x` unchanged and consumes no
/// randomness.
pub fn dropout_forward<R: Rng + ?Sized>(
    x: &ArrayD<f64>,
    param: &DropoutParam,
    mode: Mode,
    rng: &mut R,
) -> LayerResult<(ArrayD<f64>, DropoutCache)> {
    let dist = param.distribution()?;
    if x.ndim() == 0 {
        return Err(LayerError::shape_mismatch("dropout input", &[0, 0], x.shape()));
    }
    let input_shape = x.shape().to_vec();

    match mode {
        Mode::Train => {
            let feature_shape = IxDyn(&input_shape[1..]);
            let mask = match param.seed {
                Some(seed) => keep_mask(feature_shape, &dist, &mut StdRng::seed_from_u64(seed)),
                None => keep_mask(feature_shape, &dist, rng),
            };
            let out = x * &mask;
            let cache = DropoutCache {
                mode,
                mask: Some(mask),
                input_shape,
            };
            Ok((out, cache))
        }
        Mode::Eval => {
            let cache = DropoutCache {
                mode,
                mask: None,
                input_shape,
            };
            Ok((x.clone(), cache))
        }
    }
}

/// Backward pass for [`dropout_forward`].
pub fn dropout_backward(dout: &ArrayD<f64>, cache: &DropoutCache) -> LayerResult<ArrayD<f64>> {
    ensure_shape("dropout upstream gradient", &cache.input_shape, dout.shape())?;
    match (&cache.mode, &cache.mask) {
        (Mode::Train, Some(mask)) => Ok(dout * mask),
        _ => Ok(dout.clone()),
    }
}

fn keep_mask<R: Rng + ?Sized>(shape: IxDyn, dist: &Bernoulli, rng: &mut R) -> ArrayD<f64> {
    ArrayD::from_shape_simple_fn(shape, || if dist.sample(&mut *rng) { 0.0 } else { 1.0 })
}
