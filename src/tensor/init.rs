//! Parameter initialisation and storage precision.

use ndarray::{Array, Dimension, ShapeBuilder};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{LayerError, LayerResult};

/// Numeric precision parameters and inputs are stored at.
///
/// All arithmetic runs in `f64`. `Single` rounds every parameter (and every
/// input batch handed to the network) through `f32`, reproducing the values a
/// single-precision model would hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Single,
    #[default]
    Double,
}

impl Precision {
    /// Rounds `array` to this precision in place.
    pub fn round<D: Dimension>(self, array: &mut Array<f64, D>) {
        if self == Precision::Single {
            array.mapv_inplace(|v| v as f32 as f64);
        }
    }

    /// Returns a copy of `array` rounded to this precision.
    pub fn rounded<D: Dimension>(self, mut array: Array<f64, D>) -> Array<f64, D> {
        self.round(&mut array);
        array
    }
}

/// Draws an array of the given shape from `N(0, std²)`.
///
/// # Examples
///
/// ```
/// use convnet_core::tensor::gaussian;
/// use rand::{rngs::StdRng, SeedableRng};
///
/// let mut rng = StdRng::seed_from_u64(7);
/// let w = gaussian((4, 3), 1e-3, &mut rng).unwrap();
/// assert_eq!(w.dim(), (4, 3));
/// ```
pub fn gaussian<Sh, D, R>(shape: Sh, std: f64, rng: &mut R) -> LayerResult<Array<f64, D>>
where
    Sh: ShapeBuilder<Dim = D>,
    D: Dimension,
    R: Rng + ?Sized,
{
    if !(std.is_finite() && std >= 0.0) {
        return Err(LayerError::invalid_config("weight_scale", std, "must be finite and non-negative"));
    }
    let normal = Normal::new(0.0, std)
        .map_err(|err| LayerError::invalid_config("weight_scale", std, err.to_string()))?;
    Ok(Array::from_shape_simple_fn(shape, || normal.sample(&mut *rng)))
}
