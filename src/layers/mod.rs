//! Numeric layers with independent forward and backward passes.
//!
//! Every `*_forward` function returns its output together with a cache; the
//! matching `*_backward` consumes that cache and the upstream gradient and
//! returns gradients shaped exactly like the forward inputs.

pub mod affine;
pub mod batchnorm;
pub mod blocks;
pub mod conv;
pub mod dropout;
pub mod loss;
pub mod pool;
pub mod relu;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LayerError;

pub use affine::{affine_backward, affine_forward, AffineCache};
pub use batchnorm::{
    batchnorm_backward, batchnorm_backward_alt, batchnorm_forward, spatial_batchnorm_backward,
    spatial_batchnorm_forward, BatchNormCache, BatchNormParam, RunningStats, SpatialBatchNormCache,
};
pub use conv::{conv_backward, conv_forward, conv_output_dim, ConvCache, ConvParam};
pub use dropout::{dropout_backward, dropout_forward, DropoutCache, DropoutParam};
pub use loss::{softmax_loss, svm_loss, LossKind};
pub use pool::{max_pool_backward, max_pool_forward, pool_output_dim, PoolCache, PoolParam};
pub use relu::{relu_backward, relu_forward, ReluCache};

/// Selects between the two code paths of batch normalization and dropout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Batch statistics, running-statistics update, random dropout masks.
    Train,
    /// Running statistics, no state mutation, dropout passthrough.
    #[serde(alias = "test")]
    Eval,
}

impl FromStr for Mode {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Mode::Train),
            "eval" | "test" => Ok(Mode::Eval),
            other => Err(LayerError::InvalidMode(other.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Train => write!(f, "train"),
            Mode::Eval => write!(f, "eval"),
        }
    }
}
