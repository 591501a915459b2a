//! Tensor helpers on top of `ndarray`.
//!
//! The layers work directly on `ndarray` arrays; this module only adds the
//! handful of operations they share (padding, flattening, initialisation).

pub mod init;
pub mod ops;

pub use init::{gaussian, Precision};
pub use ops::{crop_spatial, flatten_batch, pad_spatial};
