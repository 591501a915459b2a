//! # ConvNet Core
//!
//! Forward and backward passes for a convolutional classifier, built from
//! independent numeric layers and chained by a configurable network.
//!
//! ## Quick Start
//!
//! ```rust
//! use convnet_core::{ConvNet, ConvNetConfig, LossOutput};
//! use ndarray::Array4;
//!
//! let config = ConvNetConfig {
//!     input_dim: [3, 8, 8],
//!     num_filters: vec![4],
//!     hidden_dims: vec![10],
//!     num_classes: 5,
//!     use_batchnorm: true,
//!     seed: Some(42),
//!     ..ConvNetConfig::default()
//! };
//! let mut net = ConvNet::new(config).unwrap();
//! let x = Array4::from_elem((2, 3, 8, 8), 0.5);
//!
//! if let LossOutput::Loss { loss, grads } = net.loss(&x, Some(&[1, 4])).unwrap() {
//!     println!("loss = {loss}");
//!     for (id, grad) in grads.named() {
//!         println!("{id}: {:?}", grad.shape());
//!     }
//! }
//! ```
//!
//! ## Core Modules
//!
//! - [`layers`] - Affine, ReLU, convolution, pooling, batch norm, dropout, losses, composite blocks
//! - [`network`] - The assembled classifier and its parameter set
//! - [`config`] - Network configuration via TOML
//! - [`gradient_check`] - Finite-difference gradient validation
//! - [`checkpoint`] - Deterministic binary persistence
//! - [`logging`] - JSON line-delimited run logs

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod gradient_check;
pub mod layers;
pub mod logging;
pub mod network;
pub mod tensor;

pub use checkpoint::{CheckpointError, Checkpointable};
pub use config::{ConfigError, ConvNetConfig};
pub use error::{LayerError, LayerResult};
pub use gradient_check::{check_network_gradients, GradientCheck};
pub use layers::{BatchNormParam, ConvParam, DropoutParam, LossKind, Mode, PoolParam, RunningStats};
pub use network::{ConvNet, ConvNetParams, LayerParams, LossBreakdown, LossOutput, NetworkStats, NormParams, ParamId};
pub use tensor::Precision;
