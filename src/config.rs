//! Network configuration via TOML files.
//!
//! ```toml
//! [network]
//! input_dim = [3, 32, 32]
//! num_filters = [16, 32]
//! filter_size = 3
//! hidden_dims = [100, 100]
//! num_classes = 10
//! weight_scale = 1e-3
//! reg = 0.0
//! precision = "double"
//! use_batchnorm = true
//! dropout = 0.5
//! loss = "softmax"
//! seed = 42
//!
//! [network.batchnorm]
//! eps = 1e-5
//! momentum = 0.9
//! ```
//!
//! Every key is optional; missing keys take the values of
//! [`ConvNetConfig::default`].

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LayerError, LayerResult};
use crate::layers::{conv_output_dim, pool_output_dim, BatchNormParam, ConvParam, DropoutParam, LossKind, PoolParam};
use crate::tensor::Precision;

/// Architecture and hyperparameters of a [`ConvNet`](crate::network::ConvNet).
///
/// The network is `L` conv blocks (conv → [spatial BN] → ReLU → 2×2 max-pool),
/// then `M` hidden affine blocks (affine → [BN] → ReLU → [dropout]), then one
/// scoring affine layer. `L = num_filters.len()`, `M = hidden_dims.len()`.
///
/// # Examples
///
/// ```
/// use convnet_core::ConvNetConfig;
///
/// let config = ConvNetConfig::from_str("[network]\nnum_filters = [8]\nhidden_dims = [20]")
///     .unwrap_or_else(|_| ConvNetConfig::default());
/// assert_eq!(config.num_filters, vec![8]);
/// assert_eq!(config.num_classes, 10);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvNetConfig {
    /// Input volume `(C, H, W)`
    pub input_dim: [usize; 3],
    /// Filter count of each conv block
    pub num_filters: Vec<usize>,
    /// Side of the square conv filters; must be odd
    pub filter_size: usize,
    /// Width of each hidden affine block
    pub hidden_dims: Vec<usize>,
    pub num_classes: usize,
    /// Standard deviation of the Gaussian weight initialisation
    pub weight_scale: f64,
    /// L2 regularisation strength
    pub reg: f64,
    pub precision: Precision,
    pub use_batchnorm: bool,
    pub batchnorm: BatchNormParam,
    /// Drop probability applied after every hidden block
    pub dropout: Option<f64>,
    pub loss: LossKind,
    /// Seed for weight initialisation and dropout masks; entropy when unset
    pub seed: Option<u64>,
}

impl ConvNetConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(toml_str).map_err(|err| ConfigError::Parse(err.to_string()))?;
        let network = raw.network;
        let config = Self {
            input_dim: network.input_dim,
            num_filters: network.num_filters,
            filter_size: network.filter_size,
            hidden_dims: network.hidden_dims,
            num_classes: network.num_classes,
            weight_scale: network.weight_scale,
            reg: network.reg,
            precision: network.precision,
            use_batchnorm: network.use_batchnorm,
            batchnorm: BatchNormParam {
                eps: network.batchnorm.eps,
                momentum: network.batchnorm.momentum,
            },
            dropout: network.dropout,
            loss: network.loss,
            seed: network.seed,
        };
        config
            .validate()
            .map_err(|err| ConfigError::Parse(format!("network: {err}")))?;
        Ok(config)
    }

    /// One conv block of 32 7×7 filters, one hidden block of 100 units.
    pub fn three_layer() -> Self {
        Self {
            num_filters: vec![32],
            filter_size: 7,
            hidden_dims: vec![100],
            ..Self::default()
        }
    }

    /// Padding that keeps the conv output the size of its input.
    pub fn conv_param(&self) -> LayerResult<ConvParam> {
        ConvParam::same(self.filter_size)
    }

    pub fn pool_param(&self) -> PoolParam {
        PoolParam::halving()
    }

    pub fn dropout_param(&self) -> Option<DropoutParam> {
        self.dropout.map(DropoutParam::new)
    }

    /// Output volume `(F, H, W)` of every conv block, in order.
    ///
    /// Fails on the first block whose spatial extent does not divide evenly.
    pub fn conv_output_shapes(&self) -> LayerResult<Vec<[usize; 3]>> {
        let conv = self.conv_param()?;
        let pool = self.pool_param();
        let [_, mut h, mut w] = self.input_dim;

        let mut shapes = Vec::with_capacity(self.num_filters.len());
        for &filters in &self.num_filters {
            h = conv_output_dim(h, self.filter_size, conv.pad, conv.stride)?;
            w = conv_output_dim(w, self.filter_size, conv.pad, conv.stride)?;
            h = pool_output_dim(h, pool.pool_height, pool.stride)?;
            w = pool_output_dim(w, pool.pool_width, pool.stride)?;
            shapes.push([filters, h, w]);
        }
        Ok(shapes)
    }

    /// Width of the flattened input to the first hidden block.
    pub fn flattened_dim(&self) -> LayerResult<usize> {
        let shapes = self.conv_output_shapes()?;
        let last = shapes.last().copied().unwrap_or(self.input_dim);
        Ok(last.iter().product())
    }

    pub fn validate(&self) -> LayerResult<()> {
        if self.input_dim.contains(&0) {
            return Err(LayerError::invalid_config(
                "input_dim",
                format!("{:?}", self.input_dim),
                "every extent must be non-zero",
            ));
        }
        if self.num_filters.contains(&0) {
            return Err(LayerError::invalid_config(
                "num_filters",
                format!("{:?}", self.num_filters),
                "every block needs at least one filter",
            ));
        }
        if self.hidden_dims.contains(&0) {
            return Err(LayerError::invalid_config(
                "hidden_dims",
                format!("{:?}", self.hidden_dims),
                "every hidden block needs at least one unit",
            ));
        }
        if self.num_classes == 0 {
            return Err(LayerError::invalid_config("num_classes", 0, "must be non-zero"));
        }
        if !(self.weight_scale.is_finite() && self.weight_scale >= 0.0) {
            return Err(LayerError::invalid_config(
                "weight_scale",
                self.weight_scale,
                "must be finite and non-negative",
            ));
        }
        if !(self.reg.is_finite() && self.reg >= 0.0) {
            return Err(LayerError::invalid_config("reg", self.reg, "must be finite and non-negative"));
        }
        self.batchnorm.validate()?;
        if let Some(param) = self.dropout_param() {
            param.validate()?;
        }
        self.conv_output_shapes().map(|_| ())
    }
}

impl Default for ConvNetConfig {
    fn default() -> Self {
        Self {
            input_dim: default_input_dim(),
            num_filters: default_num_filters(),
            filter_size: default_filter_size(),
            hidden_dims: default_hidden_dims(),
            num_classes: default_num_classes(),
            weight_scale: default_weight_scale(),
            reg: 0.0,
            precision: Precision::Double,
            use_batchnorm: false,
            batchnorm: BatchNormParam::default(),
            dropout: None,
            loss: LossKind::Softmax,
            seed: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    network: RawNetwork,
}

#[derive(Debug, Deserialize)]
struct RawNetwork {
    #[serde(default = "default_input_dim")]
    input_dim: [usize; 3],
    #[serde(default = "default_num_filters")]
    num_filters: Vec<usize>,
    #[serde(default = "default_filter_size")]
    filter_size: usize,
    #[serde(default = "default_hidden_dims")]
    hidden_dims: Vec<usize>,
    #[serde(default = "default_num_classes")]
    num_classes: usize,
    #[serde(default = "default_weight_scale")]
    weight_scale: f64,
    #[serde(default)]
    reg: f64,
    #[serde(default)]
    precision: Precision,
    #[serde(default)]
    use_batchnorm: bool,
    #[serde(default)]
    batchnorm: RawBatchNorm,
    #[serde(default)]
    dropout: Option<f64>,
    #[serde(default)]
    loss: LossKind,
    #[serde(default)]
    seed: Option<u64>,
}

impl Default for RawNetwork {
    fn default() -> Self {
        Self {
            input_dim: default_input_dim(),
            num_filters: default_num_filters(),
            filter_size: default_filter_size(),
            hidden_dims: default_hidden_dims(),
            num_classes: default_num_classes(),
            weight_scale: default_weight_scale(),
            reg: 0.0,
            precision: Precision::default(),
            use_batchnorm: false,
            batchnorm: RawBatchNorm::default(),
            dropout: None,
            loss: LossKind::default(),
            seed: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawBatchNorm {
    #[serde(default = "default_eps")]
    eps: f64,
    #[serde(default = "default_momentum")]
    momentum: f64,
}

impl Default for RawBatchNorm {
    fn default() -> Self {
        Self {
            eps: default_eps(),
            momentum: default_momentum(),
        }
    }
}

fn default_input_dim() -> [usize; 3] {
    [3, 32, 32]
}

fn default_num_filters() -> Vec<usize> {
    vec![16, 32]
}

fn default_filter_size() -> usize {
    3
}

fn default_hidden_dims() -> Vec<usize> {
    vec![100, 100]
}

fn default_num_classes() -> usize {
    10
}

fn default_weight_scale() -> f64 {
    1e-3
}

fn default_eps() -> f64 {
    BatchNormParam::default().eps
}

fn default_momentum() -> f64 {
    BatchNormParam::default().momentum
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "IO error: {}", err),
            ConfigError::Parse(err) => write!(f, "Parse error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        ConfigError::Io(value)
    }
}
