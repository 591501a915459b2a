//! Configurable convolutional classifier assembled from the layer library.
//!
//! ```text
//! [conv → (spatial BN) → ReLU → 2×2 pool] × L
//!   → [affine → (BN) → ReLU → (dropout)] × M
//!   → affine → scores
//! ```
//!
//! Parameters are grouped per block and addressed by [`ParamId`]. Blocks are
//! numbered from 1 across the whole network: conv blocks first, then hidden
//! blocks, then the scoring layer.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use ndarray::{Array, Array1, Array2, Array4, ArrayD, ArrayViewD, ArrayViewMutD, Dimension, Ix2, Ix4};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{CheckpointError, Checkpointable};
use crate::config::ConvNetConfig;
use crate::error::{LayerError, LayerResult};
use crate::layers::blocks::{
    affine_norm_relu_backward, affine_norm_relu_forward, affine_relu_backward, affine_relu_forward,
    conv_norm_relu_pool_backward, conv_norm_relu_pool_forward, conv_relu_pool_backward, conv_relu_pool_forward,
    AffineNormReluCache, AffineReluCache, ConvNormReluPoolCache, ConvReluPoolCache, NormStage,
};
use crate::layers::{
    affine_backward, affine_forward, dropout_backward, dropout_forward, AffineCache, ConvParam, DropoutCache,
    DropoutParam, Mode, PoolParam, RunningStats,
};
use crate::tensor::{gaussian, Precision};

const CONVNET_CHECKPOINT_VERSION: u32 = 1;

/// Names one parameter tensor. The index is the 1-based block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamId {
    Weight(usize),
    Bias(usize),
    Gamma(usize),
    Beta(usize),
}

impl ParamId {
    pub fn block(self) -> usize {
        match self {
            ParamId::Weight(i) | ParamId::Bias(i) | ParamId::Gamma(i) | ParamId::Beta(i) => i,
        }
    }

    /// Only weights carry the L2 penalty.
    pub fn is_regularized(self) -> bool {
        matches!(self, ParamId::Weight(_))
    }
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamId::Weight(i) => write!(f, "W{i}"),
            ParamId::Bias(i) => write!(f, "b{i}"),
            ParamId::Gamma(i) => write!(f, "gamma{i}"),
            ParamId::Beta(i) => write!(f, "beta{i}"),
        }
    }
}

impl FromStr for ParamId {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || LayerError::invalid_config("parameter name", s, "expected W<i>, b<i>, gamma<i> or beta<i>");
        let split = s.find(|c: char| c.is_ascii_digit()).ok_or_else(invalid)?;
        let (prefix, digits) = s.split_at(split);
        let index: usize = digits.parse().map_err(|_| invalid())?;
        if index == 0 {
            return Err(invalid());
        }
        match prefix {
            "W" => Ok(ParamId::Weight(index)),
            "b" => Ok(ParamId::Bias(index)),
            "gamma" => Ok(ParamId::Gamma(index)),
            "beta" => Ok(ParamId::Beta(index)),
            _ => Err(invalid()),
        }
    }
}

/// Batch-norm scale and shift of one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormParams {
    pub gamma: Array1<f64>,
    pub beta: Array1<f64>,
}

/// Parameters (or gradients) of one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerParams<D: Dimension> {
    pub weight: Array<f64, D>,
    pub bias: Array1<f64>,
    pub norm: Option<NormParams>,
}

impl<D: Dimension> LayerParams<D> {
    fn view(&self, id: ParamId) -> Option<ArrayViewD<'_, f64>> {
        match id {
            ParamId::Weight(_) => Some(self.weight.view().into_dyn()),
            ParamId::Bias(_) => Some(self.bias.view().into_dyn()),
            ParamId::Gamma(_) => self.norm.as_ref().map(|n| n.gamma.view().into_dyn()),
            ParamId::Beta(_) => self.norm.as_ref().map(|n| n.beta.view().into_dyn()),
        }
    }

    fn view_mut(&mut self, id: ParamId) -> Option<ArrayViewMutD<'_, f64>> {
        match id {
            ParamId::Weight(_) => Some(self.weight.view_mut().into_dyn()),
            ParamId::Bias(_) => Some(self.bias.view_mut().into_dyn()),
            ParamId::Gamma(_) => self.norm.as_mut().map(|n| n.gamma.view_mut().into_dyn()),
            ParamId::Beta(_) => self.norm.as_mut().map(|n| n.beta.view_mut().into_dyn()),
        }
    }

    fn named(&self, block: usize) -> Vec<(ParamId, ArrayViewD<'_, f64>)> {
        let mut out = vec![
            (ParamId::Weight(block), self.weight.view().into_dyn()),
            (ParamId::Bias(block), self.bias.view().into_dyn()),
        ];
        if let Some(norm) = &self.norm {
            out.push((ParamId::Gamma(block), norm.gamma.view().into_dyn()));
            out.push((ParamId::Beta(block), norm.beta.view().into_dyn()));
        }
        out
    }

    fn named_mut(&mut self, block: usize) -> Vec<(ParamId, ArrayViewMutD<'_, f64>)> {
        let mut out = vec![
            (ParamId::Weight(block), self.weight.view_mut().into_dyn()),
            (ParamId::Bias(block), self.bias.view_mut().into_dyn()),
        ];
        if let Some(norm) = &mut self.norm {
            out.push((ParamId::Gamma(block), norm.gamma.view_mut().into_dyn()));
            out.push((ParamId::Beta(block), norm.beta.view_mut().into_dyn()));
        }
        out
    }

    fn round(&mut self, precision: Precision) {
        precision.round(&mut self.weight);
        precision.round(&mut self.bias);
        if let Some(norm) = &mut self.norm {
            precision.round(&mut norm.gamma);
            precision.round(&mut norm.beta);
        }
    }
}

/// Every parameter of a [`ConvNet`]. Gradients use the same type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvNetParams {
    pub conv: Vec<LayerParams<Ix4>>,
    pub hidden: Vec<LayerParams<Ix2>>,
    pub scores: LayerParams<Ix2>,
}

enum Block<T, U> {
    Conv(T),
    Dense(U),
}

impl ConvNetParams {
    fn locate(&self, block: usize) -> Option<Block<&LayerParams<Ix4>, &LayerParams<Ix2>>> {
        let (l, m) = (self.conv.len(), self.hidden.len());
        match block {
            0 => None,
            b if b <= l => Some(Block::Conv(&self.conv[b - 1])),
            b if b <= l + m => Some(Block::Dense(&self.hidden[b - l - 1])),
            b if b == l + m + 1 => Some(Block::Dense(&self.scores)),
            _ => None,
        }
    }

    fn locate_mut(&mut self, block: usize) -> Option<Block<&mut LayerParams<Ix4>, &mut LayerParams<Ix2>>> {
        let (l, m) = (self.conv.len(), self.hidden.len());
        match block {
            0 => None,
            b if b <= l => Some(Block::Conv(&mut self.conv[b - 1])),
            b if b <= l + m => Some(Block::Dense(&mut self.hidden[b - l - 1])),
            b if b == l + m + 1 => Some(Block::Dense(&mut self.scores)),
            _ => None,
        }
    }

    /// Number of blocks, scoring layer included.
    pub fn num_blocks(&self) -> usize {
        self.conv.len() + self.hidden.len() + 1
    }

    pub fn get(&self, id: ParamId) -> Option<ArrayViewD<'_, f64>> {
        match self.locate(id.block())? {
            Block::Conv(p) => p.view(id),
            Block::Dense(p) => p.view(id),
        }
    }

    pub fn get_mut(&mut self, id: ParamId) -> Option<ArrayViewMutD<'_, f64>> {
        match self.locate_mut(id.block())? {
            Block::Conv(p) => p.view_mut(id),
            Block::Dense(p) => p.view_mut(id),
        }
    }

    /// All tensors in block order, `W, b, [gamma, beta]` within a block.
    pub fn named(&self) -> Vec<(ParamId, ArrayViewD<'_, f64>)> {
        let l = self.conv.len();
        let m = self.hidden.len();
        let mut out = Vec::new();
        for (i, p) in self.conv.iter().enumerate() {
            out.extend(p.named(i + 1));
        }
        for (i, p) in self.hidden.iter().enumerate() {
            out.extend(p.named(l + i + 1));
        }
        out.extend(self.scores.named(l + m + 1));
        out
    }

    /// Mutable counterpart of [`named`](Self::named), same order.
    pub fn named_mut(&mut self) -> Vec<(ParamId, ArrayViewMutD<'_, f64>)> {
        let l = self.conv.len();
        let m = self.hidden.len();
        let mut out = Vec::new();
        for (i, p) in self.conv.iter_mut().enumerate() {
            out.extend(p.named_mut(i + 1));
        }
        for (i, p) in self.hidden.iter_mut().enumerate() {
            out.extend(p.named_mut(l + i + 1));
        }
        out.extend(self.scores.named_mut(l + m + 1));
        out
    }

    /// `Σ W²` over every weight tensor.
    pub fn weight_sq_sum(&self) -> f64 {
        self.named()
            .into_iter()
            .filter(|(id, _)| id.is_regularized())
            .map(|(_, w)| w.iter().map(|v| v * v).sum::<f64>())
            .sum()
    }

    fn round(&mut self, precision: Precision) {
        for p in &mut self.conv {
            p.round(precision);
        }
        for p in &mut self.hidden {
            p.round(precision);
        }
        self.scores.round(precision);
    }
}

/// Running statistics of every normalised block. Empty without batch norm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub conv: Vec<RunningStats>,
    pub hidden: Vec<RunningStats>,
}

/// Data and regularisation parts of one loss evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossBreakdown {
    pub data_loss: f64,
    pub reg_loss: f64,
}

impl LossBreakdown {
    pub fn total(&self) -> f64 {
        self.data_loss + self.reg_loss
    }
}

/// Result of [`ConvNet::loss`].
#[derive(Debug, Clone)]
pub enum LossOutput {
    /// No labels: class scores `(N, K)` from an eval-mode pass
    Scores(Array2<f64>),
    /// Labels given: total loss and gradients of every parameter
    Loss { loss: f64, grads: ConvNetParams },
}

enum ConvStageCache {
    Plain(ConvReluPoolCache),
    Norm(ConvNormReluPoolCache),
}

enum DenseStageCache {
    Plain(AffineReluCache),
    Norm(AffineNormReluCache),
}

struct HiddenStageCache {
    block: DenseStageCache,
    dropout: Option<DropoutCache>,
}

struct ForwardCaches {
    conv: Vec<ConvStageCache>,
    hidden: Vec<HiddenStageCache>,
    scores: AffineCache,
}

/// Convolutional classifier.
///
/// # Examples
///
/// ```
/// use convnet_core::{ConvNet, ConvNetConfig};
/// use ndarray::Array4;
///
/// let config = ConvNetConfig {
///     input_dim: [1, 8, 8],
///     num_filters: vec![2],
///     hidden_dims: vec![5],
///     num_classes: 3,
///     seed: Some(0),
///     ..ConvNetConfig::default()
/// };
/// let mut net = ConvNet::new(config).unwrap();
/// let x = Array4::zeros((4, 1, 8, 8));
/// let scores = net.scores(&x).unwrap();
/// assert_eq!(scores.dim(), (4, 3));
/// let (loss, grads) = net.loss_and_grads(&x, &[0, 1, 2, 0]).unwrap();
/// assert!(loss > 0.0);
/// assert_eq!(grads.named().len(), net.params().named().len());
/// ```
#[derive(Debug, Clone)]
pub struct ConvNet {
    config: ConvNetConfig,
    params: ConvNetParams,
    stats: NetworkStats,
    conv_param: ConvParam,
    pool_param: PoolParam,
    dropout_param: Option<DropoutParam>,
    rng: StdRng,
}

impl ConvNet {
    /// Validates `config` and initialises every parameter.
    ///
    /// Weights are drawn from `N(0, weight_scale²)`; biases and `beta` start
    /// at zero, `gamma` at one, running statistics at zero.
    pub fn new(config: ConvNetConfig) -> LayerResult<Self> {
        config.validate()?;
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let params = Self::init_params(&config, &mut rng)?;
        let stats = Self::init_stats(&config)?;

        Ok(Self {
            conv_param: config.conv_param()?,
            pool_param: config.pool_param(),
            dropout_param: config.dropout_param(),
            config,
            params,
            stats,
            rng,
        })
    }

    fn init_params(config: &ConvNetConfig, rng: &mut StdRng) -> LayerResult<ConvNetParams> {
        let scale = config.weight_scale;
        let norm = |width: usize| {
            config.use_batchnorm.then(|| NormParams {
                gamma: Array1::ones(width),
                beta: Array1::zeros(width),
            })
        };

        let mut channels = config.input_dim[0];
        let shapes = config.conv_output_shapes()?;
        let mut conv = Vec::with_capacity(shapes.len());
        for (i, &[filters, h, w]) in shapes.iter().enumerate() {
            let fs = config.filter_size;
            conv.push(LayerParams {
                weight: gaussian((filters, channels, fs, fs), scale, rng)?,
                bias: Array1::zeros(filters),
                norm: norm(filters),
            });
            tracing::debug!(block = i + 1, filters, height = h, width = w, "conv block");
            channels = filters;
        }

        let mut width = config.flattened_dim()?;
        let mut hidden = Vec::with_capacity(config.hidden_dims.len());
        for (i, &units) in config.hidden_dims.iter().enumerate() {
            hidden.push(LayerParams {
                weight: gaussian((width, units), scale, rng)?,
                bias: Array1::zeros(units),
                norm: norm(units),
            });
            tracing::debug!(block = conv.len() + i + 1, inputs = width, units, "hidden block");
            width = units;
        }

        let scores = LayerParams {
            weight: gaussian((width, config.num_classes), scale, rng)?,
            bias: Array1::zeros(config.num_classes),
            norm: None,
        };

        let mut params = ConvNetParams { conv, hidden, scores };
        params.round(config.precision);
        Ok(params)
    }

    fn init_stats(config: &ConvNetConfig) -> LayerResult<NetworkStats> {
        if !config.use_batchnorm {
            return Ok(NetworkStats::default());
        }
        Ok(NetworkStats {
            conv: config.num_filters.iter().map(|&f| RunningStats::new(f)).collect(),
            hidden: config.hidden_dims.iter().map(|&m| RunningStats::new(m)).collect(),
        })
    }

    pub fn config(&self) -> &ConvNetConfig {
        &self.config
    }

    pub fn params(&self) -> &ConvNetParams {
        &self.params
    }

    /// Mutable parameter access for external optimizers.
    pub fn params_mut(&mut self) -> &mut ConvNetParams {
        &mut self.params
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    /// Scores for `x` when `y` is `None`; loss and gradients otherwise.
    ///
    /// Without labels every layer runs in eval mode and no state changes.
    /// With labels batch norm and dropout run in train mode, so running
    /// statistics and the dropout RNG advance.
    pub fn loss(&mut self, x: &Array4<f64>, y: Option<&[usize]>) -> LayerResult<LossOutput> {
        match y {
            None => self.scores(x).map(LossOutput::Scores),
            Some(y) => {
                let (loss, grads) = self.loss_and_grads(x, y)?;
                Ok(LossOutput::Loss { loss, grads })
            }
        }
    }

    /// Class scores `(N, K)` from an eval-mode pass.
    pub fn scores(&mut self, x: &Array4<f64>) -> LayerResult<Array2<f64>> {
        let (scores, _) = self.forward(x, Mode::Eval)?;
        Ok(self.config.precision.rounded(scores))
    }

    /// Total loss and parameter gradients for a labelled batch.
    pub fn loss_and_grads(&mut self, x: &Array4<f64>, y: &[usize]) -> LayerResult<(f64, ConvNetParams)> {
        let (breakdown, grads) = self.loss_breakdown(x, y)?;
        Ok((breakdown.total(), grads))
    }

    /// Like [`loss_and_grads`](Self::loss_and_grads), keeping the data and
    /// regularisation terms apart.
    pub fn loss_breakdown(&mut self, x: &Array4<f64>, y: &[usize]) -> LayerResult<(LossBreakdown, ConvNetParams)> {
        let (scores, caches) = self.forward(x, Mode::Train)?;
        let (data_loss, dscores) = self.config.loss.evaluate(&scores, y)?;
        let reg = self.config.reg;
        let reg_loss = 0.5 * reg * self.params.weight_sq_sum();
        tracing::debug!(data_loss, reg_loss, batch = y.len(), "convnet loss");

        let mut grads = self.backward(&dscores, caches)?;
        for (id, mut grad) in grads.named_mut() {
            if !id.is_regularized() {
                continue;
            }
            if let Some(weight) = self.params.get(id) {
                grad.scaled_add(reg, &weight);
            }
        }
        grads.round(self.config.precision);

        let breakdown = LossBreakdown { data_loss, reg_loss };
        Ok((breakdown, grads))
    }

    fn check_input(&self, x: &Array4<f64>) -> LayerResult<()> {
        let (n, c, h, w) = x.dim();
        let [ec, eh, ew] = self.config.input_dim;
        if (c, h, w) != (ec, eh, ew) {
            return Err(LayerError::shape_mismatch("convnet input", &[n, ec, eh, ew], x.shape()));
        }
        Ok(())
    }

    fn forward(&mut self, x: &Array4<f64>, mode: Mode) -> LayerResult<(Array2<f64>, ForwardCaches)> {
        self.check_input(x)?;
        let precision = self.config.precision;
        let bn_param = self.config.batchnorm;
        let mut out = precision.rounded(x.to_owned());

        let mut conv_caches = Vec::with_capacity(self.params.conv.len());
        for (i, layer) in self.params.conv.iter().enumerate() {
            let cache = match &layer.norm {
                Some(norm) => {
                    let stats = self.stats.conv.get_mut(i).ok_or_else(|| missing_stats(i + 1))?;
                    let stage = NormStage {
                        gamma: &norm.gamma,
                        beta: &norm.beta,
                        param: &bn_param,
                        mode,
                        stats,
                    };
                    let (next, cache) = conv_norm_relu_pool_forward(
                        &out,
                        &layer.weight,
                        &layer.bias,
                        &self.conv_param,
                        &self.pool_param,
                        stage,
                    )?;
                    out = next;
                    ConvStageCache::Norm(cache)
                }
                None => {
                    let (next, cache) =
                        conv_relu_pool_forward(&out, &layer.weight, &layer.bias, &self.conv_param, &self.pool_param)?;
                    out = next;
                    ConvStageCache::Plain(cache)
                }
            };
            conv_caches.push(cache);
        }

        let mut h: ArrayD<f64> = out.into_dyn();
        let mut hidden_caches = Vec::with_capacity(self.params.hidden.len());
        for (i, layer) in self.params.hidden.iter().enumerate() {
            let (a, block) = match &layer.norm {
                Some(norm) => {
                    let stats = self
                        .stats
                        .hidden
                        .get_mut(i)
                        .ok_or_else(|| missing_stats(self.params.conv.len() + i + 1))?;
                    let stage = NormStage {
                        gamma: &norm.gamma,
                        beta: &norm.beta,
                        param: &bn_param,
                        mode,
                        stats,
                    };
                    let (a, cache) = affine_norm_relu_forward(&h, &layer.weight, &layer.bias, stage)?;
                    (a, DenseStageCache::Norm(cache))
                }
                None => {
                    let (a, cache) = affine_relu_forward(&h, &layer.weight, &layer.bias)?;
                    (a, DenseStageCache::Plain(cache))
                }
            };
            let a = a.into_dyn();
            let (next, dropout) = match &self.dropout_param {
                Some(param) => {
                    let (d, cache) = dropout_forward(&a, param, mode, &mut self.rng)?;
                    (d, Some(cache))
                }
                None => (a, None),
            };
            h = next;
            hidden_caches.push(HiddenStageCache { block, dropout });
        }

        let (scores, scores_cache) = affine_forward(&h, &self.params.scores.weight, &self.params.scores.bias)?;
        let caches = ForwardCaches {
            conv: conv_caches,
            hidden: hidden_caches,
            scores: scores_cache,
        };
        Ok((scores, caches))
    }

    fn backward(&self, dscores: &Array2<f64>, caches: ForwardCaches) -> LayerResult<ConvNetParams> {
        let (dh, dw, db) = affine_backward(dscores, &caches.scores)?;
        let scores = LayerParams {
            weight: dw,
            bias: db,
            norm: None,
        };

        let mut dh = dh;
        let mut hidden = Vec::with_capacity(caches.hidden.len());
        for stage in caches.hidden.iter().rev() {
            if let Some(cache) = &stage.dropout {
                dh = dropout_backward(&dh, cache)?;
            }
            let dout = into_ix2(dh)?;
            let (dx, grads) = match &stage.block {
                DenseStageCache::Plain(cache) => {
                    let (dx, dw, db) = affine_relu_backward(&dout, cache)?;
                    (
                        dx,
                        LayerParams {
                            weight: dw,
                            bias: db,
                            norm: None,
                        },
                    )
                }
                DenseStageCache::Norm(cache) => {
                    let g = affine_norm_relu_backward(&dout, cache)?;
                    (
                        g.dx,
                        LayerParams {
                            weight: g.dw,
                            bias: g.db,
                            norm: Some(NormParams {
                                gamma: g.dgamma,
                                beta: g.dbeta,
                            }),
                        },
                    )
                }
            };
            hidden.push(grads);
            dh = dx;
        }
        hidden.reverse();

        let mut dx = into_ix4(dh)?;
        let mut conv = Vec::with_capacity(caches.conv.len());
        for stage in caches.conv.iter().rev() {
            let grads = match stage {
                ConvStageCache::Plain(cache) => {
                    let (dprev, dw, db) = conv_relu_pool_backward(&dx, cache)?;
                    dx = dprev;
                    LayerParams {
                        weight: dw,
                        bias: db,
                        norm: None,
                    }
                }
                ConvStageCache::Norm(cache) => {
                    let g = conv_norm_relu_pool_backward(&dx, cache)?;
                    dx = g.dx;
                    LayerParams {
                        weight: g.dw,
                        bias: g.db,
                        norm: Some(NormParams {
                            gamma: g.dgamma,
                            beta: g.dbeta,
                        }),
                    }
                }
            };
            conv.push(grads);
        }
        conv.reverse();

        Ok(ConvNetParams { conv, hidden, scores })
    }

    /// Checks that `params` and `stats` have exactly the shapes this
    /// network's configuration implies.
    fn check_compatible(&self, params: &ConvNetParams, stats: &NetworkStats) -> LayerResult<()> {
        let expected = self.params.named();
        let got = params.named();
        if expected.len() != got.len() {
            return Err(LayerError::shape_mismatch(
                "parameter count",
                &[expected.len()],
                &[got.len()],
            ));
        }
        for ((id, want), (got_id, have)) in expected.iter().zip(got.iter()) {
            if id != got_id || want.shape() != have.shape() {
                return Err(LayerError::shape_mismatch(format!("parameter {id}"), want.shape(), have.shape()));
            }
        }

        let stat_shapes = |s: &NetworkStats| -> Vec<(usize, usize)> {
            s.conv
                .iter()
                .chain(&s.hidden)
                .map(|r| (r.mean.len(), r.var.len()))
                .collect()
        };
        if stat_shapes(&self.stats) != stat_shapes(stats) {
            return Err(LayerError::shape_mismatch(
                "running statistics",
                &[self.stats.conv.len(), self.stats.hidden.len()],
                &[stats.conv.len(), stats.hidden.len()],
            ));
        }
        Ok(())
    }
}

fn missing_stats(block: usize) -> LayerError {
    LayerError::invalid_config("running statistics", block, "normalised block has no running statistics")
}

fn into_ix2(a: ArrayD<f64>) -> LayerResult<Array2<f64>> {
    let got = a.shape().to_vec();
    a.into_dimensionality::<Ix2>()
        .map_err(|_| LayerError::shape_mismatch("hidden gradient rank", &[0, 0], &got))
}

fn into_ix4(a: ArrayD<f64>) -> LayerResult<Array4<f64>> {
    let got = a.shape().to_vec();
    a.into_dimensionality::<Ix4>()
        .map_err(|_| LayerError::shape_mismatch("conv gradient rank", &[0, 0, 0, 0], &got))
}

#[derive(Serialize, Deserialize)]
struct ConvNetSnapshot {
    version: u32,
    config: ConvNetConfig,
    params: ConvNetParams,
    stats: NetworkStats,
}

impl Checkpointable for ConvNet {
    fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<(), CheckpointError> {
        let snapshot = ConvNetSnapshot {
            version: CONVNET_CHECKPOINT_VERSION,
            config: self.config.clone(),
            params: self.params.clone(),
            stats: self.stats.clone(),
        };
        Self::write_snapshot(&snapshot, path)
    }

    fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<Self, CheckpointError> {
        let snapshot: ConvNetSnapshot = Self::read_snapshot(path)?;
        if snapshot.version != CONVNET_CHECKPOINT_VERSION {
            return Err(CheckpointError::VersionMismatch {
                expected: CONVNET_CHECKPOINT_VERSION,
                found: snapshot.version,
            });
        }

        let mut net = ConvNet::new(snapshot.config)?;
        net.check_compatible(&snapshot.params, &snapshot.stats)?;
        net.params = snapshot.params;
        net.stats = snapshot.stats;
        Ok(net)
    }
}
