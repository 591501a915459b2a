//! Composite blocks chaining elementary layers.
//!
//! Each forward threads the caches of its stages into one block cache; the
//! matching backward unwinds them in reverse order.

use ndarray::{Array1, Array2, Array4, ArrayD, Ix2, Ix4};

use crate::error::LayerResult;
use crate::layers::affine::{affine_backward, affine_forward, AffineCache};
use crate::layers::batchnorm::{
    batchnorm_backward_alt, batchnorm_forward, spatial_batchnorm_backward, spatial_batchnorm_forward,
    BatchNormCache, BatchNormParam, RunningStats, SpatialBatchNormCache,
};
use crate::layers::conv::{conv_backward, conv_forward, ConvCache, ConvParam};
use crate::layers::pool::{max_pool_backward, max_pool_forward, PoolCache, PoolParam};
use crate::layers::relu::{relu_backward, relu_forward, ReluCache};
use crate::layers::Mode;

/// Batch-norm stage arguments shared by the normalised blocks.
#[derive(Debug)]
pub struct NormStage<'a> {
    pub gamma: &'a Array1<f64>,
    pub beta: &'a Array1<f64>,
    pub param: &'a BatchNormParam,
    pub mode: Mode,
    pub stats: &'a mut RunningStats,
}

#[derive(Debug, Clone)]
pub struct AffineReluCache {
    pub affine: AffineCache,
    pub relu: ReluCache<Ix2>,
}

/// affine → ReLU
pub fn affine_relu_forward(
    x: &ArrayD<f64>,
    w: &Array2<f64>,
    b: &Array1<f64>,
) -> LayerResult<(Array2<f64>, AffineReluCache)> {
    let (a, affine) = affine_forward(x, w, b)?;
    let (out, relu) = relu_forward(&a);
    Ok((out, AffineReluCache { affine, relu }))
}

/// Returns `(dx, dw, db)`.
pub fn affine_relu_backward(
    dout: &Array2<f64>,
    cache: &AffineReluCache,
) -> LayerResult<(ArrayD<f64>, Array2<f64>, Array1<f64>)> {
    let da = relu_backward(dout, &cache.relu)?;
    affine_backward(&da, &cache.affine)
}

#[derive(Debug, Clone)]
pub struct AffineNormReluCache {
    pub affine: AffineCache,
    pub norm: BatchNormCache,
    pub relu: ReluCache<Ix2>,
}

/// Gradients of a normalised affine block.
#[derive(Debug, Clone)]
pub struct AffineNormReluGrads {
    pub dx: ArrayD<f64>,
    pub dw: Array2<f64>,
    pub db: Array1<f64>,
    pub dgamma: Array1<f64>,
    pub dbeta: Array1<f64>,
}

/// affine → batch norm → ReLU
pub fn affine_norm_relu_forward(
    x: &ArrayD<f64>,
    w: &Array2<f64>,
    b: &Array1<f64>,
    norm: NormStage<'_>,
) -> LayerResult<(Array2<f64>, AffineNormReluCache)> {
    let (a, affine) = affine_forward(x, w, b)?;
    let (an, norm_cache) = batchnorm_forward(&a, norm.gamma, norm.beta, norm.param, norm.mode, norm.stats)?;
    let (out, relu) = relu_forward(&an);
    let cache = AffineNormReluCache {
        affine,
        norm: norm_cache,
        relu,
    };
    Ok((out, cache))
}

pub fn affine_norm_relu_backward(
    dout: &Array2<f64>,
    cache: &AffineNormReluCache,
) -> LayerResult<AffineNormReluGrads> {
    let dan = relu_backward(dout, &cache.relu)?;
    let (da, dgamma, dbeta) = batchnorm_backward_alt(&dan, &cache.norm)?;
    let (dx, dw, db) = affine_backward(&da, &cache.affine)?;
    Ok(AffineNormReluGrads {
        dx,
        dw,
        db,
        dgamma,
        dbeta,
    })
}

#[derive(Debug, Clone)]
pub struct ConvReluCache {
    pub conv: ConvCache,
    pub relu: ReluCache<Ix4>,
}

/// conv → ReLU
pub fn conv_relu_forward(
    x: &Array4<f64>,
    w: &Array4<f64>,
    b: &Array1<f64>,
    conv_param: &ConvParam,
) -> LayerResult<(Array4<f64>, ConvReluCache)> {
    let (a, conv) = conv_forward(x, w, b, conv_param)?;
    let (out, relu) = relu_forward(&a);
    Ok((out, ConvReluCache { conv, relu }))
}

/// Returns `(dx, dw, db)`.
pub fn conv_relu_backward(
    dout: &Array4<f64>,
    cache: &ConvReluCache,
) -> LayerResult<(Array4<f64>, Array4<f64>, Array1<f64>)> {
    let da = relu_backward(dout, &cache.relu)?;
    conv_backward(&da, &cache.conv)
}

#[derive(Debug, Clone)]
pub struct ConvReluPoolCache {
    pub conv: ConvCache,
    pub relu: ReluCache<Ix4>,
    pub pool: PoolCache,
}

/// conv → ReLU → max-pool
pub fn conv_relu_pool_forward(
    x: &Array4<f64>,
    w: &Array4<f64>,
    b: &Array1<f64>,
    conv_param: &ConvParam,
    pool_param: &PoolParam,
) -> LayerResult<(Array4<f64>, ConvReluPoolCache)> {
    let (a, conv) = conv_forward(x, w, b, conv_param)?;
    let (s, relu) = relu_forward(&a);
    let (out, pool) = max_pool_forward(&s, pool_param)?;
    Ok((out, ConvReluPoolCache { conv, relu, pool }))
}

/// Returns `(dx, dw, db)`.
pub fn conv_relu_pool_backward(
    dout: &Array4<f64>,
    cache: &ConvReluPoolCache,
) -> LayerResult<(Array4<f64>, Array4<f64>, Array1<f64>)> {
    let ds = max_pool_backward(dout, &cache.pool)?;
    let da = relu_backward(&ds, &cache.relu)?;
    conv_backward(&da, &cache.conv)
}

#[derive(Debug, Clone)]
pub struct ConvNormReluPoolCache {
    pub conv: ConvCache,
    pub norm: SpatialBatchNormCache,
    pub relu: ReluCache<Ix4>,
    pub pool: PoolCache,
}

/// Gradients of a normalised conv block.
#[derive(Debug, Clone)]
pub struct ConvNormReluPoolGrads {
    pub dx: Array4<f64>,
    pub dw: Array4<f64>,
    pub db: Array1<f64>,
    pub dgamma: Array1<f64>,
    pub dbeta: Array1<f64>,
}

/// conv → spatial batch norm → ReLU → max-pool
pub fn conv_norm_relu_pool_forward(
    x: &Array4<f64>,
    w: &Array4<f64>,
    b: &Array1<f64>,
    conv_param: &ConvParam,
    pool_param: &PoolParam,
    norm: NormStage<'_>,
) -> LayerResult<(Array4<f64>, ConvNormReluPoolCache)> {
    let (a, conv) = conv_forward(x, w, b, conv_param)?;
    let (an, norm_cache) =
        spatial_batchnorm_forward(&a, norm.gamma, norm.beta, norm.param, norm.mode, norm.stats)?;
    let (s, relu) = relu_forward(&an);
    let (out, pool) = max_pool_forward(&s, pool_param)?;
    let cache = ConvNormReluPoolCache {
        conv,
        norm: norm_cache,
        relu,
        pool,
    };
    Ok((out, cache))
}

pub fn conv_norm_relu_pool_backward(
    dout: &Array4<f64>,
    cache: &ConvNormReluPoolCache,
) -> LayerResult<ConvNormReluPoolGrads> {
    let ds = max_pool_backward(dout, &cache.pool)?;
    let dan = relu_backward(&ds, &cache.relu)?;
    let (da, dgamma, dbeta) = spatial_batchnorm_backward(&dan, &cache.norm)?;
    let (dx, dw, db) = conv_backward(&da, &cache.conv)?;
    Ok(ConvNormReluPoolGrads {
        dx,
        dw,
        db,
        dgamma,
        dbeta,
    })
}
