//! ConvNeXt-Tiny feature backbone (global stream).
//!
//! Produces the `[B, 768, H/32, W/32]` feature grid that the global
//! stream projects and feeds to its transformer encoder. Structure:
//! a 4×4 stride-4 patchify stem, then four stages of depthwise-7×7
//! blocks (channels-last LayerNorm, pointwise MLP with GELU, per-channel
//! layer scale) with 2×2 stride-2 downsampling between stages.

use candle_core::Tensor;
use candle_nn::init::Init;
use candle_nn::{
    conv2d, layer_norm, linear, Conv2d, Conv2dConfig, LayerNorm, Linear, Module, VarBuilder,
};

/// Channel width of each stage.
const STAGE_DIMS: [usize; 4] = [96, 192, 384, 768];

/// Number of blocks in each stage.
const STAGE_DEPTHS: [usize; 4] = [3, 3, 9, 3];

/// LayerNorm epsilon used throughout the backbone.
const LN_EPS: f64 = 1e-6;

/// Initial value of the learned per-channel layer scale.
const LAYER_SCALE_INIT: f64 = 1e-6;

/// Channel depth of the final feature grid.
pub const CONVNEXT_OUT_CHANNELS: usize = 768;

/// LayerNorm over the channel dimension of a channels-first feature map.
struct ChannelsFirstLayerNorm {
    inner: LayerNorm,
}

impl ChannelsFirstLayerNorm {
    fn new(dim: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            inner: layer_norm(dim, LN_EPS, vb)?,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        // [B, C, H, W] -> [B, H, W, C], normalize over C, back.
        let xs = xs.permute((0, 2, 3, 1))?.contiguous()?;
        let xs = self.inner.forward(&xs)?;
        xs.permute((0, 3, 1, 2))?.contiguous()
    }
}

/// One ConvNeXt block: depthwise 7×7 conv, channels-last LayerNorm,
/// pointwise 4× MLP with GELU, layer scale, residual.
struct ConvNextBlock {
    dwconv: Conv2d,
    norm: LayerNorm,
    pwconv1: Linear,
    pwconv2: Linear,
    layer_scale: Tensor,
}

impl ConvNextBlock {
    fn new(dim: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: 3,
            groups: dim,
            ..Default::default()
        };
        Ok(Self {
            dwconv: conv2d(dim, dim, 7, conv_cfg, vb.pp("dwconv"))?,
            norm: layer_norm(dim, LN_EPS, vb.pp("norm"))?,
            pwconv1: linear(dim, 4 * dim, vb.pp("pwconv1"))?,
            pwconv2: linear(4 * dim, dim, vb.pp("pwconv2"))?,
            layer_scale: vb.get_with_hints(
                (dim, 1, 1),
                "layer_scale",
                Init::Const(LAYER_SCALE_INIT),
            )?,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let residual = xs;
        let xs = self.dwconv.forward(xs)?;
        let xs = xs.permute((0, 2, 3, 1))?.contiguous()?;
        let xs = self.norm.forward(&xs)?;
        let xs = self.pwconv1.forward(&xs)?;
        let xs = xs.gelu_erf()?;
        let xs = self.pwconv2.forward(&xs)?;
        let xs = xs.permute((0, 3, 1, 2))?.contiguous()?;
        let xs = xs.broadcast_mul(&self.layer_scale)?;
        residual + xs
    }
}

/// Between-stage downsampling: LayerNorm then 2×2 stride-2 conv.
struct Downsample {
    norm: ChannelsFirstLayerNorm,
    conv: Conv2d,
}

impl Downsample {
    fn new(in_dim: usize, out_dim: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let conv_cfg = Conv2dConfig {
            stride: 2,
            ..Default::default()
        };
        Ok(Self {
            norm: ChannelsFirstLayerNorm::new(in_dim, vb.pp("norm"))?,
            conv: conv2d(in_dim, out_dim, 2, conv_cfg, vb.pp("conv"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.conv.forward(&self.norm.forward(xs)?)
    }
}

struct Stage {
    downsample: Option<Downsample>,
    blocks: Vec<ConvNextBlock>,
}

/// ConvNeXt-Tiny backbone truncated at the feature grid (no classifier).
pub struct ConvNextFeatures {
    stem_conv: Conv2d,
    stem_norm: ChannelsFirstLayerNorm,
    stages: Vec<Stage>,
}

impl ConvNextFeatures {
    pub fn new(vb: VarBuilder) -> candle_core::Result<Self> {
        let stem_cfg = Conv2dConfig {
            stride: 4,
            ..Default::default()
        };
        let stem_conv = conv2d(3, STAGE_DIMS[0], 4, stem_cfg, vb.pp("stem.conv"))?;
        let stem_norm = ChannelsFirstLayerNorm::new(STAGE_DIMS[0], vb.pp("stem.norm"))?;

        let mut stages = Vec::with_capacity(STAGE_DIMS.len());
        for (i, (&dim, &depth)) in STAGE_DIMS.iter().zip(STAGE_DEPTHS.iter()).enumerate() {
            let stage_vb = vb.pp(format!("stages.{i}"));
            let downsample = if i == 0 {
                None
            } else {
                Some(Downsample::new(
                    STAGE_DIMS[i - 1],
                    dim,
                    stage_vb.pp("downsample"),
                )?)
            };
            let mut blocks = Vec::with_capacity(depth);
            for j in 0..depth {
                blocks.push(ConvNextBlock::new(dim, stage_vb.pp(format!("blocks.{j}")))?);
            }
            stages.push(Stage { downsample, blocks });
        }

        Ok(Self {
            stem_conv,
            stem_norm,
            stages,
        })
    }

    /// Run the backbone, returning the `[B, 768, H/32, W/32]` feature grid.
    pub fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut xs = self.stem_norm.forward(&self.stem_conv.forward(xs)?)?;
        for stage in &self.stages {
            if let Some(downsample) = &stage.downsample {
                xs = downsample.forward(&xs)?;
            }
            for block in &stage.blocks {
                xs = block.forward(&xs)?;
            }
        }
        Ok(xs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
