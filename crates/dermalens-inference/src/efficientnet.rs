//! EfficientNet-B0 feature backbone (local stream).
//!
//! Produces the high-channel local feature grid — `[B, 1280, 10, 10]` at
//! the 300-pixel input resolution — whose final activation is also the
//! observation target of the saliency pass. Structure: a 3×3 stride-2
//! stem, seven MBConv stages with squeeze-excitation, and a 1×1
//! 1280-channel head, all BatchNorm + SiLU.

use candle_core::Tensor;
use candle_nn::{
    batch_norm, conv2d, conv2d_no_bias, BatchNorm, Conv2d, Conv2dConfig, Module, ModuleT,
    VarBuilder,
};

/// BatchNorm epsilon used throughout the backbone.
const BN_EPS: f64 = 1e-5;

/// Channel width after the stem convolution.
const STEM_CHANNELS: usize = 32;

/// Channel depth of the final feature grid.
pub const EFFICIENTNET_OUT_CHANNELS: usize = 1280;

/// Per-stage MBConv configuration:
/// (expansion ratio, kernel size, first-block stride, output channels, repeats).
const STAGE_CONFIG: [(usize, usize, usize, usize, usize); 7] = [
    (1, 3, 1, 16, 1),
    (6, 3, 2, 24, 2),
    (6, 5, 2, 40, 2),
    (6, 3, 2, 80, 3),
    (6, 5, 1, 112, 3),
    (6, 5, 2, 192, 4),
    (6, 3, 1, 320, 1),
];

/// Convolution + BatchNorm + SiLU, the backbone's basic unit.
struct ConvNormAct {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvNormAct {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        groups: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let cfg = Conv2dConfig {
            padding: (kernel - 1) / 2,
            stride,
            groups,
            ..Default::default()
        };
        Ok(Self {
            conv: conv2d_no_bias(in_channels, out_channels, kernel, cfg, vb.pp("conv"))?,
            bn: batch_norm(out_channels, BN_EPS, vb.pp("bn"))?,
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let xs = self.conv.forward(xs)?;
        let xs = self.bn.forward_t(&xs, train)?;
        xs.silu()
    }
}

/// Squeeze-excitation channel gating.
struct SqueezeExcitation {
    fc1: Conv2d,
    fc2: Conv2d,
}

impl SqueezeExcitation {
    fn new(
        channels: usize,
        squeeze_channels: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let cfg = Conv2dConfig::default();
        Ok(Self {
            fc1: conv2d(channels, squeeze_channels, 1, cfg, vb.pp("fc1"))?,
            fc2: conv2d(squeeze_channels, channels, 1, cfg, vb.pp("fc2"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let scale = xs.mean_keepdim((2, 3))?;
        let scale = self.fc1.forward(&scale)?.silu()?;
        let scale = candle_nn::ops::sigmoid(&self.fc2.forward(&scale)?)?;
        xs.broadcast_mul(&scale)
    }
}

/// Mobile inverted bottleneck block with squeeze-excitation.
struct MBConv {
    expand: Option<ConvNormAct>,
    depthwise: ConvNormAct,
    se: SqueezeExcitation,
    project_conv: Conv2d,
    project_bn: BatchNorm,
    use_residual: bool,
}

impl MBConv {
    fn new(
        in_channels: usize,
        out_channels: usize,
        expand_ratio: usize,
        kernel: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let expanded = in_channels * expand_ratio;
        let expand = if expand_ratio == 1 {
            None
        } else {
            Some(ConvNormAct::new(
                in_channels,
                expanded,
                1,
                1,
                1,
                vb.pp("expand"),
            )?)
        };
        let depthwise = ConvNormAct::new(
            expanded,
            expanded,
            kernel,
            stride,
            expanded,
            vb.pp("depthwise"),
        )?;
        // Squeeze width is derived from the block input, not the expanded width.
        let squeeze_channels = std::cmp::max(1, in_channels / 4);
        let se = SqueezeExcitation::new(expanded, squeeze_channels, vb.pp("se"))?;
        let project_cfg = Conv2dConfig::default();
        let project_conv = conv2d_no_bias(
            expanded,
            out_channels,
            1,
            project_cfg,
            vb.pp("project.conv"),
        )?;
        let project_bn = batch_norm(out_channels, BN_EPS, vb.pp("project.bn"))?;

        Ok(Self {
            expand,
            depthwise,
            se,
            project_conv,
            project_bn,
            use_residual: stride == 1 && in_channels == out_channels,
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let residual = xs;
        let ys = match &self.expand {
            Some(expand) => expand.forward_t(xs, train)?,
            None => xs.clone(),
        };
        let ys = self.depthwise.forward_t(&ys, train)?;
        let ys = self.se.forward(&ys)?;
        // Projection is linear: BatchNorm without activation.
        let ys = self.project_bn.forward_t(&self.project_conv.forward(&ys)?, train)?;
        if self.use_residual {
            residual + ys
        } else {
            Ok(ys)
        }
    }
}

/// EfficientNet-B0 backbone truncated at the feature grid (no classifier).
pub struct EfficientNetFeatures {
    stem: ConvNormAct,
    blocks: Vec<MBConv>,
    head: ConvNormAct,
}

impl EfficientNetFeatures {
    pub fn new(vb: VarBuilder) -> candle_core::Result<Self> {
        let stem = ConvNormAct::new(3, STEM_CHANNELS, 3, 2, 1, vb.pp("stem"))?;

        let mut blocks = Vec::new();
        let mut in_channels = STEM_CHANNELS;
        let mut index = 0;
        for (expand_ratio, kernel, stride, out_channels, repeats) in STAGE_CONFIG {
            for repeat in 0..repeats {
                let stride = if repeat == 0 { stride } else { 1 };
                blocks.push(MBConv::new(
                    in_channels,
                    out_channels,
                    expand_ratio,
                    kernel,
                    stride,
                    vb.pp(format!("blocks.{index}")),
                )?);
                in_channels = out_channels;
                index += 1;
            }
        }

        let head = ConvNormAct::new(
            in_channels,
            EFFICIENTNET_OUT_CHANNELS,
            1,
            1,
            1,
            vb.pp("head"),
        )?;

        Ok(Self { stem, blocks, head })
    }

    /// Run the backbone, returning the `[B, 1280, H/32, W/32]` feature grid.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let mut xs = self.stem.forward_t(xs, train)?;
        for block in &self.blocks {
            xs = block.forward_t(&xs, train)?;
        }
        self.head.forward_t(&xs, train)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
