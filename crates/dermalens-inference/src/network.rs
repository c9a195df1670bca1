//! The dual-stream fusion network.
//!
//! Two parallel streams consume the same normalized image tensor and are
//! merged with the encoded patient metadata:
//!
//! ```text
//!            ┌─ Stream A: ConvNeXt features → 1×1 proj → tokens
//!            │            + positional embedding → transformer → mean-pool
//! image ─────┤                                         │
//!            └─ Stream B: EfficientNet features → GAP ─┤ cross-attention
//!                                                      │ fusion (+res, LN)
//! metadata ── Linear → BatchNorm → ReLU → Dropout ─────┤
//!                                                      └─ concat →
//!                                 Linear → BatchNorm → ReLU → Dropout →
//!                                 Linear → logits[num_classes]
//! ```
//!
//! Training mode is an explicit parameter of every forward operation;
//! inference passes `false` so dropout is disabled and batch norms use
//! running statistics only (per-sample independence in batched calls).
//!
//! The network also exposes a split forward surface
//! ([`FusionNetwork::local_features`] / [`FusionNetwork::global_features`]
//! / [`FusionNetwork::head`]) so the saliency pass can observe the local
//! stream's activation grid without hook state on the shared instance.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::init::Init;
use candle_nn::{
    batch_norm, conv2d, linear, BatchNorm, Conv2d, Conv2dConfig, Dropout, Linear, Module,
    ModuleT, VarBuilder, VarMap,
};
use dermalens_core::{DermalensError, Result, NUM_CLASSES, NUM_META_FEATURES};

use crate::convnext::{ConvNextFeatures, CONVNEXT_OUT_CHANNELS};
use crate::efficientnet::{EfficientNetFeatures, EFFICIENTNET_OUT_CHANNELS};
use crate::fusion::CrossAttentionFusion;
use crate::transformer::TransformerEncoder;

/// Width of the transformer embedding and of the fused image feature.
pub const TRANSFORMER_DIM: usize = 512;

/// Attention heads in the encoder and the fusion module.
const NUM_HEADS: usize = 8;

/// Encoder depth.
const TRANSFORMER_LAYERS: usize = 4;

/// Trained length of the positional embedding (token positions).
const POS_EMBED_LEN: usize = 400;

/// Width of the metadata embedding.
const META_EMBED_DIM: usize = 64;

/// Hidden width of the classifier head.
const CLASSIFIER_HIDDEN: usize = 256;

const ENCODER_DROPOUT: f32 = 0.1;
const META_DROPOUT: f32 = 0.2;
const CLASSIFIER_DROPOUT: f32 = 0.4;

/// BatchNorm epsilon for the metadata branch and classifier head.
const BN_EPS: f64 = 1e-5;

// ---------------------------------------------------------------------------
// Streams and heads
// ---------------------------------------------------------------------------

/// Stream A: ConvNeXt backbone + transformer encoder over spatial tokens.
struct GlobalStream {
    backbone: ConvNextFeatures,
    projection: Conv2d,
    pos_embedding: Tensor,
    encoder: TransformerEncoder,
}

impl GlobalStream {
    fn new(vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            backbone: ConvNextFeatures::new(vb.pp("backbone"))?,
            projection: conv2d(
                CONVNEXT_OUT_CHANNELS,
                TRANSFORMER_DIM,
                1,
                Conv2dConfig::default(),
                vb.pp("projection"),
            )?,
            pos_embedding: vb.get_with_hints(
                (1, POS_EMBED_LEN, TRANSFORMER_DIM),
                "pos_embedding",
                Init::Randn {
                    mean: 0.0,
                    stdev: 1.0,
                },
            )?,
            encoder: TransformerEncoder::new(
                TRANSFORMER_DIM,
                NUM_HEADS,
                TRANSFORMER_LAYERS,
                ENCODER_DROPOUT,
                vb.pp("encoder"),
            )?,
        })
    }

    fn forward_t(&self, images: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let features = self.backbone.forward(images)?;
        let features = self.projection.forward(&features)?;
        let (b, c, h, w) = features.dims4()?;

        // Flatten spatial positions into a token sequence: [B, H*W, C].
        let tokens = features.reshape((b, c, h * w))?.transpose(1, 2)?.contiguous()?;
        let pos = interpolate_pos_embedding(&self.pos_embedding, h * w)?;
        let tokens = tokens.broadcast_add(&pos)?;

        let encoded = self.encoder.forward_t(&tokens, train)?;
        encoded.mean(1)
    }
}

/// Linearly resample the trained positional embedding along the token
/// axis (half-pixel centers, clamped at the edges) when the live token
/// count differs from the trained length.
fn interpolate_pos_embedding(
    pos: &Tensor,
    target_len: usize,
) -> candle_core::Result<Tensor> {
    let (_, src_len, _) = pos.dims3()?;
    if src_len == target_len {
        return Ok(pos.clone());
    }

    let device = pos.device();
    let scale = src_len as f64 / target_len as f64;
    let mut left = Vec::with_capacity(target_len);
    let mut right = Vec::with_capacity(target_len);
    let mut frac = Vec::with_capacity(target_len);
    for i in 0..target_len {
        let x = ((i as f64 + 0.5) * scale - 0.5).clamp(0.0, (src_len - 1) as f64);
        let lo = x.floor() as usize;
        let hi = (lo + 1).min(src_len - 1);
        left.push(lo as u32);
        right.push(hi as u32);
        frac.push((x - lo as f64) as f32);
    }

    let left = Tensor::from_vec(left, target_len, device)?;
    let right = Tensor::from_vec(right, target_len, device)?;
    let weight = Tensor::from_vec(frac, (1, target_len, 1), device)?;

    let lo = pos.index_select(&left, 1)?;
    let hi = pos.index_select(&right, 1)?;
    lo.broadcast_mul(&weight.affine(-1.0, 1.0)?)?
        .broadcast_add(&hi.broadcast_mul(&weight)?)
}

/// Stream B: EfficientNet backbone with a global-average-pool head.
struct LocalStream {
    backbone: EfficientNetFeatures,
}

impl LocalStream {
    fn new(vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            backbone: EfficientNetFeatures::new(vb.pp("backbone"))?,
        })
    }

    fn features(&self, images: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        self.backbone.forward_t(images, train)
    }
}

/// Metadata embedding branch.
struct MetadataBranch {
    fc: Linear,
    bn: BatchNorm,
    dropout: Dropout,
}

impl MetadataBranch {
    fn new(vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            fc: linear(NUM_META_FEATURES, META_EMBED_DIM, vb.pp("fc"))?,
            bn: batch_norm(META_EMBED_DIM, BN_EPS, vb.pp("bn"))?,
            dropout: Dropout::new(META_DROPOUT),
        })
    }

    fn forward_t(&self, meta: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let xs = self.fc.forward(meta)?;
        let xs = self.bn.forward_t(&xs, train)?;
        let xs = xs.relu()?;
        self.dropout.forward_t(&xs, train)
    }
}

/// Classifier head over the concatenated image + metadata features.
struct ClassifierHead {
    fc1: Linear,
    bn: BatchNorm,
    dropout: Dropout,
    fc2: Linear,
}

impl ClassifierHead {
    fn new(vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            fc1: linear(
                TRANSFORMER_DIM + META_EMBED_DIM,
                CLASSIFIER_HIDDEN,
                vb.pp("fc1"),
            )?,
            bn: batch_norm(CLASSIFIER_HIDDEN, BN_EPS, vb.pp("bn"))?,
            dropout: Dropout::new(CLASSIFIER_DROPOUT),
            fc2: linear(CLASSIFIER_HIDDEN, NUM_CLASSES, vb.pp("fc2"))?,
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let xs = self.fc1.forward(xs)?;
        let xs = self.bn.forward_t(&xs, train)?;
        let xs = xs.relu()?;
        let xs = self.dropout.forward_t(&xs, train)?;
        self.fc2.forward(&xs)
    }
}

// ---------------------------------------------------------------------------
// FusionNetwork
// ---------------------------------------------------------------------------

/// The dual-stream fusion network.
///
/// Owns its parameter tensors for the process lifetime; they are immutable
/// after construction. All forward operations take `&self` and an explicit
/// `train` flag.
pub struct FusionNetwork {
    stream_a: GlobalStream,
    stream_b: LocalStream,
    fusion: CrossAttentionFusion,
    meta_net: MetadataBranch,
    classifier: ClassifierHead,
    device: Device,
}

impl FusionNetwork {
    fn build(vb: VarBuilder, device: &Device) -> candle_core::Result<Self> {
        Ok(Self {
            stream_a: GlobalStream::new(vb.pp("stream_a"))?,
            stream_b: LocalStream::new(vb.pp("stream_b"))?,
            fusion: CrossAttentionFusion::new(
                TRANSFORMER_DIM,
                EFFICIENTNET_OUT_CHANNELS,
                NUM_HEADS,
                vb.pp("fusion"),
            )?,
            meta_net: MetadataBranch::new(vb.pp("meta_net"))?,
            classifier: ClassifierHead::new(vb.pp("classifier"))?,
            device: device.clone(),
        })
    }

    /// Load the network from a safetensors weight blob.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the weights do not
    /// match the expected architecture.
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        // SAFETY: memory-mapping safetensors is the standard candle pattern.
        // The file is read-only and remains valid for the network lifetime.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[path.to_path_buf()], DType::F32, device)
                .map_err(|e| {
                    DermalensError::Model(format!("Failed to load weights: {e}"))
                })?
        };
        Self::build(vb, device)
            .map_err(|e| DermalensError::Model(format!("Failed to build network from weights: {e}")))
    }

    /// Create a network with random weights.
    ///
    /// Used as the startup fallback when the weight blob is missing;
    /// predictions are meaningless but the pipeline stays serviceable.
    pub fn new_random(device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        Self::build(vb, device)
            .map_err(|e| DermalensError::Model(format!("Failed to build network: {e}")))
    }

    /// Run a full forward pass.
    ///
    /// `images` is `[B, 3, S, S]`, `meta` is `[B, 19]`; returns logits
    /// `[B, num_classes]`. Deterministic given weights when `train` is
    /// `false`.
    pub fn forward(&self, images: &Tensor, meta: &Tensor, train: bool) -> Result<Tensor> {
        let feat_global = self
            .stream_a
            .forward_t(images, train)
            .map_err(|e| DermalensError::Inference(format!("Global stream failed: {e}")))?;
        let local_activation = self
            .stream_b
            .features(images, train)
            .map_err(|e| DermalensError::Inference(format!("Local stream failed: {e}")))?;
        self.head(&feat_global, &local_activation, meta, train)
    }

    /// Run only the local (EfficientNet) backbone, returning its final
    /// activation grid `[B, 1280, h, w]` — the saliency observation layer.
    pub fn local_features(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        self.stream_b
            .features(images, train)
            .map_err(|e| DermalensError::Inference(format!("Local stream failed: {e}")))
    }

    /// Run only the global stream, returning its `[B, 512]` feature vector.
    pub fn global_features(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        self.stream_a
            .forward_t(images, train)
            .map_err(|e| DermalensError::Inference(format!("Global stream failed: {e}")))
    }

    /// Complete the forward pass from precomputed stream outputs.
    ///
    /// Pools the local activation grid, fuses it with the global feature
    /// vector, embeds the metadata, and classifies. The saliency pass
    /// calls this with a gradient-tracked activation.
    pub fn head(
        &self,
        feat_global: &Tensor,
        local_activation: &Tensor,
        meta: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let feat_local = local_activation
            .mean((2, 3))
            .map_err(|e| DermalensError::Inference(format!("Local pooling failed: {e}")))?;
        let fused = self
            .fusion
            .forward(feat_global, &feat_local)
            .map_err(|e| DermalensError::Inference(format!("Fusion failed: {e}")))?;
        let feat_meta = self
            .meta_net
            .forward_t(meta, train)
            .map_err(|e| DermalensError::Inference(format!("Metadata branch failed: {e}")))?;
        let combined = Tensor::cat(&[&fused, &feat_meta], 1)
            .map_err(|e| DermalensError::Inference(format!("Feature concat failed: {e}")))?;
        self.classifier
            .forward_t(&combined, train)
            .map_err(|e| DermalensError::Inference(format!("Classifier failed: {e}")))
    }

    /// Returns the device this network runs on.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
