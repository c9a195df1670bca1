//! Self-attention encoder for the global stream's token sequence.
//!
//! A stack of post-norm encoder layers (multi-head self-attention,
//! then a ReLU feed-forward block, each followed by residual add and
//! LayerNorm). Dropout positions exist for architectural parity with the
//! trained weights but are disabled whenever `train` is `false`.

use candle_core::{Tensor, D};
use candle_nn::{layer_norm, linear, Dropout, LayerNorm, Linear, Module, ModuleT, VarBuilder};

/// Feed-forward inner width.
const FFN_DIM: usize = 2048;

/// LayerNorm epsilon for the encoder layers.
const LN_EPS: f64 = 1e-5;

/// Multi-head self-attention over a `[B, T, C]` token sequence.
pub struct MultiHeadSelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl MultiHeadSelfAttention {
    pub fn new(dim: usize, num_heads: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let head_dim = dim / num_heads;
        Ok(Self {
            q_proj: linear(dim, dim, vb.pp("q_proj"))?,
            k_proj: linear(dim, dim, vb.pp("k_proj"))?,
            v_proj: linear(dim, dim, vb.pp("v_proj"))?,
            out_proj: linear(dim, dim, vb.pp("out_proj"))?,
            num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    /// Split a `[B, T, C]` projection into `[B, heads, T, head_dim]`.
    fn split_heads(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (b, t, _) = xs.dims3()?;
        xs.reshape((b, t, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    pub fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (b, t, c) = xs.dims3()?;
        let q = (self.split_heads(&self.q_proj.forward(xs)?)? * self.scale)?;
        let k = self.split_heads(&self.k_proj.forward(xs)?)?;
        let v = self.split_heads(&self.v_proj.forward(xs)?)?;

        let attn = q.matmul(&k.transpose(2, 3)?.contiguous()?)?;
        let attn = candle_nn::ops::softmax(&attn, D::Minus1)?;

        let ys = attn.matmul(&v)?;
        let ys = ys.transpose(1, 2)?.contiguous()?.reshape((b, t, c))?;
        self.out_proj.forward(&ys)
    }
}

/// One post-norm encoder layer.
pub struct EncoderLayer {
    self_attn: MultiHeadSelfAttention,
    linear1: Linear,
    linear2: Linear,
    norm1: LayerNorm,
    norm2: LayerNorm,
    dropout: Dropout,
}

impl EncoderLayer {
    pub fn new(
        dim: usize,
        num_heads: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        Ok(Self {
            self_attn: MultiHeadSelfAttention::new(dim, num_heads, vb.pp("self_attn"))?,
            linear1: linear(dim, FFN_DIM, vb.pp("linear1"))?,
            linear2: linear(FFN_DIM, dim, vb.pp("linear2"))?,
            norm1: layer_norm(dim, LN_EPS, vb.pp("norm1"))?,
            norm2: layer_norm(dim, LN_EPS, vb.pp("norm2"))?,
            dropout: Dropout::new(dropout),
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let attn = self.self_attn.forward(xs)?;
        let attn = self.dropout.forward_t(&attn, train)?;
        let xs = self.norm1.forward(&(xs + attn)?)?;

        let ff = self.linear1.forward(&xs)?.relu()?;
        let ff = self.dropout.forward_t(&ff, train)?;
        let ff = self.linear2.forward(&ff)?;
        let ff = self.dropout.forward_t(&ff, train)?;
        self.norm2.forward(&(&xs + ff)?)
    }
}

/// Stack of encoder layers.
pub struct TransformerEncoder {
    layers: Vec<EncoderLayer>,
}

impl TransformerEncoder {
    pub fn new(
        dim: usize,
        num_heads: usize,
        num_layers: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            layers.push(EncoderLayer::new(
                dim,
                num_heads,
                dropout,
                vb.pp(format!("layers.{i}")),
            )?);
        }
        Ok(Self { layers })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let mut xs = xs.clone();
        for layer in &self.layers {
            xs = layer.forward_t(&xs, train)?;
        }
        Ok(xs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
