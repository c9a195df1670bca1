//! Cross-attention fusion of the global and local feature vectors.
//!
//! Treats the global stream's vector as a single query token and the
//! local stream's vector as a single key/value token: each head computes
//! its own query/key/value projections and scaled dot-product attention,
//! head outputs are concatenated and projected, and the result is added
//! back onto the query vector (residual) and normalized. The fused
//! vector keeps the global stream's width.

use candle_core::{Tensor, D};
use candle_nn::{layer_norm, linear, linear_no_bias, LayerNorm, Linear, Module, VarBuilder};

/// LayerNorm epsilon for the fusion output.
const LN_EPS: f64 = 1e-5;

/// Single-token multi-head cross-attention with residual + LayerNorm.
pub struct CrossAttentionFusion {
    to_q: Linear,
    to_k: Linear,
    to_v: Linear,
    proj: Linear,
    norm: LayerNorm,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl CrossAttentionFusion {
    pub fn new(
        dim_q: usize,
        dim_kv: usize,
        num_heads: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let head_dim = dim_q / num_heads;
        Ok(Self {
            to_q: linear_no_bias(dim_q, dim_q, vb.pp("to_q"))?,
            to_k: linear_no_bias(dim_kv, dim_q, vb.pp("to_k"))?,
            to_v: linear_no_bias(dim_kv, dim_q, vb.pp("to_v"))?,
            proj: linear(dim_q, dim_q, vb.pp("proj"))?,
            norm: layer_norm(dim_q, LN_EPS, vb.pp("norm"))?,
            num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    /// Fuse `[B, dim_q]` query features with `[B, dim_kv]` key/value
    /// features into `[B, dim_q]`.
    pub fn forward(&self, x_q: &Tensor, x_kv: &Tensor) -> candle_core::Result<Tensor> {
        let (b, _) = x_q.dims2()?;

        // Single-token sequences: [B, heads, 1, head_dim].
        let q = self
            .to_q
            .forward(x_q)?
            .reshape((b, self.num_heads, 1, self.head_dim))?;
        let k = self
            .to_k
            .forward(x_kv)?
            .reshape((b, self.num_heads, 1, self.head_dim))?;
        let v = self
            .to_v
            .forward(x_kv)?
            .reshape((b, self.num_heads, 1, self.head_dim))?;

        let dots = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * self.scale)?;
        let attn = candle_nn::ops::softmax(&dots, D::Minus1)?;
        let out = attn.matmul(&v)?;

        let out = out.reshape((b, self.num_heads * self.head_dim))?;
        let out = self.proj.forward(&out)?;
        self.norm.forward(&(x_q + out)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
