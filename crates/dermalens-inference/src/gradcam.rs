//! Grad-CAM saliency over the local stream's activation grid.
//!
//! Produces a spatial importance map for a single target class by
//! weighting the final EfficientNet activation channels with their
//! spatially-averaged gradients, taken from one backward pass out of the
//! target class logit.
//!
//! # Strategy
//!
//! Rather than registering forward/backward hooks on shared network
//! state, the explainer wraps one invocation of the split forward
//! surface: the activation grid is captured as a plain forward result,
//! rewrapped as a gradient-tracked [`Var`] (the observation point), and
//! the rest of the network runs from that variable. The gradient store
//! returned by `backward()` is local to the call, so nothing persists
//! between requests.

use candle_core::{IndexOp, Tensor, Var};
use dermalens_core::{DermalensError, Result};

use crate::network::FusionNetwork;

/// A normalized spatial importance map, row-major.
#[derive(Debug, Clone)]
pub struct Heatmap {
    /// Row-major values in `[0, 1]`, length `width * height`.
    pub data: Vec<f32>,
    /// Grid width.
    pub width: usize,
    /// Grid height.
    pub height: usize,
}

/// Grad-CAM explainer borrowing the network for one invocation.
pub struct GradCam<'a> {
    network: &'a FusionNetwork,
}

impl<'a> GradCam<'a> {
    /// Create an explainer over `network`.
    #[must_use]
    pub fn new(network: &'a FusionNetwork) -> Self {
        Self { network }
    }

    /// Compute the saliency map for `target_class` on a single
    /// preprocessed `[3, S, S]` image tensor (identity view, eval mode).
    ///
    /// # Errors
    ///
    /// Returns [`DermalensError::Inference`] on shape mismatches, an
    /// out-of-range target class, or a failed backward pass.
    pub fn explain(
        &self,
        image: &Tensor,
        meta: &Tensor,
        target_class: usize,
    ) -> Result<Heatmap> {
        let images = image
            .unsqueeze(0)
            .map_err(|e| DermalensError::Inference(format!("Failed to batch image: {e}")))?;
        let meta = meta
            .unsqueeze(0)
            .map_err(|e| DermalensError::Inference(format!("Failed to batch metadata: {e}")))?;

        // Observation point: capture the local activation grid and rewrap
        // it as a gradient-tracked variable.
        let activation = self.network.local_features(&images, false)?.detach();
        let act_var = Var::from_tensor(&activation).map_err(|e| {
            DermalensError::Inference(format!("Failed to create saliency variable: {e}"))
        })?;

        // The global stream and metadata are constants for this pass; only
        // the gradient at the observed activation is needed.
        let feat_global = self.network.global_features(&images, false)?.detach();
        let logits = self
            .network
            .head(&feat_global, act_var.as_tensor(), &meta, false)?;

        let score = logits.i((0, target_class)).map_err(|e| {
            DermalensError::Inference(format!("Invalid target class {target_class}: {e}"))
        })?;
        let grads = score
            .backward()
            .map_err(|e| DermalensError::Inference(format!("Backward pass failed: {e}")))?;
        let grad = grads.get(act_var.as_tensor()).ok_or_else(|| {
            DermalensError::Inference("No gradient recorded at the saliency layer".to_string())
        })?;

        // Channel weights: spatial average of the gradients, then a
        // weighted sum of the activation channels, ReLU, normalize.
        let cam = (|| -> candle_core::Result<Tensor> {
            let weights = grad.mean_keepdim((2, 3))?;
            let cam = activation.broadcast_mul(&weights)?.sum(1)?;
            let cam = cam.squeeze(0)?.relu()?;
            normalize_cam(&cam)
        })()
        .map_err(|e| DermalensError::Inference(format!("CAM computation failed: {e}")))?;

        let (height, width) = cam
            .dims2()
            .map_err(|e| DermalensError::Inference(format!("Unexpected CAM shape: {e}")))?;
        let data = cam.flatten_all().and_then(|t| t.to_vec1()).map_err(|e| {
            DermalensError::Inference(format!("Failed to extract CAM values: {e}"))
        })?;

        Ok(Heatmap {
            data,
            width,
            height,
        })
    }
}

/// Min-max normalize a post-ReLU CAM to `[0, 1]`.
///
/// A CAM with zero maximum, or with zero range between minimum and
/// maximum, is degenerate and maps to the all-zero tensor instead of
/// dividing by zero.
fn normalize_cam(cam: &Tensor) -> candle_core::Result<Tensor> {
    let flat = cam.flatten_all()?;
    let max = flat.max(0)?.to_scalar::<f32>()?;
    if max == 0.0 {
        return cam.zeros_like();
    }
    let min = flat.min(0)?.to_scalar::<f32>()?;
    let range = max - min;
    if range <= f32::EPSILON {
        return cam.zeros_like();
    }
    cam.affine(1.0 / f64::from(range), -f64::from(min) / f64::from(range))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
