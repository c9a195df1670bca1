//! Test-time augmentation ensembling.
//!
//! Builds four deterministic geometric views of the single preprocessed
//! image tensor — identity, horizontal flip, vertical flip, and a 90°
//! rotation — runs the network on each (same metadata, eval mode),
//! softmaxes per view, and averages. The accumulation is commutative:
//! permuting the view order changes the result only within floating-point
//! tolerance.

use candle_core::{Tensor, D};
use dermalens_core::{DermalensError, Result, NUM_CLASSES};

use crate::network::FusionNetwork;

/// Number of augmentation views.
pub const NUM_VIEWS: usize = 4;

/// Reverse a `[3, H, W]` image tensor along `dim`.
fn flip(image: &Tensor, dim: usize) -> candle_core::Result<Tensor> {
    let len = image.dim(dim)?;
    let indices: Vec<u32> = (0..len as u32).rev().collect();
    let indices = Tensor::from_vec(indices, len, image.device())?;
    image.index_select(&indices, dim)
}

/// Rotate a square `[3, H, W]` image tensor 90° (transpose, then reverse
/// rows).
fn rot90(image: &Tensor) -> candle_core::Result<Tensor> {
    flip(&image.transpose(1, 2)?.contiguous()?, 1)
}

/// Build the four deterministic views of a preprocessed `[3, S, S]` image
/// tensor, in canonical order: identity, horizontal flip, vertical flip,
/// 90° rotation.
pub fn views(image: &Tensor) -> Result<Vec<Tensor>> {
    let build = || -> candle_core::Result<Vec<Tensor>> {
        Ok(vec![
            image.clone(),
            flip(image, 2)?,
            flip(image, 1)?,
            rot90(image)?,
        ])
    };
    build().map_err(|e| {
        DermalensError::Inference(format!("Failed to build augmentation views: {e}"))
    })
}

/// Average per-view softmax probabilities over an explicit view list.
///
/// Each view is run as a batch of one with the same metadata vector; the
/// per-class probability sums are divided by the view count at the end.
pub fn ensemble_views(
    network: &FusionNetwork,
    views: &[Tensor],
    meta: &Tensor,
) -> Result<Vec<f32>> {
    let meta_batch = meta
        .unsqueeze(0)
        .map_err(|e| DermalensError::Inference(format!("Failed to batch metadata: {e}")))?;

    let mut sums = vec![0.0_f32; NUM_CLASSES];
    for view in views {
        let batch = view
            .unsqueeze(0)
            .map_err(|e| DermalensError::Inference(format!("Failed to batch view: {e}")))?;
        let logits = network.forward(&batch, &meta_batch, false)?;
        let probs = candle_nn::ops::softmax(&logits, D::Minus1)
            .map_err(|e| DermalensError::Inference(format!("Softmax failed: {e}")))?;
        let probs: Vec<f32> = probs
            .squeeze(0)
            .and_then(|t| t.to_vec1())
            .map_err(|e| {
                DermalensError::Inference(format!("Probability extraction failed: {e}"))
            })?;
        for (sum, p) in sums.iter_mut().zip(probs) {
            *sum += p;
        }
    }

    let count = views.len() as f32;
    for sum in &mut sums {
        *sum /= count;
    }
    Ok(sums)
}

/// Run the full four-view ensemble on a preprocessed `[3, S, S]` image
/// tensor, returning the averaged class probabilities.
pub fn ensemble(
    network: &FusionNetwork,
    image: &Tensor,
    meta: &Tensor,
) -> Result<Vec<f32>> {
    ensemble_views(network, &views(image)?, meta)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    /// A 1-channel-per-position 2×2 test image with distinct values.
    fn toy_image(device: &Device) -> Tensor {
        // Channel 0 layout: [[1, 2], [3, 4]].
        let data = vec![
            1.0_f32, 2.0, 3.0, 4.0, // channel 0
            1.0, 2.0, 3.0, 4.0, // channel 1
            1.0, 2.0, 3.0, 4.0, // channel 2
        ];
        Tensor::from_vec(data, (3, 2, 2), device).unwrap()
    }

    fn channel0(image: &Tensor) -> Vec<Vec<f32>> {
        image.to_vec3::<f32>().unwrap().remove(0)
    }

    #[test]
    fn test_horizontal_flip_reverses_columns() {
        let device = Device::Cpu;
        let flipped = flip(&toy_image(&device), 2).unwrap();
        assert_eq!(channel0(&flipped), vec![vec![2.0, 1.0], vec![4.0, 3.0]]);
    }

    #[test]
    fn test_vertical_flip_reverses_rows() {
        let device = Device::Cpu;
        let flipped = flip(&toy_image(&device), 1).unwrap();
        assert_eq!(channel0(&flipped), vec![vec![3.0, 4.0], vec![1.0, 2.0]]);
    }

    #[test]
    fn test_flip_is_involution() {
        let device = Device::Cpu;
        let image = toy_image(&device);
        let twice = flip(&flip(&image, 2).unwrap(), 2).unwrap();
        assert_eq!(channel0(&image), channel0(&twice));
    }

    #[test]
    fn test_rot90_quarter_turn() {
        let device = Device::Cpu;
        let rotated = rot90(&toy_image(&device)).unwrap();
        // [[1, 2], [3, 4]] rotated counter-clockwise is [[2, 4], [1, 3]].
        assert_eq!(channel0(&rotated), vec![vec![2.0, 4.0], vec![1.0, 3.0]]);
    }

    #[test]
    fn test_rot90_four_times_is_identity() {
        let device = Device::Cpu;
        let image = toy_image(&device);
        let mut rotated = image.clone();
        for _ in 0..4 {
            rotated = rot90(&rotated).unwrap();
        }
        assert_eq!(channel0(&image), channel0(&rotated));
    }

    #[test]
    fn test_views_count_and_shapes() {
        let device = Device::Cpu;
        let image = Tensor::zeros((3, 6, 6), candle_core::DType::F32, &device).unwrap();
        let views = views(&image).unwrap();
        assert_eq!(views.len(), NUM_VIEWS);
        for view in &views {
            assert_eq!(view.dims(), &[3, 6, 6]);
        }
    }

    #[test]
    fn test_views_are_distinct_for_asymmetric_input() {
        let device = Device::Cpu;
        let views = views(&toy_image(&device)).unwrap();
        let rendered: Vec<Vec<Vec<f32>>> = views.iter().map(channel0).collect();
        for i in 0..rendered.len() {
            for j in (i + 1)..rendered.len() {
                assert_ne!(rendered[i], rendered[j], "views {i} and {j} collide");
            }
        }
    }
}
