//! Image decoding and model-input tensor preparation.
//!
//! Turns raw PNG/JPEG bytes into the normalized `[3, 300, 300]` tensor the
//! fusion network consumes. Every step is deterministic; the preprocessed
//! tensor is computed once per request and reused for all augmentation
//! views and for the saliency pass.
//!
//! Steps, in order: decode to RGB; optional RGB→BGR channel swap (a
//! calibration constant — must match the color space the weights were
//! trained against, see [`ColorOrder`]); bilinear resize to 300×300; scale
//! to `[0, 1]`; fixed per-channel normalization in stored-channel order.

use candle_core::{Device, Tensor};
use dermalens_core::{ColorOrder, DermalensError, Result, IMG_SIZE};
use image::imageops::FilterType;
use image::RgbImage;

/// Per-channel normalization mean, aligned with the stored channel order.
pub const NORM_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// Per-channel normalization standard deviation.
pub const NORM_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Decode raw image bytes to an RGB image.
///
/// # Errors
///
/// Returns [`DermalensError::Decode`] when the bytes do not parse as a
/// supported raster format. This is surfaced before the network is ever
/// touched.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| DermalensError::Decode(format!("Unsupported or corrupt image data: {e}")))?;
    Ok(image.to_rgb8())
}

/// Bilinear-resize an image to the square analysis resolution.
#[must_use]
pub fn resize_for_analysis(image: &RgbImage) -> RgbImage {
    image::imageops::resize(
        image,
        IMG_SIZE as u32,
        IMG_SIZE as u32,
        FilterType::Triangle,
    )
}

/// Build the normalized `[3, 300, 300]` model input tensor.
///
/// # Errors
///
/// Returns [`DermalensError::Inference`] if the tensor cannot be created
/// on `device`.
pub fn to_model_tensor(
    image: &RgbImage,
    color_order: ColorOrder,
    device: &Device,
) -> Result<Tensor> {
    let resized = resize_for_analysis(image);
    let plane = IMG_SIZE * IMG_SIZE;
    let mut data = vec![0.0_f32; 3 * plane];

    for (x, y, pixel) in resized.enumerate_pixels() {
        let pos = y as usize * IMG_SIZE + x as usize;
        let [r, g, b] = pixel.0;
        let channels = match color_order {
            ColorOrder::Rgb => [r, g, b],
            ColorOrder::Bgr => [b, g, r],
        };
        for (c, value) in channels.iter().enumerate() {
            data[c * plane + pos] =
                (f32::from(*value) / 255.0 - NORM_MEAN[c]) / NORM_STD[c];
        }
    }

    Tensor::from_vec(data, (3, IMG_SIZE, IMG_SIZE), device)
        .map_err(|e| DermalensError::Inference(format!("Failed to build image tensor: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid_image(r: u8, g: u8, b: u8) -> RgbImage {
        RgbImage::from_pixel(8, 8, Rgb([r, g, b]))
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result = decode_rgb(b"definitely not an image");
        assert!(matches!(result, Err(DermalensError::Decode(_))));
    }

    #[test]
    fn test_decode_accepts_png() {
        let mut bytes = Vec::new();
        let image = image::DynamicImage::ImageRgb8(solid_image(10, 20, 30));
        image
            .write_to(
                &mut std::io::Cursor::new(&mut bytes),
                image::ImageOutputFormat::Png,
            )
            .unwrap();
        let decoded = decode_rgb(&bytes).unwrap();
        assert_eq!(decoded.get_pixel(0, 0).0, [10, 20, 30]);
    }

    #[test]
    fn test_tensor_shape() {
        let device = Device::Cpu;
        let tensor =
            to_model_tensor(&solid_image(128, 128, 128), ColorOrder::Bgr, &device).unwrap();
        assert_eq!(tensor.dims(), &[3, IMG_SIZE, IMG_SIZE]);
    }

    #[test]
    fn test_uniform_image_normalizes_to_known_values() {
        let device = Device::Cpu;
        let tensor =
            to_model_tensor(&solid_image(128, 128, 128), ColorOrder::Rgb, &device).unwrap();
        let values: Vec<Vec<Vec<f32>>> = tensor.to_vec3().unwrap();
        for (c, plane) in values.iter().enumerate() {
            let expected = (128.0 / 255.0 - NORM_MEAN[c]) / NORM_STD[c];
            assert!((plane[0][0] - expected).abs() < 1e-5);
            // Uniform input stays uniform through the bilinear resize.
            assert!((plane[150][299] - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn test_bgr_swaps_channels() {
        let device = Device::Cpu;
        let red = solid_image(255, 0, 0);

        let rgb = to_model_tensor(&red, ColorOrder::Rgb, &device).unwrap();
        let rgb: Vec<Vec<Vec<f32>>> = rgb.to_vec3().unwrap();
        let expected_hot = (1.0 - NORM_MEAN[0]) / NORM_STD[0];
        assert!((rgb[0][0][0] - expected_hot).abs() < 1e-5);

        let bgr = to_model_tensor(&red, ColorOrder::Bgr, &device).unwrap();
        let bgr: Vec<Vec<Vec<f32>>> = bgr.to_vec3().unwrap();
        // Red lands in the last stored channel under BGR order.
        let expected_hot = (1.0 - NORM_MEAN[2]) / NORM_STD[2];
        assert!((bgr[2][0][0] - expected_hot).abs() < 1e-5);
        let expected_cold = (0.0 - NORM_MEAN[0]) / NORM_STD[0];
        assert!((bgr[0][0][0] - expected_cold).abs() < 1e-5);
    }

    #[test]
    fn test_preprocessing_is_deterministic() {
        let device = Device::Cpu;
        let image = solid_image(37, 91, 203);
        let a = to_model_tensor(&image, ColorOrder::Bgr, &device).unwrap();
        let b = to_model_tensor(&image, ColorOrder::Bgr, &device).unwrap();
        let a: Vec<Vec<Vec<f32>>> = a.to_vec3().unwrap();
        let b: Vec<Vec<Vec<f32>>> = b.to_vec3().unwrap();
        assert_eq!(a, b);
    }
}
