//! Result composition: saliency overlay rendering and the final bundle.
//!
//! Turns the ensembled class probabilities and the Grad-CAM heatmap into
//! the structured [`PredictionResult`] the presentation layer consumes:
//! the heatmap is resized to the analysis resolution, pseudo-colored,
//! alpha-blended over the display image, and JPEG/base64-encoded; the
//! margin between the top two classes drives the uncertainty flag.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use dermalens_core::{
    class_names, DermalensError, PredictionResult, Result, CLASSES, NUM_CLASSES,
    UNCERTAINTY_MARGIN,
};
use image::RgbImage;

use crate::gradcam::Heatmap;

/// Blend weight of the pseudo-colored heatmap in the overlay.
const HEATMAP_WEIGHT: f32 = 0.4;

/// Blend weight of the original image in the overlay.
const IMAGE_WEIGHT: f32 = 0.6;

/// Compose the final prediction result.
///
/// `probabilities` must be the catalog-ordered ensemble output;
/// `display` is the original image resized to the analysis resolution.
/// Classes and probabilities are packed in catalog order — any sorting
/// for display is a presentation concern.
///
/// # Errors
///
/// Returns [`DermalensError::Inference`] when the probability vector does
/// not match the catalog size or the overlay cannot be encoded.
pub fn compose(
    probabilities: &[f32],
    heatmap: &Heatmap,
    display: &RgbImage,
    jpeg_quality: u8,
) -> Result<PredictionResult> {
    if probabilities.len() != NUM_CLASSES {
        return Err(DermalensError::Inference(format!(
            "Expected {NUM_CLASSES} probabilities, got {}",
            probabilities.len()
        )));
    }

    let order = ranked_indices(probabilities);
    let top = order[0];
    let margin = probabilities[order[0]] - probabilities[order[1]];

    let gradcam_base64 = render_overlay(heatmap, display, jpeg_quality)?;

    Ok(PredictionResult {
        top_prediction: CLASSES[top].name.to_string(),
        top_confidence: probabilities[top],
        margin,
        is_uncertain: margin < UNCERTAINTY_MARGIN,
        classes: class_names(),
        probabilities: probabilities.to_vec(),
        gradcam_base64,
    })
}

/// Class indices sorted by descending probability.
///
/// The sort is stable, so equal probabilities keep their catalog order —
/// the first-seen class wins a tie.
pub(crate) fn ranked_indices(probabilities: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..probabilities.len()).collect();
    order.sort_by(|&a, &b| {
        probabilities[b]
            .partial_cmp(&probabilities[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order
}

/// Render the heatmap over the display image and encode it as an
/// inlineable JPEG data URI.
fn render_overlay(heatmap: &Heatmap, display: &RgbImage, jpeg_quality: u8) -> Result<String> {
    let (width, height) = display.dimensions();
    let resized = bilinear_resize(
        &heatmap.data,
        heatmap.width,
        heatmap.height,
        width as usize,
        height as usize,
    );

    let mut blended = RgbImage::new(width, height);
    for (x, y, pixel) in blended.enumerate_pixels_mut() {
        let value = resized[y as usize * width as usize + x as usize];
        let heat = jet_color(value);
        let original = display.get_pixel(x, y).0;
        pixel.0 = [
            blend(heat[0], original[0]),
            blend(heat[1], original[1]),
            blend(heat[2], original[2]),
        ];
    }

    let mut bytes = Vec::new();
    let mut encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut bytes, jpeg_quality);
    encoder
        .encode(blended.as_raw(), width, height, image::ColorType::Rgb8)
        .map_err(|e| DermalensError::Inference(format!("Failed to encode overlay: {e}")))?;

    Ok(format!(
        "data:image/jpeg;base64,{}",
        BASE64_STANDARD.encode(&bytes)
    ))
}

fn blend(heat: u8, original: u8) -> u8 {
    (f32::from(heat) * HEATMAP_WEIGHT + f32::from(original) * IMAGE_WEIGHT) as u8
}

/// Piecewise-linear jet pseudo-color map: dark blue through cyan, yellow,
/// and red as `v` runs from 0 to 1.
fn jet_color(v: f32) -> [u8; 3] {
    let v = v.clamp(0.0, 1.0);
    let channel = |center: f32| ((1.5 - (4.0 * v - center).abs()).clamp(0.0, 1.0) * 255.0) as u8;
    [channel(3.0), channel(2.0), channel(1.0)]
}

/// Bilinear resize of a row-major grid, with half-pixel centers and edge
/// clamping.
pub(crate) fn bilinear_resize(
    src: &[f32],
    src_width: usize,
    src_height: usize,
    dst_width: usize,
    dst_height: usize,
) -> Vec<f32> {
    let mut out = vec![0.0_f32; dst_width * dst_height];
    if src_width == 0 || src_height == 0 {
        return out;
    }

    let scale_x = src_width as f32 / dst_width as f32;
    let scale_y = src_height as f32 / dst_height as f32;

    for y in 0..dst_height {
        let fy = ((y as f32 + 0.5) * scale_y - 0.5).clamp(0.0, (src_height - 1) as f32);
        let y0 = fy.floor() as usize;
        let y1 = (y0 + 1).min(src_height - 1);
        let wy = fy - y0 as f32;

        for x in 0..dst_width {
            let fx = ((x as f32 + 0.5) * scale_x - 0.5).clamp(0.0, (src_width - 1) as f32);
            let x0 = fx.floor() as usize;
            let x1 = (x0 + 1).min(src_width - 1);
            let wx = fx - x0 as f32;

            let top = src[y0 * src_width + x0] * (1.0 - wx) + src[y0 * src_width + x1] * wx;
            let bottom = src[y1 * src_width + x0] * (1.0 - wx) + src[y1 * src_width + x1] * wx;
            out[y * dst_width + x] = top * (1.0 - wy) + bottom * wy;
        }
    }

    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn flat_heatmap(value: f32) -> Heatmap {
        Heatmap {
            data: vec![value; 4],
            width: 2,
            height: 2,
        }
    }

    fn display_image() -> RgbImage {
        RgbImage::from_pixel(8, 8, Rgb([100, 150, 200]))
    }

    // -- Ranking and margin -------------------------------------------------

    #[test]
    fn test_ranked_indices_descending() {
        let order = ranked_indices(&[0.1, 0.5, 0.2, 0.05, 0.05, 0.05, 0.05]);
        assert_eq!(order[0], 1);
        assert_eq!(order[1], 2);
        assert_eq!(order[2], 0);
    }

    #[test]
    fn test_ranked_indices_tie_keeps_catalog_order() {
        let order = ranked_indices(&[0.2, 0.2, 0.2, 0.1, 0.1, 0.1, 0.1]);
        assert_eq!(&order[..3], &[0, 1, 2]);
    }

    #[test]
    fn test_compose_margin_and_top() {
        let probs = [0.05, 0.62, 0.31, 0.01, 0.0, 0.0, 0.01];
        let result = compose(&probs, &flat_heatmap(0.5), &display_image(), 90).unwrap();
        assert_eq!(result.top_prediction, "Melanoma");
        assert!((result.top_confidence - 0.62).abs() < 1e-6);
        assert!((result.margin - 0.31).abs() < 1e-6);
        assert!(!result.is_uncertain);
    }

    #[test]
    fn test_compose_uncertain_below_threshold() {
        let probs = [0.30, 0.28, 0.20, 0.10, 0.06, 0.04, 0.02];
        let result = compose(&probs, &flat_heatmap(0.0), &display_image(), 90).unwrap();
        assert!(result.is_uncertain);
        assert!((result.margin - 0.02).abs() < 1e-6);
    }

    #[test]
    fn test_compose_boundary_margin_is_not_uncertain() {
        // 0.5 - 0.35 lands exactly on the 0.15 threshold in f32; the
        // comparison is strict, so this is NOT uncertain.
        let probs = [0.5, 0.35, 0.15, 0.0, 0.0, 0.0, 0.0];
        let result = compose(&probs, &flat_heatmap(0.5), &display_image(), 90).unwrap();
        assert!(!result.is_uncertain);
    }

    #[test]
    fn test_compose_preserves_catalog_order() {
        let probs = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        let result = compose(&probs, &flat_heatmap(1.0), &display_image(), 90).unwrap();
        assert_eq!(result.top_prediction, "Dermatofibroma");
        assert_eq!(result.classes, class_names());
        assert_eq!(result.probabilities, probs.to_vec());
    }

    #[test]
    fn test_compose_rejects_wrong_length() {
        let result = compose(&[0.5, 0.5], &flat_heatmap(0.0), &display_image(), 90);
        assert!(matches!(result, Err(DermalensError::Inference(_))));
    }

    // -- Overlay ------------------------------------------------------------

    #[test]
    fn test_overlay_is_jpeg_data_uri() {
        let probs = [0.3, 0.2, 0.1, 0.1, 0.1, 0.1, 0.1];
        let result = compose(&probs, &flat_heatmap(0.7), &display_image(), 90).unwrap();
        let uri = &result.gradcam_base64;
        assert!(uri.starts_with("data:image/jpeg;base64,"));

        let payload = uri.strip_prefix("data:image/jpeg;base64,").unwrap();
        let bytes = BASE64_STANDARD.decode(payload).unwrap();
        // JPEG SOI marker.
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_blend_weights() {
        // Pure heat on black: 40% of the heat channel survives.
        assert_eq!(blend(255, 0), 102);
        // Pure image on cold heat: 60% survives.
        assert_eq!(blend(0, 255), 153);
    }

    // -- Jet color map ------------------------------------------------------

    #[test]
    fn test_jet_endpoints() {
        let cold = jet_color(0.0);
        assert_eq!(cold[0], 0);
        assert!(cold[2] > 0, "low values map toward blue");

        let hot = jet_color(1.0);
        assert!(hot[0] > 0, "high values map toward red");
        assert_eq!(hot[2], 0);

        let mid = jet_color(0.5);
        assert_eq!(mid[1], 255, "midpoint is fully green");
    }

    #[test]
    fn test_jet_clamps_out_of_range() {
        assert_eq!(jet_color(-1.0), jet_color(0.0));
        assert_eq!(jet_color(2.0), jet_color(1.0));
    }

    // -- Bilinear resize ----------------------------------------------------

    #[test]
    fn test_resize_identity() {
        let src = vec![1.0, 2.0, 3.0, 4.0];
        let out = bilinear_resize(&src, 2, 2, 2, 2);
        assert_eq!(out, src);
    }

    #[test]
    fn test_resize_constant_stays_constant() {
        let src = vec![0.5; 9];
        let out = bilinear_resize(&src, 3, 3, 12, 12);
        assert_eq!(out.len(), 144);
        for v in &out {
            assert!((v - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn test_resize_upsample_interpolates_between_samples() {
        let src = vec![0.0, 1.0];
        let out = bilinear_resize(&src, 2, 1, 4, 1);
        // Half-pixel centers: [0, 0.25, 0.75, 1] map to src coords
        // [-0.25, 0.25, 0.75, 1.25] clamped to [0, 1].
        assert!((out[0] - 0.0).abs() < 1e-6);
        assert!((out[1] - 0.25).abs() < 1e-6);
        assert!((out[2] - 0.75).abs() < 1e-6);
        assert!((out[3] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_resize_values_bounded_by_source() {
        let src = vec![0.0, 0.3, 0.9, 0.6, 1.0, 0.2, 0.8, 0.1, 0.4];
        let out = bilinear_resize(&src, 3, 3, 30, 30);
        for v in &out {
            assert!((0.0..=1.0).contains(v));
        }
    }
}
