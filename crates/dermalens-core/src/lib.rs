//! Core types, configuration, and errors for Dermalens
//!
//! This crate contains the foundational types shared across all Dermalens
//! components: the diagnostic class catalog, the fixed metadata category
//! sets exposed to callers, the structured prediction result consumed by
//! the presentation layer, and the pipeline configuration and error
//! taxonomy.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Pipeline-wide constants
// ---------------------------------------------------------------------------

/// Side length of the square model input, in pixels.
pub const IMG_SIZE: usize = 300;

/// Number of diagnostic classes the network predicts.
pub const NUM_CLASSES: usize = 7;

/// Length of the encoded metadata feature vector
/// (1 age slot + 3 sex slots + 15 localization slots).
pub const NUM_META_FEATURES: usize = 19;

/// Margin threshold below which a prediction is flagged as uncertain.
/// The comparison is strict: a margin of exactly 0.15 is NOT uncertain.
pub const UNCERTAINTY_MARGIN: f32 = 0.15;

// ---------------------------------------------------------------------------
// Class catalog
// ---------------------------------------------------------------------------

/// Clinical risk tier associated with a diagnostic class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RiskTier {
    /// Benign; routine monitoring.
    Low,
    /// Usually benign; occasional follow-up.
    LowModerate,
    /// Pre-cancerous or ambiguous; proactive treatment advised.
    Moderate,
    /// Malignant but rarely metastatic; clinical treatment required.
    ModerateHigh,
    /// Malignant; urgent specialist review.
    High,
}

impl std::fmt::Display for RiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "Low"),
            Self::LowModerate => write!(f, "Low-Moderate"),
            Self::Moderate => write!(f, "Moderate"),
            Self::ModerateHigh => write!(f, "Moderate-High"),
            Self::High => write!(f, "High"),
        }
    }
}

/// One entry of the diagnostic class catalog.
///
/// The position of an entry in [`CLASSES`] is the network's output index for
/// that class and its canonical identity. The order is fixed by the trained
/// weights and must never change independently of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LesionClass {
    /// Short HAM10000 dataset code (e.g. `"mel"`).
    pub code: &'static str,
    /// Human-readable display name.
    pub name: &'static str,
    /// One-line clinical description.
    pub description: &'static str,
    /// Risk tier for presentation.
    pub risk: RiskTier,
}

/// The fixed, ordered diagnostic class catalog.
///
/// Index `i` here corresponds to logit/probability index `i` everywhere in
/// the pipeline.
pub const CLASSES: [LesionClass; NUM_CLASSES] = [
    LesionClass {
        code: "nv",
        name: "Melanocytic nevi",
        description: "Common benign mole. Monitor for ABCDE changes.",
        risk: RiskTier::Low,
    },
    LesionClass {
        code: "mel",
        name: "Melanoma",
        description: "Malignant melanocytic tumour. Urgent specialist review required.",
        risk: RiskTier::High,
    },
    LesionClass {
        code: "bkl",
        name: "Benign keratosis",
        description: "Non-cancerous growth. Usually harmless.",
        risk: RiskTier::Low,
    },
    LesionClass {
        code: "bcc",
        name: "Basal cell carcinoma",
        description: "Most common skin cancer. Requires clinical treatment.",
        risk: RiskTier::ModerateHigh,
    },
    LesionClass {
        code: "akiec",
        name: "Actinic keratoses",
        description: "Pre-cancerous UV-induced lesion. Proactive treatment advised.",
        risk: RiskTier::Moderate,
    },
    LesionClass {
        code: "vasc",
        name: "Vascular lesions",
        description: "Includes haemangiomas and angiomas. Usually benign.",
        risk: RiskTier::LowModerate,
    },
    LesionClass {
        code: "df",
        name: "Dermatofibroma",
        description: "Benign fibrous nodule. Generally harmless.",
        risk: RiskTier::Low,
    },
];

/// Display names of all classes, in canonical index order.
#[must_use]
pub fn class_names() -> Vec<&'static str> {
    CLASSES.iter().map(|c| c.name).collect()
}

/// Look up a class by its HAM10000 code.
#[must_use]
pub fn class_by_code(code: &str) -> Option<&'static LesionClass> {
    CLASSES.iter().find(|c| c.code == code)
}

// ---------------------------------------------------------------------------
// Metadata category sets
// ---------------------------------------------------------------------------

/// Sex categories, in one-hot slot order.
///
/// Only the first two are offered as user choices; `"unknown"` exists in
/// the trained feature layout but is never produced by a valid request.
pub const SEX_CATEGORIES: [&str; 3] = ["female", "male", "unknown"];

/// Body-site categories, in one-hot slot order.
pub const LOCATION_CATEGORIES: [&str; 15] = [
    "abdomen",
    "acral",
    "back",
    "chest",
    "ear",
    "face",
    "foot",
    "genital",
    "hand",
    "lower extremity",
    "neck",
    "scalp",
    "trunk",
    "unknown",
    "upper extremity",
];

/// Sex categories exposed to callers building requests.
#[must_use]
pub fn user_sex_options() -> &'static [&'static str] {
    &SEX_CATEGORIES[..2]
}

// ---------------------------------------------------------------------------
// Prediction result
// ---------------------------------------------------------------------------

/// Structured result of one inference call.
///
/// `classes` and `probabilities` are index-aligned in catalog order; they
/// are never resorted by the core. Sorting for display is a presentation
/// concern.
#[derive(Debug, Clone, Serialize)]
pub struct PredictionResult {
    /// Display name of the highest-probability class.
    pub top_prediction: String,
    /// Probability of the top class, in `[0, 1]`.
    pub top_confidence: f32,
    /// Probability gap between the top two classes, in `[0, 1]`.
    pub margin: f32,
    /// `true` when `margin` is strictly below [`UNCERTAINTY_MARGIN`].
    pub is_uncertain: bool,
    /// All class display names, in catalog order.
    pub classes: Vec<&'static str>,
    /// Per-class probabilities, aligned with `classes`.
    pub probabilities: Vec<f32>,
    /// Saliency overlay as an inlineable `data:image/jpeg;base64,` URI.
    pub gradcam_base64: String,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Channel order of the tensor fed to the network.
///
/// This is a calibration constant: it must match the color space the
/// weights were trained against. The deployed training regime used
/// cv2-style BGR frames, so `Bgr` is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorOrder {
    /// Feed channels as decoded (red, green, blue).
    Rgb,
    /// Swap to blue, green, red before normalization.
    Bgr,
}

fn default_weights_path() -> PathBuf {
    PathBuf::from("weights/dermalens/model.safetensors")
}

fn default_color_order() -> ColorOrder {
    ColorOrder::Bgr
}

fn default_jpeg_quality() -> u8 {
    90
}

/// Configuration for the inference pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Path of the safetensors weight blob read once at startup.
    #[serde(default = "default_weights_path")]
    pub weights_path: PathBuf,
    /// Channel order expected by the loaded weights.
    #[serde(default = "default_color_order")]
    pub color_order: ColorOrder,
    /// JPEG quality for the saliency overlay (1–100).
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            weights_path: default_weights_path(),
            color_order: default_color_order(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// Logging configuration for embedding applications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (`trace`, `debug`, `info`, `warn`, `error`).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (`pretty` or `json`).
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Core error types.
#[derive(thiserror::Error, Debug)]
pub enum DermalensError {
    /// Image bytes did not parse as a supported raster format.
    #[error("Image decode error: {0}")]
    Decode(String),

    /// Model construction or weight loading error.
    #[error("Model error: {0}")]
    Model(String),

    /// Runtime failure during inference.
    #[error("Inference error: {0}")]
    Inference(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization / deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias for `std::result::Result<T, DermalensError>`.
pub type Result<T> = std::result::Result<T, DermalensError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- Catalog -----------------------------------------------------------

    #[test]
    fn test_catalog_size_and_order() {
        assert_eq!(CLASSES.len(), NUM_CLASSES);
        let codes: Vec<&str> = CLASSES.iter().map(|c| c.code).collect();
        assert_eq!(codes, ["nv", "mel", "bkl", "bcc", "akiec", "vasc", "df"]);
    }

    #[test]
    fn test_class_names_aligned_with_catalog() {
        let names = class_names();
        assert_eq!(names.len(), NUM_CLASSES);
        for (i, name) in names.iter().enumerate() {
            assert_eq!(*name, CLASSES[i].name);
        }
    }

    #[test]
    fn test_class_by_code() {
        let mel = class_by_code("mel").unwrap();
        assert_eq!(mel.name, "Melanoma");
        assert_eq!(mel.risk, RiskTier::High);
        assert!(class_by_code("xyz").is_none());
    }

    #[test]
    fn test_risk_tier_display() {
        assert_eq!(RiskTier::ModerateHigh.to_string(), "Moderate-High");
        assert_eq!(RiskTier::Low.to_string(), "Low");
    }

    // -- Category sets -----------------------------------------------------

    #[test]
    fn test_meta_feature_layout_adds_up() {
        assert_eq!(
            NUM_META_FEATURES,
            1 + SEX_CATEGORIES.len() + LOCATION_CATEGORIES.len()
        );
    }

    #[test]
    fn test_user_sex_options_exclude_unknown() {
        assert_eq!(user_sex_options(), ["female", "male"]);
    }

    #[test]
    fn test_location_categories_are_lowercase() {
        for loc in LOCATION_CATEGORIES {
            assert_eq!(loc, loc.to_lowercase());
        }
    }

    // -- Configuration -----------------------------------------------------

    #[test]
    fn test_pipeline_config_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.color_order, ColorOrder::Bgr);
        assert_eq!(config.jpeg_quality, 90);
        assert!(config.weights_path.ends_with("model.safetensors"));
    }

    #[test]
    fn test_pipeline_config_from_partial_json() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"color_order": "rgb"}"#).unwrap();
        assert_eq!(config.color_order, ColorOrder::Rgb);
        assert_eq!(config.jpeg_quality, 90);
    }

    #[test]
    fn test_logging_config_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, "pretty");
    }

    // -- Result serialization ----------------------------------------------

    #[test]
    fn test_prediction_result_json_shape() {
        let result = PredictionResult {
            top_prediction: "Melanoma".to_string(),
            top_confidence: 0.62,
            margin: 0.31,
            is_uncertain: false,
            classes: class_names(),
            probabilities: vec![0.05, 0.62, 0.31, 0.01, 0.0, 0.0, 0.01],
            gradcam_base64: "data:image/jpeg;base64,AAAA".to_string(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["top_prediction"], "Melanoma");
        assert_eq!(json["is_uncertain"], false);
        assert_eq!(json["classes"].as_array().unwrap().len(), NUM_CLASSES);
        assert_eq!(
            json["probabilities"].as_array().unwrap().len(),
            NUM_CLASSES
        );
        assert!(json["gradcam_base64"]
            .as_str()
            .unwrap()
            .starts_with("data:image/jpeg;base64,"));
    }

    #[test]
    fn test_uncertainty_threshold_value() {
        assert!((UNCERTAINTY_MARGIN - 0.15).abs() < f32::EPSILON);
    }
}
