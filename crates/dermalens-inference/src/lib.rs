//! Dermoscopic lesion classification pipeline for Dermalens
//!
//! Given a skin lesion photo and patient metadata (age, sex, body
//! location), this crate produces a probability distribution over the
//! seven HAM10000 diagnostic classes, a Grad-CAM saliency overlay, and a
//! margin-based uncertainty flag.
//!
//! # Data flow
//!
//! ```text
//! image bytes ── preprocess ──┐
//!                             ├─ TTA ensemble ──► probabilities ──┐
//! age/sex/site ── metadata ───┘        │                          │
//!                                      └─ Grad-CAM (top class) ───┴─►
//!                                                      result composer
//! ```
//!
//! The presentation layer constructs one [`InferencePipeline`] at startup
//! and calls [`InferencePipeline::run`] per request.

pub mod compose;
pub mod convnext;
pub mod device;
pub mod efficientnet;
pub mod fusion;
pub mod gradcam;
pub mod metadata;
pub mod network;
pub mod pipeline;
pub mod preprocess;
pub mod transformer;
pub mod tta;

pub use gradcam::{GradCam, Heatmap};
pub use network::FusionNetwork;
pub use pipeline::InferencePipeline;
