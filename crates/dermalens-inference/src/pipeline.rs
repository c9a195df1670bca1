//! The application-scoped inference pipeline.
//!
//! [`InferencePipeline`] is constructed once at process start and injected
//! into every inference call — there is no ambient global model state.
//! It owns the fusion network behind a mutex: one request holds the lock
//! from the first augmented forward pass through the saliency backward
//! pass and result composition, so concurrent requests against a single
//! shared network serialize for their full duration.
//!
//! Weight loading happens once in [`InferencePipeline::new`] and is never
//! retried on the hot path. A missing or unreadable weight blob is logged
//! as critical and the pipeline degrades to randomly-initialized weights
//! rather than refusing to start; [`InferencePipeline::weights_loaded`]
//! exposes that state so a deployment can apply a stricter policy at its
//! own startup boundary.

use std::sync::Mutex;

use candle_core::{Device, Tensor};
use dermalens_core::{
    DermalensError, PipelineConfig, PredictionResult, Result, NUM_META_FEATURES,
};

use crate::compose;
use crate::device::select_device;
use crate::gradcam::GradCam;
use crate::metadata;
use crate::network::FusionNetwork;
use crate::preprocess;
use crate::tta;

/// Long-lived pipeline handle shared by all requests.
pub struct InferencePipeline {
    network: Mutex<FusionNetwork>,
    device: Device,
    config: PipelineConfig,
    weights_loaded: bool,
}

impl InferencePipeline {
    /// Construct the pipeline, loading weights from the configured path.
    ///
    /// On weight-load failure the pipeline logs a critical error and
    /// continues with random weights (soft-fail policy).
    ///
    /// # Errors
    ///
    /// Returns an error only if the network itself cannot be constructed.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let device = select_device();

        let (network, weights_loaded) = match FusionNetwork::load(&config.weights_path, &device)
        {
            Ok(network) => {
                tracing::info!(
                    path = %config.weights_path.display(),
                    "Model weights loaded"
                );
                (network, true)
            }
            Err(e) => {
                tracing::error!(
                    path = %config.weights_path.display(),
                    error = %e,
                    "CRITICAL: failed to load model weights; \
                     serving with randomly-initialized weights"
                );
                (FusionNetwork::new_random(&device)?, false)
            }
        };

        Ok(Self {
            network: Mutex::new(network),
            device,
            config,
            weights_loaded,
        })
    }

    /// Returns `true` when the configured weight blob was loaded.
    #[must_use]
    pub fn weights_loaded(&self) -> bool {
        self.weights_loaded
    }

    /// Returns the active pipeline configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the full inference pipeline on one request.
    ///
    /// Decodes and preprocesses the image once, encodes the metadata,
    /// then — holding the network exclusively — runs the four-view
    /// ensemble, computes the Grad-CAM map for the top class, and
    /// composes the result bundle.
    ///
    /// # Errors
    ///
    /// Returns [`DermalensError::Decode`] for unparsable image bytes
    /// (before the network is touched) and
    /// [`DermalensError::Inference`] for runtime failures. No retries.
    pub fn run(
        &self,
        image_bytes: &[u8],
        age: f32,
        sex: &str,
        location: &str,
    ) -> Result<PredictionResult> {
        let original = preprocess::decode_rgb(image_bytes)?;
        let image_tensor =
            preprocess::to_model_tensor(&original, self.config.color_order, &self.device)?;

        let meta_vector = metadata::encode(age, sex, location);
        let meta = Tensor::from_vec(meta_vector.to_vec(), NUM_META_FEATURES, &self.device)
            .map_err(|e| {
                DermalensError::Inference(format!("Failed to build metadata tensor: {e}"))
            })?;

        tracing::debug!(age, sex, location, "Running inference");

        // One request owns the network from the ensemble through the
        // saliency backward pass; the guard is held until the result is
        // composed.
        let network = self
            .network
            .lock()
            .map_err(|_| DermalensError::Inference("Network lock poisoned".to_string()))?;

        let probabilities = tta::ensemble(&network, &image_tensor, &meta)?;
        let top_class = compose::ranked_indices(&probabilities)[0];

        let heatmap = GradCam::new(&network).explain(&image_tensor, &meta, top_class)?;

        let display = preprocess::resize_for_analysis(&original);
        let result = compose::compose(
            &probabilities,
            &heatmap,
            &display,
            self.config.jpeg_quality,
        )?;

        tracing::info!(
            top = %result.top_prediction,
            confidence = result.top_confidence,
            margin = result.margin,
            uncertain = result.is_uncertain,
            "Inference complete"
        );
        Ok(result)
    }
}
