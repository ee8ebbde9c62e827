//! Microdisplay server module
//!
//! Display-side types: the published heatmap with its stage timestamps,
//! per-stage timing statistics, and the temporally stabilized contour
//! extraction that turns heatmaps into overlay polygons.

pub mod contour;
pub mod heatmap;

pub use contour::{ContourSet, HeatmapContourConfig, HeatmapContourExtractor};
pub use heatmap::{CHECKPOINT_COUNT, Heatmap, InferenceCheckpoint, InferenceTimings};

use crate::arm_config::ArmConfig;
use crate::image_pipeline::inference::{ModelType, ObjectiveLensPower};

/// Display collaborator fed by the pipeline driver. A plain data sink; no
/// acknowledgment is expected.
pub trait Microdisplay: Send {
    fn show_heatmap(&mut self, heatmap: &Heatmap);

    /// Called when the active (model type, objective) combination changes.
    fn update_config_for_model(
        &mut self,
        _config: &ArmConfig,
        _model_type: ModelType,
        _objective: ObjectiveLensPower,
    ) {
    }
}

/// Microdisplay that runs contour extraction on every published heatmap and
/// logs the result. Used for bring-up and when no eyepiece display is
/// attached.
pub struct ContourLoggingDisplay {
    extractor: HeatmapContourExtractor,
    target_width: usize,
    target_height: usize,
}

impl ContourLoggingDisplay {
    pub fn new(config: &ArmConfig, target_width: usize, target_height: usize) -> Self {
        Self {
            extractor: HeatmapContourExtractor::new(config.relative_threshold),
            target_width,
            target_height,
        }
    }
}

impl Microdisplay for ContourLoggingDisplay {
    fn show_heatmap(&mut self, heatmap: &Heatmap) {
        if heatmap.width == 0 || heatmap.height == 0 {
            return;
        }
        let contours = self.extractor.create_contours(
            &heatmap.image_binary,
            heatmap.width,
            heatmap.height,
            self.target_width,
            self.target_height,
        );
        tracing::debug!(
            "Heatmap {}x{}: {} contour(s)",
            heatmap.width,
            heatmap.height,
            contours.polygons.len()
        );
    }

    fn update_config_for_model(
        &mut self,
        config: &ArmConfig,
        model_type: ModelType,
        objective: ObjectiveLensPower,
    ) {
        self.extractor
            .update_config_for_model(config, model_type, objective);
    }
}
