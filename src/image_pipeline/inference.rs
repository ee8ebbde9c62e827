//! Inference stage: model vocabulary, the pluggable execution engine, and
//! the producer protocol around the triple buffer.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::arm_config::ArmConfig;
use crate::image_pipeline::debayer::ImageViewMut;
use crate::image_pipeline::error::{PipelineError, Result};
use crate::image_pipeline::triple_buffer::{
    HeatmapImage, InferenceBuffers, OutputTensor, TripleBuffer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectiveLensPower {
    Unspecified,
    Objective2x,
    Objective4x,
    Objective10x,
    Objective20x,
    Objective40x,
}

impl std::fmt::Display for ObjectiveLensPower {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Unspecified => "UNSPECIFIED_OBJECTIVE_LENS_POWER",
            Self::Objective2x => "2x",
            Self::Objective4x => "4x",
            Self::Objective10x => "10x",
            Self::Objective20x => "20x",
            Self::Objective40x => "40x",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelType {
    Unspecified,
    Lyna,
    Gleason,
    Mitotic,
    Cervical,
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Unspecified => "UNSPECIFIED_MODEL_TYPE",
            Self::Lyna => "lymph",
            Self::Gleason => "prostate",
            Self::Mitotic => "mitotic",
            Self::Cervical => "cervical",
        };
        f.write_str(label)
    }
}

/// Model version labels, for logging.
pub fn model_version(model_type: ModelType, objective: ObjectiveLensPower) -> &'static str {
    use ModelType::*;
    use ObjectiveLensPower::*;
    match (model_type, objective) {
        (Lyna, Objective2x) | (Lyna, Objective4x) => "lyna-sensitivity-20220629",
        (Lyna, Objective10x) => "lyna-sensitivity-20201012",
        (Lyna, Objective20x) | (Lyna, Objective40x) => "lyna-sensitivity-20201008",
        (Gleason, Objective2x) => "gleason-sensitivity-20220708",
        (Gleason, Objective4x) => "gleason-sensitivity-20220718",
        (Gleason, Objective10x) => "gleason-sensitivity-20201012",
        (Gleason, Objective20x) => "gleason-sensitivity-20201013",
        (Mitotic, Objective40x) => "20210622_combined_mc_arm",
        (Cervical, Objective2x) | (Cervical, Objective4x) => "20220708_cd_arm",
        (Cervical, Objective10x) | (Cervical, Objective20x) | (Cervical, Objective40x) => {
            "20211206_arm"
        }
        _ => "unknown-model",
    }
}

/// Output tensor classes contributing to the positive heatmap, per model.
pub fn default_positive_classes(model_type: ModelType) -> Vec<usize> {
    match model_type {
        // Tumor class of the Lyna model.
        ModelType::Lyna => vec![1],
        // Gleason patterns 3, 4 and 5.
        ModelType::Gleason => vec![1, 2, 3],
        ModelType::Mitotic => vec![1],
        // CIN 2+.
        ModelType::Cervical => vec![2],
        ModelType::Unspecified => vec![],
    }
}

/// Model execution backend. Real deployments bind a saved-model runtime;
/// tests and bring-up use [`ConstantEngine`].
pub trait InferenceEngine: Send {
    fn load_model(&mut self, model_path: &Path) -> Result<()>;

    /// Runs the model on a `patch_size` x `patch_size` x 3 input tensor and
    /// returns the full class-probability volume.
    fn run(&mut self, input_tensor: &[u8], patch_size: usize) -> Result<OutputTensor>;
}

/// Engine producing a fixed-size tensor with one constant positive class.
pub struct ConstantEngine {
    output_height: usize,
    output_width: usize,
    classes: usize,
    positive_class: usize,
    positive_value: u8,
    loaded_model: Option<PathBuf>,
}

impl ConstantEngine {
    pub fn new(output_height: usize, output_width: usize, classes: usize) -> Self {
        Self {
            output_height,
            output_width,
            classes,
            positive_class: 1,
            positive_value: 0xff,
            loaded_model: None,
        }
    }

    pub fn positive_value(mut self, value: u8) -> Self {
        self.positive_value = value;
        self
    }

    pub fn positive_class(mut self, class: usize) -> Self {
        self.positive_class = class;
        self
    }
}

impl InferenceEngine for ConstantEngine {
    fn load_model(&mut self, model_path: &Path) -> Result<()> {
        self.loaded_model = Some(model_path.to_path_buf());
        Ok(())
    }

    fn run(&mut self, _input_tensor: &[u8], _patch_size: usize) -> Result<OutputTensor> {
        if self.loaded_model.is_none() {
            return Err(PipelineError::Inference("no model loaded".into()));
        }
        let mut tensor = OutputTensor::new(self.output_height, self.output_width, self.classes);
        for y in 0..self.output_height {
            for x in 0..self.output_width {
                tensor.set_value(y, x, self.positive_class, self.positive_value);
            }
        }
        Ok(tensor)
    }
}

/// Handle to the `current` buffer set for one capture, with the capture
/// region already placed.
pub struct CaptureTarget {
    slot: Arc<Mutex<InferenceBuffers>>,
}

impl CaptureTarget {
    /// Runs `f` with a mutable view of the capture region. By the rotation
    /// invariant the producer is the only holder of this slot.
    pub fn with_input_view<R>(&self, f: impl FnOnce(&mut ImageViewMut<'_>) -> R) -> R {
        let mut buffers = self.slot.lock().expect("current slot lock poisoned");
        let mut view = buffers
            .input_view()
            .expect("capture ROI placed by prepare_capture");
        f(&mut view)
    }
}

/// Drives the producer side of the triple buffer: places the capture
/// region, runs the engine, derives the heatmap, and publishes.
pub struct InferenceStage {
    config: Arc<ArmConfig>,
    engine: Box<dyn InferenceEngine>,
    buffers: TripleBuffer,
    model_type: ModelType,
    objective: ObjectiveLensPower,
    positive_classes: Vec<usize>,
    model_loaded: bool,
    tensors_stale: bool,
}

impl InferenceStage {
    pub fn new(
        config: Arc<ArmConfig>,
        engine: Box<dyn InferenceEngine>,
        model_type: ModelType,
        objective: ObjectiveLensPower,
    ) -> Self {
        let patch_size = patch_size_for(&config, model_type, objective);
        Self {
            positive_classes: default_positive_classes(model_type),
            config,
            engine,
            buffers: TripleBuffer::new(patch_size),
            model_type,
            objective,
            model_loaded: false,
            tensors_stale: false,
        }
    }

    /// Loads the model for the construction-time combination.
    pub fn initialize(&mut self) -> Result<()> {
        self.load_model(self.model_type, self.objective)
    }

    /// Switches to the model for the given combination. On failure the
    /// previous model stays active only in the sense that no new model is
    /// configured; callers decide how to surface the warning.
    pub fn load_model(
        &mut self,
        model_type: ModelType,
        objective: ObjectiveLensPower,
    ) -> Result<()> {
        if !self.config.is_model_config_overridden(model_type, objective) {
            self.model_loaded = false;
            return Err(PipelineError::ModelUnavailable {
                model_type,
                objective,
            });
        }
        let model_config = self.config.model_config(model_type, objective);
        let Some(path) = model_config.absolute_model_path.clone() else {
            self.model_loaded = false;
            return Err(PipelineError::ModelUnavailable {
                model_type,
                objective,
            });
        };
        self.engine.load_model(&path)?;
        self.model_type = model_type;
        self.objective = objective;
        self.positive_classes = default_positive_classes(model_type);
        self.model_loaded = true;
        self.tensors_stale = true;
        info!(
            "Loaded model {} for {}, {}",
            model_version(model_type, objective),
            model_type,
            objective
        );
        Ok(())
    }

    pub fn set_positive_classes(&mut self, classes: Vec<usize>) {
        self.positive_classes = classes;
        info!("Updated positive output classes.");
    }

    pub fn model_type(&self) -> ModelType {
        self.model_type
    }

    pub fn objective(&self) -> ObjectiveLensPower {
        self.objective
    }

    /// Shared handle for consumers (the previewer swaps previous/preview
    /// through it).
    pub fn buffers(&self) -> TripleBuffer {
        self.buffers.clone()
    }

    pub fn patch_size(&self) -> usize {
        self.buffers.patch_size()
    }

    /// Starts a producer cycle: reallocates the tensors if the model switch
    /// changed the patch size, then centers the capture region in the
    /// `current` buffer.
    pub fn prepare_capture(&mut self, width: usize, height: usize) -> Result<CaptureTarget> {
        self.maybe_create_input_tensors();
        let slot = self.buffers.current();
        slot.lock()
            .expect("current slot lock poisoned")
            .set_capture_roi(width, height)?;
        Ok(CaptureTarget { slot })
    }

    /// Finishes a producer cycle: runs inference on the `current` input
    /// tensor, stores heatmap and output tensor, and publishes the buffer.
    /// With no model configured a trivial 1x1 zero heatmap is published so
    /// the consumer cadence is unaffected.
    pub fn process_image(&mut self) -> Result<HeatmapImage> {
        if !self.model_loaded {
            return Ok(self.process_image_without_inference());
        }

        let slot = self.buffers.current();
        let heatmap = {
            let mut buffers = slot.lock().expect("current slot lock poisoned");
            let patch_size = buffers.patch_size();
            let output = self.engine.run(&buffers.input_tensor, patch_size)?;

            let mut heatmap = HeatmapImage::new(output.width, output.height);
            for y in 0..output.height {
                for x in 0..output.width {
                    // Classes the model does not provide contribute nothing.
                    let total: u32 = self
                        .positive_classes
                        .iter()
                        .filter(|&&class| class < output.classes)
                        .map(|&class| u32::from(output.value(y, x, class)))
                        .sum();
                    heatmap.data[y * output.width + x] = total.min(0xff) as u8;
                }
            }
            buffers.heatmap = Some(heatmap.clone());
            buffers.output_tensor = Some(output);
            heatmap
        };

        self.buffers.publish();
        Ok(heatmap)
    }

    fn process_image_without_inference(&mut self) -> HeatmapImage {
        let trivial = HeatmapImage::trivial();
        {
            let slot = self.buffers.current();
            let mut buffers = slot.lock().expect("current slot lock poisoned");
            buffers.heatmap = Some(trivial.clone());
            buffers.output_tensor = Some(OutputTensor::new(1, 1, 1));
        }
        self.buffers.publish();
        trivial
    }

    fn maybe_create_input_tensors(&mut self) {
        if !self.tensors_stale {
            return;
        }
        self.tensors_stale = false;
        let new_patch_size = patch_size_for(&self.config, self.model_type, self.objective);
        if new_patch_size != self.buffers.patch_size() {
            info!(
                "Recreating inference tensors for patch size {}",
                new_patch_size
            );
            self.buffers.resize(new_patch_size);
        }
    }
}

/// The padded tensor fits the capture frame plus the model's receptive
/// field margin, rounded so the prediction grid tiles evenly.
fn patch_size_for(
    config: &ArmConfig,
    model_type: ModelType,
    objective: ObjectiveLensPower,
) -> usize {
    let model_config = config.model_config(model_type, objective);
    model_config.input_patch_size - model_config.prediction_patch_size + config.image_size
        - config.image_size % model_config.prediction_patch_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm_config::ModelConfig;

    fn test_config() -> Arc<ArmConfig> {
        Arc::new(
            ArmConfig::builder()
                .image_size(64)
                .model_override(
                    ModelType::Lyna,
                    ObjectiveLensPower::Objective10x,
                    ModelConfig {
                        absolute_model_path: Some("/models/lyna_10x".into()),
                        input_patch_size: 32,
                        prediction_patch_size: 8,
                        ..ModelConfig::default()
                    },
                )
                .model_override(
                    ModelType::Gleason,
                    ObjectiveLensPower::Objective20x,
                    ModelConfig {
                        absolute_model_path: Some("/models/gleason_20x".into()),
                        input_patch_size: 48,
                        prediction_patch_size: 8,
                        ..ModelConfig::default()
                    },
                )
                .build(),
        )
    }

    fn test_stage() -> InferenceStage {
        let engine = ConstantEngine::new(4, 4, 2).positive_value(200);
        InferenceStage::new(
            test_config(),
            Box::new(engine),
            ModelType::Lyna,
            ObjectiveLensPower::Objective10x,
        )
    }

    #[test]
    fn heatmap_sums_positive_classes() {
        let mut stage = test_stage();
        stage.initialize().unwrap();
        stage.prepare_capture(16, 16).unwrap();
        let heatmap = stage.process_image().unwrap();
        assert_eq!((heatmap.width, heatmap.height), (4, 4));
        assert!(heatmap.data.iter().all(|&v| v == 200));
    }

    #[test]
    fn missing_model_publishes_trivial_heatmap() {
        let mut stage = test_stage();
        // Not initialized: no model loaded.
        stage.prepare_capture(16, 16).unwrap();
        let heatmap = stage.process_image().unwrap();
        assert_eq!((heatmap.width, heatmap.height), (1, 1));
        assert_eq!(heatmap.data, vec![0]);
        // The swap still happened: the consumer sees the trivial buffer.
        let preview = stage.buffers().acquire_preview();
        let preview = preview.lock().unwrap();
        assert_eq!(preview.heatmap.as_ref().unwrap().data, vec![0]);
    }

    #[test]
    fn load_model_for_unconfigured_combination_fails() {
        let mut stage = test_stage();
        stage.initialize().unwrap();
        let err = stage
            .load_model(ModelType::Mitotic, ObjectiveLensPower::Objective40x)
            .unwrap_err();
        assert!(matches!(err, PipelineError::ModelUnavailable { .. }));
    }

    #[test]
    fn model_switch_recreates_tensors_with_new_patch_size() {
        let mut stage = test_stage();
        stage.initialize().unwrap();
        // 32 - 8 + 64 - 64 % 8 = 88.
        stage.prepare_capture(16, 16).unwrap();
        assert_eq!(stage.patch_size(), 88);

        stage
            .load_model(ModelType::Gleason, ObjectiveLensPower::Objective20x)
            .unwrap();
        // 48 - 8 + 64 - 64 % 8 = 104; reallocated on the next cycle.
        stage.prepare_capture(16, 16).unwrap();
        assert_eq!(stage.patch_size(), 104);
    }

    #[test]
    fn failed_cycle_does_not_publish() {
        struct FailingEngine;
        impl InferenceEngine for FailingEngine {
            fn load_model(&mut self, _: &Path) -> Result<()> {
                Ok(())
            }
            fn run(&mut self, _: &[u8], _: usize) -> Result<OutputTensor> {
                Err(PipelineError::Inference("backend busy".into()))
            }
        }

        let mut stage = InferenceStage::new(
            test_config(),
            Box::new(FailingEngine),
            ModelType::Lyna,
            ObjectiveLensPower::Objective10x,
        );
        stage.initialize().unwrap();
        stage.prepare_capture(16, 16).unwrap();
        assert!(stage.process_image().is_err());

        // No publish happened; the preview slot still has no heatmap.
        let preview = stage.buffers().acquire_preview();
        assert!(preview.lock().unwrap().heatmap.is_none());
    }
}
