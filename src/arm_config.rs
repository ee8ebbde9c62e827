//! Process-wide configuration, built once at startup and handed to every
//! component that needs it. Model parameters are looked up per
//! (model type, objective lens) pair with a default-entry fallback.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::image_pipeline::inference::{ModelType, ObjectiveLensPower};

/// Per-model parameters: where the model lives, how its input tensor is
/// shaped, and how its heatmap is turned into contours.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub absolute_model_path: Option<PathBuf>,
    pub input_patch_size: usize,
    pub prediction_patch_size: usize,
    pub positive_threshold: u8,
    pub transformation_scaling: usize,
    /// Gaussian kernel size for the smoothed contour path; zero or negative
    /// selects the straight (block-threshold) path.
    pub blur_size: i32,
    pub use_morph_open: bool,
    pub morph_size: i32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            absolute_model_path: None,
            input_patch_size: 128,
            prediction_patch_size: 16,
            positive_threshold: 128,
            transformation_scaling: 4,
            blur_size: 0,
            use_morph_open: false,
            morph_size: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArmConfig {
    /// Number of debayer threads for quick debayer.
    pub num_debayer_threads: usize,
    /// Whether to perform image smoothing after debayer.
    pub smooth_image: bool,
    /// White-balance gains applied per channel during debayer.
    pub rgb_gains: Option<(f64, f64, f64)>,
    /// Minimum per-pixel heatmap change accepted by the contour hysteresis.
    pub relative_threshold: u8,
    /// Show timing stats for every N inferences.
    pub show_stats_every_n: u32,
    /// Expected capture image size for the inference patch.
    pub image_size: usize,
    /// Delay added to the end of producer cycles.
    pub loop_delay: Option<Duration>,
    /// Delay added to the end of preview cycles.
    pub preview_delay: Duration,
    /// Sensor geometry, used when constructing the capture backend.
    pub sensor_width: usize,
    pub sensor_height: usize,
    pub sensor_bytes_per_pixel: usize,
    /// Initial auto-exposure target brightness, as a percentage. Applied at
    /// startup when the captor supports auto exposure.
    pub auto_exposure_brightness: u8,
    default_model: ModelConfig,
    model_overrides: HashMap<(ModelType, ObjectiveLensPower), ModelConfig>,
    objective_positions: HashMap<u8, ObjectiveLensPower>,
}

impl Default for ArmConfig {
    fn default() -> Self {
        Self {
            num_debayer_threads: 8,
            smooth_image: false,
            rgb_gains: None,
            relative_threshold: 96,
            show_stats_every_n: 50,
            image_size: 1800,
            loop_delay: None,
            preview_delay: Duration::from_millis(100),
            sensor_width: 3600,
            sensor_height: 3600,
            sensor_bytes_per_pixel: 1,
            auto_exposure_brightness: 50,
            default_model: ModelConfig::default(),
            model_overrides: HashMap::new(),
            objective_positions: HashMap::new(),
        }
    }
}

impl ArmConfig {
    pub fn builder() -> ArmConfigBuilder {
        ArmConfigBuilder::default()
    }

    /// Returns the model config for the combination, falling back to the
    /// default entry when no explicit override exists.
    pub fn model_config(
        &self,
        model_type: ModelType,
        objective: ObjectiveLensPower,
    ) -> &ModelConfig {
        self.model_overrides
            .get(&(model_type, objective))
            .unwrap_or(&self.default_model)
    }

    pub fn is_model_config_overridden(
        &self,
        model_type: ModelType,
        objective: ObjectiveLensPower,
    ) -> bool {
        self.model_overrides.contains_key(&(model_type, objective))
    }

    /// Maps a turret position reported by the objective serial interface to
    /// the objective lens mounted there.
    pub fn objective_for_position(&self, position: u8) -> ObjectiveLensPower {
        self.objective_positions
            .get(&position)
            .copied()
            .unwrap_or(ObjectiveLensPower::Unspecified)
    }
}

#[derive(Default)]
pub struct ArmConfigBuilder {
    num_debayer_threads: Option<usize>,
    smooth_image: Option<bool>,
    rgb_gains: Option<(f64, f64, f64)>,
    relative_threshold: Option<u8>,
    show_stats_every_n: Option<u32>,
    image_size: Option<usize>,
    loop_delay: Option<Duration>,
    preview_delay: Option<Duration>,
    sensor: Option<(usize, usize, usize)>,
    auto_exposure_brightness: Option<u8>,
    default_model: Option<ModelConfig>,
    model_overrides: HashMap<(ModelType, ObjectiveLensPower), ModelConfig>,
    objective_positions: HashMap<u8, ObjectiveLensPower>,
}

impl ArmConfigBuilder {
    pub fn num_debayer_threads(mut self, threads: usize) -> Self {
        self.num_debayer_threads = Some(threads);
        self
    }

    pub fn smooth_image(mut self, smooth: bool) -> Self {
        self.smooth_image = Some(smooth);
        self
    }

    pub fn rgb_gains(mut self, red: f64, green: f64, blue: f64) -> Self {
        self.rgb_gains = Some((red, green, blue));
        self
    }

    pub fn relative_threshold(mut self, threshold: u8) -> Self {
        self.relative_threshold = Some(threshold);
        self
    }

    pub fn show_stats_every_n(mut self, n: u32) -> Self {
        self.show_stats_every_n = Some(n);
        self
    }

    pub fn image_size(mut self, size: usize) -> Self {
        self.image_size = Some(size);
        self
    }

    pub fn loop_delay(mut self, delay: Duration) -> Self {
        self.loop_delay = Some(delay);
        self
    }

    pub fn preview_delay(mut self, delay: Duration) -> Self {
        self.preview_delay = Some(delay);
        self
    }

    pub fn sensor(mut self, width: usize, height: usize, bytes_per_pixel: usize) -> Self {
        self.sensor = Some((width, height, bytes_per_pixel));
        self
    }

    pub fn auto_exposure_brightness(mut self, brightness: u8) -> Self {
        self.auto_exposure_brightness = Some(brightness);
        self
    }

    pub fn default_model(mut self, config: ModelConfig) -> Self {
        self.default_model = Some(config);
        self
    }

    pub fn model_override(
        mut self,
        model_type: ModelType,
        objective: ObjectiveLensPower,
        config: ModelConfig,
    ) -> Self {
        self.model_overrides.insert((model_type, objective), config);
        self
    }

    pub fn objective_position(mut self, position: u8, objective: ObjectiveLensPower) -> Self {
        self.objective_positions.insert(position, objective);
        self
    }

    pub fn build(self) -> ArmConfig {
        let default = ArmConfig::default();
        let (sensor_width, sensor_height, sensor_bytes_per_pixel) = self.sensor.unwrap_or((
            default.sensor_width,
            default.sensor_height,
            default.sensor_bytes_per_pixel,
        ));
        ArmConfig {
            num_debayer_threads: self
                .num_debayer_threads
                .unwrap_or(default.num_debayer_threads),
            smooth_image: self.smooth_image.unwrap_or(default.smooth_image),
            rgb_gains: self.rgb_gains,
            relative_threshold: self
                .relative_threshold
                .unwrap_or(default.relative_threshold),
            show_stats_every_n: self
                .show_stats_every_n
                .unwrap_or(default.show_stats_every_n),
            image_size: self.image_size.unwrap_or(default.image_size),
            loop_delay: self.loop_delay,
            preview_delay: self.preview_delay.unwrap_or(default.preview_delay),
            sensor_width,
            sensor_height,
            sensor_bytes_per_pixel,
            auto_exposure_brightness: self
                .auto_exposure_brightness
                .unwrap_or(default.auto_exposure_brightness),
            default_model: self.default_model.unwrap_or(default.default_model),
            model_overrides: self.model_overrides,
            objective_positions: self.objective_positions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_config_falls_back_to_default_entry() {
        let config = ArmConfig::builder()
            .default_model(ModelConfig {
                positive_threshold: 77,
                ..ModelConfig::default()
            })
            .model_override(
                ModelType::Lyna,
                ObjectiveLensPower::Objective10x,
                ModelConfig {
                    positive_threshold: 200,
                    ..ModelConfig::default()
                },
            )
            .build();

        let overridden =
            config.model_config(ModelType::Lyna, ObjectiveLensPower::Objective10x);
        assert_eq!(overridden.positive_threshold, 200);
        assert!(config.is_model_config_overridden(
            ModelType::Lyna,
            ObjectiveLensPower::Objective10x
        ));

        let fallback =
            config.model_config(ModelType::Gleason, ObjectiveLensPower::Objective20x);
        assert_eq!(fallback.positive_threshold, 77);
        assert!(!config.is_model_config_overridden(
            ModelType::Gleason,
            ObjectiveLensPower::Objective20x
        ));
    }

    #[test]
    fn objective_position_lookup() {
        let config = ArmConfig::builder()
            .objective_position(2, ObjectiveLensPower::Objective10x)
            .build();
        assert_eq!(
            config.objective_for_position(2),
            ObjectiveLensPower::Objective10x
        );
        assert_eq!(
            config.objective_for_position(5),
            ObjectiveLensPower::Unspecified
        );
    }
}
