//! Temporally stabilized contour extraction from raw confidence heatmaps.
//!
//! Frame-to-frame inference noise makes naively traced contours flicker.
//! The extractor keeps a persistent per-pixel buffer and only accepts a new
//! value when it differs from the persisted one by at least the relative
//! threshold; small fluctuations never reach the tracer. A circular
//! field-of-view mask excludes pixels the eyepiece cannot show.

use image::GrayImage;
use imageproc::contours::{BorderType, Contour, find_contours};
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::open;
use imageproc::point::Point;

use crate::arm_config::{ArmConfig, ModelConfig};
use crate::image_pipeline::inference::{ModelType, ObjectiveLensPower};

/// Contour-shaping parameters, swapped wholesale on model switch.
#[derive(Debug, Clone)]
pub struct HeatmapContourConfig {
    pub positive_threshold: u8,
    pub transformation_scaling: usize,
    pub blur_size: i32,
    pub use_morph_open: bool,
    pub morph_size: i32,
}

impl Default for HeatmapContourConfig {
    fn default() -> Self {
        Self::from(&ModelConfig::default())
    }
}

impl From<&ModelConfig> for HeatmapContourConfig {
    fn from(model_config: &ModelConfig) -> Self {
        Self {
            positive_threshold: model_config.positive_threshold,
            transformation_scaling: model_config.transformation_scaling,
            blur_size: model_config.blur_size,
            use_morph_open: model_config.use_morph_open,
            morph_size: model_config.morph_size,
        }
    }
}

/// Closed polygons for one frame, with a nesting flag per polygon.
/// `is_inner[i]` is true when polygon `i` is the boundary of a hole inside
/// another contour; the UI renders those with a thinner line.
#[derive(Debug, Clone, Default)]
pub struct ContourSet {
    pub polygons: Vec<Vec<Point<i32>>>,
    pub is_inner: Vec<bool>,
}

pub struct HeatmapContourExtractor {
    config: HeatmapContourConfig,
    relative_threshold: u8,
    /// Last-accepted intensity per pixel; survives across frames.
    pixels: Vec<u8>,
    /// 0xff inside the circular field of view, 0 outside.
    mask: Vec<u8>,
    width: usize,
    height: usize,
}

impl HeatmapContourExtractor {
    pub fn new(relative_threshold: u8) -> Self {
        Self {
            config: HeatmapContourConfig::default(),
            relative_threshold,
            pixels: Vec::new(),
            mask: Vec::new(),
            width: 0,
            height: 0,
        }
    }

    pub fn config(&self) -> &HeatmapContourConfig {
        &self.config
    }

    pub fn positive_threshold(&self) -> u8 {
        self.config.positive_threshold
    }

    /// Replaces the whole configuration; never mutates it field by field.
    pub fn set_config(&mut self, config: HeatmapContourConfig) {
        self.config = config;
    }

    pub fn update_config_for_model(
        &mut self,
        config: &ArmConfig,
        model_type: ModelType,
        objective: ObjectiveLensPower,
    ) {
        self.set_config(HeatmapContourConfig::from(
            config.model_config(model_type, objective),
        ));
    }

    /// Updates the persisted buffer from `heatmap` and traces the positive
    /// region boundary, scaled to the target resolution.
    pub fn create_contours(
        &mut self,
        heatmap: &[u8],
        width: usize,
        height: usize,
        target_width: usize,
        target_height: usize,
    ) -> ContourSet {
        self.maybe_prepare_mask(width, height);

        let heatmap_size = width * height;
        if self.pixels.len() != heatmap_size {
            self.pixels = vec![0u8; heatmap_size];
        }

        // Hysteresis: accept the new value only when it moved far enough
        // from the persisted one, in either direction.
        let relative_threshold = i32::from(self.relative_threshold);
        for (persisted, &new_value) in self.pixels.iter_mut().zip(heatmap) {
            let diff = i32::from(new_value) - i32::from(*persisted);
            if diff.abs() >= relative_threshold {
                *persisted = new_value;
            }
        }

        let contours = if self.config.blur_size > 0 {
            self.smoothed_contours(target_width, target_height)
        } else {
            self.straight_contours(target_width, target_height)
        };

        let mut polygons = Vec::with_capacity(contours.len());
        let mut is_inner = Vec::with_capacity(contours.len());
        for contour in contours {
            is_inner.push(contour.border_type == BorderType::Hole);
            polygons.push(contour.points);
        }
        assert_eq!(
            polygons.len(),
            is_inner.len(),
            "contour count does not match nesting flag count"
        );
        ContourSet { polygons, is_inner }
    }

    /// Rebuilds the field-of-view mask when the heatmap dimensions change.
    /// Pixels farther from the image center than half the larger dimension
    /// are invalid.
    fn maybe_prepare_mask(&mut self, width: usize, height: usize) {
        if !self.mask.is_empty() && width == self.width && height == self.height {
            return;
        }
        let radius = width.max(height) as f64 / 2.0;
        let radius_square = radius * radius;
        let center_x = width as f64 / 2.0 - 0.5;
        let center_y = height as f64 / 2.0 - 0.5;

        self.mask.clear();
        self.mask.reserve(width * height);
        for y in 0..height {
            for x in 0..width {
                let dx = x as f64 - center_x;
                let dy = y as f64 - center_y;
                let valid = dx * dx + dy * dy <= radius_square;
                self.mask.push(if valid { 0xff } else { 0 });
            }
        }
        self.width = width;
        self.height = height;
    }

    /// Straight path: threshold the persisted buffer, expand each positive
    /// pixel into its integer-factor block at target resolution, and trace.
    fn straight_contours(&self, target_width: usize, target_height: usize) -> Vec<Contour<i32>> {
        let scale_factor_x = target_width / self.width;
        let scale_factor_y = target_height / self.height;
        let threshold = self.config.positive_threshold;

        let mut binary = vec![0u8; target_width * target_height];
        for (i, &value) in self.pixels.iter().enumerate() {
            if value >= threshold && self.mask[i] != 0 {
                let x = i % self.width;
                let y = i / self.width;
                fill_block(
                    &mut binary,
                    target_width,
                    x * scale_factor_x,
                    y * scale_factor_y,
                    scale_factor_x,
                    scale_factor_y,
                    0xff,
                );
            }
        }

        let binary = GrayImage::from_raw(target_width as u32, target_height as u32, binary)
            .expect("binary buffer sized to target dimensions");
        find_contours::<i32>(&binary)
    }

    /// Smoothed path: block-expand the masked persisted values, Gaussian
    /// blur, optionally open to remove speckle, threshold, trace, then map
    /// the polygon coordinates to target resolution.
    fn smoothed_contours(&self, target_width: usize, target_height: usize) -> Vec<Contour<i32>> {
        let scaling = self.config.transformation_scaling.max(1);
        let scaled_width = self.width * scaling;
        let scaled_height = self.height * scaling;

        let mut scaled = vec![0u8; scaled_width * scaled_height];
        for (i, &value) in self.pixels.iter().enumerate() {
            let masked = value & self.mask[i];
            if masked != 0 {
                let x = i % self.width;
                let y = i / self.width;
                fill_block(
                    &mut scaled,
                    scaled_width,
                    x * scaling,
                    y * scaling,
                    scaling,
                    scaling,
                    masked,
                );
            }
        }
        let scaled = GrayImage::from_raw(scaled_width as u32, scaled_height as u32, scaled)
            .expect("scaled buffer sized to scaled dimensions");

        // Kernel size must be odd for the Gaussian; sigma matches the
        // conventional derivation from the kernel size.
        let blur_size = self.config.blur_size | 1;
        let sigma = 0.3 * ((blur_size as f32 - 1.0) * 0.5 - 1.0) + 0.8;
        let mut smoothed = gaussian_blur_f32(&scaled, sigma);

        let threshold = self.config.positive_threshold;
        for value in smoothed.iter_mut() {
            *value = if *value < threshold { 0 } else { 0xff };
        }

        if self.config.use_morph_open {
            let morph_size = self.config.morph_size | 1;
            smoothed = open(&smoothed, Norm::LInf, ((morph_size - 1) / 2) as u8);
        }

        let mut contours = find_contours::<i32>(&smoothed);

        let scale_x = target_width as f64 / scaled_width as f64;
        let scale_y = target_height as f64 / scaled_height as f64;
        for contour in &mut contours {
            for point in &mut contour.points {
                point.x = (f64::from(point.x) * scale_x) as i32;
                point.y = (f64::from(point.y) * scale_y) as i32;
            }
        }
        contours
    }
}

fn fill_block(
    buffer: &mut [u8],
    row_width: usize,
    x: usize,
    y: usize,
    block_width: usize,
    block_height: usize,
    value: u8,
) {
    for row in y..y + block_height {
        let start = row * row_width + x;
        buffer[start..start + block_width].fill(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RELATIVE_THRESHOLD: u8 = 96;

    fn extractor() -> HeatmapContourExtractor {
        HeatmapContourExtractor::new(RELATIVE_THRESHOLD)
    }

    /// 4x4 heatmap with the center 2x2 block set to `value`.
    fn center_block_heatmap(value: u8) -> Vec<u8> {
        let mut heatmap = vec![0u8; 16];
        for (x, y) in [(1, 1), (2, 1), (1, 2), (2, 2)] {
            heatmap[y * 4 + x] = value;
        }
        heatmap
    }

    fn normalized(set: &ContourSet) -> Vec<(Vec<(i32, i32)>, bool)> {
        set.polygons
            .iter()
            .zip(&set.is_inner)
            .map(|(polygon, &inner)| {
                (polygon.iter().map(|p| (p.x, p.y)).collect(), inner)
            })
            .collect()
    }

    #[test]
    fn same_heatmap_twice_gives_identical_contours() {
        let mut extractor = extractor();
        let heatmap = center_block_heatmap(255);
        let first = extractor.create_contours(&heatmap, 4, 4, 16, 16);
        let second = extractor.create_contours(&heatmap, 4, 4, 16, 16);
        assert!(!first.polygons.is_empty());
        assert_eq!(normalized(&first), normalized(&second));
    }

    #[test]
    fn small_change_is_suppressed_large_change_accepted() {
        let mut extractor = extractor();
        let below = center_block_heatmap(RELATIVE_THRESHOLD - 1);
        let contours = extractor.create_contours(&below, 4, 4, 16, 16);
        // 95 is under the hysteresis threshold against the zeroed buffer.
        assert!(contours.polygons.is_empty());

        let accepted = extractor.create_contours(&center_block_heatmap(200), 4, 4, 16, 16);
        assert!(!accepted.polygons.is_empty());

        // A later drop of less than the threshold keeps the accepted value.
        let wobble = extractor.create_contours(&center_block_heatmap(150), 4, 4, 16, 16);
        assert_eq!(normalized(&accepted), normalized(&wobble));
    }

    #[test]
    fn nested_square_yields_outer_and_inner_contours() {
        let mut extractor = extractor();
        // 12x12 heatmap: filled 6x6 square with an unfilled 2x2 hole.
        let mut heatmap = vec![0u8; 12 * 12];
        for y in 3..9 {
            for x in 3..9 {
                heatmap[y * 12 + x] = 255;
            }
        }
        for y in 5..7 {
            for x in 5..7 {
                heatmap[y * 12 + x] = 0;
            }
        }
        let contours = extractor.create_contours(&heatmap, 12, 12, 24, 24);
        assert_eq!(contours.polygons.len(), 2);
        assert_eq!(contours.is_inner.iter().filter(|&&inner| inner).count(), 1);
        assert_eq!(contours.is_inner.iter().filter(|&&inner| !inner).count(), 1);
    }

    #[test]
    fn pixels_outside_field_of_view_are_excluded() {
        let mut extractor = extractor();
        // Only the top-left corner pixel is hot; it lies outside the
        // circular field of view of an 8x8 heatmap.
        let mut heatmap = vec![0u8; 64];
        heatmap[0] = 255;
        let contours = extractor.create_contours(&heatmap, 8, 8, 8, 8);
        assert!(contours.polygons.is_empty());
    }

    #[test]
    fn smoothed_mode_maps_points_to_target_resolution() {
        let mut extractor = extractor();
        extractor.set_config(HeatmapContourConfig {
            blur_size: 3,
            transformation_scaling: 4,
            ..HeatmapContourConfig::default()
        });
        let contours = extractor.create_contours(&center_block_heatmap(255), 4, 4, 32, 32);
        assert!(!contours.polygons.is_empty());
        assert_eq!(contours.polygons.len(), contours.is_inner.len());
        for polygon in &contours.polygons {
            for point in polygon {
                assert!((0..32).contains(&point.x));
                assert!((0..32).contains(&point.y));
            }
        }
    }

    #[test]
    fn dimension_change_resets_persisted_state() {
        let mut extractor = extractor();
        let contours = extractor.create_contours(&center_block_heatmap(255), 4, 4, 16, 16);
        assert!(!contours.polygons.is_empty());

        // Same call against an 8x8 frame: buffers are rebuilt zero-filled,
        // so a value under the hysteresis threshold stays invisible.
        let mut faint = vec![0u8; 64];
        faint[3 * 8 + 3] = RELATIVE_THRESHOLD - 1;
        let contours = extractor.create_contours(&faint, 8, 8, 16, 16);
        assert!(contours.polygons.is_empty());
    }

    #[test]
    fn config_swap_changes_threshold_wholesale() {
        let mut extractor = extractor();
        let heatmap = center_block_heatmap(150);
        let visible = extractor.create_contours(&heatmap, 4, 4, 16, 16);
        assert!(!visible.polygons.is_empty());

        extractor.set_config(HeatmapContourConfig {
            positive_threshold: 200,
            ..HeatmapContourConfig::default()
        });
        let hidden = extractor.create_contours(&heatmap, 4, 4, 16, 16);
        assert!(hidden.polygons.is_empty());
    }
}
