//! Preview consumer. Runs on its own thread, periodically rotates the
//! freshest published buffer set out of the triple buffer, and turns it
//! into a display-ready frame with contours. Also serves snapshots of the
//! latest frame to disk.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use image::{GrayImage, RgbImage};
use tracing::info;

use crate::arm_config::ArmConfig;
use crate::image_pipeline::error::{PipelineError, Result};
use crate::image_pipeline::inference::{ModelType, ObjectiveLensPower, model_version};
use crate::image_pipeline::triple_buffer::{HeatmapImage, OutputTensor, TripleBuffer};
use crate::microdisplay::{ContourSet, HeatmapContourExtractor};

/// Granularity of the exit poll inside the inter-frame sleep.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One assembled preview: the captured image, its heatmap and output
/// tensor, and the contours traced at image resolution.
pub struct PreviewFrame {
    pub image: crate::image_pipeline::debayer::ColorImage,
    pub heatmap: HeatmapImage,
    pub output_tensor: OutputTensor,
    pub contours: ContourSet,
}

pub struct Previewer {
    config: Arc<ArmConfig>,
    /// Set once the producer exists; `None` until then so the previewer
    /// can start before the pipeline.
    provider: Mutex<Option<TripleBuffer>>,
    latest: Mutex<Option<Arc<PreviewFrame>>>,
    frames: AtomicU64,
    extractor: Mutex<HeatmapContourExtractor>,
    model: Mutex<(ModelType, ObjectiveLensPower)>,
    to_exit: AtomicBool,
}

impl Previewer {
    pub fn new(config: Arc<ArmConfig>) -> Self {
        let extractor = HeatmapContourExtractor::new(config.relative_threshold);
        Self {
            config,
            provider: Mutex::new(None),
            latest: Mutex::new(None),
            frames: AtomicU64::new(0),
            extractor: Mutex::new(extractor),
            model: Mutex::new((ModelType::Unspecified, ObjectiveLensPower::Unspecified)),
            to_exit: AtomicBool::new(false),
        }
    }

    pub fn set_provider(&self, buffers: TripleBuffer) {
        *self.provider.lock().expect("provider lock poisoned") = Some(buffers);
    }

    pub fn stop(&self) {
        self.to_exit.store(true, Ordering::SeqCst);
    }

    pub fn frame_count(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    pub fn latest_frame(&self) -> Option<Arc<PreviewFrame>> {
        self.latest.lock().expect("latest lock poisoned").clone()
    }

    pub fn update_config_for_model(
        &self,
        model_type: ModelType,
        objective: ObjectiveLensPower,
    ) {
        self.extractor
            .lock()
            .expect("extractor lock poisoned")
            .update_config_for_model(&self.config, model_type, objective);
        *self.model.lock().expect("model lock poisoned") = (model_type, objective);
    }

    /// Consumes the loop until [`stop`](Self::stop) is called. The sleep is
    /// chopped into short intervals so shutdown is prompt.
    pub fn run(&self) {
        info!("Previewer started");
        while !self.to_exit.load(Ordering::SeqCst) {
            self.refresh();
            let deadline = Instant::now() + self.config.preview_delay;
            while Instant::now() < deadline && !self.to_exit.load(Ordering::SeqCst) {
                std::thread::sleep(EXIT_POLL_INTERVAL.min(self.config.preview_delay));
            }
        }
        info!("Previewer stopped");
    }

    /// One consumer cycle: rotate the preview slot in, copy the capture
    /// region out, trace contours, and publish the assembled frame as the
    /// latest preview. Returns `None` before the first captured frame.
    pub fn refresh(&self) -> Option<Arc<PreviewFrame>> {
        let buffers = self
            .provider
            .lock()
            .expect("provider lock poisoned")
            .clone()?;
        let slot = buffers.acquire_preview();
        let (image, heatmap, output_tensor) = {
            let guard = slot.lock().expect("preview slot lock poisoned");
            let image = guard.input_image()?;
            let heatmap = guard
                .heatmap
                .clone()
                .unwrap_or_else(HeatmapImage::trivial);
            let output_tensor = guard
                .output_tensor
                .clone()
                .unwrap_or_else(|| OutputTensor::new(1, 1, 1));
            (image, heatmap, output_tensor)
        };

        // The trivial heatmap means no model was configured; there is
        // nothing to trace, but the captured image is still shown.
        let contours = if heatmap.width <= 1 && heatmap.height <= 1 {
            ContourSet::default()
        } else {
            self.extractor
                .lock()
                .expect("extractor lock poisoned")
                .create_contours(
                    &heatmap.data,
                    heatmap.width,
                    heatmap.height,
                    image.width,
                    image.height,
                )
        };

        let frame = Arc::new(PreviewFrame {
            image,
            heatmap,
            output_tensor,
            contours,
        });
        *self.latest.lock().expect("latest lock poisoned") = Some(frame.clone());
        self.frames.fetch_add(1, Ordering::SeqCst);
        Some(frame)
    }

    /// Writes the latest preview frame into a timestamped directory under
    /// `root`: the captured image, the heatmap, and a small metadata file.
    /// Returns the directory path.
    pub fn take_snapshot(&self, root: &Path) -> Result<PathBuf> {
        let frame = self.latest_frame().ok_or(PipelineError::PreviewNotReady)?;
        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let dir = root.join(format!("snapshot-{stamp}"));
        fs::create_dir_all(&dir)?;
        let dir = dir.as_path();

        let image = RgbImage::from_raw(
            frame.image.width as u32,
            frame.image.height as u32,
            frame.image.data.clone(),
        )
        .expect("image buffer sized to dimensions");
        image.save(dir.join("input.png")).map_err(io_error)?;

        let heatmap = GrayImage::from_raw(
            frame.heatmap.width as u32,
            frame.heatmap.height as u32,
            frame.heatmap.data.clone(),
        )
        .expect("heatmap buffer sized to dimensions");
        heatmap.save(dir.join("heatmap.png")).map_err(io_error)?;

        let (model_type, objective) = *self.model.lock().expect("model lock poisoned");
        let metadata = format!(
            "model: {model_type}\nobjective: {objective}\nversion: {}\n\
             image: {}x{}\nheatmap: {}x{}\ncontours: {}\n",
            model_version(model_type, objective),
            frame.image.width,
            frame.image.height,
            frame.heatmap.width,
            frame.heatmap.height,
            frame.contours.polygons.len(),
        );
        fs::write(dir.join("metadata.txt"), metadata)?;

        info!("Snapshot written to {}", dir.display());
        Ok(dir.to_path_buf())
    }
}

fn io_error(err: image::ImageError) -> PipelineError {
    match err {
        image::ImageError::IoError(err) => PipelineError::Io(err),
        other => PipelineError::Io(std::io::Error::other(other)),
    }
}
