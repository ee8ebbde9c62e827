//! The capture/inference loop.
//!
//! One cycle: place the capture region in the `current` buffer set, grab a
//! raw frame, debayer it into the input tensor, run inference, publish, and
//! hand the stamped heatmap to the microdisplay. Timing checkpoints are
//! recorded at the start of each stage and rolled up by
//! [`InferenceTimings`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use crate::arm_config::ArmConfig;
use crate::image_pipeline::captor::ImageCaptor;
use crate::image_pipeline::debayer::{ColorOrder, Debayer};
use crate::image_pipeline::error::{PipelineError, Result};
use crate::image_pipeline::inference::{
    InferenceEngine, InferenceStage, ModelType, ObjectiveLensPower,
};
use crate::main_looper::previewer::Previewer;
use crate::microdisplay::{Heatmap, InferenceCheckpoint, InferenceTimings, Microdisplay};

struct LooperShared {
    to_exit: AtomicBool,
    should_update_model: AtomicBool,
    pending_model: Mutex<(ModelType, ObjectiveLensPower)>,
    pending_positive_classes: Mutex<Option<Vec<usize>>>,
}

/// Cloneable handle for stopping the loop and requesting model switches
/// from other threads. Requests are picked up at the next cycle boundary.
#[derive(Clone)]
pub struct LooperControl {
    shared: Arc<LooperShared>,
}

impl LooperControl {
    pub fn stop(&self) {
        self.shared.to_exit.store(true, Ordering::SeqCst);
    }

    /// Requests a switch to the model for the given combination. A later
    /// request overwrites an unserviced earlier one.
    pub fn set_objective_and_model_type(
        &self,
        model_type: ModelType,
        objective: ObjectiveLensPower,
    ) {
        *self
            .shared
            .pending_model
            .lock()
            .expect("pending model lock poisoned") = (model_type, objective);
        self.shared.should_update_model.store(true, Ordering::SeqCst);
    }

    /// Replaces the output classes contributing to the positive heatmap,
    /// applied at the next cycle boundary.
    pub fn set_positive_classes(&self, classes: Vec<usize>) {
        *self
            .shared
            .pending_positive_classes
            .lock()
            .expect("pending classes lock poisoned") = Some(classes);
    }
}

pub struct Looper {
    shared: Arc<LooperShared>,
    config: Arc<ArmConfig>,
    debayer: Debayer,
    captor: Box<dyn ImageCaptor>,
    stage: InferenceStage,
    previewer: Option<Arc<Previewer>>,
    microdisplay: Box<dyn Microdisplay>,
    /// Surfaces operator-visible warnings (model switch failures). The
    /// default just logs.
    display_warning: Box<dyn Fn(&str) + Send>,
    timings: InferenceTimings,
}

impl Looper {
    pub fn new(
        config: Arc<ArmConfig>,
        captor: Box<dyn ImageCaptor>,
        engine: Box<dyn InferenceEngine>,
        model_type: ModelType,
        objective: ObjectiveLensPower,
        microdisplay: Box<dyn Microdisplay>,
    ) -> Self {
        let debayer = Debayer::from_config(&config);
        let stage = InferenceStage::new(config.clone(), engine, model_type, objective);
        Self {
            shared: Arc::new(LooperShared {
                to_exit: AtomicBool::new(false),
                should_update_model: AtomicBool::new(false),
                pending_model: Mutex::new((model_type, objective)),
                pending_positive_classes: Mutex::new(None),
            }),
            timings: InferenceTimings::new(config.show_stats_every_n),
            config,
            debayer,
            captor,
            stage,
            previewer: None,
            microdisplay,
            display_warning: Box::new(|message| warn!("{message}")),
        }
    }

    pub fn control(&self) -> LooperControl {
        LooperControl {
            shared: self.shared.clone(),
        }
    }

    pub fn set_warning_callback(&mut self, callback: Box<dyn Fn(&str) + Send>) {
        self.display_warning = callback;
    }

    /// Wires the previewer to the producer's buffers so it can start
    /// consuming once frames are published.
    pub fn set_previewer(&mut self, previewer: Arc<Previewer>) {
        previewer.set_provider(self.stage.buffers());
        self.previewer = Some(previewer);
    }

    /// Runs until stopped. Per-cycle errors are logged and the loop
    /// continues without publishing; an unsupported pixel depth means the
    /// configuration cannot work and stops the loop.
    pub fn run(&mut self) -> Result<()> {
        self.start_up()?;

        let result = loop {
            if self.shared.to_exit.load(Ordering::SeqCst) {
                break Ok(());
            }
            self.maybe_update_model();
            self.maybe_update_positive_classes();

            match self.loop_once() {
                Ok(heatmap) => self.timings.add_timing(&heatmap),
                Err(err @ PipelineError::UnsupportedPixelDepth(_)) => {
                    error!("Unrecoverable capture error: {err}");
                    break Err(err);
                }
                Err(err) => warn!("Capture cycle failed: {err}"),
            }

            if let Some(delay) = self.config.loop_delay {
                std::thread::sleep(delay);
            }
        };

        self.captor.finalize()?;
        info!("Looper stopped");
        result
    }

    /// Brings the captor up and applies the startup configuration. Displays
    /// are configured for the requested model regardless of load success, so
    /// contour parameters are right once a model does load.
    fn start_up(&mut self) -> Result<()> {
        self.captor.initialize()?;
        if self.captor.supports_auto_exposure() {
            self.captor
                .set_auto_exposure_brightness(self.config.auto_exposure_brightness)?;
        }
        info!(
            "Looper started: sensor {}x{}, image {}x{}",
            self.captor.sensor_width(),
            self.captor.sensor_height(),
            self.captor.image_width(),
            self.captor.image_height()
        );

        let (model_type, objective) = (self.stage.model_type(), self.stage.objective());
        self.microdisplay
            .update_config_for_model(&self.config, model_type, objective);
        if let Some(previewer) = &self.previewer {
            previewer.update_config_for_model(model_type, objective);
        }

        if let Err(err) = self.stage.initialize() {
            let message = format!("No model loaded at startup: {err}");
            warn!("{message}");
            (self.display_warning)(&message);
        }
        Ok(())
    }

    /// Services a pending positive-class update.
    fn maybe_update_positive_classes(&mut self) {
        let pending = self
            .shared
            .pending_positive_classes
            .lock()
            .expect("pending classes lock poisoned")
            .take();
        if let Some(classes) = pending {
            self.stage.set_positive_classes(classes);
        }
    }

    /// Services a pending model switch request. On failure the warning is
    /// surfaced and the display keeps its previous configuration.
    fn maybe_update_model(&mut self) {
        if !self.shared.should_update_model.swap(false, Ordering::SeqCst) {
            return;
        }
        let (model_type, objective) = *self
            .shared
            .pending_model
            .lock()
            .expect("pending model lock poisoned");
        match self.stage.load_model(model_type, objective) {
            Ok(()) => {
                self.microdisplay
                    .update_config_for_model(&self.config, model_type, objective);
                if let Some(previewer) = &self.previewer {
                    previewer.update_config_for_model(model_type, objective);
                }
            }
            Err(err) => {
                let message =
                    format!("Failed to load model for {model_type}, {objective}: {err}");
                warn!("{message}");
                (self.display_warning)(&message);
            }
        }
    }

    fn loop_once(&mut self) -> Result<Heatmap> {
        let mut record = Heatmap::new();
        record.set_timing_checkpoint(InferenceCheckpoint::Prepare);
        let width = self.captor.image_width();
        let height = self.captor.image_height();
        let target = self.stage.prepare_capture(width, height)?;

        record.set_timing_checkpoint(InferenceCheckpoint::GrabImage);
        let frame = self.captor.capture_raw()?;

        record.set_timing_checkpoint(InferenceCheckpoint::Debayer);
        target.with_input_view(|view| {
            self.debayer.half_debayer_into(&frame, ColorOrder::Rgb, view)
        })?;

        record.set_timing_checkpoint(InferenceCheckpoint::Inference);
        let heatmap = self.stage.process_image()?;

        record.set_timing_checkpoint(InferenceCheckpoint::DisplayHeatmap);
        record.width = heatmap.width;
        record.height = heatmap.height;
        record.image_binary = heatmap.data;
        self.microdisplay.show_heatmap(&record);

        record.set_timing_checkpoint(InferenceCheckpoint::End);
        Ok(record)
    }
}
