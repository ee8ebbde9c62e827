use thiserror::Error;

use crate::image_pipeline::inference::{ModelType, ObjectiveLensPower};

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Misconfigured camera driver; the pipeline cannot run with this sensor.
    #[error("unsupported Bayer pixel byte width: {0}")]
    UnsupportedPixelDepth(usize),

    #[error("Bayer frame dimensions must be even: {width}x{height}")]
    OddFrameDimensions { width: usize, height: usize },

    #[error("raw frame has {actual} bytes, expected {expected}")]
    TruncatedFrame { expected: usize, actual: usize },

    #[error("capture failed: {0}")]
    Capture(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("no model for objective lens power and model type: {objective}, {model_type}")]
    ModelUnavailable {
        model_type: ModelType,
        objective: ObjectiveLensPower,
    },

    #[error("capture frame {width}x{height} does not fit inference patch {patch_size}")]
    FrameExceedsPatch {
        width: usize,
        height: usize,
        patch_size: usize,
    },

    #[error("preview image not yet ready")]
    PreviewNotReady,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
