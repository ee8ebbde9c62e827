//! Image processing pipeline module
//!
//! The producer half of the system: raw Bayer capture, half-resolution
//! debayering, and the triple-buffered inference stage that publishes
//! heatmaps to the display consumers.

pub mod captor;
pub mod debayer;
pub mod error;
pub mod inference;
pub mod triple_buffer;

pub use captor::{ImageCaptor, TestPatternCaptor, create_captor};
pub use debayer::{ColorImage, ColorOrder, Debayer, ImageViewMut, RawFrame};
pub use error::{PipelineError, Result};
pub use inference::{
    ConstantEngine, InferenceEngine, InferenceStage, ModelType, ObjectiveLensPower,
};
pub use triple_buffer::{HeatmapImage, InferenceBuffers, OutputTensor, Roi, TripleBuffer};
