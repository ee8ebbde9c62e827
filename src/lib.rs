//! Real-time inference-overlay pipeline for an augmented-reality microscope.
//!
//! A capture/inference thread debayers raw sensor frames into a padded model
//! input tensor, runs inference, and publishes per-pixel confidence heatmaps
//! through a triple-buffered handoff. Consumers (preview, microdisplay) turn
//! the heatmaps into temporally stabilized contour overlays.

pub mod arm_config;
pub mod image_pipeline;
pub mod logger;
pub mod main_looper;
pub mod microdisplay;
