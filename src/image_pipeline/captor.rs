//! Capture backends. Hardware drivers live behind [`ImageCaptor`]; the
//! built-in test-pattern captor stands in when no device is attached.

use tracing::info;

use crate::arm_config::ArmConfig;
use crate::image_pipeline::debayer::RawFrame;
use crate::image_pipeline::error::{PipelineError, Result};

/// A camera delivering raw Bayer-pattern frames.
pub trait ImageCaptor: Send {
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Sensor dimensions, equal to the Bayer pattern image dimensions.
    fn sensor_width(&self) -> usize;
    fn sensor_height(&self) -> usize;

    /// Dimensions of the debayered image. Half the sensor size because the
    /// pipeline uses the half-resolution debayer.
    fn image_width(&self) -> usize {
        self.sensor_width() / 2
    }

    fn image_height(&self) -> usize {
        self.sensor_height() / 2
    }

    /// Bytes per single Bayer pattern pixel.
    fn bytes_per_pixel(&self) -> usize;

    /// Reads one frame from the device. May fail transiently (device busy);
    /// the caller logs and retries next cycle.
    fn capture_raw(&mut self) -> Result<RawFrame>;

    fn supports_auto_exposure(&self) -> bool {
        false
    }

    /// Current exposure time, if the device reports one.
    fn exposure_time_micros(&self) -> Option<u32> {
        None
    }

    /// Sets a fixed exposure time. Turns off auto-exposure.
    fn set_exposure_time(&mut self, _micros: u32) -> Result<()> {
        Ok(())
    }

    /// Target auto-exposure brightness as a percentage in [0, 100].
    fn set_auto_exposure_brightness(&mut self, _target_brightness: u8) -> Result<()> {
        Err(PipelineError::Capture("auto exposure not available".into()))
    }
}

/// Synthetic captor emitting a drifting gradient so every frame differs.
pub struct TestPatternCaptor {
    width: usize,
    height: usize,
    bytes_per_pixel: usize,
    frame_index: u64,
    exposure_micros: u32,
}

impl TestPatternCaptor {
    pub fn new(width: usize, height: usize, bytes_per_pixel: usize) -> Self {
        Self {
            width,
            height,
            bytes_per_pixel,
            frame_index: 0,
            exposure_micros: 10_000,
        }
    }
}

impl ImageCaptor for TestPatternCaptor {
    fn initialize(&mut self) -> Result<()> {
        info!(
            "Test pattern captor: {}x{}, {} byte(s) per pixel",
            self.width, self.height, self.bytes_per_pixel
        );
        Ok(())
    }

    fn sensor_width(&self) -> usize {
        self.width
    }

    fn sensor_height(&self) -> usize {
        self.height
    }

    fn bytes_per_pixel(&self) -> usize {
        self.bytes_per_pixel
    }

    fn capture_raw(&mut self) -> Result<RawFrame> {
        let shift = self.frame_index as usize;
        self.frame_index += 1;
        let mut data = Vec::with_capacity(self.width * self.height * self.bytes_per_pixel);
        for y in 0..self.height {
            for x in 0..self.width {
                let value = ((x + y + shift) % 256) as u8;
                match self.bytes_per_pixel {
                    1 => data.push(value),
                    _ => {
                        // Put the gradient in the most significant byte.
                        let sample = u16::from(value) << 8;
                        data.extend_from_slice(&sample.to_ne_bytes());
                    }
                }
            }
        }
        RawFrame::new(self.width, self.height, self.bytes_per_pixel, data)
    }

    fn exposure_time_micros(&self) -> Option<u32> {
        Some(self.exposure_micros)
    }

    fn set_exposure_time(&mut self, micros: u32) -> Result<()> {
        self.exposure_micros = micros;
        Ok(())
    }
}

/// Selects the capture backend. Vendor SDK captors are wired in here when
/// the crate is built with hardware support; without one the test-pattern
/// captor keeps the pipeline exercisable.
pub fn create_captor(config: &ArmConfig) -> Box<dyn ImageCaptor> {
    Box::new(TestPatternCaptor::new(
        config.sensor_width,
        config.sensor_height,
        config.sensor_bytes_per_pixel,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_drift_between_captures() {
        let mut captor = TestPatternCaptor::new(8, 8, 1);
        let first = captor.capture_raw().unwrap();
        let second = captor.capture_raw().unwrap();
        assert_eq!(first.data.len(), 64);
        assert_ne!(first.data, second.data);
    }

    #[test]
    fn image_dimensions_are_half_the_sensor() {
        let captor = TestPatternCaptor::new(12, 8, 1);
        assert_eq!(captor.image_width(), 6);
        assert_eq!(captor.image_height(), 4);
    }

    #[test]
    fn sixteen_bit_frames_have_two_bytes_per_sample() {
        let mut captor = TestPatternCaptor::new(4, 4, 2);
        let frame = captor.capture_raw().unwrap();
        assert_eq!(frame.bytes_per_pixel, 2);
        assert_eq!(frame.data.len(), 32);
    }
}
