//! Debayering module for converting Bayer pattern sensor frames to RGB.
//!
//! Implements a quick half-resolution demosaic: every 2x2 `RG/GB` cell of
//! the sensor collapses into one output pixel, so no interpolation is needed
//! and the conversion is a single pass over the frame. The output image is
//! always 3-channel 8-bit; 16-bit sensors are reduced to their most
//! significant byte after optional white-balance gain.

use crate::arm_config::ArmConfig;
use crate::image_pipeline::error::{PipelineError, Result};

/// Channel emission order of the debayered image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorOrder {
    Rgb,
    Bgr,
}

/// A raw Bayer-pattern frame as read from the sensor.
///
/// Owned exclusively by the capture stage until handed to the debayer.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: usize,
    pub height: usize,
    pub bytes_per_pixel: usize,
    pub data: Vec<u8>,
}

impl RawFrame {
    pub fn new(width: usize, height: usize, bytes_per_pixel: usize, data: Vec<u8>) -> Result<Self> {
        let expected = width * height * bytes_per_pixel;
        if data.len() != expected {
            return Err(PipelineError::TruncatedFrame {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            bytes_per_pixel,
            data,
        })
    }

    fn row(&self, y: usize) -> &[u8] {
        let stride = self.width * self.bytes_per_pixel;
        &self.data[y * stride..(y + 1) * stride]
    }
}

/// 3-channel 8-bit image, produced fresh by the debayer each cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorImage {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl ColorImage {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0u8; width * height * 3],
        }
    }

    pub fn view_mut(&mut self) -> ImageViewMut<'_> {
        let stride = self.width * 3;
        ImageViewMut {
            width: self.width,
            height: self.height,
            stride,
            data: &mut self.data,
        }
    }

    pub fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
        let i = (y * self.width + x) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }
}

/// Mutable strided view over a 3-channel 8-bit image region, e.g. the
/// capture area inside a padded inference input tensor.
pub struct ImageViewMut<'a> {
    data: &'a mut [u8],
    width: usize,
    height: usize,
    stride: usize,
}

impl<'a> ImageViewMut<'a> {
    /// `data` must start at the first pixel of the region and hold full
    /// `stride`-spaced rows for all but the last row.
    pub fn new(data: &'a mut [u8], width: usize, height: usize, stride: usize) -> Self {
        debug_assert!(stride >= width * 3);
        debug_assert!(data.len() >= (height.saturating_sub(1)) * stride + width * 3);
        Self {
            data,
            width,
            height,
            stride,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn row_mut(&mut self, y: usize) -> &mut [u8] {
        &mut self.data[y * self.stride..y * self.stride + self.width * 3]
    }
}

#[derive(Debug, Clone, Copy)]
struct RgbGains {
    red: f64,
    green: f64,
    blue: f64,
}

/// Half-resolution Bayer-to-RGB converter.
#[derive(Debug, Clone)]
pub struct Debayer {
    num_threads: usize,
    smooth: bool,
    gains: Option<RgbGains>,
}

impl Default for Debayer {
    fn default() -> Self {
        Self {
            num_threads: 8,
            smooth: false,
            gains: None,
        }
    }
}

impl Debayer {
    pub fn new(num_threads: usize, smooth: bool) -> Self {
        Self {
            num_threads,
            smooth,
            gains: None,
        }
    }

    pub fn from_config(config: &ArmConfig) -> Self {
        let mut debayer = Self::new(config.num_debayer_threads, config.smooth_image);
        if let Some((red, green, blue)) = config.rgb_gains {
            debayer.set_rgb_gains(red, green, blue);
        }
        debayer
    }

    /// Sets per-channel white-balance gains applied before bit reduction.
    pub fn set_rgb_gains(&mut self, red: f64, green: f64, blue: f64) {
        self.gains = Some(RgbGains { red, green, blue });
    }

    /// Debayers into a freshly allocated image of half the frame size.
    pub fn half_debayer(&self, frame: &RawFrame, order: ColorOrder) -> Result<ColorImage> {
        let mut output = ColorImage::new(frame.width / 2, frame.height / 2);
        self.half_debayer_into(frame, order, &mut output.view_mut())?;
        Ok(output)
    }

    /// Debayers into a caller-provided view sized exactly half the frame.
    pub fn half_debayer_into(
        &self,
        frame: &RawFrame,
        order: ColorOrder,
        output: &mut ImageViewMut<'_>,
    ) -> Result<()> {
        if frame.width % 2 != 0 || frame.height % 2 != 0 {
            return Err(PipelineError::OddFrameDimensions {
                width: frame.width,
                height: frame.height,
            });
        }
        debug_assert_eq!(output.width, frame.width / 2);
        debug_assert_eq!(output.height, frame.height / 2);

        match frame.bytes_per_pixel {
            1 => self.debayer_banded::<u8>(frame, order, output),
            2 => self.debayer_banded::<u16>(frame, order, output),
            other => return Err(PipelineError::UnsupportedPixelDepth(other)),
        }

        if self.smooth {
            box_blur_3x3(output);
        }
        Ok(())
    }

    /// Partitions the output into horizontal row bands, one per thread. Each
    /// output row depends only on its two source rows, so bands share no
    /// state. Remainder rows go to the last band to keep the partition
    /// exhaustive for any thread count.
    fn debayer_banded<T: BayerSample>(
        &self,
        frame: &RawFrame,
        order: ColorOrder,
        output: &mut ImageViewMut<'_>,
    ) {
        let out_height = output.height;
        let out_width = output.width;
        let stride = output.stride;

        if self.num_threads <= 1 || out_height <= 1 {
            self.debayer_rows::<T>(frame, order, 0, out_height, out_width, stride, output.data);
            return;
        }

        let bands = self.num_threads.min(out_height);
        let rows_per_band = out_height / bands;

        let mut slices: Vec<(usize, usize, &mut [u8])> = Vec::with_capacity(bands);
        let mut rest: &mut [u8] = output.data;
        for band in 0..bands {
            let first_row = band * rows_per_band;
            let rows = if band + 1 == bands {
                out_height - first_row
            } else {
                rows_per_band
            };
            if band + 1 == bands {
                slices.push((first_row, rows, std::mem::take(&mut rest)));
            } else {
                let (head, tail) = rest.split_at_mut(rows * stride);
                slices.push((first_row, rows, head));
                rest = tail;
            }
        }

        rayon::scope(|scope| {
            for (first_row, rows, slice) in slices {
                scope.spawn(move |_| {
                    self.debayer_rows::<T>(frame, order, first_row, rows, out_width, stride, slice);
                });
            }
        });
    }

    fn debayer_rows<T: BayerSample>(
        &self,
        frame: &RawFrame,
        order: ColorOrder,
        first_row: usize,
        rows: usize,
        out_width: usize,
        stride: usize,
        band: &mut [u8],
    ) {
        let gains = self.gains;
        for r in 0..rows {
            let y = first_row + r;
            let input_row1 = frame.row(y << 1);
            let input_row2 = frame.row((y << 1) + 1);
            let out_row = &mut band[r * stride..r * stride + out_width * 3];
            for x in 0..out_width {
                // Bayer pixel pattern:
                //   RG
                //   GB
                let x1 = x << 1;
                let x2 = x1 + 1;
                let red = T::read(input_row1, x1).reduce(gains.map(|g| g.red));
                let green = T::read(input_row1, x2).reduce(gains.map(|g| g.green));
                let blue = T::read(input_row2, x2).reduce(gains.map(|g| g.blue));
                let out = &mut out_row[x * 3..x * 3 + 3];
                match order {
                    ColorOrder::Rgb => {
                        out[0] = red;
                        out[1] = green;
                        out[2] = blue;
                    }
                    ColorOrder::Bgr => {
                        out[0] = blue;
                        out[1] = green;
                        out[2] = red;
                    }
                }
            }
        }
    }
}

/// A single Bayer sample wide enough to gain-scale and reduce to 8 bits.
trait BayerSample: Copy + Send + Sync {
    fn read(row: &[u8], index: usize) -> Self;
    /// Applies the gain (clamped to the depth's maximum) and keeps the most
    /// significant byte.
    fn reduce(self, gain: Option<f64>) -> u8;
}

impl BayerSample for u8 {
    fn read(row: &[u8], index: usize) -> Self {
        row[index]
    }

    fn reduce(self, gain: Option<f64>) -> u8 {
        match gain {
            Some(gain) => (gain * f64::from(self)).min(f64::from(u8::MAX)) as u8,
            None => self,
        }
    }
}

impl BayerSample for u16 {
    fn read(row: &[u8], index: usize) -> Self {
        u16::from_ne_bytes([row[index * 2], row[index * 2 + 1]])
    }

    fn reduce(self, gain: Option<f64>) -> u8 {
        let value = match gain {
            Some(gain) => (gain * f64::from(self)).min(f64::from(u16::MAX)) as u16,
            None => self,
        };
        (value >> 8) as u8
    }
}

/// Fixed 3x3 box blur over the finished output, mirroring edge pixels.
fn box_blur_3x3(output: &mut ImageViewMut<'_>) {
    let width = output.width;
    let height = output.height;
    if width == 0 || height == 0 {
        return;
    }

    let mut source = vec![0u8; width * height * 3];
    for y in 0..height {
        let row = output.row_mut(y);
        source[y * width * 3..(y + 1) * width * 3].copy_from_slice(row);
    }

    // Reflect-101 border: index -1 maps to 1, index n maps to n - 2.
    let reflect = |i: isize, n: usize| -> usize {
        let n = n as isize;
        let i = if i < 0 { -i } else if i >= n { 2 * (n - 1) - i } else { i };
        i.clamp(0, n - 1) as usize
    };

    for y in 0..height {
        for x in 0..width {
            let mut sums = [0u32; 3];
            for dy in -1isize..=1 {
                for dx in -1isize..=1 {
                    let sy = reflect(y as isize + dy, height);
                    let sx = reflect(x as isize + dx, width);
                    let base = (sy * width + sx) * 3;
                    for c in 0..3 {
                        sums[c] += u32::from(source[base + c]);
                    }
                }
            }
            let out_row = output.row_mut(y);
            for c in 0..3 {
                out_row[x * 3 + c] = (sums[c] / 9) as u8;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 6x4 8-bit Bayer pattern data.
    const BAYER_8BIT: [u8; 24] = [
        0xdb, 0x33, 0x72, 0x9d, 0xd6, 0x2a, 0xe4, 0xb1, 0xfb, 0x49, 0xcc, 0xa8, 0x78, 0x75, 0xf8,
        0x96, 0xdd, 0x7d, 0xcb, 0x8a, 0x5f, 0xd7, 0x62, 0xa2,
    ];

    // 3x2 RGB as result of above Bayer.
    const RGB: [u8; 18] = [
        0xdb, 0x33, 0xb1, 0x72, 0x9d, 0x49, 0xd6, 0x2a, 0xa8, 0x78, 0x75, 0x8a, 0xf8, 0x96, 0xd7,
        0xdd, 0x7d, 0xa2,
    ];

    // 3x2 BGR as result of above Bayer.
    const BGR: [u8; 18] = [
        0xb1, 0x33, 0xdb, 0x49, 0x9d, 0x72, 0xa8, 0x2a, 0xd6, 0x8a, 0x75, 0x78, 0xd7, 0x96, 0xf8,
        0xa2, 0x7d, 0xdd,
    ];

    // 4x2 16-bit Bayer pattern data.
    const BAYER_16BIT: [u16; 8] = [
        0x5c4e, 0xfbb0, 0x9c88, 0x5f5c, 0xa6e6, 0x41a1, 0xd44c, 0xefe2,
    ];

    // 2x1 RGB as result of above Bayer.
    const RGB_RAW: [u8; 6] = [0x5c, 0xfb, 0x41, 0x9c, 0x5f, 0xef];

    // 2x1 BGR as result of above Bayer.
    const BGR_RAW: [u8; 6] = [0x41, 0xfb, 0x5c, 0xef, 0x5f, 0x9c];

    const RED_GAIN: f64 = 1.6;
    const GREEN_GAIN: f64 = 2.1;
    const BLUE_GAIN: f64 = 1.0;

    const RGB_GAIN_ADJUSTED: [u8; 6] = [0x93, 0xff, 0x41, 0xfa, 0xc8, 0xef];
    const BGR_GAIN_ADJUSTED: [u8; 6] = [0x41, 0xff, 0x93, 0xef, 0xc8, 0xfa];

    fn frame_8bit() -> RawFrame {
        RawFrame::new(6, 4, 1, BAYER_8BIT.to_vec()).unwrap()
    }

    fn frame_16bit() -> RawFrame {
        let bytes: Vec<u8> = BAYER_16BIT.iter().flat_map(|v| v.to_ne_bytes()).collect();
        RawFrame::new(4, 2, 2, bytes).unwrap()
    }

    #[test]
    fn single_thread_rgb() {
        let debayer = Debayer::new(1, false);
        let rgb = debayer.half_debayer(&frame_8bit(), ColorOrder::Rgb).unwrap();
        assert_eq!(rgb.width, 3);
        assert_eq!(rgb.height, 2);
        assert_eq!(rgb.data, RGB);
    }

    #[test]
    fn multi_thread_rgb() {
        let debayer = Debayer::new(2, false);
        let rgb = debayer.half_debayer(&frame_8bit(), ColorOrder::Rgb).unwrap();
        assert_eq!(rgb.data, RGB);
    }

    #[test]
    fn bgr() {
        let debayer = Debayer::new(2, false);
        let bgr = debayer.half_debayer(&frame_8bit(), ColorOrder::Bgr).unwrap();
        assert_eq!(bgr.data, BGR);
    }

    #[test]
    fn thread_count_does_not_change_output() {
        // 16x10 pseudo-random frame; band remainders exercise the last band.
        let width = 16;
        let height = 10;
        let mut data = vec![0u8; width * height];
        let mut state = 0x1234_5678u32;
        for value in &mut data {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            *value = (state >> 24) as u8;
        }
        let frame = RawFrame::new(width, height, 1, data).unwrap();

        let reference = Debayer::new(1, false)
            .half_debayer(&frame, ColorOrder::Rgb)
            .unwrap();
        for threads in [2, 3, 4, 5, 8, 16] {
            let out = Debayer::new(threads, false)
                .half_debayer(&frame, ColorOrder::Rgb)
                .unwrap();
            assert_eq!(out.data, reference.data, "threads = {threads}");
        }
    }

    #[test]
    fn rgb_16bit() {
        let debayer = Debayer::new(1, false);
        let rgb = debayer.half_debayer(&frame_16bit(), ColorOrder::Rgb).unwrap();
        assert_eq!(rgb.data, RGB_RAW);
    }

    #[test]
    fn bgr_16bit() {
        let debayer = Debayer::new(1, false);
        let bgr = debayer.half_debayer(&frame_16bit(), ColorOrder::Bgr).unwrap();
        assert_eq!(bgr.data, BGR_RAW);
    }

    #[test]
    fn rgb_16bit_white_balance_saturates() {
        let mut debayer = Debayer::new(1, false);
        debayer.set_rgb_gains(RED_GAIN, GREEN_GAIN, BLUE_GAIN);
        let rgb = debayer.half_debayer(&frame_16bit(), ColorOrder::Rgb).unwrap();
        assert_eq!(rgb.data, RGB_GAIN_ADJUSTED);
    }

    #[test]
    fn bgr_16bit_white_balance_saturates() {
        let mut debayer = Debayer::new(1, false);
        debayer.set_rgb_gains(RED_GAIN, GREEN_GAIN, BLUE_GAIN);
        let bgr = debayer.half_debayer(&frame_16bit(), ColorOrder::Bgr).unwrap();
        assert_eq!(bgr.data, BGR_GAIN_ADJUSTED);
    }

    #[test]
    fn gain_on_8bit_clamps_without_shifting() {
        let mut debayer = Debayer::new(1, false);
        debayer.set_rgb_gains(2.0, 2.0, 2.0);
        let frame = RawFrame::new(2, 2, 1, vec![0x20, 0x90, 0x10, 0x40]).unwrap();
        let rgb = debayer.half_debayer(&frame, ColorOrder::Rgb).unwrap();
        // 0x90 and 0x40 doubled; 0x90 * 2 saturates to 0xff.
        assert_eq!(rgb.data, vec![0x40, 0xff, 0x80]);
    }

    #[test]
    fn unsupported_pixel_depth_is_rejected() {
        let debayer = Debayer::new(1, false);
        let frame = RawFrame::new(2, 2, 4, vec![0u8; 16]).unwrap();
        let err = debayer.half_debayer(&frame, ColorOrder::Rgb).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedPixelDepth(4)));
    }

    #[test]
    fn odd_dimensions_are_rejected() {
        let debayer = Debayer::new(1, false);
        let frame = RawFrame::new(3, 2, 1, vec![0u8; 6]).unwrap();
        let err = debayer.half_debayer(&frame, ColorOrder::Rgb).unwrap_err();
        assert!(matches!(err, PipelineError::OddFrameDimensions { .. }));
    }

    #[test]
    fn smoothing_runs_over_finished_output() {
        let debayer = Debayer::new(1, true);
        let smoothed = debayer.half_debayer(&frame_8bit(), ColorOrder::Rgb).unwrap();
        let raw = Debayer::new(1, false)
            .half_debayer(&frame_8bit(), ColorOrder::Rgb)
            .unwrap();
        assert_eq!(smoothed.width, raw.width);
        assert_eq!(smoothed.height, raw.height);
        assert_ne!(smoothed.data, raw.data);
    }
}
