//! Triple-buffered handoff between the inference producer and the preview
//! consumer.
//!
//! Three buffer sets rotate through the roles `current` (producer writes),
//! `previous` (fully formed, awaiting consumption) and `preview` (consumer
//! reads). Role changes swap the owning handles, never buffer contents, so
//! the only contended critical section is a constant-time pointer swap.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::image_pipeline::debayer::{ColorImage, ImageViewMut};
use crate::image_pipeline::error::{PipelineError, Result};

/// Capture region inside the padded input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

/// Full multi-class probability volume produced by one inference run,
/// laid out `[height, width, classes]`, 8-bit per entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTensor {
    pub height: usize,
    pub width: usize,
    pub classes: usize,
    pub data: Vec<u8>,
}

impl OutputTensor {
    pub fn new(height: usize, width: usize, classes: usize) -> Self {
        Self {
            height,
            width,
            classes,
            data: vec![0u8; height * width * classes],
        }
    }

    pub fn value(&self, y: usize, x: usize, class: usize) -> u8 {
        self.data[(y * self.width + x) * self.classes + class]
    }

    pub fn set_value(&mut self, y: usize, x: usize, class: usize, value: u8) {
        self.data[(y * self.width + x) * self.classes + class] = value;
    }
}

/// Single-channel confidence image derived from the output tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeatmapImage {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl HeatmapImage {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0u8; width * height],
        }
    }

    /// The trivial heatmap published when no model is configured.
    pub fn trivial() -> Self {
        Self::new(1, 1)
    }
}

/// One rotating buffer set: padded input tensor, capture region, and the
/// per-cycle inference products.
#[derive(Debug)]
pub struct InferenceBuffers {
    patch_size: usize,
    pub input_tensor: Vec<u8>,
    pub capture_roi: Option<Roi>,
    pub heatmap: Option<HeatmapImage>,
    pub output_tensor: Option<OutputTensor>,
}

impl InferenceBuffers {
    fn new(patch_size: usize) -> Self {
        Self {
            patch_size,
            input_tensor: vec![0u8; patch_size * patch_size * 3],
            capture_roi: None,
            heatmap: None,
            output_tensor: None,
        }
    }

    pub fn patch_size(&self) -> usize {
        self.patch_size
    }

    /// Centers a `width` x `height` capture region inside the padded tensor
    /// and records it as the target of the next debayer.
    pub fn set_capture_roi(&mut self, width: usize, height: usize) -> Result<Roi> {
        if width >= self.patch_size || height >= self.patch_size {
            return Err(PipelineError::FrameExceedsPatch {
                width,
                height,
                patch_size: self.patch_size,
            });
        }
        let roi = Roi {
            x: (self.patch_size - width) / 2,
            y: (self.patch_size - height) / 2,
            width,
            height,
        };
        self.capture_roi = Some(roi);
        Ok(roi)
    }

    /// Mutable view of the capture region, for the debayer to write into.
    pub fn input_view(&mut self) -> Option<ImageViewMut<'_>> {
        let roi = self.capture_roi?;
        let stride = self.patch_size * 3;
        let start = roi.y * stride + roi.x * 3;
        Some(ImageViewMut::new(
            &mut self.input_tensor[start..],
            roi.width,
            roi.height,
            stride,
        ))
    }

    /// Copies the capture region out of the padded tensor.
    pub fn input_image(&self) -> Option<ColorImage> {
        let roi = self.capture_roi?;
        let stride = self.patch_size * 3;
        let mut image = ColorImage::new(roi.width, roi.height);
        for y in 0..roi.height {
            let src = (roi.y + y) * stride + roi.x * 3;
            let dst = y * roi.width * 3;
            image.data[dst..dst + roi.width * 3]
                .copy_from_slice(&self.input_tensor[src..src + roi.width * 3]);
        }
        Some(image)
    }
}

struct Slots {
    current: Arc<Mutex<InferenceBuffers>>,
    previous: Arc<Mutex<InferenceBuffers>>,
    preview: Arc<Mutex<InferenceBuffers>>,
    patch_size: usize,
}

/// Shared handle to the three rotating buffer sets.
///
/// Slot hand-offs exchange the `Arc`s under one short-held lock. Producer
/// and consumer then lock their own slot privately; by the rotation
/// invariant those per-slot locks are never contended.
#[derive(Clone)]
pub struct TripleBuffer {
    slots: Arc<Mutex<Slots>>,
}

impl TripleBuffer {
    pub fn new(patch_size: usize) -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                current: Arc::new(Mutex::new(InferenceBuffers::new(patch_size))),
                previous: Arc::new(Mutex::new(InferenceBuffers::new(patch_size))),
                preview: Arc::new(Mutex::new(InferenceBuffers::new(patch_size))),
                patch_size,
            })),
        }
    }

    pub fn patch_size(&self) -> usize {
        self.slots.lock().expect("slot lock poisoned").patch_size
    }

    /// The buffer set the producer writes this cycle.
    pub fn current(&self) -> Arc<Mutex<InferenceBuffers>> {
        self.slots.lock().expect("slot lock poisoned").current.clone()
    }

    /// Publishes the finished cycle: swap `current` and `previous`.
    pub fn publish(&self) {
        debug!("SWAP: current <--> previous");
        let mut slots = self.slots.lock().expect("slot lock poisoned");
        let Slots {
            current, previous, ..
        } = &mut *slots;
        std::mem::swap(current, previous);
    }

    /// Rotates the freshest published buffer into `preview` and hands it to
    /// the consumer. The producer never touches `preview`, so the returned
    /// handle can be read without further coordination.
    pub fn acquire_preview(&self) -> Arc<Mutex<InferenceBuffers>> {
        debug!("SWAP: previous <--> preview");
        let mut slots = self.slots.lock().expect("slot lock poisoned");
        let Slots {
            previous, preview, ..
        } = &mut *slots;
        std::mem::swap(previous, preview);
        preview.clone()
    }

    /// Recreates all three buffer sets for a new patch size. Handles already
    /// held by a consumer keep pointing at the old allocation, which is
    /// never mutated again.
    pub fn resize(&self, patch_size: usize) {
        let mut slots = self.slots.lock().expect("slot lock poisoned");
        slots.current = Arc::new(Mutex::new(InferenceBuffers::new(patch_size)));
        slots.previous = Arc::new(Mutex::new(InferenceBuffers::new(patch_size)));
        slots.preview = Arc::new(Mutex::new(InferenceBuffers::new(patch_size)));
        slots.patch_size = patch_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roi_is_centered_in_padded_tensor() {
        let mut buffers = InferenceBuffers::new(10);
        let roi = buffers.set_capture_roi(4, 6).unwrap();
        assert_eq!(roi, Roi { x: 3, y: 2, width: 4, height: 6 });
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buffers = InferenceBuffers::new(8);
        assert!(matches!(
            buffers.set_capture_roi(8, 4),
            Err(PipelineError::FrameExceedsPatch { .. })
        ));
    }

    #[test]
    fn input_image_copies_capture_region() {
        let mut buffers = InferenceBuffers::new(8);
        buffers.set_capture_roi(2, 2).unwrap();
        let roi = buffers.capture_roi.unwrap();
        let stride = buffers.patch_size() * 3;
        for y in 0..roi.height {
            for i in 0..roi.width * 3 {
                buffers.input_tensor[(roi.y + y) * stride + roi.x * 3 + i] = (y * 100 + i) as u8;
            }
        }
        let image = buffers.input_image().unwrap();
        assert_eq!(image.width, 2);
        assert_eq!(image.height, 2);
        assert_eq!(image.pixel(0, 0), [0, 1, 2]);
        assert_eq!(image.pixel(1, 1), [103, 104, 105]);
    }

    #[test]
    fn swaps_rotate_handles_not_contents() {
        let ring = TripleBuffer::new(4);
        let first_current = ring.current();
        ring.publish();
        // After the publish swap the old current is now previous, and the
        // next preview acquisition must hand exactly that buffer out.
        let preview = ring.acquire_preview();
        assert!(Arc::ptr_eq(&first_current, &preview));
    }

    #[test]
    fn concurrent_producer_and_consumer_never_tear_a_frame() {
        use rand::Rng;
        use std::time::Duration;

        let ring = TripleBuffer::new(4);
        let producer_ring = ring.clone();

        // The producer tags every byte of the heatmap with the cycle
        // number; a torn frame would show mixed tags.
        let producer = std::thread::spawn(move || {
            let mut rng = rand::thread_rng();
            for cycle in 0u8..=255 {
                {
                    let slot = producer_ring.current();
                    let mut buffers = slot.lock().unwrap();
                    let mut heatmap = HeatmapImage::new(8, 8);
                    heatmap.data.fill(cycle);
                    buffers.heatmap = Some(heatmap);
                }
                producer_ring.publish();
                if rng.gen_bool(0.3) {
                    std::thread::sleep(Duration::from_micros(rng.gen_range(0..50)));
                }
            }
        });

        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let slot = ring.acquire_preview();
            let buffers = slot.lock().unwrap();
            if let Some(heatmap) = &buffers.heatmap {
                let first = heatmap.data[0];
                assert!(heatmap.data.iter().all(|&v| v == first), "torn frame");
            }
            drop(buffers);
            if rng.gen_bool(0.3) {
                std::thread::sleep(Duration::from_micros(rng.gen_range(0..50)));
            }
        }
        producer.join().unwrap();
    }

    #[test]
    fn resize_leaves_held_preview_untouched() {
        let ring = TripleBuffer::new(4);
        {
            let current = ring.current();
            current.lock().unwrap().set_capture_roi(2, 2).unwrap();
        }
        ring.publish();
        let held = ring.acquire_preview();
        let held_patch = held.lock().unwrap().patch_size();

        ring.resize(16);
        assert_eq!(ring.patch_size(), 16);
        // The held handle still points at the old allocation.
        assert_eq!(held.lock().unwrap().patch_size(), held_patch);
        assert_eq!(ring.current().lock().unwrap().patch_size(), 16);
    }
}
