//! Captured frames and the two-entry sliding window

use crate::bbox::BBox;
use image::{DynamicImage, GrayImage, RgbaImage};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

/// One captured screenshot, stamped by the controller.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic capture sequence number, starting at 1
    pub sequence: u64,
    /// Accumulated scroll offset at capture time
    pub scroll_offset: i64,
    pub captured_at: Instant,
    image: RgbaImage,
    gray: GrayImage,
}

impl Frame {
    pub fn new(sequence: u64, scroll_offset: i64, image: RgbaImage) -> Self {
        let gray = DynamicImage::ImageRgba8(image.clone()).to_luma8();
        Self {
            sequence,
            scroll_offset,
            captured_at: Instant::now(),
            image,
            gray,
        }
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn gray(&self) -> &GrayImage {
        &self.gray
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Color crop of `region`; the region must lie inside the frame.
    pub fn crop(&self, region: BBox) -> RgbaImage {
        image::imageops::crop_imm(&self.image, region.x, region.y, region.width, region.height)
            .to_image()
    }

    /// True when both frames hold byte-identical pixels.
    pub fn same_pixels(&self, other: &Frame) -> bool {
        self.gray.dimensions() == other.gray.dimensions() && self.gray.as_raw() == other.gray.as_raw()
    }
}

/// The most recent frames, oldest first; used for stall detection and for
/// the final pass.
#[derive(Debug, Clone)]
pub struct FrameWindow {
    frames: VecDeque<Arc<Frame>>,
    capacity: usize,
}

impl FrameWindow {
    pub fn new() -> Self {
        Self::with_capacity(2)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, frame: Arc<Frame>) {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    pub fn latest(&self) -> Option<&Arc<Frame>> {
        self.frames.back()
    }

    pub fn previous(&self) -> Option<&Arc<Frame>> {
        self.frames.len().checked_sub(2).and_then(|i| self.frames.get(i))
    }

    /// True when the two most recent frames are pixel-identical, i.e. the
    /// last scroll did not move the feed.
    pub fn is_stalled(&self) -> bool {
        match (self.previous(), self.latest()) {
            (Some(prev), Some(last)) => prev.same_pixels(last),
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

impl Default for FrameWindow {
    fn default() -> Self {
        Self::new()
    }
}
