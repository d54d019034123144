//! Synthetic feed shared by the integration tests.
//!
//! Icons and markers are seeded noise, so they correlate with nothing but
//! themselves. Each record is an icon followed by a name strip of eight
//! 16 px blocks whose bright/dark pattern comes from a distance-4 code, so
//! different records never hash alike.
#![allow(dead_code)]

use image::{GrayImage, Luma, RgbaImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use scrollscan_cv::session::{
    CaptureError, CollectingSink, RetryPolicy, ScrollConfig, ScrollDirection,
};
use scrollscan_cv::traits::FrameSource;
use scrollscan_cv::{
    CancellationFlag, ScaleRange, ScrollController, SessionConfig, SessionResult,
    TemplateDescriptor, TemplateStore,
};
use std::sync::Arc;

pub const FRAME_WIDTH: u32 = 240;
pub const FRAME_HEIGHT: u32 = 200;
pub const BACKGROUND: u8 = 60;

/// Feed y of the first record and the distance between records
pub const FIRST_ROW: i64 = 40;
pub const ROW_PITCH: i64 = 40;

pub const ICON_X: i64 = 8;
pub const ICON_SIDE: u32 = 16;

pub fn noise(seed: u64, width: u32, height: u32) -> GrayImage {
    let mut rng = StdRng::seed_from_u64(seed);
    GrayImage::from_fn(width, height, |_, _| Luma([rng.gen_range(0..=255u8)]))
}

pub fn start_marker() -> GrayImage {
    noise(101, 24, 24)
}

pub fn end_marker() -> GrayImage {
    noise(202, 24, 24)
}

pub fn row_icon() -> GrayImage {
    noise(303, ICON_SIDE, ICON_SIDE)
}

pub fn start_descriptor() -> TemplateDescriptor {
    TemplateDescriptor::start_marker("feed_top")
}

pub fn end_descriptor() -> TemplateDescriptor {
    TemplateDescriptor::end_marker("feed_bottom")
}

/// Icon plus the name strip, with 4 px of background above and below
pub fn row_descriptor() -> TemplateDescriptor {
    TemplateDescriptor::content("row")
        .with_category("message")
        .with_record_region(0, -4, 144, 24)
}

/// Extended Hamming codeword `i` (never all-dark or all-bright)
pub fn code(i: usize) -> u8 {
    let d = (i % 14 + 1) as u8;
    let bit = |n: u8| (d >> n) & 1;
    let (d1, d2, d3, d4) = (bit(0), bit(1), bit(2), bit(3));
    let seven = d1
        | d2 << 1
        | d3 << 2
        | d4 << 3
        | (d1 ^ d2 ^ d4) << 4
        | (d1 ^ d3 ^ d4) << 5
        | (d2 ^ d3 ^ d4) << 6;
    seven | ((seven.count_ones() & 1) as u8) << 7
}

/// Read the code back from a record crop made with [`row_descriptor`].
pub fn decode_crop(crop: &RgbaImage) -> u8 {
    (0..8).fold(0u8, |acc, b| {
        let x = ICON_SIDE + 16 * b + 8;
        let bright = crop.get_pixel(x, 6)[0] > 128;
        acc | (bright as u8) << (7 - b)
    })
}

#[derive(Debug, Clone, Default)]
pub struct Scene {
    pub start: bool,
    pub end: bool,
    /// Icon y in frame coordinates and the record's code
    pub rows: Vec<(i64, u8)>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_start(mut self) -> Self {
        self.start = true;
        self
    }

    pub fn with_end(mut self) -> Self {
        self.end = true;
        self
    }

    pub fn row(mut self, y: i64, code: u8) -> Self {
        self.rows.push((y, code));
        self
    }

    pub fn render(&self) -> RgbaImage {
        let mut canvas = GrayImage::from_pixel(FRAME_WIDTH, FRAME_HEIGHT, Luma([BACKGROUND]));

        if self.start {
            blit(&mut canvas, &start_marker(), 208, 4);
        }
        if self.end {
            blit(&mut canvas, &end_marker(), 208, 172);
        }
        for &(y, code) in &self.rows {
            draw_row(&mut canvas, y, code);
        }

        image::DynamicImage::ImageLuma8(canvas).to_rgba8()
    }
}

fn blit(canvas: &mut GrayImage, image: &GrayImage, x: i64, y: i64) {
    for (ix, iy, pixel) in image.enumerate_pixels() {
        let (cx, cy) = (x + ix as i64, y + iy as i64);
        if cx >= 0 && cy >= 0 && cx < canvas.width() as i64 && cy < canvas.height() as i64 {
            canvas.put_pixel(cx as u32, cy as u32, *pixel);
        }
    }
}

fn draw_row(canvas: &mut GrayImage, y: i64, code: u8) {
    draw_row_with(canvas, &row_icon(), ICON_X, y, code);
}

/// Icon followed by the name strip; blocks are as wide as the icon is
/// tall. Top half shows the code, bottom half its complement.
fn draw_row_with(canvas: &mut GrayImage, icon: &GrayImage, x: i64, y: i64, code: u8) {
    blit(canvas, icon, x, y);

    let side = icon.height();
    for b in 0..8u32 {
        let set = code >> (7 - b) & 1 == 1;
        let shade = |on: bool| Luma([if on { 230 } else { 20 }]);
        let block = GrayImage::from_fn(side, side, |_, by| shade(if by < side / 2 { set } else { !set }));
        blit(canvas, &block, x + icon.width() as i64 + (side * b) as i64, y);
    }
}

/// `image` resized the way the matcher resizes a template for `scale`.
pub fn resized(image: &GrayImage, scale: f64) -> GrayImage {
    let width = ((image.width() as f64 * scale).round() as u32).max(1);
    let height = ((image.height() as f64 * scale).round() as u32).max(1);
    image::imageops::resize(image, width, height, image::imageops::FilterType::Triangle)
}

/// Feed coordinate `v` on a feed drawn `scale` times larger.
pub fn scaled(v: i64, scale: f64) -> i64 {
    (v as f64 * scale).round() as i64
}

/// [`feed_frame`] on a feed drawn `scale` times larger; `offset` is in
/// screen pixels.
pub fn scaled_feed_frame(rows: usize, offset: i64, scale: f64) -> RgbaImage {
    let mut canvas = GrayImage::from_pixel(FRAME_WIDTH, FRAME_HEIGHT, Luma([BACKGROUND]));
    if offset == 0 {
        blit(&mut canvas, &resized(&start_marker(), scale), 208, 4);
    }

    let icon = resized(&row_icon(), scale);
    for i in 0..rows {
        let y = scaled(FIRST_ROW + ROW_PITCH * i as i64, scale) - offset;
        draw_row_with(&mut canvas, &icon, scaled(ICON_X, scale), y, code(i));
    }

    image::DynamicImage::ImageLuma8(canvas).to_rgba8()
}

/// A long feed of `rows` records seen through the frame at `offset`.
pub fn feed_frame(rows: usize, offset: i64) -> RgbaImage {
    let mut scene = Scene::new();
    scene.start = offset == 0;
    for i in 0..rows {
        scene.rows.push((FIRST_ROW + ROW_PITCH * i as i64 - offset, code(i)));
    }
    scene.render()
}

pub fn blank() -> RgbaImage {
    Scene::new().render()
}

/// Capture primitive replaying prepared frames, one per scroll, with
/// scripted failures.
pub struct ScriptedSource {
    frames: Vec<RgbaImage>,
    position: usize,
    /// Capture calls so far (failed ones included)
    pub captures: usize,
    /// Amounts of accepted scrolls
    pub scrolls: Vec<u32>,
    /// 1-based capture calls that fail
    pub fail_captures: Vec<usize>,
    /// Every capture call from this one on fails
    pub fail_from: Option<usize>,
    pub reject_scrolls: bool,
    /// Raise the flag once this many captures have been made
    pub cancel_after: Option<(usize, CancellationFlag)>,
}

impl ScriptedSource {
    pub fn new(frames: Vec<RgbaImage>) -> Self {
        Self {
            frames,
            position: 0,
            captures: 0,
            scrolls: Vec::new(),
            fail_captures: Vec::new(),
            fail_from: None,
            reject_scrolls: false,
            cancel_after: None,
        }
    }
}

impl FrameSource for ScriptedSource {
    fn capture_frame(&mut self) -> Result<RgbaImage, CaptureError> {
        self.captures += 1;
        let call = self.captures;

        if let Some((after, flag)) = &self.cancel_after {
            if call >= *after {
                flag.cancel();
            }
        }

        if self.fail_captures.contains(&call) || self.fail_from.is_some_and(|from| call >= from) {
            return Err(CaptureError::NoImage);
        }

        self.frames
            .get(self.position)
            .cloned()
            .ok_or_else(|| CaptureError::Primitive("script ran out of frames".to_string()))
    }

    fn scroll(&mut self, amount: u32, _direction: ScrollDirection) -> bool {
        if self.reject_scrolls {
            return false;
        }
        self.scrolls.push(amount);
        if self.position + 1 < self.frames.len() {
            self.position += 1;
        }
        true
    }
}

pub fn store() -> Arc<TemplateStore> {
    let store = TemplateStore::new();
    store.insert(start_descriptor(), start_marker());
    store.insert(end_descriptor(), end_marker());
    store.insert(row_descriptor(), row_icon());
    Arc::new(store)
}

/// Fast settings for synthetic frames: one scale, no settling, tiny backoff
pub fn config() -> SessionConfig {
    SessionConfig {
        templates: vec![start_descriptor(), end_descriptor(), row_descriptor()],
        scales: ScaleRange::fixed(1.0),
        scroll: ScrollConfig {
            step: 60,
            min_step: 10,
            settle_ms: 0,
            ..Default::default()
        },
        retry: RetryPolicy {
            retry_backoff_ms: 1,
            max_backoff_ms: 4,
            ..Default::default()
        },
        halt_patience: 3,
        max_start_attempts: 3,
        match_pool_size: 2,
        ..Default::default()
    }
}

/// Run one session to completion with a collecting sink.
pub fn run(config: SessionConfig, source: ScriptedSource) -> (SessionResult, ScriptedSource, CollectingSink) {
    let mut controller = ScrollController::new(config, store(), source, CollectingSink::new())
        .expect("valid test configuration");
    let result = controller.run();
    let (source, sink) = controller.into_parts();
    (result, source, sink)
}
