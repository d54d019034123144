//! Template matching module

pub mod matcher;
pub mod store;

pub use matcher::{PreparedFrame, TemplateMatcher};
pub use store::{StoreError, TemplateSet, TemplateStore};

use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

/// What a template stands for on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    /// A landmark inside every record row
    Content,
    /// Marks the first screen of the feed
    StartMarker,
    /// Marks the last screen of the feed
    EndMarker,
}

impl std::fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateKind::Content => write!(f, "content"),
            TemplateKind::StartMarker => write!(f, "start marker"),
            TemplateKind::EndMarker => write!(f, "end marker"),
        }
    }
}

/// Record region relative to the top-left corner of a matched box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRegion {
    pub dx: i32,
    pub dy: i32,
    pub width: u32,
    pub height: u32,
}

impl RecordRegion {
    /// The region for a match drawn `sx` by `sy` times the template's size.
    pub fn scaled(&self, sx: f64, sy: f64) -> Self {
        Self {
            dx: (self.dx as f64 * sx).round() as i32,
            dy: (self.dy as f64 * sy).round() as i32,
            width: ((self.width as f64 * sx).round() as u32).max(1),
            height: ((self.height as f64 * sy).round() as u32).max(1),
        }
    }
}

/// Configuration-side description of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateDescriptor {
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: TemplateKind,
    /// Image file; looked up by name in the store's directories when absent
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Overrides the matcher's default acceptance threshold
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Expected on-screen (width, height); rescales the scale range
    #[serde(default)]
    pub expected_size: Option<(u32, u32)>,
    #[serde(default)]
    pub record_region: Option<RecordRegion>,
}

fn default_kind() -> TemplateKind {
    TemplateKind::Content
}

fn default_enabled() -> bool {
    true
}

impl TemplateDescriptor {
    pub fn new(name: impl Into<String>, kind: TemplateKind) -> Self {
        Self {
            name: name.into(),
            kind,
            path: None,
            threshold: None,
            category: None,
            enabled: true,
            expected_size: None,
            record_region: None,
        }
    }

    pub fn content(name: impl Into<String>) -> Self {
        Self::new(name, TemplateKind::Content)
    }

    pub fn start_marker(name: impl Into<String>) -> Self {
        Self::new(name, TemplateKind::StartMarker)
    }

    pub fn end_marker(name: impl Into<String>) -> Self {
        Self::new(name, TemplateKind::EndMarker)
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_expected_size(mut self, width: u32, height: u32) -> Self {
        self.expected_size = Some((width, height));
        self
    }

    pub fn with_record_region(mut self, dx: i32, dy: i32, width: u32, height: u32) -> Self {
        self.record_region = Some(RecordRegion {
            dx,
            dy,
            width,
            height,
        });
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Scale variants generated for every template, `min..=max` in `step`s.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl Default for ScaleRange {
    fn default() -> Self {
        Self {
            min: 0.8,
            max: 1.2,
            step: 0.05,
        }
    }
}

impl ScaleRange {
    /// A range holding exactly one scale.
    pub fn fixed(scale: f64) -> Self {
        Self {
            min: scale,
            max: scale,
            step: 0.0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.min > 0.0 && self.max >= self.min && (self.step > 0.0 || self.max == self.min)
    }

    /// Every scale in the range, rounded to thousandths.
    pub fn scales(&self) -> Vec<f64> {
        if !self.is_valid() {
            return Vec::new();
        }
        if self.step <= 0.0 {
            return vec![round_scale(self.min)];
        }

        let count = ((self.max - self.min) / self.step + 1e-9).floor() as usize + 1;
        (0..count)
            .map(|i| round_scale(self.min + self.step * i as f64))
            .collect()
    }
}

fn round_scale(scale: f64) -> f64 {
    (scale * 1000.0).round() / 1000.0
}

/// Template matching method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchingMethod {
    /// Correlation coefficient (robust to linear lighting changes, default)
    CCoeffNormed,
    /// Normalized cross-correlation
    CCorrNormed,
    /// Normalized squared difference (inverted: lower is better)
    SqDiffNormed,
}

/// Preprocessing applied to frame and template alike
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreprocessingMethod {
    /// No preprocessing
    None,
    /// Histogram equalization (normalize brightness)
    HistogramEqualization,
    /// Sobel gradient magnitude (edge-based)
    SobelMagnitude,
    /// Canny edges (binary edge matching)
    Canny,
}

/// Parameters for preprocessing methods
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessingParams {
    /// Canny low threshold
    pub canny_low: f32,
    /// Canny high threshold
    pub canny_high: f32,
}

impl Default for PreprocessingParams {
    fn default() -> Self {
        Self {
            canny_low: 50.0,
            canny_high: 150.0,
        }
    }
}

/// Template matching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Acceptance threshold for templates without their own
    pub threshold: f64,
    pub max_candidates_per_template: usize,
    /// IoU above which the weaker of two candidates is suppressed
    pub nms_threshold: f64,
    /// Scaled templates with a side shorter than this are skipped
    pub min_template_side: u32,
    pub matching_method: MatchingMethod,
    pub preprocessing: PreprocessingMethod,
    pub preprocessing_params: PreprocessingParams,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            max_candidates_per_template: 32,
            nms_threshold: 0.5,
            min_template_side: 8,
            matching_method: MatchingMethod::CCoeffNormed,
            preprocessing: PreprocessingMethod::None,
            preprocessing_params: PreprocessingParams::default(),
        }
    }
}

impl MatcherConfig {
    /// Equalized matching for feeds with uneven brightness
    pub fn equalized() -> Self {
        Self {
            threshold: 0.75,
            preprocessing: PreprocessingMethod::HistogramEqualization,
            ..Default::default()
        }
    }

    /// Configuration for edge-based matching
    pub fn edge_matching() -> Self {
        Self {
            threshold: 0.6,
            matching_method: MatchingMethod::CCoeffNormed,
            preprocessing: PreprocessingMethod::SobelMagnitude,
            ..Default::default()
        }
    }

    /// Squared difference, reported as `1 - score`
    pub fn sqdiff() -> Self {
        Self {
            threshold: 0.85,
            matching_method: MatchingMethod::SqDiffNormed,
            ..Default::default()
        }
    }
}

/// Scaled variants of one template, built at most once per scale.
#[derive(Debug, Default)]
struct PyramidCache {
    levels: RwLock<HashMap<u32, Arc<OnceLock<Arc<GrayImage>>>>>,
}

impl PyramidCache {
    fn get_or_build(&self, key: u32, build: impl FnOnce() -> GrayImage) -> Arc<GrayImage> {
        let existing = self
            .levels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();

        let slot = match existing {
            Some(slot) => slot,
            None => self
                .levels
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(key)
                .or_default()
                .clone(),
        };

        slot.get_or_init(|| Arc::new(build())).clone()
    }

    fn len(&self) -> usize {
        self.levels.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn clear(&self) {
        self.levels.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// A loaded template: its descriptor, decoded grayscale image and lazily
/// built scale pyramid. Immutable apart from the pyramid cache.
#[derive(Debug)]
pub struct Template {
    descriptor: TemplateDescriptor,
    image: Arc<GrayImage>,
    pyramid: PyramidCache,
}

impl Template {
    pub fn new(descriptor: TemplateDescriptor, image: GrayImage) -> Self {
        Self::from_shared(descriptor, Arc::new(image))
    }

    pub(crate) fn from_shared(descriptor: TemplateDescriptor, image: Arc<GrayImage>) -> Self {
        Self {
            descriptor,
            image,
            pyramid: PyramidCache::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn kind(&self) -> TemplateKind {
        self.descriptor.kind
    }

    pub fn descriptor(&self) -> &TemplateDescriptor {
        &self.descriptor
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }

    pub(crate) fn shared_image(&self) -> Arc<GrayImage> {
        Arc::clone(&self.image)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Acceptance threshold, falling back to `default`.
    pub fn threshold_or(&self, default: f64) -> f64 {
        self.descriptor.threshold.unwrap_or(default)
    }

    /// Scales to try for this template; an expected-size hint shifts the
    /// whole range by `hint_width / template_width`.
    pub fn effective_scales(&self, range: &ScaleRange) -> Vec<f64> {
        let base = match self.descriptor.expected_size {
            Some((hint_w, _)) if hint_w > 0 && self.image.width() > 0 => {
                hint_w as f64 / self.image.width() as f64
            }
            _ => 1.0,
        };

        range.scales().into_iter().map(|s| round_scale(s * base)).collect()
    }

    /// Template resized by `scale`, cached per scale.
    pub fn scaled(&self, scale: f64) -> Arc<GrayImage> {
        if (scale - 1.0).abs() < f64::EPSILON {
            return self.shared_image();
        }

        let key = (scale * 1000.0).round() as u32;
        self.pyramid.get_or_build(key, || {
            let width = ((self.image.width() as f64 * scale).round() as u32).max(1);
            let height = ((self.image.height() as f64 * scale).round() as u32).max(1);
            log::debug!("building {}x{} variant of '{}' at scale {}", width, height, self.name(), scale);
            image::imageops::resize(
                self.image.as_ref(),
                width,
                height,
                image::imageops::FilterType::Triangle,
            )
        })
    }

    /// Number of cached scale variants.
    pub fn cached_scales(&self) -> usize {
        self.pyramid.len()
    }

    pub(crate) fn invalidate(&self) {
        self.pyramid.clear();
    }
}
