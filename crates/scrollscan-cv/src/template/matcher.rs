//! Multi-scale template matching built on imageproc
//!
//! `CCoeffNormed` is the zero-mean normalized correlation: imageproc supplies
//! the raw cross-correlation, window sums come from integral images.

use super::{MatcherConfig, MatchingMethod, PreprocessingMethod, ScaleRange, Template};
use crate::bbox::{BBox, CandidateSet, MatchCandidate};
use image::{GrayImage, ImageBuffer, Luma};
use imageproc::integral_image::{integral_image, integral_squared_image};
use imageproc::template_matching::{match_template, MatchTemplateMethod};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

type ScoreMap = ImageBuffer<Luma<f32>, Vec<f32>>;
type IntegralMap = ImageBuffer<Luma<u64>, Vec<u64>>;

/// Variance below this (summed over the window) is treated as flat.
const FLAT_VARIANCE: f64 = 1e-6;

/// Errors raised by the matcher; all of them point at configuration
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("template '{name}' has no contrast at scale {scale} and cannot be correlated")]
    DegenerateTemplate { name: String, scale: f64 },
    #[error("matching exceeded its {limit_ms} ms deadline")]
    Timeout { limit_ms: u64 },
    #[error("failed to build matcher thread pool: {0}")]
    Pool(String),
}

/// Cooperative deadline checked between scales and templates.
#[derive(Debug, Clone, Copy)]
pub struct MatchDeadline {
    started: Instant,
    limit: Option<Duration>,
}

impl MatchDeadline {
    pub fn new(limit: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    pub fn check(&self) -> Result<(), MatchError> {
        match self.limit {
            Some(limit) if self.started.elapsed() >= limit => Err(MatchError::Timeout {
                limit_ms: limit.as_millis() as u64,
            }),
            _ => Ok(()),
        }
    }
}

/// A frame (or a sub-area of it) ready for matching: preprocessed once and
/// shared read-only by every template.
#[derive(Debug)]
pub struct PreparedFrame {
    image: GrayImage,
    sums: Option<(IntegralMap, IntegralMap)>,
    offset: (u32, u32),
}

impl PreparedFrame {
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Top-left of the matched area in full-frame coordinates.
    pub fn offset(&self) -> (u32, u32) {
        self.offset
    }
}

/// Template matcher with optional preprocessing and a dedicated worker pool
pub struct TemplateMatcher {
    config: MatcherConfig,
    #[cfg(feature = "parallel")]
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl std::fmt::Debug for TemplateMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateMatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TemplateMatcher {
    /// Create new template matcher running on the global pool
    pub fn new(config: MatcherConfig) -> Self {
        Self {
            config,
            #[cfg(feature = "parallel")]
            pool: None,
        }
    }

    /// Create a matcher whose per-template work runs on `pool_size` threads.
    pub fn with_pool_size(config: MatcherConfig, pool_size: usize) -> Result<Self, MatchError> {
        #[cfg(feature = "parallel")]
        {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(pool_size)
                .thread_name(|i| format!("scrollscan-match-{}", i))
                .build()
                .map_err(|e| MatchError::Pool(e.to_string()))?;

            Ok(Self {
                config,
                pool: Some(Arc::new(pool)),
            })
        }

        #[cfg(not(feature = "parallel"))]
        {
            let _ = pool_size;
            Ok(Self::new(config))
        }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Preprocess a grayscale frame, restricted to `area` when given.
    pub fn prepare(&self, frame: &GrayImage, area: Option<BBox>) -> PreparedFrame {
        let (fw, fh) = frame.dimensions();
        let area = area.and_then(|a| {
            let right = a.right().min(fw);
            let bottom = a.bottom().min(fh);
            (right > a.x && bottom > a.y).then(|| BBox::new(a.x, a.y, right - a.x, bottom - a.y))
        });

        let (cropped, offset) = match area {
            Some(a) => (
                Cow::Owned(image::imageops::crop_imm(frame, a.x, a.y, a.width, a.height).to_image()),
                (a.x, a.y),
            ),
            None => (Cow::Borrowed(frame), (0, 0)),
        };

        let image = self.preprocess(&cropped).into_owned();
        let sums = match self.config.matching_method {
            MatchingMethod::CCoeffNormed => Some((
                integral_image::<_, u64>(&image),
                integral_squared_image::<_, u64>(&image),
            )),
            _ => None,
        };

        PreparedFrame {
            image,
            sums,
            offset,
        }
    }

    /// Match one template over every scale of `scales`.
    ///
    /// Returns candidates at or above `min_confidence`, highest first, with
    /// overlaps beyond the configured IoU suppressed across scales. An empty
    /// set is a normal outcome.
    pub fn match_template(
        &self,
        frame: &PreparedFrame,
        template: &Template,
        scales: &ScaleRange,
        min_confidence: f64,
        deadline: &MatchDeadline,
    ) -> Result<CandidateSet, MatchError> {
        let (fw, fh) = frame.dimensions();
        let mut all_matches = CandidateSet::new();

        for scale in template.effective_scales(scales) {
            deadline.check()?;

            let scaled = template.scaled(scale);
            let (tw, th) = scaled.dimensions();
            if tw < self.config.min_template_side || th < self.config.min_template_side {
                log::debug!("'{}' at scale {} is too small ({}x{}), skipped", template.name(), scale, tw, th);
                continue;
            }
            if tw > fw || th > fh {
                log::debug!("'{}' at scale {} is larger than the frame, skipped", template.name(), scale);
                continue;
            }

            let processed = self.preprocess(&scaled);
            let scores = self.score_map(frame, &processed).ok_or_else(|| {
                MatchError::DegenerateTemplate {
                    name: template.name().to_string(),
                    scale,
                }
            })?;

            for (x, y, confidence) in local_maxima(&scores, min_confidence) {
                all_matches.push(MatchCandidate::new(
                    template.name(),
                    template.kind(),
                    BBox::new(x, y, tw, th),
                    scale,
                    confidence,
                ));
            }
        }

        let (dx, dy) = frame.offset;
        let mut limited: Vec<MatchCandidate> = all_matches
            .filter_by_confidence(min_confidence)
            .apply_nms(self.config.nms_threshold)
            .into_iter()
            .map(|mut c| {
                c.bbox = c.bbox.translate(dx, dy);
                c
            })
            .collect();
        limited.truncate(self.config.max_candidates_per_template);

        Ok(CandidateSet::from_vec(limited))
    }

    /// Match several templates independently against the same frame.
    ///
    /// Each template uses its own threshold, falling back to the configured
    /// one. Results line up with `templates`.
    pub fn match_all(
        &self,
        frame: &PreparedFrame,
        templates: &[Arc<Template>],
        scales: &ScaleRange,
        deadline: &MatchDeadline,
    ) -> Result<Vec<CandidateSet>, MatchError> {
        let run_one = |template: &Arc<Template>| {
            deadline.check()?;
            let threshold = template.threshold_or(self.config.threshold);
            self.match_template(frame, template, scales, threshold, deadline)
        };

        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            let run = || {
                templates
                    .par_iter()
                    .map(run_one)
                    .collect::<Result<Vec<_>, MatchError>>()
            };

            match &self.pool {
                Some(pool) => pool.install(run),
                None => run(),
            }
        }

        #[cfg(not(feature = "parallel"))]
        {
            templates.iter().map(run_one).collect()
        }
    }

    /// Preprocess image based on configuration
    fn preprocess<'a>(&self, image: &'a GrayImage) -> Cow<'a, GrayImage> {
        match self.config.preprocessing {
            PreprocessingMethod::None => Cow::Borrowed(image),
            PreprocessingMethod::HistogramEqualization => {
                Cow::Owned(imageproc::contrast::equalize_histogram(image))
            }
            PreprocessingMethod::SobelMagnitude => {
                let gradients = imageproc::gradients::sobel_gradients(image);
                Cow::Owned(GrayImage::from_fn(image.width(), image.height(), |x, y| {
                    Luma([gradients.get_pixel(x, y)[0].min(255) as u8])
                }))
            }
            PreprocessingMethod::Canny => {
                let params = &self.config.preprocessing_params;
                Cow::Owned(imageproc::edges::canny(image, params.canny_low, params.canny_high))
            }
        }
    }

    /// Per-position scores, higher is better. `None` when the template has
    /// nothing to correlate.
    fn score_map(&self, frame: &PreparedFrame, template: &GrayImage) -> Option<ScoreMap> {
        match self.config.matching_method {
            MatchingMethod::CCoeffNormed => ccoeff_normed(frame, template),
            MatchingMethod::CCorrNormed => {
                if template.pixels().all(|p| p[0] == 0) {
                    return None;
                }
                let mut scores = match_template(
                    &frame.image,
                    template,
                    MatchTemplateMethod::CrossCorrelationNormalized,
                );
                scores.pixels_mut().for_each(|p| p[0] = sanitize(p[0]));
                Some(scores)
            }
            MatchingMethod::SqDiffNormed => {
                if template.pixels().all(|p| p[0] == 0) {
                    return None;
                }
                let mut scores = match_template(
                    &frame.image,
                    template,
                    MatchTemplateMethod::SumOfSquaredErrorsNormalized,
                );
                scores
                    .pixels_mut()
                    .for_each(|p| p[0] = sanitize(1.0 - p[0]).clamp(0.0, 1.0));
                Some(scores)
            }
        }
    }
}

impl Default for TemplateMatcher {
    fn default() -> Self {
        Self::new(MatcherConfig::default())
    }
}

fn sanitize(value: f32) -> f32 {
    if value.is_finite() { value } else { 0.0 }
}

/// Zero-mean normalized correlation:
/// `(ΣIT - ΣI·ΣT/n) / sqrt((ΣI² - (ΣI)²/n) · (ΣT² - (ΣT)²/n))`.
fn ccoeff_normed(frame: &PreparedFrame, template: &GrayImage) -> Option<ScoreMap> {
    let (tw, th) = template.dimensions();
    let n = (tw * th) as f64;

    let (t_sum, t_sq) = template.pixels().fold((0.0f64, 0.0f64), |(s, sq), p| {
        let v = p[0] as f64;
        (s + v, sq + v * v)
    });
    let t_var = t_sq - t_sum * t_sum / n;
    if t_var <= FLAT_VARIANCE {
        return None;
    }

    let (sum, sq_sum) = match &frame.sums {
        Some((sum, sq)) => (Cow::Borrowed(sum), Cow::Borrowed(sq)),
        None => (
            Cow::Owned(integral_image::<_, u64>(&frame.image)),
            Cow::Owned(integral_squared_image::<_, u64>(&frame.image)),
        ),
    };

    let mut scores = match_template(&frame.image, template, MatchTemplateMethod::CrossCorrelation);
    let t_mean = t_sum / n;

    for (x, y, score) in scores.enumerate_pixels_mut() {
        let i_sum = window_sum(&sum, x, y, tw, th) as f64;
        let i_sq = window_sum(&sq_sum, x, y, tw, th) as f64;
        let i_var = i_sq - i_sum * i_sum / n;

        score[0] = if i_var <= FLAT_VARIANCE {
            0.0
        } else {
            let numerator = score[0] as f64 - i_sum * t_mean;
            sanitize((numerator / (i_var * t_var).sqrt()).clamp(-1.0, 1.0) as f32)
        };
    }

    Some(scores)
}

/// Sum of the `w`x`h` window at (x, y) from an integral image.
fn window_sum(integral: &IntegralMap, x: u32, y: u32, w: u32, h: u32) -> u64 {
    let top_left = integral.get_pixel(x, y)[0];
    let top_right = integral.get_pixel(x + w, y)[0];
    let bottom_left = integral.get_pixel(x, y + h)[0];
    let bottom_right = integral.get_pixel(x + w, y + h)[0];
    bottom_right + top_left - top_right - bottom_left
}

/// Positions scoring at least `min_confidence` that dominate their 3x3
/// neighbourhood. Plateaus keep their first position in raster order.
fn local_maxima(scores: &ScoreMap, min_confidence: f64) -> Vec<(u32, u32, f64)> {
    let (w, h) = scores.dimensions();
    let mut peaks = Vec::new();

    for y in 0..h {
        for x in 0..w {
            let value = scores.get_pixel(x, y)[0];
            if (value as f64) < min_confidence {
                continue;
            }

            let mut is_peak = true;
            'neighbours: for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                    if (nx, ny) == (x, y) {
                        continue;
                    }
                    let other = scores.get_pixel(nx, ny)[0];
                    let earlier = (ny, nx) < (y, x);
                    if other > value || (earlier && other == value) {
                        is_peak = false;
                        break 'neighbours;
                    }
                }
            }

            if is_peak {
                peaks.push((x, y, value as f64));
            }
        }
    }

    peaks
}
