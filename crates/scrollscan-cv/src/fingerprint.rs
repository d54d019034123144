//! Content fingerprints and the emitted-record set
//!
//! A fingerprint is a perceptual hash of a record region, so the same record
//! seen in two overlapping frames hashes equal within a Hamming tolerance
//! even when the crops are misaligned by a pixel or two.

use crate::bbox::BBox;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};
use image_hasher::{HashAlg, Hasher, HasherConfig};
use serde::{Deserialize, Serialize};

/// Hash algorithm used for fingerprints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FingerprintAlgorithm {
    /// Cell brightness against the mean; the most jitter tolerant
    Mean,
    Gradient,
    DoubleGradient,
    Blockhash,
}

impl FingerprintAlgorithm {
    fn hash_alg(self) -> HashAlg {
        match self {
            FingerprintAlgorithm::Mean => HashAlg::Mean,
            FingerprintAlgorithm::Gradient => HashAlg::Gradient,
            FingerprintAlgorithm::DoubleGradient => HashAlg::DoubleGradient,
            FingerprintAlgorithm::Blockhash => HashAlg::Blockhash,
        }
    }
}

/// Fingerprint settings.
///
/// `tolerance` is the largest Hamming distance at which two fingerprints
/// still denote the same record. The default (12 of 256 bits) absorbs
/// 1-2 px of alignment jitter on row-sized regions while one changed glyph
/// block still moves the hash by more.
///
/// `position_tolerance` bounds, in pixels along the scroll axis, how far
/// apart two sightings of the same record may sit in the feed. Records that
/// look alike but sit further apart are different records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    pub algorithm: FingerprintAlgorithm,
    pub hash_width: u32,
    pub hash_height: u32,
    pub tolerance: u32,
    pub position_tolerance: u32,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            algorithm: FingerprintAlgorithm::Mean,
            hash_width: 16,
            hash_height: 16,
            tolerance: 12,
            position_tolerance: 8,
        }
    }
}

/// Content-derived identifier of a record region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentFingerprint {
    bits: Vec<u8>,
    encoded: String,
}

impl ContentFingerprint {
    /// Number of differing bits; `u32::MAX` for hashes of different sizes.
    pub fn distance(&self, other: &ContentFingerprint) -> u32 {
        if self.bits.len() != other.bits.len() {
            return u32::MAX;
        }
        self.bits
            .iter()
            .zip(&other.bits)
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }

    pub fn matches(&self, other: &ContentFingerprint, tolerance: u32) -> bool {
        self.distance(other) <= tolerance
    }

    /// Base64 form, stable across runs.
    pub fn as_str(&self) -> &str {
        &self.encoded
    }
}

impl std::fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encoded)
    }
}

/// Computes fingerprints of frame regions.
pub struct Fingerprinter {
    hasher: Hasher,
    config: FingerprintConfig,
}

impl std::fmt::Debug for Fingerprinter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fingerprinter").field("config", &self.config).finish()
    }
}

impl Fingerprinter {
    pub fn new(config: FingerprintConfig) -> Self {
        let hasher = HasherConfig::new()
            .hash_alg(config.algorithm.hash_alg())
            .hash_size(config.hash_width, config.hash_height)
            .resize_filter(FilterType::Triangle)
            .to_hasher();
        Self { hasher, config }
    }

    pub fn tolerance(&self) -> u32 {
        self.config.tolerance
    }

    /// Fingerprint of `region` within a grayscale frame. Deterministic in the
    /// pixel content; the region is clamped to the frame.
    pub fn fingerprint(&self, frame: &GrayImage, region: BBox) -> ContentFingerprint {
        let x = region.x.min(frame.width().saturating_sub(1));
        let y = region.y.min(frame.height().saturating_sub(1));
        let width = region.width.min(frame.width() - x).max(1);
        let height = region.height.min(frame.height() - y).max(1);

        let crop = image::imageops::crop_imm(frame, x, y, width, height).to_image();
        self.fingerprint_image(crop)
    }

    pub fn fingerprint_image(&self, image: GrayImage) -> ContentFingerprint {
        let hash = self.hasher.hash_image(&DynamicImage::ImageLuma8(image));
        ContentFingerprint {
            bits: hash.as_bytes().to_vec(),
            encoded: hash.to_base64(),
        }
    }
}

/// An emitted record: what it looked like and where it sits in the feed.
#[derive(Debug, Clone)]
struct EmittedKey {
    fingerprint: ContentFingerprint,
    position: i64,
}

/// Tracks records already surfaced downstream within one session.
///
/// A record is identified by its fingerprint together with its feed
/// position (scroll offset plus the region's coordinate along the scroll
/// axis), so identical-looking rows further down the feed stay distinct.
#[derive(Debug, Clone, Default)]
pub struct Deduplicator {
    emitted: Vec<EmittedKey>,
    tolerance: u32,
    position_tolerance: u32,
}

impl Deduplicator {
    pub fn new(tolerance: u32, position_tolerance: u32) -> Self {
        Self {
            emitted: Vec::new(),
            tolerance,
            position_tolerance,
        }
    }

    pub fn from_config(config: &FingerprintConfig) -> Self {
        Self::new(config.tolerance, config.position_tolerance)
    }

    /// True when no emitted record lies within both tolerances. Read-only.
    pub fn is_new(&self, fingerprint: &ContentFingerprint, position: i64) -> bool {
        !self.emitted.iter().any(|seen| {
            seen.fingerprint.matches(fingerprint, self.tolerance)
                && (seen.position - position).abs() <= self.position_tolerance as i64
        })
    }

    pub fn mark_emitted(&mut self, fingerprint: ContentFingerprint, position: i64) {
        self.emitted.push(EmittedKey {
            fingerprint,
            position,
        });
    }

    /// Feed offset that lines `sightings` up with emitted records.
    ///
    /// A sighting is a fingerprint and its coordinate within the frame. Each
    /// emitted record it resembles votes for the offset that would put the
    /// two at the same feed position; the offset backed by most votes wins,
    /// ties going to the one nearest `expected`. `None` when nothing in the
    /// frame resembles an emitted record.
    pub fn align(&self, sightings: &[(&ContentFingerprint, i64)], expected: i64) -> Option<i64> {
        let emitted = &self.emitted;
        let tolerance = self.tolerance;
        let votes: Vec<i64> = sightings
            .iter()
            .flat_map(move |&(fingerprint, coordinate)| {
                emitted
                    .iter()
                    .filter(move |seen| seen.fingerprint.matches(fingerprint, tolerance))
                    .map(move |seen| seen.position - coordinate)
            })
            .collect();

        let window = self.position_tolerance as i64;
        let support = |offset: i64| votes.iter().filter(|&&v| (v - offset).abs() <= window).count();

        votes.iter().copied().max_by(|&a, &b| {
            support(a)
                .cmp(&support(b))
                .then_with(|| (b - expected).abs().cmp(&(a - expected).abs()))
        })
    }

    pub fn len(&self) -> usize {
        self.emitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.emitted.is_empty()
    }

    /// Forget everything; called at session start.
    pub fn clear(&mut self) {
        self.emitted.clear();
    }
}
