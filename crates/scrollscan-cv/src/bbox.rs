//! Bounding regions, match candidates and non-maximum suppression
//!
//! Core abstraction for representing where a template matched a frame.

use crate::template::TemplateKind;
use serde::{Deserialize, Serialize};

/// Axis-aligned region in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BBox {
    /// Create a new bounding box
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    /// Calculate area of the bounding box
    pub fn area(&self) -> f64 {
        self.width as f64 * self.height as f64
    }

    /// Calculate intersection over union (IoU) with another box
    pub fn iou(&self, other: &BBox) -> f64 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) as f64 * (y2 - y1) as f64;
        let union = self.area() + other.area() - intersection;

        if union <= 0.0 { 0.0 } else { intersection / union }
    }

    /// Check if this box overlaps with another beyond `threshold`
    pub fn overlaps(&self, other: &BBox, threshold: f64) -> bool {
        self.iou(other) > threshold
    }

    /// True when the box lies fully inside a `width` x `height` frame.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.width > 0 && self.height > 0 && self.right() <= width && self.bottom() <= height
    }

    /// Shift by a non-negative offset (e.g. from a sub-area back to the full frame).
    pub fn translate(&self, dx: u32, dy: u32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    /// Region placed relative to this box's top-left corner.
    ///
    /// Returns the region clipped to the frame together with the frame
    /// edges that cut it. `None` when nothing of it is visible.
    pub fn relative_region(
        &self,
        dx: i64,
        dy: i64,
        width: u32,
        height: u32,
        frame_width: u32,
        frame_height: u32,
    ) -> Option<(BBox, ClippedEdges)> {
        let left = self.x as i64 + dx;
        let top = self.y as i64 + dy;
        let right = left + width as i64;
        let bottom = top + height as i64;

        let cl = left.max(0);
        let ct = top.max(0);
        let cr = right.min(frame_width as i64);
        let cb = bottom.min(frame_height as i64);

        if cr <= cl || cb <= ct {
            return None;
        }

        let edges = ClippedEdges {
            left: cl != left,
            top: ct != top,
            right: cr != right,
            bottom: cb != bottom,
        };
        let region = BBox::new(cl as u32, ct as u32, (cr - cl) as u32, (cb - ct) as u32);
        Some((region, edges))
    }
}

/// Frame edges that cut a region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClippedEdges {
    pub left: bool,
    pub top: bool,
    pub right: bool,
    pub bottom: bool,
}

impl ClippedEdges {
    pub fn any(&self) -> bool {
        self.left || self.top || self.right || self.bottom
    }
}

/// A proposed location where a template matches a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub template: String,
    pub kind: TemplateKind,
    pub bbox: BBox,
    pub scale: f64,
    pub confidence: f64,
}

impl MatchCandidate {
    pub fn new(template: impl Into<String>, kind: TemplateKind, bbox: BBox, scale: f64, confidence: f64) -> Self {
        Self {
            template: template.into(),
            kind,
            bbox,
            scale,
            confidence,
        }
    }
}

/// Collection of candidates with batch operations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandidateSet {
    candidates: Vec<MatchCandidate>,
}

impl CandidateSet {
    /// Create new empty collection
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(candidates: Vec<MatchCandidate>) -> Self {
        Self { candidates }
    }

    pub fn push(&mut self, candidate: MatchCandidate) {
        self.candidates.push(candidate);
    }

    pub fn extend(&mut self, other: CandidateSet) {
        self.candidates.extend(other.candidates);
    }

    pub fn as_slice(&self) -> &[MatchCandidate] {
        &self.candidates
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Sort by confidence (descending)
    pub fn sort_by_confidence(&mut self) {
        self.candidates
            .sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    }

    /// Sort in reading order: top-to-bottom, then left-to-right
    pub fn sort_by_position(&mut self) {
        self.candidates
            .sort_by_key(|c| (c.bbox.y, c.bbox.x));
    }

    /// Filter by confidence threshold
    pub fn filter_by_confidence(mut self, threshold: f64) -> Self {
        self.candidates.retain(|c| c.confidence >= threshold);
        self
    }

    /// Apply non-maximum suppression
    ///
    /// Greedy: keeps the most confident candidate and drops every remaining
    /// one whose IoU with it exceeds `threshold`. No two survivors overlap
    /// beyond `threshold`.
    pub fn apply_nms(mut self, threshold: f64) -> Self {
        if self.candidates.is_empty() {
            return self;
        }

        self.sort_by_confidence();

        let mut keep: Vec<MatchCandidate> = Vec::new();
        let mut suppressed = vec![false; self.candidates.len()];

        for i in 0..self.candidates.len() {
            if suppressed[i] {
                continue;
            }

            keep.push(self.candidates[i].clone());

            for j in (i + 1)..self.candidates.len() {
                if !suppressed[j]
                    && self.candidates[i]
                        .bbox
                        .overlaps(&self.candidates[j].bbox, threshold)
                {
                    suppressed[j] = true;
                }
            }
        }

        Self::from_vec(keep)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MatchCandidate> {
        self.candidates.iter()
    }
}

impl IntoIterator for CandidateSet {
    type Item = MatchCandidate;
    type IntoIter = std::vec::IntoIter<MatchCandidate>;

    fn into_iter(self) -> Self::IntoIter {
        self.candidates.into_iter()
    }
}

impl FromIterator<MatchCandidate> for CandidateSet {
    fn from_iter<T: IntoIterator<Item = MatchCandidate>>(iter: T) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str, x: u32, y: u32, confidence: f64) -> MatchCandidate {
        MatchCandidate::new(name, TemplateKind::Content, BBox::new(x, y, 10, 10), 1.0, confidence)
    }

    #[test]
    fn test_bbox_iou() {
        let box1 = BBox::new(0, 0, 10, 10);
        let box2 = BBox::new(5, 5, 10, 10);

        let iou = box1.iou(&box2);
        assert!(iou > 0.0 && iou < 1.0);
        assert_eq!(box1.iou(&BBox::new(20, 20, 5, 5)), 0.0);
        assert_eq!(box1.iou(&box1), 1.0);
    }

    #[test]
    fn test_nms() {
        let mut set = CandidateSet::new();
        set.push(candidate("A", 0, 0, 0.9));
        set.push(candidate("A", 2, 2, 0.8));
        set.push(candidate("B", 20, 20, 0.7));

        let result = set.apply_nms(0.5);
        assert_eq!(result.len(), 2);
        assert_eq!(result.as_slice()[0].confidence, 0.9);
    }

    #[test]
    fn test_relative_region_clipping() {
        let anchor = BBox::new(10, 90, 10, 10);

        let (inside, edges) = anchor.relative_region(0, 0, 10, 10, 100, 100).unwrap();
        assert_eq!(inside, anchor);
        assert!(!edges.any());

        let (cut, edges) = anchor.relative_region(-5, 0, 40, 20, 100, 100).unwrap();
        assert_eq!(cut, BBox::new(5, 90, 40, 10));
        assert_eq!(
            edges,
            ClippedEdges {
                bottom: true,
                ..Default::default()
            }
        );

        let (_, edges) = anchor.relative_region(-20, -95, 20, 20, 100, 100).unwrap();
        assert!(edges.left && edges.top && !edges.right && !edges.bottom);

        assert!(anchor.relative_region(200, 0, 5, 5, 100, 100).is_none());
    }

    #[test]
    fn test_sort_by_position() {
        let mut set = CandidateSet::from_vec(vec![
            candidate("A", 50, 40, 0.9),
            candidate("A", 0, 40, 0.9),
            candidate("A", 90, 10, 0.9),
        ]);
        set.sort_by_position();
        let order: Vec<(u32, u32)> = set.iter().map(|c| (c.bbox.x, c.bbox.y)).collect();
        assert_eq!(order, vec![(90, 10), (0, 40), (50, 40)]);
    }
}
