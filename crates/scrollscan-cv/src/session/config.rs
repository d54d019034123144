//! Session configuration.
//!
//! A single snapshot read once at session start. Every field has a default
//! so partial JSON files stay valid.

use super::error::SessionError;
use crate::bbox::{BBox, ClippedEdges};
use crate::fingerprint::FingerprintConfig;
use crate::template::{MatcherConfig, ScaleRange, TemplateDescriptor, TemplateKind};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Direction of a scroll step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    /// Sign applied to the accumulated scroll offset.
    pub fn sign(self) -> i64 {
        match self {
            ScrollDirection::Down | ScrollDirection::Right => 1,
            ScrollDirection::Up | ScrollDirection::Left => -1,
        }
    }

    /// Coordinate of `region` along the scroll axis.
    pub fn axis_position(self, region: BBox) -> i64 {
        match self {
            ScrollDirection::Up | ScrollDirection::Down => region.y as i64,
            ScrollDirection::Left | ScrollDirection::Right => region.x as i64,
        }
    }

    /// True when a region is cut by the edge content scrolls out through
    /// (the top edge when scrolling down).
    pub fn is_leaving(self, edges: ClippedEdges) -> bool {
        match self {
            ScrollDirection::Down => edges.top,
            ScrollDirection::Up => edges.bottom,
            ScrollDirection::Right => edges.left,
            ScrollDirection::Left => edges.right,
        }
    }
}

impl std::fmt::Display for ScrollDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScrollDirection::Up => write!(f, "up"),
            ScrollDirection::Down => write!(f, "down"),
            ScrollDirection::Left => write!(f, "left"),
            ScrollDirection::Right => write!(f, "right"),
        }
    }
}

/// Scroll step policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrollConfig {
    pub direction: ScrollDirection,
    /// Base step in pixels
    pub step: u32,
    /// The adaptive step never shrinks below this
    pub min_step: u32,
    /// More new records than this in one iteration halves the step
    pub max_new_per_step: usize,
    /// Pause after each scroll before the next capture (milliseconds)
    pub settle_ms: u64,
}

impl Default for ScrollConfig {
    fn default() -> Self {
        Self {
            direction: ScrollDirection::Down,
            step: 300,
            min_step: 40,
            max_new_per_step: 12,
            settle_ms: 500,
        }
    }
}

/// Capture retry and timeout policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per capture (or scroll) before the session fails
    pub max_capture_attempts: u32,
    /// First backoff delay; doubles on every retry
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Captures slower than this are discarded (0 disables)
    pub capture_timeout_ms: u64,
    /// Deadline for matching one frame (0 disables)
    pub match_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_capture_attempts: 3,
            retry_backoff_ms: 200,
            max_backoff_ms: 2000,
            capture_timeout_ms: 5000,
            match_timeout_ms: 10000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms))
    }

    pub fn capture_timeout(&self) -> Option<Duration> {
        (self.capture_timeout_ms > 0).then(|| Duration::from_millis(self.capture_timeout_ms))
    }

    pub fn match_timeout(&self) -> Option<Duration> {
        (self.match_timeout_ms > 0).then(|| Duration::from_millis(self.match_timeout_ms))
    }
}

/// Complete session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub templates: Vec<TemplateDescriptor>,
    /// Searched for templates that have no explicit path
    pub template_dirs: Vec<PathBuf>,
    pub matcher: MatcherConfig,
    pub scales: ScaleRange,
    pub fingerprint: FingerprintConfig,
    pub scroll: ScrollConfig,
    pub retry: RetryPolicy,
    /// Part of the frame searched for content; markers always use the full frame
    pub capture_area: Option<BBox>,
    /// Consecutive zero-new iterations before the feed counts as exhausted
    pub halt_patience: u32,
    /// Captures spent waiting for the start marker
    pub max_start_attempts: u32,
    /// Scroll while waiting for the start marker instead of re-capturing in place
    pub seek_start_by_scrolling: bool,
    /// Iterations in CAPTURING before halting regardless of content
    pub max_iterations: u32,
    /// Fail the session when it halts without having seen the end marker
    pub require_end_marker: bool,
    /// Worker threads for per-template matching
    pub match_pool_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            templates: Vec::new(),
            template_dirs: Vec::new(),
            matcher: MatcherConfig::default(),
            scales: ScaleRange::default(),
            fingerprint: FingerprintConfig::default(),
            scroll: ScrollConfig::default(),
            retry: RetryPolicy::default(),
            capture_area: None,
            halt_patience: 3,
            max_start_attempts: 10,
            seek_start_by_scrolling: false,
            max_iterations: 50,
            require_end_marker: false,
            match_pool_size: 4,
        }
    }
}

impl SessionConfig {
    /// Chat feed: one row template per message, long lists.
    pub fn for_chat_feed() -> Self {
        Self {
            scroll: ScrollConfig {
                step: 240,
                max_new_per_step: 10,
                ..Default::default()
            },
            max_iterations: 80,
            ..Default::default()
        }
    }

    /// Battle report: short participant table ending at a summary banner.
    pub fn for_battle_report() -> Self {
        Self {
            matcher: MatcherConfig::equalized(),
            scroll: ScrollConfig {
                step: 360,
                ..Default::default()
            },
            halt_patience: 2,
            max_iterations: 30,
            require_end_marker: true,
            ..Default::default()
        }
    }

    /// Load a configuration snapshot from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {:?}", path))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {:?}", path))?;
        Ok(config)
    }

    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Reject values the controller cannot run with.
    pub fn validate(&self) -> Result<(), SessionError> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);

        if !in_unit(self.matcher.threshold) {
            return Err(SessionError::invalid(format!(
                "matcher threshold {} is outside 0..=1",
                self.matcher.threshold
            )));
        }
        if !in_unit(self.matcher.nms_threshold) {
            return Err(SessionError::invalid(format!(
                "overlap threshold {} is outside 0..=1",
                self.matcher.nms_threshold
            )));
        }
        if let Some(bad) = self
            .templates
            .iter()
            .find(|t| t.threshold.is_some_and(|v| !in_unit(v)))
        {
            return Err(SessionError::invalid(format!(
                "template '{}' threshold is outside 0..=1",
                bad.name
            )));
        }
        if !self.scales.is_valid() {
            return Err(SessionError::invalid(format!("scale range {:?} is empty", self.scales)));
        }
        if self.match_pool_size == 0 {
            return Err(SessionError::invalid("match pool size must be at least 1"));
        }
        if self.halt_patience == 0 || self.max_start_attempts == 0 || self.max_iterations == 0 {
            return Err(SessionError::invalid(
                "halt patience, start attempts and iteration cap must be positive",
            ));
        }
        if self.retry.max_capture_attempts == 0 {
            return Err(SessionError::invalid("at least one capture attempt is required"));
        }
        if self.scroll.step == 0 || self.scroll.min_step > self.scroll.step {
            return Err(SessionError::invalid(format!(
                "scroll step {} / minimum {} is unusable",
                self.scroll.step, self.scroll.min_step
            )));
        }
        if self.fingerprint.hash_width == 0 || self.fingerprint.hash_height == 0 {
            return Err(SessionError::invalid("fingerprint hash size must be positive"));
        }
        if self.capture_area.is_some_and(|a| a.width == 0 || a.height == 0) {
            return Err(SessionError::invalid("capture area is empty"));
        }

        let enabled = |kind: TemplateKind| self.templates.iter().any(|t| t.enabled && t.kind == kind);
        if !enabled(TemplateKind::StartMarker) {
            return Err(SessionError::invalid("no start marker template configured"));
        }
        if self.require_end_marker && !enabled(TemplateKind::EndMarker) {
            return Err(SessionError::invalid(
                "end marker required but no end marker template configured",
            ));
        }
        if !enabled(TemplateKind::Content) {
            return Err(SessionError::invalid("no content templates configured"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn runnable() -> SessionConfig {
        SessionConfig {
            templates: vec![
                TemplateDescriptor::start_marker("top"),
                TemplateDescriptor::content("row"),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_validate_once_templates_exist() {
        assert!(SessionConfig::default().validate().is_err());
        assert!(runnable().validate().is_ok());
        assert_eq!(runnable().halt_patience, 3);
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let mut config = runnable();
        config.matcher.threshold = 1.5;
        assert!(matches!(config.validate(), Err(SessionError::Configuration(_))));

        let mut config = runnable();
        config.templates.push(TemplateDescriptor::content("x").with_threshold(-0.1));
        assert!(config.validate().is_err());

        let mut config = runnable();
        config.scales = ScaleRange { min: 1.2, max: 0.8, step: 0.1 };
        assert!(config.validate().is_err());

        let mut config = runnable();
        config.match_pool_size = 0;
        assert!(config.validate().is_err());

        let mut config = runnable();
        config.fingerprint.hash_height = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_required_end_marker_must_be_configured() {
        let mut config = runnable();
        config.require_end_marker = true;
        assert!(config.validate().is_err());

        config.templates.push(TemplateDescriptor::end_marker("bottom"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_leaving_edge_follows_direction() {
        let top = ClippedEdges {
            top: true,
            ..Default::default()
        };
        assert!(ScrollDirection::Down.is_leaving(top));
        assert!(!ScrollDirection::Up.is_leaving(top));
        assert!(!ScrollDirection::Right.is_leaving(top));
    }

    #[test]
    fn test_axis_position_follows_direction() {
        let region = BBox::new(12, 40, 100, 20);
        assert_eq!(ScrollDirection::Down.axis_position(region), 40);
        assert_eq!(ScrollDirection::Up.axis_position(region), 40);
        assert_eq!(ScrollDirection::Left.axis_position(region), 12);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            retry_backoff_ms: 100,
            max_backoff_ms: 350,
            ..Default::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
    }

    #[test]
    fn test_partial_json_uses_defaults() -> crate::Result<()> {
        let mut file = NamedTempFile::new()?;
        write!(
            file,
            r#"{{
                "templates": [
                    {{ "name": "top", "kind": "start_marker" }},
                    {{ "name": "row", "record_region": {{ "dx": 0, "dy": -2, "width": 200, "height": 30 }} }}
                ],
                "halt_patience": 5,
                "scroll": {{ "direction": "up" }}
            }}"#
        )?;

        let config = SessionConfig::from_json_file(file.path())?;
        assert_eq!(config.halt_patience, 5);
        assert_eq!(config.scroll.direction, ScrollDirection::Up);
        assert_eq!(config.scroll.step, 300);
        assert_eq!(config.templates[1].record_region.map(|r| r.dy), Some(-2));
        assert!(config.validate().is_ok());
        Ok(())
    }

    #[test]
    fn test_presets_are_valid_with_templates() {
        for mut preset in [SessionConfig::for_chat_feed(), SessionConfig::for_battle_report()] {
            preset.templates = runnable().templates;
            preset.templates.push(TemplateDescriptor::end_marker("bottom"));
            assert!(preset.validate().is_ok());
        }
    }
}
