//! Start/end marker detection

use crate::bbox::MatchCandidate;
use crate::template::matcher::{MatchDeadline, MatchError, PreparedFrame};
use crate::template::{ScaleRange, Template, TemplateMatcher, TemplateSet};
use serde::Serialize;
use std::sync::Arc;

/// Which session boundaries are visible in a frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MarkerState {
    pub start_seen: bool,
    pub end_seen: bool,
    pub start: Option<MatchCandidate>,
    pub end: Option<MatchCandidate>,
}

/// The matcher restricted to the two boundary templates.
///
/// Only reports what it sees; combining marker state with content results
/// is the controller's job.
#[derive(Debug, Clone)]
pub struct MarkerDetector {
    matcher: Arc<TemplateMatcher>,
    start: Option<Arc<Template>>,
    end: Option<Arc<Template>>,
    scales: ScaleRange,
}

impl MarkerDetector {
    pub fn new(
        matcher: Arc<TemplateMatcher>,
        start: Option<Arc<Template>>,
        end: Option<Arc<Template>>,
        scales: ScaleRange,
    ) -> Self {
        Self {
            matcher,
            start,
            end,
            scales,
        }
    }

    pub fn from_set(matcher: Arc<TemplateMatcher>, set: &TemplateSet, scales: ScaleRange) -> Self {
        Self::new(matcher, set.start_marker.clone(), set.end_marker.clone(), scales)
    }

    pub fn has_end_marker(&self) -> bool {
        self.end.is_some()
    }

    /// Run both marker templates over a full, prepared frame.
    pub fn detect_markers(
        &self,
        frame: &PreparedFrame,
        deadline: &MatchDeadline,
    ) -> Result<MarkerState, MatchError> {
        let start = self.best_match(frame, self.start.as_deref(), deadline)?;
        let end = self.best_match(frame, self.end.as_deref(), deadline)?;

        Ok(MarkerState {
            start_seen: start.is_some(),
            end_seen: end.is_some(),
            start,
            end,
        })
    }

    fn best_match(
        &self,
        frame: &PreparedFrame,
        template: Option<&Template>,
        deadline: &MatchDeadline,
    ) -> Result<Option<MatchCandidate>, MatchError> {
        let Some(template) = template else {
            return Ok(None);
        };

        deadline.check()?;
        let threshold = template.threshold_or(self.matcher.config().threshold);
        let candidates = self
            .matcher
            .match_template(frame, template, &self.scales, threshold, deadline)?;

        Ok(candidates.into_iter().next())
    }
}
