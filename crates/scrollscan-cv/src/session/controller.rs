//! The scroll controller: drives capture, matching, deduplication and
//! scrolling as an explicit state machine.

use super::config::SessionConfig;
use super::error::{CaptureError, FrameSnapshot, SessionError};
use super::result::{SessionResult, SessionStats};
use super::sink::EmittedRecord;
use super::state::{SessionState, StateTransition, TransitionReason};
use crate::bbox::{BBox, CandidateSet, ClippedEdges, MatchCandidate};
use crate::fingerprint::{ContentFingerprint, Deduplicator, Fingerprinter};
use crate::frame::{Frame, FrameWindow};
use crate::markers::MarkerDetector;
use crate::template::matcher::MatchDeadline;
use crate::template::{TemplateMatcher, TemplateSet, TemplateStore};
use crate::traits::{FrameSource, RecordSink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// External cancellation signal, checked at the top of every iteration.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A candidate's record region within one frame, fingerprinted.
struct Sighting {
    candidate: MatchCandidate,
    region: BBox,
    clipped: bool,
    fingerprint: ContentFingerprint,
}

/// Runs capture sessions against a frame source, pushing every new record
/// into a sink.
///
/// The controller is the only writer of session state; per-template matching
/// fans out to the matcher's pool and joins before deduplication.
pub struct ScrollController<S, K> {
    config: SessionConfig,
    store: Arc<TemplateStore>,
    matcher: Arc<TemplateMatcher>,
    templates: TemplateSet,
    markers: MarkerDetector,
    fingerprinter: Fingerprinter,
    source: S,
    sink: K,
    cancel: CancellationFlag,

    state: SessionState,
    dedup: Deduplicator,
    window: FrameWindow,
    records: Vec<EmittedRecord>,
    transitions: Vec<StateTransition>,
    stats: SessionStats,
    /// Frame that showed the start marker; first CAPTURING iteration uses it
    pending: Option<Arc<Frame>>,
    next_sequence: u64,
    /// Expected feed offset of the next capture
    scroll_offset: i64,
    /// Measured feed offset of the last frame matched
    last_offset: i64,
    current_step: u32,
    zero_streak: u32,
    start_attempts: u32,
    end_seen: bool,
}

impl<S: FrameSource, K: RecordSink> ScrollController<S, K> {
    /// Validate the configuration and load its templates from `store`.
    pub fn new(
        config: SessionConfig,
        store: Arc<TemplateStore>,
        source: S,
        sink: K,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let templates = store.load_in(&config.templates, &config.template_dirs)?;
        let matcher = Arc::new(TemplateMatcher::with_pool_size(
            config.matcher.clone(),
            config.match_pool_size,
        )?);
        let markers = MarkerDetector::from_set(Arc::clone(&matcher), &templates, config.scales);
        let fingerprinter = Fingerprinter::new(config.fingerprint.clone());
        let dedup = Deduplicator::from_config(&config.fingerprint);
        let current_step = config.scroll.step;

        Ok(Self {
            config,
            store,
            matcher,
            templates,
            markers,
            fingerprinter,
            source,
            sink,
            cancel: CancellationFlag::new(),
            state: SessionState::WaitingStart,
            dedup,
            window: FrameWindow::new(),
            records: Vec::new(),
            transitions: Vec::new(),
            stats: SessionStats::default(),
            pending: None,
            next_sequence: 0,
            scroll_offset: 0,
            last_offset: 0,
            current_step,
            zero_streak: 0,
            start_attempts: 0,
            end_seen: false,
        })
    }

    /// Use an externally owned cancellation flag.
    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn store(&self) -> &Arc<TemplateStore> {
        &self.store
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn into_parts(self) -> (S, K) {
        (self.source, self.sink)
    }

    /// Run one full session from WAITING_START to DONE.
    pub fn run(&mut self) -> SessionResult {
        self.reset();
        log::info!(
            "session started: {} content templates, patience {}, step {} px {}",
            self.templates.content.len(),
            self.config.halt_patience,
            self.config.scroll.step,
            self.config.scroll.direction
        );

        let mut error = None;
        let mut cancelled = false;

        while !self.state.is_terminal() {
            if self.cancel.is_cancelled() {
                log::warn!("cancellation requested in {}", self.state);
                self.transition(SessionState::Done, TransitionReason::Cancelled, None);
                cancelled = true;
                break;
            }

            if let Err(e) = self.step() {
                log::error!("session failed in {}: {}", self.state, super::result::error_chain(&e));
                let sequence = self.window.latest().map(|f| f.sequence);
                self.transition(SessionState::Done, TransitionReason::Failed, sequence);
                error = Some(e);
            }
        }

        log::info!(
            "session finished: {} records, {} captures, cancelled={}",
            self.records.len(),
            self.stats.captures,
            cancelled
        );

        SessionResult {
            records: std::mem::take(&mut self.records),
            final_state: self.state,
            error,
            cancelled,
            transitions: std::mem::take(&mut self.transitions),
            stats: self.stats.clone(),
        }
    }

    fn reset(&mut self) {
        self.state = SessionState::WaitingStart;
        self.dedup.clear();
        self.window.clear();
        self.records.clear();
        self.transitions.clear();
        self.stats = SessionStats::default();
        self.pending = None;
        self.next_sequence = 0;
        self.scroll_offset = 0;
        self.last_offset = 0;
        self.current_step = self.config.scroll.step;
        self.zero_streak = 0;
        self.start_attempts = 0;
        self.end_seen = false;
    }

    /// Advance the state machine by one iteration.
    fn step(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::WaitingStart => self.wait_for_start(),
            SessionState::Capturing => self.capture_iteration(),
            SessionState::Halting => self.final_pass(),
            SessionState::Done => Ok(()),
        }
    }

    fn wait_for_start(&mut self) -> Result<(), SessionError> {
        let frame = self.capture()?;
        self.start_attempts += 1;

        let prepared = self.matcher.prepare(frame.gray(), None);
        let markers = self.markers.detect_markers(&prepared, &self.deadline())?;

        if markers.start_seen {
            self.pending = Some(Arc::clone(&frame));
            self.transition(
                SessionState::Capturing,
                TransitionReason::StartMarkerSeen,
                Some(frame.sequence),
            );
            return Ok(());
        }

        log::debug!(
            "start marker not in frame {} ({}/{})",
            frame.sequence,
            self.start_attempts,
            self.config.max_start_attempts
        );

        if self.start_attempts >= self.config.max_start_attempts {
            return Err(SessionError::StartMarkerNotFound {
                attempts: self.start_attempts,
                last_frame: Some(FrameSnapshot(frame)),
            });
        }

        if self.config.seek_start_by_scrolling {
            self.scroll(self.config.scroll.step)?;
        }
        Ok(())
    }

    fn capture_iteration(&mut self) -> Result<(), SessionError> {
        let frame = match self.pending.take() {
            Some(frame) => frame,
            None => self.capture()?,
        };
        self.stats.iterations += 1;

        let stalled = self.window.is_stalled();
        let (new_count, end_seen) = if stalled {
            self.stats.stalled_frames += 1;
            self.scroll_offset = self.last_offset;
            log::warn!(
                "frame {} is identical to the previous one; the feed did not move",
                frame.sequence
            );
            (0, false)
        } else {
            let full = self.matcher.prepare(frame.gray(), None);
            let markers = self.markers.detect_markers(&full, &self.deadline())?;
            let candidates = self.match_content(&frame)?;
            (self.emit_new(&frame, candidates, false)?, markers.end_seen)
        };

        log::debug!(
            "frame {}: {} new records, end marker {}",
            frame.sequence,
            new_count,
            if end_seen { "seen" } else { "not seen" }
        );

        if end_seen {
            self.end_seen = true;
            self.transition(SessionState::Halting, TransitionReason::EndMarkerSeen, Some(frame.sequence));
            return Ok(());
        }

        if new_count == 0 {
            self.zero_streak += 1;
            log::debug!(
                "no new records ({}/{})",
                self.zero_streak,
                self.config.halt_patience
            );
        } else {
            self.zero_streak = 0;
        }

        if self.zero_streak >= self.config.halt_patience {
            self.transition(SessionState::Halting, TransitionReason::ContentExhausted, Some(frame.sequence));
            return Ok(());
        }

        if self.stats.iterations >= self.config.max_iterations {
            log::warn!("iteration cap of {} reached", self.config.max_iterations);
            self.transition(SessionState::Halting, TransitionReason::IterationLimit, Some(frame.sequence));
            return Ok(());
        }

        self.current_step = self.next_step(new_count);
        self.scroll(self.current_step)
    }

    /// One more match pass over the most recent frame, accepting trailing
    /// regions cut by the frame edge. Content outside the capture area is
    /// still ignored.
    fn final_pass(&mut self) -> Result<(), SessionError> {
        let latest = self.window.latest().cloned();

        if let Some(frame) = &latest {
            let candidates = self.match_content(frame)?;
            let trailing = self.emit_new(frame, candidates, true)?;
            log::info!("final pass over frame {}: {} trailing records", frame.sequence, trailing);
        }

        if self.config.require_end_marker && !self.end_seen {
            return Err(SessionError::EndMarkerNotFound {
                last_frame: latest.map(FrameSnapshot),
            });
        }

        self.transition(
            SessionState::Done,
            TransitionReason::FinalPassComplete,
            latest.map(|f| f.sequence),
        );
        Ok(())
    }

    fn match_content(&self, frame: &Frame) -> Result<CandidateSet, SessionError> {
        let prepared = self.matcher.prepare(frame.gray(), self.config.capture_area);
        let per_template = self.matcher.match_all(
            &prepared,
            &self.templates.content,
            &self.config.scales,
            &self.deadline(),
        )?;

        let mut all = CandidateSet::new();
        for candidates in per_template {
            all.extend(candidates);
        }
        all.sort_by_position();
        Ok(all)
    }

    /// Fingerprint every candidate's record region and emit the new ones in
    /// reading order. Returns how many were emitted.
    fn emit_new(
        &mut self,
        frame: &Frame,
        candidates: CandidateSet,
        allow_clipped: bool,
    ) -> Result<usize, SessionError> {
        let direction = self.config.scroll.direction;
        let mut sightings = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let Some((region, edges)) = self.record_region(frame, &candidate) else {
                continue;
            };
            if direction.is_leaving(edges) {
                self.stats.leaving_regions += 1;
                continue;
            }

            let fingerprint = self.fingerprinter.fingerprint(frame.gray(), region);
            sightings.push(Sighting {
                candidate,
                region,
                clipped: edges.any(),
                fingerprint,
            });
        }

        let offset = self.align(frame, &sightings);
        let mut new_count = 0;

        for sighting in sightings {
            let Sighting {
                candidate,
                region,
                clipped,
                fingerprint,
            } = sighting;

            if clipped && !allow_clipped {
                self.stats.deferred_regions += 1;
                log::debug!(
                    "deferring '{}' at {:?} in frame {}: record region is cut by the frame edge",
                    candidate.template,
                    candidate.bbox,
                    frame.sequence
                );
                continue;
            }

            let position = offset + direction.axis_position(region);
            if !self.dedup.is_new(&fingerprint, position) {
                self.stats.duplicates_skipped += 1;
                continue;
            }

            let category = self
                .templates
                .content
                .iter()
                .find(|t| t.name() == candidate.template)
                .and_then(|t| t.descriptor().category.clone());

            let record = EmittedRecord {
                index: self.records.len(),
                fingerprint: fingerprint.clone(),
                source_frame: frame.sequence,
                scroll_offset: offset,
                template: candidate.template,
                category,
                region,
                confidence: candidate.confidence,
                clipped,
                crop: Arc::new(frame.crop(region)),
            };

            self.sink.accept(&record)?;
            log::debug!(
                "emitted record {} from frame {} at feed position {} ({})",
                record.index,
                frame.sequence,
                position,
                record.fingerprint
            );
            self.dedup.mark_emitted(fingerprint, position);
            self.records.push(record);
            new_count += 1;
        }

        Ok(new_count)
    }

    /// Measure the frame's feed offset from the records it shares with
    /// earlier frames; later scrolls continue from the measured offset.
    fn align(&mut self, frame: &Frame, sightings: &[Sighting]) -> i64 {
        let direction = self.config.scroll.direction;
        let whole: Vec<(&ContentFingerprint, i64)> = sightings
            .iter()
            .filter(|s| !s.clipped)
            .map(|s| (&s.fingerprint, direction.axis_position(s.region)))
            .collect();

        let expected = self.scroll_offset;
        let offset = self.dedup.align(&whole, expected).unwrap_or(expected);
        if offset != expected {
            log::debug!(
                "frame {} sits at feed offset {} where {} was expected",
                frame.sequence,
                offset,
                expected
            );
        }

        self.scroll_offset = offset;
        self.last_offset = offset;
        offset
    }

    /// Region to fingerprint for a candidate, clipped to the frame, plus
    /// the edges that cut it. The offset grows with the matched size.
    fn record_region(
        &self,
        frame: &Frame,
        candidate: &MatchCandidate,
    ) -> Option<(BBox, ClippedEdges)> {
        let template = self
            .templates
            .content
            .iter()
            .find(|t| t.name() == candidate.template);

        let Some((template, offset)) =
            template.and_then(|t| t.descriptor().record_region.map(|r| (t, r)))
        else {
            return Some((candidate.bbox, ClippedEdges::default()));
        };

        let (width, height) = template.dimensions();
        let r = offset.scaled(
            candidate.bbox.width as f64 / width.max(1) as f64,
            candidate.bbox.height as f64 / height.max(1) as f64,
        );
        candidate.bbox.relative_region(
            r.dx as i64,
            r.dy as i64,
            r.width,
            r.height,
            frame.width(),
            frame.height(),
        )
    }

    /// Capture with bounded retries and exponential backoff.
    fn capture(&mut self) -> Result<Arc<Frame>, SessionError> {
        let policy = self.config.retry.clone();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let started = Instant::now();
            let result = self.source.capture_frame().and_then(|image| {
                let elapsed = started.elapsed();
                match policy.capture_timeout() {
                    Some(limit) if elapsed > limit => Err(CaptureError::Timeout {
                        elapsed_ms: elapsed.as_millis() as u64,
                        limit_ms: limit.as_millis() as u64,
                    }),
                    _ if image.width() == 0 || image.height() == 0 => Err(CaptureError::NoImage),
                    _ => Ok(image),
                }
            });

            match result {
                Ok(image) => {
                    self.next_sequence += 1;
                    self.stats.captures += 1;
                    let frame = Arc::new(Frame::new(self.next_sequence, self.scroll_offset, image));
                    self.window.push(Arc::clone(&frame));
                    return Ok(frame);
                }
                Err(e) if attempt < policy.max_capture_attempts => {
                    let delay = policy.backoff(attempt);
                    log::warn!(
                        "capture attempt {}/{} failed: {}; retrying in {:?}",
                        attempt,
                        policy.max_capture_attempts,
                        e,
                        delay
                    );
                    self.stats.capture_retries += 1;
                    std::thread::sleep(delay);
                }
                Err(e) => {
                    return Err(SessionError::Capture(CaptureError::Exhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    }));
                }
            }
        }
    }

    /// Issue one scroll step, retried like captures.
    fn scroll(&mut self, amount: u32) -> Result<(), SessionError> {
        let direction = self.config.scroll.direction;
        let policy = self.config.retry.clone();

        for attempt in 1..=policy.max_capture_attempts {
            if self.source.scroll(amount, direction) {
                self.scroll_offset += direction.sign() * amount as i64;
                self.stats.scrolls += 1;
                if self.config.scroll.settle_ms > 0 {
                    std::thread::sleep(std::time::Duration::from_millis(self.config.scroll.settle_ms));
                }
                return Ok(());
            }

            if attempt < policy.max_capture_attempts {
                let delay = policy.backoff(attempt);
                log::warn!("scroll {} by {} px rejected; retrying in {:?}", direction, amount, delay);
                std::thread::sleep(delay);
            }
        }

        Err(SessionError::Capture(CaptureError::Exhausted {
            attempts: policy.max_capture_attempts,
            last: Box::new(CaptureError::ScrollRejected { amount, direction }),
        }))
    }

    /// Halve the step when an iteration brought more records than expected
    /// (some may have scrolled past unseen); recover by a quarter of the
    /// base step per calmer iteration.
    fn next_step(&self, new_count: usize) -> u32 {
        let scroll = &self.config.scroll;
        let next = if new_count > scroll.max_new_per_step {
            (self.current_step / 2).max(scroll.min_step)
        } else {
            (self.current_step + scroll.step / 4).min(scroll.step)
        };

        if next != self.current_step {
            log::debug!("scroll step {} -> {} px ({} new records)", self.current_step, next, new_count);
        }
        next
    }

    fn deadline(&self) -> MatchDeadline {
        MatchDeadline::new(self.config.retry.match_timeout())
    }

    fn transition(&mut self, to: SessionState, reason: TransitionReason, frame_sequence: Option<u64>) {
        debug_assert!(self.state.can_transition_to(to), "{} -> {}", self.state, to);
        log::info!("{} -> {} ({:?})", self.state, to, reason);

        self.transitions.push(StateTransition {
            from: self.state,
            to,
            reason,
            frame_sequence,
        });
        self.state = to;
    }
}
