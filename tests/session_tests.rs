// tests/session_tests.rs
mod common;

use common::{
    blank, code, config, decode_crop, feed_frame, resized, row_descriptor, row_icon, run, scaled,
    scaled_feed_frame, Scene, ScriptedSource, FIRST_ROW, ROW_PITCH,
};
use scrollscan_core::AmountParser;
use scrollscan_cv::session::{
    record_channel, spawn_record_worker, CaptureError, CollectingSink, ConfigurationError,
    SinkError, TransitionReason,
};
use scrollscan_cv::template::matcher::{MatchDeadline, MatchError};
use scrollscan_cv::template::StoreError;
use scrollscan_cv::traits::{RecordSink, TextRecognizer};
use scrollscan_cv::{
    BBox, CancellationFlag, EmittedRecord, MatcherConfig, ScaleRange, ScrollController,
    SessionError, SessionState, Template, TemplateDescriptor, TemplateMatcher,
};
use std::collections::HashSet;

fn reasons(result: &scrollscan_cv::SessionResult) -> Vec<TransitionReason> {
    result.transitions.iter().map(|t| t.reason).collect()
}

#[test]
fn test_halts_after_three_empty_frames() {
    let mut frames = vec![
        Scene::new().with_start().row(40, code(0)).row(100, code(1)).render(),
        Scene::new().row(40, code(2)).row(100, code(3)).render(),
        Scene::new().row(40, code(4)).row(100, code(5)).render(),
    ];
    frames.extend((0..7).map(|_| blank()));

    let (result, source, sink) = run(config(), ScriptedSource::new(frames));

    assert!(result.is_complete(), "{:?}", result.error);
    assert_eq!(result.final_state, SessionState::Done);
    assert_eq!(
        reasons(&result),
        vec![
            TransitionReason::StartMarkerSeen,
            TransitionReason::ContentExhausted,
            TransitionReason::FinalPassComplete,
        ]
    );

    let halting = &result.transitions[1];
    assert_eq!((halting.from, halting.to), (SessionState::Capturing, SessionState::Halting));
    assert_eq!(halting.frame_sequence, Some(6));
    assert_eq!(source.captures, 6);
    assert_eq!(source.scrolls.len(), 5);

    let frames_of: Vec<u64> = result.records.iter().map(|r| r.source_frame).collect();
    assert_eq!(frames_of, vec![1, 1, 2, 2, 3, 3]);
    assert_eq!(sink.records.len(), 6);
}

#[test]
fn test_shifted_record_is_emitted_once() {
    let frames = vec![
        Scene::new().with_start().row(60, code(0)).render(),
        Scene::new().row(55, code(0)).row(140, code(1)).render(),
    ];

    let (result, _, _) = run(config(), ScriptedSource::new(frames));

    assert!(result.is_complete());
    assert_eq!(result.records.len(), 2);
    assert_eq!(decode_crop(&result.records[0].crop), code(0));
    assert_eq!(result.records[0].source_frame, 1);
    assert_eq!(decode_crop(&result.records[1].crop), code(1));
    assert_eq!(result.records[1].source_frame, 2);
    assert!(result.stats.duplicates_skipped >= 1);
}

#[test]
fn test_overlapping_feed_has_no_duplicates() {
    let frames: Vec<_> = (0..6).map(|i| feed_frame(12, 60 * i)).collect();

    let (result, _, _) = run(config(), ScriptedSource::new(frames));

    assert!(result.is_complete(), "{:?}", result.error);
    assert_eq!(result.records.len(), 12);

    let unique: HashSet<&str> = result.records.iter().map(|r| r.fingerprint.as_str()).collect();
    assert_eq!(unique.len(), 12);

    for (i, record) in result.records.iter().enumerate() {
        assert_eq!(record.index, i);
        assert!(!record.clipped);
        assert_eq!(decode_crop(&record.crop), code(i));
        // Region top sits 4 px above the icon; offset maps back to feed y
        assert_eq!(
            record.region.y as i64 + 4 + record.scroll_offset,
            common::FIRST_ROW + common::ROW_PITCH * i as i64
        );
    }
    assert!(result.stats.leaving_regions > 0);
}

#[test]
fn test_rows_differing_in_one_block_are_both_emitted() {
    let frames = vec![Scene::new().with_start().row(40, code(0)).row(90, code(0) ^ 1).render()];

    let (result, _, _) = run(config(), ScriptedSource::new(frames));

    assert!(result.is_complete(), "{:?}", result.error);
    assert_eq!(result.records.len(), 2);
    assert_eq!(decode_crop(&result.records[0].crop), code(0));
    assert_eq!(decode_crop(&result.records[1].crop), code(0) ^ 1);
    // Only the final pass sees them again
    assert_eq!(result.stats.duplicates_skipped, 2);
}

#[test]
fn test_identical_rows_further_down_are_separate_records() {
    let frames = vec![
        Scene::new().with_start().row(40, code(2)).row(90, code(2)).render(),
        Scene::new().row(30, code(2)).row(120, code(5)).render(),
    ];

    let (result, _, _) = run(config(), ScriptedSource::new(frames));

    assert!(result.is_complete(), "{:?}", result.error);
    let codes: Vec<u8> = result.records.iter().map(|r| decode_crop(&r.crop)).collect();
    assert_eq!(codes, vec![code(2), code(2), code(5)]);

    let feed: Vec<i64> = result
        .records
        .iter()
        .map(|r| r.scroll_offset + r.region.y as i64)
        .collect();
    assert_eq!(feed, vec![36, 86, 176]);
}

const DRIFT: f64 = 1.1;

#[test]
fn test_drifted_rows_match_once_across_scales() -> Result<(), MatchError> {
    let frame = image::DynamicImage::ImageRgba8(scaled_feed_frame(10, 0, DRIFT)).to_luma8();
    let matcher = TemplateMatcher::new(MatcherConfig::default());
    let template = Template::new(row_descriptor(), row_icon());

    let prepared = matcher.prepare(&frame, None);
    let candidates = matcher.match_template(
        &prepared,
        &template,
        &ScaleRange::default(),
        0.8,
        &MatchDeadline::unbounded(),
    )?;

    let side = resized(&row_icon(), DRIFT).width();
    assert_eq!(candidates.len(), 4);
    assert!(candidates.iter().all(|c| c.bbox.width == side && c.confidence > 0.99));
    Ok(())
}

#[test]
fn test_resolution_drift_emits_every_record_once() {
    // The feed moves 66 px per frame while the controller asks for 60
    let moved = scaled(60, DRIFT);
    let frames: Vec<_> = (0..6).map(|k| scaled_feed_frame(10, moved * k, DRIFT)).collect();
    let mut config = config();
    config.scales = ScaleRange::default();

    let (result, _, _) = run(config, ScriptedSource::new(frames));

    assert!(result.is_complete(), "{:?}", result.error);
    assert_eq!(result.records.len(), 10);
    assert_eq!(result.records.iter().filter(|r| r.source_frame == 1).count(), 4);

    let unique: HashSet<&str> = result.records.iter().map(|r| r.fingerprint.as_str()).collect();
    assert_eq!(unique.len(), 10);

    // Record region grows with the matched icon
    let grown = resized(&row_icon(), DRIFT).width() as f64 / common::ICON_SIDE as f64;
    let width = (144.0 * grown).round() as u32;
    let height = (24.0 * grown).round() as u32;
    let top = (-4.0 * grown).round() as i64;

    for (i, record) in result.records.iter().enumerate() {
        assert_eq!((record.region.width, record.region.height), (width, height));
        assert_eq!(
            record.scroll_offset + record.region.y as i64,
            scaled(FIRST_ROW + ROW_PITCH * i as i64, DRIFT) + top
        );
    }
}

#[test]
fn test_capture_area_bounds_every_pass() {
    let frames = vec![Scene::new().with_start().row(40, code(0)).row(150, code(1)).render()];
    let mut config = config();
    config.capture_area = Some(BBox::new(0, 0, common::FRAME_WIDTH, 120));

    let (result, _, _) = run(config, ScriptedSource::new(frames));

    assert!(result.is_complete(), "{:?}", result.error);
    assert_eq!(result.records.len(), 1);
    assert_eq!(decode_crop(&result.records[0].crop), code(0));
    assert_eq!(reasons(&result).last(), Some(&TransitionReason::FinalPassComplete));
}

#[test]
fn test_start_marker_never_seen() {
    let frames = vec![Scene::new().row(40, code(0)).render()];

    let (result, source, sink) = run(config(), ScriptedSource::new(frames));

    match &result.error {
        Some(SessionError::StartMarkerNotFound { attempts, last_frame }) => {
            assert_eq!(*attempts, 3);
            assert_eq!(last_frame.as_ref().map(|f| f.0.sequence), Some(3));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(result.records.is_empty());
    assert!(sink.records.is_empty());
    assert_eq!(source.captures, 3);
    assert!(source.scrolls.is_empty());
    assert_eq!(result.final_state, SessionState::Done);
}

#[test]
fn test_seek_start_by_scrolling() {
    let frames = vec![
        blank(),
        Scene::new().with_start().row(40, code(3)).render(),
    ];
    let mut config = config();
    config.seek_start_by_scrolling = true;

    let (result, source, _) = run(config, ScriptedSource::new(frames));

    assert!(result.is_complete());
    assert_eq!(result.transitions[0].frame_sequence, Some(2));
    assert_eq!(source.scrolls[0], 60);
    assert_eq!(result.records.len(), 1);
    assert_eq!(result.records[0].scroll_offset, 60);
}

#[test]
fn test_end_marker_halts_capture() {
    let frames = vec![
        Scene::new().with_start().row(40, code(0)).row(100, code(1)).render(),
        Scene::new().row(40, code(2)).with_end().render(),
        Scene::new().row(40, code(3)).row(100, code(4)).render(),
    ];

    let (result, source, _) = run(config(), ScriptedSource::new(frames));

    assert!(result.is_complete());
    assert_eq!(reasons(&result)[1], TransitionReason::EndMarkerSeen);
    assert_eq!(source.captures, 2);
    assert_eq!(result.records.len(), 3);
}

#[test]
fn test_required_end_marker_missing_keeps_records() {
    let frames = vec![Scene::new().with_start().row(40, code(0)).row(100, code(1)).render()];
    let mut config = config();
    config.require_end_marker = true;

    let (result, _, _) = run(config, ScriptedSource::new(frames));

    assert!(matches!(
        result.error,
        Some(SessionError::EndMarkerNotFound { last_frame: Some(_) })
    ));
    assert_eq!(result.records.len(), 2);
    assert_eq!(reasons(&result).last(), Some(&TransitionReason::Failed));

    let failure = result.into_result().unwrap_err();
    assert_eq!(failure.partial.len(), 2);
}

#[test]
fn test_trailing_clipped_record_waits_for_final_pass() {
    // Record region reaches 2 px past the bottom edge
    let frames = vec![Scene::new().with_start().row(60, code(0)).row(182, code(1)).render()];

    let (result, _, _) = run(config(), ScriptedSource::new(frames));

    assert!(result.is_complete());
    assert_eq!(result.records.len(), 2);
    assert!(!result.records[0].clipped);

    let trailing = &result.records[1];
    assert!(trailing.clipped);
    assert_eq!(trailing.source_frame, 4);
    assert_eq!(trailing.region.bottom(), common::FRAME_HEIGHT);
    assert_eq!(result.stats.deferred_regions, 1);
    assert_eq!(result.stats.stalled_frames, 3);
}

#[test]
fn test_cancellation_ends_without_final_pass() {
    let cancel = CancellationFlag::new();
    let frames: Vec<_> = (0..6).map(|i| feed_frame(12, 60 * i)).collect();
    let mut source = ScriptedSource::new(frames);
    source.cancel_after = Some((2, cancel.clone()));

    let mut controller = ScrollController::new(config(), common::store(), source, CollectingSink::new())
        .expect("valid configuration")
        .with_cancellation(cancel);
    let result = controller.run();

    assert!(result.cancelled);
    assert!(result.error.is_none());
    assert!(!result.is_complete());
    assert_eq!(result.final_state, SessionState::Done);
    assert_eq!(reasons(&result).last(), Some(&TransitionReason::Cancelled));
    assert!(result.transitions.iter().all(|t| t.to != SessionState::Halting));

    assert!(!result.records.is_empty());
    assert!(result.records.iter().all(|r| r.source_frame <= 2));
    assert_eq!(controller.source().captures, 2);
}

#[test]
fn test_transient_capture_failures_are_retried() {
    let frames = vec![Scene::new().with_start().row(40, code(0)).render()];
    let mut source = ScriptedSource::new(frames);
    source.fail_captures = vec![1, 2];

    let (result, _, _) = run(config(), source);

    assert!(result.is_complete(), "{:?}", result.error);
    assert_eq!(result.stats.capture_retries, 2);
    assert_eq!(result.records.len(), 1);
    assert_eq!(result.records[0].source_frame, 1);
}

#[test]
fn test_capture_failure_keeps_partial_records() {
    let frames: Vec<_> = (0..6).map(|i| feed_frame(12, 60 * i)).collect();
    let mut source = ScriptedSource::new(frames);
    source.fail_from = Some(3);

    let (result, source, _) = run(config(), source);

    match &result.error {
        Some(SessionError::Capture(CaptureError::Exhausted { attempts, last })) => {
            assert_eq!(*attempts, 3);
            assert!(matches!(**last, CaptureError::NoImage));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(source.captures, 5);
    assert!(!result.records.is_empty());
    assert!(result.records.iter().all(|r| r.source_frame <= 2));
    assert_eq!(reasons(&result).last(), Some(&TransitionReason::Failed));
}

#[test]
fn test_rejected_scrolls_fail_the_session() {
    let frames = vec![Scene::new().with_start().row(40, code(0)).render()];
    let mut source = ScriptedSource::new(frames);
    source.reject_scrolls = true;

    let (result, _, _) = run(config(), source);

    match &result.error {
        Some(SessionError::Capture(CaptureError::Exhausted { last, .. })) => {
            assert!(matches!(**last, CaptureError::ScrollRejected { amount: 60, .. }));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(result.records.len(), 1);
}

#[test]
fn test_step_shrinks_when_many_records_arrive() {
    let frames = vec![
        Scene::new().with_start().row(40, code(0)).row(100, code(1)).render(),
        Scene::new().row(40, code(2)).row(100, code(3)).render(),
        blank(),
    ];
    let mut config = config();
    config.scroll.max_new_per_step = 1;

    let (result, source, _) = run(config, ScriptedSource::new(frames));

    assert!(result.is_complete());
    assert_eq!(source.scrolls, vec![30, 15, 30, 45]);
    assert_eq!(result.records[2].scroll_offset, 30);
}

#[test]
fn test_iteration_cap_halts() {
    let frames: Vec<_> = (0..6).map(|i| feed_frame(12, 60 * i)).collect();
    let mut config = config();
    config.max_iterations = 2;

    let (result, source, _) = run(config, ScriptedSource::new(frames));

    assert!(result.is_complete());
    assert_eq!(reasons(&result)[1], TransitionReason::IterationLimit);
    assert_eq!(source.captures, 2);
}

#[test]
fn test_missing_template_is_a_configuration_error() {
    let mut config = config();
    config.templates.push(TemplateDescriptor::content("ghost"));

    let outcome = ScrollController::new(
        config,
        common::store(),
        ScriptedSource::new(Vec::new()),
        CollectingSink::new(),
    );

    assert!(matches!(
        outcome.err(),
        Some(SessionError::Configuration(ConfigurationError::Store(
            StoreError::Unresolved(name)
        ))) if name == "ghost"
    ));
}

#[test]
fn test_flat_template_aborts_without_retry() {
    let store = common::store();
    let flat = TemplateDescriptor::content("flat_row");
    store.insert(flat.clone(), image::GrayImage::from_pixel(16, 16, image::Luma([90])));

    let mut config = config();
    config.templates.push(flat);
    let frames = vec![Scene::new().with_start().row(40, code(0)).render()];

    let mut controller =
        ScrollController::new(config, store, ScriptedSource::new(frames), CollectingSink::new())
            .expect("valid configuration");
    let result = controller.run();

    assert!(matches!(
        result.error,
        Some(SessionError::Configuration(ConfigurationError::Match(
            MatchError::DegenerateTemplate { .. }
        )))
    ));
    assert_eq!(controller.source().captures, 1);
    assert!(result.records.is_empty());
}

struct ClosingSink {
    accepted: usize,
}

impl RecordSink for ClosingSink {
    fn accept(&mut self, _record: &EmittedRecord) -> Result<(), SinkError> {
        if self.accepted == 1 {
            return Err(SinkError::Closed);
        }
        self.accepted += 1;
        Ok(())
    }
}

#[test]
fn test_sink_failure_is_fatal() {
    let frames = vec![Scene::new().with_start().row(40, code(0)).row(100, code(1)).render()];

    let mut controller = ScrollController::new(
        config(),
        common::store(),
        ScriptedSource::new(frames),
        ClosingSink { accepted: 0 },
    )
    .expect("valid configuration");
    let result = controller.run();

    assert!(matches!(result.error, Some(SessionError::Sink(SinkError::Closed))));
    assert_eq!(result.records.len(), 1);
}

#[test]
fn test_rerun_starts_from_a_clean_slate() {
    let frames = vec![Scene::new().with_start().row(40, code(0)).render()];
    let mut controller = ScrollController::new(
        config(),
        common::store(),
        ScriptedSource::new(frames),
        CollectingSink::new(),
    )
    .expect("valid configuration");

    let first = controller.run();
    let second = controller.run();

    assert_eq!(first.records.len(), 1);
    assert_eq!(second.records.len(), 1);
    assert_eq!(second.records[0].index, 0);
    assert_eq!(second.records[0].source_frame, 1);
}

/// Reads the record code straight off the crop
struct CodeReader;

impl TextRecognizer for CodeReader {
    fn recognize_text(&self, region: &image::RgbaImage) -> anyhow::Result<(String, f32)> {
        let code = decode_crop(region);
        Ok((format!("Kestrel {}m", code), 0.95))
    }
}

#[test]
fn test_worker_parses_records_in_emission_order() -> anyhow::Result<()> {
    let frames: Vec<_> = (0..6).map(|i| feed_frame(12, 60 * i)).collect();
    let (sink, receiver) = record_channel();
    let worker = spawn_record_worker(receiver, CodeReader, AmountParser::new())?;

    let mut controller =
        ScrollController::new(config(), common::store(), ScriptedSource::new(frames), sink)?;
    let result = controller.run();
    drop(controller);

    let parsed = worker.join().map_err(|_| anyhow::anyhow!("worker panicked"))?;
    assert!(result.is_complete());
    assert_eq!(parsed.len(), result.records.len());

    for (i, record) in parsed.iter().enumerate() {
        assert_eq!(record.origin.index, i);
        assert!(record.parse_success, "{:?}", record.parse_error);
        assert_eq!(record.player_name.as_deref(), Some("Kestrel"));
        let amount = record.amount.as_ref().map(|a| a.value);
        assert_eq!(amount, Some(code(i) as f64 * 1_000_000.0));
    }
    Ok(())
}
