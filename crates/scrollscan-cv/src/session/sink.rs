//! Emitted records and the downstream hand-off.
//!
//! The controller pushes each new record into a [`RecordSink`] in emission
//! order. [`ChannelSink`] hands records to a worker thread that runs text
//! recognition and value parsing, so capture never waits on OCR.

use super::error::SinkError;
use crate::bbox::BBox;
use crate::fingerprint::ContentFingerprint;
use crate::traits::{RecordSink, TextRecognizer};
use image::RgbaImage;
use scrollscan_core::{AmountParser, ParsedRecord, RecordOrigin};
use serde::Serialize;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

/// A record surfaced exactly once per session.
#[derive(Debug, Clone, Serialize)]
pub struct EmittedRecord {
    /// Emission index within the session, gap-free from 0
    pub index: usize,
    pub fingerprint: ContentFingerprint,
    pub source_frame: u64,
    /// Measured feed offset of the source frame
    pub scroll_offset: i64,
    pub template: String,
    pub category: Option<String>,
    /// Record region in frame coordinates
    pub region: BBox,
    pub confidence: f64,
    /// Region was cut by the frame edge (final pass only)
    pub clipped: bool,
    #[serde(skip)]
    pub crop: Arc<RgbaImage>,
}

impl EmittedRecord {
    pub fn origin(&self) -> RecordOrigin {
        RecordOrigin {
            index: self.index,
            source_frame: self.source_frame,
            template: self.template.clone(),
            category: self.category.clone(),
            fingerprint: self.fingerprint.to_string(),
        }
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub records: Vec<EmittedRecord>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordSink for CollectingSink {
    fn accept(&mut self, record: &EmittedRecord) -> Result<(), SinkError> {
        self.records.push(record.clone());
        Ok(())
    }
}

/// Sink that forwards records over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: Sender<EmittedRecord>,
}

impl RecordSink for ChannelSink {
    fn accept(&mut self, record: &EmittedRecord) -> Result<(), SinkError> {
        self.sender.send(record.clone()).map_err(|_| SinkError::Closed)
    }
}

/// Creates a channel sink and the receiving end for a worker.
pub fn record_channel() -> (ChannelSink, Receiver<EmittedRecord>) {
    let (sender, receiver) = channel();
    (ChannelSink { sender }, receiver)
}

/// Recognize and parse one record. Recognition failures produce an
/// unreadable record rather than an error.
pub fn process_record(
    recognizer: &dyn TextRecognizer,
    parser: &AmountParser,
    record: &EmittedRecord,
) -> ParsedRecord {
    match recognizer.recognize_text(&record.crop) {
        Ok((text, confidence)) => {
            ParsedRecord::from_recognized(record.origin(), &text, confidence, parser)
        }
        Err(e) => {
            log::warn!("text recognition failed for record {}: {:#}", record.index, e);
            ParsedRecord::unreadable(record.origin(), e.to_string())
        }
    }
}

/// Spawns the worker thread. It runs until every sender is dropped and
/// returns the parsed records in emission order.
pub fn spawn_record_worker<R>(
    receiver: Receiver<EmittedRecord>,
    recognizer: R,
    parser: AmountParser,
) -> crate::Result<JoinHandle<Vec<ParsedRecord>>>
where
    R: TextRecognizer + 'static,
{
    let handle = std::thread::Builder::new()
        .name("scrollscan-ocr".to_string())
        .spawn(move || {
            log::debug!("record worker started");
            let mut parsed = Vec::new();

            while let Ok(record) = receiver.recv() {
                let result = process_record(&recognizer, &parser, &record);
                log::debug!(
                    "record {} parsed: success={} text={:?}",
                    result.origin.index,
                    result.parse_success,
                    result.text
                );
                parsed.push(result);
            }

            log::debug!("record worker finished: {} records", parsed.len());
            parsed
        })?;

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{FingerprintConfig, Fingerprinter};
    use image::GrayImage;

    struct FixedText(&'static str);

    impl TextRecognizer for FixedText {
        fn recognize_text(&self, _region: &RgbaImage) -> crate::Result<(String, f32)> {
            Ok((self.0.to_string(), 0.9))
        }
    }

    struct Broken;

    impl TextRecognizer for Broken {
        fn recognize_text(&self, _region: &RgbaImage) -> crate::Result<(String, f32)> {
            anyhow::bail!("engine offline")
        }
    }

    fn record(index: usize) -> EmittedRecord {
        let fp = Fingerprinter::new(FingerprintConfig::default());
        EmittedRecord {
            index,
            fingerprint: fp.fingerprint_image(GrayImage::new(16, 16)),
            source_frame: 2,
            scroll_offset: 300,
            template: "row".to_string(),
            category: None,
            region: BBox::new(0, 0, 16, 16),
            confidence: 0.93,
            clipped: false,
            crop: Arc::new(RgbaImage::new(16, 16)),
        }
    }

    #[test]
    fn test_worker_parses_in_emission_order() -> crate::Result<()> {
        let (mut sink, receiver) = record_channel();
        let worker = spawn_record_worker(receiver, FixedText("Kestrel 45b"), AmountParser::new())?;

        for i in 0..3 {
            sink.accept(&record(i))?;
        }
        drop(sink);

        let parsed = worker.join().map_err(|_| anyhow::anyhow!("worker panicked"))?;
        assert_eq!(parsed.len(), 3);
        assert!(parsed.iter().all(|p| p.parse_success));
        let order: Vec<usize> = parsed.iter().map(|p| p.origin.index).collect();
        assert_eq!(order, vec![0, 1, 2]);
        Ok(())
    }

    #[test]
    fn test_recognition_failure_yields_unreadable_record() {
        let parsed = process_record(&Broken, &AmountParser::new(), &record(0));
        assert!(!parsed.parse_success);
        assert_eq!(parsed.parse_error.as_deref(), Some("engine offline"));
    }

    #[test]
    fn test_closed_channel_is_reported() {
        let (mut sink, receiver) = record_channel();
        drop(receiver);
        assert!(matches!(sink.accept(&record(0)), Err(SinkError::Closed)));
    }
}
