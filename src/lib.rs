//! Scrollscan: capture records from a scrolling feed.
//!
//! The engine lives in `scrollscan-cv`; this crate wires it to recorded
//! screenshots, an external OCR command and a JSON report.

pub mod ocr;
pub mod pipeline;

pub use pipeline::{PipelineOptions, Preset, Report};
