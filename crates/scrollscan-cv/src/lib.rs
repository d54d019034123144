//! Scrollscan Computer Vision Library
//!
//! Incremental capture of a scrolling feed: templates are matched against
//! every captured frame at several scales, matched regions are fingerprinted
//! so each on-screen record is emitted exactly once, and a small state
//! machine decides when to scroll and when the list is exhausted.

pub mod bbox;
pub mod fingerprint;
pub mod frame;
pub mod markers;
pub mod replay;
pub mod session;
pub mod template;
pub mod utils;

// Re-export commonly used types
pub use bbox::{BBox, CandidateSet, ClippedEdges, MatchCandidate};
pub use fingerprint::{ContentFingerprint, Deduplicator, FingerprintConfig, Fingerprinter};
pub use frame::{Frame, FrameWindow};
pub use markers::{MarkerDetector, MarkerState};
pub use replay::ReplaySource;
pub use session::{
    CancellationFlag, EmittedRecord, ScrollController, SessionConfig, SessionError,
    SessionResult, SessionState,
};
pub use template::{
    MatcherConfig, ScaleRange, Template, TemplateDescriptor, TemplateKind, TemplateMatcher,
    TemplateSet, TemplateStore,
};

// Error handling
pub type Result<T> = anyhow::Result<T>;

/// Seams between the engine and the outside world
pub mod traits {
    use crate::session::{CaptureError, EmittedRecord, ScrollDirection, SinkError};
    use image::RgbaImage;

    /// Screenshot acquisition and input injection.
    ///
    /// The controller stamps sequence numbers and scroll offsets; sources
    /// only hand back raw pixels.
    pub trait FrameSource {
        fn capture_frame(&mut self) -> Result<RgbaImage, CaptureError>;

        /// Returns `false` when the scroll could not be issued.
        fn scroll(&mut self, amount: u32, direction: ScrollDirection) -> bool;
    }

    /// Receives emitted records in emission order.
    pub trait RecordSink {
        fn accept(&mut self, record: &EmittedRecord) -> Result<(), SinkError>;
    }

    /// Text recognition over a cropped record region.
    pub trait TextRecognizer: Send {
        /// Recognized text and a confidence in `0.0..=1.0`.
        fn recognize_text(&self, region: &RgbaImage) -> crate::Result<(String, f32)>;
    }

    impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
        fn capture_frame(&mut self) -> Result<RgbaImage, CaptureError> {
            (**self).capture_frame()
        }

        fn scroll(&mut self, amount: u32, direction: ScrollDirection) -> bool {
            (**self).scroll(amount, direction)
        }
    }

    impl<T: RecordSink + ?Sized> RecordSink for Box<T> {
        fn accept(&mut self, record: &EmittedRecord) -> Result<(), SinkError> {
            (**self).accept(record)
        }
    }
}
