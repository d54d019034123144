//! Session error taxonomy
//!
//! Capture failures are transient and retried with backoff; everything
//! else is fatal on first occurrence.

use super::config::ScrollDirection;
use crate::frame::Frame;
use crate::template::matcher::MatchError;
use crate::template::StoreError;
use std::sync::Arc;
use thiserror::Error;

/// Failures of the capture primitive.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture primitive returned no image")]
    NoImage,
    #[error("capture took {elapsed_ms} ms, over the {limit_ms} ms limit")]
    Timeout { elapsed_ms: u64, limit_ms: u64 },
    #[error("scroll {direction} by {amount} px was not issued")]
    ScrollRejected { amount: u32, direction: ScrollDirection },
    #[error("capture failed: {0}")]
    Primitive(String),
    #[error("gave up after {attempts} attempts")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<CaptureError>,
    },
}

/// Malformed or missing configuration, templates or thresholds.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failure handing a record to the downstream sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("record sink is closed")]
    Closed,
    #[error("record sink failed: {0}")]
    Failed(String),
}

/// The frame a session last looked at, kept for diagnostics.
#[derive(Clone)]
pub struct FrameSnapshot(pub Arc<Frame>);

impl std::fmt::Debug for FrameSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSnapshot")
            .field("sequence", &self.0.sequence)
            .field("width", &self.0.width())
            .field("height", &self.0.height())
            .finish()
    }
}

/// Why a session ended early. Always fatal.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("capture failed")]
    Capture(#[source] CaptureError),
    #[error("configuration error")]
    Configuration(#[from] ConfigurationError),
    #[error("start marker not seen in {attempts} captures")]
    StartMarkerNotFound {
        attempts: u32,
        last_frame: Option<FrameSnapshot>,
    },
    #[error("feed ended without the end marker")]
    EndMarkerNotFound { last_frame: Option<FrameSnapshot> },
    #[error("record sink failed")]
    Sink(#[from] SinkError),
}

impl SessionError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        SessionError::Configuration(ConfigurationError::Invalid(reason.into()))
    }

    /// Frame kept for diagnostics, if any.
    pub fn last_frame(&self) -> Option<&Arc<Frame>> {
        match self {
            SessionError::StartMarkerNotFound { last_frame, .. }
            | SessionError::EndMarkerNotFound { last_frame } => last_frame.as_ref().map(|s| &s.0),
            _ => None,
        }
    }
}

impl From<MatchError> for SessionError {
    fn from(err: MatchError) -> Self {
        SessionError::Configuration(err.into())
    }
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        SessionError::Configuration(err.into())
    }
}
