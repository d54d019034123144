//! What a session hands back to its caller

use super::error::SessionError;
use super::sink::EmittedRecord;
use super::state::{SessionState, StateTransition};
use anyhow::Context;
use serde::{Serialize, Serializer};
use std::path::Path;
use thiserror::Error;

/// Counters collected over one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub captures: u32,
    pub capture_retries: u32,
    pub scrolls: u32,
    /// CAPTURING iterations run
    pub iterations: u32,
    /// Matches skipped because their record was already emitted
    pub duplicates_skipped: u32,
    /// Record regions cut by the frame edge and left for a later frame
    pub deferred_regions: u32,
    /// Record regions cut by the edge content scrolls out through
    pub leaving_regions: u32,
    /// Consecutive frames that came back pixel-identical
    pub stalled_frames: u32,
}

/// Outcome of a session. Records accumulated before a failure or
/// cancellation are always kept.
#[derive(Debug, Serialize)]
pub struct SessionResult {
    /// Emitted records in emission order
    pub records: Vec<EmittedRecord>,
    pub final_state: SessionState,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<SessionError>,
    /// Ended by the cancellation flag; `records` is partial
    pub cancelled: bool,
    pub transitions: Vec<StateTransition>,
    pub stats: SessionStats,
}

/// A failed session together with what it emitted before failing.
#[derive(Debug, Error)]
#[error("session failed after {} records: {error}", .partial.len())]
pub struct SessionFailure {
    #[source]
    pub error: SessionError,
    pub partial: Vec<EmittedRecord>,
}

impl SessionResult {
    /// Ran to DONE without error or cancellation.
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && !self.cancelled
    }

    /// Records on success (including cancelled sessions); the error and
    /// the partial records otherwise.
    pub fn into_result(self) -> Result<Vec<EmittedRecord>, SessionFailure> {
        match self.error {
            None => Ok(self.records),
            Some(error) => Err(SessionFailure {
                error,
                partial: self.records,
            }),
        }
    }

    /// Export the result as pretty JSON.
    pub fn export_json(&self, output_path: &Path) -> crate::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize session result")?;

        std::fs::write(output_path, json)
            .with_context(|| format!("Failed to write JSON to: {:?}", output_path))?;

        Ok(())
    }
}

/// Error with its whole source chain, `outer: inner: root`.
pub fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn serialize_error<S: Serializer>(error: &Option<SessionError>, serializer: S) -> Result<S::Ok, S::Error> {
    error
        .as_ref()
        .map(|e| error_chain(e))
        .serialize(serializer)
}
