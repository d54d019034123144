//! Session state machine states and transitions.
//!
//! The controller sequences through: WaitingStart → Capturing → Halting → Done.
//! Cancellation and fatal errors jump straight to Done.

use serde::{Deserialize, Serialize};

/// Session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Capturing until the start marker shows up
    WaitingStart,
    /// Emitting new records and scrolling
    Capturing,
    /// One last pass over the final frame
    Halting,
    /// Terminal
    Done,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        self == SessionState::Done
    }

    /// Transitions the controller is allowed to make.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (WaitingStart, Capturing) | (Capturing, Halting) | (Halting, Done)
        ) || (next == Done && self != Done)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::WaitingStart => write!(f, "WAITING_START"),
            SessionState::Capturing => write!(f, "CAPTURING"),
            SessionState::Halting => write!(f, "HALTING"),
            SessionState::Done => write!(f, "DONE"),
        }
    }
}

/// Why a transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    StartMarkerSeen,
    EndMarkerSeen,
    /// No new records for the configured number of iterations
    ContentExhausted,
    IterationLimit,
    FinalPassComplete,
    Cancelled,
    Failed,
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: SessionState,
    pub to: SessionState,
    pub reason: TransitionReason,
    /// Sequence number of the frame that triggered it, if any
    pub frame_sequence: Option<u64>,
}
