//! Capture sessions: configuration, the scroll controller state machine,
//! its error taxonomy and the record hand-off.

pub mod config;
pub mod controller;
pub mod error;
pub mod result;
pub mod sink;
pub mod state;

pub use config::{RetryPolicy, ScrollConfig, ScrollDirection, SessionConfig};
pub use controller::{CancellationFlag, ScrollController};
pub use error::{CaptureError, ConfigurationError, FrameSnapshot, SessionError, SinkError};
pub use result::{error_chain, SessionFailure, SessionResult, SessionStats};
pub use sink::{
    process_record, record_channel, spawn_record_worker, ChannelSink, CollectingSink,
    EmittedRecord,
};
pub use state::{SessionState, StateTransition, TransitionReason};
