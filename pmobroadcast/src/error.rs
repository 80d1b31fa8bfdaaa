//! Error types for pmobroadcast

use crate::content::BroadcastState;
use crate::ids::EventId;

/// Result type alias for voice broadcast operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can cross the aggregator or recording service boundary
///
/// Per-event problems (malformed content, foreign sender, undecrypted payload)
/// never show up here: they are absorbed by the aggregator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The start event is missing, undecodable or has no sender
    #[error("Invalid voice broadcast start event: {0}")]
    InvalidStartEvent(EventId),

    /// The requested transition is not allowed from the current state
    #[error("Unexpected voice broadcast state transition from {} to {to}", display_state(.from))]
    UnexpectedState {
        from: Option<BroadcastState>,
        to: BroadcastState,
    },

    /// No broadcast has been started by this service yet
    #[error("Voice broadcast not started")]
    NotStarted,

    /// The session has no user id to use as state key
    #[error("Missing user id for the current session")]
    MissingUserId,

    /// Another broadcast of the current user is still running elsewhere
    #[error("A voice broadcast is already in progress in room {0}")]
    BroadcastInProgress(String),

    /// Sending this chunk would exceed the configured maximum length
    #[error("Voice broadcast maximum length reached ({0}s)")]
    MaxLengthReached(u64),

    /// The serialized worker is gone
    #[error("Voice broadcast service is closed")]
    ServiceClosed,

    /// Room collaborator failure (fetch, send, upload)
    #[error("Room error: {0}")]
    Room(#[from] anyhow::Error),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML parsing failed
    #[error("YAML parsing failed: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn display_state(state: &Option<BroadcastState>) -> String {
    match state {
        Some(state) => state.to_string(),
        None => "none".to_string(),
    }
}

impl Error {
    /// Create an unexpected transition error
    pub fn unexpected_state(from: Option<BroadcastState>, to: BroadcastState) -> Self {
        Self::UnexpectedState { from, to }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
