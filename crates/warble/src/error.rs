//! Errors surfaced to callers of the engine and its sessions.

use std::sync::Arc;

use thiserror::Error;

use crate::session::SessionState;

/// Broad error classes, used by callers to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Another session holds the engine; retry later.
    Admission,
    /// The process is gone or could not be reached.
    Transport,
    /// The engine broke the framing contract for this session.
    Protocol,
    /// The engine reported a failure of its own.
    Engine,
    /// The process ended or was shut down underneath the session.
    Termination,
    /// The caller used the session out of order.
    Usage,
}

/// Everything that can go wrong while driving the engine.
///
/// `Clone` so a single failure can be delivered to both the audio stream and
/// the metadata future of a session.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("engine is busy with session {active}")]
    Busy { active: String },

    #[error("engine process is not running")]
    NotRunning,

    #[error("failed to spawn engine {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("engine I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    #[error("failed to encode control event: {0}")]
    Encode(String),

    #[error("audio sequence gap: expected seq {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },

    #[error("audio payload length mismatch: header declared {declared} bytes, got {actual}")]
    PayloadLength { declared: usize, actual: usize },

    #[error("unexpected {frame} frame while session is {state}")]
    UnexpectedFrame {
        frame: &'static str,
        state: SessionState,
    },

    #[error("engine reported an error{}: {message}", code_suffix(.code))]
    Engine {
        message: String,
        code: Option<String>,
    },

    #[error("engine process ended ({status})")]
    ProcessEnded { status: String },

    #[error("engine was killed after the shutdown grace period")]
    ShutdownTimeout,

    #[error("text must not be empty")]
    EmptyText,

    #[error("text was already sent for this session")]
    TextAlreadySent,

    #[error("end called before any text was sent")]
    EndBeforeText,

    #[error("end was already called for this session")]
    AlreadyEnded,

    #[error("session is already {0}")]
    SessionClosed(SessionState),

    #[error("audio stream was already taken from this session")]
    StreamTaken,

    #[error("session was cancelled by its consumer")]
    Cancelled,

    #[error("consumer fell behind: {buffered} bytes of unread audio exceeds {limit}")]
    AudioBacklog { buffered: usize, limit: usize },
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_ref().map(|c| format!(" [{}]", c)).unwrap_or_default()
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(Arc::new(err))
    }
}

impl From<warbleproto::FrameError> for EngineError {
    fn from(err: warbleproto::FrameError) -> Self {
        EngineError::Encode(err.to_string())
    }
}

impl EngineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::Busy { .. } => ErrorCategory::Admission,
            EngineError::NotRunning
            | EngineError::Spawn { .. }
            | EngineError::Io(_)
            | EngineError::Encode(_) => ErrorCategory::Transport,
            EngineError::SequenceGap { .. }
            | EngineError::PayloadLength { .. }
            | EngineError::UnexpectedFrame { .. } => ErrorCategory::Protocol,
            EngineError::Engine { .. } => ErrorCategory::Engine,
            EngineError::ProcessEnded { .. } | EngineError::ShutdownTimeout => {
                ErrorCategory::Termination
            }
            EngineError::EmptyText
            | EngineError::TextAlreadySent
            | EngineError::EndBeforeText
            | EngineError::AlreadyEnded
            | EngineError::SessionClosed(_)
            | EngineError::StreamTaken
            | EngineError::Cancelled
            | EngineError::AudioBacklog { .. } => ErrorCategory::Usage,
        }
    }

    /// Admission failures are the only ones worth retrying unchanged.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Admission
    }
}
