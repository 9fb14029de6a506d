//! Error types for livepull core

use thiserror::Error;

/// Result type alias for livepull operations
pub type Result<T> = std::result::Result<T, Error>;

/// Livepull error types
#[derive(Error, Debug)]
pub enum Error {
    // Protocol errors
    #[error("Server rejected the pull credentials")]
    AuthRejected,

    #[error("No fragment received within {timeout_ms}ms")]
    StartupTimeout { timeout_ms: u64 },

    // Queue misuse
    #[error("add_fragment() called after end()")]
    FragmentAfterEnd,

    #[error("add_segment() called after end()")]
    SegmentAfterEnd,

    // Container parsing errors
    #[error("Malformed {box_type} box: {reason}")]
    MalformedBox {
        box_type: String,
        reason: String,
    },

    #[error("Missing {0} box")]
    MissingBox(String),

    #[error("Init segment has no audio or video track")]
    NoMediaTracks,

    // Collaborator errors
    #[error("Remux engine error: {0}")]
    Remux(String),

    #[error("Buffer sink error: {0}")]
    Sink(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a malformed box error
    pub fn malformed(box_type: &str, reason: impl Into<String>) -> Self {
        Error::MalformedBox {
            box_type: box_type.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns true if the session keeps going after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::MalformedBox { .. }
                | Error::MissingBox(_)
                | Error::NoMediaTracks
                | Error::Remux(_)
        )
    }

    /// Returns the error code reported with session error events
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::AuthRejected => "AUTH_REJECTED",
            Error::StartupTimeout { .. } => "STARTUP_TIMEOUT",
            Error::FragmentAfterEnd => "FRAGMENT_AFTER_END",
            Error::SegmentAfterEnd => "SEGMENT_AFTER_END",
            Error::MalformedBox { .. } => "MALFORMED_BOX",
            Error::MissingBox(_) => "MISSING_BOX",
            Error::NoMediaTracks => "NO_MEDIA_TRACKS",
            Error::Remux(_) => "REMUX",
            Error::Sink(_) => "SINK",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::Json(_) => "JSON",
            Error::Io(_) => "IO",
        }
    }
}
