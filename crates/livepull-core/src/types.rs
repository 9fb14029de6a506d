//! Core types for livepull

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a pull session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raw transport-stream fragment as delivered by the server
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    /// Duration in seconds
    pub duration: f64,
    /// Raw payload bytes
    pub payload: Bytes,
}

impl Fragment {
    pub fn new(duration: f64, payload: impl Into<Bytes>) -> Self {
        Self {
            duration,
            payload: payload.into(),
        }
    }
}

/// Output reported by a remuxing engine for one pushed fragment
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemuxOutput {
    /// Initialization segment, omitted by engines once it has been emitted
    pub init_segment: Option<Bytes>,
    /// Media segment bytes
    pub data: Bytes,
}

/// Playable segment produced by the remux queue
#[derive(Debug, Clone, PartialEq)]
pub struct ProducedSegment {
    /// Duration in seconds, taken from the source fragment
    pub duration: f64,
    /// Initialization segment (the last one seen if the engine omitted it)
    pub init_segment: Bytes,
    /// Media segment bytes
    pub media_segment: Bytes,
}

/// Codec identifiers detected from the first init segment of a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecDescriptor {
    /// Audio codec string (empty when there is no audio track)
    pub audio_codec: String,
    /// Video codec string (empty when there is no video track)
    pub video_codec: String,
}

impl CodecDescriptor {
    /// MIME type used to create the sink buffer
    pub fn mime_type(&self) -> String {
        let codecs: Vec<&str> = [self.audio_codec.as_str(), self.video_codec.as_str()]
            .into_iter()
            .filter(|c| !c.is_empty())
            .collect();
        format!("video/mp4; codecs=\"{}\"", codecs.join(","))
    }

    pub fn is_empty(&self) -> bool {
        self.audio_codec.is_empty() && self.video_codec.is_empty()
    }
}

/// Terminal error kind carried by the close notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseError {
    /// Server rejected the credentials
    #[serde(rename = "error-auth")]
    Auth,
    /// No fragment arrived within the start-up window
    #[serde(rename = "error-timeout")]
    Timeout,
}

impl std::fmt::Display for CloseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseError::Auth => write!(f, "error-auth"),
            CloseError::Timeout => write!(f, "error-timeout"),
        }
    }
}

/// Protocol client connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not started
    Idle,
    /// Socket requested, waiting for the server
    Connecting,
    /// Server answered after the pull request
    Authenticated,
    /// Socket lost, reconnect scheduled
    Reconnecting,
    /// Closed for good, with the terminal error if any
    Closed(Option<CloseError>),
}

impl ConnectionState {
    /// Check if transition to target state is valid
    pub fn can_transition_to(&self, target: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, target),
            // From Idle
            (Idle, Connecting) | (Idle, Closed(_)) |
            // From Connecting
            (Connecting, Authenticated) | (Connecting, Reconnecting) | (Connecting, Closed(_)) |
            // From Authenticated
            (Authenticated, Reconnecting) | (Authenticated, Closed(_)) |
            // From Reconnecting
            (Reconnecting, Connecting) | (Reconnecting, Closed(_))
        )
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed(_))
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Authenticated => write!(f, "authenticated"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Closed(None) => write!(f, "closed"),
            ConnectionState::Closed(Some(err)) => write!(f, "closed-{}", err),
        }
    }
}

/// Playback buffer controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferState {
    /// Sink buffer not created yet (codec or sink not ready)
    NoSinkBuffer,
    /// Idle, waiting for segments
    Buffering,
    /// An append is pending on the sink
    Appending,
    /// A removal is pending on the sink
    Evicting,
    /// End of stream reached
    Ended,
}

impl std::fmt::Display for BufferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferState::NoSinkBuffer => write!(f, "no-sink-buffer"),
            BufferState::Buffering => write!(f, "buffering"),
            BufferState::Appending => write!(f, "appending"),
            BufferState::Evicting => write!(f, "evicting"),
            BufferState::Ended => write!(f, "ended"),
        }
    }
}
