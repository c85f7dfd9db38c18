//! Error taxonomy for the tunnel core.
//!
//! Each variant maps to exactly one caller-visible outcome; the HTTP layer
//! translates them in [`crate::routes`].

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectorError {
    /// No live session is registered for the requested identifier.
    #[error("no open channel for {0}")]
    OpenChannelNotFound(String),

    /// The session died while the call was in flight.
    #[error("channel closed")]
    ChannelClosed,

    /// The controller did not answer within the call's timeout.
    #[error("call timed out after {0} ms")]
    CallTimeout(u64),

    /// The caller gave up before a response arrived.
    #[error("call cancelled")]
    CallCancelled,

    /// A frame could not be decoded (or a message could not be encoded).
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A pending call with the same correlation id already exists.
    #[error("duplicate correlation id: {0}")]
    DuplicateCorrelationId(String),

    /// The handshake credentials were missing, unknown, or expired.
    #[error("unauthorized")]
    Unauthorized,

    /// The underlying socket failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A payload envelope (HTTP request/response) could not be built or parsed.
    #[error("invalid envelope: {0}")]
    Envelope(String),

    /// A request body exceeded the frame size limit (bytes).
    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    /// Identity storage could not be read.
    #[error("repository error: {0}")]
    Repository(String),
}

impl ConnectorError {
    /// Short machine-readable code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::OpenChannelNotFound(_) => "DEVICE_NOT_CONNECTED",
            Self::ChannelClosed => "DEVICE_DISCONNECTED",
            Self::CallTimeout(_) => "TIMEOUT",
            Self::CallCancelled => "CANCELLED",
            Self::MalformedFrame(_) => "MALFORMED_FRAME",
            Self::DuplicateCorrelationId(_) => "DUPLICATE_CORRELATION_ID",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Envelope(_) => "INVALID_ENVELOPE",
            Self::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            Self::Repository(_) => "REPOSITORY_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, ConnectorError>;
