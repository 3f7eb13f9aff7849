use std::time::Duration;

/// Errors that can occur in broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// No reply arrived before the call's deadline.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// Another live connection already owns this host name.
    #[error("a host with the name `{0}` is already registered")]
    DuplicateHost(String),

    /// The browser reported an application-level failure.
    #[error("browser error: {0}")]
    Browser(String),

    /// A peer sent something that violates the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The opening handshake was malformed or used another protocol version.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The connection carrying the call went away.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The relay link to the primary broker dropped.
    #[error("relay upstream lost")]
    UpstreamLost,

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] browserfetch_frame::FrameError),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] browserfetch_transport::TransportError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The URL handed to `fetch` cannot be used.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// The broker has been shut down.
    #[error("broker is shut down")]
    Shutdown,
}

impl BrokerError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BrokerError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
