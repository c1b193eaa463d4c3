use thiserror::Error;

/// Result type for peer operations
pub type Result<T> = std::result::Result<T, PeerError>;

/// Why the read side of a peer stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The inbound stream reached EOF
    StreamEnded,
    /// Reading from the inbound stream failed
    Transport(String),
    /// The remote side broke the line protocol
    Protocol(String),
    /// The peer was shut down locally
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::StreamEnded => write!(f, "stream ended"),
            CloseReason::Transport(msg) => write!(f, "transport error: {}", msg),
            CloseReason::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            CloseReason::Shutdown => write!(f, "shut down"),
        }
    }
}

/// Peer error types
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed: {0}")]
    Closed(CloseReason),
}

impl PeerError {
    /// True when the error means the connection is gone for good
    pub fn is_closed(&self) -> bool {
        matches!(self, PeerError::Closed(_))
    }
}
