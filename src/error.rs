//! Error types for the watch-room client.

use thiserror::Error;

/// Errors that can occur when using the watch-room client.
///
/// Network and protocol failures never reach the host as errors: the engine
/// logs them and folds them into a status value or a
/// [`WatchRoomEvent`](crate::WatchRoomEvent). The variants here surface either
/// from [`Transport`](crate::Transport) implementations (consumed by the engine)
/// or from host-facing API misuse.
#[derive(Debug, Error)]
pub enum WatchRoomError {
    /// Failed to send a frame through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a frame from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was already closed.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a wire frame.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An inbound frame was not a JSON object with a string `type` field.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// An inbound frame declared a `type` this client does not understand.
    #[error("unknown frame type: {0}")]
    UnknownFrameType(String),

    /// The background engine has exited (after shutdown, or the handle was dropped).
    #[error("room engine has stopped")]
    EngineStopped,

    /// A queued video reference did not carry a recognizable video id.
    #[error("invalid video reference: {0}")]
    InvalidVideoUrl(String),

    /// The external key-value store rejected a read or write.
    #[error("key-value store error: {0}")]
    Store(String),

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type for watch-room client operations.
pub type Result<T> = std::result::Result<T, WatchRoomError>;
