//! Error types for the Parlor client.

use thiserror::Error;

/// Errors that can occur when using the Parlor client.
#[derive(Debug, Error)]
pub enum ParlorError {
    /// The user supplied input the server (or a local check) rejected.
    #[error("validation error: {message}")]
    Validation {
        /// Human-readable description of what was rejected.
        message: String,
    },

    /// The session credential is absent or was rejected by the server.
    ///
    /// Whenever this is returned by [`AuthenticatedTransport`](crate::http::AuthenticatedTransport)
    /// the local credential has already been cleared.
    #[error("session invalid or expired")]
    SessionInvalid,

    /// The requested room does not exist (or the existence probe failed).
    #[error("room not found: {room_id}")]
    RoomNotFound {
        /// The room that was probed.
        room_id: String,
    },

    /// The server answered a REST call with a non-success status.
    #[error("server rejected request ({status}): {detail}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Server-provided detail message, or a generic fallback.
        detail: String,
    },

    /// A REST request failed before a response was received.
    #[error("request error: {0}")]
    Request(String),

    /// Failed to send a frame through the realtime transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a frame from the realtime transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The realtime transport connection was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// Attempted an operation that requires an open channel, but the
    /// channel is not open. Publishing reports this instead of silently
    /// dropping the frame.
    #[error("channel not connected")]
    NotConnected,

    /// Failed to serialize or deserialize a protocol message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type for Parlor client operations.
pub type Result<T> = std::result::Result<T, ParlorError>;
