//! Transport abstraction for the Parlor realtime channel.
//!
//! The [`Transport`] trait defines a bidirectional text message channel
//! between the client and one chat room. The realtime protocol uses JSON
//! text frames, so every transport implementation must handle framing
//! internally (WebSocket frames, length-prefixed TCP, and so on).
//!
//! Connection setup is intentionally NOT part of this trait — different
//! transports have fundamentally different connection parameters. The
//! [`RealtimeChannel`](crate::channel::RealtimeChannel) dials through a
//! [`ChannelConnector`](crate::channel::ChannelConnector) instead, which
//! yields a connected `Transport`.

use async_trait::async_trait;

use crate::error::ParlorError;

/// A bidirectional text frame transport scoped to a single room.
///
/// Implementors shuttle serialized JSON strings between the client and
/// server. Each call to [`send`](Transport::send) transmits one complete
/// frame; each call to [`recv`](Transport::recv) returns one.
///
/// # Object Safety
///
/// This trait is object-safe; the channel holds a `Box<dyn Transport>`.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) **MUST** be cancel-safe because it is used
/// inside `tokio::select!`. If `recv` is cancelled before completion,
/// calling it again must not lose frames. Channel-based implementations
/// (e.g. wrapping `mpsc::Receiver`) are naturally cancel-safe.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send a JSON text frame to the server.
    ///
    /// # Errors
    ///
    /// Returns [`ParlorError::TransportSend`] if the frame could not be
    /// sent (connection broken, write buffer full).
    async fn send(&mut self, frame: String) -> Result<(), ParlorError>;

    /// Receive the next JSON text frame from the server.
    ///
    /// Returns:
    /// - `Some(Ok(text))` — a complete frame was received
    /// - `Some(Err(e))` — a transport error occurred
    /// - `None` — the connection was closed cleanly by the server
    ///
    /// # Cancel Safety
    ///
    /// This method **MUST** be cancel-safe (see [trait documentation](Transport)).
    async fn recv(&mut self) -> Option<Result<String, ParlorError>>;

    /// Close the transport connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the graceful shutdown fails. Implementations
    /// should still release resources even if the close handshake fails.
    async fn close(&mut self) -> Result<(), ParlorError>;
}
