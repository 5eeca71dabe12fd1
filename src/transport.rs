//! Transport abstraction for the watch-room protocol.
//!
//! The [`Transport`] trait defines a bidirectional text frame channel between
//! the client and the relay. The protocol uses one JSON object per frame (plus a
//! bare identity string as the very first frame), so every transport
//! implementation must handle framing internally.
//!
//! # Connection Setup
//!
//! Unlike a one-shot client, the room engine has to reconnect on its own after
//! a drop. Connection setup is therefore delegated to a [`Connector`], which
//! the engine's reconnection controller calls each time it needs a fresh
//! [`Transport`]. Nothing else in the crate creates transports.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use watchroom_client::error::WatchRoomError;
//! use watchroom_client::transport::{CloseCode, Connector, Transport};
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, frame: String) -> Result<(), WatchRoomError> {
//!         todo!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, WatchRoomError>> {
//!         // Return None when the connection is closed by the peer
//!         todo!()
//!     }
//!
//!     async fn close(&mut self, code: CloseCode) -> Result<(), WatchRoomError> {
//!         todo!()
//!     }
//! }
//!
//! struct MyConnector;
//!
//! #[async_trait]
//! impl Connector for MyConnector {
//!     async fn connect(&self) -> Result<Box<dyn Transport>, WatchRoomError> {
//!         Ok(Box::new(MyTransport {}))
//!     }
//! }
//! ```

use std::fmt;

use async_trait::async_trait;

use crate::error::WatchRoomError;

/// A connection close status code.
///
/// Code `1000` (normal closure) is reserved to mean an intentional shutdown:
/// a close carrying it never triggers reconnection. Any other code, or a
/// close without a code, is treated as abnormal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    /// Normal, intentional closure.
    pub const NORMAL: CloseCode = CloseCode(1000);
    /// The endpoint is going away (e.g. server restart).
    pub const GOING_AWAY: CloseCode = CloseCode(1001);
    /// The connection dropped without a close frame.
    pub const ABNORMAL: CloseCode = CloseCode(1006);

    /// Returns `true` if this code marks an intentional shutdown.
    pub fn is_normal(self) -> bool {
        self == Self::NORMAL
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A bidirectional text frame transport for the watch-room protocol.
///
/// Each call to [`send`](Transport::send) transmits one complete frame.
/// Each call to [`recv`](Transport::recv) returns one complete frame.
///
/// # Object Safety
///
/// This trait is object-safe; a [`Connector`] hands out `Box<dyn Transport>`.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method **MUST** be cancel-safe because it is used
/// inside `tokio::select!`. If `recv` is cancelled before completion, calling it
/// again must not lose data.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send a text frame to the relay.
    ///
    /// # Errors
    ///
    /// Returns [`WatchRoomError::TransportSend`] if the frame could not be sent,
    /// or [`WatchRoomError::TransportClosed`] after [`close`](Transport::close).
    async fn send(&mut self, frame: String) -> Result<(), WatchRoomError>;

    /// Receive the next text frame from the relay.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete frame was received
    /// - `Some(Err(e))`: a transport error occurred
    /// - `None`: the peer closed the connection; see [`close_code`](Transport::close_code)
    async fn recv(&mut self) -> Option<Result<String, WatchRoomError>>;

    /// Close the transport gracefully with the given status code.
    ///
    /// Closing an already-closed transport must be a no-op.
    async fn close(&mut self, code: CloseCode) -> Result<(), WatchRoomError>;

    /// The close code sent by the peer, once [`recv`](Transport::recv) has
    /// returned `None`. `None` means the peer closed without a code, which
    /// the engine treats as abnormal.
    fn close_code(&self) -> Option<CloseCode> {
        None
    }
}

/// Opens new [`Transport`] connections to the relay.
///
/// Called by the engine's reconnection controller for the initial connection
/// and for every retry.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish a new connection.
    ///
    /// # Errors
    ///
    /// Any error is treated as an abnormal close and enters the backoff path.
    async fn connect(&self) -> Result<Box<dyn Transport>, WatchRoomError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_1000_is_normal() {
        assert!(CloseCode::NORMAL.is_normal());
        assert!(CloseCode(1000).is_normal());
        assert!(!CloseCode::GOING_AWAY.is_normal());
        assert!(!CloseCode::ABNORMAL.is_normal());
        assert!(!CloseCode(4000).is_normal());
    }

    #[test]
    fn transport_is_object_safe() {
        fn assert_object_safe(_: Option<Box<dyn Transport>>) {}
        assert_object_safe(None);
    }

    #[test]
    fn close_code_displays_numeric_value() {
        assert_eq!(CloseCode::ABNORMAL.to_string(), "1006");
    }
}
