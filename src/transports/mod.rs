//! Transport implementations for the watch-room protocol.
//!
//! This module provides concrete [`Transport`](crate::Transport) and
//! [`Connector`](crate::Connector) implementations behind feature gates.
//! Enable the corresponding Cargo feature to pull in a transport:
//!
//! | Feature                | Transport              | Connector              |
//! |------------------------|------------------------|------------------------|
//! | `transport-websocket`  | [`WebSocketTransport`] | [`WebSocketConnector`] |
//!
//! # Example
//!
//! ```rust,ignore
//! # async fn example() -> Result<(), watchroom_client::WatchRoomError> {
//! use std::sync::Arc;
//! use watchroom_client::{MemoryStore, WatchRoomClient, WatchRoomConfig, WebSocketConnector};
//!
//! let connector = WebSocketConnector::new("ws://localhost:8080/ws");
//! let (client, mut events) =
//!     WatchRoomClient::start(connector, WatchRoomConfig::new("alice"), Arc::new(MemoryStore::new()));
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "transport-websocket")]
pub mod websocket;

#[cfg(feature = "transport-websocket")]
pub use websocket::{WebSocketConnector, WebSocketTransport};
