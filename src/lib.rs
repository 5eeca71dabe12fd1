//! # Watchroom Client
//!
//! Client-side synchronization engine for a shared watch room.
//!
//! A group of people join a room through a relay server. Each client keeps a
//! playback queue, a chat log, a roster of who is online and a cumulative
//! watch-time counter consistent with everyone else, over one JSON text
//! connection that reconnects by itself.
//!
//! ## Features
//!
//! - **Transport-agnostic**: implement [`Transport`] and [`Connector`] for any backend
//! - **Self-healing**: exponential backoff reconnects after abnormal closes
//! - **Last writer wins**: playback changes made offline are flushed on reconnect
//! - **WebSocket built-in**: the default `transport-websocket` feature provides
//!   `WebSocketTransport` and `WebSocketConnector`
//! - **Event-driven**: receive typed [`WatchRoomEvent`]s via a channel
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use watchroom_client::{
//!     resolve_identity, MemoryStore, WatchRoomClient, WatchRoomConfig, WatchRoomEvent,
//!     WebSocketConnector,
//! };
//!
//! let store = Arc::new(MemoryStore::new());
//! let identity = resolve_identity(store.as_ref(), None);
//! let connector = WebSocketConnector::new("ws://localhost:8080/ws");
//! let (mut client, mut events) =
//!     WatchRoomClient::start(connector, WatchRoomConfig::new(identity), store);
//!
//! client.enqueue("https://www.youtube.com/watch?v=dQw4w9WgXcQ")?;
//! client.send_chat("hi all")?;
//!
//! while let Some(event) = events.recv().await {
//!     if let WatchRoomEvent::ChatMessage(msg) = event {
//!         println!("{}: {}", msg.sender, msg.content);
//!     }
//! }
//! client.shutdown().await;
//! ```

pub mod chat;
pub mod client;
mod engine;
pub mod error;
pub mod event;
pub mod playback;
pub mod presence;
pub mod protocol;
pub mod reconnect;
mod room;
pub mod session;
pub mod transport;
pub mod transports;
pub mod watch_time;

// Re-export primary types for ergonomic imports.
pub use chat::{ChatMessage, ChatSettings};
pub use client::{WatchRoomClient, WatchRoomConfig};
pub use error::{Result, WatchRoomError};
pub use event::WatchRoomEvent;
pub use playback::{PlaybackState, SyncStatus};
pub use presence::Participant;
pub use protocol::{ClientFrame, RemotePlayback, ServerFrame};
pub use reconnect::ReconnectPolicy;
pub use session::ConnectionState;
pub use transport::{CloseCode, Connector, Transport};
pub use watch_time::{resolve_identity, KeyValueStore, MemoryStore, WatchTimeSettings};

#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};
