//! Events delivered to the host on the channel returned by
//! [`WatchRoomClient::start`](crate::client::WatchRoomClient::start).

use std::time::Duration;

use crate::chat::ChatMessage;
use crate::playback::SyncStatus;
use crate::presence::Participant;
use crate::protocol::RemotePlayback;
use crate::transport::CloseCode;

/// Something the host may want to render or act on.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchRoomEvent {
    /// A connection opened and the identity was sent.
    Connected,

    /// The current connection ended.
    ///
    /// `code` is the peer's close code, `None` for a drop or failed connect.
    /// Follows every `Connected`, and is also sent once when the engine
    /// shuts down.
    Disconnected {
        reason: Option<String>,
        code: Option<CloseCode>,
    },

    /// A reconnect attempt will start after `delay`.
    ReconnectScheduled { attempt: u32, delay: Duration },

    /// The retry budget is spent. The engine stays disconnected until
    /// [`restart`](crate::client::WatchRoomClient::restart).
    ReconnectsExhausted { attempts: u32 },

    /// The playback handshake moved to a new status.
    SyncStatusChanged(SyncStatus),

    /// A remote participant changed the playback state; the player should
    /// switch to it.
    PlaybackChanged(RemotePlayback),

    /// A new chat message was stored.
    ChatMessage(ChatMessage),

    /// The set of participants currently typing changed.
    TypingChanged(Vec<String>),

    /// A presence snapshot was applied.
    PresenceChanged(Vec<Participant>),

    /// A participant's watch time changed (the local one included).
    WatchHoursChanged { name: String, hours: f64 },
}
