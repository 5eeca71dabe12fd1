//! Wire-compatible frame types for the watch-room relay protocol.
//!
//! Every frame is a JSON object with a `type` discriminator. The one exception
//! is the very first frame after connecting: the bare identity string, which
//! the relay uses to key presence (see [`crate::session`]).
//!
//! Frames the client sends are [`ClientFrame`]s; frames the relay delivers are
//! [`ServerFrame`]s. The relay stamps a `sender` onto every relayed frame and
//! omits zero-valued fields (`omitempty`), so almost every inbound field is
//! `#[serde(default)]`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, WatchRoomError};

// ── Enums ───────────────────────────────────────────────────────────

/// Play/pause flag as carried on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackFlag {
    /// Playback is running.
    Play,
    /// Playback is paused. The relay may normalize `"stop"` to this value;
    /// older relays forward `"stop"` verbatim.
    #[default]
    #[serde(alias = "stop")]
    Pause,
}

impl PlaybackFlag {
    /// Returns `true` for [`PlaybackFlag::Play`].
    pub fn is_playing(self) -> bool {
        matches!(self, PlaybackFlag::Play)
    }

    /// Build the flag from a boolean playing state.
    pub fn from_playing(playing: bool) -> Self {
        if playing {
            PlaybackFlag::Play
        } else {
            PlaybackFlag::Pause
        }
    }
}

// ── Payloads ────────────────────────────────────────────────────────

/// Full playback snapshot carried by `video` frames.
///
/// Level-triggered: every frame carries the whole state, so a single later
/// frame resynchronizes a peer that missed any number of earlier ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VideoPayload {
    /// Reference of the selected video, empty when nothing is selected.
    #[serde(default)]
    pub video_url: String,
    #[serde(default)]
    pub playback_state: PlaybackFlag,
    /// Position in seconds.
    #[serde(default)]
    pub current_time: f64,
    #[serde(default)]
    pub queue: Vec<String>,
    /// Selected queue index, `-1` when nothing is selected.
    #[serde(default)]
    pub index: i64,
    /// Sender wall clock in milliseconds. The relay does not forward it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// The playback state handed to the host when a remote change is applied.
///
/// This is what the host's player should switch to; it mirrors the fields of
/// the frame that carried it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePlayback {
    pub video_url: String,
    pub playback_state: PlaybackFlag,
    pub current_time: f64,
    pub queue: Vec<String>,
    pub index: i64,
}

impl From<VideoPayload> for RemotePlayback {
    fn from(payload: VideoPayload) -> Self {
        Self {
            video_url: payload.video_url,
            playback_state: payload.playback_state,
            current_time: payload.current_time,
            queue: payload.queue,
            index: payload.index,
        }
    }
}

/// Body of a server-to-client `sync` frame.
///
/// A response without a `videoUrl` means the room has nothing to resume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(default)]
    pub playback_state: PlaybackFlag,
    #[serde(default)]
    pub current_time: f64,
    #[serde(default)]
    pub queue: Vec<String>,
    #[serde(default)]
    pub index: i64,
}

impl SyncPayload {
    /// Returns the carried playback state, or `None` for an empty response.
    pub fn into_video(self) -> Option<VideoPayload> {
        let video_url = self.video_url.filter(|url| !url.is_empty())?;
        Some(VideoPayload {
            video_url,
            playback_state: self.playback_state,
            current_time: self.current_time,
            queue: self.queue,
            index: self.index,
            timestamp: None,
        })
    }
}

// ── Client → Server ─────────────────────────────────────────────────

/// Frames sent from the client to the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// A chat message.
    #[serde(rename = "message")]
    Message { content: String, timestamp: u64 },

    /// "I am typing" notification.
    #[serde(rename = "typing")]
    Typing { sender: String },

    /// Full playback snapshot.
    #[serde(rename = "video")]
    Video(VideoPayload),

    /// Request for the room's current playback state.
    #[serde(rename = "sync")]
    SyncRequest { timestamp: u64 },

    /// Local cumulative watch time, in hours.
    #[serde(rename = "watchHours")]
    WatchHours {
        #[serde(rename = "watchHours")]
        watch_hours: f64,
    },
}

impl ClientFrame {
    /// Short name of the frame type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Message { .. } => "message",
            ClientFrame::Typing { .. } => "typing",
            ClientFrame::Video(_) => "video",
            ClientFrame::SyncRequest { .. } => "sync",
            ClientFrame::WatchHours { .. } => "watchHours",
        }
    }

    /// Serialize this frame to its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`WatchRoomError::Serialization`] if serialization fails.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ── Server → Client ─────────────────────────────────────────────────

/// Frames delivered by the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// A chat message from any participant, the local one included.
    #[serde(rename = "message")]
    Message {
        #[serde(default)]
        sender: String,
        #[serde(default)]
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Full snapshot of who is online.
    #[serde(rename = "presence")]
    Presence {
        #[serde(default)]
        users: Vec<String>,
    },

    /// A participant is typing.
    #[serde(rename = "typing")]
    Typing {
        #[serde(default)]
        sender: String,
    },

    /// A participant's playback snapshot (also the relay's answer to a sync
    /// request and its greeting to new joiners).
    #[serde(rename = "video")]
    Video {
        #[serde(default)]
        sender: String,
        #[serde(flatten)]
        payload: VideoPayload,
    },

    /// Response to a sync request.
    #[serde(rename = "sync")]
    Sync {
        #[serde(flatten)]
        payload: SyncPayload,
    },

    /// A participant's cumulative watch time, in hours. The relay omits the
    /// value when it is zero.
    #[serde(rename = "watchHours")]
    WatchHours {
        #[serde(default)]
        sender: String,
        #[serde(rename = "watchHours", default, skip_serializing_if = "Option::is_none")]
        watch_hours: Option<f64>,
    },
}

/// Frame types understood by [`decode`].
const KNOWN_TYPES: &[&str] = &["message", "presence", "typing", "video", "sync", "watchHours"];

/// Decode one inbound frame.
///
/// # Errors
///
/// - [`WatchRoomError::MalformedFrame`] if the text is not a JSON object with a
///   string `type` field
/// - [`WatchRoomError::UnknownFrameType`] if the `type` is not in the catalogue
/// - [`WatchRoomError::Serialization`] if a known frame has ill-typed fields
///
/// The engine logs every error and drops the frame; a bad frame never tears
/// the session down.
pub fn decode(text: &str) -> Result<ServerFrame> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| WatchRoomError::MalformedFrame(e.to_string()))?;

    let Some(object) = value.as_object() else {
        return Err(WatchRoomError::MalformedFrame(
            "frame is not a JSON object".into(),
        ));
    };

    match object.get("type") {
        Some(Value::String(kind)) if KNOWN_TYPES.contains(&kind.as_str()) => {}
        Some(Value::String(kind)) => return Err(WatchRoomError::UnknownFrameType(kind.clone())),
        Some(_) => {
            return Err(WatchRoomError::MalformedFrame(
                "`type` is not a string".into(),
            ))
        }
        None => return Err(WatchRoomError::MalformedFrame("missing `type`".into())),
    }

    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn stop_reads_as_pause() {
        let flag: PlaybackFlag = serde_json::from_str("\"stop\"").unwrap();
        assert_eq!(flag, PlaybackFlag::Pause);
        assert_eq!(serde_json::to_string(&flag).unwrap(), "\"pause\"");
    }

    #[test]
    fn empty_sync_payload_has_no_video() {
        assert!(SyncPayload::default().into_video().is_none());
        let blank = SyncPayload {
            video_url: Some(String::new()),
            ..SyncPayload::default()
        };
        assert!(blank.into_video().is_none());
    }

    #[test]
    fn decode_rejects_non_objects() {
        assert!(matches!(
            decode("[1, 2]"),
            Err(WatchRoomError::MalformedFrame(_))
        ));
        assert!(matches!(
            decode("alice"),
            Err(WatchRoomError::MalformedFrame(_))
        ));
    }

    #[test]
    fn decode_rejects_missing_or_non_string_type() {
        assert!(matches!(
            decode(r#"{"content":"hi"}"#),
            Err(WatchRoomError::MalformedFrame(_))
        ));
        assert!(matches!(
            decode(r#"{"type":7}"#),
            Err(WatchRoomError::MalformedFrame(_))
        ));
    }

    #[test]
    fn decode_flags_unknown_types() {
        let err = decode(r#"{"type":"ping"}"#).unwrap_err();
        assert!(matches!(err, WatchRoomError::UnknownFrameType(ref t) if t == "ping"));
    }

    #[test]
    fn decode_reports_ill_typed_fields() {
        assert!(matches!(
            decode(r#"{"type":"presence","users":"alice"}"#),
            Err(WatchRoomError::Serialization(_))
        ));
    }

    #[test]
    fn client_frame_kind_matches_wire_type() {
        let frames = [
            ClientFrame::Message {
                content: "hi".into(),
                timestamp: 1,
            },
            ClientFrame::Typing {
                sender: "alice".into(),
            },
            ClientFrame::Video(VideoPayload::default()),
            ClientFrame::SyncRequest { timestamp: 1 },
            ClientFrame::WatchHours { watch_hours: 0.5 },
        ];
        for frame in frames {
            let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
            assert_eq!(value["type"], frame.kind());
        }
    }
}
