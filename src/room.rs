//! Room state as seen by one client, and how frames change it.
//!
//! [`Room`] ties the presence tracker, chat log, playback synchronizer and
//! watch-time accumulator together. It does no I/O: every handler takes the
//! current instant and wall clock, and queues the frames to send and the
//! events to emit. The engine drains both after each call.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::chat::{ChatLog, ChatMessage};
use crate::client::WatchRoomConfig;
use crate::error::Result;
use crate::event::WatchRoomEvent;
use crate::playback::{PlaybackState, PlaybackSync, SyncStatus};
use crate::presence::{Participant, PresenceTracker};
use crate::protocol::{self, ClientFrame, ServerFrame};
use crate::session::ConnectionState;
use crate::watch_time::{watch_hours_key, KeyValueStore, WatchTimeAccumulator};

/// Milliseconds since the Unix epoch, for frame timestamps.
pub(crate) fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

pub(crate) struct Room {
    identity: String,
    store: Arc<dyn KeyValueStore>,
    connection: ConnectionState,
    presence: PresenceTracker,
    chat: ChatLog,
    playback: PlaybackSync,
    watch: WatchTimeAccumulator,
    outbox: Vec<ClientFrame>,
    events: Vec<WatchRoomEvent>,
}

impl Room {
    pub fn new(config: &WatchRoomConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let key = config
            .watch_hours_key
            .clone()
            .unwrap_or_else(|| watch_hours_key(&config.identity));
        let watch = WatchTimeAccumulator::load(store.as_ref(), key, config.watch_time.clone());
        Self {
            presence: PresenceTracker::new(config.identity.clone(), watch.hours()),
            identity: config.identity.clone(),
            store,
            connection: ConnectionState::Idle,
            chat: ChatLog::new(config.chat.clone()),
            playback: PlaybackSync::new(config.sync_timeout),
            watch,
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Open
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.playback.status()
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.presence.participants().to_vec()
    }

    pub fn typing_users(&self) -> Vec<String> {
        self.chat.typing_users()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.chat.messages().to_vec()
    }

    pub fn playback(&self) -> PlaybackState {
        self.playback.state().clone()
    }

    pub fn watch_hours(&self) -> f64 {
        self.watch.hours()
    }

    pub fn take_outbox(&mut self) -> Vec<ClientFrame> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_events(&mut self) -> Vec<WatchRoomEvent> {
        std::mem::take(&mut self.events)
    }

    // ── Connection lifecycle ────────────────────────────────────────

    pub fn set_connection(&mut self, state: ConnectionState) {
        if self.connection != state {
            debug!(identity = %self.identity, from = %self.connection, to = %state, "connection state");
            self.connection = state;
        }
    }

    /// A session opened. Queues the pending flush or sync request and a
    /// fresh watch-time announcement.
    pub fn on_open(&mut self, now: Instant, wall_ms: u64) {
        self.set_connection(ConnectionState::Open);
        self.events.push(WatchRoomEvent::Connected);
        let before = self.playback.status();
        let frames = self.playback.on_open(now, wall_ms);
        self.outbox.extend(frames);
        self.after_playback_change(before, now);
        self.watch.on_open();
        self.flush_watch_broadcast(now);
    }

    /// The current session ended, for whatever reason.
    pub fn on_close(&mut self) {
        let before = self.playback.status();
        self.playback.on_close();
        self.note_status(before);
    }

    // ── Inbound ─────────────────────────────────────────────────────

    /// Decode and apply one inbound frame. Bad frames are logged and dropped.
    pub fn handle_text(&mut self, text: &str, now: Instant, wall_ms: u64) {
        match protocol::decode(text) {
            Ok(frame) => self.handle_frame(frame, now, wall_ms),
            Err(e) => warn!(identity = %self.identity, "dropping inbound frame: {e}"),
        }
    }

    pub fn handle_frame(&mut self, frame: ServerFrame, now: Instant, wall_ms: u64) {
        match frame {
            ServerFrame::Message {
                sender,
                content,
                timestamp,
            } => {
                let timestamp = timestamp.unwrap_or(wall_ms);
                if let Some(message) = self.chat.ingest(sender, content, timestamp) {
                    self.events.push(WatchRoomEvent::ChatMessage(message.clone()));
                }
            }

            ServerFrame::Presence { users } => {
                self.presence.apply_snapshot(users, self.watch.hours());
                self.events
                    .push(WatchRoomEvent::PresenceChanged(self.participants()));
            }

            ServerFrame::Typing { sender } => {
                if sender.is_empty() || sender == self.identity {
                    return;
                }
                if self.chat.note_typing(&sender, now) {
                    self.events
                        .push(WatchRoomEvent::TypingChanged(self.chat.typing_users()));
                }
            }

            ServerFrame::Video { sender, payload } => {
                // The relay answers a sync request with its stored state, which
                // keeps the name of whoever set it last; that may be us.
                if sender == self.identity && !self.playback.is_awaiting_sync() {
                    debug!("ignoring own video frame");
                    return;
                }
                let before = self.playback.status();
                if let Some(remote) = self.playback.on_remote_video(&payload) {
                    debug!(sender = %sender, url = %remote.video_url, "applying remote playback");
                    self.events.push(WatchRoomEvent::PlaybackChanged(remote));
                }
                self.after_playback_change(before, now);
            }

            ServerFrame::Sync { payload } => {
                let before = self.playback.status();
                if let Some(remote) = self.playback.on_sync_response(payload) {
                    self.events.push(WatchRoomEvent::PlaybackChanged(remote));
                }
                self.after_playback_change(before, now);
            }

            ServerFrame::WatchHours {
                sender,
                watch_hours,
            } => {
                if sender == self.identity {
                    return;
                }
                let Some(hours) = watch_hours else {
                    debug!(sender = %sender, "watchHours frame without a value");
                    return;
                };
                if self.presence.apply_watch_hours(&sender, hours) {
                    self.events.push(WatchRoomEvent::WatchHoursChanged {
                        name: sender,
                        hours,
                    });
                }
            }
        }
    }

    // ── Local actions ───────────────────────────────────────────────

    /// Derive a new playback state with `change` and route it through the
    /// outgoing path.
    pub fn change_playback<F>(&mut self, force: bool, now: Instant, wall_ms: u64, change: F) -> Result<()>
    where
        F: FnOnce(&mut PlaybackState) -> Result<()>,
    {
        let mut state = self.playback.state().clone();
        change(&mut state)?;
        let before = self.playback.status();
        let connected = self.is_connected();
        if let Some(frame) = self.playback.local_change(state, connected, force, wall_ms) {
            self.outbox.push(frame);
        }
        self.after_playback_change(before, now);
        Ok(())
    }

    pub fn report_position(&mut self, position: f64, wall_ms: u64) {
        let connected = self.is_connected();
        if let Some(frame) = self.playback.report_position(position, connected, wall_ms) {
            self.outbox.push(frame);
        }
    }

    /// Reassert the local state, or ask the room for its state when no video
    /// is active.
    pub fn resync(&mut self, now: Instant, wall_ms: u64) {
        if self.playback.state().has_active_video() {
            let state = self.playback.state().clone();
            let before = self.playback.status();
            let connected = self.is_connected();
            if let Some(frame) = self.playback.local_change(state, connected, true, wall_ms) {
                self.outbox.push(frame);
            }
            self.note_status(before);
        } else if self.is_connected() {
            let before = self.playback.status();
            let frame = self.playback.request_sync(now, wall_ms);
            self.outbox.push(frame);
            self.note_status(before);
        } else {
            debug!("not connected, sync request skipped");
        }
    }

    pub fn send_chat(&mut self, content: &str, now: Instant, wall_ms: u64) {
        if !self.is_connected() {
            warn!(identity = %self.identity, "not connected, chat message dropped");
            return;
        }
        if let Some(frame) = self.chat.prepare_outgoing(content, now, wall_ms) {
            self.outbox.push(frame);
        }
    }

    pub fn notify_typing(&mut self) {
        if !self.is_connected() {
            return;
        }
        self.outbox.push(ClientFrame::Typing {
            sender: self.identity.clone(),
        });
    }

    // ── Timers ──────────────────────────────────────────────────────

    /// Fire everything due by `now`: sync timeout, typing expiry, watch ticks
    /// and the trailing watch-time broadcast.
    pub fn poll_timers(&mut self, now: Instant) {
        let before = self.playback.status();
        if self.playback.poll_timeout(now) {
            self.note_status(before);
        }

        if self.chat.expire_typing(now) {
            self.events
                .push(WatchRoomEvent::TypingChanged(self.chat.typing_users()));
        }

        if self.watch.poll_tick(now, self.store.as_ref()) {
            let hours = self.watch.hours();
            self.presence.set_local_watch_hours(hours);
            self.events.push(WatchRoomEvent::WatchHoursChanged {
                name: self.identity.clone(),
                hours,
            });
        }
        self.flush_watch_broadcast(now);
    }

    /// Earliest instant at which [`poll_timers`](Self::poll_timers) has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.playback.next_deadline(),
            self.chat.next_typing_expiry(),
            self.watch.next_deadline(self.is_connected()),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn after_playback_change(&mut self, before: SyncStatus, now: Instant) {
        self.note_status(before);
        self.watch
            .set_playing(self.playback.state().is_playing(), now);
    }

    fn note_status(&mut self, before: SyncStatus) {
        let after = self.playback.status();
        if after != before {
            debug!(identity = %self.identity, status = ?after, "sync status changed");
            self.events.push(WatchRoomEvent::SyncStatusChanged(after));
        }
    }

    fn flush_watch_broadcast(&mut self, now: Instant) {
        if let Some(frame) = self.watch.poll_broadcast(now, self.is_connected()) {
            self.outbox.push(frame);
        }
    }
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
    use crate::protocol::{PlaybackFlag, VideoPayload};
    use crate::watch_time::MemoryStore;
    use std::time::Duration;

    const URL: &str = "https://youtu.be/aaaaaaaaaaa";

    fn room() -> Room {
        Room::new(&WatchRoomConfig::new("alice"), Arc::new(MemoryStore::new()))
    }

    fn open_room(now: Instant) -> Room {
        let mut room = room();
        room.on_open(now, 0);
        room.take_outbox();
        room.take_events();
        room
    }

    fn video_text(sender: &str, url: &str) -> String {
        serde_json::json!({
            "type": "video",
            "sender": sender,
            "videoUrl": url,
            "playbackState": "play",
            "currentTime": 12.0,
            "queue": [url],
        })
        .to_string()
    }

    #[test]
    fn open_without_video_requests_sync_and_announces_watch_time() {
        let mut room = room();
        room.on_open(Instant::now(), 5);
        let outbox = room.take_outbox();
        assert!(matches!(
            outbox.as_slice(),
            [
                ClientFrame::SyncRequest { timestamp: 5 },
                ClientFrame::WatchHours { .. }
            ]
        ));
        let events = room.take_events();
        assert_eq!(events[0], WatchRoomEvent::Connected);
        assert!(events.contains(&WatchRoomEvent::SyncStatusChanged(SyncStatus::Syncing)));
    }

    #[test]
    fn own_frames_are_ignored() {
        let now = Instant::now();
        let mut room = open_room(now);
        room.handle_text(r#"{"type":"sync"}"#, now, 0);
        room.take_events();

        room.handle_text(&video_text("alice", URL), now, 0);
        room.handle_text(r#"{"type":"typing","sender":"alice"}"#, now, 0);
        room.handle_text(r#"{"type":"watchHours","sender":"alice","watchHours":9}"#, now, 0);
        assert!(room.take_events().is_empty());
        assert!(!room.playback().has_active_video());
    }

    #[test]
    fn own_video_answers_an_outstanding_sync_request() {
        let now = Instant::now();
        let mut room = open_room(now);
        room.handle_text(&video_text("alice", URL), now, 0);
        assert_eq!(room.sync_status(), SyncStatus::Synced);
        assert_eq!(room.playback().video_url(), Some(URL));
    }

    #[test]
    fn remote_video_is_applied_and_starts_watch_time() {
        let now = Instant::now();
        let mut room = open_room(now);
        room.handle_text(&video_text("bob", URL), now, 0);

        let events = room.take_events();
        assert!(events.iter().any(|e| matches!(
            e,
            WatchRoomEvent::PlaybackChanged(p) if p.video_url == URL
                && p.playback_state == PlaybackFlag::Play
        )));
        assert_eq!(
            room.next_deadline(),
            Some(now + Duration::from_secs(1))
        );
        assert!(room.take_outbox().is_empty());
    }

    #[test]
    fn bad_frames_are_dropped() {
        let now = Instant::now();
        let mut room = open_room(now);
        room.handle_text("{not json", now, 0);
        room.handle_text(r#"{"type":"ping"}"#, now, 0);
        room.handle_text(r#"{"content":"no type"}"#, now, 0);
        assert!(room.take_events().is_empty());
        assert!(room.is_connected());
    }

    #[test]
    fn chat_without_timestamp_uses_receipt_time() {
        let now = Instant::now();
        let mut room = open_room(now);
        room.handle_text(r#"{"type":"message","sender":"bob","content":"hi"}"#, now, 77);
        assert_eq!(room.messages()[0].timestamp, 77);

        room.handle_text(r#"{"type":"message","sender":"bob","content":"hi"}"#, now, 1_077);
        assert_eq!(room.messages().len(), 1);
    }

    #[test]
    fn watch_hours_without_value_keep_known_value() {
        let now = Instant::now();
        let mut room = open_room(now);
        room.handle_text(r#"{"type":"presence","users":["alice","bob"]}"#, now, 0);
        room.handle_text(r#"{"type":"watchHours","sender":"bob","watchHours":2.5}"#, now, 0);
        room.handle_text(r#"{"type":"watchHours","sender":"bob"}"#, now, 0);
        room.handle_text(r#"{"type":"presence","users":["bob","alice"]}"#, now, 0);

        let bob = room
            .participants()
            .into_iter()
            .find(|p| p.name == "bob")
            .unwrap();
        assert_eq!(bob.watch_hours, 2.5);
    }

    #[test]
    fn typing_indicator_expires_through_poll() {
        let now = Instant::now();
        let mut room = open_room(now);
        room.handle_text(r#"{"type":"typing","sender":"bob"}"#, now, 0);
        assert_eq!(room.typing_users(), ["bob"]);
        room.take_events();

        let expiry = room.next_deadline().unwrap();
        assert_eq!(expiry, now + Duration::from_secs(3));
        room.poll_timers(expiry);
        assert!(room.typing_users().is_empty());
        assert_eq!(
            room.take_events(),
            [WatchRoomEvent::TypingChanged(Vec::new())]
        );
    }

    #[test]
    fn offline_chat_and_typing_are_dropped() {
        let mut room = room();
        room.send_chat("hello", Instant::now(), 0);
        room.notify_typing();
        assert!(room.take_outbox().is_empty());
    }

    #[test]
    fn offline_playback_change_waits_for_open() {
        let now = Instant::now();
        let mut room = room();
        room.change_playback(false, now, 0, |s| s.enqueue(URL)).unwrap();
        assert!(room.take_outbox().is_empty());

        room.on_open(now, 0);
        let outbox = room.take_outbox();
        let videos = outbox
            .iter()
            .filter(|f| matches!(f, ClientFrame::Video(_)))
            .count();
        assert_eq!(videos, 1);
        assert!(!outbox
            .iter()
            .any(|f| matches!(f, ClientFrame::SyncRequest { .. })));
    }

    #[test]
    fn invalid_enqueue_changes_nothing() {
        let now = Instant::now();
        let mut room = open_room(now);
        assert!(room
            .change_playback(false, now, 0, |s| s.enqueue("nope"))
            .is_err());
        assert!(room.take_outbox().is_empty());
        assert!(room.playback().queue().is_empty());
    }

    #[test]
    fn resync_without_video_sends_a_sync_request() {
        let now = Instant::now();
        let mut room = open_room(now);
        room.handle_text(r#"{"type":"sync"}"#, now, 0);
        room.resync(now, 3);
        assert!(matches!(
            room.take_outbox().as_slice(),
            [ClientFrame::SyncRequest { timestamp: 3 }]
        ));
        assert_eq!(room.sync_status(), SyncStatus::Syncing);
    }

    #[test]
    fn local_ticks_update_the_local_participant() {
        let now = Instant::now();
        let mut room = open_room(now);
        let payload = VideoPayload {
            video_url: URL.into(),
            playback_state: PlaybackFlag::Play,
            ..VideoPayload::default()
        };
        room.handle_frame(
            ServerFrame::Video {
                sender: "bob".into(),
                payload,
            },
            now,
            0,
        );
        room.take_events();

        room.poll_timers(now + Duration::from_secs(1));
        let alice = room
            .participants()
            .into_iter()
            .find(|p| p.name == "alice")
            .unwrap();
        assert!(alice.watch_hours > 0.0);
        assert!(room
            .take_events()
            .iter()
            .any(|e| matches!(e, WatchRoomEvent::WatchHoursChanged { name, .. } if name == "alice")));
    }
}
