//! The shared playback timeline and its reconciliation with remote peers.
//!
//! [`PlaybackState`] is the value every participant agrees on: a queue of
//! video references, the selected entry, the play flag and the position.
//! [`PlaybackSync`] decides when a local change goes on the wire, when a
//! remote one is applied, and drives the sync handshake for late joiners.
//!
//! Two states are compared with [`PlaybackState::is_equivalent`], never with
//! exact equality: positions within [`POSITION_TOLERANCE_SECS`] of each other
//! count as the same, so normal playback drift is not mistaken for a change.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{Result, WatchRoomError};
use crate::protocol::{ClientFrame, PlaybackFlag, RemotePlayback, SyncPayload, VideoPayload};

/// Position difference, in seconds, below which two states are equivalent.
pub const POSITION_TOLERANCE_SECS: f64 = 2.0;

/// Length of a video id inside a video reference.
const VIDEO_ID_LEN: usize = 11;

/// Default time to wait for a sync response.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// Extract the 11-character video id from a video reference.
///
/// The id must follow `v=` or a `/`, as in `https://www.youtube.com/watch?v=…`
/// or `https://youtu.be/…`.
///
/// ```
/// use watchroom_client::playback::video_id;
///
/// assert_eq!(video_id("https://youtu.be/dQw4w9WgXcQ"), Some("dQw4w9WgXcQ"));
/// assert_eq!(video_id("https://example.com/watch?v=short"), None);
/// ```
pub fn video_id(url: &str) -> Option<&str> {
    url.char_indices()
        .filter_map(|(at, c)| match c {
            '/' => Some(at + 1),
            '=' if url.get(..at).is_some_and(|head| head.ends_with('v')) => Some(at + 1),
            _ => None,
        })
        .find_map(|start| {
            let candidate = url.get(start..start + VIDEO_ID_LEN)?;
            candidate
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
                .then_some(candidate)
        })
}

/// The shared playback timeline.
///
/// Invariants: the selected index is always a valid index into the queue, and
/// the state is never playing without a selection. Every constructor and
/// mutator maintains them.
#[derive(Debug, Clone, Default)]
pub struct PlaybackState {
    queue: Vec<String>,
    current_index: Option<usize>,
    playing: bool,
    position: f64,
}

impl PlaybackState {
    /// Build a state, repairing anything that would break the invariants.
    pub fn new(
        queue: Vec<String>,
        current_index: Option<usize>,
        playing: bool,
        position: f64,
    ) -> Self {
        let current_index = current_index.filter(|&i| i < queue.len());
        Self {
            playing: playing && current_index.is_some(),
            queue,
            current_index,
            position: sanitize_position(position),
        }
    }

    /// Read a state off the wire.
    ///
    /// An out-of-range index becomes "nothing selected". A frame with an
    /// empty queue but a video reference is read as a one-entry queue.
    pub fn from_remote(payload: &VideoPayload) -> Self {
        let mut queue = payload.queue.clone();
        let mut current_index = usize::try_from(payload.index).ok();
        if queue.is_empty() && !payload.video_url.is_empty() {
            queue.push(payload.video_url.clone());
            current_index = Some(0);
        }
        Self::new(
            queue,
            current_index,
            payload.playback_state.is_playing(),
            payload.current_time,
        )
    }

    /// Wire form of this state. The index is `-1` when nothing is selected.
    pub fn to_payload(&self, timestamp: Option<u64>) -> VideoPayload {
        VideoPayload {
            video_url: self.video_url().unwrap_or_default().to_owned(),
            playback_state: PlaybackFlag::from_playing(self.playing),
            current_time: self.position,
            queue: self.queue.clone(),
            index: self
                .current_index
                .and_then(|i| i64::try_from(i).ok())
                .unwrap_or(-1),
            timestamp,
        }
    }

    pub fn queue(&self) -> &[String] {
        &self.queue
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Position in seconds.
    pub fn position(&self) -> f64 {
        self.position
    }

    /// Reference of the selected entry.
    pub fn video_url(&self) -> Option<&str> {
        self.current_index
            .and_then(|i| self.queue.get(i))
            .map(String::as_str)
    }

    /// Returns `true` when an entry is selected.
    pub fn has_active_video(&self) -> bool {
        self.video_url().is_some_and(|url| !url.is_empty())
    }

    /// Equality policy used for every suppression decision.
    ///
    /// Same video, same play flag, same queue, same index, and positions less
    /// than [`POSITION_TOLERANCE_SECS`] apart.
    pub fn is_equivalent(&self, other: &PlaybackState) -> bool {
        self.video_url() == other.video_url()
            && self.playing == other.playing
            && (self.position - other.position).abs() < POSITION_TOLERANCE_SECS
            && self.queue == other.queue
            && self.current_index == other.current_index
    }

    // ── Queue operations ────────────────────────────────────────────

    /// Append a video reference. Selects it and starts playing if nothing
    /// was selected.
    ///
    /// # Errors
    ///
    /// Returns [`WatchRoomError::InvalidVideoUrl`] if the reference carries no
    /// video id (see [`video_id`]).
    pub fn enqueue(&mut self, url: &str) -> Result<()> {
        let url = url.trim();
        if video_id(url).is_none() {
            return Err(WatchRoomError::InvalidVideoUrl(url.to_owned()));
        }
        self.queue.push(url.to_owned());
        if self.current_index.is_none() {
            self.current_index = Some(0);
            self.position = 0.0;
            self.playing = true;
        }
        Ok(())
    }

    /// Start playing, if an entry is selected.
    pub fn play(&mut self) {
        self.playing = self.current_index.is_some();
    }

    pub fn pause(&mut self) {
        self.playing = false;
    }

    /// Pause and rewind.
    pub fn stop(&mut self) {
        self.playing = false;
        self.position = 0.0;
    }

    /// Select the following entry. Returns `false` at the end of the queue.
    pub fn next(&mut self) -> bool {
        match self.current_index {
            Some(i) if i + 1 < self.queue.len() => self.select(i + 1),
            _ => false,
        }
    }

    /// Select the preceding entry. Returns `false` at the start of the queue.
    pub fn previous(&mut self) -> bool {
        match self.current_index {
            Some(i) if i > 0 => self.select(i - 1),
            _ => false,
        }
    }

    /// Select entry `index` from the start and play it. Returns `false` if it
    /// does not exist.
    pub fn select(&mut self, index: usize) -> bool {
        if index >= self.queue.len() {
            return false;
        }
        self.current_index = Some(index);
        self.position = 0.0;
        self.playing = true;
        true
    }

    /// The player finished the selected entry: advance, or stop playing at
    /// the end of the queue.
    pub fn playback_ended(&mut self) {
        if !self.next() {
            self.playing = false;
        }
    }

    /// Move the position. Negative or non-finite positions clamp to zero.
    pub fn seek(&mut self, position: f64) {
        self.position = sanitize_position(position);
    }
}

fn sanitize_position(position: f64) -> f64 {
    if position.is_finite() {
        position.max(0.0)
    } else {
        0.0
    }
}

/// Progress of the playback handshake. Independent of the connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncStatus {
    /// No authoritative state known since the last (re)connect.
    #[default]
    Waiting,
    /// A sync request is outstanding.
    Syncing,
    /// Local state matches the room.
    Synced,
}

/// Reconciles local and remote playback changes.
///
/// Precedence rule: a local change that goes on the wire while a sync request
/// is outstanding cancels the request. The local state becomes the room's
/// truth and a late response is ignored.
#[derive(Debug, Clone)]
pub struct PlaybackSync {
    state: PlaybackState,
    status: SyncStatus,
    /// The last state actually put on the wire (or applied from a peer).
    last_sent: Option<PlaybackState>,
    /// A change made while offline, flushed on the next open.
    pending: Option<PlaybackState>,
    awaiting_sync: bool,
    sync_deadline: Option<Instant>,
    sync_timeout: Duration,
}

impl PlaybackSync {
    pub fn new(sync_timeout: Duration) -> Self {
        Self {
            state: PlaybackState::default(),
            status: SyncStatus::Waiting,
            last_sent: None,
            pending: None,
            awaiting_sync: false,
            sync_deadline: None,
            sync_timeout,
        }
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    /// Returns `true` while a sync request is waiting for its answer.
    pub fn is_awaiting_sync(&self) -> bool {
        self.awaiting_sync
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// When the outstanding sync request times out.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sync_deadline
    }

    /// Adopt a locally made state and decide whether to broadcast it.
    ///
    /// Offline, the state is kept as the single pending value. Online, it is
    /// sent unless it is equivalent to the last state sent and `force` is
    /// not set.
    pub fn local_change(
        &mut self,
        state: PlaybackState,
        connected: bool,
        force: bool,
        wall_ms: u64,
    ) -> Option<ClientFrame> {
        self.state = state;
        if !connected {
            debug!("offline, keeping playback change as pending");
            self.pending = Some(self.state.clone());
            return None;
        }
        if !force
            && self
                .last_sent
                .as_ref()
                .is_some_and(|sent| sent.is_equivalent(&self.state))
        {
            return None;
        }
        if self.awaiting_sync {
            debug!("local playback change supersedes outstanding sync request");
            self.awaiting_sync = false;
            self.sync_deadline = None;
            self.status = SyncStatus::Synced;
        }
        Some(self.broadcast(wall_ms))
    }

    /// Record a position reported by the player.
    ///
    /// Ignored when no video is active. Goes on the wire only once it drifts
    /// out of tolerance of the last state sent, and never while a sync
    /// request is outstanding. Offline, it refreshes a pending value but
    /// never creates one.
    pub fn report_position(
        &mut self,
        position: f64,
        connected: bool,
        wall_ms: u64,
    ) -> Option<ClientFrame> {
        if !self.state.has_active_video() {
            return None;
        }
        self.state.seek(position);
        if !connected {
            if self.pending.is_some() {
                self.pending = Some(self.state.clone());
            }
            return None;
        }
        if self.awaiting_sync
            || self
                .last_sent
                .as_ref()
                .is_some_and(|sent| sent.is_equivalent(&self.state))
        {
            return None;
        }
        Some(self.broadcast(wall_ms))
    }

    /// Frames to send right after a connection opens (identity excluded).
    ///
    /// A pending offline change is flushed first. Then, if an active video is
    /// known, it is reasserted and the handshake is done; otherwise a sync
    /// request goes out and the timeout starts.
    pub fn on_open(&mut self, now: Instant, wall_ms: u64) -> Vec<ClientFrame> {
        let mut frames = Vec::with_capacity(2);
        if let Some(pending) = self.pending.take() {
            info!("flushing playback change made while offline");
            self.state = pending;
            frames.push(self.broadcast(wall_ms));
            if self.state.has_active_video() {
                self.status = SyncStatus::Synced;
                return frames;
            }
        } else if self.state.has_active_video() {
            frames.push(self.broadcast(wall_ms));
            self.status = SyncStatus::Synced;
            return frames;
        }
        frames.push(self.request_sync(now, wall_ms));
        frames
    }

    /// The connection is gone; the handshake starts over on the next open.
    pub fn on_close(&mut self) {
        self.status = SyncStatus::Waiting;
        self.awaiting_sync = false;
        self.sync_deadline = None;
    }

    /// Put a sync request on the wire and start the timeout.
    pub fn request_sync(&mut self, now: Instant, wall_ms: u64) -> ClientFrame {
        self.status = SyncStatus::Syncing;
        self.awaiting_sync = true;
        self.sync_deadline = Some(now + self.sync_timeout);
        ClientFrame::SyncRequest { timestamp: wall_ms }
    }

    /// Apply a `video` frame from another participant.
    ///
    /// Returns the new state for the player if it differs from the local one.
    /// While a sync request is outstanding any such frame settles it.
    pub fn on_remote_video(&mut self, payload: &VideoPayload) -> Option<RemotePlayback> {
        if self.awaiting_sync {
            self.awaiting_sync = false;
            self.sync_deadline = None;
            self.status = SyncStatus::Synced;
        }
        self.apply_remote(PlaybackState::from_remote(payload))
    }

    /// Apply a response to our sync request.
    ///
    /// Ignored unless a request is outstanding. A response without a video
    /// means the room has nothing to resume and simply completes the handshake.
    pub fn on_sync_response(&mut self, payload: SyncPayload) -> Option<RemotePlayback> {
        if !self.awaiting_sync {
            debug!("ignoring sync response with no request outstanding");
            return None;
        }
        self.awaiting_sync = false;
        self.sync_deadline = None;
        self.status = SyncStatus::Synced;
        match payload.into_video() {
            Some(video) => self.apply_remote(PlaybackState::from_remote(&video)),
            None => {
                debug!("room has no playback state to resume");
                None
            }
        }
    }

    /// Fire the sync timeout if it is due. Returns `true` if it fired.
    ///
    /// The request stays answerable: a response arriving after the timeout
    /// is still applied.
    pub fn poll_timeout(&mut self, now: Instant) -> bool {
        match self.sync_deadline {
            Some(deadline) if deadline <= now => {
                self.sync_deadline = None;
                if self.status == SyncStatus::Syncing {
                    info!("sync request timed out");
                    self.status = SyncStatus::Waiting;
                }
                true
            }
            _ => false,
        }
    }

    fn apply_remote(&mut self, remote: PlaybackState) -> Option<RemotePlayback> {
        if remote.is_equivalent(&self.state) {
            return None;
        }
        self.state = remote;
        self.last_sent = Some(self.state.clone());
        self.pending = None;
        self.status = SyncStatus::Synced;
        Some(RemotePlayback::from(self.state.to_payload(None)))
    }

    fn broadcast(&mut self, wall_ms: u64) -> ClientFrame {
        self.last_sent = Some(self.state.clone());
        ClientFrame::Video(self.state.to_payload(Some(wall_ms)))
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

    const A: &str = "https://www.youtube.com/watch?v=aaaaaaaaaaa";
    const B: &str = "https://youtu.be/bbbbbbbbbbb";

    fn two_entries() -> PlaybackState {
        PlaybackState::new(vec![A.into(), B.into()], Some(0), true, 10.0)
    }

    fn video_frame(frame: Option<ClientFrame>) -> VideoPayload {
        match frame {
            Some(ClientFrame::Video(payload)) => payload,
            other => panic!("expected a video frame, got {other:?}"),
        }
    }

    #[test]
    fn video_ids_follow_v_or_slash() {
        assert_eq!(video_id(A), Some("aaaaaaaaaaa"));
        assert_eq!(video_id(B), Some("bbbbbbbbbbb"));
        assert_eq!(video_id("https://youtube.com/embed/a-b_c123456?t=4"), Some("a-b_c123456"));
        assert_eq!(video_id("https://youtube.com/watch?x=aaaaaaaaaaa"), None);
        assert_eq!(video_id("aaaaaaaaaaa"), None);
        assert_eq!(video_id("https://youtu.be/short"), None);
        assert_eq!(video_id("/ééééééééééé"), None);
    }

    #[test]
    fn constructor_repairs_invariants() {
        let state = PlaybackState::new(vec![A.into()], Some(3), true, f64::NAN);
        assert_eq!(state.current_index(), None);
        assert!(!state.is_playing());
        assert_eq!(state.position(), 0.0);
    }

    #[test]
    fn equivalence_tolerates_small_drift() {
        let a = two_entries();
        let mut b = a.clone();
        b.seek(11.5);
        assert!(a.is_equivalent(&b));
        b.seek(13.0);
        assert!(!a.is_equivalent(&b));
    }

    #[test]
    fn equivalence_rejects_any_structural_difference() {
        let a = two_entries();

        let mut paused = a.clone();
        paused.pause();
        assert!(!a.is_equivalent(&paused));

        let mut moved = a.clone();
        moved.next();
        moved.seek(10.0);
        assert!(!a.is_equivalent(&moved));

        let mut longer = a.clone();
        longer.enqueue(B).unwrap();
        assert!(!a.is_equivalent(&longer));
    }

    #[test]
    fn enqueue_selects_first_entry() {
        let mut state = PlaybackState::default();
        state.enqueue(A).unwrap();
        assert_eq!(state.current_index(), Some(0));
        assert!(state.is_playing());

        state.pause();
        state.enqueue(B).unwrap();
        assert_eq!(state.current_index(), Some(0));
        assert!(!state.is_playing());
        assert_eq!(state.queue().len(), 2);
    }

    #[test]
    fn enqueue_rejects_references_without_an_id() {
        let mut state = PlaybackState::default();
        let err = state.enqueue("not a video").unwrap_err();
        assert!(matches!(err, WatchRoomError::InvalidVideoUrl(_)));
        assert!(state.queue().is_empty());
    }

    #[test]
    fn navigation_stays_within_the_queue() {
        let mut state = two_entries();
        assert!(!state.previous());
        assert!(state.next());
        assert_eq!(state.video_url(), Some(B));
        assert_eq!(state.position(), 0.0);
        assert!(!state.next());
        assert!(state.previous());
        assert!(!state.select(2));
        assert_eq!(state.current_index(), Some(0));
    }

    #[test]
    fn playback_ended_advances_then_stops() {
        let mut state = two_entries();
        state.playback_ended();
        assert_eq!(state.current_index(), Some(1));
        assert!(state.is_playing());
        state.playback_ended();
        assert_eq!(state.current_index(), Some(1));
        assert!(!state.is_playing());
    }

    #[test]
    fn remote_state_is_normalized() {
        let bare = VideoPayload {
            video_url: A.into(),
            playback_state: PlaybackFlag::Play,
            ..VideoPayload::default()
        };
        let state = PlaybackState::from_remote(&bare);
        assert_eq!(state.queue(), [A]);
        assert_eq!(state.current_index(), Some(0));

        let out_of_range = VideoPayload {
            queue: vec![A.into()],
            index: 4,
            playback_state: PlaybackFlag::Play,
            ..VideoPayload::default()
        };
        let state = PlaybackState::from_remote(&out_of_range);
        assert_eq!(state.current_index(), None);
        assert!(!state.is_playing());
        assert_eq!(state.to_payload(None).index, -1);
    }

    #[test]
    fn unchanged_local_state_is_not_resent() {
        let mut sync = PlaybackSync::new(DEFAULT_SYNC_TIMEOUT);
        assert!(sync.local_change(two_entries(), true, false, 1).is_some());
        assert!(sync.local_change(two_entries(), true, false, 2).is_none());
        assert!(sync.local_change(two_entries(), true, true, 3).is_some());
    }

    #[test]
    fn small_position_reports_are_absorbed() {
        let mut sync = PlaybackSync::new(DEFAULT_SYNC_TIMEOUT);
        sync.local_change(two_entries(), true, false, 0);
        assert!(sync.report_position(11.0, true, 0).is_none());
        assert_eq!(sync.state().position(), 11.0);
        let payload = video_frame(sync.report_position(12.5, true, 0));
        assert_eq!(payload.current_time, 12.5);
    }

    #[test]
    fn position_reports_without_a_video_leave_the_handshake_alone() {
        let mut sync = PlaybackSync::new(DEFAULT_SYNC_TIMEOUT);
        let now = Instant::now();
        sync.on_open(now, 0);
        assert!(sync.report_position(0.0, true, 0).is_none());
        assert!(sync.is_awaiting_sync());
        assert_eq!(sync.status(), SyncStatus::Syncing);
        assert_eq!(sync.next_deadline(), Some(now + DEFAULT_SYNC_TIMEOUT));
    }

    #[test]
    fn position_reports_do_not_cancel_an_outstanding_sync_request() {
        let mut sync = PlaybackSync::new(DEFAULT_SYNC_TIMEOUT);
        sync.local_change(two_entries(), true, false, 0);
        sync.request_sync(Instant::now(), 0);
        assert!(sync.report_position(40.0, true, 0).is_none());
        assert!(sync.is_awaiting_sync());
        assert_eq!(sync.state().position(), 40.0);
    }

    #[test]
    fn offline_change_is_flushed_once_on_open() {
        let mut sync = PlaybackSync::new(DEFAULT_SYNC_TIMEOUT);
        assert!(sync.local_change(two_entries(), false, false, 0).is_none());
        assert!(sync.has_pending());

        let frames = sync.on_open(Instant::now(), 5);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], ClientFrame::Video(_)));
        assert_eq!(sync.status(), SyncStatus::Synced);
        assert!(!sync.has_pending());
        assert!(sync.next_deadline().is_none());
    }

    #[test]
    fn offline_position_reports_do_not_create_a_pending_value() {
        let mut sync = PlaybackSync::new(DEFAULT_SYNC_TIMEOUT);
        sync.report_position(30.0, false, 0);
        assert!(!sync.has_pending());
    }

    #[test]
    fn open_without_video_requests_sync() {
        let mut sync = PlaybackSync::new(DEFAULT_SYNC_TIMEOUT);
        let now = Instant::now();
        let frames = sync.on_open(now, 7);
        assert!(matches!(
            frames.as_slice(),
            [ClientFrame::SyncRequest { timestamp: 7 }]
        ));
        assert_eq!(sync.status(), SyncStatus::Syncing);
        assert_eq!(sync.next_deadline(), Some(now + DEFAULT_SYNC_TIMEOUT));
    }

    #[test]
    fn open_with_video_reasserts_it() {
        let mut sync = PlaybackSync::new(DEFAULT_SYNC_TIMEOUT);
        sync.local_change(two_entries(), true, false, 0);
        sync.on_close();
        let frames = sync.on_open(Instant::now(), 0);
        assert!(matches!(frames.as_slice(), [ClientFrame::Video(_)]));
        assert_eq!(sync.status(), SyncStatus::Synced);
    }

    #[test]
    fn timeout_reverts_to_waiting() {
        let mut sync = PlaybackSync::new(DEFAULT_SYNC_TIMEOUT);
        let now = Instant::now();
        sync.on_open(now, 0);
        assert!(!sync.poll_timeout(now + Duration::from_millis(4_999)));
        assert!(sync.poll_timeout(now + DEFAULT_SYNC_TIMEOUT));
        assert_eq!(sync.status(), SyncStatus::Waiting);
        assert!(sync.next_deadline().is_none());
    }

    #[test]
    fn sync_response_applies_and_settles() {
        let mut sync = PlaybackSync::new(DEFAULT_SYNC_TIMEOUT);
        sync.on_open(Instant::now(), 0);
        let response = SyncPayload {
            video_url: Some(A.into()),
            playback_state: PlaybackFlag::Play,
            current_time: 42.0,
            queue: vec![A.into()],
            index: 0,
        };
        let remote = sync.on_sync_response(response).unwrap();
        assert_eq!(remote.video_url, A);
        assert_eq!(remote.current_time, 42.0);
        assert_eq!(sync.status(), SyncStatus::Synced);
        assert!(sync.next_deadline().is_none());
    }

    #[test]
    fn empty_sync_response_marks_synced() {
        let mut sync = PlaybackSync::new(DEFAULT_SYNC_TIMEOUT);
        sync.on_open(Instant::now(), 0);
        assert!(sync.on_sync_response(SyncPayload::default()).is_none());
        assert_eq!(sync.status(), SyncStatus::Synced);
        assert!(sync.next_deadline().is_none());
    }

    #[test]
    fn unsolicited_sync_response_is_ignored() {
        let mut sync = PlaybackSync::new(DEFAULT_SYNC_TIMEOUT);
        let response = SyncPayload {
            video_url: Some(A.into()),
            ..SyncPayload::default()
        };
        assert!(sync.on_sync_response(response).is_none());
        assert_eq!(sync.status(), SyncStatus::Waiting);
    }

    #[test]
    fn local_change_cancels_outstanding_request() {
        let mut sync = PlaybackSync::new(DEFAULT_SYNC_TIMEOUT);
        sync.on_open(Instant::now(), 0);
        assert!(sync.local_change(two_entries(), true, false, 0).is_some());
        assert_eq!(sync.status(), SyncStatus::Synced);
        assert!(sync.next_deadline().is_none());

        let late = SyncPayload {
            video_url: Some(B.into()),
            ..SyncPayload::default()
        };
        assert!(sync.on_sync_response(late).is_none());
        assert_eq!(sync.state().video_url(), Some(A));
    }

    #[test]
    fn remote_video_is_applied_once_and_not_echoed() {
        let mut sync = PlaybackSync::new(DEFAULT_SYNC_TIMEOUT);
        let payload = two_entries().to_payload(Some(1));
        assert!(sync.on_remote_video(&payload).is_some());
        assert_eq!(sync.status(), SyncStatus::Synced);
        assert!(sync.on_remote_video(&payload).is_none());

        // The applied state counts as sent, so handing it back is a no-op.
        let echoed = sync.state().clone();
        assert!(sync.local_change(echoed, true, false, 0).is_none());
    }

    #[test]
    fn remote_video_settles_outstanding_request() {
        let mut sync = PlaybackSync::new(DEFAULT_SYNC_TIMEOUT);
        sync.on_open(Instant::now(), 0);
        assert!(sync.on_remote_video(&VideoPayload::default()).is_none());
        assert_eq!(sync.status(), SyncStatus::Synced);
        assert!(sync.next_deadline().is_none());
    }
}
