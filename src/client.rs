//! Async client for a shared watch room.
//!
//! [`WatchRoomClient`] is a thin handle that forwards commands to a background
//! engine task over an unbounded MPSC channel. Events are emitted on a bounded
//! channel ([`tokio::sync::mpsc::Receiver<WatchRoomEvent>`]) returned from
//! [`WatchRoomClient::start`].
//!
//! The engine connects on its own, reconnects with backoff after abnormal
//! closes, and keeps playback, chat and presence state in sync with the room.
//!
//! # Example
//!
//! ```rust,ignore
//! let connector = WebSocketConnector::new("ws://localhost:8080/ws");
//! let store = Arc::new(MemoryStore::new());
//! let identity = resolve_identity(store.as_ref(), None);
//! let (client, mut events) =
//!     WatchRoomClient::start(connector, WatchRoomConfig::new(identity), store);
//!
//! client.enqueue("https://youtu.be/dQw4w9WgXcQ")?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         WatchRoomEvent::PlaybackChanged(state) => { /* drive the player */ }
//!         WatchRoomEvent::ReconnectsExhausted { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::chat::{ChatMessage, ChatSettings};
use crate::engine::{ClientState, Command, Engine};
use crate::error::{Result, WatchRoomError};
use crate::event::WatchRoomEvent;
use crate::playback::{video_id, PlaybackState, SyncStatus, DEFAULT_SYNC_TIMEOUT};
use crate::presence::Participant;
use crate::reconnect::ReconnectPolicy;
use crate::room::Room;
use crate::session::ConnectionState;
use crate::transport::Connector;
use crate::watch_time::{KeyValueStore, WatchTimeSettings};

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`WatchRoomClient`].
///
/// The only required field is the `identity`, the display name the client
/// joins with. All others have sensible defaults.
///
/// # Example
///
/// ```
/// use watchroom_client::client::WatchRoomConfig;
///
/// let config = WatchRoomConfig::new("alice");
/// assert_eq!(config.identity, "alice");
/// assert_eq!(config.reconnect.max_attempts, 10);
/// ```
///
/// # Tuning
///
/// ```
/// use std::time::Duration;
/// use watchroom_client::client::WatchRoomConfig;
///
/// let config = WatchRoomConfig::new("alice")
///     .with_event_channel_capacity(512)
///     .with_sync_timeout(Duration::from_secs(10))
///     .with_watch_hours_key("watchHours");
/// ```
#[derive(Debug, Clone)]
pub struct WatchRoomConfig {
    /// Display name; sent as the first frame of every connection.
    pub identity: String,
    /// Capacity of the bounded event channel.
    ///
    /// When the consumer cannot keep up, events are dropped (with a warning
    /// logged) to avoid blocking the engine. The final `Disconnected` event
    /// on shutdown is always delivered.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Timeout for the graceful shutdown.
    ///
    /// Defaults to **1 second**. A zero timeout aborts the engine immediately
    /// without waiting for the connection to close.
    pub shutdown_timeout: Duration,
    /// Backoff applied after abnormal closes.
    pub reconnect: ReconnectPolicy,
    /// How long a sync request may go unanswered. Defaults to **5 seconds**.
    pub sync_timeout: Duration,
    /// Duplicate filter, typing and resubmit timings.
    pub chat: ChatSettings,
    /// Watch-time tick and broadcast spacing.
    pub watch_time: WatchTimeSettings,
    /// Store key for the watch-time counter.
    /// Defaults to `watchHours:<identity>`.
    pub watch_hours_key: Option<String>,
}

impl WatchRoomConfig {
    /// Create a new configuration with the given identity and default values.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            chat: ChatSettings::default(),
            watch_time: WatchTimeSettings::default(),
            watch_hours_key: None,
        }
    }

    /// Set the capacity of the bounded event channel.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// Set the timeout for the graceful shutdown.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    #[must_use]
    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_chat_settings(mut self, chat: ChatSettings) -> Self {
        self.chat = chat;
        self
    }

    #[must_use]
    pub fn with_watch_time_settings(mut self, watch_time: WatchTimeSettings) -> Self {
        self.watch_time = watch_time;
        self
    }

    /// Persist the watch-time counter under `key` instead of the per-identity
    /// default.
    #[must_use]
    pub fn with_watch_hours_key(mut self, key: impl Into<String>) -> Self {
        self.watch_hours_key = Some(key.into());
        self
    }
}

// ── Client handle ───────────────────────────────────────────────────

/// Async handle to a watch-room engine.
///
/// Created via [`WatchRoomClient::start`], which spawns the engine task and
/// returns this handle together with an event receiver.
///
/// Command methods queue a request and return immediately. They fail only
/// with [`WatchRoomError::EngineStopped`] once the engine has exited, or with
/// a validation error. Network trouble never surfaces here: it shows up as
/// events and as [`connection_state`](Self::connection_state).
pub struct WatchRoomClient {
    identity: String,
    /// Sender half of the command channel to the engine.
    cmd_tx: mpsc::UnboundedSender<Command>,
    /// Shared state updated by the engine.
    state: Arc<ClientState>,
    /// Handle to the engine task.
    task: Option<tokio::task::JoinHandle<()>>,
    /// Oneshot sender to signal the engine to shut down gracefully.
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    /// Timeout for the graceful shutdown.
    shutdown_timeout: Duration,
}

impl WatchRoomClient {
    /// Start the engine and return a handle plus event receiver.
    ///
    /// The engine immediately opens the first connection through `connector`
    /// and sends `config.identity` as the first frame. The watch-time counter
    /// is loaded from `store`.
    ///
    /// # Returns
    ///
    /// A tuple of `(client_handle, event_receiver)`. The event receiver yields
    /// [`WatchRoomEvent`]s until the engine shuts down.
    #[must_use = "the event receiver must be used to receive events"]
    pub fn start(
        connector: impl Connector,
        config: WatchRoomConfig,
        store: Arc<dyn KeyValueStore>,
    ) -> (Self, mpsc::Receiver<WatchRoomEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        // Clamp capacity to at least 1 (tokio panics on 0).
        let capacity = config.event_channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel::<WatchRoomEvent>(capacity);
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let state = Arc::new(ClientState::new(Room::new(&config, store)));
        let engine = Engine::new(
            Arc::new(connector),
            config.identity.clone(),
            config.reconnect.clone(),
            Arc::clone(&state),
            session_tx,
            event_tx,
        );
        let task = tokio::spawn(engine.run(cmd_rx, session_rx, shutdown_rx));

        let client = Self {
            identity: config.identity,
            cmd_tx,
            state,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout: config.shutdown_timeout,
        };

        (client, event_rx)
    }

    // ── Playback ────────────────────────────────────────────────────

    /// Replace the whole playback state.
    ///
    /// Broadcast unless equivalent to the last state sent; kept as the
    /// pending value while offline.
    ///
    /// # Errors
    ///
    /// Returns [`WatchRoomError::EngineStopped`] if the engine has exited.
    pub fn update_playback(&self, state: PlaybackState) -> Result<()> {
        self.send(Command::UpdatePlayback(state))
    }

    /// Append a video to the queue, selecting and playing it if the queue had
    /// no selection.
    ///
    /// # Errors
    ///
    /// - [`WatchRoomError::InvalidVideoUrl`] if `url` carries no video id
    /// - [`WatchRoomError::EngineStopped`] if the engine has exited
    pub fn enqueue(&self, url: &str) -> Result<()> {
        let url = url.trim();
        if video_id(url).is_none() {
            return Err(WatchRoomError::InvalidVideoUrl(url.to_owned()));
        }
        self.send(Command::Enqueue(url.to_owned()))
    }

    /// # Errors
    ///
    /// Returns [`WatchRoomError::EngineStopped`] if the engine has exited.
    pub fn play(&self) -> Result<()> {
        self.send(Command::Play)
    }

    /// # Errors
    ///
    /// Returns [`WatchRoomError::EngineStopped`] if the engine has exited.
    pub fn pause(&self) -> Result<()> {
        self.send(Command::Pause)
    }

    /// Pause and rewind to the start.
    ///
    /// # Errors
    ///
    /// Returns [`WatchRoomError::EngineStopped`] if the engine has exited.
    pub fn stop(&self) -> Result<()> {
        self.send(Command::Stop)
    }

    /// Jump to `position` seconds.
    ///
    /// # Errors
    ///
    /// Returns [`WatchRoomError::EngineStopped`] if the engine has exited.
    pub fn seek(&self, position: f64) -> Result<()> {
        self.send(Command::Seek(position))
    }

    /// Report the player's current position. Only goes on the wire once it
    /// drifts out of tolerance of the last state sent.
    ///
    /// # Errors
    ///
    /// Returns [`WatchRoomError::EngineStopped`] if the engine has exited.
    pub fn report_position(&self, position: f64) -> Result<()> {
        self.send(Command::ReportPosition(position))
    }

    /// # Errors
    ///
    /// Returns [`WatchRoomError::EngineStopped`] if the engine has exited.
    pub fn next(&self) -> Result<()> {
        self.send(Command::Next)
    }

    /// # Errors
    ///
    /// Returns [`WatchRoomError::EngineStopped`] if the engine has exited.
    pub fn previous(&self) -> Result<()> {
        self.send(Command::Previous)
    }

    /// Play queue entry `index` from the start. Out-of-range indices are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns [`WatchRoomError::EngineStopped`] if the engine has exited.
    pub fn select(&self, index: usize) -> Result<()> {
        self.send(Command::Select(index))
    }

    /// The player finished the current video.
    ///
    /// # Errors
    ///
    /// Returns [`WatchRoomError::EngineStopped`] if the engine has exited.
    pub fn playback_ended(&self) -> Result<()> {
        self.send(Command::PlaybackEnded)
    }

    /// Reassert the local state to the room, or ask the room for its state
    /// if no video is active.
    ///
    /// # Errors
    ///
    /// Returns [`WatchRoomError::EngineStopped`] if the engine has exited.
    pub fn resync(&self) -> Result<()> {
        self.send(Command::Resync)
    }

    // ── Chat ────────────────────────────────────────────────────────

    /// Send a chat message. Blank messages and rapid resubmits are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`WatchRoomError::EngineStopped`] if the engine has exited.
    pub fn send_chat(&self, content: impl Into<String>) -> Result<()> {
        self.send(Command::SendChat(content.into()))
    }

    /// Tell the room the local user is typing.
    ///
    /// # Errors
    ///
    /// Returns [`WatchRoomError::EngineStopped`] if the engine has exited.
    pub fn notify_typing(&self) -> Result<()> {
        self.send(Command::NotifyTyping)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Start connecting again after the engine gave up reconnecting or the
    /// relay closed normally. Ignored in any other state.
    ///
    /// # Errors
    ///
    /// Returns [`WatchRoomError::EngineStopped`] if the engine has exited.
    pub fn restart(&self) -> Result<()> {
        self.send(Command::Restart)
    }

    /// Shut down the client, closing the connection with code 1000 and
    /// stopping the engine.
    ///
    /// Cancels every pending timer. Calling it again is a no-op. After this
    /// method the event receiver yields a final `Disconnected` and then `None`.
    pub async fn shutdown(&mut self) {
        debug!(identity = %self.identity, "WatchRoomClient: shutdown requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        // Await the engine with a timeout. If it doesn't exit in time, abort
        // it so the task cannot detach and run indefinitely.
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("engine terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("engine did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("engine aborted: {join_err}");
                    }
                }
            }
        }

        self.state.connected.store(false, Ordering::Release);
        self.state.running.store(false, Ordering::Release);
    }

    // ── State accessors ─────────────────────────────────────────────

    /// The display name this client joins with.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Returns `true` while a connection is open.
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Acquire)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.state.room.lock().await.connection()
    }

    pub async fn sync_status(&self) -> SyncStatus {
        self.state.room.lock().await.sync_status()
    }

    /// Online participants in snapshot order; the first is the host.
    pub async fn participants(&self) -> Vec<Participant> {
        self.state.room.lock().await.participants()
    }

    pub async fn typing_users(&self) -> Vec<String> {
        self.state.room.lock().await.typing_users()
    }

    /// Every chat message stored this session, in arrival order.
    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.state.room.lock().await.messages()
    }

    pub async fn playback(&self) -> PlaybackState {
        self.state.room.lock().await.playback()
    }

    /// Local cumulative watch time, in hours.
    pub async fn watch_hours(&self) -> f64 {
        self.state.room.lock().await.watch_hours()
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn send(&self, cmd: Command) -> Result<()> {
        if !self.state.running.load(Ordering::Acquire) {
            return Err(WatchRoomError::EngineStopped);
        }
        self.cmd_tx
            .send(cmd)
            .map_err(|_| WatchRoomError::EngineStopped)
    }
}

impl std::fmt::Debug for WatchRoomClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchRoomClient")
            .field("identity", &self.identity)
            .field("connected", &self.is_connected())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for WatchRoomClient {
    fn drop(&mut self) {
        // `Drop` is synchronous so a graceful close cannot be awaited here.
        // Aborting the engine drops its session handle, which aborts the
        // session task in turn.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::transport::{CloseCode, Transport};
    use crate::watch_time::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;

    // ── Mock transport ──────────────────────────────────────────────

    /// Records sent frames and never delivers anything.
    struct QuietTransport {
        sent: Arc<StdMutex<Vec<String>>>,
        closes: Arc<StdMutex<Vec<CloseCode>>>,
    }

    #[async_trait]
    impl Transport for QuietTransport {
        async fn send(&mut self, frame: String) -> std::result::Result<(), WatchRoomError> {
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }

        async fn recv(&mut self) -> Option<std::result::Result<String, WatchRoomError>> {
            std::future::pending().await
        }

        async fn close(&mut self, code: CloseCode) -> std::result::Result<(), WatchRoomError> {
            self.closes.lock().unwrap().push(code);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct QuietConnector {
        sent: Arc<StdMutex<Vec<String>>>,
        closes: Arc<StdMutex<Vec<CloseCode>>>,
    }

    #[async_trait]
    impl Connector for QuietConnector {
        async fn connect(&self) -> std::result::Result<Box<dyn Transport>, WatchRoomError> {
            Ok(Box::new(QuietTransport {
                sent: Arc::clone(&self.sent),
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    fn store() -> Arc<dyn KeyValueStore> {
        Arc::new(MemoryStore::new())
    }

    // ── Config ──────────────────────────────────────────────────────

    #[test]
    fn config_defaults() {
        let config = WatchRoomConfig::new("alice");
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert_eq!(config.sync_timeout, Duration::from_secs(5));
        assert_eq!(config.reconnect, ReconnectPolicy::default());
        assert_eq!(config.chat, ChatSettings::default());
        assert!(config.watch_hours_key.is_none());
    }

    #[test]
    fn event_channel_capacity_is_clamped_to_one() {
        let config = WatchRoomConfig::new("alice").with_event_channel_capacity(0);
        assert_eq!(config.event_channel_capacity, 1);
    }

    #[test]
    fn config_builder_methods() {
        let policy = ReconnectPolicy {
            max_attempts: 3,
            ..ReconnectPolicy::default()
        };
        let config = WatchRoomConfig::new("alice")
            .with_shutdown_timeout(Duration::from_millis(50))
            .with_reconnect_policy(policy.clone())
            .with_sync_timeout(Duration::from_secs(2))
            .with_watch_hours_key("watchHours");
        assert_eq!(config.shutdown_timeout, Duration::from_millis(50));
        assert_eq!(config.reconnect, policy);
        assert_eq!(config.sync_timeout, Duration::from_secs(2));
        assert_eq!(config.watch_hours_key.as_deref(), Some("watchHours"));
    }

    // ── Handle ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn connected_is_first_event() {
        let connector = QuietConnector::default();
        let (mut client, mut events) =
            WatchRoomClient::start(connector.clone(), WatchRoomConfig::new("alice"), store());

        assert_eq!(events.recv().await.unwrap(), WatchRoomEvent::Connected);
        assert!(client.is_connected());
        assert_eq!(client.connection_state().await, ConnectionState::Open);
        assert_eq!(connector.sent.lock().unwrap()[0], "alice");

        client.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_video_is_rejected_synchronously() {
        let (mut client, _events) =
            WatchRoomClient::start(QuietConnector::default(), WatchRoomConfig::new("alice"), store());
        assert!(matches!(
            client.enqueue("https://example.com"),
            Err(WatchRoomError::InvalidVideoUrl(_))
        ));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn commands_fail_after_shutdown() {
        let (mut client, _events) =
            WatchRoomClient::start(QuietConnector::default(), WatchRoomConfig::new("alice"), store());
        client.shutdown().await;
        assert!(matches!(client.play(), Err(WatchRoomError::EngineStopped)));
        assert!(matches!(
            client.send_chat("hi"),
            Err(WatchRoomError::EngineStopped)
        ));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn shutdown_emits_disconnected_with_normal_code() {
        let connector = QuietConnector::default();
        let (mut client, mut events) =
            WatchRoomClient::start(connector.clone(), WatchRoomConfig::new("alice"), store());
        assert_eq!(events.recv().await.unwrap(), WatchRoomEvent::Connected);

        client.shutdown().await;
        client.shutdown().await;

        let mut last = None;
        while let Some(event) = events.recv().await {
            last = Some(event);
        }
        assert!(matches!(
            last,
            Some(WatchRoomEvent::Disconnected {
                code: Some(CloseCode::NORMAL),
                ..
            })
        ));
        assert_eq!(*connector.closes.lock().unwrap(), [CloseCode::NORMAL]);
    }

    #[tokio::test]
    async fn drop_without_explicit_shutdown() {
        let (client, mut events) =
            WatchRoomClient::start(QuietConnector::default(), WatchRoomConfig::new("alice"), store());
        let _ = events.recv().await;
        drop(client);
        // The engine is aborted; the channel closes without hanging.
        while let Some(_event) = events.recv().await {}
    }

    /// Transport that hangs forever in `close()` so the shutdown timeout can
    /// be tested.
    struct HangingCloseTransport {
        close_called: Arc<AtomicBool>,
        dropped: Arc<AtomicBool>,
    }

    impl Drop for HangingCloseTransport {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::Release);
        }
    }

    #[async_trait]
    impl Transport for HangingCloseTransport {
        async fn send(&mut self, _frame: String) -> std::result::Result<(), WatchRoomError> {
            Ok(())
        }

        async fn recv(&mut self) -> Option<std::result::Result<String, WatchRoomError>> {
            std::future::pending().await
        }

        async fn close(&mut self, _code: CloseCode) -> std::result::Result<(), WatchRoomError> {
            self.close_called.store(true, Ordering::Release);
            std::future::pending().await
        }
    }

    struct HangingConnector {
        close_called: Arc<AtomicBool>,
        dropped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Connector for HangingConnector {
        async fn connect(&self) -> std::result::Result<Box<dyn Transport>, WatchRoomError> {
            Ok(Box::new(HangingCloseTransport {
                close_called: Arc::clone(&self.close_called),
                dropped: Arc::clone(&self.dropped),
            }))
        }
    }

    #[tokio::test]
    async fn shutdown_timeout_aborts_stuck_engine() {
        let close_called = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicBool::new(false));
        let connector = HangingConnector {
            close_called: Arc::clone(&close_called),
            dropped: Arc::clone(&dropped),
        };
        let config =
            WatchRoomConfig::new("alice").with_shutdown_timeout(Duration::from_millis(20));
        let (mut client, mut events) = WatchRoomClient::start(connector, config, store());
        assert_eq!(events.recv().await.unwrap(), WatchRoomEvent::Connected);

        client.shutdown().await;
        assert!(
            close_called.load(Ordering::Acquire),
            "transport.close() should have been attempted during graceful shutdown"
        );

        // Aborting the engine drops the session handle, which aborts the
        // session task and drops the transport.
        for _ in 0..10 {
            if dropped.load(Ordering::Acquire) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(dropped.load(Ordering::Acquire));
        assert!(!client.is_connected());
    }
}
