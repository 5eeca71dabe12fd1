//! The background task behind a [`WatchRoomClient`](crate::client::WatchRoomClient).
//!
//! One engine task owns every piece of mutable connection state: the current
//! session, the backoff counter, and the single reconnect deadline. It
//! multiplexes four sources with `tokio::select!`:
//!
//! 1. commands from the client handle
//! 2. the shutdown signal
//! 3. events from the current session (stale generations are discarded)
//! 4. one sleep until the earliest pending deadline
//!
//! Room state lives behind a mutex shared with the handle so accessors can
//! read it; only the engine writes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::event::WatchRoomEvent;
use crate::playback::PlaybackState;
use crate::reconnect::{Backoff, ReconnectPolicy, Retry};
use crate::room::{wall_clock_ms, Room};
use crate::session::{ConnectionState, Generation, SessionEvent, SessionEventKind, SessionHandle};
use crate::transport::{CloseCode, Connector};

// ── Shared state ────────────────────────────────────────────────────

/// State shared between the client handle and the engine task.
pub(crate) struct ClientState {
    /// Mirrors `ConnectionState::Open` for lock-free reads.
    pub connected: AtomicBool,
    /// Cleared once the engine task has exited.
    pub running: AtomicBool,
    pub room: Mutex<Room>,
}

impl ClientState {
    pub fn new(room: Room) -> Self {
        Self {
            connected: AtomicBool::new(false),
            running: AtomicBool::new(true),
            room: Mutex::new(room),
        }
    }
}

/// Host requests forwarded to the engine.
#[derive(Debug)]
pub(crate) enum Command {
    UpdatePlayback(PlaybackState),
    Enqueue(String),
    Play,
    Pause,
    Stop,
    Seek(f64),
    ReportPosition(f64),
    Next,
    Previous,
    Select(usize),
    PlaybackEnded,
    Resync,
    SendChat(String),
    NotifyTyping,
    Restart,
}

// ── Engine ──────────────────────────────────────────────────────────

pub(crate) struct Engine {
    connector: Arc<dyn Connector>,
    identity: String,
    state: Arc<ClientState>,
    backoff: Backoff,
    generation: Generation,
    session: Option<SessionHandle>,
    /// The only reconnect timer; replaced, never duplicated.
    reconnect_at: Option<Instant>,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    event_tx: mpsc::Sender<WatchRoomEvent>,
}

impl Engine {
    pub fn new(
        connector: Arc<dyn Connector>,
        identity: String,
        policy: ReconnectPolicy,
        state: Arc<ClientState>,
        session_tx: mpsc::UnboundedSender<SessionEvent>,
        event_tx: mpsc::Sender<WatchRoomEvent>,
    ) -> Self {
        Self {
            connector,
            identity,
            state,
            backoff: Backoff::new(policy),
            generation: 0,
            session: None,
            reconnect_at: None,
            session_tx,
            event_tx,
        }
    }

    /// Run until shutdown is signalled or the client handle goes away.
    pub async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut session_rx: mpsc::UnboundedReceiver<SessionEvent>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        debug!(identity = %self.identity, "engine started");
        self.start_session().await;

        loop {
            let deadline = self.next_deadline().await;
            tokio::select! {
                // Branch 1: command from the client handle
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        debug!("command channel closed, shutting down engine");
                        self.shutdown().await;
                        break;
                    }
                },

                // Branch 2: shutdown signal
                _ = &mut shutdown_rx => {
                    debug!("shutdown signal received");
                    self.shutdown().await;
                    break;
                }

                // Branch 3: event from a session
                Some(event) = session_rx.recv() => self.handle_session_event(event).await,

                // Branch 4: earliest timer
                () = sleep_until_opt(deadline) => self.on_timer().await,
            }
        }

        self.state.running.store(false, Ordering::Release);
        debug!(identity = %self.identity, "engine exited");
    }

    // ── Sessions ────────────────────────────────────────────────────

    async fn start_session(&mut self) {
        self.reconnect_at = None;
        if let Some(mut stale) = self.session.take() {
            stale.close(CloseCode::GOING_AWAY);
        }
        self.generation += 1;
        info!(identity = %self.identity, generation = self.generation, "starting session");
        self.with_room(|room| room.set_connection(ConnectionState::Connecting))
            .await;
        self.session = Some(SessionHandle::spawn(
            self.generation,
            Arc::clone(&self.connector),
            self.identity.clone(),
            self.session_tx.clone(),
        ));
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        if event.generation != self.generation {
            debug!(
                stale = event.generation,
                current = self.generation,
                "ignoring event from superseded session"
            );
            return;
        }
        let now = Instant::now();
        match event.kind {
            SessionEventKind::Opened => {
                self.backoff.reset();
                self.state.connected.store(true, Ordering::Release);
                info!(identity = %self.identity, generation = self.generation, "connected");
                self.with_room(|room| room.on_open(now, wall_clock_ms())).await;
            }
            SessionEventKind::Frame(text) => {
                self.with_room(|room| room.handle_text(&text, now, wall_clock_ms()))
                    .await;
            }
            SessionEventKind::Closed { code, reason } => {
                self.on_session_closed(code, reason, now).await;
            }
        }
    }

    async fn on_session_closed(
        &mut self,
        code: Option<CloseCode>,
        reason: Option<String>,
        now: Instant,
    ) {
        self.session = None;
        self.state.connected.store(false, Ordering::Release);
        let was_open = self
            .with_room(|room| {
                let was_open = room.is_connected();
                room.on_close();
                was_open
            })
            .await;
        if was_open {
            emit_event(
                &self.event_tx,
                WatchRoomEvent::Disconnected {
                    reason: reason.clone(),
                    code,
                },
            );
        }

        if code.is_some_and(CloseCode::is_normal) {
            info!(identity = %self.identity, "connection closed normally, not reconnecting");
            self.with_room(|room| room.set_connection(ConnectionState::ClosedFinal))
                .await;
            return;
        }

        match self.backoff.record_failure() {
            Retry::After { attempt, delay } => {
                warn!(
                    identity = %self.identity,
                    attempt,
                    ?delay,
                    reason = reason.as_deref().unwrap_or("closed"),
                    "connection lost, reconnecting"
                );
                self.reconnect_at = Some(now + delay);
                self.with_room(|room| room.set_connection(ConnectionState::Connecting))
                    .await;
                emit_event(
                    &self.event_tx,
                    WatchRoomEvent::ReconnectScheduled { attempt, delay },
                );
            }
            Retry::Exhausted { attempts } => {
                warn!(identity = %self.identity, attempts, "giving up on reconnecting");
                self.with_room(|room| room.set_connection(ConnectionState::ClosedFinal))
                    .await;
                emit_event(
                    &self.event_tx,
                    WatchRoomEvent::ReconnectsExhausted { attempts },
                );
            }
        }
    }

    // ── Commands ────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        let now = Instant::now();
        let wall_ms = wall_clock_ms();
        let result = match cmd {
            Command::UpdatePlayback(state) => {
                self.change_playback(now, wall_ms, move |s| {
                    *s = state;
                    Ok(())
                })
                .await
            }
            Command::Enqueue(url) => {
                self.change_playback(now, wall_ms, move |s| s.enqueue(&url))
                    .await
            }
            Command::Play => self.change_playback(now, wall_ms, |s| {
                s.play();
                Ok(())
            })
            .await,
            Command::Pause => self.change_playback(now, wall_ms, |s| {
                s.pause();
                Ok(())
            })
            .await,
            Command::Stop => self.change_playback(now, wall_ms, |s| {
                s.stop();
                Ok(())
            })
            .await,
            Command::Seek(position) => self.change_playback(now, wall_ms, move |s| {
                s.seek(position);
                Ok(())
            })
            .await,
            Command::Next => self.change_playback(now, wall_ms, |s| {
                s.next();
                Ok(())
            })
            .await,
            Command::Previous => self.change_playback(now, wall_ms, |s| {
                s.previous();
                Ok(())
            })
            .await,
            Command::Select(index) => self.change_playback(now, wall_ms, move |s| {
                s.select(index);
                Ok(())
            })
            .await,
            Command::PlaybackEnded => self.change_playback(now, wall_ms, |s| {
                s.playback_ended();
                Ok(())
            })
            .await,
            Command::ReportPosition(position) => {
                self.with_room(|room| room.report_position(position, wall_ms))
                    .await;
                Ok(())
            }
            Command::Resync => {
                self.with_room(|room| room.resync(now, wall_ms)).await;
                Ok(())
            }
            Command::SendChat(content) => {
                self.with_room(|room| room.send_chat(&content, now, wall_ms))
                    .await;
                Ok(())
            }
            Command::NotifyTyping => {
                self.with_room(Room::notify_typing).await;
                Ok(())
            }
            Command::Restart => {
                self.restart().await;
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(identity = %self.identity, "command rejected: {e}");
        }
    }

    async fn change_playback<F>(&mut self, now: Instant, wall_ms: u64, change: F) -> Result<()>
    where
        F: FnOnce(&mut PlaybackState) -> Result<()>,
    {
        self.with_room(|room| room.change_playback(false, now, wall_ms, change))
            .await
    }

    async fn restart(&mut self) {
        let connection = self.state.room.lock().await.connection();
        if connection != ConnectionState::ClosedFinal {
            debug!(%connection, "restart ignored, engine is not stopped");
            return;
        }
        info!(identity = %self.identity, "restarting connection");
        self.backoff.reset();
        self.start_session().await;
    }

    // ── Timers ──────────────────────────────────────────────────────

    async fn next_deadline(&self) -> Option<Instant> {
        let room_deadline = self.state.room.lock().await.next_deadline();
        match (room_deadline, self.reconnect_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn on_timer(&mut self) {
        let now = Instant::now();
        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.start_session().await;
        }
        self.with_room(|room| room.poll_timers(now)).await;
    }

    // ── Shutdown ────────────────────────────────────────────────────

    async fn shutdown(&mut self) {
        self.reconnect_at = None;
        self.with_room(|room| room.set_connection(ConnectionState::Closing))
            .await;
        if let Some(mut session) = self.session.take() {
            session.close_and_wait(CloseCode::NORMAL).await;
        }
        self.state.connected.store(false, Ordering::Release);
        self.with_room(|room| {
            room.on_close();
            room.set_connection(ConnectionState::ClosedFinal);
        })
        .await;

        // Blocking send: this is the last event and must not be dropped.
        let event = WatchRoomEvent::Disconnected {
            reason: Some("client shut down".into()),
            code: Some(CloseCode::NORMAL),
        };
        if self.event_tx.send(event).await.is_err() {
            debug!("event channel closed, receiver dropped");
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    /// Run `f` against the room, then send the frames and emit the events it
    /// queued.
    async fn with_room<R>(&mut self, f: impl FnOnce(&mut Room) -> R) -> R {
        let (result, frames, events) = {
            let mut room = self.state.room.lock().await;
            let result = f(&mut room);
            (result, room.take_outbox(), room.take_events())
        };

        for frame in frames {
            match frame.encode() {
                Ok(text) => match &self.session {
                    Some(session) => {
                        debug!(kind = frame.kind(), generation = session.generation(), "sending frame");
                        session.send(text);
                    }
                    None => warn!(kind = frame.kind(), "no session, dropping frame"),
                },
                Err(e) => warn!(kind = frame.kind(), "failed to encode frame: {e}"),
            }
        }
        for event in events {
            emit_event(&self.event_tx, event);
        }
        result
    }
}

/// Sleep until `deadline`, or forever if there is none.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Emit an event to the event channel. If the channel is full, log a warning
/// and drop the event to avoid blocking the engine.
fn emit_event(event_tx: &mpsc::Sender<WatchRoomEvent>, event: WatchRoomEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!("event channel full, dropping event: {dropped:?}");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("event channel closed, receiver dropped");
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
    use crate::client::WatchRoomConfig;
    use crate::playback::SyncStatus;
    use crate::transport::Transport;
    use crate::watch_time::MemoryStore;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Connect attempts never finish, so sessions only ever speak when the
    /// test injects events on their behalf.
    struct StalledConnector;

    #[async_trait]
    impl Connector for StalledConnector {
        async fn connect(&self) -> Result<Box<dyn Transport>> {
            std::future::pending().await
        }
    }

    fn engine() -> (Engine, Arc<ClientState>, mpsc::Receiver<WatchRoomEvent>) {
        let config = WatchRoomConfig::new("alice");
        let room = Room::new(&config, Arc::new(MemoryStore::new()));
        let state = Arc::new(ClientState::new(room));
        let (session_tx, _session_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(16);
        let engine = Engine::new(
            Arc::new(StalledConnector),
            config.identity,
            ReconnectPolicy::default(),
            Arc::clone(&state),
            session_tx,
            event_tx,
        );
        (engine, state, event_rx)
    }

    fn event(generation: Generation, kind: SessionEventKind) -> SessionEvent {
        SessionEvent { generation, kind }
    }

    #[tokio::test]
    async fn events_from_superseded_sessions_are_ignored() {
        let (mut engine, state, mut events) = engine();
        engine.start_session().await;
        engine.start_session().await;
        assert_eq!(engine.generation, 2);
        let roster = state.room.lock().await.participants();

        engine
            .handle_session_event(event(1, SessionEventKind::Opened))
            .await;
        engine
            .handle_session_event(event(
                1,
                SessionEventKind::Frame(r#"{"type":"presence","users":["bob"]}"#.into()),
            ))
            .await;
        engine
            .handle_session_event(event(1, SessionEventKind::Closed { code: None, reason: None }))
            .await;

        assert!(!state.connected.load(Ordering::Acquire));
        assert!(engine.session.is_some());
        assert!(engine.reconnect_at.is_none());
        assert_eq!(state.room.lock().await.participants(), roster);
        assert!(events.try_recv().is_err());

        engine
            .handle_session_event(event(2, SessionEventKind::Opened))
            .await;
        assert!(state.connected.load(Ordering::Acquire));
        assert_eq!(events.try_recv().unwrap(), WatchRoomEvent::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn abnormal_close_arms_a_single_reconnect_timer() {
        let (mut engine, state, mut events) = engine();
        engine.start_session().await;
        engine
            .handle_session_event(event(1, SessionEventKind::Opened))
            .await;
        let closed_at = Instant::now();
        engine
            .handle_session_event(event(1, SessionEventKind::Closed { code: None, reason: None }))
            .await;

        assert_eq!(engine.reconnect_at, Some(closed_at + Duration::from_secs(1)));
        assert_eq!(
            engine.next_deadline().await,
            Some(closed_at + Duration::from_secs(1))
        );
        assert_eq!(
            state.room.lock().await.connection(),
            ConnectionState::Connecting
        );

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            [
                WatchRoomEvent::Connected,
                WatchRoomEvent::SyncStatusChanged(SyncStatus::Syncing),
                WatchRoomEvent::SyncStatusChanged(SyncStatus::Waiting),
                WatchRoomEvent::Disconnected {
                    reason: None,
                    code: None
                },
                WatchRoomEvent::ReconnectScheduled {
                    attempt: 1,
                    delay: Duration::from_secs(1)
                },
            ]
        );
    }
}
