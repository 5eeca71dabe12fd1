//! One physical connection to the relay.
//!
//! A session is a spawned task that owns a single [`Transport`]. It connects
//! through the [`Connector`], sends the identity as the very first frame, and
//! then pumps frames in both directions until either side closes.
//!
//! Every event a session reports carries its [`Generation`]. The engine bumps
//! the generation each time it starts a session and discards any event whose
//! generation is not current, so a late event from a superseded connection can
//! never touch room state.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::{CloseCode, Connector, Transport};

/// Monotonic session id, one per connection attempt.
pub type Generation = u64;

/// Lifecycle of the engine's current connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection and none scheduled yet.
    #[default]
    Idle,
    /// A connection attempt is in flight, or a retry is scheduled.
    Connecting,
    /// The identity was sent; frames flow.
    Open,
    /// An intentional shutdown is in progress.
    Closing,
    /// Shut down, or out of retries. Only [`restart`] leaves this state.
    ///
    /// [`restart`]: crate::client::WatchRoomClient::restart
    ClosedFinal,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::ClosedFinal => "closed",
        };
        f.write_str(name)
    }
}

/// What a session reports back to the engine.
#[derive(Debug)]
pub(crate) enum SessionEventKind {
    /// Connected and the identity frame went out.
    Opened,
    /// One inbound text frame.
    Frame(String),
    /// The connection ended without a local close: the peer closed it, it
    /// failed, or it never opened. `code` is `None` when no close code was
    /// received, which counts as abnormal.
    Closed {
        code: Option<CloseCode>,
        reason: Option<String>,
    },
}

#[derive(Debug)]
pub(crate) struct SessionEvent {
    pub generation: Generation,
    pub kind: SessionEventKind,
}

#[derive(Debug)]
enum SessionCommand {
    Send(String),
    Close(CloseCode),
}

/// Engine-side handle to a running session task.
///
/// After [`close`](SessionHandle::close) the session reports nothing more.
/// Dropping the handle aborts the task.
pub(crate) struct SessionHandle {
    generation: Generation,
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    task: Option<JoinHandle<()>>,
    closed: bool,
}

impl SessionHandle {
    /// Spawn a session that connects and joins as `identity`.
    pub fn spawn(
        generation: Generation,
        connector: Arc<dyn Connector>,
        identity: String,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_session(
            generation, connector, identity, cmd_rx, events,
        ));
        Self {
            generation,
            cmd_tx,
            task: Some(task),
            closed: false,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Queue one frame. Dropped with a warning once the session has ended.
    pub fn send(&self, frame: String) {
        if self.closed || self.cmd_tx.send(SessionCommand::Send(frame)).is_err() {
            warn!(generation = self.generation, "session not open, dropping frame");
        }
    }

    /// Close with `code`. Only the first call has any effect.
    pub fn close(&mut self, code: CloseCode) {
        if self.closed {
            return;
        }
        self.closed = true;
        debug!(generation = self.generation, %code, "closing session");
        let _ = self.cmd_tx.send(SessionCommand::Close(code));
    }

    /// Close with `code` and wait for the session task to finish.
    pub async fn close_and_wait(&mut self, code: CloseCode) {
        self.close(code);
        if let Some(task) = self.task.take() {
            if let Err(join_err) = task.await {
                debug!(generation = self.generation, "session task ended: {join_err}");
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("generation", &self.generation)
            .field("closed", &self.closed)
            .finish()
    }
}

// ── Session task ────────────────────────────────────────────────────

async fn run_session(
    generation: Generation,
    connector: Arc<dyn Connector>,
    identity: String,
    mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let emit = |kind: SessionEventKind| {
        if events.send(SessionEvent { generation, kind }).is_err() {
            debug!(generation, "engine gone, dropping session event");
        }
    };

    debug!(generation, "connecting");
    let connect = connector.connect();
    tokio::pin!(connect);
    let mut transport: Box<dyn Transport> = loop {
        tokio::select! {
            result = &mut connect => match result {
                Ok(transport) => break transport,
                Err(e) => {
                    warn!(generation, "connect failed: {e}");
                    emit(SessionEventKind::Closed {
                        code: None,
                        reason: Some(format!("connect failed: {e}")),
                    });
                    return;
                }
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(SessionCommand::Send(_)) => {
                    warn!(generation, "session not open yet, dropping frame");
                }
                Some(SessionCommand::Close(_)) | None => {
                    debug!(generation, "connect abandoned");
                    return;
                }
            },
        }
    };

    if let Err(e) = transport.send(identity).await {
        warn!(generation, "failed to send identity: {e}");
        let _ = transport.close(CloseCode::ABNORMAL).await;
        emit(SessionEventKind::Closed {
            code: None,
            reason: Some(format!("failed to send identity: {e}")),
        });
        return;
    }
    info!(generation, "session open");
    emit(SessionEventKind::Opened);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(SessionCommand::Send(frame)) => {
                    if let Err(e) = transport.send(frame).await {
                        warn!(generation, "transport send error: {e}");
                        let _ = transport.close(CloseCode::ABNORMAL).await;
                        emit(SessionEventKind::Closed {
                            code: None,
                            reason: Some(format!("transport send error: {e}")),
                        });
                        return;
                    }
                }
                Some(SessionCommand::Close(code)) => {
                    if let Err(e) = transport.close(code).await {
                        debug!(generation, "error while closing transport: {e}");
                    }
                    return;
                }
                None => {
                    debug!(generation, "session handle dropped");
                    let _ = transport.close(CloseCode::GOING_AWAY).await;
                    return;
                }
            },

            incoming = transport.recv() => match incoming {
                Some(Ok(text)) => emit(SessionEventKind::Frame(text)),
                Some(Err(e)) => {
                    warn!(generation, "transport receive error: {e}");
                    emit(SessionEventKind::Closed {
                        code: None,
                        reason: Some(format!("transport receive error: {e}")),
                    });
                    return;
                }
                None => {
                    let code = transport.close_code();
                    debug!(generation, code = ?code, "transport closed by peer");
                    emit(SessionEventKind::Closed { code, reason: None });
                    return;
                }
            },
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
    use crate::error::WatchRoomError;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    type Log = Arc<StdMutex<Vec<String>>>;

    struct ScriptedTransport {
        incoming: mpsc::UnboundedReceiver<String>,
        sent: Log,
        closes: Arc<StdMutex<Vec<CloseCode>>>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&mut self, frame: String) -> Result<(), WatchRoomError> {
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<String, WatchRoomError>> {
            self.incoming.recv().await.map(Ok)
        }

        async fn close(&mut self, code: CloseCode) -> Result<(), WatchRoomError> {
            self.closes.lock().unwrap().push(code);
            Ok(())
        }
    }

    struct OneShotConnector {
        transport: StdMutex<Option<ScriptedTransport>>,
    }

    #[async_trait]
    impl Connector for OneShotConnector {
        async fn connect(&self) -> Result<Box<dyn Transport>, WatchRoomError> {
            match self.transport.lock().unwrap().take() {
                Some(t) => Ok(Box::new(t)),
                None => Err(WatchRoomError::TransportClosed),
            }
        }
    }

    struct Fixture {
        server_tx: mpsc::UnboundedSender<String>,
        sent: Log,
        closes: Arc<StdMutex<Vec<CloseCode>>>,
        connector: Arc<dyn Connector>,
    }

    fn fixture() -> Fixture {
        let (server_tx, incoming) = mpsc::unbounded_channel();
        let sent = Log::default();
        let closes = Arc::new(StdMutex::new(Vec::new()));
        let transport = ScriptedTransport {
            incoming,
            sent: Arc::clone(&sent),
            closes: Arc::clone(&closes),
        };
        Fixture {
            server_tx,
            sent,
            closes,
            connector: Arc::new(OneShotConnector {
                transport: StdMutex::new(Some(transport)),
            }),
        }
    }

    #[tokio::test]
    async fn identity_is_the_first_frame() {
        let fx = fixture();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = SessionHandle::spawn(3, fx.connector, "alice".into(), tx);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.generation, 3);
        assert!(matches!(event.kind, SessionEventKind::Opened));

        session.send("{\"type\":\"sync\"}".into());
        fx.server_tx.send("{\"type\":\"presence\"}".into()).unwrap();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event.kind, SessionEventKind::Frame(ref t) if t.contains("presence")));
        assert_eq!(fx.sent.lock().unwrap()[0], "alice");
    }

    #[tokio::test]
    async fn peer_close_is_reported_without_a_code() {
        let fx = fixture();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _session = SessionHandle::spawn(1, fx.connector, "alice".into(), tx);
        rx.recv().await.unwrap();

        drop(fx.server_tx);
        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event.kind,
            SessionEventKind::Closed { code: None, .. }
        ));
    }

    #[tokio::test]
    async fn connect_failure_is_reported_as_closed() {
        let connector: Arc<dyn Connector> = Arc::new(OneShotConnector {
            transport: StdMutex::new(None),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _session = SessionHandle::spawn(9, connector, "alice".into(), tx);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.generation, 9);
        assert!(matches!(
            event.kind,
            SessionEventKind::Closed { reason: Some(_), .. }
        ));
    }

    #[tokio::test]
    async fn local_close_is_silent_and_idempotent() {
        let fx = fixture();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = SessionHandle::spawn(1, fx.connector, "alice".into(), tx);
        rx.recv().await.unwrap();

        session.close(CloseCode::NORMAL);
        session.close_and_wait(CloseCode::NORMAL).await;
        assert_eq!(*fx.closes.lock().unwrap(), [CloseCode::NORMAL]);

        // No Closed event for a close we asked for.
        assert!(rx.recv().await.is_none());
    }
}
