#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for watch-room integration tests.
//!
//! Provides a channel-based [`MockTransport`] driven from the test through a
//! [`ServerHandle`], a scripted [`MockConnector`], and helpers for waiting on
//! events under a paused tokio clock.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use watchroom_client::{
    CloseCode, Connector, MemoryStore, Transport, WatchRoomClient, WatchRoomConfig,
    WatchRoomError, WatchRoomEvent,
};

// ── MockTransport ───────────────────────────────────────────────────

enum Inbound {
    Frame(String),
    Close(Option<CloseCode>),
    Fail(String),
}

/// A transport whose inbound side is fed by a [`ServerHandle`].
///
/// Everything the client sends is recorded, as is every close code it uses.
/// Once the handle is dropped `recv` hangs, so the session stays open until
/// the client closes it.
pub struct MockTransport {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    sent: Arc<StdMutex<Vec<String>>>,
    closes: Arc<StdMutex<Vec<CloseCode>>>,
    peer_close: Option<CloseCode>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, frame: String) -> Result<(), WatchRoomError> {
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, WatchRoomError>> {
        match self.inbound.recv().await {
            Some(Inbound::Frame(text)) => Some(Ok(text)),
            Some(Inbound::Close(code)) => {
                self.peer_close = code;
                None
            }
            Some(Inbound::Fail(reason)) => Some(Err(WatchRoomError::TransportReceive(reason))),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self, code: CloseCode) -> Result<(), WatchRoomError> {
        self.closes.lock().unwrap().push(code);
        Ok(())
    }

    fn close_code(&self) -> Option<CloseCode> {
        self.peer_close
    }
}

/// The relay's end of one [`MockTransport`].
#[derive(Clone)]
pub struct ServerHandle {
    tx: mpsc::UnboundedSender<Inbound>,
    sent: Arc<StdMutex<Vec<String>>>,
    closes: Arc<StdMutex<Vec<CloseCode>>>,
}

impl ServerHandle {
    /// Deliver one raw text frame to the client.
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.tx.send(Inbound::Frame(text.into()));
    }

    pub fn push_json(&self, value: Value) {
        self.push(value.to_string());
    }

    /// Close from the relay side. `None` simulates a drop without a close frame.
    pub fn close(&self, code: Option<CloseCode>) {
        let _ = self.tx.send(Inbound::Close(code));
    }

    pub fn fail(&self, reason: &str) {
        let _ = self.tx.send(Inbound::Fail(reason.into()));
    }

    /// Every raw frame the client sent, identity included.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// Sent JSON frames with the given `type`.
    pub fn sent_of_type(&self, kind: &str) -> Vec<Value> {
        self.sent()
            .iter()
            .filter_map(|raw| serde_json::from_str::<Value>(raw).ok())
            .filter(|v| v["type"] == kind)
            .collect()
    }

    /// Close codes the client used on this transport.
    pub fn close_codes(&self) -> Vec<CloseCode> {
        self.closes.lock().unwrap().clone()
    }
}

fn mock_pair() -> (MockTransport, ServerHandle) {
    let (tx, inbound) = mpsc::unbounded_channel();
    let sent = Arc::new(StdMutex::new(Vec::new()));
    let closes = Arc::new(StdMutex::new(Vec::new()));
    let transport = MockTransport {
        inbound,
        sent: Arc::clone(&sent),
        closes: Arc::clone(&closes),
        peer_close: None,
    };
    (transport, ServerHandle { tx, sent, closes })
}

// ── MockConnector ───────────────────────────────────────────────────

enum Outcome {
    Accept(MockTransport),
    Refuse,
}

/// A connector that plays back a script of accepted and refused attempts.
///
/// Attempts past the end of the script are refused. Clones share the script,
/// so tests keep one clone to extend it and inspect attempt times.
#[derive(Clone, Default)]
pub struct MockConnector {
    script: Arc<StdMutex<VecDeque<Outcome>>>,
    attempts: Arc<StdMutex<Vec<Instant>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an attempt that succeeds, returning the relay's handle to it.
    pub fn accept(&self) -> ServerHandle {
        let (transport, handle) = mock_pair();
        self.script
            .lock()
            .unwrap()
            .push_back(Outcome::Accept(transport));
        handle
    }

    /// Queue an attempt that fails to connect.
    pub fn refuse(&self) {
        self.script.lock().unwrap().push_back(Outcome::Refuse);
    }

    /// When each connect attempt was made.
    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, WatchRoomError> {
        self.attempts.lock().unwrap().push(Instant::now());
        let outcome = self.script.lock().unwrap().pop_front();
        match outcome {
            Some(Outcome::Accept(transport)) => Ok(Box::new(transport)),
            Some(Outcome::Refuse) | None => Err(WatchRoomError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))),
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

pub const IDENTITY: &str = "alice";

/// Route engine logs to the test harness. Set `RUST_LOG=watchroom_client=debug`
/// to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Start a client named [`IDENTITY`] backed by a fresh [`MemoryStore`].
pub fn start(connector: &MockConnector) -> (WatchRoomClient, mpsc::Receiver<WatchRoomEvent>) {
    start_with(connector, WatchRoomConfig::new(IDENTITY), Arc::new(MemoryStore::new()))
}

pub fn start_with(
    connector: &MockConnector,
    config: WatchRoomConfig,
    store: Arc<MemoryStore>,
) -> (WatchRoomClient, mpsc::Receiver<WatchRoomEvent>) {
    init_tracing();
    WatchRoomClient::start(connector.clone(), config, store)
}

/// Receive the next event, failing the test after a long (virtual) wait.
pub async fn next_event(rx: &mut mpsc::Receiver<WatchRoomEvent>) -> WatchRoomEvent {
    tokio::time::timeout(Duration::from_secs(600), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Skip events until one matches `pred`, and return it.
pub async fn wait_for<F>(rx: &mut mpsc::Receiver<WatchRoomEvent>, mut pred: F) -> WatchRoomEvent
where
    F: FnMut(&WatchRoomEvent) -> bool,
{
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}

/// Let every task run until it blocks, advancing the paused clock by 1ms.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
