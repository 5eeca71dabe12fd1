//! # Loopback Room Example
//!
//! Runs a tiny in-process relay and two clients, `alice` and `bob`, against
//! it. Shows how to implement [`Connector`] and [`Transport`] for a custom
//! backend, and what a host sees on the event channel:
//!
//! 1. Both clients join and receive presence snapshots
//! 2. `alice` queues a video; `bob` is switched to it
//! 3. They exchange a chat message
//! 4. Both shut down gracefully
//!
//! ## Running
//!
//! ```sh
//! cargo run --example loopback_room
//!
//! # Verbose engine logs:
//! RUST_LOG=watchroom_client=debug cargo run --example loopback_room
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use watchroom_client::{
    CloseCode, Connector, MemoryStore, Transport, WatchRoomClient, WatchRoomConfig,
    WatchRoomError, WatchRoomEvent,
};

const VIDEO: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

// ─────────────────────────────────────────────────────────────────────
// Step 1: A minimal relay
// ─────────────────────────────────────────────────────────────────────

enum RelayInput {
    Connect {
        conn: u64,
        outbound: mpsc::UnboundedSender<String>,
    },
    Frame {
        conn: u64,
        text: String,
    },
    Leave {
        conn: u64,
    },
}

struct Member {
    /// Set by the first frame on the connection.
    name: Option<String>,
    outbound: mpsc::UnboundedSender<String>,
}

/// Fans frames out to everyone, stamping the sender, and remembers the last
/// playback state to answer sync requests and greet new joiners.
async fn run_relay(mut input: mpsc::UnboundedReceiver<RelayInput>) {
    let mut members: HashMap<u64, Member> = HashMap::new();
    let mut order: Vec<u64> = Vec::new();
    let mut last_video: Option<Value> = None;

    while let Some(msg) = input.recv().await {
        match msg {
            RelayInput::Connect { conn, outbound } => {
                members.insert(
                    conn,
                    Member {
                        name: None,
                        outbound,
                    },
                );
                order.push(conn);
            }
            RelayInput::Leave { conn } => {
                members.remove(&conn);
                order.retain(|c| *c != conn);
                broadcast_presence(&members, &order);
            }
            RelayInput::Frame { conn, text } => {
                let Some(member) = members.get_mut(&conn) else {
                    continue;
                };
                let Some(sender) = member.name.clone() else {
                    member.name = Some(text);
                    if let Some(video) = &last_video {
                        let _ = member.outbound.send(video.to_string());
                    }
                    broadcast_presence(&members, &order);
                    continue;
                };

                let Ok(Value::Object(mut frame)) = serde_json::from_str::<Value>(&text) else {
                    tracing::warn!(%sender, "relay: dropping malformed frame");
                    continue;
                };
                let kind = frame
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                frame.insert("sender".into(), Value::String(sender));
                if kind != "message" {
                    frame.remove("timestamp");
                }

                match kind.as_str() {
                    "sync" => {
                        let mut reply = match &last_video {
                            Some(Value::Object(video)) => video.clone(),
                            _ => serde_json::Map::new(),
                        };
                        reply.insert("type".into(), json!("sync"));
                        reply.remove("sender");
                        let reply = Value::Object(reply);
                        if let Some(member) = members.get(&conn) {
                            let _ = member.outbound.send(reply.to_string());
                        }
                    }
                    "video" => {
                        let frame = Value::Object(frame);
                        last_video = Some(frame.clone());
                        broadcast(&members, &frame.to_string());
                    }
                    _ => broadcast(&members, &Value::Object(frame).to_string()),
                }
            }
        }
    }
}

fn broadcast(members: &HashMap<u64, Member>, text: &str) {
    for member in members.values().filter(|m| m.name.is_some()) {
        let _ = member.outbound.send(text.to_owned());
    }
}

fn broadcast_presence(members: &HashMap<u64, Member>, order: &[u64]) {
    let users: Vec<&str> = order
        .iter()
        .filter_map(|conn| members.get(conn)?.name.as_deref())
        .collect();
    broadcast(members, &json!({"type": "presence", "users": users}).to_string());
}

// ─────────────────────────────────────────────────────────────────────
// Step 2: Transport and connector over channels
// ─────────────────────────────────────────────────────────────────────

struct LoopbackTransport {
    conn: u64,
    relay: mpsc::UnboundedSender<RelayInput>,
    inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, frame: String) -> Result<(), WatchRoomError> {
        self.relay
            .send(RelayInput::Frame {
                conn: self.conn,
                text: frame,
            })
            .map_err(|_| WatchRoomError::TransportClosed)
    }

    async fn recv(&mut self) -> Option<Result<String, WatchRoomError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self, _code: CloseCode) -> Result<(), WatchRoomError> {
        let _ = self.relay.send(RelayInput::Leave { conn: self.conn });
        Ok(())
    }
}

#[derive(Clone)]
struct LoopbackConnector {
    relay: mpsc::UnboundedSender<RelayInput>,
    next_conn: Arc<AtomicU64>,
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, WatchRoomError> {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let (outbound, inbound) = mpsc::unbounded_channel();
        self.relay
            .send(RelayInput::Connect { conn, outbound })
            .map_err(|_| WatchRoomError::TransportClosed)?;
        Ok(Box::new(LoopbackTransport {
            conn,
            relay: self.relay.clone(),
            inbound,
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 3: Two clients in one room
// ─────────────────────────────────────────────────────────────────────

/// Log every event for `name` until its channel closes.
fn log_events(name: &'static str, mut events: mpsc::Receiver<WatchRoomEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                WatchRoomEvent::ChatMessage(msg) => {
                    tracing::info!("[{name}] {}: {}", msg.sender, msg.content);
                }
                WatchRoomEvent::PlaybackChanged(state) => {
                    tracing::info!(
                        "[{name}] now {:?} {} at {:.1}s",
                        state.playback_state,
                        state.video_url,
                        state.current_time
                    );
                }
                WatchRoomEvent::WatchHoursChanged { .. } => {}
                other => tracing::info!("[{name}] {other:?}"),
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Relay ───────────────────────────────────────────────────────
    let (relay_tx, relay_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_relay(relay_rx));
    let connector = LoopbackConnector {
        relay: relay_tx,
        next_conn: Arc::new(AtomicU64::new(1)),
    };

    // ── Clients ─────────────────────────────────────────────────────
    let (mut alice, alice_events) = WatchRoomClient::start(
        connector.clone(),
        WatchRoomConfig::new("alice"),
        Arc::new(MemoryStore::new()),
    );
    log_events("alice", alice_events);

    let (mut bob, bob_events) = WatchRoomClient::start(
        connector,
        WatchRoomConfig::new("bob"),
        Arc::new(MemoryStore::new()),
    );
    log_events("bob", bob_events);

    tokio::time::sleep(Duration::from_millis(200)).await;

    alice.enqueue(VIDEO)?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    bob.send_chat("nice pick")?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let names: Vec<String> = alice
        .participants()
        .await
        .into_iter()
        .map(|p| p.name)
        .collect();
    tracing::info!("room: {names:?}, bob is watching {:?}", bob.playback().await.video_url());

    // ── Shutdown ────────────────────────────────────────────────────
    bob.shutdown().await;
    alice.shutdown().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}
