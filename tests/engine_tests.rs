#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! End-to-end tests for the watch-room engine over a mock transport.
//!
//! Every test runs on a paused tokio clock, so timeouts and backoff delays
//! elapse instantly while their ordering stays exact.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};
use watchroom_client::{
    CloseCode, ConnectionState, KeyValueStore, MemoryStore, PlaybackState, ReconnectPolicy,
    SyncStatus, WatchRoomConfig, WatchRoomError, WatchRoomEvent,
};

use common::{settle, start, start_with, wait_for, MockConnector, IDENTITY};

const URL_A: &str = "https://www.youtube.com/watch?v=aaaaaaaaaaa";
const URL_B: &str = "https://youtu.be/bbbbbbbbbbb";

fn is_status(status: SyncStatus) -> impl FnMut(&WatchRoomEvent) -> bool {
    move |e| *e == WatchRoomEvent::SyncStatusChanged(status)
}

fn is_connected(e: &WatchRoomEvent) -> bool {
    matches!(e, WatchRoomEvent::Connected)
}

fn is_chat(e: &WatchRoomEvent) -> bool {
    matches!(e, WatchRoomEvent::ChatMessage(_))
}

// ════════════════════════════════════════════════════════════════════
// Joining and the sync handshake
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn identity_is_the_first_frame() {
    let connector = MockConnector::new();
    let server = connector.accept();
    let (client, mut events) = start(&connector);

    wait_for(&mut events, is_connected).await;
    settle().await;

    let sent = server.sent();
    assert_eq!(sent[0], IDENTITY);
    assert!(client.is_connected());
    assert_eq!(client.connection_state().await, ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn fresh_join_requests_sync_and_times_out() {
    let connector = MockConnector::new();
    let server = connector.accept();
    let (client, mut events) = start(&connector);

    wait_for(&mut events, is_status(SyncStatus::Syncing)).await;
    let requested_at = Instant::now();
    settle().await;
    assert_eq!(server.sent_of_type("sync").len(), 1);

    wait_for(&mut events, is_status(SyncStatus::Waiting)).await;
    let waited = Instant::now() - requested_at;
    assert!(waited >= Duration::from_millis(4_900), "timed out after {waited:?}");
    assert!(waited < Duration::from_millis(5100), "timed out after {waited:?}");
    assert_eq!(client.sync_status().await, SyncStatus::Waiting);
}

#[tokio::test(start_paused = true)]
async fn sync_response_before_timeout_applies_room_state() {
    let connector = MockConnector::new();
    let server = connector.accept();
    let (client, mut events) = start(&connector);

    wait_for(&mut events, is_status(SyncStatus::Syncing)).await;
    tokio::time::sleep(Duration::from_secs(4)).await;
    server.push_json(json!({
        "type": "sync",
        "videoUrl": URL_B,
        "playbackState": "pause",
        "currentTime": 30.0,
        "queue": [URL_A, URL_B],
        "index": 1,
    }));

    let event = wait_for(&mut events, |e| {
        matches!(e, WatchRoomEvent::PlaybackChanged(_))
    })
    .await;
    let WatchRoomEvent::PlaybackChanged(remote) = event else {
        unreachable!()
    };
    assert_eq!(remote.video_url, URL_B);
    assert_eq!(remote.index, 1);
    wait_for(&mut events, is_status(SyncStatus::Synced)).await;

    // The cancelled timeout must not demote the status later.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(client.sync_status().await, SyncStatus::Synced);
    let state = client.playback().await;
    assert_eq!(state.video_url(), Some(URL_B));
    assert!(!state.is_playing());
}

#[tokio::test(start_paused = true)]
async fn late_sync_response_is_still_applied() {
    let connector = MockConnector::new();
    let server = connector.accept();
    let (client, mut events) = start(&connector);

    wait_for(&mut events, is_status(SyncStatus::Waiting)).await;
    server.push_json(json!({"type": "sync", "videoUrl": URL_A, "playbackState": "play"}));

    wait_for(&mut events, is_status(SyncStatus::Synced)).await;
    assert_eq!(client.playback().await.video_url(), Some(URL_A));
}

#[tokio::test(start_paused = true)]
async fn position_report_before_any_video_keeps_the_sync_request() {
    let connector = MockConnector::new();
    let server = connector.accept();
    let (client, mut events) = start(&connector);

    wait_for(&mut events, is_status(SyncStatus::Syncing)).await;
    assert_ok!(client.report_position(0.0));
    settle().await;
    assert!(server.sent_of_type("video").is_empty(), "sent: {:?}", server.sent());
    assert_eq!(client.sync_status().await, SyncStatus::Syncing);

    server.push_json(json!({
        "type": "sync",
        "videoUrl": URL_B,
        "playbackState": "play",
        "currentTime": 42.0,
        "queue": [URL_B],
        "index": 0,
    }));
    wait_for(&mut events, is_status(SyncStatus::Synced)).await;
    let state = client.playback().await;
    assert_eq!(state.video_url(), Some(URL_B));
    assert!(state.is_playing());
}

#[tokio::test(start_paused = true)]
async fn local_change_supersedes_outstanding_sync_request() {
    let connector = MockConnector::new();
    let server = connector.accept();
    let (client, mut events) = start(&connector);

    wait_for(&mut events, is_status(SyncStatus::Syncing)).await;
    assert_ok!(client.enqueue(URL_A));
    wait_for(&mut events, is_status(SyncStatus::Synced)).await;
    settle().await;
    let videos = server.sent_of_type("video");
    assert_eq!(videos.len(), 1);
    assert_eq!(videos[0]["videoUrl"], URL_A);

    // The answer to the abandoned request arrives after all.
    server.push_json(json!({"type": "sync", "videoUrl": URL_B, "playbackState": "play"}));
    server.push_json(json!({"type": "message", "sender": "bob", "content": "marker", "timestamp": 1}));
    wait_for(&mut events, is_chat).await;
    assert_eq!(client.playback().await.video_url(), Some(URL_A));
}

// ════════════════════════════════════════════════════════════════════
// Playback
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn offline_change_is_flushed_once_on_reconnect() {
    let connector = MockConnector::new();
    connector.refuse();
    let server = connector.accept();
    let (client, mut events) = start(&connector);

    client
        .update_playback(PlaybackState::new(vec![URL_A.into()], Some(0), true, 12.0))
        .unwrap();

    wait_for(&mut events, is_connected).await;
    wait_for(&mut events, is_status(SyncStatus::Synced)).await;
    settle().await;

    let videos = server.sent_of_type("video");
    assert_eq!(videos.len(), 1, "sent: {:?}", server.sent());
    assert_eq!(videos[0]["videoUrl"], URL_A);
    assert_eq!(videos[0]["playbackState"], "play");
    assert!(server.sent_of_type("sync").is_empty());
}

#[tokio::test(start_paused = true)]
async fn own_video_echo_is_ignored() {
    let connector = MockConnector::new();
    let server = connector.accept();
    let (client, mut events) = start(&connector);

    wait_for(&mut events, is_status(SyncStatus::Syncing)).await;
    server.push_json(json!({"type": "sync"}));
    wait_for(&mut events, is_status(SyncStatus::Synced)).await;

    server.push_json(json!({"type": "video", "sender": IDENTITY, "videoUrl": URL_A, "playbackState": "play"}));
    server.push_json(json!({"type": "message", "sender": "bob", "content": "marker", "timestamp": 1}));
    wait_for(&mut events, is_chat).await;
    assert_eq!(client.playback().await.video_url(), None);

    server.push_json(json!({"type": "video", "sender": "bob", "videoUrl": URL_B, "playbackState": "play"}));
    wait_for(&mut events, |e| matches!(e, WatchRoomEvent::PlaybackChanged(_))).await;
    assert_eq!(client.playback().await.video_url(), Some(URL_B));
}

#[tokio::test(start_paused = true)]
async fn small_position_reports_stay_local() {
    let connector = MockConnector::new();
    let server = connector.accept();
    let (client, mut events) = start(&connector);

    wait_for(&mut events, is_status(SyncStatus::Syncing)).await;
    assert_ok!(client.enqueue(URL_A));
    client.report_position(1.0).unwrap();
    client.report_position(1.9).unwrap();
    settle().await;
    assert_eq!(server.sent_of_type("video").len(), 1);

    client.report_position(2.5).unwrap();
    settle().await;
    let videos = server.sent_of_type("video");
    assert_eq!(videos.len(), 2);
    assert_eq!(videos[1]["currentTime"], 2.5);
}

#[tokio::test(start_paused = true)]
async fn invalid_video_url_is_rejected_up_front() {
    let connector = MockConnector::new();
    let _server = connector.accept();
    let (client, _events) = start(&connector);

    let err = assert_err!(client.enqueue("not a video"));
    assert!(matches!(err, WatchRoomError::InvalidVideoUrl(_)));
    assert_err!(client.enqueue("https://youtu.be/short"));
}

// ════════════════════════════════════════════════════════════════════
// Chat, typing and presence
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn redelivered_chat_messages_are_dropped() {
    let connector = MockConnector::new();
    let server = connector.accept();
    let (client, mut events) = start(&connector);
    wait_for(&mut events, is_connected).await;

    let hello = |ts: u64| json!({"type": "message", "sender": "bob", "content": "hello", "timestamp": ts});
    server.push_json(hello(1_000));
    server.push_json(hello(2_000));
    server.push_json(hello(10_000));
    server.push_json(json!({"type": "message", "sender": "carol", "content": "done", "timestamp": 10_500}));

    wait_for(&mut events, |e| {
        matches!(e, WatchRoomEvent::ChatMessage(m) if m.content == "done")
    })
    .await;
    let messages = client.messages().await;
    let stamps: Vec<u64> = messages.iter().map(|m| m.timestamp).collect();
    assert_eq!(stamps, [1_000, 10_000, 10_500]);
}

#[tokio::test(start_paused = true)]
async fn repeated_chat_send_goes_out_once() {
    let connector = MockConnector::new();
    let server = connector.accept();
    let (client, mut events) = start(&connector);
    wait_for(&mut events, is_connected).await;

    client.send_chat("  hi there ").unwrap();
    client.send_chat("hi there").unwrap();
    client.send_chat("   ").unwrap();
    settle().await;
    let sent = server.sent_of_type("message");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["content"], "hi there");

    tokio::time::sleep(Duration::from_secs(3)).await;
    client.send_chat("hi there").unwrap();
    settle().await;
    assert_eq!(server.sent_of_type("message").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn typing_indicator_expires() {
    let connector = MockConnector::new();
    let server = connector.accept();
    let (client, mut events) = start(&connector);
    wait_for(&mut events, is_connected).await;

    server.push_json(json!({"type": "typing", "sender": "bob"}));
    wait_for(&mut events, |e| {
        *e == WatchRoomEvent::TypingChanged(vec!["bob".into()])
    })
    .await;
    let started = Instant::now();

    wait_for(&mut events, |e| *e == WatchRoomEvent::TypingChanged(vec![])).await;
    assert!(Instant::now() - started >= Duration::from_secs(3));
    assert!(client.typing_users().await.is_empty());

    client.notify_typing().unwrap();
    settle().await;
    assert_eq!(server.sent_of_type("typing")[0]["sender"], IDENTITY);
}

#[tokio::test(start_paused = true)]
async fn presence_and_watch_hours_update_roster() {
    let connector = MockConnector::new();
    let server = connector.accept();
    let (client, mut events) = start(&connector);
    wait_for(&mut events, is_connected).await;

    server.push_json(json!({"type": "presence", "users": ["carol", IDENTITY]}));
    wait_for(&mut events, |e| matches!(e, WatchRoomEvent::PresenceChanged(_))).await;

    server.push_json(json!({"type": "watchHours", "sender": "carol", "watchHours": 2.5}));
    server.push_json(json!({"type": "watchHours", "sender": IDENTITY, "watchHours": 99.0}));
    server.push_json(json!({"type": "watchHours", "sender": "carol"}));
    wait_for(&mut events, |e| {
        matches!(e, WatchRoomEvent::WatchHoursChanged { name, .. } if name == "carol")
    })
    .await;
    settle().await;

    let participants = client.participants().await;
    assert_eq!(participants[0].name, "carol");
    assert!((participants[0].watch_hours - 2.5).abs() < f64::EPSILON);
    assert_eq!(participants[1].name, IDENTITY);
    assert!(participants[1].watch_hours.abs() < f64::EPSILON);
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_keep_the_session_alive() {
    let connector = MockConnector::new();
    let server = connector.accept();
    let (client, mut events) = start(&connector);
    wait_for(&mut events, is_connected).await;

    server.push("{not json");
    server.push(r#"{"type":"kick"}"#);
    server.push(r#"{"type":"presence","users":"nope"}"#);
    server.push_json(json!({"type": "message", "sender": "bob", "content": "still here", "timestamp": 5}));

    wait_for(&mut events, is_chat).await;
    assert!(client.is_connected());
    assert_eq!(connector.attempts().len(), 1);
}

// ════════════════════════════════════════════════════════════════════
// Watch time
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn watch_time_resumes_ticks_and_persists() {
    let store = Arc::new(MemoryStore::new());
    store.set("watchHours:alice", "1.5").unwrap();
    let connector = MockConnector::new();
    let server = connector.accept();
    let (client, mut events) =
        start_with(&connector, WatchRoomConfig::new(IDENTITY), Arc::clone(&store));

    wait_for(&mut events, is_connected).await;
    settle().await;
    assert!((client.watch_hours().await - 1.5).abs() < f64::EPSILON);
    assert_eq!(server.sent_of_type("watchHours")[0]["watchHours"], 1.5);

    server.push_json(json!({"type": "video", "sender": "bob", "videoUrl": URL_A, "playbackState": "play"}));
    wait_for(&mut events, |e| {
        matches!(e, WatchRoomEvent::WatchHoursChanged { name, .. } if name == IDENTITY)
    })
    .await;

    let persisted: f64 = store.get("watchHours:alice").unwrap().parse().unwrap();
    assert!(persisted > 1.5);
    assert!((client.watch_hours().await - persisted).abs() < f64::EPSILON);
}

#[tokio::test(start_paused = true)]
async fn watch_time_broadcasts_are_throttled() {
    let connector = MockConnector::new();
    let server = connector.accept();
    let (client, mut events) = start(&connector);
    wait_for(&mut events, is_status(SyncStatus::Syncing)).await;

    assert_ok!(client.enqueue(URL_A));
    tokio::time::sleep(Duration::from_secs(20)).await;
    settle().await;

    // Announced on open, then at most once per 8s while ticking.
    let broadcasts = server.sent_of_type("watchHours").len();
    assert!((2..=4).contains(&broadcasts), "sent {broadcasts} broadcasts");
}

// ════════════════════════════════════════════════════════════════════
// Reconnection
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn abnormal_close_reconnects_after_base_delay() {
    let connector = MockConnector::new();
    let first = connector.accept();
    let second = connector.accept();
    let (client, mut events) = start(&connector);
    wait_for(&mut events, is_connected).await;

    first.close(Some(CloseCode::ABNORMAL));
    let event = wait_for(&mut events, |e| {
        matches!(e, WatchRoomEvent::Disconnected { .. })
    })
    .await;
    assert_eq!(
        event,
        WatchRoomEvent::Disconnected {
            reason: None,
            code: Some(CloseCode::ABNORMAL),
        }
    );
    let scheduled = wait_for(&mut events, |e| {
        matches!(e, WatchRoomEvent::ReconnectScheduled { .. })
    })
    .await;
    assert_eq!(
        scheduled,
        WatchRoomEvent::ReconnectScheduled {
            attempt: 1,
            delay: Duration::from_secs(1),
        }
    );

    wait_for(&mut events, is_connected).await;
    settle().await;
    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 2);
    let gap = attempts[1] - attempts[0];
    assert!(gap >= Duration::from_secs(1) && gap < Duration::from_millis(1100));
    assert_eq!(second.sent()[0], IDENTITY);
    assert!(client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn dropped_connection_without_close_frame_reconnects() {
    let connector = MockConnector::new();
    let first = connector.accept();
    let _second = connector.accept();
    let (_client, mut events) = start(&connector);
    wait_for(&mut events, is_connected).await;

    first.fail("connection reset");
    let event = wait_for(&mut events, |e| {
        matches!(e, WatchRoomEvent::Disconnected { .. })
    })
    .await;
    assert!(matches!(event, WatchRoomEvent::Disconnected { code: None, .. }));
    wait_for(&mut events, is_connected).await;
    assert_eq!(connector.attempts().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn normal_close_from_peer_is_final() {
    let connector = MockConnector::new();
    let server = connector.accept();
    connector.accept();
    let (client, mut events) = start(&connector);
    wait_for(&mut events, is_connected).await;

    server.close(Some(CloseCode::NORMAL));
    wait_for(&mut events, |e| {
        matches!(e, WatchRoomEvent::Disconnected { code: Some(CloseCode::NORMAL), .. })
    })
    .await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts().len(), 1);
    assert_eq!(client.connection_state().await, ConnectionState::ClosedFinal);
    assert_eq!(client.sync_status().await, SyncStatus::Waiting);
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_ten_consecutive_failures() {
    let connector = MockConnector::new();
    let (client, mut events) = start(&connector);

    let mut delays = Vec::new();
    let attempts = loop {
        match wait_for(&mut events, |e| {
            matches!(
                e,
                WatchRoomEvent::ReconnectScheduled { .. } | WatchRoomEvent::ReconnectsExhausted { .. }
            )
        })
        .await
        {
            WatchRoomEvent::ReconnectScheduled { attempt, delay } => {
                assert_eq!(attempt as usize, delays.len() + 1);
                delays.push(delay);
            }
            WatchRoomEvent::ReconnectsExhausted { attempts } => break attempts,
            other => panic!("unexpected event {other:?}"),
        }
    };

    assert_eq!(attempts, 10);
    assert_eq!(delays.len(), 9);
    assert_eq!(delays[0], Duration::from_secs(1));
    assert_eq!(delays[1], Duration::from_millis(1500));
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    assert!(delays.iter().all(|d| *d <= Duration::from_secs(30)));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.attempts().len(), 10);
    assert_eq!(client.connection_state().await, ConnectionState::ClosedFinal);
}

#[tokio::test(start_paused = true)]
async fn restart_after_giving_up() {
    let connector = MockConnector::new();
    let policy = ReconnectPolicy {
        max_attempts: 2,
        ..ReconnectPolicy::default()
    };
    let config = WatchRoomConfig::new(IDENTITY).with_reconnect_policy(policy);
    let (client, mut events) = start_with(&connector, config, Arc::new(MemoryStore::new()));

    wait_for(&mut events, |e| {
        matches!(e, WatchRoomEvent::ReconnectsExhausted { attempts: 2 })
    })
    .await;
    assert_eq!(connector.attempts().len(), 2);

    let server = connector.accept();
    assert_ok!(client.restart());
    wait_for(&mut events, is_connected).await;
    settle().await;
    assert_eq!(connector.attempts().len(), 3);
    assert_eq!(server.sent()[0], IDENTITY);

    // Restarting a live engine does nothing.
    client.restart().unwrap();
    settle().await;
    assert_eq!(connector.attempts().len(), 3);
}

// ════════════════════════════════════════════════════════════════════
// Shutdown
// ════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn shutdown_closes_once_with_normal_code() {
    let connector = MockConnector::new();
    let server = connector.accept();
    let (mut client, mut events) = start(&connector);
    wait_for(&mut events, is_connected).await;

    client.shutdown().await;
    client.shutdown().await;

    assert_eq!(server.close_codes(), [CloseCode::NORMAL]);
    assert!(!client.is_connected());
    assert!(matches!(client.play(), Err(WatchRoomError::EngineStopped)));

    let mut last = None;
    while let Some(event) = events.recv().await {
        last = Some(event);
    }
    assert_eq!(
        last,
        Some(WatchRoomEvent::Disconnected {
            reason: Some("client shut down".into()),
            code: Some(CloseCode::NORMAL),
        })
    );

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_while_reconnecting_cancels_the_retry() {
    let connector = MockConnector::new();
    let (mut client, mut events) = start(&connector);
    wait_for(&mut events, |e| {
        matches!(e, WatchRoomEvent::ReconnectScheduled { .. })
    })
    .await;

    client.shutdown().await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts().len(), 1);
}
