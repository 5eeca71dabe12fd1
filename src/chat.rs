//! Ordered, deduplicated chat history and typing indicators.
//!
//! The relay may deliver the same message twice (for example when a client
//! resends across a reconnect). A message is treated as a redelivery when one
//! of the last [`ChatSettings::lookback`] stored messages has the same sender
//! and content and a timestamp within [`ChatSettings::duplicate_window`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::protocol::ClientFrame;

/// Chat tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSettings {
    /// Two messages closer than this are candidates for deduplication.
    pub duplicate_window: Duration,
    /// How many of the most recent messages the duplicate check inspects.
    pub lookback: usize,
    /// How long a typing indicator lives without a refresh.
    pub typing_ttl: Duration,
    /// Identical outgoing content is refused for this long after a send.
    pub resubmit_guard: Duration,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            duplicate_window: Duration::from_secs(3),
            lookback: 10,
            typing_ttl: Duration::from_secs(3),
            resubmit_guard: Duration::from_secs(3),
        }
    }
}

/// A stored chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Session-unique id assigned on receipt.
    pub id: Uuid,
    pub sender: String,
    pub content: String,
    /// Sender wall clock in milliseconds (or local receipt time when the
    /// relay did not forward one). Advisory only; not a total order.
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
struct Typist {
    name: String,
    expires_at: Instant,
}

#[derive(Debug, Clone)]
struct LastSend {
    content: String,
    sent_at: Instant,
}

/// Chat history for one session. Messages are never evicted.
#[derive(Debug, Clone, Default)]
pub struct ChatLog {
    settings: ChatSettings,
    messages: Vec<ChatMessage>,
    typing: Vec<Typist>,
    last_send: Option<LastSend>,
}

impl ChatLog {
    pub fn new(settings: ChatSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Store an inbound message unless it is a redelivery.
    ///
    /// Returns the stored message, or `None` if it was suppressed.
    pub fn ingest(
        &mut self,
        sender: impl Into<String>,
        content: impl Into<String>,
        timestamp: u64,
    ) -> Option<&ChatMessage> {
        let sender = sender.into();
        let content = content.into();
        let window = duration_millis(self.settings.duplicate_window);

        let duplicate = self
            .messages
            .iter()
            .rev()
            .take(self.settings.lookback)
            .any(|m| {
                m.sender == sender
                    && m.content == content
                    && m.timestamp.abs_diff(timestamp) < window
            });
        if duplicate {
            debug!(sender = %sender, "skipping duplicate chat message");
            return None;
        }

        self.messages.push(ChatMessage {
            id: Uuid::new_v4(),
            sender,
            content,
            timestamp,
        });
        self.messages.last()
    }

    /// Record a typing frame from `sender`, (re)starting its expiry.
    ///
    /// Returns `true` if `sender` was not already typing.
    pub fn note_typing(&mut self, sender: &str, now: Instant) -> bool {
        let expires_at = now + self.settings.typing_ttl;
        match self.typing.iter_mut().find(|t| t.name == sender) {
            Some(typist) => {
                typist.expires_at = typist.expires_at.max(expires_at);
                false
            }
            None => {
                self.typing.push(Typist {
                    name: sender.to_owned(),
                    expires_at,
                });
                true
            }
        }
    }

    /// Drop indicators whose expiry has passed. Returns `true` if any were removed.
    pub fn expire_typing(&mut self, now: Instant) -> bool {
        let before = self.typing.len();
        self.typing.retain(|t| t.expires_at > now);
        self.typing.len() != before
    }

    /// Earliest pending typing expiry.
    pub fn next_typing_expiry(&self) -> Option<Instant> {
        self.typing.iter().map(|t| t.expires_at).min()
    }

    /// Names currently typing, in the order they started.
    pub fn typing_users(&self) -> Vec<String> {
        self.typing.iter().map(|t| t.name.clone()).collect()
    }

    /// Build the frame for an outgoing message.
    ///
    /// Returns `None` for blank content, and for content identical to a send
    /// made less than [`ChatSettings::resubmit_guard`] ago. Content is trimmed.
    /// No local echo: the relay delivers the message back like any other.
    pub fn prepare_outgoing(
        &mut self,
        content: &str,
        now: Instant,
        timestamp: u64,
    ) -> Option<ClientFrame> {
        let content = content.trim();
        if content.is_empty() {
            debug!("chat input is empty, not sending");
            return None;
        }
        if let Some(last) = &self.last_send {
            if last.content == content
                && now.saturating_duration_since(last.sent_at) < self.settings.resubmit_guard
            {
                debug!("preventing duplicate chat send");
                return None;
            }
        }
        self.last_send = Some(LastSend {
            content: content.to_owned(),
            sent_at: now,
        });
        Some(ClientFrame::Message {
            content: content.to_owned(),
            timestamp,
        })
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn log() -> ChatLog {
        ChatLog::new(ChatSettings::default())
    }

    #[test]
    fn redelivery_within_window_is_suppressed() {
        let mut chat = log();
        assert!(chat.ingest("bob", "hello", 10_000).is_some());
        assert!(chat.ingest("bob", "hello", 12_999).is_none());
        assert_eq!(chat.messages().len(), 1);
    }

    #[test]
    fn same_content_outside_window_is_kept() {
        let mut chat = log();
        chat.ingest("bob", "hello", 10_000);
        chat.ingest("bob", "hello", 13_000);
        chat.ingest("bob", "hello", 6_000);
        assert_eq!(chat.messages().len(), 3);
    }

    #[test]
    fn different_sender_or_content_is_kept() {
        let mut chat = log();
        chat.ingest("bob", "hello", 10_000);
        chat.ingest("carol", "hello", 10_000);
        chat.ingest("bob", "hello!", 10_000);
        assert_eq!(chat.messages().len(), 3);
    }

    #[test]
    fn duplicate_beyond_lookback_is_kept() {
        let mut chat = log();
        chat.ingest("bob", "hello", 10_000);
        for i in 0..10 {
            chat.ingest("carol", format!("filler {i}"), 10_000);
        }
        assert!(chat.ingest("bob", "hello", 10_500).is_some());
        assert_eq!(chat.messages().len(), 12);
    }

    #[test]
    fn duplicate_at_edge_of_lookback_is_suppressed() {
        let mut chat = log();
        chat.ingest("bob", "hello", 10_000);
        for i in 0..9 {
            chat.ingest("carol", format!("filler {i}"), 10_000);
        }
        assert!(chat.ingest("bob", "hello", 10_500).is_none());
    }

    #[test]
    fn ids_are_unique_even_for_identical_content() {
        let mut chat = log();
        let first = chat.ingest("bob", "hi", 0).unwrap().id;
        let second = chat.ingest("bob", "hi", 60_000).unwrap().id;
        assert_ne!(first, second);
    }

    #[test]
    fn typing_expires_after_ttl() {
        let mut chat = log();
        let start = Instant::now();
        assert!(chat.note_typing("bob", start));
        assert_eq!(chat.typing_users(), ["bob"]);
        assert_eq!(
            chat.next_typing_expiry(),
            Some(start + Duration::from_secs(3))
        );

        assert!(!chat.expire_typing(start + Duration::from_millis(2_999)));
        assert!(chat.expire_typing(start + Duration::from_secs(3)));
        assert!(chat.typing_users().is_empty());
        assert!(chat.next_typing_expiry().is_none());
    }

    #[test]
    fn typing_refresh_extends_expiry() {
        let mut chat = log();
        let start = Instant::now();
        chat.note_typing("bob", start);
        assert!(!chat.note_typing("bob", start + Duration::from_secs(2)));

        assert!(!chat.expire_typing(start + Duration::from_secs(3)));
        assert_eq!(chat.typing_users(), ["bob"]);
        assert!(chat.expire_typing(start + Duration::from_secs(5)));
    }

    #[test]
    fn blank_outgoing_is_refused() {
        let mut chat = log();
        let now = Instant::now();
        assert!(chat.prepare_outgoing("", now, 0).is_none());
        assert!(chat.prepare_outgoing("  \t\n", now, 0).is_none());
    }

    #[test]
    fn rapid_resubmit_is_refused() {
        let mut chat = log();
        let now = Instant::now();
        let frame = chat.prepare_outgoing(" hello ", now, 42).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Message {
                content: "hello".into(),
                timestamp: 42
            }
        );
        assert!(chat
            .prepare_outgoing("hello", now + Duration::from_secs(1), 43)
            .is_none());
        assert!(chat
            .prepare_outgoing("other", now + Duration::from_secs(1), 43)
            .is_some());
    }

    #[test]
    fn resubmit_is_allowed_after_guard() {
        let mut chat = log();
        let now = Instant::now();
        chat.prepare_outgoing("hello", now, 0).unwrap();
        assert!(chat
            .prepare_outgoing("hello", now + Duration::from_secs(3), 0)
            .is_some());
    }
}
