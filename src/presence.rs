//! Who is online, and how long each participant has watched.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A room participant as seen by this client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    /// Display name; unique within the room.
    pub name: String,
    /// Cumulative watch time in hours.
    pub watch_hours: f64,
}

/// Online set plus per-participant watch time.
///
/// Order follows the latest presence snapshot; the first entry is the room
/// host. A participant's watch time, once known, is never reset: it survives
/// every later snapshot that lists them, and is remembered for the rest of the
/// session when they drop out so that it is restored if they return.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    local_name: String,
    participants: Vec<Participant>,
    /// Last known watch time of participants not currently online.
    offline: HashMap<String, f64>,
}

impl PresenceTracker {
    /// Start with only the local participant online.
    pub fn new(local_name: impl Into<String>, local_watch_hours: f64) -> Self {
        let local_name = local_name.into();
        Self {
            participants: vec![Participant {
                name: local_name.clone(),
                watch_hours: sanitize(local_watch_hours).unwrap_or(0.0),
            }],
            local_name,
            offline: HashMap::new(),
        }
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    /// The participant listed first in the latest snapshot.
    pub fn host(&self) -> Option<&Participant> {
        self.participants.first()
    }

    pub fn get(&self, name: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.name == name)
    }

    /// Replace the online set with exactly `names` (deduplicated, first
    /// occurrence wins).
    ///
    /// Known participants keep their watch time. A newcomer starts at
    /// `local_watch_hours` if they are the local user, else from the value
    /// remembered from earlier in the session, else zero.
    /// Participants missing from `names` are dropped from the online set.
    pub fn apply_snapshot<I, S>(&mut self, names: I, local_watch_hours: f64)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut previous = std::mem::take(&mut self.participants);
        for name in names {
            let name = name.into();
            if self.participants.iter().any(|p| p.name == name) {
                continue;
            }
            let participant = match previous.iter().position(|p| p.name == name) {
                Some(at) => previous.swap_remove(at),
                None => {
                    let remembered = self.offline.remove(&name);
                    let watch_hours = if name == self.local_name {
                        sanitize(local_watch_hours).unwrap_or(0.0)
                    } else {
                        remembered.unwrap_or(0.0)
                    };
                    Participant { name, watch_hours }
                }
            };
            self.participants.push(participant);
        }
        for gone in previous {
            self.offline.insert(gone.name, gone.watch_hours);
        }
        debug!(online = self.participants.len(), "presence snapshot applied");
    }

    /// Overwrite a known participant's watch time.
    ///
    /// Returns `true` if an online participant was updated. Negative or
    /// non-finite values are ignored. A value for a sender who is not online
    /// is kept aside and applied when a later snapshot introduces them.
    pub fn apply_watch_hours(&mut self, sender: &str, watch_hours: f64) -> bool {
        let Some(watch_hours) = sanitize(watch_hours) else {
            debug!(sender, watch_hours, "ignoring invalid watch hours");
            return false;
        };
        match self.participants.iter_mut().find(|p| p.name == sender) {
            Some(participant) => {
                participant.watch_hours = watch_hours;
                true
            }
            None => {
                debug!(sender, "watch hours for participant not yet in presence");
                self.offline.insert(sender.to_owned(), watch_hours);
                false
            }
        }
    }

    /// Track the local accumulator; adds the local participant if absent.
    pub fn set_local_watch_hours(&mut self, watch_hours: f64) {
        let Some(watch_hours) = sanitize(watch_hours) else {
            return;
        };
        match self
            .participants
            .iter_mut()
            .find(|p| p.name == self.local_name)
        {
            Some(participant) => participant.watch_hours = watch_hours,
            None => self.participants.push(Participant {
                name: self.local_name.clone(),
                watch_hours,
            }),
        }
    }
}

fn sanitize(watch_hours: f64) -> Option<f64> {
    (watch_hours.is_finite() && watch_hours >= 0.0).then_some(watch_hours)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn names(tracker: &PresenceTracker) -> Vec<&str> {
        tracker
            .participants()
            .iter()
            .map(|p| p.name.as_str())
            .collect()
    }

    #[test]
    fn local_participant_is_present_on_join() {
        let tracker = PresenceTracker::new("alice", 1.25);
        assert_eq!(names(&tracker), ["alice"]);
        assert_eq!(tracker.get("alice").unwrap().watch_hours, 1.25);
    }

    #[test]
    fn snapshot_is_a_full_replace_with_dedup() {
        let mut tracker = PresenceTracker::new("alice", 0.0);
        tracker.apply_snapshot(["bob", "alice", "bob", "carol"], 0.0);
        assert_eq!(names(&tracker), ["bob", "alice", "carol"]);

        tracker.apply_snapshot(["carol"], 0.0);
        assert_eq!(names(&tracker), ["carol"]);
        assert_eq!(tracker.host().unwrap().name, "carol");
    }

    #[test]
    fn snapshot_preserves_known_watch_time() {
        let mut tracker = PresenceTracker::new("alice", 0.0);
        tracker.apply_snapshot(["alice", "bob"], 0.0);
        assert!(tracker.apply_watch_hours("bob", 3.5));

        for _ in 0..5 {
            tracker.apply_snapshot(["bob", "alice", "dave"], 0.0);
            assert_eq!(tracker.get("bob").unwrap().watch_hours, 3.5);
        }
        assert_eq!(tracker.get("dave").unwrap().watch_hours, 0.0);
    }

    #[test]
    fn local_newcomer_starts_from_local_value() {
        let mut tracker = PresenceTracker::new("alice", 0.0);
        tracker.apply_snapshot(["bob"], 0.0);
        assert!(tracker.get("alice").is_none());

        tracker.apply_snapshot(["bob", "alice"], 2.0);
        assert_eq!(tracker.get("alice").unwrap().watch_hours, 2.0);
    }

    #[test]
    fn watch_hours_for_unknown_sender_waits_for_presence() {
        let mut tracker = PresenceTracker::new("alice", 0.0);
        assert!(!tracker.apply_watch_hours("ghost", 4.0));
        assert!(tracker.get("ghost").is_none());

        tracker.apply_snapshot(["alice", "ghost"], 0.0);
        assert_eq!(tracker.get("ghost").unwrap().watch_hours, 4.0);
    }

    #[test]
    fn returning_participant_keeps_watch_time() {
        let mut tracker = PresenceTracker::new("alice", 0.0);
        tracker.apply_snapshot(["alice", "bob"], 0.0);
        tracker.apply_watch_hours("bob", 2.5);

        tracker.apply_snapshot(["alice"], 0.0);
        assert!(tracker.get("bob").is_none());

        tracker.apply_snapshot(["alice", "bob"], 0.0);
        assert_eq!(tracker.get("bob").unwrap().watch_hours, 2.5);
    }

    #[test]
    fn invalid_watch_hours_are_rejected() {
        let mut tracker = PresenceTracker::new("alice", 0.0);
        tracker.apply_snapshot(["alice", "bob"], 0.0);
        tracker.apply_watch_hours("bob", 1.0);
        assert!(!tracker.apply_watch_hours("bob", -1.0));
        assert!(!tracker.apply_watch_hours("bob", f64::NAN));
        assert_eq!(tracker.get("bob").unwrap().watch_hours, 1.0);
    }

    #[test]
    fn local_value_tracks_accumulator() {
        let mut tracker = PresenceTracker::new("alice", 0.0);
        tracker.apply_snapshot(["bob"], 0.0);
        tracker.set_local_watch_hours(0.5);
        assert_eq!(names(&tracker), ["bob", "alice"]);
        tracker.set_local_watch_hours(0.75);
        assert_eq!(tracker.participants()[1].watch_hours, 0.75);
    }
}
