//! Local watch-time accounting, its persistence, and identity resolution.
//!
//! The accumulator ticks only while playback is active. Every tick is
//! persisted through the host's [`KeyValueStore`]. Peers are told about the
//! value through a throttled `watchHours` broadcast: the first opportunity
//! sends immediately, later changes go out at most once per broadcast
//! interval, and a change made inside the window is sent when it closes.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;
use crate::protocol::ClientFrame;

/// Store key holding the persisted display name.
pub const USERNAME_KEY: &str = "chatUsername";

/// Default store key for the watch-time counter of `identity`.
pub fn watch_hours_key(identity: &str) -> String {
    format!("watchHours:{identity}")
}

/// Host-provided string key-value persistence.
///
/// Calls are synchronous and expected to be cheap (local storage, a small
/// file, an in-memory map). Failures are logged by the engine and never stop
/// it.
pub trait KeyValueStore: Send + Sync + 'static {
    /// Read `key`, or `None` if it was never written.
    fn get(&self, key: &str) -> Option<String>;

    /// Write `value` under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::WatchRoomError::Store`] if the value could not
    /// be persisted.
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// A [`KeyValueStore`] that lives in memory and forgets everything on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

/// Pick the local display name.
///
/// A non-blank `preferred` name (already resolved by the host, for example
/// from an OAuth exchange) wins and is persisted. Otherwise the stored name is
/// reused, or a fresh `User<n>` with `n` in `0..10000` is generated and
/// persisted.
pub fn resolve_identity(store: &dyn KeyValueStore, preferred: Option<&str>) -> String {
    let preferred = preferred.map(str::trim).filter(|name| !name.is_empty());
    if let Some(name) = preferred {
        persist(store, USERNAME_KEY, name);
        return name.to_owned();
    }
    if let Some(stored) = store.get(USERNAME_KEY).filter(|name| !name.trim().is_empty()) {
        return stored;
    }
    let generated = format!("User{}", uuid::Uuid::new_v4().as_u128() % 10_000);
    debug!(name = %generated, "generated fallback username");
    persist(store, USERNAME_KEY, &generated);
    generated
}

fn persist(store: &dyn KeyValueStore, key: &str, value: &str) {
    if let Err(e) = store.set(key, value) {
        warn!(key, error = %e, "failed to persist value");
    }
}

/// Accumulator tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTimeSettings {
    /// Interval between increments while playing.
    pub tick: Duration,
    /// Minimum spacing between two `watchHours` broadcasts.
    pub broadcast_interval: Duration,
}

impl Default for WatchTimeSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            broadcast_interval: Duration::from_secs(8),
        }
    }
}

impl WatchTimeSettings {
    /// Replace a zero tick with the default one.
    fn sanitized(mut self) -> Self {
        if self.tick.is_zero() {
            let tick = Self::default().tick;
            warn!(?tick, "zero watch-time tick, using the default");
            self.tick = tick;
        }
        self
    }
}

/// Cumulative local watch time, in hours.
#[derive(Debug, Clone)]
pub struct WatchTimeAccumulator {
    settings: WatchTimeSettings,
    store_key: String,
    hours: f64,
    /// Next tick, present only while playing.
    next_tick: Option<Instant>,
    last_broadcast: Option<Instant>,
    /// The value changed since it was last broadcast.
    dirty: bool,
}

impl WatchTimeAccumulator {
    /// Resume from the value persisted under `store_key`.
    pub fn load(
        store: &dyn KeyValueStore,
        store_key: impl Into<String>,
        settings: WatchTimeSettings,
    ) -> Self {
        let store_key = store_key.into();
        let hours = store
            .get(&store_key)
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .filter(|h| h.is_finite() && *h >= 0.0)
            .unwrap_or(0.0);
        debug!(key = %store_key, hours, "loaded watch time");
        Self {
            settings: settings.sanitized(),
            store_key,
            hours,
            next_tick: None,
            last_broadcast: None,
            dirty: true,
        }
    }

    pub fn hours(&self) -> f64 {
        self.hours
    }

    pub fn is_running(&self) -> bool {
        self.next_tick.is_some()
    }

    /// Start or stop ticking to follow the play flag.
    pub fn set_playing(&mut self, playing: bool, now: Instant) {
        match (playing, self.next_tick) {
            (true, None) => self.next_tick = Some(now + self.settings.tick),
            (false, Some(_)) => self.next_tick = None,
            _ => {}
        }
    }

    /// Apply every tick due by `now`, persisting the result.
    ///
    /// Returns `true` if the value changed.
    pub fn poll_tick(&mut self, now: Instant, store: &dyn KeyValueStore) -> bool {
        let Some(mut due) = self.next_tick else {
            return false;
        };
        if due > now {
            return false;
        }
        let tick_nanos = self.settings.tick.as_nanos().max(1);
        let ticks = now.saturating_duration_since(due).as_nanos() / tick_nanos + 1;
        let advance = Duration::from_nanos(u64::try_from(ticks * tick_nanos).unwrap_or(u64::MAX));
        self.hours += advance.as_secs_f64() / 3600.0;
        due += advance;
        self.next_tick = Some(due);
        self.dirty = true;
        persist(store, &self.store_key, &self.hours.to_string());
        true
    }

    /// Broadcast frame for the current value, if one may be sent now.
    pub fn poll_broadcast(&mut self, now: Instant, connected: bool) -> Option<ClientFrame> {
        if !connected || !self.dirty {
            return None;
        }
        let open = self
            .last_broadcast
            .is_none_or(|last| now.saturating_duration_since(last) >= self.settings.broadcast_interval);
        if !open {
            return None;
        }
        self.last_broadcast = Some(now);
        self.dirty = false;
        Some(ClientFrame::WatchHours {
            watch_hours: self.hours,
        })
    }

    /// A new connection opened: announce the value to the room again.
    pub fn on_open(&mut self) {
        self.dirty = true;
    }

    /// Earliest instant at which [`poll_tick`](Self::poll_tick) or
    /// [`poll_broadcast`](Self::poll_broadcast) has work to do.
    pub fn next_deadline(&self, connected: bool) -> Option<Instant> {
        let trailing = if connected && self.dirty {
            self.last_broadcast
                .map(|last| last + self.settings.broadcast_interval)
        } else {
            None
        };
        match (self.next_tick, trailing) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}
