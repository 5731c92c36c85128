//! Warm-up bookkeeping: when each service was last (re)started.
//!
//! The table is consulted by health classification only. A missing or stale
//! entry makes classification stricter, never more lenient than the window.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tracing::debug;

use crate::descriptor::ServiceId;

/// Source of monotonic time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// [`Clock`] backed by [`Instant::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Keyed store of last (re)start instants.
pub trait WarmupStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Instant>;
    /// Records `at` for `key`; an older instant never replaces a newer one.
    fn set(&self, key: &str, at: Instant);
}

/// Process-wide in-memory [`WarmupStore`].
#[derive(Debug, Default)]
pub struct InMemoryWarmupStore {
    entries: Mutex<HashMap<String, Instant>>,
}

impl InMemoryWarmupStore {
    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl WarmupStore for InMemoryWarmupStore {
    fn get(&self, key: &str) -> Option<Instant> {
        self.entries().get(key).copied()
    }

    fn set(&self, key: &str, at: Instant) {
        let mut entries = self.entries();
        let slot = entries.entry(key.to_string()).or_insert(at);
        if at > *slot {
            *slot = at;
        }
    }
}

/// Answers "is this service still inside its grace window?".
#[derive(Clone)]
pub struct WarmupTracker {
    clock: Arc<dyn Clock>,
    store: Arc<dyn WarmupStore>,
    window: Duration,
}

impl WarmupTracker {
    pub fn new(clock: Arc<dyn Clock>, store: Arc<dyn WarmupStore>, window: Duration) -> Self {
        Self {
            clock,
            store,
            window,
        }
    }

    /// Records a (re)start of `id` at the current time.
    pub fn mark_started(&self, id: ServiceId) {
        debug!("Warm-up window opened for {}", id.label());
        self.store.set(id.label(), self.clock.now());
    }

    /// Time since the last recorded (re)start of `id`.
    pub fn elapsed(&self, id: ServiceId) -> Option<Duration> {
        self.store
            .get(id.label())
            .map(|started| self.clock.now().saturating_duration_since(started))
    }

    /// Returns `true` while `id` is inside its grace window.
    pub fn is_warming_up(&self, id: ServiceId) -> bool {
        self.elapsed(id).is_some_and(|elapsed| elapsed < self.window)
    }
}
