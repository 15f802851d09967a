//! Atomic counters for monitoring the listener.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the listener and its watchers.
#[derive(Debug, Default)]
pub struct ListenerMetrics {
    /// Notifications routed to at least one watcher.
    pub notifications_routed: AtomicU64,
    /// Notifications that failed to decode.
    pub parse_failures: AtomicU64,
    /// Events successfully staged to a watcher buffer.
    pub events_staged: AtomicU64,
    /// Watchers ejected because their staging buffer overflowed.
    pub watchers_aborted: AtomicU64,
    /// Fatal resets (connection loss, registry errors, close).
    pub resets: AtomicU64,
    /// Sideband lookups issued for stored payloads.
    pub sideband_fetches: AtomicU64,
    /// Sideband lookups that found no row or failed, surfaced to the
    /// watcher as a latency error.
    pub sideband_misses: AtomicU64,
}

impl ListenerMetrics {
    /// Returns notifications routed to at least one watcher.
    #[must_use]
    pub fn notifications_routed(&self) -> u64 {
        self.notifications_routed.load(Ordering::Relaxed)
    }

    /// Returns notifications that failed to decode.
    #[must_use]
    pub fn parse_failures(&self) -> u64 {
        self.parse_failures.load(Ordering::Relaxed)
    }

    /// Returns events successfully staged to a watcher buffer.
    #[must_use]
    pub fn events_staged(&self) -> u64 {
        self.events_staged.load(Ordering::Relaxed)
    }

    /// Returns watchers ejected due to staging overflow.
    #[must_use]
    pub fn watchers_aborted(&self) -> u64 {
        self.watchers_aborted.load(Ordering::Relaxed)
    }

    /// Returns fatal reset count.
    #[must_use]
    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    /// Returns sideband lookups issued.
    #[must_use]
    pub fn sideband_fetches(&self) -> u64 {
        self.sideband_fetches.load(Ordering::Relaxed)
    }

    /// Returns sideband lookups that missed or failed.
    #[must_use]
    pub fn sideband_misses(&self) -> u64 {
        self.sideband_misses.load(Ordering::Relaxed)
    }
}
