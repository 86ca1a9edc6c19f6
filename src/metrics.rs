//! Metrics registry for the synchronization engine
//!
//! Counters only, monotonic, reset on process start. Thread-safe but
//! lock-minimal: all counters use atomic increments with Relaxed
//! ordering (eventual consistency is fine for metrics).

use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics registry containing all operational counters
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Physical channels opened
    channels_opened: AtomicU64,
    /// Physical channels closed (refcount reached zero)
    channels_closed: AtomicU64,
    /// Events fanned out to subscribers
    events_dispatched: AtomicU64,
    /// Events dropped by the local predicate re-check
    events_filtered: AtomicU64,
    /// Merges dropped because an existing entry was newer
    merges_discarded_stale: AtomicU64,
    /// Records skipped because they carried no usable id
    records_skipped_no_id: AtomicU64,
    /// Fetch requests started
    fetches_started: AtomicU64,
    /// Fetch results dropped by per-reason supersession
    fetches_superseded: AtomicU64,
    /// Fetch requests that resolved with an error
    fetches_failed: AtomicU64,
    /// Poll ticks delivered
    polls_ticked: AtomicU64,
    /// Poll ticks skipped because a poll fetch was already in flight
    polls_skipped: AtomicU64,
    /// Successful transport recoveries after a drop
    reconnects: AtomicU64,
    /// Warm starts served from the snapshot cache
    cache_hits: AtomicU64,
    /// Cold starts (no usable cached snapshot)
    cache_misses: AtomicU64,
}

impl EngineMetrics {
    /// Create a new metrics registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    // Channel metrics

    /// Increment channels opened
    pub fn increment_channels_opened(&self) {
        self.channels_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment channels closed
    pub fn increment_channels_closed(&self) {
        self.channels_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment events dispatched
    pub fn increment_events_dispatched(&self) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment events filtered
    pub fn increment_events_filtered(&self) {
        self.events_filtered.fetch_add(1, Ordering::Relaxed);
    }

    // Reconciliation metrics

    /// Increment stale merges discarded
    pub fn increment_merges_discarded_stale(&self) {
        self.merges_discarded_stale.fetch_add(1, Ordering::Relaxed);
    }

    /// Add stale merges discarded (batch path)
    pub fn add_merges_discarded_stale(&self, count: u64) {
        self.merges_discarded_stale
            .fetch_add(count, Ordering::Relaxed);
    }

    /// Add records skipped for missing ids
    pub fn add_records_skipped_no_id(&self, count: u64) {
        self.records_skipped_no_id
            .fetch_add(count, Ordering::Relaxed);
    }

    // Fetch metrics

    /// Increment fetches started
    pub fn increment_fetches_started(&self) {
        self.fetches_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment fetches superseded
    pub fn increment_fetches_superseded(&self) {
        self.fetches_superseded.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment fetches failed
    pub fn increment_fetches_failed(&self) {
        self.fetches_failed.fetch_add(1, Ordering::Relaxed);
    }

    // Poller metrics

    /// Increment poll ticks
    pub fn increment_polls_ticked(&self) {
        self.polls_ticked.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment skipped poll ticks
    pub fn increment_polls_skipped(&self) {
        self.polls_skipped.fetch_add(1, Ordering::Relaxed);
    }

    // Transport metrics

    /// Increment reconnects
    pub fn increment_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    // Snapshot cache metrics

    /// Increment cache hits
    pub fn increment_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment cache misses
    pub fn increment_cache_misses(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            channels_opened: self.channels_opened.load(Ordering::Relaxed),
            channels_closed: self.channels_closed.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            events_filtered: self.events_filtered.load(Ordering::Relaxed),
            merges_discarded_stale: self.merges_discarded_stale.load(Ordering::Relaxed),
            records_skipped_no_id: self.records_skipped_no_id.load(Ordering::Relaxed),
            fetches_started: self.fetches_started.load(Ordering::Relaxed),
            fetches_superseded: self.fetches_superseded.load(Ordering::Relaxed),
            fetches_failed: self.fetches_failed.load(Ordering::Relaxed),
            polls_ticked: self.polls_ticked.load(Ordering::Relaxed),
            polls_skipped: self.polls_skipped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub channels_opened: u64,
    pub channels_closed: u64,
    pub events_dispatched: u64,
    pub events_filtered: u64,
    pub merges_discarded_stale: u64,
    pub records_skipped_no_id: u64,
    pub fetches_started: u64,
    pub fetches_superseded: u64,
    pub fetches_failed: u64,
    pub polls_ticked: u64,
    pub polls_skipped: u64,
    pub reconnects: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}
