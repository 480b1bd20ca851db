//! Spillover statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Counters shared across the store. The global `dirty` counter tracks
/// mutations since the last successful flush (not distinct keys — the
/// dirty-key sets track those).
#[derive(Debug, Default)]
pub struct Stats {
    flush_success: AtomicU64,
    flush_failure: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    lastsave: AtomicU64,
    dirty: AtomicU64,
    dirty_before_bgsave: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_mutation(&self) {
        self.dirty.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dirty(&self) -> u64 {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Snapshots the dirty counter at flush start so a successful flush can
    /// settle exactly the mutations it captured.
    pub fn snapshot_dirty_before_bgsave(&self) {
        self.dirty_before_bgsave
            .store(self.dirty.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    pub fn record_flush_success(&self) {
        let before = self.dirty_before_bgsave.load(Ordering::SeqCst);
        self.dirty.fetch_sub(before, Ordering::SeqCst);
        self.flush_success.fetch_add(1, Ordering::SeqCst);
        self.lastsave.store(unix_now(), Ordering::SeqCst);
    }

    pub fn record_flush_failure(&self) {
        self.flush_failure.fetch_add(1, Ordering::SeqCst);
    }

    /// Zeroes the hit/miss counters (CLEARSTATS).
    pub fn clear_cache_stats(&self) {
        self.cache_hits.store(0, Ordering::SeqCst);
        self.cache_misses.store(0, Ordering::SeqCst);
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::SeqCst)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::SeqCst)
    }

    pub fn flush_successes(&self) -> u64 {
        self.flush_success.load(Ordering::SeqCst)
    }

    pub fn flush_failures(&self) -> u64 {
        self.flush_failure.load(Ordering::SeqCst)
    }

    pub fn lastsave(&self) -> u64 {
        self.lastsave.load(Ordering::SeqCst)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Point-in-time metrics snapshot for monitoring.
#[derive(Debug, Clone)]
pub struct Metrics {
    pub flush_successes: u64,
    pub flush_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub lastsave: u64,
    pub dirty_keys: usize,
    pub flushing_keys: usize,
    pub preload_in_progress: bool,
    pub preload_complete: bool,
}

/// Logs a metrics snapshot.
pub fn log_metrics(metrics: &Metrics) {
    tracing::info!(
        flush_successes = metrics.flush_successes,
        flush_failures = metrics.flush_failures,
        cache_hits = metrics.cache_hits,
        cache_misses = metrics.cache_misses,
        lastsave = metrics.lastsave,
        dirty_keys = metrics.dirty_keys,
        flushing_keys = metrics.flushing_keys,
        preload_in_progress = metrics.preload_in_progress,
        preload_complete = metrics.preload_complete,
        "freezer metrics"
    );
}
