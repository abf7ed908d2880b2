//! Global atomic counters for the coverage audit.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a CLI run).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters; no allocations, no locking.
pub struct Metrics {
    queries_issued: AtomicU64,
    batches_fetched: AtomicU64,
    records_routed: AtomicU64,
    runs_requeued: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            queries_issued: AtomicU64::new(0),
            batches_fetched: AtomicU64::new(0),
            records_routed: AtomicU64::new(0),
            runs_requeued: AtomicU64::new(0),
        }
    }

    /// Increment the queries-issued counter by one.
    pub fn inc_queries(&self) {
        self.queries_issued.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "queries_issued", "counter incremented");
    }

    /// Increment the batches-fetched counter by one.
    pub fn inc_batches(&self) {
        self.batches_fetched.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "batches_fetched", "counter incremented");
    }

    /// Add `n` coverage records routed to at least one variant.
    pub fn add_records_routed(&self, n: u64) {
        self.records_routed.fetch_add(n, Ordering::Relaxed);
    }

    /// Add `n` run keys handed to the work queue.
    pub fn add_runs_requeued(&self, n: u64) {
        self.runs_requeued.fetch_add(n, Ordering::Relaxed);
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            queries_issued = self.queries_issued(),
            batches_fetched = self.batches_fetched(),
            records_routed = self.records_routed(),
            runs_requeued = self.runs_requeued(),
        );
    }

    pub fn queries_issued(&self) -> u64 {
        self.queries_issued.load(Ordering::Relaxed)
    }

    pub fn batches_fetched(&self) -> u64 {
        self.batches_fetched.load(Ordering::Relaxed)
    }

    pub fn records_routed(&self) -> u64 {
        self.records_routed.load(Ordering::Relaxed)
    }

    pub fn runs_requeued(&self) -> u64 {
        self.runs_requeued.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.queries_issued.store(0, Ordering::Relaxed);
        self.batches_fetched.store(0, Ordering::Relaxed);
        self.records_routed.store(0, Ordering::Relaxed);
        self.runs_requeued.store(0, Ordering::Relaxed);
    }
}
