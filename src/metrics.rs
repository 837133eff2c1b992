use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters tracking pipeline and engine activity.
///
/// Enqueue/dequeue cancellation is invisible to callers except through
/// these counters.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    uows_submitted: AtomicU64,
    uows_canceled: AtomicU64,
    uows_flushed: AtomicU64,
    enqueues_canceled: AtomicU64,
    records_elided: AtomicU64,
    flush_batches: AtomicU64,
    flush_failures: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_rolled_back: AtomicU64,
    pages_reclaimed: AtomicU64,
}

/// Point-in-time copy of [`StoreMetrics`].
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct MetricsSnapshot {
    pub uows_submitted: u64,
    pub uows_canceled: u64,
    pub uows_flushed: u64,
    pub enqueues_canceled: u64,
    pub records_elided: u64,
    pub flush_batches: u64,
    pub flush_failures: u64,
    pub transactions_committed: u64,
    pub transactions_rolled_back: u64,
    pub pages_reclaimed: u64,
}

impl StoreMetrics {
    pub fn record_uow_submitted(&self) {
        self.uows_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_uow_canceled(&self) {
        self.uows_canceled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_uow_flushed(&self) {
        self.uows_flushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enqueue_canceled(&self) {
        self.enqueues_canceled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_record_elided(&self) {
        self.records_elided.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_batch(&self) {
        self.flush_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self) {
        self.transactions_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pages_reclaimed(&self, count: u64) {
        self.pages_reclaimed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uows_submitted: self.uows_submitted.load(Ordering::Relaxed),
            uows_canceled: self.uows_canceled.load(Ordering::Relaxed),
            uows_flushed: self.uows_flushed.load(Ordering::Relaxed),
            enqueues_canceled: self.enqueues_canceled.load(Ordering::Relaxed),
            records_elided: self.records_elided.load(Ordering::Relaxed),
            flush_batches: self.flush_batches.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            transactions_committed: self.transactions_committed.load(Ordering::Relaxed),
            transactions_rolled_back: self.transactions_rolled_back.load(Ordering::Relaxed),
            pages_reclaimed: self.pages_reclaimed.load(Ordering::Relaxed),
        }
    }
}
