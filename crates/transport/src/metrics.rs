//! Outlet metrics for observability

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Lock-free counters of one outlet
#[derive(Debug, Default)]
pub struct OutletMetrics {
    samples_pushed: AtomicU64,
    chunks_sent: AtomicU64,
    /// Samples discarded because a consumer's backlog was full
    samples_dropped: AtomicU64,
    consumers: AtomicUsize,
    consumers_total: AtomicU64,
    send_failures: AtomicU64,
}

impl OutletMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pushed(&self, n: u64) {
        self.samples_pushed.fetch_add(n, Ordering::Relaxed);
        metrics::counter!("mibridge_samples_pushed_total").increment(n);
    }

    pub fn inc_chunks_sent(&self) {
        self.chunks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_dropped(&self, n: u64) {
        if n > 0 {
            self.samples_dropped.fetch_add(n, Ordering::Relaxed);
            metrics::counter!("mibridge_samples_dropped_total").increment(n);
        }
    }

    pub fn consumer_connected(&self) {
        self.consumers.fetch_add(1, Ordering::Relaxed);
        self.consumers_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn consumer_disconnected(&self) {
        self.consumers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_send_failures(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> OutletMetricsSnapshot {
        OutletMetricsSnapshot {
            samples_pushed: self.samples_pushed.load(Ordering::Relaxed),
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
            consumers: self.consumers.load(Ordering::Relaxed),
            consumers_total: self.consumers_total.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of outlet metrics (for reporting)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutletMetricsSnapshot {
    pub samples_pushed: u64,
    pub chunks_sent: u64,
    pub samples_dropped: u64,
    pub consumers: usize,
    pub consumers_total: u64,
    pub send_failures: u64,
}
