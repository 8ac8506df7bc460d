//! Observational counters published by the socket layer.
//!
//! One [`NetMetrics`] context is constructed by the application and passed by
//! `Arc` to every socket that should publish into it (no process-wide
//! statics). The counters never influence transport behavior.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct NetMetrics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    sends_dropped: AtomicU64,
    outstanding_high_water: AtomicU64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub sends_dropped: u64,
    pub outstanding_high_water: u64,
}

impl NetMetrics {
    pub fn new() -> Self {
        NetMetrics::default()
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.sends_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Folds the current outstanding-write-byte count into the high-water
    /// mark.
    pub(crate) fn observe_outstanding(&self, bytes: usize) {
        self.outstanding_high_water
            .fetch_max(bytes as u64, Ordering::Relaxed);
    }

    /// Maximum observed outstanding-write-byte count since the last reset.
    pub fn outstanding_high_water(&self) -> u64 {
        self.outstanding_high_water.load(Ordering::Relaxed)
    }

    pub fn reset_high_water(&self) {
        self.outstanding_high_water.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            sends_dropped: self.sends_dropped.load(Ordering::Relaxed),
            outstanding_high_water: self.outstanding_high_water.load(Ordering::Relaxed),
        }
    }
}
