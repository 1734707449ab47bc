//! Session metrics
//!
//! Lightweight counters updated with atomics on the hot path plus an
//! hdrhistogram of control-message propagation latency. A snapshot API
//! exposes the values; there is no exporter here.

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one streaming session (shared across node tasks)
#[derive(Debug)]
pub struct SessionMetrics {
    /// Items routed across all edges
    items_routed: AtomicU64,
    /// Items dropped by lossy edges (drop-oldest on overflow)
    lossy_drops: AtomicU64,
    /// Node process retries performed
    retries: AtomicU64,
    /// Circuit breaker trips
    breaker_trips: AtomicU64,
    /// Control messages fanned out
    control_messages: AtomicU64,
    /// Buffers discarded due to speculation cancels
    cancelled_buffers: AtomicU64,
    /// Control propagation latency, microseconds
    control_latency_us: Mutex<Histogram<u64>>,
}

impl SessionMetrics {
    /// Fresh zeroed metrics
    pub fn new() -> Self {
        Self {
            items_routed: AtomicU64::new(0),
            lossy_drops: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            breaker_trips: AtomicU64::new(0),
            control_messages: AtomicU64::new(0),
            cancelled_buffers: AtomicU64::new(0),
            // 1 us .. 10 s, 3 significant digits
            control_latency_us: Mutex::new(
                Histogram::new_with_bounds(1, 10_000_000, 3).expect("static histogram bounds"),
            ),
        }
    }

    /// Count one routed item
    pub fn record_item_routed(&self) {
        self.items_routed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one lossy-edge drop
    pub fn record_lossy_drop(&self) {
        self.lossy_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one retry
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one breaker trip
    pub fn record_breaker_trip(&self) {
        self.breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one fanned-out control message and its propagation latency
    pub fn record_control_delivery(&self, latency_us: u64) {
        self.control_messages.fetch_add(1, Ordering::Relaxed);
        let mut hist = self.control_latency_us.lock();
        let _ = hist.record(latency_us.max(1));
    }

    /// Count one buffer discarded by a speculation cancel
    pub fn record_cancelled_buffer(&self) {
        self.cancelled_buffers.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        let hist = self.control_latency_us.lock();
        MetricsSnapshot {
            items_routed: self.items_routed.load(Ordering::Relaxed),
            lossy_drops: self.lossy_drops.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            breaker_trips: self.breaker_trips.load(Ordering::Relaxed),
            control_messages: self.control_messages.load(Ordering::Relaxed),
            cancelled_buffers: self.cancelled_buffers.load(Ordering::Relaxed),
            control_latency_p95_us: if hist.is_empty() {
                0
            } else {
                hist.value_at_quantile(0.95)
            },
        }
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of session counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Items routed across all edges
    pub items_routed: u64,
    /// Items dropped by lossy edges
    pub lossy_drops: u64,
    /// Node process retries
    pub retries: u64,
    /// Circuit breaker trips
    pub breaker_trips: u64,
    /// Control messages fanned out
    pub control_messages: u64,
    /// Buffers discarded by speculation cancels
    pub cancelled_buffers: u64,
    /// P95 control propagation latency in microseconds
    pub control_latency_p95_us: u64,
}
