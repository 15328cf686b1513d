//! Pipeline counters
//!
//! Counters are plain atomics updated by the dispatcher, workers and merger
//! and read without locking. Readings taken while the pipeline runs are
//! eventually consistent; after stop they balance:
//!
//! ```text
//! received   = dispatched + dropped
//! dispatched = merged + cancelled + failed + in_flight
//! merged     = delivered + out_of_order
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Live pipeline counters
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Items taken from the source
    pub received: AtomicU64,
    /// Items handed to a worker
    pub dispatched: AtomicU64,
    /// Items dropped because the pipeline was full
    pub dropped: AtomicU64,
    /// Results taken by the merger, delivered or not
    pub merged: AtomicU64,
    /// Results forwarded to the sink
    pub delivered: AtomicU64,
    /// Results that arrived after a later sequence was merged
    pub out_of_order: AtomicU64,
    /// Items whose transform observed cancellation
    pub cancelled: AtomicU64,
    /// Items whose transform failed or panicked
    pub failed: AtomicU64,
    /// Cumulative transform wall-clock time in microseconds
    pub busy_total_us: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        for counter in [
            &self.received,
            &self.dispatched,
            &self.dropped,
            &self.merged,
            &self.delivered,
            &self.out_of_order,
            &self.cancelled,
            &self.failed,
            &self.busy_total_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_busy(&self, elapsed: Duration) {
        self.busy_total_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Dispatched items not yet merged, cancelled or failed
    pub fn in_flight(&self) -> u64 {
        let dispatched = self.dispatched.load(Ordering::Acquire);
        let settled = self.merged.load(Ordering::Acquire)
            + self.cancelled.load(Ordering::Acquire)
            + self.failed.load(Ordering::Acquire);
        dispatched.saturating_sub(settled)
    }

    /// Average transform duration across every processed item
    pub fn average_duration(&self) -> Duration {
        let processed = self.merged.load(Ordering::Relaxed)
            + self.cancelled.load(Ordering::Relaxed)
            + self.failed.load(Ordering::Relaxed);
        if processed > 0 {
            Duration::from_micros(self.busy_total_us.load(Ordering::Relaxed) / processed)
        } else {
            Duration::ZERO
        }
    }

    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            received: self.received.load(Ordering::Acquire),
            dispatched: self.dispatched.load(Ordering::Acquire),
            dropped: self.dropped.load(Ordering::Acquire),
            merged: self.merged.load(Ordering::Acquire),
            delivered: self.delivered.load(Ordering::Acquire),
            out_of_order: self.out_of_order.load(Ordering::Acquire),
            cancelled: self.cancelled.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
            in_flight: self.in_flight(),
            average_duration: self.average_duration(),
        }
    }
}

/// Point-in-time copy of [`PipelineMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub received: u64,
    pub dispatched: u64,
    pub dropped: u64,
    pub merged: u64,
    pub delivered: u64,
    pub out_of_order: u64,
    pub cancelled: u64,
    pub failed: u64,
    pub in_flight: u64,
    pub average_duration: Duration,
}

impl PipelineStats {
    /// Results taken by the merger
    pub fn finished(&self) -> u64 {
        self.merged
    }

    /// Whether every received item is accounted for
    pub fn is_balanced(&self) -> bool {
        self.received == self.dispatched + self.dropped
            && self.dispatched == self.merged + self.cancelled + self.failed + self.in_flight
            && self.merged == self.delivered + self.out_of_order
    }
}
