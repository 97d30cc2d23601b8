//! Per-stream counters

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

#[derive(Default)]
struct Counters {
    frames_published: AtomicU64,
    forced_swaps: AtomicU64,
    payloads_dropped: AtomicU64,
    bytes_truncated: AtomicU64,
    transfer_errors: AtomicU64,
    transfers_resubmitted: AtomicU64,
    transfers_retired: AtomicU64,
}

/// Streaming counters, updated from completion context.
#[derive(Default)]
pub(crate) struct StreamStats {
    counters: CachePadded<Counters>,
}

/// Point-in-time copy of a stream's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_published: u64,
    /// Frames closed by a frame-ID toggle because EOF never came
    pub forced_swaps: u64,
    pub payloads_dropped: u64,
    pub bytes_truncated: u64,
    /// Timeouts, stalls, overflows and other errors that led to a resubmit
    pub transfer_errors: u64,
    pub transfers_resubmitted: u64,
    pub transfers_retired: u64,
}

impl StreamStats {
    pub fn frames_published(&self, count: u64) {
        self.counters
            .frames_published
            .fetch_add(count, Ordering::Relaxed);
        metrics::counter!("uvc_frames_published_total").increment(count);
    }

    pub fn forced_swap(&self) {
        self.counters.forced_swaps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn payload_dropped(&self) {
        self.counters.payloads_dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("uvc_payloads_dropped_total").increment(1);
    }

    pub fn bytes_truncated(&self, count: usize) {
        self.counters
            .bytes_truncated
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn transfer_error(&self) {
        self.counters.transfer_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfer_resubmitted(&self) {
        self.counters
            .transfers_resubmitted
            .fetch_add(1, Ordering::Relaxed);
        metrics::counter!("uvc_transfers_resubmitted_total").increment(1);
    }

    pub fn transfer_retired(&self) {
        self.counters
            .transfers_retired
            .fetch_add(1, Ordering::Relaxed);
        metrics::counter!("uvc_transfers_retired_total").increment(1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = &self.counters;
        StatsSnapshot {
            frames_published: c.frames_published.load(Ordering::Relaxed),
            forced_swaps: c.forced_swaps.load(Ordering::Relaxed),
            payloads_dropped: c.payloads_dropped.load(Ordering::Relaxed),
            bytes_truncated: c.bytes_truncated.load(Ordering::Relaxed),
            transfer_errors: c.transfer_errors.load(Ordering::Relaxed),
            transfers_resubmitted: c.transfers_resubmitted.load(Ordering::Relaxed),
            transfers_retired: c.transfers_retired.load(Ordering::Relaxed),
        }
    }
}
