//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! Totals are monotonic; per-window counters are swapped to zero on report.
//!
//! NOTE: All atomics use Relaxed ordering intentionally; these are statistical
//! counters only. Do NOT use them for coordination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Capture duration buckets (milliseconds)
/// Buckets: <=1s, <=5s, <=15s, <=30s, <=60s, <=120s, >120s
const CAPTURE_BUCKET_BOUNDS: [u64; 6] = [1_000, 5_000, 15_000, 30_000, 60_000, 120_000];
const NUM_BUCKETS: usize = 7;

#[inline]
fn bucket_index(duration_ms: u64) -> usize {
    CAPTURE_BUCKET_BOUNDS.partition_point(|&bound| bound < duration_ms)
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Lock-free metrics collector
pub struct Metrics {
    capture_cycles_total: AtomicU64,
    capture_failures_total: AtomicU64,
    identifiers_since_report: AtomicU64,
    capture_buckets: [AtomicU64; NUM_BUCKETS],
    intervals_opened_total: AtomicU64,
    intervals_closed_total: AtomicU64,
    sessions_rotated_total: AtomicU64,
    images_written_total: AtomicU64,
    image_failures_total: AtomicU64,
    exports_ok_total: AtomicU64,
    exports_failed_total: AtomicU64,
    records_exported_total: AtomicU64,
    last_report: parking_lot::Mutex<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            capture_cycles_total: AtomicU64::new(0),
            capture_failures_total: AtomicU64::new(0),
            identifiers_since_report: AtomicU64::new(0),
            capture_buckets: Default::default(),
            intervals_opened_total: AtomicU64::new(0),
            intervals_closed_total: AtomicU64::new(0),
            sessions_rotated_total: AtomicU64::new(0),
            images_written_total: AtomicU64::new(0),
            image_failures_total: AtomicU64::new(0),
            exports_ok_total: AtomicU64::new(0),
            exports_failed_total: AtomicU64::new(0),
            records_exported_total: AtomicU64::new(0),
            last_report: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_capture(&self, identifiers: usize, duration_ms: u64) {
        self.capture_cycles_total.fetch_add(1, Ordering::Relaxed);
        self.identifiers_since_report.fetch_add(identifiers as u64, Ordering::Relaxed);
        self.capture_buckets[bucket_index(duration_ms)].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_capture_failure(&self) {
        self.capture_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_intervals(&self, opened: usize, closed: usize) {
        self.intervals_opened_total.fetch_add(opened as u64, Ordering::Relaxed);
        self.intervals_closed_total.fetch_add(closed as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_rotated(&self) {
        self.sessions_rotated_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_image(&self, ok: bool) {
        if ok {
            self.images_written_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.image_failures_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_export(&self, ok: bool, records: usize) {
        if ok {
            self.exports_ok_total.fetch_add(1, Ordering::Relaxed);
            self.records_exported_total.fetch_add(records as u64, Ordering::Relaxed);
        } else {
            self.exports_failed_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Snapshot totals and reset the per-window counters
    pub fn report(&self) -> MetricsSummary {
        let window_secs = {
            let mut last = self.last_report.lock();
            let elapsed = last.elapsed().as_secs_f64();
            *last = Instant::now();
            elapsed
        };

        let identifiers = self.identifiers_since_report.swap(0, Ordering::Relaxed);
        MetricsSummary {
            capture_cycles_total: self.capture_cycles_total.load(Ordering::Relaxed),
            capture_failures_total: self.capture_failures_total.load(Ordering::Relaxed),
            identifiers_per_min: if window_secs > 0.0 {
                identifiers as f64 * 60.0 / window_secs
            } else {
                0.0
            },
            capture_buckets: swap_buckets(&self.capture_buckets),
            intervals_opened_total: self.intervals_opened_total.load(Ordering::Relaxed),
            intervals_closed_total: self.intervals_closed_total.load(Ordering::Relaxed),
            sessions_rotated_total: self.sessions_rotated_total.load(Ordering::Relaxed),
            images_written_total: self.images_written_total.load(Ordering::Relaxed),
            image_failures_total: self.image_failures_total.load(Ordering::Relaxed),
            exports_ok_total: self.exports_ok_total.load(Ordering::Relaxed),
            exports_failed_total: self.exports_failed_total.load(Ordering::Relaxed),
            records_exported_total: self.records_exported_total.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the counters
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub capture_cycles_total: u64,
    pub capture_failures_total: u64,
    pub identifiers_per_min: f64,
    pub capture_buckets: [u64; NUM_BUCKETS],
    pub intervals_opened_total: u64,
    pub intervals_closed_total: u64,
    pub sessions_rotated_total: u64,
    pub images_written_total: u64,
    pub image_failures_total: u64,
    pub exports_ok_total: u64,
    pub exports_failed_total: u64,
    pub records_exported_total: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            capture_cycles = %self.capture_cycles_total,
            capture_failures = %self.capture_failures_total,
            identifiers_per_min = %format!("{:.1}", self.identifiers_per_min),
            capture_ms_buckets = ?self.capture_buckets,
            intervals_opened = %self.intervals_opened_total,
            intervals_closed = %self.intervals_closed_total,
            sessions_rotated = %self.sessions_rotated_total,
            images_written = %self.images_written_total,
            image_failures = %self.image_failures_total,
            exports_ok = %self.exports_ok_total,
            exports_failed = %self.exports_failed_total,
            records_exported = %self.records_exported_total,
            "metrics_summary"
        );
    }
}
