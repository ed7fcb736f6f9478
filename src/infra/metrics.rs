//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention between the
//! tick loop, the webhook worker and the status server. Reporting swaps the
//! periodic counters; monotonic totals are never reset.
//!
//! NOTE: All atomics use Relaxed ordering intentionally, these are statistical
//! counters only. Do NOT use them for coordination or logic decisions.

use crate::domain::types::SensorId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Tick latency bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const TICK_BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Session duration bucket boundaries (seconds)
/// Buckets: ≤10s, ≤30s, ≤1m, ≤5m, ≤10m, ≤30m, ≤1h, ≤2h, ≤4h, ≤8h, >8h
const SESSION_BUCKET_BOUNDS: [u64; 10] = [10, 30, 60, 300, 600, 1800, 3600, 7200, 14400, 28800];

#[inline]
fn bucket_index(bounds: &[u64; 10], value: u64) -> usize {
    bounds.partition_point(|&bound| bound < value)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Last bucket uses 2x the previous bound
    const UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return UPPER_BOUNDS[i];
        }
    }
    UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Ticks processed (monotonic)
    ticks_total: AtomicU64,
    /// Ticks since last report (reset on report)
    ticks_since_report: AtomicU64,
    tick_latency_sum_us: AtomicU64,
    tick_latency_max_us: AtomicU64,
    tick_latency_buckets: [AtomicU64; NUM_BUCKETS],
    entries_total: AtomicU64,
    exits_total: AtomicU64,
    sessions_total: AtomicU64,
    session_duration_ms_sum: AtomicU64,
    /// Session duration histogram (seconds, cumulative)
    session_duration_buckets: [AtomicU64; NUM_BUCKETS],
    /// Current occupant count (gauge)
    occupant_count: AtomicU64,
    /// 1 when occupied, 0 when empty (gauge)
    occupied: AtomicU64,
    stale_expirations_total: AtomicU64,
    underflow_clamps_total: AtomicU64,
    /// No-echo readings per sensor, indexed by `SensorId::index`
    no_echo_total: [AtomicU64; 2],
    resets_total: AtomicU64,
    webhook_sent_total: AtomicU64,
    webhook_failed_total: AtomicU64,
    /// Webhook calls dropped because the worker queue was full
    webhook_dropped_total: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            ticks_total: AtomicU64::new(0),
            ticks_since_report: AtomicU64::new(0),
            tick_latency_sum_us: AtomicU64::new(0),
            tick_latency_max_us: AtomicU64::new(0),
            tick_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            entries_total: AtomicU64::new(0),
            exits_total: AtomicU64::new(0),
            sessions_total: AtomicU64::new(0),
            session_duration_ms_sum: AtomicU64::new(0),
            session_duration_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            occupant_count: AtomicU64::new(0),
            occupied: AtomicU64::new(0),
            stale_expirations_total: AtomicU64::new(0),
            underflow_clamps_total: AtomicU64::new(0),
            no_echo_total: std::array::from_fn(|_| AtomicU64::new(0)),
            resets_total: AtomicU64::new(0),
            webhook_sent_total: AtomicU64::new(0),
            webhook_failed_total: AtomicU64::new(0),
            webhook_dropped_total: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record one completed tick with its processing latency
    #[inline]
    pub fn record_tick(&self, latency_us: u64) {
        self.ticks_total.fetch_add(1, Ordering::Relaxed);
        self.ticks_since_report.fetch_add(1, Ordering::Relaxed);
        self.tick_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.tick_latency_buckets[bucket_index(&TICK_BUCKET_BOUNDS, latency_us)]
            .fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.tick_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_entry(&self) {
        self.entries_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_exit(&self) {
        self.exits_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed occupied session
    #[inline]
    pub fn record_session(&self, duration_ms: u64) {
        self.sessions_total.fetch_add(1, Ordering::Relaxed);
        self.session_duration_ms_sum.fetch_add(duration_ms, Ordering::Relaxed);
        self.session_duration_buckets[bucket_index(&SESSION_BUCKET_BOUNDS, duration_ms / 1000)]
            .fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_occupancy(&self, occupant_count: u32, occupied: bool) {
        self.occupant_count.store(occupant_count as u64, Ordering::Relaxed);
        self.occupied.store(occupied as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_stale_expirations(&self, count: u64) {
        if count > 0 {
            self.stale_expirations_total.fetch_add(count, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_underflow_clamp(&self) {
        self.underflow_clamps_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_no_echo(&self, sensor: SensorId) {
        self.no_echo_total[sensor.index()].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reset(&self) {
        self.resets_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_webhook_sent(&self) {
        self.webhook_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_webhook_failed(&self) {
        self.webhook_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_webhook_dropped(&self) {
        self.webhook_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn ticks_total(&self) -> u64 {
        self.ticks_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn webhook_sent_total(&self) -> u64 {
        self.webhook_sent_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn webhook_failed_total(&self) -> u64 {
        self.webhook_failed_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn webhook_dropped_total(&self) -> u64 {
        self.webhook_dropped_total.load(Ordering::Relaxed)
    }

    /// Snapshot without resetting anything (for scrapes)
    pub fn snapshot(&self) -> MetricsSummary {
        self.summarize(false)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    pub fn report(&self) -> MetricsSummary {
        self.summarize(true)
    }

    fn summarize(&self, reset: bool) -> MetricsSummary {
        let (tick_count, latency_sum, latency_max, tick_buckets) = if reset {
            (
                self.ticks_since_report.swap(0, Ordering::Relaxed),
                self.tick_latency_sum_us.swap(0, Ordering::Relaxed),
                self.tick_latency_max_us.swap(0, Ordering::Relaxed),
                swap_buckets(&self.tick_latency_buckets),
            )
        } else {
            (
                self.ticks_since_report.load(Ordering::Relaxed),
                self.tick_latency_sum_us.load(Ordering::Relaxed),
                self.tick_latency_max_us.load(Ordering::Relaxed),
                load_buckets(&self.tick_latency_buckets),
            )
        };

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            if reset {
                *last = Instant::now();
            }
            elapsed
        };

        let ticks_per_sec = if elapsed.as_secs_f64() > 0.0 {
            tick_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_tick_latency_us = if tick_count > 0 { latency_sum / tick_count } else { 0 };

        let sessions_total = self.sessions_total.load(Ordering::Relaxed);
        let session_duration_ms_sum = self.session_duration_ms_sum.load(Ordering::Relaxed);

        MetricsSummary {
            ticks_total: self.ticks_total.load(Ordering::Relaxed),
            ticks_per_sec,
            avg_tick_latency_us,
            max_tick_latency_us: latency_max,
            tick_lat_buckets: tick_buckets,
            tick_lat_p99_us: percentile_from_buckets(&tick_buckets, 0.99),
            entries_total: self.entries_total.load(Ordering::Relaxed),
            exits_total: self.exits_total.load(Ordering::Relaxed),
            sessions_total,
            session_duration_ms_sum,
            session_duration_buckets: load_buckets(&self.session_duration_buckets),
            occupant_count: self.occupant_count.load(Ordering::Relaxed),
            occupied: self.occupied.load(Ordering::Relaxed) == 1,
            stale_expirations_total: self.stale_expirations_total.load(Ordering::Relaxed),
            underflow_clamps_total: self.underflow_clamps_total.load(Ordering::Relaxed),
            no_echo_entrance_total: self.no_echo_total[SensorId::Entrance.index()]
                .load(Ordering::Relaxed),
            no_echo_exit_total: self.no_echo_total[SensorId::Exit.index()].load(Ordering::Relaxed),
            resets_total: self.resets_total.load(Ordering::Relaxed),
            webhook_sent_total: self.webhook_sent_total.load(Ordering::Relaxed),
            webhook_failed_total: self.webhook_failed_total.load(Ordering::Relaxed),
            webhook_dropped_total: self.webhook_dropped_total.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;
pub const METRICS_TICK_BUCKET_BOUNDS: [u64; 10] = TICK_BUCKET_BOUNDS;
pub const METRICS_SESSION_BUCKET_BOUNDS: [u64; 10] = SESSION_BUCKET_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub ticks_total: u64,
    pub ticks_per_sec: f64,
    pub avg_tick_latency_us: u64,
    pub max_tick_latency_us: u64,
    /// Tick latency histogram (µs)
    pub tick_lat_buckets: [u64; NUM_BUCKETS],
    pub tick_lat_p99_us: u64,
    pub entries_total: u64,
    pub exits_total: u64,
    pub sessions_total: u64,
    pub session_duration_ms_sum: u64,
    /// Session duration histogram (seconds)
    pub session_duration_buckets: [u64; NUM_BUCKETS],
    pub occupant_count: u64,
    pub occupied: bool,
    pub stale_expirations_total: u64,
    pub underflow_clamps_total: u64,
    pub no_echo_entrance_total: u64,
    pub no_echo_exit_total: u64,
    pub resets_total: u64,
    pub webhook_sent_total: u64,
    pub webhook_failed_total: u64,
    pub webhook_dropped_total: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            ticks_total = %self.ticks_total,
            ticks_per_sec = format!("{:.1}", self.ticks_per_sec),
            avg_tick_us = %self.avg_tick_latency_us,
            max_tick_us = %self.max_tick_latency_us,
            p99_tick_us = %self.tick_lat_p99_us,
            occupant_count = %self.occupant_count,
            occupied = %self.occupied,
            entries = %self.entries_total,
            exits = %self.exits_total,
            sessions = %self.sessions_total,
            stale_expirations = %self.stale_expirations_total,
            underflow_clamps = %self.underflow_clamps_total,
            webhook_failed = %self.webhook_failed_total,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.ticks_total(), 0);
        let summary = metrics.report();
        assert_eq!(summary.avg_tick_latency_us, 0);
        assert!(!summary.occupied);
    }

    #[test]
    fn test_report_resets_periodic_counters() {
        let metrics = Metrics::new();

        metrics.record_tick(100);
        metrics.record_tick(200);
        metrics.record_tick(300);

        let summary = metrics.report();
        assert_eq!(summary.ticks_total, 3);
        assert_eq!(summary.avg_tick_latency_us, 200);
        assert_eq!(summary.max_tick_latency_us, 300);

        let summary = metrics.report();
        assert_eq!(summary.ticks_total, 3); // monotonic
        assert_eq!(summary.avg_tick_latency_us, 0);
        assert_eq!(summary.max_tick_latency_us, 0);
    }

    #[test]
    fn test_snapshot_does_not_reset() {
        let metrics = Metrics::new();
        metrics.record_tick(150);

        assert_eq!(metrics.snapshot().max_tick_latency_us, 150);
        assert_eq!(metrics.snapshot().max_tick_latency_us, 150);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(&TICK_BUCKET_BOUNDS, 0), 0);
        assert_eq!(bucket_index(&TICK_BUCKET_BOUNDS, 100), 0);
        assert_eq!(bucket_index(&TICK_BUCKET_BOUNDS, 101), 1);
        assert_eq!(bucket_index(&TICK_BUCKET_BOUNDS, 51200), 9);
        assert_eq!(bucket_index(&TICK_BUCKET_BOUNDS, 51201), 10);
    }

    #[test]
    fn test_session_histogram() {
        let metrics = Metrics::new();

        metrics.record_session(5_000); // ≤10s
        metrics.record_session(45_000); // ≤1m
        metrics.record_session(10 * 3600 * 1000); // >8h

        let summary = metrics.report();
        assert_eq!(summary.sessions_total, 3);
        assert_eq!(summary.session_duration_ms_sum, 5_000 + 45_000 + 36_000_000);
        assert_eq!(summary.session_duration_buckets[0], 1);
        assert_eq!(summary.session_duration_buckets[2], 1);
        assert_eq!(summary.session_duration_buckets[10], 1);
    }

    #[test]
    fn test_occupancy_gauges_and_counters() {
        let metrics = Metrics::new();

        metrics.record_entry();
        metrics.set_occupancy(1, true);
        metrics.record_no_echo(SensorId::Exit);
        metrics.record_stale_expirations(0);
        metrics.record_stale_expirations(2);
        metrics.record_underflow_clamp();

        let summary = metrics.snapshot();
        assert_eq!(summary.entries_total, 1);
        assert_eq!(summary.occupant_count, 1);
        assert!(summary.occupied);
        assert_eq!(summary.no_echo_exit_total, 1);
        assert_eq!(summary.no_echo_entrance_total, 0);
        assert_eq!(summary.stale_expirations_total, 2);
        assert_eq!(summary.underflow_clamps_total, 1);
    }

    #[test]
    fn test_percentile_computation() {
        let metrics = Metrics::new();
        for _ in 0..100 {
            metrics.record_tick(150);
        }
        assert_eq!(metrics.report().tick_lat_p99_us, 200);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    m.record_tick(i as u64);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.ticks_total(), 10_000);
    }
}
