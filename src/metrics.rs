//! Per-operation response time metrics.
//!
//! The pipeline only needs one question answered by its metrics
//! collaborator: was this span faster than a given fraction of its peers?
//! [`RequestMetrics`] keeps a bounded reservoir of recent durations per
//! operation name and answers with a nearest-rank percentile.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// How many recent samples a timer retains for percentile estimation.
const RESERVOIR_SIZE: usize = 1_024;

/// Registry of duration timers, keyed by operation name.
#[derive(Clone, Debug, Default)]
pub struct RequestMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    timers: RwLock<HashMap<String, Arc<Timer>>>,
}

impl RequestMetrics {
    /// Create an empty registry.
    pub fn new() -> Self {
        RequestMetrics::default()
    }

    /// The timer for the given operation name, created on first use.
    pub fn timer(&self, operation_name: &str) -> Arc<Timer> {
        if let Some(timer) = self
            .inner
            .timers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(operation_name)
        {
            return Arc::clone(timer);
        }
        let mut timers = self
            .inner
            .timers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            timers
                .entry(operation_name.to_owned())
                .or_insert_with(|| Arc::new(Timer::default())),
        )
    }

    /// The timer tracking external requests of the given sub-type.
    pub fn external_timer(&self, sub_type: &str) -> Arc<Timer> {
        self.timer(&format!("external.{sub_type}"))
    }
}

/// Records durations and answers percentile queries over a bounded window
/// of the most recent [`RESERVOIR_SIZE`] samples.
#[derive(Debug, Default)]
pub struct Timer {
    samples: Mutex<VecDeque<u64>>,
    count: AtomicU64,
}

impl Timer {
    /// Record one duration in nanoseconds.
    pub fn record(&self, duration_nanos: u64) {
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        if samples.len() == RESERVOIR_SIZE {
            samples.pop_front();
        }
        samples.push_back(duration_nanos);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Total number of recorded durations, including evicted ones.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// The nearest-rank percentile of the retained samples, or `None` when
    /// nothing has been recorded yet.
    pub fn percentile(&self, quantile: f64) -> Option<u64> {
        let samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let quantile = quantile.clamp(0.0, 1.0);
        let rank = (quantile * sorted.len() as f64).ceil() as usize;
        Some(sorted[rank.max(1).min(sorted.len()) - 1])
    }
}

/// Whether a span with the given duration was at least as fast as
/// `percentile_limit` (a fraction between 0 and 1) of the requests recorded
/// in `timer`.
///
/// A limit of zero or less never matches and a limit of one or more always
/// matches. A timer without data fails open and reports "not faster", so
/// the first requests of a kind are never excluded from visibility.
pub fn is_faster_than_x_percent_of_all_requests(
    duration_nanos: u64,
    percentile_limit: f64,
    timer: &Timer,
) -> bool {
    if percentile_limit <= 0.0 {
        return false;
    }
    if percentile_limit >= 1.0 {
        return true;
    }
    match timer.percentile(percentile_limit) {
        Some(threshold) => duration_nanos <= threshold,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_is_shared_per_operation_name() {
        let metrics = RequestMetrics::new();
        let a = metrics.timer("GET /widgets");
        let b = metrics.timer("GET /widgets");
        a.record(10);
        assert_eq!(b.count(), 1);
        assert_eq!(metrics.timer("GET /other").count(), 0);
    }

    #[test]
    fn nearest_rank_percentile() {
        let timer = Timer::default();
        for v in [10, 20, 30, 40] {
            timer.record(v);
        }
        assert_eq!(timer.percentile(0.0), Some(10));
        assert_eq!(timer.percentile(0.5), Some(20));
        assert_eq!(timer.percentile(0.75), Some(30));
        assert_eq!(timer.percentile(1.0), Some(40));
    }

    #[test]
    fn percentile_without_data_is_none() {
        assert_eq!(Timer::default().percentile(0.5), None);
    }

    #[test]
    fn faster_check_fails_open_without_data() {
        let timer = Timer::default();
        assert!(!is_faster_than_x_percent_of_all_requests(1, 0.5, &timer));
    }

    #[test]
    fn faster_check_limits() {
        let timer = Timer::default();
        timer.record(10);
        timer.record(100);
        assert!(!is_faster_than_x_percent_of_all_requests(10, 0.0, &timer));
        assert!(is_faster_than_x_percent_of_all_requests(999, 1.0, &timer));
        assert!(is_faster_than_x_percent_of_all_requests(10, 0.5, &timer));
        assert!(!is_faster_than_x_percent_of_all_requests(100, 0.5, &timer));
    }

    #[test]
    fn reservoir_is_bounded() {
        let timer = Timer::default();
        for i in 0..(RESERVOIR_SIZE as u64 + 100) {
            timer.record(i);
        }
        assert_eq!(timer.count(), RESERVOIR_SIZE as u64 + 100);
        // The oldest samples were evicted, so the minimum is no longer 0.
        assert_eq!(timer.percentile(0.0), Some(100));
    }
}
