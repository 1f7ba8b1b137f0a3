//! Typed, live-reloadable configuration.
//!
//! Every tunable of the pipeline is a [`Dynamic`] value: it can be replaced
//! at runtime, and components that derive internal state from it (rate
//! limiters in particular) subscribe to changes and swap that state
//! wholesale. Readers always observe a fully-constructed value, never a
//! partial update.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

type ChangeSubscriber<T> = Box<dyn Fn(&T) + Send + Sync>;

/// A configuration value that can change at runtime.
///
/// Clones share the same underlying value; [`Dynamic::set`] notifies all
/// subscribers with the new value after it has been stored. Subscribers run
/// on the thread that called `set` and must not call back into `subscribe`.
pub struct Dynamic<T> {
    inner: Arc<DynamicInner<T>>,
}

struct DynamicInner<T> {
    value: RwLock<T>,
    subscribers: Mutex<Vec<ChangeSubscriber<T>>>,
}

impl<T> Clone for Dynamic<T> {
    fn clone(&self) -> Self {
        Dynamic {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Dynamic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Dynamic")
            .field(&*self.inner.value.read().unwrap_or_else(PoisonError::into_inner))
            .finish()
    }
}

impl<T: Clone> Dynamic<T> {
    /// Create a dynamic value with the given initial value.
    pub fn new(initial: T) -> Self {
        Dynamic {
            inner: Arc::new(DynamicInner {
                value: RwLock::new(initial),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The current value.
    pub fn get(&self) -> T {
        self.inner
            .value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the value and notify subscribers.
    pub fn set(&self, value: T) {
        *self
            .inner
            .value
            .write()
            .unwrap_or_else(PoisonError::into_inner) = value.clone();
        let subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for subscriber in subscribers.iter() {
            subscriber(&value);
        }
    }

    /// Register a callback invoked with every new value set after this call.
    pub fn subscribe(&self, subscriber: impl Fn(&T) + Send + Sync + 'static) {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(subscriber));
    }
}

/// The pipeline configuration.
///
/// Cheap to clone; clones share the same dynamic values.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    inner: Arc<ConfigOptions>,
}

#[derive(Debug)]
struct ConfigOptions {
    profiler_active: Dynamic<bool>,
    profiler_rate_limit_per_minute: Dynamic<f64>,
    min_execution_time_percent: Dynamic<f64>,
    exclude_call_tree_when_faster_than_x_percent: Dynamic<f64>,
    rate_limit_server_spans_per_minute: Dynamic<f64>,
    rate_limit_client_spans_per_minute: Dynamic<f64>,
    rate_limit_client_spans_per_type_per_minute: Dynamic<HashMap<String, f64>>,
    only_report_spans_with_name: Dynamic<HashSet<String>>,
    report_spans_async: Dynamic<bool>,
    log_spans: Dynamic<bool>,
    anonymize_ips: Dynamic<bool>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        TracingConfig::builder().build()
    }
}

impl TracingConfig {
    /// Start building a configuration with non-default values.
    pub fn builder() -> TracingConfigBuilder {
        TracingConfigBuilder::default()
    }

    /// Whether the call tree profiler is active at all.
    pub fn profiler_active(&self) -> &Dynamic<bool> {
        &self.inner.profiler_active
    }

    /// How many call trees may be collected per minute. Values at or below
    /// zero deactivate collection, fractional values admit a burst of one,
    /// and values of 1,000,000 or more never limit.
    pub fn profiler_rate_limit_per_minute(&self) -> &Dynamic<f64> {
        &self.inner.profiler_rate_limit_per_minute
    }

    /// Call tree nodes faster than this percentage (0-100) of the root
    /// execution time are pruned. `0` disables pruning.
    pub fn min_execution_time_percent(&self) -> &Dynamic<f64> {
        &self.inner.min_execution_time_percent
    }

    /// Exclude the call tree from the report when the span was faster than
    /// this fraction (0-1) of spans with the same operation name. `0` never
    /// excludes, `1` always excludes.
    pub fn exclude_call_tree_when_faster_than_x_percent(&self) -> &Dynamic<f64> {
        &self.inner.exclude_call_tree_when_faster_than_x_percent
    }

    /// Rate limit for reporting server spans, in spans per minute.
    pub fn rate_limit_server_spans_per_minute(&self) -> &Dynamic<f64> {
        &self.inner.rate_limit_server_spans_per_minute
    }

    /// Rate limit for reporting client (external request) spans whose
    /// sub-type has no dedicated limit, in spans per minute.
    pub fn rate_limit_client_spans_per_minute(&self) -> &Dynamic<f64> {
        &self.inner.rate_limit_client_spans_per_minute
    }

    /// Per-sub-type rate limits for client spans, e.g. `{"jdbc": 0.0}`.
    pub fn rate_limit_client_spans_per_type_per_minute(&self) -> &Dynamic<HashMap<String, f64>> {
        &self.inner.rate_limit_client_spans_per_type_per_minute
    }

    /// When non-empty, only spans with these operation names are reported.
    pub fn only_report_spans_with_name(&self) -> &Dynamic<HashSet<String>> {
        &self.inner.only_report_spans_with_name
    }

    /// Whether finished spans are handed to reporters on a background
    /// thread instead of the request thread.
    pub fn report_spans_async(&self) -> &Dynamic<bool> {
        &self.inner.report_spans_async
    }

    /// Whether the bundled logging reporter is active.
    pub fn log_spans(&self) -> &Dynamic<bool> {
        &self.inner.log_spans
    }

    /// Whether IP-valued tags are anonymized.
    pub fn anonymize_ips(&self) -> &Dynamic<bool> {
        &self.inner.anonymize_ips
    }
}

/// Builder for [`TracingConfig`], initialized with the default values.
#[derive(Debug)]
pub struct TracingConfigBuilder {
    profiler_active: bool,
    profiler_rate_limit_per_minute: f64,
    min_execution_time_percent: f64,
    exclude_call_tree_when_faster_than_x_percent: f64,
    rate_limit_server_spans_per_minute: f64,
    rate_limit_client_spans_per_minute: f64,
    rate_limit_client_spans_per_type_per_minute: HashMap<String, f64>,
    only_report_spans_with_name: HashSet<String>,
    report_spans_async: bool,
    log_spans: bool,
    anonymize_ips: bool,
}

impl Default for TracingConfigBuilder {
    fn default() -> Self {
        TracingConfigBuilder {
            profiler_active: true,
            profiler_rate_limit_per_minute: 1_000_000.0,
            min_execution_time_percent: 0.5,
            exclude_call_tree_when_faster_than_x_percent: 0.0,
            rate_limit_server_spans_per_minute: 1_000_000.0,
            rate_limit_client_spans_per_minute: 1_000_000.0,
            rate_limit_client_spans_per_type_per_minute: HashMap::new(),
            only_report_spans_with_name: HashSet::new(),
            report_spans_async: true,
            log_spans: false,
            anonymize_ips: true,
        }
    }
}

impl TracingConfigBuilder {
    /// Set whether the profiler is active.
    pub fn with_profiler_active(mut self, active: bool) -> Self {
        self.profiler_active = active;
        self
    }

    /// Set the call tree collection rate limit, in call trees per minute.
    pub fn with_profiler_rate_limit_per_minute(mut self, limit: f64) -> Self {
        self.profiler_rate_limit_per_minute = limit;
        self
    }

    /// Set the minimum execution time percentage for call tree pruning.
    pub fn with_min_execution_time_percent(mut self, percent: f64) -> Self {
        self.min_execution_time_percent = percent;
        self
    }

    /// Set the percentile (0-1) below which call trees are excluded.
    pub fn with_exclude_call_tree_when_faster_than_x_percent(mut self, fraction: f64) -> Self {
        self.exclude_call_tree_when_faster_than_x_percent = fraction;
        self
    }

    /// Set the server span report rate limit, in spans per minute.
    pub fn with_rate_limit_server_spans_per_minute(mut self, limit: f64) -> Self {
        self.rate_limit_server_spans_per_minute = limit;
        self
    }

    /// Set the generic client span report rate limit, in spans per minute.
    pub fn with_rate_limit_client_spans_per_minute(mut self, limit: f64) -> Self {
        self.rate_limit_client_spans_per_minute = limit;
        self
    }

    /// Set per-sub-type client span report rate limits.
    pub fn with_rate_limit_client_spans_per_type_per_minute(
        mut self,
        limits: HashMap<String, f64>,
    ) -> Self {
        self.rate_limit_client_spans_per_type_per_minute = limits;
        self
    }

    /// Restrict reporting to the given operation names.
    pub fn with_only_report_spans_with_name(mut self, names: HashSet<String>) -> Self {
        self.only_report_spans_with_name = names;
        self
    }

    /// Set whether reports are dispatched asynchronously.
    pub fn with_report_spans_async(mut self, async_reporting: bool) -> Self {
        self.report_spans_async = async_reporting;
        self
    }

    /// Set whether the logging reporter is active.
    pub fn with_log_spans(mut self, log_spans: bool) -> Self {
        self.log_spans = log_spans;
        self
    }

    /// Set whether IP-valued tags are anonymized.
    pub fn with_anonymize_ips(mut self, anonymize: bool) -> Self {
        self.anonymize_ips = anonymize;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> TracingConfig {
        TracingConfig {
            inner: Arc::new(ConfigOptions {
                profiler_active: Dynamic::new(self.profiler_active),
                profiler_rate_limit_per_minute: Dynamic::new(self.profiler_rate_limit_per_minute),
                min_execution_time_percent: Dynamic::new(self.min_execution_time_percent),
                exclude_call_tree_when_faster_than_x_percent: Dynamic::new(
                    self.exclude_call_tree_when_faster_than_x_percent,
                ),
                rate_limit_server_spans_per_minute: Dynamic::new(
                    self.rate_limit_server_spans_per_minute,
                ),
                rate_limit_client_spans_per_minute: Dynamic::new(
                    self.rate_limit_client_spans_per_minute,
                ),
                rate_limit_client_spans_per_type_per_minute: Dynamic::new(
                    self.rate_limit_client_spans_per_type_per_minute,
                ),
                only_report_spans_with_name: Dynamic::new(self.only_report_spans_with_name),
                report_spans_async: Dynamic::new(self.report_spans_async),
                log_spans: Dynamic::new(self.log_spans),
                anonymize_ips: Dynamic::new(self.anonymize_ips),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn get_returns_latest_value() {
        let value = Dynamic::new(1.0);
        assert_eq!(value.get(), 1.0);
        value.set(2.5);
        assert_eq!(value.get(), 2.5);
    }

    #[test]
    fn subscribers_see_every_change() {
        let value = Dynamic::new(0u64);
        let notified = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&notified);
        value.subscribe(move |v| {
            seen.store(*v as usize, Ordering::SeqCst);
        });

        value.set(7);
        assert_eq!(notified.load(Ordering::SeqCst), 7);
        value.set(42);
        assert_eq!(notified.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn clones_share_state() {
        let config = TracingConfig::default();
        let clone = config.clone();
        config.profiler_active().set(false);
        assert!(!clone.profiler_active().get());
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = TracingConfig::builder()
            .with_profiler_rate_limit_per_minute(60.0)
            .with_log_spans(true)
            .build();
        assert_eq!(config.profiler_rate_limit_per_minute().get(), 60.0);
        assert!(config.log_spans().get());
        assert!(config.report_spans_async().get());
    }
}
