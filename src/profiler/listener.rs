//! Attaching call trees to spans.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::warn;

use crate::api::{CALL_TREE_ASCII, CALL_TREE_JSON};
use crate::config::TracingConfig;
use crate::metrics::is_faster_than_x_percent_of_all_requests;
use crate::profiler::Profiler;
use crate::rate_limiter::{is_rate_exceeded, RateLimiter};
use crate::wrapper::{SpanEventListener, SpanEventListenerFactory, SpanState};

/// Creates the per-span listener that activates the profiler for
/// qualifying spans and turns the recording into span tags at finish.
///
/// The call tree rate limiter lives here, shared by all spans, and is
/// rebuilt when the configured budget changes.
pub struct CallTreeSpanEventListenerFactory {
    config: TracingConfig,
    rate_limiter: Arc<RwLock<Option<Arc<RateLimiter>>>>,
}

impl CallTreeSpanEventListenerFactory {
    /// Create the factory against the given configuration.
    pub fn new(config: &TracingConfig) -> Self {
        let rate_limiter = Arc::new(RwLock::new(
            RateLimiter::from_credits_per_minute(config.profiler_rate_limit_per_minute().get())
                .map(Arc::new),
        ));
        let slot = Arc::clone(&rate_limiter);
        config
            .profiler_rate_limit_per_minute()
            .subscribe(move |credits| {
                *slot.write().unwrap_or_else(PoisonError::into_inner) =
                    RateLimiter::from_credits_per_minute(*credits).map(Arc::new);
            });
        CallTreeSpanEventListenerFactory {
            config: config.clone(),
            rate_limiter,
        }
    }
}

impl SpanEventListenerFactory for CallTreeSpanEventListenerFactory {
    fn create(&self) -> Box<dyn SpanEventListener> {
        Box::new(CallTreeSpanEventListener {
            config: self.config.clone(),
            rate_limiter: Arc::clone(&self.rate_limiter),
            activated: false,
        })
    }
}

struct CallTreeSpanEventListener {
    config: TracingConfig,
    rate_limiter: Arc<RwLock<Option<Arc<RateLimiter>>>>,
    activated: bool,
}

impl CallTreeSpanEventListener {
    fn determine_if_activate(&self, span: &mut SpanState) -> bool {
        let info = span.info_mut();
        if info.is_external_request() {
            if let Some(context) = info.pre_execution_context_mut() {
                context.should_not_collect_call_tree("this is an external request (client span)");
            }
            return false;
        }
        let suppression_reason = if !self.config.profiler_active().get() {
            Some("the profiler is not active")
        } else if self.config.profiler_rate_limit_per_minute().get() <= 0.0 {
            Some("the call tree rate limit is set to zero")
        } else if Profiler::is_active() {
            Some("another span on this thread is already being profiled")
        } else {
            let guard = self
                .rate_limiter
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if is_rate_exceeded(guard.as_deref()) {
                Some("the call tree rate limit is reached")
            } else {
                None
            }
        };
        let Some(context) = span.info_mut().pre_execution_context_mut() else {
            return false;
        };
        if let Some(reason) = suppression_reason {
            context.should_not_collect_call_tree(reason);
        }
        context.is_collect_call_tree()
    }

    fn determine_if_exclude_call_tree(&self, span: &mut SpanState) {
        let limit = self
            .config
            .exclude_call_tree_when_faster_than_x_percent()
            .get();
        let duration_nanos = span.info().duration_nanos();
        let faster = span
            .info()
            .timer_for_this_request()
            .map_or(false, |timer| {
                is_faster_than_x_percent_of_all_requests(duration_nanos, limit, timer)
            });
        if faster {
            if let Some(context) = span.info_mut().post_execution_context_mut() {
                context.exclude_call_tree("the span was faster than its peers");
            }
        }
    }
}

impl SpanEventListener for CallTreeSpanEventListener {
    fn on_start(&mut self, span: &mut SpanState) {
        if !span.info().is_sampled() || span.info().pre_execution_context().is_none() {
            return;
        }
        if self.determine_if_activate(span) && Profiler::activate("total") {
            self.activated = true;
        }
    }

    fn on_finish(&mut self, span: &mut SpanState, operation_name: &str, _duration_nanos: u64) {
        if !self.activated {
            return;
        }
        self.activated = false;
        // Always take the recording off the thread, even if the result is
        // discarded, so it cannot leak into the next span.
        let Some(mut tree) = Profiler::deactivate() else {
            return;
        };
        if span.info().is_sampled() {
            self.determine_if_exclude_call_tree(span);
        }
        let excluded = span
            .info()
            .post_execution_context()
            .map_or(true, |context| context.is_exclude_call_tree());
        if span.info().is_sampled() && !excluded && !operation_name.is_empty() {
            tree.set_signature(operation_name);
            let min_percent = self.config.min_execution_time_percent().get();
            if min_percent > 0.0 {
                let min_nanos =
                    (tree.execution_time_nanos() as f64 * min_percent / 100.0) as u64;
                tree.remove_calls_faster_than(min_nanos);
            }
            match serde_json::to_string(&tree) {
                Ok(json) => span.set_tag(CALL_TREE_JSON, json),
                Err(error) => warn!(%error, "failed to serialize a call tree"),
            }
            span.set_tag(CALL_TREE_ASCII, tree.to_ascii());
        }
        span.info_mut().set_call_tree(tree);
    }
}
