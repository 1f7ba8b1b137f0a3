//! Report/no-report decisions via interceptor chains.
//!
//! The [`SamplePriorityDeterminingSpanEventListener`] runs two interceptor
//! chains per span: pre-execution interceptors at span start, when only the
//! operation classification is known, and post-execution interceptors at
//! finish, when the name, duration and tags are final. Interceptors record
//! their decisions in the span's context; the reporting listener consults
//! the combined verdict.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::warn;

use crate::api::{SAMPLING_PRIORITY, TagValue};
use crate::config::TracingConfig;
use crate::context::{
    PostExecutionInterceptorContext, PreExecutionInterceptorContext, SpanContextInformation,
};
use crate::rate_limiter::{is_rate_exceeded, RateLimiter};
use crate::wrapper::{SpanEventListener, SpanEventListenerFactory, SpanState};

/// Decides at span start whether the span should be reported and profiled.
///
/// Runs before the span body executes, so implementations can only rely on
/// the operation classification, not on the final name or tags.
pub trait PreExecutionSpanInterceptor: Send + Sync {
    /// Called once when the interceptor is registered.
    fn init(&self, _config: &TracingConfig) {}

    /// Record decisions for a starting span in `context`.
    fn intercept_report(
        &self,
        info: &SpanContextInformation,
        context: &mut PreExecutionInterceptorContext,
    );
}

/// Decides at span finish whether the span should be reported and whether
/// its call tree should be kept.
pub trait PostExecutionSpanInterceptor: Send + Sync {
    /// Called once when the interceptor is registered.
    fn init(&self, _config: &TracingConfig) {}

    /// Record decisions for a finishing span in `context`.
    fn intercept_report(
        &self,
        info: &SpanContextInformation,
        operation_name: &str,
        context: &mut PostExecutionInterceptorContext,
    );
}

struct InterceptorChains {
    config: TracingConfig,
    pre: RwLock<Vec<Arc<dyn PreExecutionSpanInterceptor>>>,
    post: RwLock<Vec<Arc<dyn PostExecutionSpanInterceptor>>>,
}

/// The listener driving both interceptor chains.
///
/// Cloneable; all clones share the same registered interceptors, so the
/// instance held by the pipeline doubles as its own factory.
#[derive(Clone)]
pub struct SamplePriorityDeterminingSpanEventListener {
    chains: Arc<InterceptorChains>,
}

impl SamplePriorityDeterminingSpanEventListener {
    /// Create the listener with the built-in interceptors registered:
    /// rate limiting in the pre phase and operation name filtering in the
    /// post phase.
    pub fn new(config: &TracingConfig) -> Self {
        let listener = SamplePriorityDeterminingSpanEventListener {
            chains: Arc::new(InterceptorChains {
                config: config.clone(),
                pre: RwLock::new(Vec::new()),
                post: RwLock::new(Vec::new()),
            }),
        };
        listener.register_pre_interceptor(Arc::new(RateLimitingPreExecutionInterceptor::new(
            config,
        )));
        listener.register_post_interceptor(Arc::new(NameFilteringPostExecutionInterceptor::new(
            config,
        )));
        listener
    }

    /// Register an additional pre-execution interceptor. It runs after the
    /// previously registered ones, for every subsequently started span.
    pub fn register_pre_interceptor(&self, interceptor: Arc<dyn PreExecutionSpanInterceptor>) {
        interceptor.init(&self.chains.config);
        self.chains
            .pre
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(interceptor);
    }

    /// Register an additional post-execution interceptor.
    pub fn register_post_interceptor(&self, interceptor: Arc<dyn PostExecutionSpanInterceptor>) {
        interceptor.init(&self.chains.config);
        self.chains
            .post
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(interceptor);
    }

    fn pre_interceptors(&self) -> Vec<Arc<dyn PreExecutionSpanInterceptor>> {
        self.chains
            .pre
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn post_interceptors(&self) -> Vec<Arc<dyn PostExecutionSpanInterceptor>> {
        self.chains
            .post
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SpanEventListener for SamplePriorityDeterminingSpanEventListener {
    fn on_start(&mut self, span: &mut SpanState) {
        let mut context = PreExecutionInterceptorContext::new();
        for interceptor in self.pre_interceptors() {
            let result = catch_unwind(AssertUnwindSafe(|| {
                interceptor.intercept_report(span.info(), &mut context);
            }));
            if result.is_err() {
                warn!("a pre-execution interceptor panicked; skipping it");
            }
        }
        if !context.is_report() {
            context.should_not_collect_call_tree("span will not be reported");
        }
        span.info_mut().set_pre_execution_context(context);
    }

    fn on_set_tag(
        &mut self,
        info: &mut SpanContextInformation,
        key: &str,
        value: TagValue,
    ) -> TagValue {
        if key == SAMPLING_PRIORITY && value.as_i64() == Some(0) {
            info.set_sampled(false);
            if let Some(context) = info.pre_execution_context_mut() {
                context.should_not_report(SAMPLING_PRIORITY);
                context.should_not_collect_call_tree("sampling priority is zero");
            }
        }
        value
    }

    fn on_finish(&mut self, span: &mut SpanState, operation_name: &str, _duration_nanos: u64) {
        let mut context = PostExecutionInterceptorContext::new();
        for interceptor in self.post_interceptors() {
            let result = catch_unwind(AssertUnwindSafe(|| {
                interceptor.intercept_report(span.info(), operation_name, &mut context);
            }));
            if result.is_err() {
                warn!("a post-execution interceptor panicked; skipping it");
            }
        }
        span.info_mut().set_post_execution_context(context);
    }
}

impl SpanEventListenerFactory for SamplePriorityDeterminingSpanEventListener {
    fn create(&self) -> Box<dyn SpanEventListener> {
        Box::new(self.clone())
    }
}

type SharedLimiter = Arc<RwLock<Option<Arc<RateLimiter>>>>;

/// Vetoes reporting when the span budget for the operation class is spent.
///
/// Server spans share one bucket. Client spans use the bucket configured
/// for their operation sub-type when one exists (an explicit unlimited
/// entry overrides the default), falling back to the default client
/// bucket. Internal spans are never rate limited here.
pub struct RateLimitingPreExecutionInterceptor {
    server: SharedLimiter,
    external_default: SharedLimiter,
    external_by_type: Arc<RwLock<HashMap<String, Option<Arc<RateLimiter>>>>>,
}

impl RateLimitingPreExecutionInterceptor {
    /// Create the interceptor and keep its limiters in sync with the
    /// configuration.
    pub fn new(config: &TracingConfig) -> Self {
        let server: SharedLimiter = Arc::new(RwLock::new(
            RateLimiter::from_credits_per_minute(config.rate_limit_server_spans_per_minute().get())
                .map(Arc::new),
        ));
        let external_default: SharedLimiter = Arc::new(RwLock::new(
            RateLimiter::from_credits_per_minute(config.rate_limit_client_spans_per_minute().get())
                .map(Arc::new),
        ));
        let external_by_type = Arc::new(RwLock::new(build_per_type_limiters(
            &config.rate_limit_client_spans_per_type_per_minute().get(),
        )));

        let server_slot = Arc::clone(&server);
        config
            .rate_limit_server_spans_per_minute()
            .subscribe(move |credits| {
                *server_slot.write().unwrap_or_else(PoisonError::into_inner) =
                    RateLimiter::from_credits_per_minute(*credits).map(Arc::new);
            });
        let default_slot = Arc::clone(&external_default);
        config
            .rate_limit_client_spans_per_minute()
            .subscribe(move |credits| {
                *default_slot.write().unwrap_or_else(PoisonError::into_inner) =
                    RateLimiter::from_credits_per_minute(*credits).map(Arc::new);
            });
        let per_type_slot = Arc::clone(&external_by_type);
        config
            .rate_limit_client_spans_per_type_per_minute()
            .subscribe(move |per_type| {
                *per_type_slot
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = build_per_type_limiters(per_type);
            });

        RateLimitingPreExecutionInterceptor {
            server,
            external_default,
            external_by_type,
        }
    }

    fn is_server_rate_exceeded(&self) -> bool {
        let guard = self.server.read().unwrap_or_else(PoisonError::into_inner);
        is_rate_exceeded(guard.as_deref())
    }

    fn is_external_rate_exceeded(&self, sub_type: Option<&str>) -> bool {
        if let Some(sub_type) = sub_type {
            let per_type = self
                .external_by_type
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(limiter) = per_type.get(sub_type) {
                return is_rate_exceeded(limiter.as_deref());
            }
        }
        let guard = self
            .external_default
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        is_rate_exceeded(guard.as_deref())
    }
}

fn build_per_type_limiters(
    credits_by_type: &HashMap<String, f64>,
) -> HashMap<String, Option<Arc<RateLimiter>>> {
    credits_by_type
        .iter()
        .map(|(sub_type, credits)| {
            (
                sub_type.clone(),
                RateLimiter::from_credits_per_minute(*credits).map(Arc::new),
            )
        })
        .collect()
}

impl PreExecutionSpanInterceptor for RateLimitingPreExecutionInterceptor {
    fn intercept_report(
        &self,
        info: &SpanContextInformation,
        context: &mut PreExecutionInterceptorContext,
    ) {
        let exceeded = if info.is_server_request() {
            self.is_server_rate_exceeded()
        } else if info.is_external_request() {
            self.is_external_rate_exceeded(info.operation_sub_type())
        } else {
            false
        };
        if exceeded {
            context.should_not_report("RateLimitingPreExecutionInterceptor");
        }
    }
}

/// Vetoes reporting of spans whose operation name is not in the configured
/// allow list. An empty list allows everything.
pub struct NameFilteringPostExecutionInterceptor {
    config: TracingConfig,
}

impl NameFilteringPostExecutionInterceptor {
    /// Create the interceptor against the given configuration.
    pub fn new(config: &TracingConfig) -> Self {
        NameFilteringPostExecutionInterceptor {
            config: config.clone(),
        }
    }
}

impl PostExecutionSpanInterceptor for NameFilteringPostExecutionInterceptor {
    fn intercept_report(
        &self,
        _info: &SpanContextInformation,
        operation_name: &str,
        context: &mut PostExecutionInterceptorContext,
    ) {
        let only = self.config.only_report_spans_with_name().get();
        if !only.is_empty() && !only.contains(operation_name) {
            context.should_not_report("NameFilteringPostExecutionInterceptor");
        }
    }
}
