//! Assembling the pieces into a running pipeline.

use std::sync::Arc;

use crate::api::{SpanKind, Tracer};
use crate::config::TracingConfig;
use crate::listeners::{
    AnonymizingSpanEventListener, CorrelationSpanEventListener,
    ExternalRequestMetricsSpanEventListener, ReadbackSpanEventListener,
    ServerRequestMetricsSpanEventListener, SpanContextSpanEventListener,
};
use crate::metrics::RequestMetrics;
use crate::monitor::RequestMonitor;
use crate::profiler::CallTreeSpanEventListenerFactory;
use crate::reporter::{
    LoggingSpanReporter, ReporterRegistry, ReportingSpanEventListener, SpanReporter,
};
use crate::sampling::{
    PostExecutionSpanInterceptor, PreExecutionSpanInterceptor,
    SamplePriorityDeterminingSpanEventListener,
};
use crate::wrapper::{SpanEventListenerFactory, SpanWrapper, SpanWrappingTracer};

/// Builds a [`TracingPipeline`].
pub struct PipelineBuilder {
    config: TracingConfig,
    tracer: Arc<dyn Tracer>,
    reporters: Vec<Arc<dyn SpanReporter>>,
    listener_factories: Vec<Arc<dyn SpanEventListenerFactory>>,
    pre_interceptors: Vec<Arc<dyn PreExecutionSpanInterceptor>>,
    post_interceptors: Vec<Arc<dyn PostExecutionSpanInterceptor>>,
}

impl PipelineBuilder {
    /// Start building a pipeline around the given span source.
    pub fn new(tracer: Arc<dyn Tracer>) -> Self {
        PipelineBuilder {
            config: TracingConfig::default(),
            tracer,
            reporters: Vec::new(),
            listener_factories: Vec::new(),
            pre_interceptors: Vec::new(),
            post_interceptors: Vec::new(),
        }
    }

    /// Use the given configuration instead of the defaults.
    pub fn with_config(mut self, config: TracingConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a span reporter.
    pub fn with_reporter(mut self, reporter: Arc<dyn SpanReporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    /// Register a custom listener factory. Custom listeners run after the
    /// classification listeners and before the metrics, call tree and
    /// reporting listeners.
    pub fn with_listener_factory(mut self, factory: Arc<dyn SpanEventListenerFactory>) -> Self {
        self.listener_factories.push(factory);
        self
    }

    /// Register a custom pre-execution interceptor.
    pub fn with_pre_interceptor(mut self, interceptor: Arc<dyn PreExecutionSpanInterceptor>) -> Self {
        self.pre_interceptors.push(interceptor);
        self
    }

    /// Register a custom post-execution interceptor.
    pub fn with_post_interceptor(
        mut self,
        interceptor: Arc<dyn PostExecutionSpanInterceptor>,
    ) -> Self {
        self.post_interceptors.push(interceptor);
        self
    }

    /// Assemble the pipeline.
    pub fn build(self) -> TracingPipeline {
        let config = self.config;
        let metrics = RequestMetrics::new();
        let registry = ReporterRegistry::new(&config);
        registry.add_reporter(Arc::new(LoggingSpanReporter::new()));
        for reporter in self.reporters {
            registry.add_reporter(reporter);
        }

        let sampling = SamplePriorityDeterminingSpanEventListener::new(&config);
        for interceptor in self.pre_interceptors {
            sampling.register_pre_interceptor(interceptor);
        }
        for interceptor in self.post_interceptors {
            sampling.register_post_interceptor(interceptor);
        }

        // The chain order is load bearing: classification must run before
        // sampling, the server metrics listener must attach the response
        // time timer before the call tree listener compares against it, and
        // the readback snapshot must exist before the reporting listener
        // looks for it.
        let mut tracer = SpanWrappingTracer::new(self.tracer);
        tracer.add_listener_factory(Arc::new(SpanContextSpanEventListener));
        tracer.add_listener_factory(Arc::new(sampling.clone()));
        tracer.add_listener_factory(Arc::new(AnonymizingSpanEventListener::new(&config)));
        tracer.add_listener_factory(Arc::new(CorrelationSpanEventListener));
        for factory in self.listener_factories {
            tracer.add_listener_factory(factory);
        }
        tracer.add_listener_factory(Arc::new(ExternalRequestMetricsSpanEventListener::new(
            &metrics,
        )));
        tracer.add_listener_factory(Arc::new(ServerRequestMetricsSpanEventListener::new(
            &metrics,
        )));
        tracer.add_listener_factory(Arc::new(CallTreeSpanEventListenerFactory::new(&config)));
        tracer.add_listener_factory(Arc::new(ReadbackSpanEventListener::new(&registry)));
        tracer.add_listener_factory(Arc::new(ReportingSpanEventListener::new(
            &config, &registry,
        )));

        TracingPipeline {
            tracer: Arc::new(tracer),
            config,
            metrics,
            registry,
            sampling,
        }
    }
}

/// The assembled span instrumentation pipeline.
///
/// Owns the wrapping tracer with its full listener chain, the reporter
/// registry and the metrics registry. Usually built once at startup and
/// shared.
pub struct TracingPipeline {
    tracer: Arc<SpanWrappingTracer>,
    config: TracingConfig,
    metrics: RequestMetrics,
    registry: ReporterRegistry,
    sampling: SamplePriorityDeterminingSpanEventListener,
}

impl TracingPipeline {
    /// Start building a pipeline around the given span source.
    pub fn builder(tracer: Arc<dyn Tracer>) -> PipelineBuilder {
        PipelineBuilder::new(tracer)
    }

    /// Start an instrumented span.
    pub fn start_span(&self, operation_name: &str, kind: SpanKind) -> SpanWrapper {
        self.tracer.start_span(operation_name, kind)
    }

    /// The wrapping tracer, for callers that manage spans themselves.
    pub fn tracer(&self) -> &Arc<SpanWrappingTracer> {
        &self.tracer
    }

    /// A request monitor bound to this pipeline's tracer.
    pub fn request_monitor(&self) -> RequestMonitor {
        RequestMonitor::new(Arc::clone(&self.tracer))
    }

    /// The live configuration of this pipeline.
    pub fn config(&self) -> &TracingConfig {
        &self.config
    }

    /// The response time metrics collected by this pipeline.
    pub fn metrics(&self) -> &RequestMetrics {
        &self.metrics
    }

    /// Register an additional reporter at runtime.
    pub fn add_reporter(&self, reporter: Arc<dyn SpanReporter>) {
        self.registry.add_reporter(reporter);
    }

    /// Register an additional pre-execution interceptor at runtime.
    pub fn register_pre_interceptor(&self, interceptor: Arc<dyn PreExecutionSpanInterceptor>) {
        self.sampling.register_pre_interceptor(interceptor);
    }

    /// Register an additional post-execution interceptor at runtime.
    pub fn register_post_interceptor(&self, interceptor: Arc<dyn PostExecutionSpanInterceptor>) {
        self.sampling.register_post_interceptor(interceptor);
    }

    /// Drain the asynchronous report queue and stop its dispatcher. Spans
    /// finished after shutdown are still processed by the listener chain
    /// but no longer reported asynchronously.
    pub fn shutdown(&self) {
        self.registry.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockTracer;
    use crate::reporter::InMemorySpanReporter;

    #[test]
    fn a_default_pipeline_reports_finished_spans() {
        let reporter = InMemorySpanReporter::new();
        let pipeline = TracingPipeline::builder(Arc::new(MockTracer::new()))
            .with_config(
                TracingConfig::builder()
                    .with_report_spans_async(false)
                    .build(),
            )
            .with_reporter(Arc::new(reporter.clone()))
            .build();

        let mut span = pipeline.start_span("GET /widgets", SpanKind::Server);
        span.set_tag("http.status_code", 200i64);
        span.finish();

        let reported = reporter.reported();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].name, "GET /widgets");
        assert_eq!(
            reported[0].tags["http.status_code"],
            crate::api::TagValue::from(200i64)
        );
        pipeline.shutdown();
    }

    #[test]
    fn shutdown_flushes_asynchronously_reported_spans() {
        let reporter = InMemorySpanReporter::new();
        let pipeline = TracingPipeline::builder(Arc::new(MockTracer::new()))
            .with_reporter(Arc::new(reporter.clone()))
            .build();

        pipeline.start_span("op", SpanKind::Server).finish();
        pipeline.shutdown();

        assert_eq!(reporter.reported().len(), 1);
    }
}
