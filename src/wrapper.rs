//! The span wrapper and its listener chain.
//!
//! [`SpanWrappingTracer`] decorates a [`Tracer`] so that every span it
//! starts is a [`SpanWrapper`]: the raw span plus a
//! [`SpanContextInformation`] and a chain of [`SpanEventListener`]s that
//! observe the start, every tag mutation, and the finish of the span.

use std::sync::Arc;
use std::time::Instant;

use crate::api::{Span, SpanId, SpanKind, TagValue, TraceId, Tracer};
use crate::context::SpanContextInformation;

/// Observes the lifecycle of one span.
///
/// One listener instance is created per span, so listeners may keep
/// per-span state in `self`. Stateless listeners typically implement
/// [`SpanEventListenerFactory`] for themselves via `Clone`.
pub trait SpanEventListener: Send {
    /// Called once, right after the span was started.
    fn on_start(&mut self, _span: &mut SpanState) {}

    /// Called for every tag set on the span. The returned value is what the
    /// next listener sees and what is ultimately stored; return the input
    /// unchanged to pass the tag through.
    fn on_set_tag(
        &mut self,
        _info: &mut SpanContextInformation,
        _key: &str,
        value: TagValue,
    ) -> TagValue {
        value
    }

    /// Called once when the span finishes, with the final operation name
    /// and duration.
    fn on_finish(&mut self, _span: &mut SpanState, _operation_name: &str, _duration_nanos: u64) {}
}

/// Creates one [`SpanEventListener`] per span.
pub trait SpanEventListenerFactory: Send + Sync {
    /// Create the listener for a newly started span.
    fn create(&self) -> Box<dyn SpanEventListener>;
}

/// The mutable span state listeners operate on: the raw span, its context
/// information, and a mirror of all tags set so far.
///
/// Kept separate from the listener chain so that the chain can iterate
/// `&mut self.listeners` while handing each listener `&mut self.state`.
pub struct SpanState {
    delegate: Box<dyn Span>,
    info: SpanContextInformation,
    operation_name: String,
    tags: std::collections::HashMap<String, TagValue>,
}

impl SpanState {
    /// The trace id of the underlying span.
    pub fn trace_id(&self) -> TraceId {
        self.delegate.trace_id()
    }

    /// The span id of the underlying span.
    pub fn span_id(&self) -> SpanId {
        self.delegate.span_id()
    }

    /// The current operation name.
    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    /// The context information of this span.
    pub fn info(&self) -> &SpanContextInformation {
        &self.info
    }

    /// Mutable access to the context information.
    pub fn info_mut(&mut self) -> &mut SpanContextInformation {
        &mut self.info
    }

    /// All tags set on the span so far, after listener transformation.
    pub fn tags(&self) -> &std::collections::HashMap<String, TagValue> {
        &self.tags
    }

    /// Set a tag directly on the underlying span, without re-running the
    /// transformation chain. Listeners use this from their finish phase.
    pub fn set_tag(&mut self, key: &str, value: impl Into<TagValue>) {
        let value = value.into();
        self.tags.insert(key.to_owned(), value.clone());
        self.delegate.set_tag(key, value);
    }
}

/// A span flowing through the pipeline.
///
/// Finishing is guaranteed: if the wrapper is dropped without an explicit
/// [`finish`](SpanWrapper::finish), the finish phase runs from `Drop`, so
/// listeners holding per-span resources (an active profiling session, a
/// correlation entry) release them even when the request errors out.
pub struct SpanWrapper {
    state: SpanState,
    listeners: Vec<Box<dyn SpanEventListener>>,
    start: Instant,
    finished: bool,
}

impl SpanWrapper {
    pub(crate) fn start(
        delegate: Box<dyn Span>,
        kind: SpanKind,
        operation_name: &str,
        factories: &[Arc<dyn SpanEventListenerFactory>],
    ) -> Self {
        let mut wrapper = SpanWrapper {
            state: SpanState {
                delegate,
                info: SpanContextInformation::new(kind),
                operation_name: operation_name.to_owned(),
                tags: std::collections::HashMap::new(),
            },
            listeners: factories.iter().map(|f| f.create()).collect(),
            start: Instant::now(),
            finished: false,
        };
        for listener in wrapper.listeners.iter_mut() {
            listener.on_start(&mut wrapper.state);
        }
        wrapper
    }

    /// Set a tag, running it through every listener's transformation hook
    /// before it reaches the underlying span.
    pub fn set_tag(&mut self, key: &str, value: impl Into<TagValue>) {
        let mut value = value.into();
        for listener in self.listeners.iter_mut() {
            value = listener.on_set_tag(&mut self.state.info, key, value);
        }
        self.state.set_tag(key, value);
    }

    /// Rename the operation this span represents.
    pub fn set_operation_name(&mut self, name: &str) {
        self.state.operation_name = name.to_owned();
        self.state.delegate.set_operation_name(name);
    }

    /// The trace id of the underlying span.
    pub fn trace_id(&self) -> TraceId {
        self.state.trace_id()
    }

    /// The span id of the underlying span.
    pub fn span_id(&self) -> SpanId {
        self.state.span_id()
    }

    /// The context information accumulated for this span.
    pub fn context(&self) -> &SpanContextInformation {
        &self.state.info
    }

    /// Mutable access to the context information.
    pub fn context_mut(&mut self) -> &mut SpanContextInformation {
        &mut self.state.info
    }

    /// Finish the span, measuring the duration from its start.
    pub fn finish(mut self) {
        self.do_finish(None);
    }

    /// Finish the span with an explicit duration instead of the measured
    /// one. Useful for tests and for spans whose timing is tracked
    /// externally.
    pub fn finish_with_duration(mut self, duration_nanos: u64) {
        self.do_finish(Some(duration_nanos));
    }

    fn do_finish(&mut self, duration_override: Option<u64>) {
        if self.finished {
            return;
        }
        self.finished = true;
        let duration_nanos =
            duration_override.unwrap_or_else(|| self.start.elapsed().as_nanos() as u64);
        self.state.info.set_duration_nanos(duration_nanos);
        let operation_name = self.state.operation_name.clone();
        for listener in self.listeners.iter_mut() {
            listener.on_finish(&mut self.state, &operation_name, duration_nanos);
        }
        self.state.delegate.finish();
    }
}

impl Drop for SpanWrapper {
    fn drop(&mut self) {
        self.do_finish(None);
    }
}

/// A [`Tracer`] decorator that wraps every started span in a
/// [`SpanWrapper`] carrying the configured listener chain.
pub struct SpanWrappingTracer {
    delegate: Arc<dyn Tracer>,
    factories: Vec<Arc<dyn SpanEventListenerFactory>>,
}

impl SpanWrappingTracer {
    /// Wrap the given span source with an empty listener chain.
    pub fn new(delegate: Arc<dyn Tracer>) -> Self {
        SpanWrappingTracer {
            delegate,
            factories: Vec::new(),
        }
    }

    /// Append a listener factory to the chain. Listeners run in
    /// registration order in every phase.
    pub fn add_listener_factory(&mut self, factory: Arc<dyn SpanEventListenerFactory>) {
        self.factories.push(factory);
    }

    /// Start a wrapped span.
    pub fn start_span(&self, operation_name: &str, kind: SpanKind) -> SpanWrapper {
        let delegate = self.delegate.start_span(operation_name);
        SpanWrapper::start(delegate, kind, operation_name, &self.factories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockTracer;
    use std::sync::Mutex;

    #[derive(Clone)]
    struct EventRecorder {
        label: &'static str,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl SpanEventListener for EventRecorder {
        fn on_start(&mut self, _span: &mut SpanState) {
            self.events.lock().unwrap().push(format!("{}:start", self.label));
        }

        fn on_finish(&mut self, _span: &mut SpanState, operation_name: &str, _duration: u64) {
            self.events
                .lock()
                .unwrap()
                .push(format!("{}:finish:{operation_name}", self.label));
        }
    }

    impl SpanEventListenerFactory for EventRecorder {
        fn create(&self) -> Box<dyn SpanEventListener> {
            Box::new(self.clone())
        }
    }

    struct Redactor;

    impl SpanEventListener for Redactor {
        fn on_set_tag(
            &mut self,
            _info: &mut SpanContextInformation,
            key: &str,
            value: TagValue,
        ) -> TagValue {
            if key == "password" {
                TagValue::from("<redacted>")
            } else {
                value
            }
        }
    }

    impl SpanEventListenerFactory for Redactor {
        fn create(&self) -> Box<dyn SpanEventListener> {
            Box::new(Redactor)
        }
    }

    fn tracer_with(factories: Vec<Arc<dyn SpanEventListenerFactory>>) -> (SpanWrappingTracer, MockTracer) {
        let mock = MockTracer::new();
        let mut tracer = SpanWrappingTracer::new(Arc::new(mock.clone()));
        for factory in factories {
            tracer.add_listener_factory(factory);
        }
        (tracer, mock)
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let (tracer, _mock) = tracer_with(vec![
            Arc::new(EventRecorder {
                label: "a",
                events: Arc::clone(&events),
            }),
            Arc::new(EventRecorder {
                label: "b",
                events: Arc::clone(&events),
            }),
        ]);

        let mut span = tracer.start_span("op", SpanKind::Server);
        span.set_operation_name("renamed");
        span.finish();

        assert_eq!(
            *events.lock().unwrap(),
            vec!["a:start", "b:start", "a:finish:renamed", "b:finish:renamed"]
        );
    }

    #[test]
    fn tags_are_transformed_before_reaching_the_span() {
        let (tracer, mock) = tracer_with(vec![Arc::new(Redactor)]);

        let mut span = tracer.start_span("op", SpanKind::Server);
        span.set_tag("password", "hunter2");
        span.set_tag("user", "alice");
        span.finish();

        let finished = mock.finished_spans();
        assert_eq!(finished[0].tags["password"], TagValue::from("<redacted>"));
        assert_eq!(finished[0].tags["user"], TagValue::from("alice"));
    }

    #[test]
    fn dropping_a_span_finishes_it_once() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let (tracer, mock) = tracer_with(vec![Arc::new(EventRecorder {
            label: "a",
            events: Arc::clone(&events),
        })]);

        {
            let _span = tracer.start_span("op", SpanKind::Server);
        }

        assert_eq!(mock.finished_spans().len(), 1);
        assert_eq!(*events.lock().unwrap(), vec!["a:start", "a:finish:op"]);
    }

    #[test]
    fn explicit_duration_overrides_the_measured_one() {
        let (tracer, _mock) = tracer_with(vec![]);
        let span = tracer.start_span("op", SpanKind::Server);
        span.finish_with_duration(42);
        // Context is consumed with the span; the duration flows to listeners,
        // which is covered by the integration tests.
    }
}
