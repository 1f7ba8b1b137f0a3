//! Convenience front door for instrumenting request handlers.
//!
//! [`RequestMonitor`] pairs a `monitor_start`/`monitor_stop` call around a
//! request, keeping the active span on a thread-local stack so nested
//! monitored requests (a server request issuing client requests) work
//! without threading the span through every call.

use std::cell::RefCell;
use std::sync::Arc;

use tracing::debug;

use crate::api::{OPERATION_SUB_TYPE, SpanKind, TagValue};
use crate::wrapper::{SpanWrapper, SpanWrappingTracer};

/// A description of a request about to be monitored.
#[derive(Debug)]
pub struct MonitoredRequest {
    name: String,
    kind: SpanKind,
    sub_type: Option<String>,
    tags: Vec<(String, TagValue)>,
}

impl MonitoredRequest {
    /// Describe a request with the given operation name and kind.
    pub fn new(name: impl Into<String>, kind: SpanKind) -> Self {
        MonitoredRequest {
            name: name.into(),
            kind,
            sub_type: None,
            tags: Vec::new(),
        }
    }

    /// Set the operation sub-type, e.g. `jdbc` for a database request.
    pub fn with_sub_type(mut self, sub_type: impl Into<String>) -> Self {
        self.sub_type = Some(sub_type.into());
        self
    }

    /// Attach a tag to the span as soon as it starts.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }
}

thread_local! {
    static ACTIVE_SPANS: RefCell<Vec<SpanWrapper>> = const { RefCell::new(Vec::new()) };
}

/// Starts and stops monitored requests against the pipeline's tracer.
#[derive(Clone)]
pub struct RequestMonitor {
    tracer: Arc<SpanWrappingTracer>,
}

impl RequestMonitor {
    pub(crate) fn new(tracer: Arc<SpanWrappingTracer>) -> Self {
        RequestMonitor { tracer }
    }

    /// Start monitoring a request: a span is started and pushed onto this
    /// thread's stack of active spans.
    pub fn monitor_start(&self, request: MonitoredRequest) {
        let mut span = self.tracer.start_span(&request.name, request.kind);
        if let Some(sub_type) = &request.sub_type {
            span.set_tag(OPERATION_SUB_TYPE, sub_type.as_str());
        }
        for (key, value) in request.tags {
            span.set_tag(&key, value);
        }
        ACTIVE_SPANS.with(|cell| cell.borrow_mut().push(span));
    }

    /// Finish the most recently started request on this thread.
    pub fn monitor_stop(&self) {
        let span = ACTIVE_SPANS.with(|cell| cell.borrow_mut().pop());
        match span {
            Some(span) => span.finish(),
            None => debug!("monitor_stop called without a matching monitor_start"),
        }
    }

    /// Run a closure against the currently active span, if there is one.
    pub fn with_current_span<R>(&self, f: impl FnOnce(&mut SpanWrapper) -> R) -> Option<R> {
        ACTIVE_SPANS.with(|cell| cell.borrow_mut().last_mut().map(f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockTracer;

    fn monitor() -> (RequestMonitor, MockTracer) {
        let mock = MockTracer::new();
        let tracer = SpanWrappingTracer::new(Arc::new(mock.clone()));
        (RequestMonitor::new(Arc::new(tracer)), mock)
    }

    #[test]
    fn start_and_stop_bracket_one_span() {
        let (monitor, mock) = monitor();
        monitor.monitor_start(
            MonitoredRequest::new("GET /widgets", SpanKind::Server)
                .with_tag("http.method", "GET"),
        );
        assert!(mock.finished_spans().is_empty());

        monitor.monitor_stop();
        let finished = mock.finished_spans();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].operation_name, "GET /widgets");
        assert_eq!(finished[0].tags["http.method"], TagValue::from("GET"));
    }

    #[test]
    fn nested_requests_finish_inside_out() {
        let (monitor, mock) = monitor();
        monitor.monitor_start(MonitoredRequest::new("outer", SpanKind::Server));
        monitor.monitor_start(
            MonitoredRequest::new("inner", SpanKind::Client).with_sub_type("jdbc"),
        );

        monitor.monitor_stop();
        monitor.monitor_stop();

        let names: Vec<_> = mock
            .finished_spans()
            .iter()
            .map(|span| span.operation_name.clone())
            .collect();
        assert_eq!(names, vec!["inner", "outer"]);
    }

    #[test]
    fn with_current_span_targets_the_innermost_request() {
        let (monitor, mock) = monitor();
        assert!(monitor.with_current_span(|_| ()).is_none());

        monitor.monitor_start(MonitoredRequest::new("outer", SpanKind::Server));
        monitor.monitor_start(MonitoredRequest::new("inner", SpanKind::Internal));
        monitor
            .with_current_span(|span| span.set_tag("marker", true))
            .expect("a span is active");
        monitor.monitor_stop();
        monitor.monitor_stop();

        let finished = mock.finished_spans();
        assert_eq!(finished[0].operation_name, "inner");
        assert_eq!(finished[0].tags["marker"], TagValue::from(true));
        assert!(!finished[1].tags.contains_key("marker"));
    }

    #[test]
    fn unmatched_stop_is_tolerated() {
        let (monitor, mock) = monitor();
        monitor.monitor_stop();
        assert!(mock.finished_spans().is_empty());
    }
}
