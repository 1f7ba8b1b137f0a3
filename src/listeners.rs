//! The built-in span event listeners.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::IpAddr;

use crate::api::{OPERATION_SUB_TYPE, SPAN_KIND, TagValue};
use crate::config::TracingConfig;
use crate::context::{OperationType, ReadbackSpan, SpanContextInformation};
use crate::metrics::RequestMetrics;
use crate::reporter::ReporterRegistry;
use crate::wrapper::{SpanEventListener, SpanEventListenerFactory, SpanState};

/// Keeps the span's context information in sync with classification tags:
/// `type` feeds the operation sub-type and `span.kind` reclassifies spans
/// whose kind was not known at start.
#[derive(Clone, Debug, Default)]
pub struct SpanContextSpanEventListener;

impl SpanEventListener for SpanContextSpanEventListener {
    fn on_set_tag(
        &mut self,
        info: &mut SpanContextInformation,
        key: &str,
        value: TagValue,
    ) -> TagValue {
        match key {
            OPERATION_SUB_TYPE => {
                if let Some(sub_type) = value.as_str() {
                    info.set_operation_sub_type(sub_type);
                }
            }
            SPAN_KIND if info.operation_type() == OperationType::Other => {
                match value.as_str() {
                    Some("server") => info.set_operation_type(OperationType::Server),
                    Some("client") => info.set_operation_type(OperationType::External),
                    _ => {}
                }
            }
            _ => {}
        }
        value
    }
}

impl SpanEventListenerFactory for SpanContextSpanEventListener {
    fn create(&self) -> Box<dyn SpanEventListener> {
        Box::new(self.clone())
    }
}

const IP_TAG_KEYS: [&str; 3] = ["peer.address", "peer.ipv4", "peer.ipv6"];

/// Masks the host part of IP-valued tags: the last octet of an IPv4
/// address and the last 80 bits of an IPv6 address are zeroed. Values that
/// do not parse as an address pass through unchanged.
#[derive(Clone, Debug)]
pub struct AnonymizingSpanEventListener {
    config: TracingConfig,
}

impl AnonymizingSpanEventListener {
    /// Create the listener against the given configuration.
    pub fn new(config: &TracingConfig) -> Self {
        AnonymizingSpanEventListener {
            config: config.clone(),
        }
    }
}

fn anonymize_ip(value: &str) -> Option<String> {
    match value.parse::<IpAddr>().ok()? {
        IpAddr::V4(ip) => {
            let mut octets = ip.octets();
            octets[3] = 0;
            Some(std::net::Ipv4Addr::from(octets).to_string())
        }
        IpAddr::V6(ip) => {
            let mut bytes = ip.octets();
            for byte in &mut bytes[6..] {
                *byte = 0;
            }
            Some(std::net::Ipv6Addr::from(bytes).to_string())
        }
    }
}

impl SpanEventListener for AnonymizingSpanEventListener {
    fn on_set_tag(
        &mut self,
        _info: &mut SpanContextInformation,
        key: &str,
        value: TagValue,
    ) -> TagValue {
        if !self.config.anonymize_ips().get() || !IP_TAG_KEYS.contains(&key) {
            return value;
        }
        match value.as_str().and_then(anonymize_ip) {
            Some(anonymized) => TagValue::from(anonymized),
            None => value,
        }
    }
}

impl SpanEventListenerFactory for AnonymizingSpanEventListener {
    fn create(&self) -> Box<dyn SpanEventListener> {
        Box::new(self.clone())
    }
}

thread_local! {
    static CORRELATION: RefCell<HashMap<&'static str, String>> = RefCell::new(HashMap::new());
}

/// The correlation key under which the active trace id is published.
pub const CORRELATION_TRACE_ID: &str = "trace_id";
/// The correlation key under which the active span id is published.
pub const CORRELATION_SPAN_ID: &str = "span_id";

/// The correlation value for the given key on the current thread, while a
/// span is active. Log layers can pull these to stamp log lines with the
/// active trace.
pub fn correlation_value(key: &str) -> Option<String> {
    CORRELATION.with(|cell| cell.borrow().get(key).cloned())
}

/// Publishes the active trace and span ids in thread-local storage for the
/// lifetime of the span.
#[derive(Clone, Debug, Default)]
pub struct CorrelationSpanEventListener;

impl SpanEventListener for CorrelationSpanEventListener {
    fn on_start(&mut self, span: &mut SpanState) {
        let trace_id = span.trace_id().to_string();
        let span_id = span.span_id().to_string();
        CORRELATION.with(|cell| {
            let mut correlation = cell.borrow_mut();
            correlation.insert(CORRELATION_TRACE_ID, trace_id);
            correlation.insert(CORRELATION_SPAN_ID, span_id);
        });
    }

    fn on_finish(&mut self, _span: &mut SpanState, _operation_name: &str, _duration_nanos: u64) {
        CORRELATION.with(|cell| {
            let mut correlation = cell.borrow_mut();
            correlation.remove(CORRELATION_TRACE_ID);
            correlation.remove(CORRELATION_SPAN_ID);
        });
    }
}

impl SpanEventListenerFactory for CorrelationSpanEventListener {
    fn create(&self) -> Box<dyn SpanEventListener> {
        Box::new(self.clone())
    }
}

/// Records server span durations in the per-operation response time timer
/// and attaches that timer to the span context, where the percentile
/// exclusion check finds it.
#[derive(Clone, Debug)]
pub struct ServerRequestMetricsSpanEventListener {
    metrics: RequestMetrics,
}

impl ServerRequestMetricsSpanEventListener {
    /// Create the listener writing into the given metrics registry.
    pub fn new(metrics: &RequestMetrics) -> Self {
        ServerRequestMetricsSpanEventListener {
            metrics: metrics.clone(),
        }
    }
}

impl SpanEventListener for ServerRequestMetricsSpanEventListener {
    fn on_finish(&mut self, span: &mut SpanState, operation_name: &str, duration_nanos: u64) {
        if !span.info().is_server_request() || operation_name.is_empty() {
            return;
        }
        let timer = self.metrics.timer(operation_name);
        timer.record(duration_nanos);
        span.info_mut().set_timer_for_this_request(timer);
    }
}

impl SpanEventListenerFactory for ServerRequestMetricsSpanEventListener {
    fn create(&self) -> Box<dyn SpanEventListener> {
        Box::new(self.clone())
    }
}

/// Records client span durations in a per-sub-type external request timer.
#[derive(Clone, Debug)]
pub struct ExternalRequestMetricsSpanEventListener {
    metrics: RequestMetrics,
}

impl ExternalRequestMetricsSpanEventListener {
    /// Create the listener writing into the given metrics registry.
    pub fn new(metrics: &RequestMetrics) -> Self {
        ExternalRequestMetricsSpanEventListener {
            metrics: metrics.clone(),
        }
    }
}

impl SpanEventListener for ExternalRequestMetricsSpanEventListener {
    fn on_finish(&mut self, span: &mut SpanState, _operation_name: &str, duration_nanos: u64) {
        if !span.info().is_external_request() {
            return;
        }
        let sub_type = span.info().operation_sub_type().unwrap_or("other");
        self.metrics.external_timer(sub_type).record(duration_nanos);
    }
}

impl SpanEventListenerFactory for ExternalRequestMetricsSpanEventListener {
    fn create(&self) -> Box<dyn SpanEventListener> {
        Box::new(self.clone())
    }
}

/// Snapshots finishing spans into a [`ReadbackSpan`] for the reporting
/// listener, but only when the span will be reported and at least one
/// reporter wants it.
#[derive(Clone)]
pub struct ReadbackSpanEventListener {
    registry: ReporterRegistry,
}

impl ReadbackSpanEventListener {
    /// Create the listener asking the given registry which spans to
    /// snapshot.
    pub fn new(registry: &ReporterRegistry) -> Self {
        ReadbackSpanEventListener {
            registry: registry.clone(),
        }
    }
}

impl SpanEventListener for ReadbackSpanEventListener {
    fn on_finish(&mut self, span: &mut SpanState, operation_name: &str, duration_nanos: u64) {
        if !span.info().is_report() || !self.registry.is_any_reporter_active(span.info()) {
            return;
        }
        let readback = ReadbackSpan {
            name: operation_name.to_owned(),
            trace_id: span.trace_id().to_string(),
            span_id: span.span_id().to_string(),
            duration_nanos,
            tags: span.tags().clone(),
        };
        span.info_mut().set_readback(readback);
    }
}

impl SpanEventListenerFactory for ReadbackSpanEventListener {
    fn create(&self) -> Box<dyn SpanEventListener> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SpanKind;
    use std::sync::Arc;

    #[test]
    fn type_tag_feeds_the_operation_sub_type() {
        let mut listener = SpanContextSpanEventListener;
        let mut info = SpanContextInformation::new(SpanKind::Client);
        listener.on_set_tag(&mut info, OPERATION_SUB_TYPE, TagValue::from("jdbc"));
        assert_eq!(info.operation_sub_type(), Some("jdbc"));
    }

    #[test]
    fn span_kind_tag_reclassifies_unknown_spans_only() {
        let mut listener = SpanContextSpanEventListener;

        let mut unknown = SpanContextInformation::new(SpanKind::Internal);
        listener.on_set_tag(&mut unknown, SPAN_KIND, TagValue::from("server"));
        assert!(unknown.is_server_request());

        let mut server = SpanContextInformation::new(SpanKind::Server);
        listener.on_set_tag(&mut server, SPAN_KIND, TagValue::from("client"));
        assert!(server.is_server_request());
    }

    #[test]
    fn ipv4_addresses_lose_their_last_octet() {
        assert_eq!(anonymize_ip("192.168.17.42").as_deref(), Some("192.168.17.0"));
    }

    #[test]
    fn ipv6_addresses_lose_their_host_part() {
        let anonymized = anonymize_ip("2001:db8:1234:5678:9abc:def0:1234:5678").unwrap();
        assert_eq!(anonymized, "2001:db8:1234::");
    }

    #[test]
    fn non_addresses_pass_through() {
        assert_eq!(anonymize_ip("db.internal"), None);

        let config = TracingConfig::default();
        let mut listener = AnonymizingSpanEventListener::new(&config);
        let mut info = SpanContextInformation::new(SpanKind::Client);
        let value = listener.on_set_tag(&mut info, "peer.address", TagValue::from("db.internal"));
        assert_eq!(value, TagValue::from("db.internal"));
    }

    #[test]
    fn anonymization_can_be_disabled() {
        let config = TracingConfig::builder().with_anonymize_ips(false).build();
        let mut listener = AnonymizingSpanEventListener::new(&config);
        let mut info = SpanContextInformation::new(SpanKind::Client);
        let value = listener.on_set_tag(&mut info, "peer.ipv4", TagValue::from("10.0.0.7"));
        assert_eq!(value, TagValue::from("10.0.0.7"));
    }

    fn wrapping_tracer(factory: Arc<dyn SpanEventListenerFactory>) -> crate::wrapper::SpanWrappingTracer {
        let mut tracer =
            crate::wrapper::SpanWrappingTracer::new(Arc::new(crate::api::MockTracer::new()));
        tracer.add_listener_factory(factory);
        tracer
    }

    #[test]
    fn server_metrics_listener_records_server_spans_only() {
        let metrics = RequestMetrics::new();
        let tracer = wrapping_tracer(Arc::new(ServerRequestMetricsSpanEventListener::new(
            &metrics,
        )));

        tracer
            .start_span("GET /widgets", SpanKind::Server)
            .finish_with_duration(5_000_000);
        tracer
            .start_span("GET /widgets", SpanKind::Client)
            .finish_with_duration(5_000_000);

        assert_eq!(metrics.timer("GET /widgets").count(), 1);
    }

    #[test]
    fn external_metrics_are_keyed_by_sub_type() {
        let metrics = RequestMetrics::new();
        let tracer = wrapping_tracer(Arc::new(ExternalRequestMetricsSpanEventListener::new(
            &metrics,
        )));

        let mut jdbc = tracer.start_span("SELECT", SpanKind::Client);
        jdbc.context_mut().set_operation_sub_type("jdbc");
        jdbc.finish_with_duration(1_000_000);
        tracer
            .start_span("untyped", SpanKind::Client)
            .finish_with_duration(1_000_000);

        assert_eq!(metrics.external_timer("jdbc").count(), 1);
        assert_eq!(metrics.external_timer("other").count(), 1);
    }

    #[test]
    fn correlation_values_exist_only_while_the_span_is_active() {
        let tracer = wrapping_tracer(Arc::new(CorrelationSpanEventListener));
        assert_eq!(correlation_value(CORRELATION_TRACE_ID), None);

        let span = tracer.start_span("op", SpanKind::Server);
        let published = correlation_value(CORRELATION_TRACE_ID).expect("trace id is published");
        assert_eq!(published, span.trace_id().to_string());
        span.finish();

        assert_eq!(correlation_value(CORRELATION_TRACE_ID), None);
        assert_eq!(correlation_value(CORRELATION_SPAN_ID), None);
    }
}
