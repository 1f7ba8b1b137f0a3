//! The seam between the pipeline and the underlying span implementation.
//!
//! The pipeline never constructs business spans itself; it wraps spans
//! supplied by a [`Tracer`] collaborator and forwards `set_tag`/`finish`
//! calls after running them through the listener chain. Any tracing
//! implementation can be plugged in by implementing [`Tracer`] and [`Span`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use rand::Rng;
use serde::Serialize;

/// Tag carrying the call tree serialized as JSON.
pub const CALL_TREE_JSON: &str = "call_tree_json";
/// Tag carrying the call tree rendered as indented text.
pub const CALL_TREE_ASCII: &str = "call_tree_ascii";
/// Tag a span source can set to `0` to opt a span out of sampling.
pub const SAMPLING_PRIORITY: &str = "sampling.priority";
/// Tag naming the operation sub-type of a span, e.g. `jdbc` or `http`.
pub const OPERATION_SUB_TYPE: &str = "type";
/// Tag mirroring the span kind (`server` or `client`) for span sources that
/// only communicate the kind via tags.
pub const SPAN_KIND: &str = "span.kind";

/// A 16-byte trace identifier, rendered as 32 lowercase hex characters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TraceId(u128);

impl TraceId {
    /// The invalid (all zero) trace id used by non-recording spans.
    pub const INVALID: TraceId = TraceId(0);

    /// Create a trace id from its raw value.
    pub const fn from_u128(value: u128) -> Self {
        TraceId(value)
    }

    /// Generate a random trace id.
    pub fn random() -> Self {
        TraceId(rand::thread_rng().gen())
    }

    /// The raw value of this trace id.
    pub const fn to_u128(self) -> u128 {
        self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// An 8-byte span identifier, rendered as 16 lowercase hex characters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SpanId(u64);

impl SpanId {
    /// The invalid (all zero) span id used by non-recording spans.
    pub const INVALID: SpanId = SpanId(0);

    /// Create a span id from its raw value.
    pub const fn from_u64(value: u64) -> Self {
        SpanId(value)
    }

    /// Generate a random span id.
    pub fn random() -> Self {
        SpanId(rand::thread_rng().gen())
    }

    /// The raw value of this span id.
    pub const fn to_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// The kind of operation a span represents, declared when the span starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpanKind {
    /// The span covers the server side of an incoming request.
    Server,
    /// The span covers an outgoing request to an external system.
    Client,
    /// The span covers an internal operation.
    Internal,
}

/// A tag value attached to a span.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TagValue {
    /// Boolean value.
    Bool(bool),
    /// Signed integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// String value.
    String(String),
}

impl TagValue {
    /// The contained string, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TagValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// The contained integer, if this is an integer value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TagValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Bool(v) => v.fmt(f),
            TagValue::Int(v) => v.fmt(f),
            TagValue::Float(v) => v.fmt(f),
            TagValue::String(v) => v.fmt(f),
        }
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        TagValue::Bool(value)
    }
}

impl From<i32> for TagValue {
    fn from(value: i32) -> Self {
        TagValue::Int(value.into())
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        TagValue::Int(value)
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        TagValue::Float(value)
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::String(value.to_owned())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::String(value)
    }
}

/// A raw span supplied by the span source.
///
/// The pipeline calls these primitives after its listener chain has run;
/// implementations should not assume anything about call ordering beyond
/// "tags and renames happen between construction and `finish`".
pub trait Span: Send {
    /// The trace this span belongs to.
    fn trace_id(&self) -> TraceId;
    /// The identifier of this span.
    fn span_id(&self) -> SpanId;
    /// Rename the operation this span represents.
    fn set_operation_name(&mut self, name: &str);
    /// Attach or overwrite a tag.
    fn set_tag(&mut self, key: &str, value: TagValue);
    /// Mark the span as finished. Called exactly once by the pipeline.
    fn finish(&mut self);
}

/// The span source the pipeline wraps.
pub trait Tracer: Send + Sync {
    /// Start a new raw span.
    fn start_span(&self, operation_name: &str) -> Box<dyn Span>;
}

/// A tracer that produces non-recording spans, used when no span
/// implementation is configured.
#[derive(Clone, Debug, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn start_span(&self, _operation_name: &str) -> Box<dyn Span> {
        Box::new(NoopSpan)
    }
}

/// The non-recording span produced by [`NoopTracer`].
#[derive(Debug)]
pub struct NoopSpan;

impl Span for NoopSpan {
    fn trace_id(&self) -> TraceId {
        TraceId::INVALID
    }

    fn span_id(&self) -> SpanId {
        SpanId::INVALID
    }

    fn set_operation_name(&mut self, _name: &str) {}

    fn set_tag(&mut self, _key: &str, _value: TagValue) {}

    fn finish(&mut self) {}
}

/// A finished span recorded by [`MockTracer`].
#[derive(Clone, Debug)]
pub struct FinishedSpan {
    /// The operation name at finish time.
    pub operation_name: String,
    /// The trace id of the span.
    pub trace_id: TraceId,
    /// The id of the span.
    pub span_id: SpanId,
    /// All tags set on the span, post listener transformation.
    pub tags: HashMap<String, TagValue>,
}

/// An in-memory span source that records finished spans for inspection.
///
/// Clones share the same storage, so a clone can be handed to the pipeline
/// while the original is used to assert on the outcome.
#[derive(Clone, Debug, Default)]
pub struct MockTracer {
    finished: Arc<Mutex<Vec<FinishedSpan>>>,
}

impl MockTracer {
    /// Create an empty mock tracer.
    pub fn new() -> Self {
        MockTracer::default()
    }

    /// All spans finished so far.
    pub fn finished_spans(&self) -> Vec<FinishedSpan> {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Discard all recorded spans.
    pub fn reset(&self) {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Tracer for MockTracer {
    fn start_span(&self, operation_name: &str) -> Box<dyn Span> {
        Box::new(MockSpan {
            sink: Arc::clone(&self.finished),
            operation_name: operation_name.to_owned(),
            trace_id: TraceId::random(),
            span_id: SpanId::random(),
            tags: HashMap::new(),
            finished: false,
        })
    }
}

#[derive(Debug)]
struct MockSpan {
    sink: Arc<Mutex<Vec<FinishedSpan>>>,
    operation_name: String,
    trace_id: TraceId,
    span_id: SpanId,
    tags: HashMap<String, TagValue>,
    finished: bool,
}

impl Span for MockSpan {
    fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    fn span_id(&self) -> SpanId {
        self.span_id
    }

    fn set_operation_name(&mut self, name: &str) {
        self.operation_name = name.to_owned();
    }

    fn set_tag(&mut self, key: &str, value: TagValue) {
        self.tags.insert(key.to_owned(), value);
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(FinishedSpan {
                operation_name: self.operation_name.clone(),
                trace_id: self.trace_id,
                span_id: self.span_id,
                tags: self.tags.clone(),
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_render_as_fixed_width_hex() {
        assert_eq!(TraceId::from_u128(0xab).to_string().len(), 32);
        assert_eq!(SpanId::from_u64(0xab).to_string(), "00000000000000ab");
    }

    #[test]
    fn mock_tracer_records_finished_spans_only() {
        let tracer = MockTracer::new();
        let mut span = tracer.start_span("one");
        span.set_tag("k", TagValue::from("v"));
        assert!(tracer.finished_spans().is_empty());

        span.finish();
        span.finish();

        let finished = tracer.finished_spans();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].operation_name, "one");
        assert_eq!(finished[0].tags["k"], TagValue::from("v"));
    }

    #[test]
    fn noop_span_has_invalid_ids() {
        let mut span = NoopTracer.start_span("ignored");
        assert_eq!(span.trace_id(), TraceId::INVALID);
        span.finish();
    }
}
