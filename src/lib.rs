//! Span instrumentation pipeline: listener chains, sampling, call tree
//! profiling and reporting around any span implementation.
//!
//! `spanpipe` wraps a span source (a [`Tracer`](api::Tracer)) so that
//! every span runs through a chain of listeners when it starts, whenever a
//! tag is set, and when it finishes. The built-in chain classifies spans,
//! decides via interceptors whether a span should be reported (rate
//! limits, name filters, `sampling.priority`), records a call tree for
//! qualifying spans, tracks per-operation response times, and fans
//! finished spans out to reporters, by default on a background thread.
//!
//! ```
//! use std::sync::Arc;
//! use spanpipe::api::{MockTracer, SpanKind};
//! use spanpipe::config::TracingConfig;
//! use spanpipe::pipeline::TracingPipeline;
//! use spanpipe::reporter::InMemorySpanReporter;
//!
//! let reporter = InMemorySpanReporter::new();
//! let pipeline = TracingPipeline::builder(Arc::new(MockTracer::new()))
//!     .with_config(
//!         TracingConfig::builder()
//!             .with_report_spans_async(false)
//!             .build(),
//!     )
//!     .with_reporter(Arc::new(reporter.clone()))
//!     .build();
//!
//! let mut span = pipeline.start_span("GET /hello", SpanKind::Server);
//! span.set_tag("http.status_code", 200i64);
//! span.finish();
//! pipeline.shutdown();
//!
//! assert_eq!(reporter.reported().len(), 1);
//! assert_eq!(reporter.reported()[0].name, "GET /hello");
//! ```
//!
//! Code running under a monitored span can contribute to the call tree
//! with [`Profiler::enter_scoped`](profiler::Profiler::enter_scoped), and
//! applications that prefer not to pass spans around can use the
//! [`RequestMonitor`](monitor::RequestMonitor) front door.

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod listeners;
pub mod metrics;
pub mod monitor;
pub mod pipeline;
pub mod profiler;
pub mod rate_limiter;
pub mod reporter;
pub mod sampling;
pub mod wrapper;

pub use api::{Span, SpanKind, TagValue, Tracer};
pub use config::TracingConfig;
pub use context::SpanContextInformation;
pub use error::{Error, PipelineResult};
pub use pipeline::{PipelineBuilder, TracingPipeline};
pub use profiler::{CallTreeNode, Profiler};
pub use reporter::SpanReporter;
pub use wrapper::{SpanEventListener, SpanEventListenerFactory, SpanWrapper};
