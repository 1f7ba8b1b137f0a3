//! Span reporters and the dispatch machinery feeding them.
//!
//! Reporters receive [`ReadbackSpan`] snapshots, either inline on the
//! request thread or via a bounded queue drained by a dedicated dispatcher
//! thread. A full queue drops the span rather than blocking the request.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::api::CALL_TREE_JSON;
use crate::config::TracingConfig;
use crate::context::{ReadbackSpan, SpanContextInformation};
use crate::error::PipelineResult;
use crate::wrapper::{SpanEventListener, SpanEventListenerFactory, SpanState};

/// How many spans the asynchronous dispatch queue buffers before dropping.
const REPORT_QUEUE_SIZE: usize = 2_048;

/// How long shutdown waits for the dispatcher to drain its queue.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A sink for finished spans.
pub trait SpanReporter: Send + Sync {
    /// Called once when the reporter is registered.
    fn init(&self, _config: &TracingConfig) {}

    /// Whether this reporter currently wants the given span. When no
    /// registered reporter is active, the snapshot is not even built.
    fn is_active(&self, _info: &SpanContextInformation) -> bool {
        true
    }

    /// Deliver one span.
    fn report(&self, span: &ReadbackSpan) -> PipelineResult<()>;

    /// A stable name used in failure diagnostics.
    fn name(&self) -> &'static str {
        "anonymous"
    }
}

enum DispatchMessage {
    Report {
        reporter: Arc<dyn SpanReporter>,
        span: ReadbackSpan,
    },
    Shutdown(SyncSender<()>),
}

/// Hands spans to reporters on a dedicated thread.
struct ReportDispatcher {
    sender: SyncSender<DispatchMessage>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    is_shutdown: AtomicBool,
    dropped_span_count: AtomicUsize,
}

impl ReportDispatcher {
    fn new() -> Self {
        let (sender, receiver) = mpsc::sync_channel(REPORT_QUEUE_SIZE);
        let handle = thread::Builder::new()
            .name("spanpipe-report-dispatcher".to_owned())
            .spawn(move || dispatcher_loop(receiver))
            .expect("failed to spawn the report dispatcher thread");
        ReportDispatcher {
            sender,
            handle: Mutex::new(Some(handle)),
            is_shutdown: AtomicBool::new(false),
            dropped_span_count: AtomicUsize::new(0),
        }
    }

    fn dispatch(&self, reporter: Arc<dyn SpanReporter>, span: ReadbackSpan) {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return;
        }
        let result = self
            .sender
            .try_send(DispatchMessage::Report { reporter, span });
        if result.is_err() {
            let dropped = self.dropped_span_count.fetch_add(1, Ordering::Relaxed);
            if dropped == 0 {
                warn!(
                    "the report queue is full; dropping spans (this warning is only logged once)"
                );
            }
        }
    }

    fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        let (ack_sender, ack_receiver) = mpsc::sync_channel(1);
        if self.sender.send(DispatchMessage::Shutdown(ack_sender)).is_ok()
            && ack_receiver.recv_timeout(SHUTDOWN_TIMEOUT).is_err()
        {
            warn!("the report dispatcher did not drain its queue in time");
        }
        if let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = handle.join();
        }
        let dropped = self.dropped_span_count.load(Ordering::Relaxed);
        if dropped > 0 {
            warn!(dropped, "spans were dropped because the report queue was full");
        }
    }
}

fn dispatcher_loop(receiver: Receiver<DispatchMessage>) {
    while let Ok(message) = receiver.recv() {
        match message {
            DispatchMessage::Report { reporter, span } => deliver(&reporter, &span),
            DispatchMessage::Shutdown(ack) => {
                let _ = ack.send(());
                return;
            }
        }
    }
}

/// Deliver one span to one reporter, containing both error returns and
/// panics so a faulty reporter can neither unwind into the request thread
/// nor kill the dispatcher.
fn deliver(reporter: &Arc<dyn SpanReporter>, span: &ReadbackSpan) {
    match catch_unwind(AssertUnwindSafe(|| reporter.report(span))) {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            warn!(reporter = reporter.name(), %error, "a span reporter failed");
        }
        Err(_) => {
            warn!(reporter = reporter.name(), "a span reporter panicked");
        }
    }
}

struct RegistryInner {
    config: TracingConfig,
    reporters: RwLock<Vec<Arc<dyn SpanReporter>>>,
    dispatcher: ReportDispatcher,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        self.dispatcher.shutdown();
    }
}

/// The set of registered reporters plus their shared dispatcher.
///
/// Cheap to clone; the dispatcher shuts down when the last clone drops.
#[derive(Clone)]
pub struct ReporterRegistry {
    inner: Arc<RegistryInner>,
}

impl ReporterRegistry {
    /// Create an empty registry.
    pub fn new(config: &TracingConfig) -> Self {
        ReporterRegistry {
            inner: Arc::new(RegistryInner {
                config: config.clone(),
                reporters: RwLock::new(Vec::new()),
                dispatcher: ReportDispatcher::new(),
            }),
        }
    }

    /// Register a reporter. It receives every subsequently reported span
    /// for which it is active.
    pub fn add_reporter(&self, reporter: Arc<dyn SpanReporter>) {
        reporter.init(&self.inner.config);
        self.inner
            .reporters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(reporter);
    }

    /// Whether any registered reporter wants the given span.
    pub fn is_any_reporter_active(&self, info: &SpanContextInformation) -> bool {
        self.inner
            .reporters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|reporter| reporter.is_active(info))
    }

    /// Stop the dispatcher after draining queued spans. Spans reported
    /// after shutdown are silently discarded.
    pub fn shutdown(&self) {
        self.inner.dispatcher.shutdown();
    }

    fn active_reporters(&self, info: &SpanContextInformation) -> Vec<Arc<dyn SpanReporter>> {
        self.inner
            .reporters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|reporter| reporter.is_active(info))
            .cloned()
            .collect()
    }
}

/// The terminal listener of the chain: takes the readback snapshot of a
/// finishing span and hands it to every active reporter, asynchronously or
/// inline depending on configuration.
#[derive(Clone)]
pub struct ReportingSpanEventListener {
    config: TracingConfig,
    registry: ReporterRegistry,
}

impl ReportingSpanEventListener {
    /// Create the listener feeding the given registry.
    pub fn new(config: &TracingConfig, registry: &ReporterRegistry) -> Self {
        ReportingSpanEventListener {
            config: config.clone(),
            registry: registry.clone(),
        }
    }
}

impl SpanEventListener for ReportingSpanEventListener {
    fn on_finish(&mut self, span: &mut SpanState, operation_name: &str, _duration_nanos: u64) {
        if !span.info().is_report() {
            debug!(operation_name, "span will not be reported");
            return;
        }
        let Some(readback) = span.info_mut().take_readback() else {
            debug!(operation_name, "no reporter wanted this span");
            return;
        };
        let report_async = self.config.report_spans_async().get();
        for reporter in self.registry.active_reporters(span.info()) {
            if report_async {
                self.registry
                    .inner
                    .dispatcher
                    .dispatch(reporter, readback.clone());
            } else {
                deliver(&reporter, &readback);
            }
        }
    }
}

impl SpanEventListenerFactory for ReportingSpanEventListener {
    fn create(&self) -> Box<dyn SpanEventListener> {
        Box::new(self.clone())
    }
}

/// Logs reported spans, active only while the `log_spans` configuration
/// value is set.
#[derive(Default)]
pub struct LoggingSpanReporter {
    config: Mutex<Option<TracingConfig>>,
}

impl LoggingSpanReporter {
    /// Create the reporter. It stays inactive until it is registered and
    /// `log_spans` is enabled.
    pub fn new() -> Self {
        LoggingSpanReporter::default()
    }
}

impl SpanReporter for LoggingSpanReporter {
    fn init(&self, config: &TracingConfig) {
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = Some(config.clone());
    }

    fn is_active(&self, _info: &SpanContextInformation) -> bool {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, |config| config.log_spans().get())
    }

    fn report(&self, span: &ReadbackSpan) -> PipelineResult<()> {
        let mut lines = format!(
            "-- span report --\nname:     {}\ntrace.id: {}\nspan.id:  {}\nduration: {} ns\n",
            span.name, span.trace_id, span.span_id, span.duration_nanos
        );
        let mut tags: Vec<_> = span.tags.iter().collect();
        tags.sort_by_key(|(key, _)| key.as_str());
        for (key, value) in tags {
            // The JSON call tree is bulky and redundant next to the ascii one.
            if key == CALL_TREE_JSON {
                continue;
            }
            lines.push_str(&format!("{key}: {value}\n"));
        }
        info!("{lines}");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "LoggingSpanReporter"
    }
}

/// A reporter that stores spans in memory, for tests and examples.
///
/// Clones share the same storage.
#[derive(Clone, Default)]
pub struct InMemorySpanReporter {
    spans: Arc<Mutex<Vec<ReadbackSpan>>>,
}

impl InMemorySpanReporter {
    /// Create an empty reporter.
    pub fn new() -> Self {
        InMemorySpanReporter::default()
    }

    /// All spans reported so far.
    pub fn reported(&self) -> Vec<ReadbackSpan> {
        self.spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Discard all stored spans.
    pub fn reset(&self) {
        self.spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl SpanReporter for InMemorySpanReporter {
    fn report(&self, span: &ReadbackSpan) -> PipelineResult<()> {
        self.spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(span.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "InMemorySpanReporter"
    }
}
