//! Per-span state threaded through the listener chain.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::api::{SpanKind, TagValue};
use crate::metrics::Timer;
use crate::profiler::CallTreeNode;

/// Broad classification of the operation a span covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationType {
    /// The server side of an incoming request.
    Server,
    /// An outgoing request to an external system.
    External,
    /// Anything else.
    Other,
}

impl OperationType {
    pub(crate) fn from_kind(kind: SpanKind) -> Self {
        match kind {
            SpanKind::Server => OperationType::Server,
            SpanKind::Client => OperationType::External,
            SpanKind::Internal => OperationType::Other,
        }
    }
}

/// State associated 1:1 with a span for its entire lifetime.
///
/// Created when the span starts, mutated by the listeners running on the
/// request's thread, dropped together with the span. Never shared across
/// threads, so no locking is involved.
#[derive(Debug)]
pub struct SpanContextInformation {
    sampled: bool,
    operation_type: OperationType,
    operation_sub_type: Option<String>,
    pre_execution_context: Option<PreExecutionInterceptorContext>,
    post_execution_context: Option<PostExecutionInterceptorContext>,
    call_tree: Option<CallTreeNode>,
    duration_nanos: u64,
    timer_for_this_request: Option<Arc<Timer>>,
    readback: Option<ReadbackSpan>,
}

impl SpanContextInformation {
    pub(crate) fn new(kind: SpanKind) -> Self {
        SpanContextInformation {
            sampled: true,
            operation_type: OperationType::from_kind(kind),
            operation_sub_type: None,
            pre_execution_context: None,
            post_execution_context: None,
            call_tree: None,
            duration_nanos: 0,
            timer_for_this_request: None,
            readback: None,
        }
    }

    /// Whether this span is a candidate for call tree collection. Distinct
    /// from "will be reported".
    pub fn is_sampled(&self) -> bool {
        self.sampled
    }

    /// Mark the span as (not) a sampling candidate.
    pub fn set_sampled(&mut self, sampled: bool) {
        self.sampled = sampled;
    }

    /// The operation classification of this span.
    pub fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    /// Reclassify the span, e.g. from a `span.kind` tag.
    pub fn set_operation_type(&mut self, operation_type: OperationType) {
        self.operation_type = operation_type;
    }

    /// Whether this span covers the server side of a request.
    pub fn is_server_request(&self) -> bool {
        self.operation_type == OperationType::Server
    }

    /// Whether this span covers an outgoing external request.
    pub fn is_external_request(&self) -> bool {
        self.operation_type == OperationType::External
    }

    /// The operation sub-type, e.g. `jdbc`.
    pub fn operation_sub_type(&self) -> Option<&str> {
        self.operation_sub_type.as_deref()
    }

    /// Set the operation sub-type.
    pub fn set_operation_sub_type(&mut self, sub_type: impl Into<String>) {
        self.operation_sub_type = Some(sub_type.into());
    }

    /// The pre-phase decision record, present once the sampling listener's
    /// start phase has run.
    pub fn pre_execution_context(&self) -> Option<&PreExecutionInterceptorContext> {
        self.pre_execution_context.as_ref()
    }

    /// Mutable access to the pre-phase decision record.
    pub fn pre_execution_context_mut(&mut self) -> Option<&mut PreExecutionInterceptorContext> {
        self.pre_execution_context.as_mut()
    }

    pub(crate) fn set_pre_execution_context(&mut self, context: PreExecutionInterceptorContext) {
        self.pre_execution_context = Some(context);
    }

    /// The post-phase decision record, present once the sampling listener's
    /// finish phase has run.
    pub fn post_execution_context(&self) -> Option<&PostExecutionInterceptorContext> {
        self.post_execution_context.as_ref()
    }

    /// Mutable access to the post-phase decision record.
    pub fn post_execution_context_mut(&mut self) -> Option<&mut PostExecutionInterceptorContext> {
        self.post_execution_context.as_mut()
    }

    pub(crate) fn set_post_execution_context(&mut self, context: PostExecutionInterceptorContext) {
        self.post_execution_context = Some(context);
    }

    /// The recorded call tree, present after finish if profiling was
    /// activated for this span.
    pub fn call_tree(&self) -> Option<&CallTreeNode> {
        self.call_tree.as_ref()
    }

    pub(crate) fn set_call_tree(&mut self, call_tree: CallTreeNode) {
        self.call_tree = Some(call_tree);
    }

    /// The span duration, filled in at finish.
    pub fn duration_nanos(&self) -> u64 {
        self.duration_nanos
    }

    pub(crate) fn set_duration_nanos(&mut self, duration_nanos: u64) {
        self.duration_nanos = duration_nanos;
    }

    /// The response time timer of this span's operation, set by the server
    /// request metrics listener for percentile comparisons.
    pub fn timer_for_this_request(&self) -> Option<&Arc<Timer>> {
        self.timer_for_this_request.as_ref()
    }

    /// Attach the response time timer for this span's operation.
    pub fn set_timer_for_this_request(&mut self, timer: Arc<Timer>) {
        self.timer_for_this_request = Some(timer);
    }

    /// The readback snapshot built for reporters, if any reporter wanted it.
    pub fn readback(&self) -> Option<&ReadbackSpan> {
        self.readback.as_ref()
    }

    /// Attach a readback snapshot.
    pub fn set_readback(&mut self, readback: ReadbackSpan) {
        self.readback = Some(readback);
    }

    pub(crate) fn take_readback(&mut self) -> Option<ReadbackSpan> {
        self.readback.take()
    }

    /// Whether the span should be reported, considering both interceptor
    /// phases. Missing phases have no opinion.
    pub fn is_report(&self) -> bool {
        self.pre_execution_context
            .as_ref()
            .map_or(true, PreExecutionInterceptorContext::is_report)
            && self
                .post_execution_context
                .as_ref()
                .map_or(true, PostExecutionInterceptorContext::is_report)
    }
}

/// Decision record mutated by pre-execution interceptors at span start.
///
/// Vetoes are monotonic: once collection or reporting is turned off it stays
/// off, and the first veto's identity is kept.
#[derive(Debug, Default)]
pub struct PreExecutionInterceptorContext {
    suppress_call_tree_reason: Option<String>,
    vetoed_by: Option<String>,
}

impl PreExecutionInterceptorContext {
    /// Create a context with collection and reporting enabled.
    pub fn new() -> Self {
        PreExecutionInterceptorContext::default()
    }

    /// Whether a call tree should be collected for this span.
    pub fn is_collect_call_tree(&self) -> bool {
        self.suppress_call_tree_reason.is_none()
    }

    /// Turn call tree collection off, stating why.
    pub fn should_not_collect_call_tree(&mut self, reason: &str) {
        if self.suppress_call_tree_reason.is_none() {
            debug!(reason, "call tree collection disabled for span");
            self.suppress_call_tree_reason = Some(reason.to_owned());
        }
    }

    /// Why call tree collection was turned off, if it was.
    pub fn call_tree_suppression_reason(&self) -> Option<&str> {
        self.suppress_call_tree_reason.as_deref()
    }

    /// Whether the span should be reported.
    pub fn is_report(&self) -> bool {
        self.vetoed_by.is_none()
    }

    /// Veto reporting of this span. The first veto's identity wins.
    pub fn should_not_report(&mut self, interceptor: &str) {
        if self.vetoed_by.is_none() {
            debug!(interceptor, "span reporting vetoed in pre-execution phase");
            self.vetoed_by = Some(interceptor.to_owned());
        }
    }

    /// The interceptor that vetoed reporting, if any.
    pub fn vetoed_by(&self) -> Option<&str> {
        self.vetoed_by.as_deref()
    }
}

/// Decision record mutated by post-execution interceptors at span finish,
/// with the same monotonicity rules as the pre-phase record.
#[derive(Debug, Default)]
pub struct PostExecutionInterceptorContext {
    exclude_call_tree_reason: Option<String>,
    vetoed_by: Option<String>,
}

impl PostExecutionInterceptorContext {
    /// Create a context with the call tree included and reporting enabled.
    pub fn new() -> Self {
        PostExecutionInterceptorContext::default()
    }

    /// Whether the call tree must be dropped from the report.
    pub fn is_exclude_call_tree(&self) -> bool {
        self.exclude_call_tree_reason.is_some()
    }

    /// Drop the call tree from the report, stating why.
    pub fn exclude_call_tree(&mut self, reason: &str) {
        if self.exclude_call_tree_reason.is_none() {
            debug!(reason, "call tree excluded from span report");
            self.exclude_call_tree_reason = Some(reason.to_owned());
        }
    }

    /// Why the call tree was excluded, if it was.
    pub fn call_tree_exclusion_reason(&self) -> Option<&str> {
        self.exclude_call_tree_reason.as_deref()
    }

    /// Whether the span should be reported.
    pub fn is_report(&self) -> bool {
        self.vetoed_by.is_none()
    }

    /// Veto reporting of this span. The first veto's identity wins.
    pub fn should_not_report(&mut self, interceptor: &str) {
        if self.vetoed_by.is_none() {
            debug!(interceptor, "span reporting vetoed in post-execution phase");
            self.vetoed_by = Some(interceptor.to_owned());
        }
    }

    /// The interceptor that vetoed reporting, if any.
    pub fn vetoed_by(&self) -> Option<&str> {
        self.vetoed_by.as_deref()
    }
}

/// A cloneable snapshot of a finished span, handed to reporters.
///
/// Reporters never see the live span; they see this copy, assembled by the
/// readback listener only when at least one reporter is active.
#[derive(Clone, Debug, Serialize)]
pub struct ReadbackSpan {
    /// The operation name at finish time.
    pub name: String,
    /// The trace id, rendered as hex.
    pub trace_id: String,
    /// The span id, rendered as hex.
    pub span_id: String,
    /// The span duration.
    pub duration_nanos: u64,
    /// All tags observed on the span.
    pub tags: HashMap<String, TagValue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_veto_is_monotonic_and_keeps_first_identity() {
        let mut context = PostExecutionInterceptorContext::new();
        assert!(context.is_report());

        context.should_not_report("first");
        context.should_not_report("second");
        assert!(!context.is_report());
        assert_eq!(context.vetoed_by(), Some("first"));
    }

    #[test]
    fn call_tree_suppression_keeps_first_reason() {
        let mut context = PreExecutionInterceptorContext::new();
        context.should_not_collect_call_tree("rate limit is reached");
        context.should_not_collect_call_tree("later reason");
        assert!(!context.is_collect_call_tree());
        assert_eq!(
            context.call_tree_suppression_reason(),
            Some("rate limit is reached")
        );
    }

    #[test]
    fn is_report_combines_both_phases() {
        let mut info = SpanContextInformation::new(SpanKind::Server);
        assert!(info.is_report());

        info.set_pre_execution_context(PreExecutionInterceptorContext::new());
        info.set_post_execution_context(PostExecutionInterceptorContext::new());
        assert!(info.is_report());

        info.post_execution_context_mut()
            .expect("post context was set")
            .should_not_report("test");
        assert!(!info.is_report());
    }

    #[test]
    fn operation_type_follows_span_kind() {
        assert!(SpanContextInformation::new(SpanKind::Server).is_server_request());
        assert!(SpanContextInformation::new(SpanKind::Client).is_external_request());
        let other = SpanContextInformation::new(SpanKind::Internal);
        assert!(!other.is_server_request() && !other.is_external_request());
    }
}
