//! Per-operation span lifecycle.
//!
//! # Responsibilities
//! - Open a `SQL` child span before an operation runs, if the request
//!   scope carries a parent
//! - Tag and finish that span once the operation has completed
//!
//! # Design Decisions
//! - [`OpHandle`] is consumed by [`OperationTracer::after`], so a span can
//!   only be finished once
//! - A handle dropped without `after` (panic, cancelled future) still
//!   finishes its span, tagged as an error

use std::borrow::Cow;

use crate::db::operation::{OperationKind, OperationMeta};
use crate::trace::{RequestScope, Span, SpanContext, Tracer};

/// Name of every operation span.
pub const SQL_SPAN_NAME: &str = "SQL";

/// Verb used when a raw statement is blank.
pub const UNKNOWN_VERB: &str = "UNKNOWN";

/// Wraps data operations in child spans of the request's parent span.
#[derive(Debug, Clone, Default)]
pub struct OperationTracer {
    tracer: Tracer,
}

impl OperationTracer {
    pub fn new(tracer: Tracer) -> Self {
        Self { tracer }
    }

    /// Open the span for an operation about to run.
    ///
    /// Without a parent span in `scope`, or with tracing disabled, the
    /// returned handle is a no-op.
    pub fn before(&self, kind: OperationKind, scope: &RequestScope) -> OpHandle {
        let span = scope
            .parent_span()
            .and_then(|parent| self.tracer.start_child_span(SQL_SPAN_NAME, &parent))
            .map(|mut span| {
                span.set_tag("db.type", "sql");
                span
            });
        OpHandle { span, kind }
    }

    /// Record the outcome of the operation and finish its span.
    pub fn after(&self, handle: OpHandle, meta: &OperationMeta<'_>) {
        handle.complete(meta);
    }
}

/// Single-use token linking `before` to `after`.
#[derive(Debug)]
#[must_use = "pass the handle to OperationTracer::after once the operation completes"]
pub struct OpHandle {
    span: Option<Span>,
    kind: OperationKind,
}

impl OpHandle {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Whether a span was opened for this operation.
    pub fn is_traced(&self) -> bool {
        self.span.is_some()
    }

    pub fn span_context(&self) -> Option<SpanContext> {
        self.span.as_ref().map(Span::context)
    }

    fn complete(mut self, meta: &OperationMeta<'_>) {
        let Some(mut span) = self.span.take() else {
            return;
        };

        let verb = derive_verb(self.kind, meta.statement);
        span.set_tag("error", meta.failed);
        span.set_tag("db.statement", meta.statement.to_owned());
        span.set_tag("db.table", meta.table.to_owned());
        span.set_tag("db.method", verb);
        span.set_tag("db.err", meta.failed);
        span.set_tag("db.count", i64::try_from(meta.rows_affected).unwrap_or(i64::MAX));
        span.finish();
    }
}

impl Drop for OpHandle {
    fn drop(&mut self) {
        if let Some(mut span) = self.span.take() {
            tracing::warn!(
                kind = %self.kind,
                trace_id = %span.context().trace_id(),
                "Operation span abandoned before completion"
            );
            if let Some(verb) = self.kind.verb() {
                span.set_tag("db.method", verb);
            }
            span.set_tag("error", true);
            span.set_tag("db.err", true);
        }
    }
}

/// Verb recorded for an operation: fixed for explicit kinds, otherwise the
/// first token of the statement, upper-cased.
pub fn derive_verb(kind: OperationKind, statement: &str) -> Cow<'static, str> {
    if let Some(verb) = kind.verb() {
        return Cow::Borrowed(verb);
    }
    match statement.split_whitespace().next() {
        Some(token) => Cow::Owned(token.to_uppercase()),
        None => Cow::Borrowed(UNKNOWN_VERB),
    }
}
