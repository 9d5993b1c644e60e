//! Request-scoped span propagation.
//!
//! A [`RequestScope`] is created when a request enters the service and is
//! passed along to every operation the request triggers. It holds at most
//! one parent span context, written once and read any number of times.

use std::sync::{Arc, OnceLock};

use thiserror::Error;

use opentelemetry::trace::SpanContext;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeError {
    #[error("A parent span is already attached to this request scope")]
    AlreadyAttached,
}

/// Per-request carrier of the parent span.
///
/// Clones share the same slot, so sub-tasks of one request all observe the
/// attached span.
#[derive(Debug, Clone, Default)]
pub struct RequestScope {
    parent: Arc<OnceLock<SpanContext>>,
}

impl RequestScope {
    /// A scope with no parent span; operations run in it are untraced.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parent(parent: SpanContext) -> Self {
        let scope = Self::new();
        // Fresh slot: cannot already be set.
        let _ = scope.parent.set(parent);
        scope
    }

    /// Attach the request's parent span. Only the first attach succeeds.
    pub fn attach(&self, parent: SpanContext) -> Result<(), ScopeError> {
        self.parent
            .set(parent)
            .map_err(|_| ScopeError::AlreadyAttached)
    }

    /// The attached parent span, if any.
    pub fn parent_span(&self) -> Option<SpanContext> {
        self.parent.get().cloned()
    }
}
