//! Distributed tracing subsystem, built on the OpenTelemetry SDK.
//!
//! # Data Flow
//! ```text
//! Inbound request headers
//!     → propagation.rs (B3 extract → remote span context)
//!     → tracer.rs (root span, parent-based sampling)
//!     → scope.rs (root span context attached to the RequestScope)
//!     → db::interceptor (child spans per data operation)
//!     → span.rs (tags buffered, finished exactly once)
//!     → OTLP exporter (batched)
//! ```
//!
//! # Design Decisions
//! - Spans finish on drop, so an unfinished span cannot leak
//! - Tracing is opportunistic: a disabled tracer or a missing parent means
//!   no spans, never an error

pub mod propagation;
pub mod scope;
pub mod span;
pub mod tracer;

#[cfg(test)]
pub(crate) mod testing;

pub use opentelemetry::trace::{SpanContext, SpanId, TraceId};
pub use propagation::B3Propagator;
pub use scope::{RequestScope, ScopeError};
pub use span::Span;
pub use tracer::{Sampler, Tracer};
