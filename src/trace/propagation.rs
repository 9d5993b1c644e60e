//! B3 trace context propagation over HTTP headers.
//!
//! Inbound requests carry the caller's context in `X-B3-*` headers; the
//! same headers are written back so the caller can find the server span.

use std::sync::LazyLock;

use axum::http::HeaderMap;
use opentelemetry::propagation::text_map_propagator::FieldIter;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState};
use opentelemetry::Context;
use opentelemetry_http::{HeaderExtractor, HeaderInjector};

use crate::trace::tracer::Sampler;

pub const X_B3_TRACE_ID: &str = "x-b3-traceid";
pub const X_B3_SPAN_ID: &str = "x-b3-spanid";
pub const X_B3_SAMPLED: &str = "x-b3-sampled";
pub const X_B3_FLAGS: &str = "x-b3-flags";

static FIELDS: LazyLock<[String; 4]> =
    LazyLock::new(|| [X_B3_TRACE_ID, X_B3_SPAN_ID, X_B3_SAMPLED, X_B3_FLAGS].map(String::from));

/// Multi-header B3 propagator.
///
/// A caller that sends ids without a sampling decision gets one from
/// `sampler`, applied to its trace id.
#[derive(Debug, Clone, Copy, Default)]
pub struct B3Propagator {
    sampler: Sampler,
}

impl B3Propagator {
    pub fn new(sampler: Sampler) -> Self {
        Self { sampler }
    }

    fn extract_span_context(&self, extractor: &dyn Extractor) -> Option<SpanContext> {
        let trace_id = parse_trace_id(extractor.get(X_B3_TRACE_ID)?)?;
        let span_id = parse_span_id(extractor.get(X_B3_SPAN_ID)?)?;

        let sampled = if extractor.get(X_B3_FLAGS) == Some("1") {
            Some(true)
        } else {
            match extractor.get(X_B3_SAMPLED) {
                Some("1") | Some("true") => Some(true),
                Some("0") | Some("false") => Some(false),
                _ => None,
            }
        };
        let sampled = sampled.unwrap_or_else(|| self.sampler.should_sample(trace_id));
        let flags = if sampled {
            TraceFlags::SAMPLED
        } else {
            TraceFlags::default()
        };

        Some(SpanContext::new(trace_id, span_id, flags, true, TraceState::default()))
    }
}

impl TextMapPropagator for B3Propagator {
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
        let span = cx.span();
        let ctx = span.span_context();
        if !ctx.is_valid() {
            return;
        }
        injector.set(X_B3_TRACE_ID, ctx.trace_id().to_string());
        injector.set(X_B3_SPAN_ID, ctx.span_id().to_string());
        injector.set(X_B3_SAMPLED, if ctx.is_sampled() { "1" } else { "0" }.to_string());
    }

    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        match self.extract_span_context(extractor) {
            Some(remote) => cx.with_remote_span_context(remote),
            None => cx.clone(),
        }
    }

    fn fields(&self) -> FieldIter<'_> {
        FieldIter::new(FIELDS.as_slice())
    }
}

/// 16 or 32 hex digits, not all zero.
fn parse_trace_id(s: &str) -> Option<TraceId> {
    if !(s.len() == 16 || s.len() == 32) {
        return None;
    }
    TraceId::from_hex(s).ok().filter(|id| *id != TraceId::INVALID)
}

/// Exactly 16 hex digits, not all zero.
fn parse_span_id(s: &str) -> Option<SpanId> {
    if s.len() != 16 {
        return None;
    }
    SpanId::from_hex(s).ok().filter(|id| *id != SpanId::INVALID)
}

/// The caller's context from `headers`. Without valid B3 ids this is an
/// empty context, and spans started from it are new roots.
pub fn extract(propagator: &B3Propagator, headers: &HeaderMap) -> Context {
    propagator.extract(&HeaderExtractor(headers))
}

/// Write `ctx` into `headers`.
pub fn inject(propagator: &B3Propagator, ctx: &SpanContext, headers: &mut HeaderMap) {
    let cx = Context::new().with_remote_span_context(ctx.clone());
    propagator.inject_context(&cx, &mut HeaderInjector(headers));
}
