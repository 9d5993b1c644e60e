//! Helpers for tests that inspect exported spans.

use opentelemetry::Value;
use opentelemetry_sdk::trace::{InMemorySpanExporter, SpanData};

use crate::config::TracerConfig;
use crate::trace::Tracer;

/// A tracer exporting into memory.
pub(crate) fn traced(config: TracerConfig) -> (Tracer, InMemorySpanExporter) {
    let exporter = InMemorySpanExporter::default();
    (Tracer::with_exporter(&config, exporter.clone()), exporter)
}

/// Spans exported so far, in the order they ended.
pub(crate) fn finished(exporter: &InMemorySpanExporter) -> Vec<SpanData> {
    exporter.get_finished_spans().unwrap()
}

pub(crate) fn attr<'a>(span: &'a SpanData, key: &str) -> Option<&'a Value> {
    span.attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| &kv.value)
}
