//! Open spans.
//!
//! A [`Span`] is finished exactly once: [`Span::finish`] consumes it, and a
//! span that goes out of scope unfinished (early return, panic, cancelled
//! future) is finished by its `Drop`. Tags are buffered on the span and
//! handed to the SDK span when it ends, so setting a key twice keeps only
//! the last value.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use opentelemetry::trace::{Span as _, SpanContext, Status};
use opentelemetry::{KeyValue, Value};
use opentelemetry_sdk::trace::Span as SdkSpan;

use crate::observability::metrics;
use crate::trace::tracer::TracerInner;

pub struct Span {
    inner: Option<SdkSpan>,
    name: Cow<'static, str>,
    context: SpanContext,
    started: Instant,
    tags: Vec<KeyValue>,
    tracer: Arc<TracerInner>,
}

impl Span {
    pub(crate) fn start(tracer: Arc<TracerInner>, name: Cow<'static, str>, inner: SdkSpan) -> Self {
        let context = inner.span_context().clone();
        Self {
            inner: Some(inner),
            name,
            context,
            started: Instant::now(),
            tags: tracer.take_tag_buffer(),
            tracer,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> SpanContext {
        self.context.clone()
    }

    /// Set a tag, replacing any previous value for `key`. String values
    /// longer than the tracer's limit are truncated.
    pub fn set_tag(&mut self, key: &'static str, value: impl Into<Value>) {
        let value = match value.into() {
            Value::String(s) if s.as_str().len() > self.tracer.max_tag_value_length => {
                Value::String(truncate(s.as_str().to_owned(), self.tracer.max_tag_value_length).into())
            }
            other => other,
        };
        match self.tags.iter_mut().find(|kv| kv.key.as_str() == key) {
            Some(slot) => slot.value = value,
            None => self.tags.push(KeyValue::new(key, value)),
        }
    }

    pub fn tag(&self, key: &str) -> Option<&Value> {
        self.tags
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| &kv.value)
    }

    /// Finish the span and hand it to the exporter.
    pub fn finish(self) {
        drop(self);
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("name", &self.name)
            .field("context", &self.context)
            .field("tags", &self.tags)
            .finish()
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        let Some(mut inner) = self.inner.take() else {
            return;
        };
        let mut tags = std::mem::take(&mut self.tags);

        if self.context.is_sampled() {
            metrics::record_span_finished();
            if self.tracer.log_spans {
                tracing::info!(
                    span = %self.name,
                    trace_id = %self.context.trace_id(),
                    span_id = %self.context.span_id(),
                    duration_us = self.started.elapsed().as_micros() as u64,
                    tags = ?tags,
                    "Span finished"
                );
            }
        }

        if tags.iter().any(|kv| kv.key.as_str() == "error" && kv.value == Value::Bool(true)) {
            inner.set_status(Status::error(""));
        }
        inner.set_attributes(tags.drain(..));
        inner.end();
        self.tracer.recycle(tags);
    }
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}
