//! Tracer construction, sampling and span creation.
//!
//! # Responsibilities
//! - Build the OpenTelemetry tracer provider from configuration, falling
//!   back to the environment
//! - Start root spans (continuing a caller's trace) and child spans
//! - Extract and inject trace context in the configured header format
//!
//! # Design Decisions
//! - A tracer whose exporter cannot be built degrades to disabled; callers
//!   see `None` spans and proceed untraced
//! - Sampling is parent based: a root decides by trace id ratio, everything
//!   below follows it

use std::borrow::Cow;
use std::fmt;
use std::sync::{Arc, Mutex};

use axum::http::HeaderMap;
use opentelemetry::trace::{SpanContext, SpanKind, TraceContextExt, TraceId, Tracer as _, TracerProvider as _};
use opentelemetry::{Context, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{
    Sampler as SdkSampler, SdkTracerProvider, SpanExporter, Tracer as SdkTracer, TracerProviderBuilder,
};
use opentelemetry_sdk::Resource;

use crate::config::{PropagationFormat, TracerConfig};
use crate::trace::propagation::{self, B3Propagator};
use crate::trace::span::Span;

/// Collector endpoint used when neither config nor environment name one.
pub const DEFAULT_COLLECTOR_ENDPOINT: &str = "http://localhost:4317";

/// Instrumentation scope of every span this crate creates.
const INSTRUMENTATION_NAME: &str = "mux-runtime";

/// Tag buffers kept for reuse when span pooling is on.
const TAG_POOL_LIMIT: usize = 256;

/// Sampling strategy for new traces.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Sampler {
    #[default]
    Always,
    Never,
    /// Sample this fraction of traces.
    Ratio(f64),
}

impl Sampler {
    /// `p >= 1` samples everything, `p <= 0` nothing, anything between is a ratio.
    pub fn from_param(p: f64) -> Self {
        if p >= 1.0 {
            Sampler::Always
        } else if p > 0.0 {
            Sampler::Ratio(p)
        } else {
            Sampler::Never
        }
    }

    /// Decide for `trace_id` with the same rule as the SDK's ratio sampler,
    /// so a deferred remote decision agrees with a local root decision.
    pub fn should_sample(&self, trace_id: TraceId) -> bool {
        match self {
            Sampler::Always => true,
            Sampler::Never => false,
            Sampler::Ratio(ratio) => {
                let low = u128::from_be_bytes(trace_id.to_bytes()) as u64;
                let bound = (ratio.max(0.0) * (1u64 << 63) as f64) as u64;
                (low >> 1) < bound
            }
        }
    }

    fn to_sdk(self) -> SdkSampler {
        let root = match self {
            Sampler::Always => SdkSampler::AlwaysOn,
            Sampler::Never => SdkSampler::AlwaysOff,
            Sampler::Ratio(ratio) => SdkSampler::TraceIdRatioBased(ratio),
        };
        SdkSampler::ParentBased(Box::new(root))
    }
}

/// Fill unset collector endpoint and sampler parameter from the standard
/// OpenTelemetry environment variables.
pub fn apply_env_fallback(
    config: &TracerConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> TracerConfig {
    let mut resolved = config.clone();

    if resolved.reporter_endpoint.is_empty() {
        resolved.reporter_endpoint = lookup("OTEL_EXPORTER_OTLP_TRACES_ENDPOINT")
            .or_else(|| lookup("OTEL_EXPORTER_OTLP_ENDPOINT"))
            .unwrap_or_else(|| DEFAULT_COLLECTOR_ENDPOINT.to_string());
    }

    if resolved.sampler_param <= 0.0 {
        if let Some(param) = lookup("OTEL_TRACES_SAMPLER_ARG").and_then(|v| v.parse::<f64>().ok()) {
            resolved.sampler_param = param;
        }
    }

    resolved
}

/// Shared state behind every span of one tracer.
pub(crate) struct TracerInner {
    tracer: SdkTracer,
    provider: SdkTracerProvider,
    propagator: B3Propagator,
    pub(crate) max_tag_value_length: usize,
    pub(crate) log_spans: bool,
    tag_pool: Option<Mutex<Vec<Vec<KeyValue>>>>,
}

impl TracerInner {
    pub(crate) fn take_tag_buffer(&self) -> Vec<KeyValue> {
        self.tag_pool
            .as_ref()
            .and_then(|pool| pool.lock().ok()?.pop())
            .unwrap_or_default()
    }

    pub(crate) fn recycle(&self, mut tags: Vec<KeyValue>) {
        if let Some(pool) = &self.tag_pool {
            if let Ok(mut pool) = pool.lock() {
                if pool.len() < TAG_POOL_LIMIT {
                    tags.clear();
                    pool.push(tags);
                }
            }
        }
    }
}

impl fmt::Debug for TracerInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracerInner")
            .field("propagator", &self.propagator)
            .field("max_tag_value_length", &self.max_tag_value_length)
            .field("log_spans", &self.log_spans)
            .field("pool_spans", &self.tag_pool.is_some())
            .finish()
    }
}

/// Creates spans. Cheap to clone; a disabled tracer creates nothing.
#[derive(Debug, Clone, Default)]
pub struct Tracer {
    inner: Option<Arc<TracerInner>>,
}

impl Tracer {
    /// Build a tracer exporting over OTLP/gRPC in batches.
    ///
    /// Exporter initialization failures are logged and yield a disabled
    /// tracer; they never prevent startup. Must run inside a Tokio runtime.
    pub fn from_config(config: &TracerConfig) -> Self {
        if !config.enabled {
            tracing::info!("Tracing disabled by configuration");
            return Self::disabled();
        }

        let config = apply_env_fallback(config, |key| std::env::var(key).ok());
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(config.reporter_endpoint.clone())
            .build();

        match exporter {
            Ok(exporter) => {
                tracing::info!(endpoint = %config.reporter_endpoint, "Span exporter configured");
                let provider = provider_builder(&config).with_batch_exporter(exporter).build();
                Self::from_provider(&config, provider)
            }
            Err(e) => {
                tracing::error!(
                    endpoint = %config.reporter_endpoint,
                    error = %e,
                    "Cannot initialize span exporter, continuing untraced"
                );
                Self::disabled()
            }
        }
    }

    /// Build an enabled tracer that hands each finished span to `exporter`
    /// as soon as it ends.
    pub fn with_exporter<E>(config: &TracerConfig, exporter: E) -> Self
    where
        E: SpanExporter + 'static,
    {
        let provider = provider_builder(config).with_simple_exporter(exporter).build();
        Self::from_provider(config, provider)
    }

    fn from_provider(config: &TracerConfig, provider: SdkTracerProvider) -> Self {
        let sampler = Sampler::from_param(config.sampler_param);
        let propagator = match config.propagation {
            PropagationFormat::B3 => B3Propagator::new(sampler),
        };
        tracing::info!(
            service = %config.service_name,
            sampler = ?sampler,
            propagation = ?config.propagation,
            log_spans = config.log_spans,
            "Tracer initialized"
        );

        Self {
            inner: Some(Arc::new(TracerInner {
                tracer: provider.tracer(INSTRUMENTATION_NAME),
                provider,
                propagator,
                max_tag_value_length: config.max_tag_value_length,
                log_spans: config.log_spans,
                tag_pool: config.pool_spans.then(|| Mutex::new(Vec::new())),
            })),
        }
    }

    /// A tracer that never creates spans.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// The caller's trace context carried by `headers`, if any.
    pub fn extract(&self, headers: &HeaderMap) -> Context {
        match &self.inner {
            Some(inner) => propagation::extract(&inner.propagator, headers),
            None => Context::new(),
        }
    }

    /// Write `ctx` into `headers` in the configured format.
    pub fn inject(&self, ctx: &SpanContext, headers: &mut HeaderMap) {
        if let Some(inner) = &self.inner {
            propagation::inject(&inner.propagator, ctx, headers);
        }
    }

    /// Start the first local span of a request. A remote span in `remote`
    /// (see [`Tracer::extract`]) becomes its parent.
    pub fn start_root_span(&self, name: impl Into<Cow<'static, str>>, remote: &Context) -> Option<Span> {
        let inner = self.inner.as_ref()?;
        let name = name.into();
        let builder = inner.tracer.span_builder(name.clone()).with_kind(SpanKind::Server);
        let span = inner.tracer.build_with_context(builder, remote);
        Some(Span::start(Arc::clone(inner), name, span))
    }

    /// Start a child of `parent`.
    pub fn start_child_span(&self, name: impl Into<Cow<'static, str>>, parent: &SpanContext) -> Option<Span> {
        let inner = self.inner.as_ref()?;
        let name = name.into();
        let cx = Context::new().with_remote_span_context(parent.clone());
        let builder = inner.tracer.span_builder(name.clone()).with_kind(SpanKind::Client);
        let span = inner.tracer.build_with_context(builder, &cx);
        Some(Span::start(Arc::clone(inner), name, span))
    }

    /// Flush buffered spans and stop the exporter. Blocks until done.
    pub fn shutdown(&self) {
        if let Some(inner) = &self.inner {
            match inner.provider.shutdown() {
                Ok(()) => tracing::debug!("Tracer provider shut down"),
                Err(e) => tracing::error!(error = %e, "Failed to flush spans on shutdown"),
            }
        }
    }
}

fn provider_builder(config: &TracerConfig) -> TracerProviderBuilder {
    let resource = Resource::builder()
        .with_service_name(config.service_name.clone())
        .build();
    SdkTracerProvider::builder()
        .with_sampler(Sampler::from_param(config.sampler_param).to_sdk())
        .with_resource(resource)
}

#[cfg(test)]
mod tests {
    use opentelemetry::trace::{SpanId, TraceFlags, TraceState};
    use opentelemetry::Value;

    use super::*;
    use crate::trace::testing::{attr, finished, traced};

    #[test]
    fn sampler_params() {
        assert_eq!(Sampler::from_param(1.0), Sampler::Always);
        assert_eq!(Sampler::from_param(5.0), Sampler::Always);
        assert_eq!(Sampler::from_param(0.0), Sampler::Never);
        assert_eq!(Sampler::from_param(-1.0), Sampler::Never);
        assert_eq!(Sampler::from_param(0.25), Sampler::Ratio(0.25));

        let ratio = Sampler::Ratio(0.5);
        assert!(ratio.should_sample(TraceId::from_bytes(1u128.to_be_bytes())));
        assert!(!ratio.should_sample(TraceId::from_bytes((u64::MAX as u128).to_be_bytes())));
    }

    #[test]
    fn env_fallback_fills_only_unset_values() {
        let env = |key: &str| match key {
            "OTEL_EXPORTER_OTLP_ENDPOINT" => Some("http://collector:4317".to_string()),
            "OTEL_TRACES_SAMPLER_ARG" => Some("0.5".to_string()),
            _ => None,
        };

        let mut config = TracerConfig {
            sampler_param: 0.0,
            ..TracerConfig::default()
        };
        let resolved = apply_env_fallback(&config, env);
        assert_eq!(resolved.reporter_endpoint, "http://collector:4317");
        assert_eq!(resolved.sampler_param, 0.5);

        config.reporter_endpoint = "http://otel:4317".into();
        config.sampler_param = 1.0;
        let resolved = apply_env_fallback(&config, env);
        assert_eq!(resolved.reporter_endpoint, "http://otel:4317");
        assert_eq!(resolved.sampler_param, 1.0);

        let resolved = apply_env_fallback(&TracerConfig::default(), |_| None);
        assert_eq!(resolved.reporter_endpoint, DEFAULT_COLLECTOR_ENDPOINT);
    }

    #[test]
    fn disabled_tracer_creates_no_spans() {
        let tracer = Tracer::disabled();
        assert!(!tracer.is_enabled());
        assert!(tracer.start_root_span("HTTP GET", &Context::new()).is_none());

        let config = TracerConfig {
            enabled: false,
            ..TracerConfig::default()
        };
        assert!(!Tracer::from_config(&config).is_enabled());
    }

    #[tokio::test]
    async fn unusable_endpoint_degrades_to_disabled() {
        let config = TracerConfig {
            reporter_endpoint: "not a uri".into(),
            ..TracerConfig::default()
        };
        assert!(!Tracer::from_config(&config).is_enabled());
    }

    #[test]
    fn spans_are_exported_once_when_finished_or_dropped() {
        let (tracer, exporter) = traced(TracerConfig::default());

        let root = tracer.start_root_span("HTTP GET", &Context::new()).unwrap();
        let root_ctx = root.context();
        tracer.start_child_span("SQL", &root_ctx).unwrap().finish();
        {
            let _dropped = tracer.start_child_span("SQL", &root_ctx).unwrap();
        }
        root.finish();

        let spans = finished(&exporter);
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].parent_span_id, root_ctx.span_id());
        assert_eq!(spans[1].parent_span_id, root_ctx.span_id());
        assert_eq!(spans[2].span_context.span_id(), root_ctx.span_id());
        assert_eq!(spans[2].parent_span_id, SpanId::INVALID);
        assert!(spans.iter().all(|s| s.span_context.trace_id() == root_ctx.trace_id()));
    }

    #[test]
    fn unsampled_spans_are_not_exported() {
        let (tracer, exporter) = traced(TracerConfig {
            sampler_param: 0.0,
            ..TracerConfig::default()
        });
        let root = tracer.start_root_span("HTTP GET", &Context::new()).unwrap();
        assert!(!root.context().is_sampled());
        tracer.start_child_span("SQL", &root.context()).unwrap().finish();
        root.finish();
        assert!(finished(&exporter).is_empty());
    }

    #[test]
    fn remote_sampling_decision_wins() {
        let (tracer, exporter) = traced(TracerConfig {
            sampler_param: 0.0,
            ..TracerConfig::default()
        });
        let caller = SpanContext::new(
            TraceId::from_hex("0af7651916cd43dd8448eb211c80319c").unwrap(),
            SpanId::from_hex("b7ad6b7169203331").unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );
        let remote = Context::new().with_remote_span_context(caller.clone());

        let root = tracer.start_root_span("HTTP GET", &remote).unwrap();
        assert_eq!(root.context().trace_id(), caller.trace_id());
        root.finish();

        let spans = finished(&exporter);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].parent_span_id, caller.span_id());
    }

    #[test]
    fn string_tags_are_truncated_and_replaced() {
        let (tracer, exporter) = traced(TracerConfig {
            max_tag_value_length: 8,
            ..TracerConfig::default()
        });
        let mut span = tracer.start_root_span("SQL", &Context::new()).unwrap();
        span.set_tag("db.statement", "SELECT * FROM users");
        span.set_tag("db.count", 1i64);
        span.set_tag("db.count", 2i64);
        span.finish();

        let spans = finished(&exporter);
        assert_eq!(attr(&spans[0], "db.statement"), Some(&Value::from("SELECT *")));
        assert_eq!(attr(&spans[0], "db.count"), Some(&Value::I64(2)));
        assert_eq!(spans[0].attributes.len(), 2);
    }

    #[test]
    fn pooled_tag_buffers_come_back_empty() {
        let (tracer, _exporter) = traced(TracerConfig::default());
        let mut span = tracer.start_root_span("SQL", &Context::new()).unwrap();
        span.set_tag("k", "v");
        span.finish();

        let span = tracer.start_root_span("SQL", &Context::new()).unwrap();
        assert!(span.tag("k").is_none());
    }

    #[test]
    fn context_round_trips_through_headers() {
        let (tracer, _exporter) = traced(TracerConfig::default());
        let root = tracer.start_root_span("HTTP GET", &Context::new()).unwrap();

        let mut headers = HeaderMap::new();
        tracer.inject(&root.context(), &mut headers);
        let remote = tracer.extract(&headers);
        assert_eq!(remote.span().span_context().span_id(), root.context().span_id());

        Tracer::disabled().inject(&root.context(), &mut headers);
        assert!(!Tracer::disabled().extract(&headers).has_active_span());
    }
}
