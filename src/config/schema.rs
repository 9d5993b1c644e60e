//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the runtime.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::net::matcher::ProtocolClass;

/// Root configuration for the service runtime.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// Shared socket and protocol demultiplexing.
    pub listener: ListenerConfig,

    /// HTTP sub-server settings.
    pub http: HttpConfig,

    /// Distributed tracing settings.
    pub tracer: TracerConfig,

    /// Traced data connections.
    pub database: DatabaseConfig,

    /// Logging and metrics settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Enabled protocol classes, in priority order.
    pub protocols: Vec<ProtocolConfig>,

    /// What happens to connections no signature claims.
    pub unmatched: UnmatchedPolicy,

    /// Capacity of each derived listener's accept queue.
    pub queue_capacity: usize,

    /// Connections allowed to wait on a full queue before new ones are closed.
    pub max_pending: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            protocols: vec![
                ProtocolConfig::new(ProtocolClass::Http1),
                ProtocolConfig::new(ProtocolClass::Http2),
            ],
            unmatched: UnmatchedPolicy::Route,
            queue_capacity: 128,
            max_pending: 1024,
        }
    }
}

/// Per-class sniffing parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProtocolConfig {
    /// Protocol class to recognize.
    pub class: ProtocolClass,

    /// Maximum prefix bytes this signature may inspect.
    /// Falls back to the class default when absent.
    #[serde(default)]
    pub peek_bytes: Option<usize>,

    /// How long to wait for enough prefix bytes before giving up on this class.
    #[serde(default = "default_classify_timeout_ms")]
    pub classify_timeout_ms: u64,
}

impl ProtocolConfig {
    /// Config for `class` with default peek window and timeout.
    pub fn new(class: ProtocolClass) -> Self {
        Self {
            class,
            peek_bytes: None,
            classify_timeout_ms: default_classify_timeout_ms(),
        }
    }

    /// Effective peek window for this class.
    pub fn peek_bytes(&self) -> usize {
        self.peek_bytes.unwrap_or_else(|| self.class.default_peek_bytes())
    }
}

fn default_classify_timeout_ms() -> u64 {
    2000
}

/// Handling of connections that match no enabled signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnmatchedPolicy {
    /// Hand the connection to the default listener, if one is registered.
    #[default]
    Route,
    /// Close the connection.
    Close,
}

/// HTTP sub-server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Path prefix all routes are nested under (empty = root).
    pub context_path: String,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Log every request/response pair.
    pub debug: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            context_path: String::new(),
            request_timeout_secs: 30,
            debug: false,
        }
    }
}

/// Distributed tracing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TracerConfig {
    /// Enable span creation and reporting.
    pub enabled: bool,

    /// Service name stamped on every reported span.
    pub service_name: String,

    /// Sampling parameter: >= 1 samples everything, <= 0 falls back to the
    /// environment, anything in between is a ratio.
    pub sampler_param: f64,

    /// OTLP/gRPC collector endpoint (e.g. "http://localhost:4317").
    /// Empty falls back to the environment.
    pub reporter_endpoint: String,

    /// Also log every finished span.
    pub log_spans: bool,

    /// Longest string tag value kept, in bytes.
    pub max_tag_value_length: usize,

    /// Recycle the tag buffers of finished spans.
    pub pool_spans: bool,

    /// Header format for inbound/outbound trace context.
    pub propagation: PropagationFormat,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_name: "mux-runtime".to_string(),
            sampler_param: 1.0,
            reporter_endpoint: String::new(),
            log_spans: false,
            max_tag_value_length: 256,
            pool_spans: true,
            propagation: PropagationFormat::B3,
        }
    }
}

/// Data connections opened at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Registry keys, one traced connection each.
    pub connections: Vec<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connections: vec!["default".to_string()],
        }
    }
}

/// Supported trace context header formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PropagationFormat {
    /// Zipkin B3 multi-header format.
    #[default]
    B3,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log line format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}
