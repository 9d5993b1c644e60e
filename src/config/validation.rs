//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, addresses parse, windows bounded)
//! - Detect duplicate protocol classes and connection keys
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServiceConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ServiceConfig;

/// Upper bound on any single signature's peek window.
pub const MAX_PEEK_BYTES: usize = 4096;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("listener.bind_address `{0}` is not a socket address")]
    BindAddress(String),

    #[error("protocol `{0}` is listed more than once")]
    DuplicateProtocol(String),

    #[error("protocol `{class}` peek_bytes must be within {min}..={max}, got {value}")]
    PeekBytes {
        class: String,
        value: usize,
        min: usize,
        max: usize,
    },

    #[error("protocol `{0}` classify_timeout_ms must be greater than zero")]
    ClassifyTimeout(String),

    #[error("listener.queue_capacity must be greater than zero")]
    QueueCapacity,

    #[error("http.request_timeout_secs must be greater than zero")]
    RequestTimeout,

    #[error("http.context_path `{0}` must start with '/'")]
    ContextPath(String),

    #[error("tracer.sampler_param must be a finite number")]
    SamplerParam,

    #[error("tracer.max_tag_value_length must be greater than zero")]
    MaxTagValueLength,

    #[error("database.connections contains an empty key")]
    EmptyConnectionKey,

    #[error("database connection `{0}` is listed more than once")]
    DuplicateConnection(String),

    #[error("observability.metrics_address `{0}` is not a socket address")]
    MetricsAddress(String),
}

/// Validate a parsed configuration, collecting every error found.
pub fn validate_config(config: &ServiceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let listener = &config.listener;
    if listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BindAddress(listener.bind_address.clone()));
    }

    let mut seen = HashSet::new();
    for protocol in &listener.protocols {
        let name = protocol.class.to_string();
        if !seen.insert(protocol.class) {
            errors.push(ValidationError::DuplicateProtocol(name.clone()));
        }
        // A shorter window can never hold the class's signature.
        let peek = protocol.peek_bytes();
        let min = protocol.class.default_peek_bytes();
        if peek < min || peek > MAX_PEEK_BYTES {
            errors.push(ValidationError::PeekBytes {
                class: name.clone(),
                value: peek,
                min,
                max: MAX_PEEK_BYTES,
            });
        }
        if protocol.classify_timeout_ms == 0 {
            errors.push(ValidationError::ClassifyTimeout(name));
        }
    }

    if listener.queue_capacity == 0 {
        errors.push(ValidationError::QueueCapacity);
    }

    let http = &config.http;
    if http.request_timeout_secs == 0 {
        errors.push(ValidationError::RequestTimeout);
    }
    if !http.context_path.is_empty() && !http.context_path.starts_with('/') {
        errors.push(ValidationError::ContextPath(http.context_path.clone()));
    }

    let tracer = &config.tracer;
    if !tracer.sampler_param.is_finite() {
        errors.push(ValidationError::SamplerParam);
    }
    if tracer.max_tag_value_length == 0 {
        errors.push(ValidationError::MaxTagValueLength);
    }

    let mut keys = HashSet::new();
    for key in &config.database.connections {
        if key.is_empty() {
            errors.push(ValidationError::EmptyConnectionKey);
        } else if !keys.insert(key.as_str()) {
            errors.push(ValidationError::DuplicateConnection(key.clone()));
        }
    }

    let observability = &config.observability;
    if observability.metrics_enabled
        && observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::MetricsAddress(
            observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
