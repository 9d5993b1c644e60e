//! Request tracing middleware.
//!
//! # Responsibilities
//! - Continue the caller's trace from B3 headers, or start a new one
//! - Open the request's root span and attach it to a fresh [`RequestScope`]
//! - Hand the scope to handlers through request extensions
//! - Tag the root span with the response status and finish it
//! - Return the root span's B3 context to the caller in response headers

use std::convert::Infallible;

use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{request::Parts, HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::net::PeerAddr;
use crate::trace::{RequestScope, Tracer};

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

pub async fn trace_middleware(State(tracer): State<Tracer>, mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(&X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let scope = RequestScope::new();
    let remote = tracer.extract(req.headers());
    let mut span = tracer.start_root_span(format!("HTTP {}", req.method()), &remote);

    if let Some(span) = span.as_mut() {
        span.set_tag("http.method", req.method().to_string());
        span.set_tag("http.url", req.uri().to_string());
        span.set_tag("request.id", request_id.clone());
        if let Some(ConnectInfo(PeerAddr(peer))) = req.extensions().get::<ConnectInfo<PeerAddr>>() {
            span.set_tag("peer.address", peer.to_string());
        }
        // Fresh scope, so the slot is empty.
        let _ = scope.attach(span.context());
    }

    tracing::debug!(
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path(),
        traced = span.is_some(),
        "Request received"
    );

    req.extensions_mut().insert(scope);
    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().entry(X_REQUEST_ID).or_insert(value);
    }

    if let Some(mut span) = span {
        let status = response.status();
        span.set_tag("http.status_code", i64::from(status.as_u16()));
        span.set_tag("error", status.is_server_error());
        tracer.inject(&span.context(), response.headers_mut());
        span.finish();
    }

    response
}

/// Handlers take the request's scope as an extractor. Outside the tracing
/// middleware this yields an empty scope.
impl<S: Send + Sync> FromRequestParts<S> for RequestScope {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts.extensions.get::<RequestScope>().cloned().unwrap_or_default())
    }
}
