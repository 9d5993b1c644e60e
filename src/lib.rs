//! Multiplexed service runtime with request-scoped data-operation tracing.
//!
//! One bound socket is demultiplexed by protocol sniffing into derived
//! listeners, each served by its own server under fail-fast supervision.
//! Requests carry a root span in their [`trace::RequestScope`]; data
//! operations run through [`db::TracedConnection`] become its children.

pub mod config;
pub mod db;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod trace;

pub use config::ServiceConfig;
pub use http::HttpServer;
pub use lifecycle::{ServiceRuntime, Shutdown};
pub use net::Mux;
pub use trace::Tracer;
