//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Derived listener (HTTP/1 or HTTP/2 connections from the mux)
//!     → server.rs (Axum setup, timeout and request logging layers)
//!     → middleware.rs (B3 extract, root span, RequestScope into extensions)
//!     → registered routes (handlers extract RequestScope)
//!     → middleware.rs (status tags, span finish)
//!     → Send to client
//! ```

pub mod middleware;
pub mod server;

pub use middleware::{trace_middleware, X_REQUEST_ID};
pub use server::{HttpServer, RegisterRoutes};
