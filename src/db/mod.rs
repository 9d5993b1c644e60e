//! Data-operation tracing subsystem.
//!
//! # Data Flow
//! ```text
//! Handler (holds the request's RequestScope; routes.rs is the built-in one)
//!     → registry.rs (connection picked by explicit key)
//!     → connection.rs (TracedConnection::execute)
//!         → interceptor.rs before: SQL child span of the scope's parent
//!         → operation.rs Executor::execute (the data layer)
//!         → interceptor.rs after: tags, finish
//!     → executor result, unchanged
//! ```
//!
//! # Design Decisions
//! - One fixed enum of operation kinds; explicit kinds carry their verb,
//!   raw statements take it from the statement text
//! - No parent span, no operation span
//! - The registry is owned by the application, not global

pub mod connection;
pub mod interceptor;
pub mod memory;
pub mod operation;
pub mod registry;
pub mod routes;

pub use connection::TracedConnection;
pub use interceptor::{derive_verb, OpHandle, OperationTracer};
pub use memory::{MemoryError, MemoryExecutor};
pub use operation::{Execution, Executor, Operation, OperationKind, OperationMeta};
pub use registry::{ConnectionRegistry, RegistryError, ScopedClient, DEFAULT_CONNECTION};
pub use routes::DataRoutes;
