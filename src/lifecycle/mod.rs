//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (runtime.rs):
//!     Bind socket → Register derived listeners → Spawn servers + accept loop
//!
//! Supervision (task.rs):
//!     First task error or panic → Abort the rest → Report to the caller
//!
//! Shutdown (shutdown.rs, signals.rs):
//!     SIGTERM/SIGINT → Broadcast → Accept loop and servers wind down → Exit
//! ```
//!
//! # Design Decisions
//! - Ordered startup: every listener exists before any server accepts
//! - Fail fast: a task failure is terminal, there is no restart
//! - Hung tasks are only ended by process termination

pub mod runtime;
pub mod shutdown;
pub mod signals;
pub mod task;

pub use runtime::{RuntimeError, ServiceRuntime};
pub use shutdown::Shutdown;
pub use task::{ServerTask, TaskError, TaskGroup};
