//! Multiplexed service runtime.
//!
//! # Responsibilities
//! - Bind the shared socket and own the multiplexer
//! - Hand out derived listeners before anything starts accepting
//! - Run the servers and the accept loop as one supervised group
//!
//! # Design Decisions
//! - `start` consumes the runtime, so listener registration cannot race
//!   with the accept loop
//! - No retries: the first task failure ends the runtime

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::ListenerConfig;
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::task::{ServerTask, TaskError, TaskFailure, TaskGroup};
use crate::net::{Mux, MuxError, MuxListener, ProtocolClass};

/// Name of the accept loop task.
pub const MUX_TASK: &str = "mux";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to bind listener: {0}")]
    Bind(#[source] MuxError),

    #[error("Failed to register listener: {0}")]
    Listener(#[source] MuxError),

    #[error("Task `{name}` failed: {source}")]
    Task {
        name: String,
        #[source]
        source: TaskError,
    },
}

impl From<TaskFailure> for RuntimeError {
    fn from(failure: TaskFailure) -> Self {
        RuntimeError::Task {
            name: failure.name,
            source: failure.error,
        }
    }
}

/// One socket, many servers.
pub struct ServiceRuntime {
    mux: Mux,
}

impl ServiceRuntime {
    /// Bind the configured address. Failure here is fatal to startup.
    pub async fn bind(config: &ListenerConfig) -> Result<Self, RuntimeError> {
        let mux = Mux::bind(config).await.map_err(RuntimeError::Bind)?;
        Ok(Self { mux })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.mux.local_addr()
    }

    /// Derived listener for `class`.
    pub fn listener(&mut self, class: ProtocolClass) -> Result<MuxListener, RuntimeError> {
        self.mux.listen(class).map_err(RuntimeError::Listener)
    }

    /// Catch-all listener for unmatched connections.
    pub fn default_listener(&mut self) -> Result<MuxListener, RuntimeError> {
        self.mux.default_listener().map_err(RuntimeError::Listener)
    }

    /// Run `tasks` and the accept loop until one of them fails.
    pub async fn start(self, tasks: Vec<ServerTask>) -> Result<(), RuntimeError> {
        let mux = self.mux;
        run_group(tasks, ServerTask::new(MUX_TASK, mux.serve())).await
    }

    /// Like [`start`](Self::start), but the accept loop also stops when
    /// `shutdown` fires. Returns `Ok` once every task has wound down.
    pub async fn start_with_shutdown(
        self,
        tasks: Vec<ServerTask>,
        shutdown: &Shutdown,
    ) -> Result<(), RuntimeError> {
        let signal = shutdown.signalled();
        let mux = self.mux;
        run_group(tasks, ServerTask::new(MUX_TASK, mux.serve_with_shutdown(signal))).await
    }
}

async fn run_group(tasks: Vec<ServerTask>, accept_loop: ServerTask) -> Result<(), RuntimeError> {
    let mut group = TaskGroup::new();
    for task in tasks {
        group.spawn(task);
    }
    group.spawn(accept_loop);

    tracing::info!(tasks = group.len(), "Service runtime started");
    group.wait().await?;
    tracing::info!("Service runtime stopped");
    Ok(())
}
