//! Supervised server tasks.
//!
//! # Responsibilities
//! - Name each unit of concurrent work
//! - Run a set of tasks together and surface the first failure
//! - Turn panics into errors instead of silently losing a task
//!
//! # Design Decisions
//! - Fail fast: the first error aborts every other task, nothing restarts
//! - A task finishing cleanly does not end the group

use std::any::Any;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::task::JoinSet;

use crate::net::MuxError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Why a task ended unsuccessfully.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(#[source] BoxError),

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Task was aborted")]
    Aborted,
}

impl TaskError {
    pub fn failed(e: impl Into<BoxError>) -> Self {
        TaskError::Failed(e.into())
    }
}

impl From<io::Error> for TaskError {
    fn from(e: io::Error) -> Self {
        TaskError::failed(e)
    }
}

impl From<MuxError> for TaskError {
    fn from(e: MuxError) -> Self {
        TaskError::failed(e)
    }
}

/// A named future run under supervision.
pub struct ServerTask {
    name: String,
    future: BoxFuture<'static, Result<(), TaskError>>,
}

impl ServerTask {
    pub fn new<F, E>(name: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<TaskError>,
    {
        Self {
            name: name.into(),
            future: future.map(|result| result.map_err(Into::into)).boxed(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for ServerTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTask").field("name", &self.name).finish()
    }
}

/// The first task failure in a group.
#[derive(Debug, Error)]
#[error("Task `{name}` failed: {error}")]
pub struct TaskFailure {
    pub name: String,
    #[source]
    pub error: TaskError,
}

/// Tasks running concurrently as one unit.
#[derive(Default)]
pub struct TaskGroup {
    set: JoinSet<(String, Result<(), TaskError>)>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `task` now. Tasks start in the order they are spawned.
    pub fn spawn(&mut self, task: ServerTask) {
        let ServerTask { name, future } = task;
        tracing::debug!(task = %name, "Spawning task");
        self.set.spawn(async move {
            let result = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(TaskError::Panicked(panic_message(panic.as_ref()))),
            };
            (name, result)
        });
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Wait for the group.
    ///
    /// Returns the first failure after aborting the remaining tasks, or
    /// `Ok` once every task has finished cleanly.
    pub async fn wait(mut self) -> Result<(), TaskFailure> {
        while let Some(joined) = self.set.join_next().await {
            let (name, error) = match joined {
                Ok((name, Ok(()))) => {
                    tracing::info!(task = %name, remaining = self.set.len(), "Task finished");
                    continue;
                }
                Ok((name, Err(error))) => (name, error),
                Err(e) if e.is_panic() => (
                    "unknown".to_string(),
                    TaskError::Panicked(panic_message(e.into_panic().as_ref())),
                ),
                Err(_) => ("unknown".to_string(), TaskError::Aborted),
            };

            tracing::error!(task = %name, error = %error, "Task failed, stopping the group");
            self.set.shutdown().await;
            return Err(TaskFailure { name, error });
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn first_failure_wins_and_aborts_the_rest() {
        let mut group = TaskGroup::new();
        group.spawn(ServerTask::new("forever", async {
            std::future::pending::<()>().await;
            Ok::<_, TaskError>(())
        }));
        group.spawn(ServerTask::new("broken", async {
            Err::<(), _>(io::Error::new(io::ErrorKind::AddrInUse, "boom"))
        }));

        let failure = tokio::time::timeout(Duration::from_secs(5), group.wait())
            .await
            .expect("group must not wait for the endless task")
            .unwrap_err();
        assert_eq!(failure.name, "broken");
        assert!(failure.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn clean_completion_does_not_end_the_group() {
        let slow_done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&slow_done);

        let mut group = TaskGroup::new();
        group.spawn(ServerTask::new("quick", async { Ok::<_, TaskError>(()) }));
        group.spawn(ServerTask::new("slow", async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
            Ok::<_, TaskError>(())
        }));

        group.wait().await.unwrap();
        assert!(slow_done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panics_are_reported_as_failures() {
        let mut group = TaskGroup::new();
        group.spawn(ServerTask::new("forever", std::future::pending::<Result<(), TaskError>>()));
        group.spawn(ServerTask::new("panicky", async {
            if true {
                panic!("listener exploded");
            }
            Ok::<_, TaskError>(())
        }));

        let failure = group.wait().await.unwrap_err();
        assert_eq!(failure.name, "panicky");
        assert!(matches!(failure.error, TaskError::Panicked(ref msg) if msg == "listener exploded"));
    }

    #[tokio::test]
    async fn empty_group_is_ok() {
        assert!(TaskGroup::new().wait().await.is_ok());
    }
}
