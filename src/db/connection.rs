//! Traced wrapper around a data-layer executor.

use crate::db::interceptor::OperationTracer;
use crate::db::operation::{Execution, Executor, Operation, OperationMeta};
use crate::trace::RequestScope;

/// An executor whose every operation runs inside an [`OperationTracer`]
/// before/after pair.
#[derive(Debug)]
pub struct TracedConnection<E> {
    executor: E,
    tracer: OperationTracer,
}

impl<E: Executor> TracedConnection<E> {
    pub fn new(executor: E, tracer: OperationTracer) -> Self {
        Self { executor, tracer }
    }

    /// Run `op` on behalf of the request owning `scope`.
    ///
    /// The span opens before the executor is called and finishes after it
    /// returns, on success and on error alike. The executor's result is
    /// returned untouched.
    pub async fn execute(&self, scope: &RequestScope, op: &Operation) -> Result<Execution, E::Error> {
        let handle = self.tracer.before(op.kind, scope);
        let result = self.executor.execute(op).await;

        if let Err(e) = &result {
            tracing::debug!(kind = %op.kind, table = %op.table, error = %e, "Operation failed");
        }
        self.tracer.after(handle, &OperationMeta::from_result(op, &result));
        result
    }
}
