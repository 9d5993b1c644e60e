//! In-process executor that keeps per-table row counts.
//!
//! Used by tests and local runs where no database is attached.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use thiserror::Error;

use crate::db::operation::{Execution, Executor, Operation, OperationKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("Table `{0}` is unavailable")]
    Unavailable(String),
}

/// Counts rows per table; statements themselves are not interpreted.
#[derive(Debug, Clone, Default)]
pub struct MemoryExecutor {
    rows: Arc<DashMap<String, u64>>,
    failing: Arc<DashSet<String>>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later operation on `table` fail.
    pub fn fail_table(&self, table: impl Into<String>) {
        self.failing.insert(table.into());
    }

    pub fn rows(&self, table: &str) -> u64 {
        self.rows.get(table).map(|n| *n).unwrap_or(0)
    }

    fn apply(&self, op: &Operation) -> Result<Execution, MemoryError> {
        if self.failing.contains(&op.table) {
            return Err(MemoryError::Unavailable(op.table.clone()));
        }

        let mut rows = self.rows.entry(op.table.clone()).or_insert(0);
        let rows_affected = match op.kind {
            OperationKind::Create => {
                *rows += 1;
                1
            }
            OperationKind::Delete => std::mem::take(&mut *rows),
            OperationKind::Query | OperationKind::Update | OperationKind::RowQuery => *rows,
        };
        Ok(Execution { rows_affected })
    }
}

impl Executor for MemoryExecutor {
    type Error = MemoryError;

    async fn execute(&self, op: &Operation) -> Result<Execution, MemoryError> {
        self.apply(op)
    }
}
