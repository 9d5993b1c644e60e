//! Data-layer operations and the executor seam.

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};

/// Category of a data-layer action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Query,
    Update,
    Delete,
    /// Raw statement; its verb comes from the statement text.
    RowQuery,
}

impl OperationKind {
    pub const ALL: [OperationKind; 5] = [
        OperationKind::Create,
        OperationKind::Query,
        OperationKind::Update,
        OperationKind::Delete,
        OperationKind::RowQuery,
    ];

    /// SQL verb implied by the kind, `None` for raw statements.
    pub fn verb(self) -> Option<&'static str> {
        match self {
            OperationKind::Create => Some("INSERT"),
            OperationKind::Query => Some("SELECT"),
            OperationKind::Update => Some("UPDATE"),
            OperationKind::Delete => Some("DELETE"),
            OperationKind::RowQuery => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Query => "query",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::RowQuery => "row_query",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One statement handed to the data layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    pub table: String,
    /// Final statement text, after parameter binding.
    pub statement: String,
}

impl Operation {
    pub fn new(kind: OperationKind, table: impl Into<String>, statement: impl Into<String>) -> Self {
        Self {
            kind,
            table: table.into(),
            statement: statement.into(),
        }
    }

    pub fn create(table: impl Into<String>, statement: impl Into<String>) -> Self {
        Self::new(OperationKind::Create, table, statement)
    }

    pub fn query(table: impl Into<String>, statement: impl Into<String>) -> Self {
        Self::new(OperationKind::Query, table, statement)
    }

    pub fn update(table: impl Into<String>, statement: impl Into<String>) -> Self {
        Self::new(OperationKind::Update, table, statement)
    }

    pub fn delete(table: impl Into<String>, statement: impl Into<String>) -> Self {
        Self::new(OperationKind::Delete, table, statement)
    }

    pub fn raw(table: impl Into<String>, statement: impl Into<String>) -> Self {
        Self::new(OperationKind::RowQuery, table, statement)
    }
}

/// Outcome of a successful operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Execution {
    pub rows_affected: u64,
}

/// What the tracer records about a completed operation.
#[derive(Debug, Clone, Copy)]
pub struct OperationMeta<'a> {
    pub statement: &'a str,
    pub table: &'a str,
    pub failed: bool,
    pub rows_affected: u64,
}

impl<'a> OperationMeta<'a> {
    /// Metadata for `op` given the executor's result.
    pub fn from_result<E>(op: &'a Operation, result: &Result<Execution, E>) -> Self {
        let (failed, rows_affected) = match result {
            Ok(execution) => (false, execution.rows_affected),
            Err(_) => (true, 0),
        };
        Self {
            statement: &op.statement,
            table: &op.table,
            failed,
            rows_affected,
        }
    }
}

/// The data layer being traced.
pub trait Executor: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn execute(&self, op: &Operation) -> impl Future<Output = Result<Execution, Self::Error>> + Send;
}
