//! HTTP access to registered connections.
//!
//! `POST /data/{connection}/{table}` runs the request body as a raw
//! statement on the named connection, inside the request's scope.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;

use crate::db::operation::{Executor, Operation};
use crate::db::registry::ConnectionRegistry;
use crate::http::RegisterRoutes;
use crate::trace::RequestScope;

#[derive(Debug, Serialize)]
struct ExecutionResponse {
    connection: String,
    rows_affected: u64,
}

/// Registers the data routes over a shared registry.
pub struct DataRoutes<E> {
    registry: Arc<ConnectionRegistry<E>>,
}

impl<E> DataRoutes<E> {
    pub fn new(registry: Arc<ConnectionRegistry<E>>) -> Self {
        Self { registry }
    }
}

impl<E: Executor + 'static> RegisterRoutes for DataRoutes<E> {
    fn register_routes(&self, router: Router) -> Router {
        router.route(
            "/data/{connection}/{table}",
            post(execute_statement::<E>).with_state(Arc::clone(&self.registry)),
        )
    }
}

async fn execute_statement<E: Executor + 'static>(
    State(registry): State<Arc<ConnectionRegistry<E>>>,
    Path((connection, table)): Path<(String, String)>,
    scope: RequestScope,
    statement: String,
) -> Result<Json<ExecutionResponse>, StatusCode> {
    let client = registry.client(&connection, scope).map_err(|e| {
        tracing::debug!(error = %e, "Unknown connection requested");
        StatusCode::NOT_FOUND
    })?;

    match client.execute(&Operation::raw(table, statement)).await {
        Ok(execution) => Ok(Json(ExecutionResponse {
            connection,
            rows_affected: execution.rows_affected,
        })),
        Err(e) => {
            tracing::warn!(connection = %connection, error = %e, "Statement failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}
