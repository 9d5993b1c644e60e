//! Keyed set of traced connections.
//!
//! The registry is built at startup and handed to whatever needs data
//! access; lookups name their connection explicitly.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use crate::config::DatabaseConfig;
use crate::db::connection::TracedConnection;
use crate::db::interceptor::OperationTracer;
use crate::db::operation::{Execution, Executor, Operation};
use crate::trace::{RequestScope, Tracer};

/// Key used when callers do not need more than one connection.
pub const DEFAULT_CONNECTION: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("No connection registered under `{0}`")]
    UnknownConnection(String),

    #[error("A connection is already registered under `{0}`")]
    DuplicateConnection(String),
}

pub struct ConnectionRegistry<E> {
    connections: DashMap<String, Arc<TracedConnection<E>>>,
}

impl<E> Default for ConnectionRegistry<E> {
    fn default() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }
}

impl<E: Executor> ConnectionRegistry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// One traced connection per configured key, each over the executor
    /// `connect` opens for that key.
    pub fn from_config<F>(config: &DatabaseConfig, tracer: &Tracer, mut connect: F) -> Result<Self, RegistryError>
    where
        F: FnMut(&str) -> E,
    {
        let registry = Self::new();
        for key in &config.connections {
            let conn = TracedConnection::new(connect(key), OperationTracer::new(tracer.clone()));
            registry.register(key.as_str(), conn)?;
        }
        Ok(registry)
    }

    /// Register `conn` under `key`. The first registration for a key wins.
    pub fn register(&self, key: impl Into<String>, conn: TracedConnection<E>) -> Result<(), RegistryError> {
        let key = key.into();
        match self.connections.entry(key) {
            Entry::Occupied(entry) => {
                Err(RegistryError::DuplicateConnection(entry.key().clone()))
            }
            Entry::Vacant(entry) => {
                tracing::info!(connection = %entry.key(), "Connection registered");
                entry.insert(Arc::new(conn));
                Ok(())
            }
        }
    }

    pub fn get(&self, key: &str) -> Result<Arc<TracedConnection<E>>, RegistryError> {
        self.connections
            .get(key)
            .map(|conn| Arc::clone(conn.value()))
            .ok_or_else(|| RegistryError::UnknownConnection(key.to_string()))
    }

    /// A handle on connection `key` bound to one request's scope.
    pub fn client(&self, key: &str, scope: RequestScope) -> Result<ScopedClient<E>, RegistryError> {
        Ok(ScopedClient {
            conn: self.get(key)?,
            scope,
        })
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// A connection bound to the request scope its operations belong to.
pub struct ScopedClient<E> {
    conn: Arc<TracedConnection<E>>,
    scope: RequestScope,
}

impl<E: Executor> ScopedClient<E> {
    pub async fn execute(&self, op: &Operation) -> Result<Execution, E::Error> {
        self.conn.execute(&self.scope, op).await
    }
}

#[cfg(test)]
mod tests {
    use opentelemetry::{Context, Value};

    use super::*;
    use crate::config::TracerConfig;
    use crate::db::interceptor::OperationTracer;
    use crate::db::memory::{MemoryError, MemoryExecutor};
    use crate::db::operation::OperationKind;
    use crate::trace::testing::{attr, finished, traced};
    use crate::trace::Tracer;

    fn registry(tracer: Tracer, executor: MemoryExecutor) -> ConnectionRegistry<MemoryExecutor> {
        let registry = ConnectionRegistry::new();
        registry
            .register(DEFAULT_CONNECTION, TracedConnection::new(executor, OperationTracer::new(tracer)))
            .unwrap();
        registry
    }

    #[test]
    fn lookup_is_by_explicit_key() {
        let registry = registry(Tracer::disabled(), MemoryExecutor::new());
        assert!(registry.get(DEFAULT_CONNECTION).is_ok());
        assert_eq!(
            registry.get("reporting").err(),
            Some(RegistryError::UnknownConnection("reporting".into()))
        );
        assert!(registry.client("reporting", RequestScope::new()).is_err());

        let again = TracedConnection::new(MemoryExecutor::new(), OperationTracer::default());
        assert_eq!(
            registry.register(DEFAULT_CONNECTION, again),
            Err(RegistryError::DuplicateConnection(DEFAULT_CONNECTION.into()))
        );
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn built_from_config_with_one_connection_per_key() {
        let config = DatabaseConfig {
            connections: vec![DEFAULT_CONNECTION.into(), "reporting".into()],
        };
        let (tracer, exporter) = traced(TracerConfig::default());
        let mut opened = Vec::new();
        let registry = ConnectionRegistry::from_config(&config, &tracer, |key| {
            opened.push(key.to_string());
            MemoryExecutor::new()
        })
        .unwrap();
        assert_eq!(opened, ["default", "reporting"]);
        assert_eq!(registry.len(), 2);

        let root = tracer.start_root_span("HTTP GET", &Context::new()).unwrap();
        let client = registry.client("reporting", RequestScope::with_parent(root.context())).unwrap();
        client.execute(&Operation::query("events", "SELECT * FROM events")).await.unwrap();
        assert_eq!(finished(&exporter).len(), 1);

        let twice = DatabaseConfig {
            connections: vec!["a".into(), "a".into()],
        };
        assert_eq!(
            ConnectionRegistry::from_config(&twice, &tracer, |_| MemoryExecutor::new()).err(),
            Some(RegistryError::DuplicateConnection("a".into()))
        );
    }

    #[tokio::test]
    async fn untraced_request_creates_no_spans() {
        let (tracer, exporter) = traced(TracerConfig::default());
        let registry = registry(tracer, MemoryExecutor::new());
        let client = registry.client(DEFAULT_CONNECTION, RequestScope::new()).unwrap();

        for _ in 0..10 {
            client.execute(&Operation::create("users", "INSERT INTO users VALUES (1)")).await.unwrap();
            client.execute(&Operation::raw("users", "SELECT count(*) FROM users")).await.unwrap();
        }
        assert!(finished(&exporter).is_empty());
    }

    #[tokio::test]
    async fn each_operation_gets_one_child_span() {
        let (tracer, exporter) = traced(TracerConfig::default());
        let root = tracer.start_root_span("HTTP POST", &Context::new()).unwrap();
        let parent = root.context();
        let registry = registry(tracer, MemoryExecutor::new());
        let client = registry.client(DEFAULT_CONNECTION, RequestScope::with_parent(parent.clone())).unwrap();

        let ops = [
            Operation::create("users", "INSERT INTO users (name) VALUES ('a')"),
            Operation::create("users", "INSERT INTO users (name) VALUES ('b')"),
            Operation::query("users", "SELECT * FROM users"),
            Operation::update("users", "UPDATE users SET name = 'c'"),
            Operation::raw("users", "SELECT * FROM users"),
            Operation::delete("users", "DELETE FROM users"),
        ];
        for op in &ops {
            client.execute(op).await.unwrap();
        }

        let spans = finished(&exporter);
        assert_eq!(spans.len(), ops.len());
        let methods: Vec<_> = spans
            .iter()
            .map(|s| attr(s, "db.method").unwrap().as_str().into_owned())
            .collect();
        assert_eq!(methods, ["INSERT", "INSERT", "SELECT", "UPDATE", "SELECT", "DELETE"]);
        assert!(spans.iter().all(|s| s.parent_span_id == parent.span_id()));
        assert!(spans.iter().all(|s| s.span_context.trace_id() == parent.trace_id()));

        let counts: Vec<_> = spans
            .iter()
            .map(|s| attr(s, "db.count").cloned().unwrap())
            .collect();
        assert_eq!(counts, [1i64, 1, 2, 2, 2, 2].map(Value::I64));

        let mut ids: Vec<_> = spans.iter().map(|s| s.span_context.span_id()).collect();
        ids.sort_by_key(|id| id.to_string());
        ids.dedup();
        assert_eq!(ids.len(), ops.len());
    }

    #[tokio::test]
    async fn failing_operation_keeps_its_error_and_tags_the_span() {
        let (tracer, exporter) = traced(TracerConfig::default());
        let root = tracer.start_root_span("HTTP GET", &Context::new()).unwrap();
        let executor = MemoryExecutor::new();
        executor.fail_table("orders");
        let registry = registry(tracer, executor);
        let client = registry.client(DEFAULT_CONNECTION, RequestScope::with_parent(root.context())).unwrap();

        let err = client
            .execute(&Operation::new(OperationKind::Query, "orders", "SELECT * FROM orders"))
            .await
            .unwrap_err();
        assert_eq!(err, MemoryError::Unavailable("orders".into()));

        let spans = finished(&exporter);
        assert_eq!(spans.len(), 1);
        assert_eq!(attr(&spans[0], "error"), Some(&Value::Bool(true)));
        assert_eq!(attr(&spans[0], "db.err"), Some(&Value::Bool(true)));
        assert_eq!(attr(&spans[0], "db.table"), Some(&Value::from("orders")));
        assert_eq!(attr(&spans[0], "db.count"), Some(&Value::I64(0)));
    }
}
