//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router: health route plus every registrar's routes
//! - Wire up middleware (request tracing, timeout, request logging)
//! - Serve a derived listener from the multiplexer until shutdown

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::{middleware, routing::get, Json, Router};
use serde::Serialize;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::HttpConfig;
use crate::http::middleware::trace_middleware;
use crate::net::{MuxListener, PeerAddr};
use crate::trace::Tracer;

/// Something that contributes routes to the HTTP server.
pub trait RegisterRoutes: Send + Sync {
    fn register_routes(&self, router: Router) -> Router;
}

impl<F> RegisterRoutes for F
where
    F: Fn(Router) -> Router + Send + Sync,
{
    fn register_routes(&self, router: Router) -> Router {
        self(router)
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// HTTP server for one derived listener.
#[derive(Clone)]
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    /// Build the server. Registrars are applied in order.
    pub fn new(config: &HttpConfig, tracer: Tracer, registrars: &[Arc<dyn RegisterRoutes>]) -> Self {
        Self {
            router: Self::build_router(config, tracer, registrars),
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &HttpConfig, tracer: Tracer, registrars: &[Arc<dyn RegisterRoutes>]) -> Router {
        let routes = registrars.iter().fold(
            Router::new().route("/health", get(health_handler)),
            |router, registrar| registrar.register_routes(router),
        );

        let router = match context_path(&config.context_path) {
            Some(path) => Router::new().nest(path, routes),
            None => routes,
        };

        // Outermost first: the request span also covers timed-out requests.
        let router = router.layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn_with_state(tracer, trace_middleware))
                .layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout_secs))),
        );

        if config.debug {
            router.layer(TraceLayer::new_for_http())
        } else {
            router
        }
    }

    /// The fully layered router, for serving it elsewhere or in tests.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run the server, accepting connections on the given listener.
    pub async fn serve(
        self,
        listener: MuxListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), io::Error> {
        let label = listener.label();
        tracing::info!(
            address = %listener.local_addr(),
            listener = label,
            "HTTP server starting"
        );

        let app = self.router.into_make_service_with_connect_info::<PeerAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;

        tracing::info!(listener = label, "HTTP server stopped");
        Ok(())
    }
}

/// The prefix to nest routes under, `None` when routes live at the root.
fn context_path(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    (!trimmed.is_empty()).then_some(trimmed)
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
