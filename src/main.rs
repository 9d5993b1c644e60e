//! mux-runtime
//!
//! Serves HTTP/1 and HTTP/2 from one socket, demultiplexed by protocol
//! sniffing, with B3-propagated request tracing.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌──────────────────────────────────────────────┐
//!   TCP connections    │  ┌───────────┐   ┌──────────┐                │
//!   ───────────────────┼─▶│    mux    │──▶│ matcher  │                │
//!                      │  │ (accept)  │   │ (sniff)  │                │
//!                      │  └─────┬─────┘   └──────────┘                │
//!                      │        ├──────────────┬──────────────┐       │
//!                      │        ▼              ▼              ▼       │
//!                      │  ┌──────────┐   ┌──────────┐   ┌──────────┐  │
//!                      │  │  http1   │   │  http2   │   │ default  │  │
//!                      │  │ listener │   │ listener │   │ listener │  │
//!                      │  └────┬─────┘   └────┬─────┘   └────┬─────┘  │
//!                      │       └──────┬───────┘              ▼        │
//!                      │              ▼                    close      │
//!                      │      ┌──────────────┐                        │
//!                      │      │ HTTP server  │──▶ root span ──▶ db    │
//!                      │      └──────────────┘     (scope)    spans   │
//!                      └──────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use mux_runtime::config::{load_config, ServiceConfig, UnmatchedPolicy};
use mux_runtime::db::{ConnectionRegistry, DataRoutes, MemoryExecutor};
use mux_runtime::http::RegisterRoutes;
use mux_runtime::lifecycle::{signals, RuntimeError, ServerTask, ServiceRuntime, Shutdown};
use mux_runtime::net::{close_unmatched, ProtocolClass};
use mux_runtime::observability::{logging, metrics};
use mux_runtime::{HttpServer, Tracer};

#[derive(Parser)]
#[command(name = "mux-runtime")]
#[command(about = "Protocol-multiplexed service runtime", version)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let loaded = match &cli.config {
        Some(path) => load_config(path).map(Some),
        None => Ok(None),
    };

    // Log with the loaded settings if there are any, defaults otherwise.
    let observability = match &loaded {
        Ok(Some(config)) => config.observability.clone(),
        _ => ServiceConfig::default().observability,
    };
    if let Err(e) = logging::init_logging(&observability) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let config = match loaded {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            tracing::error!(fatal = true, path = ?cli.config, error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.listener.bind_address,
        protocols = ?config.listener.protocols.iter().map(|p| p.class.as_str()).collect::<Vec<_>>(),
        unmatched = ?config.listener.unmatched,
        "mux-runtime starting"
    );

    let tracer = Tracer::from_config(&config.tracer);
    // No external data layer is attached; each key gets an in-process executor.
    let registry = match ConnectionRegistry::from_config(&config.database, &tracer, |_| MemoryExecutor::new()) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            tracing::error!(fatal = true, error = %e, "Invalid connection registry");
            return ExitCode::FAILURE;
        }
    };

    let exit = match run(config, tracer.clone(), registry).await {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(fatal = true, error = %e, "Runtime terminated");
            ExitCode::FAILURE
        }
    };

    // Flushing blocks on the exporter.
    if let Err(e) = tokio::task::spawn_blocking(move || tracer.shutdown()).await {
        tracing::error!(error = %e, "Tracer shutdown task failed");
    }
    exit
}

async fn run(
    config: ServiceConfig,
    tracer: Tracer,
    registry: Arc<ConnectionRegistry<MemoryExecutor>>,
) -> Result<(), RuntimeError> {
    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let mut runtime = ServiceRuntime::bind(&config.listener).await?;
    let shutdown = Shutdown::new();

    let routes: Arc<dyn RegisterRoutes> = Arc::new(DataRoutes::new(registry));
    let server = HttpServer::new(&config.http, tracer, &[routes]);
    let mut tasks = Vec::new();

    for protocol in &config.listener.protocols {
        match protocol.class {
            ProtocolClass::Http1 | ProtocolClass::Http2 => {
                let listener = runtime.listener(protocol.class)?;
                tasks.push(ServerTask::new(
                    protocol.class.as_str(),
                    server.clone().serve(listener, shutdown.subscribe()),
                ));
            }
            ProtocolClass::Tls => tracing::warn!(
                protocol = %protocol.class,
                unmatched = ?config.listener.unmatched,
                "No server for protocol, its connections follow the unmatched policy"
            ),
        }
    }

    if config.listener.unmatched == UnmatchedPolicy::Route {
        let fallback = runtime.default_listener()?;
        tasks.push(ServerTask::new("default", close_unmatched(fallback, shutdown.signalled())));
    }

    tasks.push(ServerTask::new("signals", signals::forward_signals(shutdown.clone())));

    tracing::info!(address = %runtime.local_addr(), "Listening for connections");
    runtime.start_with_shutdown(tasks, &shutdown).await
}
