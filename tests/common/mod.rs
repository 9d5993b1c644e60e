//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use opentelemetry::Value;
use opentelemetry_sdk::trace::{InMemorySpanExporter, SpanData};

use mux_runtime::config::{ListenerConfig, ProtocolConfig, TracerConfig, UnmatchedPolicy};
use mux_runtime::lifecycle::{RuntimeError, ServerTask, ServiceRuntime, Shutdown};
use mux_runtime::net::{close_unmatched, ProtocolClass};
use mux_runtime::{HttpServer, Tracer};

/// A runtime serving `HttpServer` on an ephemeral port.
pub struct TestService {
    pub addr: SocketAddr,
    shutdown: Shutdown,
    handle: JoinHandle<Result<(), RuntimeError>>,
}

impl TestService {
    pub async fn start(config: ListenerConfig, server: HttpServer) -> Self {
        let mut runtime = ServiceRuntime::bind(&config).await.unwrap();
        let shutdown = Shutdown::new();

        let mut tasks = Vec::new();
        for protocol in &config.protocols {
            if matches!(protocol.class, ProtocolClass::Http1 | ProtocolClass::Http2) {
                let listener = runtime.listener(protocol.class).unwrap();
                tasks.push(ServerTask::new(
                    protocol.class.as_str(),
                    server.clone().serve(listener, shutdown.subscribe()),
                ));
            }
        }
        if config.unmatched == UnmatchedPolicy::Route {
            let fallback = runtime.default_listener().unwrap();
            tasks.push(ServerTask::new("default", close_unmatched(fallback, shutdown.signalled())));
        }

        let addr = runtime.local_addr();
        let signal = shutdown.clone();
        let handle = tokio::spawn(async move { runtime.start_with_shutdown(tasks, &signal).await });

        Self {
            addr,
            shutdown,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Trigger shutdown and wait for the runtime's result.
    pub async fn stop(self) -> Result<(), RuntimeError> {
        self.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("runtime did not stop")
            .unwrap()
    }
}

/// Listener config on 127.0.0.1:0 for `protocols`, in priority order.
pub fn listener_config(protocols: &[ProtocolClass], unmatched: UnmatchedPolicy) -> ListenerConfig {
    ListenerConfig {
        bind_address: "127.0.0.1:0".into(),
        protocols: protocols.iter().map(|class| ProtocolConfig::new(*class)).collect(),
        unmatched,
        ..ListenerConfig::default()
    }
}

/// A tracer exporting into memory.
pub fn traced() -> (Tracer, InMemorySpanExporter) {
    let exporter = InMemorySpanExporter::default();
    (Tracer::with_exporter(&TracerConfig::default(), exporter.clone()), exporter)
}

pub fn finished(exporter: &InMemorySpanExporter) -> Vec<SpanData> {
    exporter.get_finished_spans().unwrap()
}

pub fn attr<'a>(span: &'a SpanData, key: &str) -> Option<&'a Value> {
    span.attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| &kv.value)
}

/// HTTP client that ignores proxy environment variables.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// Write `bytes` on a fresh connection and read until the server closes it.
/// The write half stays open, so the server decides when to close.
///
/// A server closing a socket with unread input sends RST instead of FIN;
/// both count as closed here, with whatever was read before the reset.
pub async fn send_raw(addr: SocketAddr, bytes: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(bytes).await.unwrap();

    let mut response = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), async {
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => return Ok(()),
                Ok(n) => response.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    })
    .await
    .expect("server never closed the connection");
    read.unwrap();
    response
}
