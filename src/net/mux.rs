//! Connection multiplexer over one bound socket.
//!
//! # Responsibilities
//! - Own the bound socket and run the accept loop
//! - Classify every connection on its own task (never on the accept loop)
//! - Route classified connections to the matching derived listener
//! - Apply the unmatched policy and queue limits
//!
//! # Design Decisions
//! - Listeners are registered before `serve` consumes the mux, so no
//!   derived listener can exist without a running accept loop behind it
//! - A full queue applies backpressure; only the overflow beyond
//!   `max_pending` waiting connections is closed
//! - Misbehaving connections cost one task, never the accept loop

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::config::{ListenerConfig, UnmatchedPolicy};
use crate::net::connection::{ConnectionId, MuxStream};
use crate::net::listener::{self, MuxListener};
use crate::net::matcher::{read_prefix, ProtocolClass, ProtocolMatcher, Verdict};
use crate::observability::metrics;

/// Pause after the process or system runs out of descriptors or buffers.
const EXHAUSTION_BACKOFF: Duration = Duration::from_millis(50);

/// Error type for multiplexer operations.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Failed to bind: {0}")]
    Bind(#[source] io::Error),

    #[error("Failed to accept: {0}")]
    Accept(#[source] io::Error),

    #[error("A listener for `{0}` is already registered")]
    DuplicateListener(&'static str),

    #[error("Protocol `{0}` is not enabled on this listener")]
    ProtocolNotEnabled(ProtocolClass),

    #[error("Multiplexer closed")]
    Closed,
}

/// Sending half of a derived listener's queue.
#[derive(Debug, Clone)]
struct Route {
    label: &'static str,
    tx: mpsc::Sender<MuxStream>,
    /// Connections currently blocked on a full queue.
    waiting: Arc<AtomicUsize>,
}

/// Why a classified connection did not reach its listener.
#[derive(Debug)]
enum Rejection {
    QueueFull,
    ListenerGone,
}

impl Route {
    fn new(label: &'static str, tx: mpsc::Sender<MuxStream>) -> Self {
        Self {
            label,
            tx,
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    async fn push(&self, stream: MuxStream, max_pending: usize) -> Result<(), Rejection> {
        let stream = match self.tx.try_send(stream) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => return Err(Rejection::ListenerGone),
            Err(TrySendError::Full(stream)) => stream,
        };

        let guard = WaitGuard::enter(&self.waiting);
        if guard.position >= max_pending {
            return Err(Rejection::QueueFull);
        }
        let sent = self.tx.send(stream).await;
        drop(guard);
        sent.map_err(|_| Rejection::ListenerGone)
    }
}

/// Counts a connection as waiting for queue space while held.
struct WaitGuard<'a> {
    counter: &'a AtomicUsize,
    position: usize,
}

impl<'a> WaitGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let position = counter.fetch_add(1, Ordering::SeqCst);
        Self { counter, position }
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Frozen routing table shared by classification tasks.
#[derive(Debug)]
struct RouteTable {
    routes: HashMap<ProtocolClass, Route>,
    fallback: Option<Route>,
    policy: UnmatchedPolicy,
    max_pending: usize,
}

impl RouteTable {
    fn select(&self, class: Option<ProtocolClass>) -> Option<&Route> {
        if let Some(route) = class.and_then(|c| self.routes.get(&c)) {
            return Some(route);
        }
        match self.policy {
            UnmatchedPolicy::Route => self.fallback.as_ref(),
            UnmatchedPolicy::Close => None,
        }
    }
}

/// Demultiplexes one socket into per-protocol listeners.
pub struct Mux {
    listener: TcpListener,
    local_addr: SocketAddr,
    matcher: Arc<ProtocolMatcher>,
    routes: HashMap<ProtocolClass, Route>,
    fallback: Option<Route>,
    policy: UnmatchedPolicy,
    queue_capacity: usize,
    max_pending: usize,
}

impl Mux {
    /// Bind the configured address and build a multiplexer over it.
    pub async fn bind(config: &ListenerConfig) -> Result<Self, MuxError> {
        let socket = listener::bind(config).await?;
        Self::new(socket, config).map_err(MuxError::Bind)
    }

    /// Build a multiplexer over an already bound socket.
    pub fn new(listener: TcpListener, config: &ListenerConfig) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            matcher: Arc::new(ProtocolMatcher::from_config(config)),
            routes: HashMap::new(),
            fallback: None,
            policy: config.unmatched,
            queue_capacity: config.queue_capacity.max(1),
            max_pending: config.max_pending,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register the listener for `class`.
    pub fn listen(&mut self, class: ProtocolClass) -> Result<MuxListener, MuxError> {
        if !self.matcher.classes().any(|c| c == class) {
            return Err(MuxError::ProtocolNotEnabled(class));
        }
        if self.routes.contains_key(&class) {
            return Err(MuxError::DuplicateListener(class.as_str()));
        }
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.routes.insert(class, Route::new(class.as_str(), tx));
        tracing::debug!(protocol = %class, "Derived listener registered");
        Ok(MuxListener::new(Some(class), rx, self.local_addr))
    }

    /// Register the catch-all listener for unmatched connections.
    pub fn default_listener(&mut self) -> Result<MuxListener, MuxError> {
        if self.fallback.is_some() {
            return Err(MuxError::DuplicateListener("default"));
        }
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.fallback = Some(Route::new("default", tx));
        tracing::debug!("Default listener registered");
        Ok(MuxListener::new(None, rx, self.local_addr))
    }

    /// Run the accept loop until an unrecoverable accept error.
    pub async fn serve(self) -> Result<(), MuxError> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Run the accept loop until `signal` resolves or accepting fails.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<(), MuxError>
    where
        F: Future<Output = ()> + Send,
    {
        let Mux {
            listener,
            local_addr,
            matcher,
            routes,
            fallback,
            policy,
            max_pending,
            ..
        } = self;

        let table = Arc::new(RouteTable {
            routes,
            fallback,
            policy,
            max_pending,
        });

        tracing::info!(
            address = %local_addr,
            listeners = table.routes.len() + usize::from(table.fallback.is_some()),
            unmatched = ?table.policy,
            "Multiplexer accepting connections"
        );

        tokio::pin!(signal);
        loop {
            let (stream, peer) = tokio::select! {
                _ = &mut signal => {
                    tracing::info!("Multiplexer received shutdown signal, exiting loop");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) if is_resource_exhaustion(&e) => {
                        tracing::warn!(error = %e, "Accept failed on resource exhaustion, backing off");
                        tokio::time::sleep(EXHAUSTION_BACKOFF).await;
                        continue;
                    }
                    Err(e) if is_transient(&e) => {
                        tracing::debug!(error = %e, "Transient accept error");
                        continue;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Accept failed");
                        return Err(MuxError::Accept(e));
                    }
                },
            };

            let matcher = Arc::clone(&matcher);
            let table = Arc::clone(&table);
            tokio::spawn(async move {
                classify_and_route(stream, peer, &matcher, &table).await;
            });
        }
    }
}

/// Accept errors that concern one connection, or a shortage that clears
/// once connections close. The loop keeps running through these.
fn is_transient(e: &io::Error) -> bool {
    is_resource_exhaustion(e)
        || matches!(
            e.kind(),
            io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::Interrupted
                | io::ErrorKind::WouldBlock
                | io::ErrorKind::TimedOut
        )
}

/// ENFILE, EMFILE or ENOBUFS.
fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(23 | 24 | 105))
}

async fn classify_and_route(
    mut stream: TcpStream,
    peer: SocketAddr,
    matcher: &ProtocolMatcher,
    table: &RouteTable,
) {
    let id = ConnectionId::new();

    let (verdict, prefix) = match read_prefix(&mut stream, matcher).await {
        Ok(result) => result,
        Err(e) => {
            tracing::debug!(connection_id = %id, peer_addr = %peer, error = %e, "Classification failed, closing");
            metrics::record_classification_error();
            return;
        }
    };

    let class = match verdict {
        Verdict::Matched(class) => Some(class),
        Verdict::Unmatched | Verdict::Pending => None,
    };

    let Some(route) = table.select(class) else {
        tracing::debug!(
            connection_id = %id,
            peer_addr = %peer,
            prefix_len = prefix.len(),
            "No listener for connection, closing"
        );
        metrics::record_connection("closed");
        let _ = stream.shutdown().await;
        return;
    };

    tracing::trace!(
        connection_id = %id,
        peer_addr = %peer,
        listener = route.label,
        "Connection classified"
    );
    metrics::record_connection(route.label);

    let conn = MuxStream::new(stream, prefix, peer, id);
    if let Err(reason) = route.push(conn, table.max_pending).await {
        tracing::warn!(
            connection_id = %id,
            peer_addr = %peer,
            listener = route.label,
            reason = ?reason,
            "Connection rejected"
        );
        metrics::record_rejected(route.label);
    }
}
