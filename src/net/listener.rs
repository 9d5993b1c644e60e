//! Socket binding and derived listeners.
//!
//! # Responsibilities
//! - Bind the shared socket to the configured address
//! - Expose one accept queue per protocol class as a standalone listener
//! - Plug derived listeners into axum without the server knowing about the mux

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use axum::extract::connect_info::Connected;
use axum::serve::IncomingStream;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::config::ListenerConfig;
use crate::net::connection::MuxStream;
use crate::net::matcher::ProtocolClass;
use crate::net::mux::MuxError;

/// Bind the shared socket for the multiplexer.
pub async fn bind(config: &ListenerConfig) -> Result<TcpListener, MuxError> {
    let addr: SocketAddr = config
        .bind_address
        .parse()
        .map_err(|e| MuxError::Bind(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

    let listener = TcpListener::bind(addr).await.map_err(MuxError::Bind)?;
    let local_addr = listener.local_addr().map_err(MuxError::Bind)?;

    tracing::info!(
        address = %local_addr,
        protocols = ?config.protocols.iter().map(|p| p.class.as_str()).collect::<Vec<_>>(),
        "Listener bound"
    );

    Ok(listener)
}

/// A listener fed by the multiplexer with connections of one protocol class
/// (or, for the default listener, connections no class claimed).
#[derive(Debug)]
pub struct MuxListener {
    class: Option<ProtocolClass>,
    rx: mpsc::Receiver<MuxStream>,
    local_addr: SocketAddr,
}

impl MuxListener {
    pub(crate) fn new(
        class: Option<ProtocolClass>,
        rx: mpsc::Receiver<MuxStream>,
        local_addr: SocketAddr,
    ) -> Self {
        Self {
            class,
            rx,
            local_addr,
        }
    }

    /// Wait for the next connection routed to this listener.
    ///
    /// Fails with [`MuxError::Closed`] once the multiplexer has stopped and
    /// the queue is drained.
    pub async fn accept(&mut self) -> Result<(MuxStream, SocketAddr), MuxError> {
        let stream = self.rx.recv().await.ok_or(MuxError::Closed)?;
        let peer = stream.peer_addr();
        Ok((stream, peer))
    }

    /// Address of the shared socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Protocol class served, or `None` for the default listener.
    pub fn class(&self) -> Option<ProtocolClass> {
        self.class
    }

    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        self.class.map(ProtocolClass::as_str).unwrap_or("default")
    }
}

/// Accept and immediately close every connection on `listener` until
/// `shutdown` resolves or the multiplexer stops.
///
/// Serves the default listener when nothing speaks the unmatched traffic.
pub async fn close_unmatched<F>(mut listener: MuxListener, shutdown: F) -> Result<(), MuxError>
where
    F: Future<Output = ()> + Send,
{
    tokio::pin!(shutdown);
    loop {
        let accepted = tokio::select! {
            _ = &mut shutdown => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((mut stream, peer)) => {
                tracing::info!(
                    connection_id = %stream.id(),
                    peer_addr = %peer,
                    listener = listener.label(),
                    buffered = stream.buffered().len(),
                    "Closing unmatched connection"
                );
                let _ = stream.shutdown().await;
            }
            Err(MuxError::Closed) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

/// Peer address of a multiplexed connection, as axum `ConnectInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

impl Connected<IncomingStream<'_, MuxListener>> for PeerAddr {
    fn connect_info(stream: IncomingStream<'_, MuxListener>) -> Self {
        Self(*stream.remote_addr())
    }
}

impl axum::serve::Listener for MuxListener {
    type Io = MuxStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.rx.recv().await {
            Some(stream) => {
                let peer = stream.peer_addr();
                (stream, peer)
            }
            // axum's accept cannot fail; the runtime tears this task down
            // once the multiplexer has exited.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> (mpsc::Sender<MuxStream>, MuxListener) {
        let (tx, rx) = mpsc::channel(4);
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        (tx, MuxListener::new(None, rx, addr))
    }

    #[tokio::test]
    async fn accept_fails_once_the_mux_is_gone() {
        let (tx, mut listener) = queue();
        assert_eq!(listener.label(), "default");
        assert!(listener.class().is_none());

        drop(tx);
        assert!(matches!(listener.accept().await, Err(MuxError::Closed)));
    }

    #[tokio::test]
    async fn close_unmatched_stops_on_shutdown_or_closed_queue() {
        let (_tx, listener) = queue();
        close_unmatched(listener, std::future::ready(())).await.unwrap();

        let (tx, listener) = queue();
        drop(tx);
        close_unmatched(listener, std::future::pending()).await.unwrap();
    }
}
