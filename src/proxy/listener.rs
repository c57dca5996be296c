//! TCP listener and per-connection pipeline.
//!
//! Each accepted connection runs in its own task:
//!
//! ```text
//! accept -> PROXY parse -> TLS terminate (SNI) -> forward requests
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn, Instrument};

use crate::backend::normalize;

use super::forward::Forwarder;
use super::proxy_protocol::{ProxyProtocolError, ProxyProtocolStream};

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Whether to probe accepted connections for a PROXY header.
    pub proxy_protocol: bool,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            proxy_protocol: true,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    pub connections_accepted: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_closed: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub proxy_headers_seen: AtomicU64,
    pub proxy_headers_rejected: AtomicU64,
    pub tls_handshake_failures: AtomicU64,
}

#[derive(Debug, Error)]
enum ConnectionError {
    #[error("PROXY header: {0}")]
    ProxyHeader(#[from] ProxyProtocolError),

    #[error("TLS handshake: {0}")]
    Handshake(io::Error),

    #[error(transparent)]
    Forward(io::Error),
}

/// The TLS-terminating proxy listener.
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    acceptor: TlsAcceptor,
    forwarder: Arc<Forwarder>,
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    pub async fn bind(
        config: ListenerConfig,
        acceptor: TlsAcceptor,
        forwarder: Arc<Forwarder>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            proxy_protocol = config.proxy_protocol,
            "listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            acceptor,
            forwarder,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Run the accept loop. Each connection is handled by its own task.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            if let Err(e) = listener.handle_connection(stream, peer_addr).await {
                                debug!(peer_addr = %peer_addr, error = %e, "connection error");
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "accept error");
                    // Brief sleep to avoid a tight loop on persistent errors.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Handle a single connection through the full pipeline.
    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ConnectionError> {
        let stream = if self.config.proxy_protocol {
            match ProxyProtocolStream::probe(stream).await {
                Ok(stream) => stream,
                Err(error) => {
                    self.stats
                        .proxy_headers_rejected
                        .fetch_add(1, Ordering::Relaxed);
                    return Err(error.into());
                }
            }
        } else {
            ProxyProtocolStream::passthrough(stream)
        };

        let client_addr = stream.peer_addr().unwrap_or(peer_addr);
        if let Some(header) = stream.proxy_header() {
            self.stats.proxy_headers_seen.fetch_add(1, Ordering::Relaxed);
            debug!(
                source = %header.source,
                destination = %header.destination,
                "PROXY header accepted"
            );
        }

        let tls_stream = match self.acceptor.accept(stream).await {
            Ok(tls_stream) => tls_stream,
            Err(error) => {
                self.stats
                    .tls_handshake_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(peer_addr = %client_addr, error = %error, "TLS handshake failed");
                return Err(ConnectionError::Handshake(error));
            }
        };

        let (_, connection) = tls_stream.get_ref();
        let server_name = connection.server_name().map(normalize);
        debug!(
            server_name = server_name.as_deref().unwrap_or(""),
            peer_addr = %client_addr,
            "TLS handshake complete"
        );

        self.forwarder
            .serve_connection(tls_stream, server_name.as_deref(), client_addr)
            .await
            .map_err(ConnectionError::Forward)
    }
}
