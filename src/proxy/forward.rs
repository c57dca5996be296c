//! HTTP/WebSocket forwarding between a terminated client connection and a
//! located back-end.
//!
//! Each request is replayed to a freshly dialed back-end: the inbound head
//! verbatim, then the body by its framing. The response comes back with
//! hop-by-hop headers stripped. A `101 Switching Protocols` response with
//! WebSocket upgrade headers escalates the connection into a raw
//! bidirectional byte tunnel.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::backend::{Endpoint, Locator, TlsMode};
use crate::tls::BackendConnectors;

use super::error_page;
use super::http::{self, BodyFraming, HttpError, RequestHead, ResponseHead};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HEAD_TIMEOUT: Duration = Duration::from_secs(30);

const NO_ROUTE_MESSAGE: &str =
    "The service you have requested is not available. Please try again later.";
const BAD_GATEWAY_MESSAGE: &str =
    "The back-end server for this service could not be reached.";
const GATEWAY_TIMEOUT_MESSAGE: &str =
    "The back-end server for this service did not respond in time.";

/// Timeouts applied while forwarding. Neither applies in tunnel mode.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Limit on TCP connect and TLS handshake toward a back-end.
    pub dial_timeout: Duration,
    /// Limit on reading a request or response head.
    pub head_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            head_timeout: DEFAULT_HEAD_TIMEOUT,
        }
    }
}

/// Forwards requests from terminated client connections to back-ends.
pub struct Forwarder {
    locator: Arc<dyn Locator>,
    connectors: BackendConnectors,
    config: ForwarderConfig,
}

enum RequestOutcome {
    KeepAlive,
    Close,
}

impl Forwarder {
    pub fn new(
        locator: Arc<dyn Locator>,
        connectors: BackendConnectors,
        config: ForwarderConfig,
    ) -> Self {
        Self {
            locator,
            connectors,
            config,
        }
    }

    /// Serve requests on one terminated connection until it closes.
    ///
    /// `server_name` is the TLS SNI name; connections without SNI fall
    /// back to each request's `Host` header.
    pub async fn serve_connection<S>(
        &self,
        stream: S,
        server_name: Option<&str>,
        peer_addr: SocketAddr,
    ) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut client = BufReader::new(stream);
        let result = self
            .serve_requests(&mut client, server_name, peer_addr)
            .await;

        // Clean shutdown so TLS clients see close_notify, not a bare FIN.
        let _ = client.shutdown().await;
        result
    }

    async fn serve_requests<S>(
        &self,
        client: &mut BufReader<S>,
        server_name: Option<&str>,
        peer_addr: SocketAddr,
    ) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let head = match timeout(self.config.head_timeout, http::read_head(client)).await {
                Err(_) => {
                    debug!(peer_addr = %peer_addr, "timed out waiting for a request");
                    return Ok(());
                }
                Ok(Ok(None)) => return Ok(()),
                Ok(Ok(Some(head))) => head,
                Ok(Err(HttpError::Io(e))) => {
                    info!(peer_addr = %peer_addr, error = %e, "client connection closed");
                    return Ok(());
                }
                Ok(Err(error)) => {
                    debug!(peer_addr = %peer_addr, error = %error, "unusable request head");
                    return Ok(());
                }
            };

            let request = match http::parse_request(head) {
                Ok(request) => request,
                Err(error) => {
                    debug!(peer_addr = %peer_addr, error = %error, "malformed request");
                    return Ok(());
                }
            };

            let name = server_name.map(str::to_string).or_else(|| {
                http::header_value(&request.headers, "host").map(|host| strip_port(host).to_string())
            });

            let endpoint = match name.as_deref() {
                Some(name) => self.locator.locate(name).await,
                None => None,
            };
            let Some(endpoint) = endpoint else {
                info!(
                    server_name = name.as_deref().unwrap_or(""),
                    peer_addr = %peer_addr,
                    "no route for server name"
                );
                error_page::write_error_response(client, 503, "Service Unavailable", NO_ROUTE_MESSAGE)
                    .await?;
                return Ok(());
            };

            if endpoint.tls_mode == TlsMode::Insecure {
                warn!(
                    address = %endpoint.address,
                    description = %endpoint.description,
                    "connecting to back-end without certificate verification"
                );
            }

            let backend = match self.dial(&endpoint).await {
                Ok(backend) => backend,
                Err(error) => {
                    warn!(
                        address = %endpoint.address,
                        description = %endpoint.description,
                        error = %error,
                        "back-end dial failed"
                    );
                    error_page::write_error_response(client, 502, "Bad Gateway", BAD_GATEWAY_MESSAGE)
                        .await?;
                    return Ok(());
                }
            };

            debug!(
                method = %request.method,
                target = %request.target,
                address = %endpoint.address,
                description = %endpoint.description,
                "forwarding request"
            );

            let mut backend = BufReader::new(backend);
            match self.exchange(client, &mut backend, &request).await? {
                RequestOutcome::KeepAlive => continue,
                RequestOutcome::Close => return Ok(()),
            }
        }
    }

    /// Replay one request to the back-end and stream the response back.
    async fn exchange<S>(
        &self,
        client: &mut BufReader<S>,
        backend: &mut BufReader<BackendStream>,
        request: &RequestHead,
    ) -> io::Result<RequestOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // Request line and headers exactly as received.
        backend.write_all(&request.raw).await?;

        match http::request_body(request) {
            Ok(BodyFraming::Length(length)) => {
                http::copy_exact(client, backend, length).await?;
            }
            Ok(BodyFraming::Chunked) => {
                if let Err(error) = http::copy_chunked(client, backend, false).await {
                    debug!(error = %error, "request body aborted");
                    return Ok(RequestOutcome::Close);
                }
            }
            Ok(_) => {}
            Err(error) => {
                debug!(error = %error, "unusable request body framing");
                return Ok(RequestOutcome::Close);
            }
        }
        backend.flush().await?;

        // Response head. Failures here happen before anything was sent to
        // the client, so an error page is still possible.
        let response = match timeout(self.config.head_timeout, http::read_head(backend)).await {
            Err(_) => {
                warn!("back-end did not answer in time");
                error_page::write_error_response(
                    client,
                    504,
                    "Gateway Timeout",
                    GATEWAY_TIMEOUT_MESSAGE,
                )
                .await?;
                return Ok(RequestOutcome::Close);
            }
            Ok(result) => match result {
                Ok(Some(head)) => http::parse_response(&head),
                Ok(None) => Err(HttpError::TruncatedHead),
                Err(error) => Err(error),
            },
        };
        let response = match response {
            Ok(response) => response,
            Err(error) => {
                warn!(error = %error, "malformed back-end response");
                error_page::write_error_response(client, 502, "Bad Gateway", BAD_GATEWAY_MESSAGE)
                    .await?;
                return Ok(RequestOutcome::Close);
            }
        };

        let upgrade = http::is_websocket_upgrade(response.code, &response.headers);
        client
            .write_all(&serialize_response_head(&response, upgrade))
            .await?;
        client.flush().await?;

        if upgrade {
            info!("connection upgraded; entering tunnel mode");
            match tokio::io::copy_bidirectional(client, backend).await {
                Ok((to_backend, from_backend)) => debug!(
                    bytes_to_backend = to_backend,
                    bytes_from_backend = from_backend,
                    "tunnel closed"
                ),
                Err(error) => debug!(error = %error, "tunnel closed with error"),
            }
            return Ok(RequestOutcome::Close);
        }

        let framing = match http::response_body(&request.method, &response) {
            Ok(framing) => framing,
            Err(error) => {
                // Head already flushed; truncate by closing.
                warn!(error = %error, "unusable response body framing");
                return Ok(RequestOutcome::Close);
            }
        };

        match framing {
            BodyFraming::None => {}
            BodyFraming::Length(length) => {
                http::copy_exact(backend, client, length).await?;
                client.flush().await?;
            }
            BodyFraming::Chunked => {
                // Transfer-Encoding was stripped from the forwarded head;
                // the decoded body is delimited by connection close.
                if let Err(error) = http::copy_chunked(backend, client, true).await {
                    debug!(error = %error, "response body aborted");
                }
                client.flush().await?;
                return Ok(RequestOutcome::Close);
            }
            BodyFraming::Close => {
                http::copy_to_eof(backend, client).await?;
                client.flush().await?;
                return Ok(RequestOutcome::Close);
            }
        }

        let client_keep_alive = request.minor_version >= 1
            && !http::header_has_token(&request.headers, "connection", "close");
        if client_keep_alive {
            Ok(RequestOutcome::KeepAlive)
        } else {
            Ok(RequestOutcome::Close)
        }
    }

    /// Dial an endpoint: plain TCP, verified TLS, or unverified TLS.
    async fn dial(&self, endpoint: &Endpoint) -> io::Result<BackendStream> {
        let tcp = timeout(self.config.dial_timeout, TcpStream::connect(&endpoint.address))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))??;

        let connector = match endpoint.tls_mode {
            TlsMode::Disabled => return Ok(BackendStream::Plain(tcp)),
            TlsMode::Enabled => self.connectors.verified(),
            TlsMode::Insecure => self.connectors.insecure(),
        };

        let host = strip_port(&endpoint.address);
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let tls = timeout(self.config.dial_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timeout"))??;

        Ok(BackendStream::Tls(Box::new(tls)))
    }
}

/// Host part of a `host:port` address, brackets removed.
fn strip_port(address: &str) -> &str {
    let host = match address.rsplit_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => address,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Status line plus headers with hop-by-hop fields removed. A WebSocket
/// upgrade forces `Connection: upgrade` and `Upgrade: websocket` back in.
fn serialize_response_head(response: &ResponseHead, upgrade: bool) -> Vec<u8> {
    let mut head = Vec::with_capacity(256);

    if response.reason.is_empty() {
        head.extend_from_slice(format!("HTTP/1.1 {}\r\n", response.code).as_bytes());
    } else {
        head.extend_from_slice(
            format!("HTTP/1.1 {} {}\r\n", response.code, response.reason).as_bytes(),
        );
    }

    let tokens = http::connection_tokens(&response.headers);
    for header in &response.headers {
        if http::is_hop_by_hop(&header.name, &tokens) {
            continue;
        }
        head.extend_from_slice(format!("{}: {}\r\n", header.name, header.value).as_bytes());
    }

    if upgrade {
        head.extend_from_slice(b"Connection: upgrade\r\nUpgrade: websocket\r\n");
    }

    head.extend_from_slice(b"\r\n");
    head
}

/// A dialed back-end connection, plain or TLS.
enum BackendStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for BackendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            BackendStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BackendStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            BackendStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            BackendStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            BackendStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::http::parse_response;

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("backend:8080"), "backend");
        assert_eq!(strip_port("[::1]:8080"), "::1");
        assert_eq!(strip_port("10.0.0.1:80"), "10.0.0.1");
    }

    #[test]
    fn test_hop_by_hop_headers_are_stripped() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nKeep-Alive: timeout=5\r\nTransfer-Encoding: chunked\r\nConnection: x-drop\r\nX-Drop: secret\r\nX-Keep: yes\r\n\r\n";
        let response = parse_response(raw).unwrap();

        let head = String::from_utf8(serialize_response_head(&response, false)).unwrap();
        assert!(head.contains("Content-Type: text/plain"));
        assert!(head.contains("X-Keep: yes"));
        assert!(!head.contains("Keep-Alive"));
        assert!(!head.contains("Transfer-Encoding"));
        assert!(!head.contains("Connection"));
        assert!(!head.contains("X-Drop"));
    }

    #[test]
    fn test_upgrade_headers_are_forced() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: abc\r\n\r\n";
        let response = parse_response(raw).unwrap();
        assert!(http::is_websocket_upgrade(response.code, &response.headers));

        let head = String::from_utf8(serialize_response_head(&response, true)).unwrap();
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(head.contains("Connection: upgrade\r\n"));
        assert!(head.contains("Upgrade: websocket\r\n"));
        assert!(head.contains("Sec-WebSocket-Accept: abc\r\n"));
    }
}
