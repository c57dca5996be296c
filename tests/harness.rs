//! Test harness for proxy integration tests.
//!
//! Provides helpers to spawn plain and TLS HTTP back-ends, a fully wired
//! proxy listener with a throwaway certificate, and TLS client connections
//! trusting that certificate.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use edgegate::backend::Locator;
use edgegate::proxy::{Forwarder, ForwarderConfig, Listener, ListenerConfig};
use edgegate::tls::{self, BackendConnectors, FileCertificateProvider};

static INIT_CRYPTO: Once = Once::new();

pub fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A self-signed certificate written out as PEM files.
pub struct TestCert {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub cert_der: Vec<u8>,
}

impl TestCert {
    pub fn generate(names: &[&str]) -> io::Result<Self> {
        let cert = rcgen::generate_simple_self_signed(
            names.iter().map(|n| n.to_string()).collect::<Vec<_>>(),
        )
        .map_err(io::Error::other)?;

        let dir = std::env::temp_dir().join(format!(
            "edgegate-test-{}-{}",
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&dir)?;

        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.cert.pem())?;
        std::fs::write(&key_path, cert.key_pair.serialize_pem())?;

        Ok(Self {
            cert_path,
            key_path,
            cert_der: cert.cert.der().to_vec(),
        })
    }
}

/// Plain-TCP HTTP back-end. Answers GETs with a 200 carrying marker
/// headers (including hop-by-hop ones that must never be forwarded) and
/// echoes raw bytes after a WebSocket upgrade.
#[allow(dead_code)]
pub struct HttpBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub marker: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl HttpBackend {
    pub async fn spawn(marker: &str) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let conn_clone = Arc::clone(&connections);
        let marker = marker.to_string();
        let marker_clone = marker.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let marker = marker_clone.clone();
                                tokio::spawn(async move {
                                    let _ = serve_backend_connection(stream, &marker).await;
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            marker,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for HttpBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn serve_backend_connection<S>(mut stream: S, marker: &str) -> io::Result<()>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let head = read_until_blank_line(&mut stream).await?;
    let head_text = String::from_utf8_lossy(&head).to_lowercase();

    if head_text.starts_with("get /bare-101 ") {
        // 101 without upgrade headers; keep the connection open so an
        // erroneous tunnel would be observable.
        stream
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\n\r\n")
            .await?;
        stream.flush().await?;
        let mut buf = vec![0u8; 1024];
        while let Ok(n) = stream.read(&mut buf).await {
            if n == 0 {
                break;
            }
            if stream.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
        return Ok(());
    }

    if head_text.contains("upgrade: websocket") {
        stream
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\n\
                  Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\
                  Sec-WebSocket-Accept: test-accept\r\n\r\n",
            )
            .await?;

        // Raw byte echo until the client goes away.
        let mut buf = vec![0u8; 8192];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return Ok(()),
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    let body = format!("hello from {marker}");
    let response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         X-Backend: {marker}\r\n\
         Keep-Alive: timeout=5\r\n\
         Connection: x-drop\r\n\
         X-Drop: secret\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    let _ = stream.shutdown().await;
    Ok(())
}

async fn read_until_blank_line<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncReadExt + Unpin,
{
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no head"));
        }
        head.extend_from_slice(&buf[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(head);
        }
    }
}

/// TLS HTTP back-end with a self-signed certificate.
#[allow(dead_code)]
pub struct TlsBackend {
    pub addr: SocketAddr,
    pub cert: TestCert,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TlsBackend {
    pub async fn spawn(server_name: &str, marker: &str) -> io::Result<Self> {
        init_crypto_provider();

        let cert = TestCert::generate(&[server_name])?;
        let provider = FileCertificateProvider::load(&cert.cert_path, &cert.key_path, None)
            .map_err(io::Error::other)?;
        let acceptor: TlsAcceptor = tls::acceptor(Arc::new(provider));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let marker = marker.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                let acceptor = acceptor.clone();
                                let marker = marker.clone();
                                tokio::spawn(async move {
                                    if let Ok(tls_stream) = acceptor.accept(stream).await {
                                        let _ = serve_backend_connection(tls_stream, &marker).await;
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            cert,
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

impl Drop for TlsBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A fully wired proxy listener with a throwaway certificate for `*.test`.
#[allow(dead_code)]
pub struct ProxyHandle {
    pub addr: SocketAddr,
    pub cert_der: Vec<u8>,
}

impl ProxyHandle {
    pub async fn spawn(locator: Arc<dyn Locator>, proxy_protocol: bool) -> io::Result<Self> {
        Self::spawn_with_backend_ca(locator, proxy_protocol, None).await
    }

    pub async fn spawn_with_backend_ca(
        locator: Arc<dyn Locator>,
        proxy_protocol: bool,
        backend_ca: Option<&std::path::Path>,
    ) -> io::Result<Self> {
        init_crypto_provider();

        let cert = TestCert::generate(&["proxy.test", "app.test", "ws.test", "unknown.test"])?;
        let provider = FileCertificateProvider::load(&cert.cert_path, &cert.key_path, None)
            .map_err(io::Error::other)?;
        let acceptor = tls::acceptor(Arc::new(provider));

        let connectors = BackendConnectors::new(backend_ca).map_err(io::Error::other)?;
        let forwarder = Arc::new(Forwarder::new(
            locator,
            connectors,
            ForwarderConfig {
                dial_timeout: Duration::from_secs(2),
                head_timeout: Duration::from_secs(5),
            },
        ));

        let mut config = ListenerConfig::new("127.0.0.1:0".parse().unwrap());
        config.proxy_protocol = proxy_protocol;

        let listener = Listener::bind(config, acceptor, forwarder).await?;
        let addr = listener.local_addr()?;

        tokio::spawn(async move {
            let _ = Arc::new(listener).run().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;

        Ok(Self {
            addr,
            cert_der: cert.cert_der,
        })
    }
}

/// TLS-connect over an already established TCP stream, trusting `cert_der`.
pub async fn tls_over(
    stream: TcpStream,
    server_name: &str,
    cert_der: &[u8],
) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    init_crypto_provider();

    let mut root_store = rustls::RootCertStore::empty();
    root_store
        .add(CertificateDer::from(cert_der.to_vec()))
        .map_err(io::Error::other)?;

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(server_name.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    connector.connect(server_name, stream).await
}

/// Connect and TLS-handshake to the proxy, trusting its certificate.
#[allow(dead_code)]
pub async fn tls_client_connect(
    addr: SocketAddr,
    server_name: &str,
    cert_der: &[u8],
) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let stream = TcpStream::connect(addr).await?;
    tls_over(stream, server_name, cert_der).await
}

/// Send a GET and read until the proxy closes the connection.
#[allow(dead_code)]
pub async fn get(
    addr: SocketAddr,
    sni: &str,
    cert_der: &[u8],
    path: &str,
) -> io::Result<String> {
    let mut stream = tls_client_connect(addr, sni, cert_der).await?;

    let request =
        format!("GET {path} HTTP/1.1\r\nHost: {sni}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(String::from_utf8_lossy(&response).to_string())
}

/// Read one HTTP head (through the blank line) from a stream.
#[allow(dead_code)]
pub async fn read_head<S>(stream: &mut S) -> io::Result<String>
where
    S: AsyncReadExt + Unpin,
{
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no head"));
        }
        head.push(byte[0]);
        if head.ends_with(b"\r\n\r\n") {
            return Ok(String::from_utf8_lossy(&head).to_string());
        }
    }
}
