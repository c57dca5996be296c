//! PROXY protocol v1/v2 detection on accepted connections.
//!
//! Wire formats (from the HAProxy PROXY protocol spec):
//! - v1: a text line `PROXY TCP4 <src> <dst> <sport> <dport>\r\n`
//!   (also TCP6 and UNKNOWN), at most 107 bytes including CRLF
//! - v2: 12 bytes signature, 1 byte version/command, 1 byte address
//!   family and transport protocol, 2 bytes address length, then the
//!   addresses and ports
//!
//! The wrapper probes a freshly accepted stream exactly once, before any
//! application byte is surfaced. Bytes consumed while probing a stream
//! that turns out not to carry a header are replayed by subsequent reads.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// PROXY protocol v2 signature (12 bytes).
const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// PROXY protocol v1 line prefix.
const V1_PREFIX: &[u8] = b"PROXY ";

/// Maximum v1 line length including CRLF.
const V1_MAX_LINE: usize = 107;

/// Address family + transport: AF_INET, STREAM.
const V2_TCP4: u8 = 0x11;

/// Address family + transport: AF_INET6, STREAM.
const V2_TCP6: u8 = 0x21;

#[derive(Debug, Error)]
pub enum ProxyProtocolError {
    #[error("malformed PROXY v1 line: {0}")]
    MalformedV1(String),

    #[error("malformed PROXY v2 header: {0}")]
    MalformedV2(&'static str),

    #[error("unsupported PROXY v2 version or command: {0:#04x}")]
    UnsupportedV2(u8),

    #[error("io error while reading PROXY header: {0}")]
    Io(#[from] io::Error),
}

/// Addresses carried by a parsed PROXY header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    /// Original client address.
    pub source: SocketAddr,
    /// Original destination address as seen by the upstream proxy.
    pub destination: SocketAddr,
}

/// A byte stream with an optional PROXY header consumed from its front.
///
/// Reads drain the probe buffer before touching the underlying stream;
/// writes and shutdown delegate unchanged.
#[derive(Debug)]
pub struct ProxyProtocolStream<S> {
    inner: S,
    header: Option<ProxyHeader>,
    buffer: Vec<u8>,
    pos: usize,
}

impl<S: AsyncRead + Unpin> ProxyProtocolStream<S> {
    /// Probe a freshly accepted stream for a PROXY header.
    ///
    /// A stream whose first bytes are not a v1/v2 header, or that ends
    /// before a signature is complete, passes through with the probed
    /// bytes preserved. A stream that starts a header but cannot finish
    /// it correctly is an error.
    pub async fn probe(inner: S) -> Result<Self, ProxyProtocolError> {
        let mut stream = Self {
            inner,
            header: None,
            buffer: Vec::with_capacity(V2_SIGNATURE.len()),
            pos: 0,
        };

        loop {
            let buffered = stream.buffer.as_slice();

            if buffered.len() >= V1_PREFIX.len() && buffered.starts_with(V1_PREFIX) {
                stream.parse_v1().await?;
                return Ok(stream);
            }
            if buffered.len() >= V2_SIGNATURE.len() && buffered.starts_with(&V2_SIGNATURE) {
                stream.parse_v2().await?;
                return Ok(stream);
            }

            let v1_candidate = V1_PREFIX.starts_with(buffered);
            let v2_candidate = V2_SIGNATURE.starts_with(buffered);
            if !v1_candidate && !v2_candidate {
                return Ok(stream);
            }

            // Still a strict prefix of a signature: EOF here means the
            // connection never carried a header.
            let mut chunk = [0u8; 256];
            let n = stream.inner.read(&mut chunk).await?;
            if n == 0 {
                return Ok(stream);
            }
            stream.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Wrap a stream without probing, for listeners with the PROXY
    /// protocol disabled.
    pub fn passthrough(inner: S) -> Self {
        Self {
            inner,
            header: None,
            buffer: Vec::new(),
            pos: 0,
        }
    }

    /// The parsed header, if one was present and carried addresses.
    pub fn proxy_header(&self) -> Option<&ProxyHeader> {
        self.header.as_ref()
    }

    /// Original client address from the header, if present.
    pub fn source_addr(&self) -> Option<SocketAddr> {
        self.header.map(|h| h.source)
    }

    /// Original destination address from the header, if present.
    pub fn destination_addr(&self) -> Option<SocketAddr> {
        self.header.map(|h| h.destination)
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Read more bytes into the probe buffer until it holds `n` bytes.
    async fn fill_to(&mut self, n: usize, context: &'static str) -> Result<(), ProxyProtocolError> {
        while self.buffer.len() < n {
            let mut chunk = [0u8; 256];
            let read = self.inner.read(&mut chunk).await?;
            if read == 0 {
                return Err(ProxyProtocolError::MalformedV2(context));
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
        Ok(())
    }

    /// Parse a v1 text line. The buffer starts with `PROXY `.
    async fn parse_v1(&mut self) -> Result<(), ProxyProtocolError> {
        let line_end = loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                break pos + 1;
            }
            if self.buffer.len() >= V1_MAX_LINE {
                return Err(ProxyProtocolError::MalformedV1(
                    "no CRLF within 107 bytes".to_string(),
                ));
            }
            let mut chunk = [0u8; 256];
            let read = self.inner.read(&mut chunk).await?;
            if read == 0 {
                return Err(ProxyProtocolError::MalformedV1(
                    "connection closed mid-line".to_string(),
                ));
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        };

        if line_end > V1_MAX_LINE {
            return Err(ProxyProtocolError::MalformedV1(
                "line exceeds 107 bytes".to_string(),
            ));
        }

        let line = &self.buffer[..line_end];
        let text = std::str::from_utf8(line)
            .map_err(|_| ProxyProtocolError::MalformedV1("not ASCII".to_string()))?;
        let text = text
            .strip_suffix("\r\n")
            .ok_or_else(|| ProxyProtocolError::MalformedV1("missing CRLF".to_string()))?;

        self.header = parse_v1_line(text)?;

        // Header consumed; anything past the line replays to the reader.
        self.buffer.drain(..line_end);
        Ok(())
    }

    /// Parse a v2 binary header. The buffer starts with the signature.
    async fn parse_v2(&mut self) -> Result<(), ProxyProtocolError> {
        self.fill_to(16, "truncated fixed header").await?;

        let version_command = self.buffer[12];
        let family_protocol = self.buffer[13];
        let address_len =
            u16::from_be_bytes([self.buffer[14], self.buffer[15]]) as usize;

        if version_command >> 4 != 0x2 {
            return Err(ProxyProtocolError::UnsupportedV2(version_command));
        }
        let command = version_command & 0x0F;
        if command > 0x1 {
            return Err(ProxyProtocolError::UnsupportedV2(version_command));
        }

        self.fill_to(16 + address_len, "truncated address block").await?;
        let addresses = &self.buffer[16..16 + address_len];

        // Command 0x0 is LOCAL (health checks); the header is consumed
        // but carries no addresses. Unknown families behave the same.
        self.header = if command == 0x1 {
            match family_protocol {
                V2_TCP4 => {
                    if address_len < 12 {
                        return Err(ProxyProtocolError::MalformedV2("short IPv4 address block"));
                    }
                    let src_ip = Ipv4Addr::new(addresses[0], addresses[1], addresses[2], addresses[3]);
                    let dst_ip = Ipv4Addr::new(addresses[4], addresses[5], addresses[6], addresses[7]);
                    let src_port = u16::from_be_bytes([addresses[8], addresses[9]]);
                    let dst_port = u16::from_be_bytes([addresses[10], addresses[11]]);
                    Some(ProxyHeader {
                        source: SocketAddr::new(IpAddr::V4(src_ip), src_port),
                        destination: SocketAddr::new(IpAddr::V4(dst_ip), dst_port),
                    })
                }
                V2_TCP6 => {
                    if address_len < 36 {
                        return Err(ProxyProtocolError::MalformedV2("short IPv6 address block"));
                    }
                    let src_octets: [u8; 16] = addresses[..16]
                        .try_into()
                        .map_err(|_| ProxyProtocolError::MalformedV2("short IPv6 address block"))?;
                    let dst_octets: [u8; 16] = addresses[16..32]
                        .try_into()
                        .map_err(|_| ProxyProtocolError::MalformedV2("short IPv6 address block"))?;
                    let src_port = u16::from_be_bytes([addresses[32], addresses[33]]);
                    let dst_port = u16::from_be_bytes([addresses[34], addresses[35]]);
                    Some(ProxyHeader {
                        source: SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src_octets)), src_port),
                        destination: SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst_octets)), dst_port),
                    })
                }
                _ => None,
            }
        } else {
            None
        };

        self.buffer.drain(..16 + address_len);
        Ok(())
    }
}

impl ProxyProtocolStream<TcpStream> {
    /// The effective client address: the header's source when present,
    /// the socket's peer address otherwise.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self.source_addr() {
            Some(addr) => Ok(addr),
            None => self.inner.peer_addr(),
        }
    }

    /// The effective local address: the header's destination when
    /// present, the socket's local address otherwise.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.destination_addr() {
            Some(addr) => Ok(addr),
            None => self.inner.local_addr(),
        }
    }
}

/// Parse the payload of a v1 line, CRLF already stripped.
fn parse_v1_line(line: &str) -> Result<Option<ProxyHeader>, ProxyProtocolError> {
    let malformed = |detail: &str| ProxyProtocolError::MalformedV1(detail.to_string());

    let mut fields = line.split(' ');
    match fields.next() {
        Some("PROXY") => {}
        _ => return Err(malformed("missing PROXY keyword")),
    }

    let protocol = fields.next().ok_or_else(|| malformed("missing protocol"))?;
    if protocol == "UNKNOWN" {
        // Header present but addresses are unusable; the rest of the
        // line carries no meaning for UNKNOWN.
        return Ok(None);
    }

    let src_ip = fields.next().ok_or_else(|| malformed("missing source address"))?;
    let dst_ip = fields.next().ok_or_else(|| malformed("missing destination address"))?;
    let src_port = fields.next().ok_or_else(|| malformed("missing source port"))?;
    let dst_port = fields.next().ok_or_else(|| malformed("missing destination port"))?;
    if fields.next().is_some() {
        return Err(malformed("trailing fields"));
    }

    let src_ip: IpAddr = src_ip.parse().map_err(|_| malformed("bad source address"))?;
    let dst_ip: IpAddr = dst_ip.parse().map_err(|_| malformed("bad destination address"))?;
    let src_port: u16 = src_port.parse().map_err(|_| malformed("bad source port"))?;
    let dst_port: u16 = dst_port.parse().map_err(|_| malformed("bad destination port"))?;

    let family_matches = match protocol {
        "TCP4" => src_ip.is_ipv4() && dst_ip.is_ipv4(),
        "TCP6" => src_ip.is_ipv6() && dst_ip.is_ipv6(),
        _ => return Err(malformed("unknown protocol")),
    };
    if !family_matches {
        return Err(malformed("address family does not match protocol"));
    }

    Ok(Some(ProxyHeader {
        source: SocketAddr::new(src_ip, src_port),
        destination: SocketAddr::new(dst_ip, dst_port),
    }))
}

impl<S: AsyncRead + Unpin> AsyncRead for ProxyProtocolStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.buffer.len() {
            let remaining = &self.buffer[self.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.pos += n;
            if self.pos == self.buffer.len() {
                self.buffer = Vec::new();
                self.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ProxyProtocolStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
