//! HTTP/1.1 head parsing, hop-by-hop filtering, and body framing.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted size of a request or response head.
pub const MAX_HEAD_BYTES: usize = 16 * 1024;

const MAX_HEADERS: usize = 64;

/// Headers that apply to a single connection and are never forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("connection closed before a complete header block")]
    TruncatedHead,

    #[error("header block exceeds {MAX_HEAD_BYTES} bytes")]
    HeadTooLarge,

    #[error("malformed {0}")]
    Malformed(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// A parsed request head, keeping the raw bytes for verbatim replay.
#[derive(Debug)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub minor_version: u8,
    pub headers: Vec<Header>,
    pub raw: Vec<u8>,
}

#[derive(Debug)]
pub struct ResponseHead {
    pub code: u16,
    pub reason: String,
    pub headers: Vec<Header>,
}

/// How a message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head.
    None,
    /// Exactly this many bytes.
    Length(u64),
    /// Chunked transfer coding.
    Chunked,
    /// Delimited by connection close.
    Close,
}

/// Read one header block (through the blank line) from a buffered stream.
///
/// Returns `Ok(None)` on a clean EOF before the first byte. Bytes beyond
/// the blank line stay buffered in the reader.
pub async fn read_head<R>(reader: &mut R) -> Result<Option<Vec<u8>>, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head: Vec<u8> = Vec::new();

    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return if head.is_empty() {
                Ok(None)
            } else {
                Err(HttpError::TruncatedHead)
            };
        }

        // The terminator may straddle the chunk boundary.
        let scan_from = head.len().saturating_sub(3);
        let chunk_len = chunk.len();
        head.extend_from_slice(chunk);

        if let Some(offset) = find_terminator(&head[scan_from..]) {
            let end = scan_from + offset + 4;
            let consumed = chunk_len - (head.len() - end);
            reader.consume(consumed);
            head.truncate(end);
            if head.len() > MAX_HEAD_BYTES {
                return Err(HttpError::HeadTooLarge);
            }
            return Ok(Some(head));
        }

        reader.consume(chunk_len);
        if head.len() > MAX_HEAD_BYTES {
            return Err(HttpError::HeadTooLarge);
        }
    }
}

fn find_terminator(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|window| window == b"\r\n\r\n")
}

pub fn parse_request(raw: Vec<u8>) -> Result<RequestHead, HttpError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    match request.parse(&raw) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return Err(HttpError::Malformed("request head")),
    }

    let (Some(method), Some(target), Some(minor_version)) =
        (request.method, request.path, request.version)
    else {
        return Err(HttpError::Malformed("request head"));
    };

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        minor_version,
        headers: convert_headers(request.headers)?,
        raw,
    })
}

pub fn parse_response(raw: &[u8]) -> Result<ResponseHead, HttpError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    match response.parse(raw) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return Err(HttpError::Malformed("response head")),
    }

    let Some(code) = response.code else {
        return Err(HttpError::Malformed("response head"));
    };

    Ok(ResponseHead {
        code,
        reason: response.reason.unwrap_or("").to_string(),
        headers: convert_headers(response.headers)?,
    })
}

fn convert_headers(parsed: &[httparse::Header<'_>]) -> Result<Vec<Header>, HttpError> {
    parsed
        .iter()
        .map(|header| {
            let value = std::str::from_utf8(header.value)
                .map_err(|_| HttpError::Malformed("header value"))?;
            Ok(Header {
                name: header.name.to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}

/// First value of a header, by case-insensitive name.
pub fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .map(|header| header.value.as_str())
}

/// Whether any comma-separated token of the named header equals `token`.
pub fn header_has_token(headers: &[Header], name: &str, token: &str) -> bool {
    headers
        .iter()
        .filter(|header| header.name.eq_ignore_ascii_case(name))
        .flat_map(|header| header.value.split(','))
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}

/// Tokens of the `Connection` header, lower-cased.
pub fn connection_tokens(headers: &[Header]) -> Vec<String> {
    headers
        .iter()
        .filter(|header| header.name.eq_ignore_ascii_case("connection"))
        .flat_map(|header| header.value.split(','))
        .map(|token| token.trim().to_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Hop-by-hop check: the fixed set plus the tokens of the message's own
/// `Connection` header.
pub fn is_hop_by_hop(name: &str, connection_tokens: &[String]) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
        || connection_tokens.iter().any(|t| name.eq_ignore_ascii_case(t))
}

/// Whether a response escalates the connection to a WebSocket.
pub fn is_websocket_upgrade(code: u16, headers: &[Header]) -> bool {
    code == 101
        && header_has_token(headers, "upgrade", "websocket")
        && header_has_token(headers, "connection", "upgrade")
}

/// Body framing of a request, from its headers.
pub fn request_body(head: &RequestHead) -> Result<BodyFraming, HttpError> {
    if header_has_token(&head.headers, "transfer-encoding", "chunked") {
        return Ok(BodyFraming::Chunked);
    }

    match header_value(&head.headers, "content-length") {
        Some(value) => {
            let length: u64 = value
                .trim()
                .parse()
                .map_err(|_| HttpError::Malformed("content-length"))?;
            if length == 0 {
                Ok(BodyFraming::None)
            } else {
                Ok(BodyFraming::Length(length))
            }
        }
        None => Ok(BodyFraming::None),
    }
}

/// Body framing of a response, from its status and headers.
pub fn response_body(request_method: &str, head: &ResponseHead) -> Result<BodyFraming, HttpError> {
    if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&head.code)
        || head.code == 204
        || head.code == 304
    {
        return Ok(BodyFraming::None);
    }

    if header_has_token(&head.headers, "transfer-encoding", "chunked") {
        return Ok(BodyFraming::Chunked);
    }

    match header_value(&head.headers, "content-length") {
        Some(value) => {
            let length: u64 = value
                .trim()
                .parse()
                .map_err(|_| HttpError::Malformed("content-length"))?;
            if length == 0 {
                Ok(BodyFraming::None)
            } else {
                Ok(BodyFraming::Length(length))
            }
        }
        None => Ok(BodyFraming::Close),
    }
}

/// Copy exactly `length` bytes.
pub async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, length: u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = length;
    let mut buf = vec![0u8; 8192];

    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "body ended early",
            ));
        }
        writer.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }

    Ok(())
}

/// Copy until EOF, returning the number of bytes moved.
pub async fn copy_to_eof<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; 8192];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

/// Copy a chunked body. With `decode` the chunk framing is removed and
/// only payload bytes are written; without it the framing passes through
/// verbatim. Trailer headers are consumed either way.
pub async fn copy_chunked<R, W>(reader: &mut R, writer: &mut W, decode: bool) -> Result<(), HttpError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let line = read_line(reader).await?;
        let size = parse_chunk_size(&line)?;

        if !decode {
            writer.write_all(&line).await?;
        }

        if size == 0 {
            break;
        }

        // Chunk data plus its trailing CRLF.
        let mut remaining = size + 2;
        let mut buf = vec![0u8; 8192];
        while remaining > 0 {
            let want = buf.len().min(remaining as usize);
            let n = reader.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(HttpError::Malformed("chunk data"));
            }
            let payload_end = if decode {
                // Strip the CRLF that terminates the chunk.
                let data_left = remaining.saturating_sub(2);
                (n as u64).min(data_left) as usize
            } else {
                n
            };
            if payload_end > 0 {
                writer.write_all(&buf[..payload_end]).await?;
            }
            remaining -= n as u64;
        }
    }

    // Trailer section: header lines up to and including a blank line.
    loop {
        let line = read_line(reader).await?;
        if !decode {
            writer.write_all(&line).await?;
        }
        if line == b"\r\n" || line == b"\n" {
            break;
        }
    }

    Ok(())
}

async fn read_line<R>(reader: &mut R) -> Result<Vec<u8>, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(HttpError::Malformed("unexpected end of chunked body"));
    }
    Ok(line)
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, HttpError> {
    let text = std::str::from_utf8(line).map_err(|_| HttpError::Malformed("chunk size"))?;
    let size = text
        .trim_end_matches(['\r', '\n'])
        .split(';')
        .next()
        .unwrap_or("")
        .trim();
    u64::from_str_radix(size, 16).map_err(|_| HttpError::Malformed("chunk size"))
}
