//! Minimal HTML page for locator and back-end failures.
//!
//! The template is embedded at build time and needs no external resource
//! to render (it references a web font, but degrades without it).

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

const TEMPLATE: &str = include_str!("../../assets/error_page.html");

/// Render the error page body for a status code, status text, and message.
pub fn render(code: u16, text: &str, message: &str) -> String {
    TEMPLATE
        .replace("{{code}}", &code.to_string())
        .replace("{{text}}", text)
        .replace("{{message}}", message)
}

/// Write a complete HTTP/1.1 error response and flush it.
pub async fn write_error_response<W>(
    writer: &mut W,
    code: u16,
    text: &str,
    message: &str,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = render(code, text, message);
    let head = format!(
        "HTTP/1.1 {code} {text}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );

    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_fields() {
        let body = render(503, "Service Unavailable", "No back-end is available.");

        assert!(body.contains("503"));
        assert!(body.contains("Service Unavailable"));
        assert!(body.contains("No back-end is available."));
        assert!(!body.contains("{{"));
    }

    #[tokio::test]
    async fn test_write_error_response() {
        let mut out = Vec::new();
        write_error_response(&mut out, 502, "Bad Gateway", "dial failed")
            .await
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(text.contains("Content-Type: text/html; charset=utf-8"));
        assert!(text.contains("dial failed"));
    }
}
