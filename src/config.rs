//! Service configuration (env-driven).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::backend::CacheConfig;
use crate::proxy::{DEFAULT_DIAL_TIMEOUT, DEFAULT_HEAD_TIMEOUT, DEFAULT_MAX_CONNECTIONS};

/// Proxy configuration. Routes come separately from `ROUTE_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the TLS listener binds to.
    pub listen_addr: SocketAddr,

    /// Default certificate chain (PEM).
    pub cert_path: PathBuf,

    /// Default private key (PEM).
    pub key_path: PathBuf,

    /// Optional directory of per-domain `<domain>.crt`/`<domain>.key` pairs.
    pub cert_dir: Option<PathBuf>,

    /// Optional PEM bundle added to the verified back-end root store.
    pub backend_ca: Option<PathBuf>,

    /// Whether accepted connections are probed for a PROXY header.
    pub proxy_protocol: bool,

    /// Route cache tuning.
    pub cache: CacheConfig,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Limit on back-end TCP connect and TLS handshake.
    pub dial_timeout: Duration,

    /// Limit on reading a request or response head.
    pub head_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("EDGEGATE_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8443".to_string())
            .parse()
            .context("EDGEGATE_LISTEN_ADDR must be a socket address")?;

        let cert_path = std::env::var("EDGEGATE_CERT_PATH")
            .unwrap_or_else(|_| "cert.pem".to_string())
            .into();
        let key_path = std::env::var("EDGEGATE_KEY_PATH")
            .unwrap_or_else(|_| "key.pem".to_string())
            .into();
        let cert_dir = std::env::var("EDGEGATE_CERT_DIR").ok().map(PathBuf::from);
        let backend_ca = std::env::var("EDGEGATE_BACKEND_CA").ok().map(PathBuf::from);

        let proxy_protocol = std::env::var("EDGEGATE_PROXY_PROTOCOL")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(true);

        let cache = CacheConfig {
            positive_ttl: duration_ms("EDGEGATE_POSITIVE_TTL_MS", 15_000)?,
            negative_ttl: duration_ms("EDGEGATE_NEGATIVE_TTL_MS", 15_000)?,
            max_size: integer("EDGEGATE_CACHE_MAX_SIZE", 1024)?,
        };

        let max_connections = integer("EDGEGATE_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?;
        let dial_timeout =
            duration_ms("EDGEGATE_DIAL_TIMEOUT_MS", DEFAULT_DIAL_TIMEOUT.as_millis() as u64)?;
        let head_timeout =
            duration_ms("EDGEGATE_HEAD_TIMEOUT_MS", DEFAULT_HEAD_TIMEOUT.as_millis() as u64)?;

        let log_level = std::env::var("EDGEGATE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            cert_path,
            key_path,
            cert_dir,
            backend_ca,
            proxy_protocol,
            cache,
            max_connections,
            dial_timeout,
            head_timeout,
            log_level,
        })
    }
}

fn duration_ms(var: &str, default: u64) -> Result<Duration> {
    let ms = std::env::var(var)
        .ok()
        .map(|v| v.parse())
        .transpose()
        .with_context(|| format!("{var} must be an integer (milliseconds)"))?
        .unwrap_or(default);
    Ok(Duration::from_millis(ms))
}

fn integer(var: &str, default: usize) -> Result<usize> {
    std::env::var(var)
        .ok()
        .map(|v| v.parse())
        .transpose()
        .with_context(|| format!("{var} must be an integer"))
        .map(|v| v.unwrap_or(default))
}
