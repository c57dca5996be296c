//! edgegate
//!
//! TLS-terminating reverse proxy with SNI routing.
//!
//! This service:
//! - Accepts HTTPS and secure-WebSocket connections, optionally behind
//!   the PROXY protocol
//! - Terminates TLS with a certificate selected by SNI
//! - Locates a back-end for the server name through a cached route table
//! - Replays requests, streams responses, and tunnels WebSocket upgrades

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use edgegate::backend::{routes_from_env, AggregateLocator, CachingLocator, Locator};
use edgegate::config::Config;
use edgegate::proxy::{Forwarder, ForwarderConfig, Listener, ListenerConfig};
use edgegate::tls::{self, BackendConnectors, FileCertificateProvider};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    rustls::crypto::ring::default_provider().install_default().ok();

    info!(
        listen_addr = %config.listen_addr,
        cert_path = %config.cert_path.display(),
        proxy_protocol = config.proxy_protocol,
        cache_max_size = config.cache.max_size,
        "configuration loaded"
    );

    let routes = routes_from_env(std::env::vars())
        .context("invalid ROUTE_* environment variables")?;
    info!(route_count = routes.len(), "environment routes loaded");

    // An orchestrator-derived locator would be appended here.
    let aggregate = AggregateLocator::new(vec![Box::new(routes)]);
    let locator: Arc<dyn Locator> =
        Arc::new(CachingLocator::new(aggregate, config.cache.clone()));

    let provider = FileCertificateProvider::load(
        &config.cert_path,
        &config.key_path,
        config.cert_dir.as_deref(),
    )
    .context("failed to load certificates")?;
    info!(
        domain_certificates = provider.domain_count(),
        "certificate provider ready"
    );

    let acceptor = tls::acceptor(Arc::new(provider));
    let connectors =
        BackendConnectors::new(config.backend_ca.as_deref()).context("failed to build TLS connectors")?;

    let forwarder = Arc::new(Forwarder::new(
        locator,
        connectors,
        ForwarderConfig {
            dial_timeout: config.dial_timeout,
            head_timeout: config.head_timeout,
        },
    ));

    let listener = Listener::bind(
        ListenerConfig {
            bind_addr: config.listen_addr,
            max_connections: config.max_connections,
            proxy_protocol: config.proxy_protocol,
        },
        acceptor,
        forwarder,
    )
    .await
    .context("failed to bind listener")?;

    Arc::new(listener).run().await.context("listener failed")
}
