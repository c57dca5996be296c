//! edgegate
//!
//! A TLS-terminating reverse proxy that routes inbound HTTPS and secure
//! WebSocket connections to back-end servers selected by TLS SNI.

pub mod backend;
pub mod config;
pub mod proxy;
pub mod tls;

pub use backend::{
    routes_from_env, AggregateLocator, CacheConfig, CachingLocator, Endpoint, Locator,
    MatchingLocator, StaticLocator, TlsMode,
};
pub use proxy::{Forwarder, ForwarderConfig, Listener, ListenerConfig};
pub use tls::{BackendConnectors, CertificateProvider, FileCertificateProvider};
