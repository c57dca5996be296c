//! Back-end endpoint model and the locator capability.
//!
//! This module provides:
//! - The immutable [`Endpoint`] descriptor for a back-end server
//! - The [`Locator`] trait mapping a server name to an endpoint
//! - Concrete locators: static table, pattern table, ordered aggregate,
//!   and a TTL cache decorator
//!
//! Locators compose into a tree; the caching decorator is the usual root:
//!
//! ```text
//! CachingLocator -> AggregateLocator -> [StaticLocator, MatchingLocator, ...]
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

mod cache;
mod env;
mod matching;
pub mod name;
mod static_locator;

pub use cache::{CacheConfig, CachingLocator};
pub use env::routes_from_env;
pub use matching::MatchingLocator;
pub use name::{normalize, Pattern, PatternError};
pub use static_locator::StaticLocator;

/// How the proxy should speak to a back-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// Plain TCP.
    Disabled,
    /// TLS with certificate verification.
    Enabled,
    /// TLS without certificate verification. Logged prominently per
    /// connection; intended for back-ends with self-signed certificates.
    Insecure,
}

/// An immutable description of a back-end server. Shared by reference
/// across concurrent requests; never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// The back-end address in `host:port` form.
    pub address: String,
    /// Whether and how to use TLS toward the back-end.
    pub tls_mode: TlsMode,
    /// Human-readable label used in logs.
    pub description: String,
}

impl Endpoint {
    pub fn new(
        address: impl Into<String>,
        tls_mode: TlsMode,
        description: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            tls_mode,
            description: description.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.address, self.description)
    }
}

/// Maps a TLS server name to a back-end endpoint.
///
/// `None` means no route is known. Lookups are read-only, may perform I/O,
/// and are cancelled by dropping the future.
#[async_trait]
pub trait Locator: Send + Sync {
    async fn locate(&self, server_name: &str) -> Option<Arc<Endpoint>>;
}

#[async_trait]
impl<L: Locator + ?Sized> Locator for Arc<L> {
    async fn locate(&self, server_name: &str) -> Option<Arc<Endpoint>> {
        (**self).locate(server_name).await
    }
}

/// Ordered fan-out over a set of locators; the first hit wins.
pub struct AggregateLocator {
    locators: Vec<Box<dyn Locator>>,
}

impl AggregateLocator {
    pub fn new(locators: Vec<Box<dyn Locator>>) -> Self {
        Self { locators }
    }
}

#[async_trait]
impl Locator for AggregateLocator {
    async fn locate(&self, server_name: &str) -> Option<Arc<Endpoint>> {
        for locator in &self.locators {
            if let Some(endpoint) = locator.locate(server_name).await {
                return Some(endpoint);
            }
        }
        None
    }
}
