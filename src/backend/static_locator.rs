//! Fixed server-name to endpoint mappings.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::name::normalize;
use super::{Endpoint, Locator};

/// Locator backed by an in-memory map. Reads take a shared lock; `add`
/// takes an exclusive lock. Lookup is an exact match on the normalized name.
#[derive(Debug, Default)]
pub struct StaticLocator {
    endpoints: RwLock<HashMap<String, Arc<Endpoint>>>,
}

impl StaticLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new mapping from server name to back-end endpoint.
    pub async fn add(&self, server_name: &str, endpoint: Endpoint) {
        let mut endpoints = self.endpoints.write().await;
        endpoints.insert(normalize(server_name), Arc::new(endpoint));
    }

    pub async fn len(&self) -> usize {
        self.endpoints.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.endpoints.read().await.is_empty()
    }
}

#[async_trait]
impl Locator for StaticLocator {
    async fn locate(&self, server_name: &str) -> Option<Arc<Endpoint>> {
        let endpoints = self.endpoints.read().await;
        endpoints.get(&normalize(server_name)).cloned()
    }
}
