//! TTL cache with single-flight coalescing in front of any locator.
//!
//! The cache holds exactly one immutable snapshot at a time, swapped through
//! an [`ArcSwap`]. Readers load the current snapshot without locking; misses
//! serialize on a single mutex, re-check the snapshot, query the inner
//! locator once, and publish a rebuilt snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::name::normalize;
use super::{Endpoint, Locator};

/// Effective TTL when a configured TTL is zero.
pub const DEFAULT_TTL: Duration = Duration::from_secs(15);

/// Configuration for [`CachingLocator`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long a successful lookup is cached. Zero means 15 s.
    pub positive_ttl: Duration,
    /// How long an unresolvable lookup is cached. Zero means 15 s.
    pub negative_ttl: Duration,
    /// Maximum number of cached entries. Zero means unbounded.
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            positive_ttl: DEFAULT_TTL,
            negative_ttl: DEFAULT_TTL,
            max_size: 1024,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    expires_at: Instant,
    endpoint: Option<Arc<Endpoint>>,
}

type Snapshot = HashMap<String, CacheEntry>;

/// Wraps another locator to cache its results, positive and negative.
pub struct CachingLocator<L> {
    inner: L,
    config: CacheConfig,
    snapshot: ArcSwap<Snapshot>,
    miss_lock: Mutex<()>,
}

impl<L: Locator> CachingLocator<L> {
    pub fn new(inner: L, config: CacheConfig) -> Self {
        Self {
            inner,
            config,
            snapshot: ArcSwap::from_pointee(Snapshot::new()),
            miss_lock: Mutex::new(()),
        }
    }

    /// Number of live entries in the current snapshot.
    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }

    /// Fetch a fresh entry from the current snapshot. The outer `None`
    /// means "no fresh entry"; the inner option is a cached negative.
    fn fetch(&self, name: &str, now: Instant) -> Option<Option<Arc<Endpoint>>> {
        let snapshot = self.snapshot.load();
        let entry = snapshot.get(name)?;
        if entry.expires_at > now {
            Some(entry.endpoint.clone())
        } else {
            None
        }
    }

    /// Miss path: serialize on the mutex, re-check, query the inner
    /// locator, and publish a rebuilt snapshot.
    async fn forward(&self, name: &str) -> Option<Arc<Endpoint>> {
        let _guard = self.miss_lock.lock().await;

        // Another caller may have filled the entry while we waited.
        if let Some(cached) = self.fetch(name, Instant::now()) {
            return cached;
        }

        let endpoint = self.inner.locate(name).await;
        let ttl = self.ttl_for(endpoint.is_some());

        match &endpoint {
            Some(endpoint) => debug!(
                server_name = %name,
                address = %endpoint.address,
                description = %endpoint.description,
                ttl_ms = ttl.as_millis() as u64,
                "caching resolved route"
            ),
            None => debug!(
                server_name = %name,
                ttl_ms = ttl.as_millis() as u64,
                "caching unresolvable route"
            ),
        }

        let now = Instant::now();
        let current = self.snapshot.load_full();

        let mut next = Snapshot::with_capacity(current.len() + 1);
        next.insert(
            name.to_string(),
            CacheEntry {
                expires_at: now + ttl,
                endpoint: endpoint.clone(),
            },
        );
        for (key, entry) in current.iter() {
            if entry.expires_at > now && key != name {
                next.insert(key.clone(), entry.clone());
            }
        }

        // Over capacity after dropping expired entries: evict arbitrary
        // entries, but never the one just inserted.
        if self.config.max_size > 0 && next.len() > self.config.max_size {
            let excess = next.len() - self.config.max_size;
            let victims: Vec<String> = next
                .keys()
                .filter(|key| key.as_str() != name)
                .take(excess)
                .cloned()
                .collect();
            for key in victims {
                next.remove(&key);
            }
        }

        self.snapshot.store(Arc::new(next));

        endpoint
    }

    fn ttl_for(&self, resolved: bool) -> Duration {
        let ttl = if resolved {
            self.config.positive_ttl
        } else {
            self.config.negative_ttl
        };

        if ttl.is_zero() {
            DEFAULT_TTL
        } else {
            ttl
        }
    }
}

#[async_trait]
impl<L: Locator> Locator for CachingLocator<L> {
    async fn locate(&self, server_name: &str) -> Option<Arc<Endpoint>> {
        let name = normalize(server_name);

        // Fast path: one atomic load, no locking.
        if let Some(cached) = self.fetch(&name, Instant::now()) {
            return cached;
        }

        debug!(server_name = %name, "cache miss");
        self.forward(&name).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::backend::TlsMode;

    /// Inner locator that counts invocations and resolves names not
    /// starting with "miss".
    struct CountingLocator {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl CountingLocator {
        fn new(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Locator for CountingLocator {
        async fn locate(&self, server_name: &str) -> Option<Arc<Endpoint>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if server_name.starts_with("miss") {
                None
            } else {
                Some(Arc::new(Endpoint::new(
                    format!("{server_name}:80"),
                    TlsMode::Disabled,
                    "counting",
                )))
            }
        }
    }

    fn cache(inner: CountingLocator, config: CacheConfig) -> Arc<CachingLocator<CountingLocator>> {
        Arc::new(CachingLocator::new(inner, config))
    }

    #[tokio::test]
    async fn test_positive_hit_skips_inner() {
        let locator = cache(CountingLocator::new(Duration::ZERO), CacheConfig::default());

        let first = locator.locate("a.example").await.unwrap();
        let second = locator.locate("a.example").await.unwrap();

        assert_eq!(locator.inner.calls(), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_negative_hit_skips_inner() {
        let locator = cache(CountingLocator::new(Duration::ZERO), CacheConfig::default());

        assert!(locator.locate("miss.example").await.is_none());
        assert!(locator.locate("miss.example").await.is_none());

        assert_eq!(locator.inner.calls(), 1);
    }

    #[tokio::test]
    async fn test_case_insensitive_keying() {
        let locator = cache(CountingLocator::new(Duration::ZERO), CacheConfig::default());

        locator.locate("a.example").await.unwrap();
        locator.locate("A.EXAMPLE").await.unwrap();
        locator.locate("A.Example.").await.unwrap();

        assert_eq!(locator.inner.calls(), 1);
    }

    #[tokio::test]
    async fn test_single_flight() {
        let locator = cache(
            CountingLocator::new(Duration::from_millis(50)),
            CacheConfig::default(),
        );

        let mut tasks = Vec::new();
        for _ in 0..100 {
            let locator = Arc::clone(&locator);
            tasks.push(tokio::spawn(
                async move { locator.locate("a.example").await },
            ));
        }

        let mut endpoints = Vec::new();
        for task in tasks {
            endpoints.push(task.await.unwrap().unwrap());
        }

        assert_eq!(locator.inner.calls(), 1);
        for endpoint in &endpoints {
            assert!(Arc::ptr_eq(endpoint, &endpoints[0]));
        }
    }

    #[tokio::test]
    async fn test_negative_entry_expires() {
        let locator = cache(
            CountingLocator::new(Duration::ZERO),
            CacheConfig {
                negative_ttl: Duration::from_millis(200),
                ..CacheConfig::default()
            },
        );

        assert!(locator.locate("miss.example").await.is_none());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(locator.locate("miss.example").await.is_none());
        assert_eq!(locator.inner.calls(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(locator.locate("miss.example").await.is_none());
        assert_eq!(locator.inner.calls(), 2);
    }

    #[tokio::test]
    async fn test_zero_ttl_defaults_to_fifteen_seconds() {
        let locator = cache(
            CountingLocator::new(Duration::ZERO),
            CacheConfig {
                positive_ttl: Duration::ZERO,
                negative_ttl: Duration::ZERO,
                max_size: 0,
            },
        );

        assert_eq!(locator.ttl_for(true), DEFAULT_TTL);
        assert_eq!(locator.ttl_for(false), DEFAULT_TTL);
    }

    #[tokio::test]
    async fn test_bounded_size() {
        let locator = cache(
            CountingLocator::new(Duration::ZERO),
            CacheConfig {
                max_size: 3,
                ..CacheConfig::default()
            },
        );

        for i in 0..10 {
            locator.locate(&format!("host-{i}.example")).await.unwrap();
            assert!(locator.len() <= 3);
        }

        // The most recent insertion is always retained.
        assert!(locator
            .fetch("host-9.example", Instant::now())
            .is_some());
    }
}
