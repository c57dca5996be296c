//! Pattern-table locator for wildcard routes.
//!
//! Used by the environment route source; an orchestrator-derived source
//! would feed the same table.

use std::sync::Arc;

use async_trait::async_trait;

use super::name::{normalize, Pattern};
use super::{Endpoint, Locator};

/// Locator matching server names against an ordered list of patterns.
///
/// The highest-specificity match wins: exact beats wildcard, and a longer
/// literal part beats a shorter one. Ties resolve by insertion order.
#[derive(Debug, Default)]
pub struct MatchingLocator {
    routes: Vec<(Pattern, Arc<Endpoint>)>,
}

impl MatchingLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, pattern: Pattern, endpoint: Endpoint) {
        self.routes.push((pattern, Arc::new(endpoint)));
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[async_trait]
impl Locator for MatchingLocator {
    async fn locate(&self, server_name: &str) -> Option<Arc<Endpoint>> {
        let name = normalize(server_name);

        let mut best: Option<(usize, &Arc<Endpoint>)> = None;
        for (pattern, endpoint) in &self.routes {
            if !pattern.matches(&name) {
                continue;
            }
            let specificity = pattern.specificity();
            if best.map_or(true, |(current, _)| specificity > current) {
                best = Some((specificity, endpoint));
            }
        }

        best.map(|(_, endpoint)| Arc::clone(endpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TlsMode;

    fn endpoint(address: &str) -> Endpoint {
        Endpoint::new(address, TlsMode::Disabled, "test")
    }

    #[tokio::test]
    async fn test_wildcard_match() {
        let mut locator = MatchingLocator::new();
        locator.push(Pattern::parse("foo.*").unwrap(), endpoint("foo:80"));
        locator.push(Pattern::parse("*.example.com").unwrap(), endpoint("any:80"));

        assert_eq!(locator.locate("foo.anything").await.unwrap().address, "foo:80");
        assert_eq!(locator.locate("a.example.com").await.unwrap().address, "any:80");
        assert!(locator.locate("example.com").await.is_none());
    }

    #[tokio::test]
    async fn test_exact_beats_wildcard() {
        let mut locator = MatchingLocator::new();
        locator.push(Pattern::parse("foo.*").unwrap(), endpoint("wild:80"));
        locator.push(Pattern::parse("foo.example").unwrap(), endpoint("exact:80"));

        assert_eq!(locator.locate("foo.example").await.unwrap().address, "exact:80");
        assert_eq!(locator.locate("foo.other").await.unwrap().address, "wild:80");
    }

    #[tokio::test]
    async fn test_longer_literal_wins() {
        let mut locator = MatchingLocator::new();
        locator.push(Pattern::parse("foo.*").unwrap(), endpoint("short:80"));
        locator.push(Pattern::parse("foo.bar.*").unwrap(), endpoint("long:80"));

        assert_eq!(locator.locate("foo.bar.baz").await.unwrap().address, "long:80");
    }

    #[tokio::test]
    async fn test_ties_resolve_by_insertion_order() {
        let mut locator = MatchingLocator::new();
        locator.push(Pattern::parse("a.*").unwrap(), endpoint("first:80"));
        locator.push(Pattern::parse("b.*").unwrap(), endpoint("second:80"));
        locator.push(Pattern::parse("*.c").unwrap(), endpoint("third:80"));

        // Same specificity, first insertion wins.
        assert_eq!(locator.locate("a.c").await.unwrap().address, "first:80");
    }
}
