//! Per-host store of agentic tokens handed to the observability exporter.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

/// Tokens keyed by `"{tenant_id}:{agent_id}"`.
///
/// Cloning shares the underlying map. Entries live as long as the store; a
/// later token for the same key replaces the earlier one.
#[derive(Debug, Clone, Default)]
pub struct AgenticTokenCache {
    tokens: Arc<RwLock<HashMap<String, String>>>,
}

fn cache_key(tenant_id: &str, agent_id: &str) -> String {
    format!("{tenant_id}:{agent_id}")
}

impl AgenticTokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache the token for a tenant/agent pair.
    pub fn cache_agentic_token(&self, tenant_id: &str, agent_id: &str, token: impl Into<String>) {
        let key = cache_key(tenant_id, agent_id);
        let mut tokens = self.tokens.write().unwrap_or_else(|e| e.into_inner());
        tokens.insert(key.clone(), token.into());
        debug!("Cached agentic token for {}", key);
    }

    /// Retrieve the cached token for a tenant/agent pair.
    pub fn get_cached_agentic_token(&self, tenant_id: &str, agent_id: &str) -> Option<String> {
        let key = cache_key(tenant_id, agent_id);
        let tokens = self.tokens.read().unwrap_or_else(|e| e.into_inner());
        let token = tokens.get(&key).filter(|t| !t.is_empty()).cloned();
        if token.is_some() {
            debug!("Retrieved cached agentic token for {}", key);
        } else {
            debug!("No cached token found for {}", key);
        }
        token
    }

    pub fn len(&self) -> usize {
        self.tokens.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_roundtrip_per_key() {
        let cache = AgenticTokenCache::new();
        cache.cache_agentic_token("tenant-a", "agent-1", "tok-a1");
        cache.cache_agentic_token("tenant-b", "agent-1", "tok-b1");

        assert_eq!(
            cache.get_cached_agentic_token("tenant-a", "agent-1").as_deref(),
            Some("tok-a1")
        );
        assert_eq!(
            cache.get_cached_agentic_token("tenant-b", "agent-1").as_deref(),
            Some("tok-b1")
        );
        assert!(cache.get_cached_agentic_token("tenant-a", "agent-2").is_none());
    }

    #[test]
    fn test_latest_token_wins() {
        let cache = AgenticTokenCache::new();
        cache.cache_agentic_token("t", "a", "old");
        cache.cache_agentic_token("t", "a", "new");
        assert_eq!(cache.get_cached_agentic_token("t", "a").as_deref(), Some("new"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_clones_share_entries() {
        let cache = AgenticTokenCache::new();
        let other = cache.clone();
        other.cache_agentic_token("t", "a", "shared");
        assert_eq!(cache.get_cached_agentic_token("t", "a").as_deref(), Some("shared"));
    }

    #[test]
    fn test_separate_stores_are_isolated() {
        let one = AgenticTokenCache::new();
        let two = AgenticTokenCache::new();
        one.cache_agentic_token("t", "a", "x");
        assert!(two.is_empty());
    }

    #[test]
    fn test_empty_token_reads_as_missing() {
        let cache = AgenticTokenCache::new();
        cache.cache_agentic_token("t", "a", "");
        assert!(cache.get_cached_agentic_token("t", "a").is_none());
    }
}
