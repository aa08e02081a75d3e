// Schema Graph Cache - one static graph per schema fingerprint.
// Populated lazily, read concurrently, invalidated wholesale on schema reload.

use super::builder::{EdgeCosts, SchemaGraph};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use vantage_common::config::GraphConfig;
use vantage_common::Schema;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Time to live of a cached graph
    pub ttl: Duration,
    /// Maximum number of cached graphs
    pub max_entries: u64,
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_entries: 64,
            enabled: true,
        }
    }
}

impl From<&GraphConfig> for CacheConfig {
    fn from(config: &GraphConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.cache_ttl_secs),
            max_entries: config.cache_max_entries,
            enabled: config.cache_enabled,
        }
    }
}

pub struct SchemaGraphCache {
    graphs: Cache<String, Arc<SchemaGraph>>,
    config: CacheConfig,
}

impl SchemaGraphCache {
    pub fn new(config: CacheConfig) -> Self {
        let graphs = Cache::builder()
            .time_to_live(config.ttl)
            .max_capacity(config.max_entries)
            .build();
        Self { graphs, config }
    }

    /// Returns the cached graph for this schema, building it under the cache's
    /// per-key lock on a miss so concurrent queries never build twice.
    pub async fn get_or_build(&self, schema: &Schema, costs: EdgeCosts) -> Arc<SchemaGraph> {
        if !self.config.enabled {
            return Arc::new(SchemaGraph::build(schema, costs));
        }

        let fingerprint = schema.fingerprint();
        if let Some(graph) = self.graphs.get(&fingerprint).await {
            tracing::debug!("Schema graph cache HIT for {}", &fingerprint[..12]);
            return graph;
        }

        tracing::debug!("Schema graph cache MISS for {}", &fingerprint[..12]);
        self.graphs
            .get_with(fingerprint, async { Arc::new(SchemaGraph::build(schema, costs)) })
            .await
    }

    pub async fn invalidate_all(&self) {
        self.graphs.invalidate_all();
        self.graphs.run_pending_tasks().await;
        tracing::info!("Invalidated all cached schema graphs");
    }

    pub async fn stats(&self) -> CacheStats {
        self.graphs.run_pending_tasks().await;
        CacheStats {
            entries: self.graphs.entry_count(),
            max_entries: self.config.max_entries,
        }
    }
}

#[derive(Debug)]
pub struct CacheStats {
    pub entries: u64,
    pub max_entries: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use vantage_common::{PrimitiveKind, Type};

    fn costs() -> EdgeCosts {
        EdgeCosts { attribute: 1, invocation: 10 }
    }

    #[tokio::test]
    async fn test_cache_hit_returns_same_graph() {
        let cache = SchemaGraphCache::new(CacheConfig::default());
        let schema = Schema::new(vec![Type::scalar("FilmId", PrimitiveKind::Int)], vec![]);

        let first = cache.get_or_build(&schema, costs()).await;
        let second = cache.get_or_build(&schema, costs()).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.stats().await.entries, 1);
    }

    #[tokio::test]
    async fn test_invalidate_all_drops_graphs() {
        let cache = SchemaGraphCache::new(CacheConfig::default());
        let schema = Schema::new(vec![Type::scalar("FilmId", PrimitiveKind::Int)], vec![]);

        let first = cache.get_or_build(&schema, costs()).await;
        cache.invalidate_all().await;
        let second = cache.get_or_build(&schema, costs()).await;
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_disabled_cache_always_builds() {
        let cache = SchemaGraphCache::new(CacheConfig { enabled: false, ..CacheConfig::default() });
        let schema = Schema::new(vec![], vec![]);

        let first = cache.get_or_build(&schema, costs()).await;
        let second = cache.get_or_build(&schema, costs()).await;
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
