use serde::{Deserialize, Serialize};
use std::time::Duration;
use config::{Config, ConfigError, File, Environment};

// --- Constants for Default Configuration ---
pub const DEFAULT_GRAPH_CACHE_ENABLED: bool = true;
pub const DEFAULT_GRAPH_CACHE_MAX_ENTRIES: u64 = 64;
pub const DEFAULT_GRAPH_CACHE_TTL_SECS: u64 = 3600;
pub const DEFAULT_ATTRIBUTE_EDGE_COST: u32 = 1;
pub const DEFAULT_INVOCATION_EDGE_COST: u32 = 10;
pub const DEFAULT_MAX_PATH_ATTEMPTS: usize = 16;

pub const DEFAULT_DISCOVERY_MAX_DEPTH: usize = 8;
pub const DEFAULT_DEDUPE_INVOCATIONS: bool = true;

pub const DEFAULT_PROJECTION_CONCURRENCY: usize = 8;
pub const DEFAULT_PRESERVE_ORDER: bool = true;
pub const DEFAULT_BATCHING_ENABLED: bool = true;
pub const DEFAULT_MAX_BUILD_DEPTH: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    pub cache_enabled: bool,
    pub cache_max_entries: u64,
    pub cache_ttl_secs: u64,
    /// Cost of traversing an attribute, parameter or type edge.
    pub attribute_edge_cost: u32,
    /// Cost of traversing an operation invocation edge.
    pub invocation_edge_cost: u32,
    /// Paths tried per discovery before giving up.
    pub max_path_attempts: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub max_depth: usize,
    pub dedupe_invocations: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionConfig {
    pub concurrency: usize,
    pub preserve_order: bool,
    pub batching_enabled: bool,
    pub max_build_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub graph: GraphConfig,
    pub discovery: DiscoveryConfig,
    pub projection: ProjectionConfig,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            cache_enabled: DEFAULT_GRAPH_CACHE_ENABLED,
            cache_max_entries: DEFAULT_GRAPH_CACHE_MAX_ENTRIES,
            cache_ttl_secs: DEFAULT_GRAPH_CACHE_TTL_SECS,
            attribute_edge_cost: DEFAULT_ATTRIBUTE_EDGE_COST,
            invocation_edge_cost: DEFAULT_INVOCATION_EDGE_COST,
            max_path_attempts: DEFAULT_MAX_PATH_ATTEMPTS,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_DISCOVERY_MAX_DEPTH,
            dedupe_invocations: DEFAULT_DEDUPE_INVOCATIONS,
        }
    }
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_PROJECTION_CONCURRENCY,
            preserve_order: DEFAULT_PRESERVE_ORDER,
            batching_enabled: DEFAULT_BATCHING_ENABLED,
            max_build_depth: DEFAULT_MAX_BUILD_DEPTH,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            graph: GraphConfig::default(),
            discovery: DiscoveryConfig::default(),
            projection: ProjectionConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let s = Config::builder()
            // Default settings
            .set_default("graph.cache_enabled", DEFAULT_GRAPH_CACHE_ENABLED)?
            .set_default("graph.cache_max_entries", DEFAULT_GRAPH_CACHE_MAX_ENTRIES)?
            .set_default("graph.cache_ttl_secs", DEFAULT_GRAPH_CACHE_TTL_SECS)?
            .set_default("graph.attribute_edge_cost", DEFAULT_ATTRIBUTE_EDGE_COST)?
            .set_default("graph.invocation_edge_cost", DEFAULT_INVOCATION_EDGE_COST)?
            .set_default("graph.max_path_attempts", DEFAULT_MAX_PATH_ATTEMPTS as i64)?
            .set_default("discovery.max_depth", DEFAULT_DISCOVERY_MAX_DEPTH as i64)?
            .set_default("discovery.dedupe_invocations", DEFAULT_DEDUPE_INVOCATIONS)?
            .set_default("projection.concurrency", DEFAULT_PROJECTION_CONCURRENCY as i64)?
            .set_default("projection.preserve_order", DEFAULT_PRESERVE_ORDER)?
            .set_default("projection.batching_enabled", DEFAULT_BATCHING_ENABLED)?
            .set_default("projection.max_build_depth", DEFAULT_MAX_BUILD_DEPTH as i64)?

            // File: vantage.toml
            .add_source(File::with_name("vantage").required(false))

            // Environment: VANTAGE_PROJECTION__CONCURRENCY=4 -> projection.concurrency=4
            .add_source(Environment::with_prefix("VANTAGE").prefix_separator("_").separator("__"))

            .build()?;

        s.try_deserialize()
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.graph.cache_ttl_secs)
    }

    /// Concurrency floor of one so a misconfigured zero never stalls projection.
    pub fn projection_concurrency(&self) -> usize {
        self.projection.concurrency.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_uses_defaults() {
        let config = EngineConfig::load().expect("config");
        assert_eq!(config.graph.invocation_edge_cost, DEFAULT_INVOCATION_EDGE_COST);
        assert_eq!(config.discovery.max_depth, DEFAULT_DISCOVERY_MAX_DEPTH);
        assert!(config.projection.preserve_order);
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        let mut config = EngineConfig::default();
        config.projection.concurrency = 0;
        assert_eq!(config.projection_concurrency(), 1);
    }
}
