// Discovery graph: static schema graph, per-discovery instance layer, path search
// and the process-wide schema graph cache.

pub mod builder;
pub mod cache;
pub mod element;
pub mod search;

pub use builder::{EdgeCosts, QueryGraph, SchemaGraph};
pub use cache::{CacheConfig, CacheStats, SchemaGraphCache};
pub use element::{Edge, Element, Relationship};
pub use search::{shortest_path, Exclusions, PathSignature, SearchPath};
