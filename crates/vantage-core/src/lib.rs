pub mod constraints;
pub mod context;
pub mod engine;
pub mod facts;
pub mod graph;
pub mod invoker;
pub mod projection;
pub mod statistics;
pub mod strategy;
pub mod synonyms;

pub use context::{CallOutcome, DiscoveryFrame, DiscoveryTarget, QueryContext};
pub use engine::{QueryEngine, QueryItem, QueryResult};
pub use facts::{FactBag, FactDiscoveryStrategy, TypeMatching};
pub use graph::{SchemaGraph, SchemaGraphCache};
pub use invoker::{
    InvokerRegistry, NoopEventDispatcher, OperationInvoker, OperationResponse, QueryEventDispatcher, StubInvoker,
};
pub use projection::functions::FunctionRegistry;
pub use projection::ProjectionBuilder;
pub use statistics::{QueryStatistics, QueryStatisticsSnapshot};
pub use strategy::{QueryStrategy, StrategyOutcome};

// Re-export common types for convenience
pub use vantage_common::{
    DataSource, DataSourceId, EngineConfig, Expr, Query, QueryError, Schema, TypeRef, TypedInstance,
};
