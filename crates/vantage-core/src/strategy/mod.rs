// Discovery strategies, tried in priority order until one yields a value.

pub mod batch;
pub mod direct;
pub mod graph_search;

use crate::context::{DiscoveryFrame, DiscoveryTarget, QueryContext};
use crate::facts::FactBag;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use vantage_common::{QueryError, TypedInstance};

pub use batch::TableLookupStrategy;
pub use direct::DirectOperationStrategy;
pub use graph_search::GraphSearchStrategy;

pub enum StrategyOutcome {
    Resolved(BoxStream<'static, TypedInstance>),
    NotApplicable,
    /// Every candidate path needed a type that is still being discovered.
    RecursiveDiscoveryAborted,
}

impl StrategyOutcome {
    pub fn single(value: TypedInstance) -> Self {
        StrategyOutcome::Resolved(stream::once(async move { value }).boxed())
    }
}

#[async_trait]
pub trait QueryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn try_resolve(
        &self,
        ctx: &Arc<QueryContext>,
        target: &DiscoveryTarget,
        bag: &Arc<FactBag>,
        frame: &DiscoveryFrame,
    ) -> Result<StrategyOutcome, QueryError>;
}

pub fn default_strategies() -> Vec<Arc<dyn QueryStrategy>> {
    vec![Arc::new(DirectOperationStrategy), Arc::new(TableLookupStrategy), Arc::new(GraphSearchStrategy)]
}
