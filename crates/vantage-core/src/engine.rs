use crate::context::{CallOutcome, DiscoveryFrame, DiscoveryTarget, EngineServices, QueryContext};
use crate::facts::FactBag;
use crate::graph::{CacheConfig, EdgeCosts, SchemaGraphCache};
use crate::invoker::{InvokerRegistry, NoopEventDispatcher, OperationInvoker, QueryEventDispatcher};
use crate::projection::{batch, functions::FunctionRegistry, ProjectionBuilder};
use crate::statistics::QueryStatisticsSnapshot;
use crate::strategy::{default_strategies, QueryStrategy};
use crate::synonyms::SynonymResolver;
use futures::stream::{self, BoxStream, StreamExt};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;
use vantage_common::{
    Directive, EngineConfig, GivenValue, LineageArena, OperationReference, Projection, ProjectionTarget, Query,
    QueryError, Schema, TypedInstance,
};

pub type QueryItem = Result<TypedInstance, QueryError>;

/// Entry point: compiles nothing itself, it runs already-compiled [`Query`]
/// values against a schema and a set of operation invokers.
pub struct QueryEngine {
    services: EngineServices,
    graph_cache: Arc<SchemaGraphCache>,
}

impl QueryEngine {
    pub fn new(schema: Schema, config: EngineConfig) -> Self {
        let graph_cache = Arc::new(SchemaGraphCache::new(CacheConfig::from(&config.graph)));
        let synonyms = Arc::new(SynonymResolver::new(&schema));
        Self {
            services: EngineServices {
                schema: Arc::new(schema),
                config: Arc::new(config),
                invokers: InvokerRegistry::default(),
                dispatcher: Arc::new(NoopEventDispatcher),
                functions: Arc::new(FunctionRegistry::default()),
                synonyms,
                strategies: default_strategies(),
            },
            graph_cache,
        }
    }

    pub fn with_invoker(mut self, invoker: Arc<dyn OperationInvoker>) -> Self {
        self.services.invokers.register(invoker);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn QueryEventDispatcher>) -> Self {
        self.services.dispatcher = dispatcher;
        self
    }

    /// Shares one schema graph cache between engines.
    pub fn with_graph_cache(mut self, cache: Arc<SchemaGraphCache>) -> Self {
        self.graph_cache = cache;
        self
    }

    /// Replaces the discovery strategy chain; strategies are tried in order.
    pub fn with_strategies(mut self, strategies: Vec<Arc<dyn QueryStrategy>>) -> Self {
        self.services.strategies = strategies;
        self
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.services.schema
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.services.functions
    }

    pub fn graph_cache(&self) -> &Arc<SchemaGraphCache> {
        &self.graph_cache
    }

    /// Starts a query. The returned [`QueryResult`] streams output values as they
    /// are produced; dropping it cancels any remaining work.
    pub async fn query(
        &self,
        query: Query,
        arguments: HashMap<String, serde_json::Value>,
    ) -> Result<QueryResult, QueryError> {
        let schema = self.services.schema.clone();
        if let Some(missing) = query.required_arguments().find(|name| !arguments.contains_key(*name)) {
            return Err(QueryError::MissingArgument { name: missing.to_string() });
        }
        self.validate(&query)?;

        let facts = Arc::new(FactBag::new(Vec::new()));
        for given in &query.given {
            let json = match &given.value {
                GivenValue::Literal(value) => value.clone(),
                GivenValue::Argument(name) => arguments.get(name).cloned().unwrap_or(serde_json::Value::Null),
            };
            let instance =
                TypedInstance::from_json(&schema, &given.type_ref, &json, vantage_common::DataSourceId::PROVIDED)?;
            facts.add_named(&given.name, instance);
        }

        let costs = EdgeCosts::from(&self.services.config.graph);
        let graph = self.graph_cache.get_or_build(&schema, costs).await;
        let (cancel, cancellation) = watch::channel(false);
        let query_id = Uuid::new_v4().to_string();
        let ctx = Arc::new(QueryContext::new(
            query_id.clone(),
            query.directive,
            &self.services,
            graph,
            facts,
            cancellation,
        ));

        tracing::info!("Query {} started: {:?} {}", query_id, query.directive, query.target.type_ref);
        let pipeline = build_pipeline(ctx.clone(), query).await?;

        let (sender, receiver) = mpsc::channel(ctx.config.projection_concurrency() * 2);
        let task_ctx = ctx.clone();
        let handle = tokio::spawn(async move {
            let mut pipeline = pipeline;
            let mut emitted = 0usize;
            loop {
                let item = match AssertUnwindSafe(pipeline.next()).catch_unwind().await {
                    Ok(Some(item)) => item,
                    Ok(None) => break,
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        tracing::error!("Query {} aborted after {} result(s): {}", task_ctx.query_id, emitted, message);
                        let _ = sender.send(Err(QueryError::Internal(format!("query task panicked: {}", message)))).await;
                        return;
                    }
                };
                if sender.send(item).await.is_err() {
                    tracing::debug!("Query {} output closed by consumer", task_ctx.query_id);
                    return;
                }
                emitted += 1;
            }
            let stats = task_ctx.stats.snapshot();
            tracing::info!(
                "Query {} finished: {} result(s), {} remote call(s), {} failed search(es)",
                task_ctx.query_id,
                emitted,
                stats.remote_calls,
                stats.failed_searches
            );
        });

        Ok(QueryResult { query_id, context: ctx, receiver, task: TaskGuard(handle), cancel })
    }

    fn validate(&self, query: &Query) -> Result<(), QueryError> {
        let schema = &self.services.schema;
        schema.require_type(&query.target.type_ref.name)?;
        for given in &query.given {
            schema.require_type(&given.type_ref.name)?;
        }
        if let Some(Projection { target: ProjectionTarget::Type(name), .. }) = &query.projection {
            schema.require_type(name)?;
        }
        if query.directive == Directive::Map && query.projection.is_none() {
            return Err(QueryError::InvalidQuery("map requires a projection".into()));
        }
        if let Some(call) = &query.call {
            resolve_operation(schema, call)?;
        }
        Ok(())
    }
}

fn resolve_operation<'a>(
    schema: &'a Schema,
    reference: &OperationReference,
) -> Result<(&'a vantage_common::Service, &'a vantage_common::Operation), QueryError> {
    schema
        .service(&reference.service)
        .and_then(|service| service.operation(&reference.operation).map(|op| (service, op)))
        .ok_or_else(|| QueryError::UnknownOperation {
            operation: format!("{}::{}", reference.service, reference.operation),
        })
}

/// Resolves the root target, then lays out projection and mutation over it.
async fn build_pipeline(ctx: Arc<QueryContext>, query: Query) -> Result<BoxStream<'static, QueryItem>, QueryError> {
    let target = DiscoveryTarget::constrained(query.target.type_ref.clone(), query.target.constraints.clone());
    let frame = DiscoveryFrame::root();
    let root_failure = |frame: &DiscoveryFrame| {
        frame
            .failures()
            .pop()
            .map(|f| f.error)
            .unwrap_or_else(|| QueryError::unresolved(&target.type_ref.name))
    };

    let projection = query.projection.clone().map(Arc::new);
    let elements: BoxStream<'static, TypedInstance> = match query.directive {
        Directive::Stream => match ctx.discover_stream(&target, &ctx.facts, &frame).await? {
            Some(values) => values.flat_map(|value| stream::iter(split(value))).boxed(),
            None => return Err(root_failure(&frame)),
        },
        Directive::Find | Directive::Map => {
            let root = if query.directive == Directive::Map {
                ctx.find_fact(&ctx.facts, &target)
            } else {
                ctx.discover(&target, &ctx.facts, &frame).await?
            };
            let Some(root) = root else {
                return Err(root_failure(&frame));
            };
            let elements = match &projection {
                Some(p) if !p.collection => vec![root],
                _ => split(root),
            };
            if let Some(p) = &projection {
                if p.collection {
                    batch::prefetch(&ctx, &elements, p).await?;
                }
            }
            stream::iter(elements).boxed()
        }
    };

    let projected: BoxStream<'static, QueryItem> = match projection {
        None => elements.map(Ok).boxed(),
        Some(projection) => {
            let builder_ctx = ctx.clone();
            let futures = elements.map(move |element| {
                let builder = ProjectionBuilder::new(builder_ctx.clone());
                let projection = projection.clone();
                async move { builder.project(element, &projection).await }
            });
            let concurrency = ctx.config.projection_concurrency();
            if ctx.config.projection.preserve_order {
                futures.buffered(concurrency).boxed()
            } else {
                futures.buffer_unordered(concurrency).boxed()
            }
        }
    };

    let Some(call) = query.call else {
        return Ok(projected);
    };
    let call = Arc::new(call);
    Ok(projected
        .then(move |item| {
            let ctx = ctx.clone();
            let call = call.clone();
            async move {
                match item {
                    Ok(value) => invoke_mutation(&ctx, &call, value).await,
                    Err(error) => Err(error),
                }
            }
        })
        .boxed())
}

fn split(value: TypedInstance) -> Vec<TypedInstance> {
    if value.is_collection() {
        value.items().to_vec()
    } else {
        vec![value]
    }
}

/// Runs the query's trailing `call` once per output element, sequentially.
async fn invoke_mutation(
    ctx: &Arc<QueryContext>,
    reference: &OperationReference,
    element: TypedInstance,
) -> Result<TypedInstance, QueryError> {
    let schema = ctx.schema.clone();
    let (service, operation) = resolve_operation(&schema, reference)?;
    let bag = Arc::new(FactBag::scoped(ctx.facts.clone(), Some(element), Vec::new()));
    let frame = DiscoveryFrame::root();
    let no_bindings = HashMap::new();

    let mut parameters = Vec::with_capacity(operation.parameters.len());
    for parameter in &operation.parameters {
        let value = ctx
            .resolve_parameter(parameter, &bag, &frame, &no_bindings, true)
            .await?
            .ok_or_else(|| QueryError::unresolved(&parameter.type_ref.name))?;
        parameters.push((parameter.clone(), value));
    }

    match ctx.invoke(service, operation, parameters).await? {
        CallOutcome::Success { value, .. } => Ok(value),
        CallOutcome::Failed { error, .. } => Err(error),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return message.to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}

struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Handle on a running query.
pub struct QueryResult {
    pub query_id: String,
    context: Arc<QueryContext>,
    receiver: mpsc::Receiver<QueryItem>,
    task: TaskGuard,
    cancel: watch::Sender<bool>,
}

impl QueryResult {
    pub async fn next(&mut self) -> Option<QueryItem> {
        self.receiver.recv().await
    }

    /// Drains every result, stopping at the first error.
    pub async fn collect(mut self) -> Result<Vec<TypedInstance>, QueryError> {
        let mut values = Vec::new();
        while let Some(item) = self.next().await {
            values.push(item?);
        }
        Ok(values)
    }

    pub fn into_stream(self) -> BoxStream<'static, QueryItem> {
        stream::unfold(self, |mut result| async move { result.next().await.map(|item| (item, result)) }).boxed()
    }

    pub fn statistics(&self) -> QueryStatisticsSnapshot {
        self.context.stats.snapshot()
    }

    pub fn is_fully_resolved(&self) -> bool {
        self.statistics().is_fully_resolved()
    }

    pub fn lineage(&self) -> &LineageArena {
        &self.context.lineage
    }

    /// Stops the query; in-flight invocations are abandoned.
    pub fn cancel(&self) {
        tracing::info!("Query {} cancelled", self.query_id);
        let _ = self.cancel.send(true);
        self.task.0.abort();
    }
}

impl Drop for QueryResult {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod engine_tests;
