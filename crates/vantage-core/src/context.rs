// Query Context
//
// One per top-level query. Owns the root fact bag, lineage arena, statistics,
// in-flight call table and cancellation signal; everything discovery needs is
// reached through it.

use crate::constraints::ConstraintEvaluator;
use crate::facts::{FactBag, FactDiscoveryStrategy, TypeMatching};
use crate::graph::{QueryGraph, SchemaGraph};
use crate::invoker::{InvokerRegistry, QueryEventDispatcher};
use crate::projection::batch::PrefetchTable;
use crate::projection::functions::FunctionRegistry;
use crate::statistics::QueryStatistics;
use crate::strategy::{QueryStrategy, StrategyOutcome};
use crate::synonyms::SynonymResolver;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{watch, OnceCell};
use vantage_common::{
    CallStatus, Cardinality, DataSource, DataSourceId, Directive, EngineConfig, LineageArena, Operation,
    OperationInput, OperationKind, Parameter, PropertyConstraint, QualifiedName, QueryError, RemoteCall, Scalar,
    Schema, Service, TypeRef, TypedInstance,
};

#[derive(Debug, Clone)]
pub struct DiscoveryTarget {
    pub type_ref: TypeRef,
    pub constraints: Vec<PropertyConstraint>,
}

impl DiscoveryTarget {
    pub fn of(type_ref: TypeRef) -> Self {
        Self { type_ref, constraints: Vec::new() }
    }

    pub fn constrained(type_ref: TypeRef, constraints: Vec<PropertyConstraint>) -> Self {
        Self { type_ref, constraints }
    }
}

#[derive(Debug, Clone)]
pub struct Failure {
    pub source: DataSourceId,
    pub error: QueryError,
}

/// State carried down one chain of nested discoveries: the types being produced
/// further up, the operations already committed to, and how deep we are.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryFrame {
    pub stack: Vec<QualifiedName>,
    pub excluded_operations: HashSet<QualifiedName>,
    pub depth: usize,
    failures: Arc<Mutex<Vec<Failure>>>,
}

impl DiscoveryFrame {
    pub fn root() -> Self {
        Self::default()
    }

    /// Frame for discovering an input of `operation` while producing `producing`.
    pub fn nested(&self, producing: &QualifiedName, operation: &QualifiedName) -> Self {
        let mut stack = self.stack.clone();
        stack.push(producing.clone());
        let mut excluded_operations = self.excluded_operations.clone();
        excluded_operations.insert(operation.clone());
        Self { stack, excluded_operations, depth: self.depth + 1, failures: self.failures.clone() }
    }

    pub fn is_discovering(&self, type_name: &QualifiedName) -> bool {
        self.stack.contains(type_name)
    }

    pub fn record_failure(&self, source: DataSourceId, error: QueryError) {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).push(Failure { source, error });
    }

    pub fn failures(&self) -> Vec<Failure> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[derive(Debug, Clone)]
pub enum CallOutcome {
    Success { value: TypedInstance, source: DataSourceId },
    Failed { error: QueryError, source: DataSourceId },
}

pub enum StreamOutcome {
    Open(BoxStream<'static, TypedInstance>),
    Failed { error: QueryError, source: DataSourceId },
}

/// Long-lived collaborators shared by every query an engine runs.
#[derive(Clone)]
pub struct EngineServices {
    pub schema: Arc<Schema>,
    pub config: Arc<EngineConfig>,
    pub invokers: InvokerRegistry,
    pub dispatcher: Arc<dyn QueryEventDispatcher>,
    pub functions: Arc<FunctionRegistry>,
    pub synonyms: Arc<SynonymResolver>,
    pub strategies: Vec<Arc<dyn QueryStrategy>>,
}

pub struct QueryContext {
    pub query_id: String,
    pub directive: Directive,
    pub schema: Arc<Schema>,
    pub config: Arc<EngineConfig>,
    pub facts: Arc<FactBag>,
    pub lineage: Arc<LineageArena>,
    pub stats: Arc<QueryStatistics>,
    pub prefetch: PrefetchTable,
    pub functions: Arc<FunctionRegistry>,
    graph: Arc<SchemaGraph>,
    synonyms: Arc<SynonymResolver>,
    invokers: InvokerRegistry,
    dispatcher: Arc<dyn QueryEventDispatcher>,
    strategies: Vec<Arc<dyn QueryStrategy>>,
    calls: DashMap<String, Arc<OnceCell<CallOutcome>>>,
    excluded_services: DashSet<QualifiedName>,
    cancellation: watch::Receiver<bool>,
}

impl QueryContext {
    pub fn new(
        query_id: String,
        directive: Directive,
        services: &EngineServices,
        graph: Arc<SchemaGraph>,
        facts: Arc<FactBag>,
        cancellation: watch::Receiver<bool>,
    ) -> Self {
        Self {
            query_id,
            directive,
            schema: services.schema.clone(),
            config: services.config.clone(),
            facts,
            lineage: Arc::new(LineageArena::new()),
            stats: Arc::new(QueryStatistics::default()),
            prefetch: PrefetchTable::default(),
            functions: services.functions.clone(),
            graph,
            synonyms: services.synonyms.clone(),
            invokers: services.invokers.clone(),
            dispatcher: services.dispatcher.clone(),
            strategies: services.strategies.clone(),
            calls: DashMap::new(),
            excluded_services: DashSet::new(),
            cancellation,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancellation.borrow()
    }

    pub fn check_cancelled(&self) -> Result<(), QueryError> {
        if self.is_cancelled() {
            return Err(QueryError::Cancelled);
        }
        Ok(())
    }

    pub fn query_graph(&self, facts: &[TypedInstance]) -> QueryGraph {
        self.graph.with_instances(&self.schema, facts)
    }

    /// Operation kinds discovery may invoke under this query's directive.
    pub fn allows(&self, operation: &Operation) -> bool {
        match operation.kind {
            OperationKind::Write => false,
            OperationKind::Stream => self.directive == Directive::Stream,
            _ => true,
        }
    }

    /// A known fact satisfying the target, after constraint filtering.
    pub fn find_fact(&self, bag: &FactBag, target: &DiscoveryTarget) -> Option<TypedInstance> {
        let strategy = if target.type_ref.is_collection() {
            FactDiscoveryStrategy::AnyDepthAllowMany
        } else {
            FactDiscoveryStrategy::AnyDepthExpectOneDistinct
        };
        let found = bag.find(&self.schema, &target.type_ref, TypeMatching::AllowInherited, strategy)?;
        if found.is_null() {
            return None;
        }
        let filtered = ConstraintEvaluator::new(&self.schema).filter(found, &target.constraints)?;
        if filtered.is_collection() && filtered.items().is_empty() {
            return None;
        }
        Some(filtered)
    }

    fn map_synonym(&self, bag: &FactBag, type_ref: &TypeRef) -> Option<TypedInstance> {
        if self.synonyms.is_empty() || type_ref.is_collection() {
            return None;
        }
        if !self.schema.type_named(&type_ref.name)?.is_enum() {
            return None;
        }
        for enum_type in self.schema.types().filter(|t| t.is_enum() && t.name != type_ref.name) {
            for candidate in bag.find_all(&self.schema, &enum_type.name, TypeMatching::Exact) {
                let Some(value) = candidate.as_scalar().and_then(|s| s.as_str()) else {
                    continue;
                };
                if let Some(mapping) = self.synonyms.resolve(&enum_type.name, value, &type_ref.name) {
                    let to_value = mapping.to_value.clone();
                    let source = self.lineage.record(DataSource::MappedSynonym { mapping, source: candidate.source });
                    tracing::debug!("Mapped {} '{}' to {} '{}'", enum_type.name, value, type_ref.name, to_value);
                    return Some(TypedInstance::scalar(type_ref.name.clone(), Scalar::Text(to_value), source));
                }
            }
        }
        None
    }

    /// First value the strategy chain produces for `target`.
    pub async fn discover(
        self: &Arc<Self>,
        target: &DiscoveryTarget,
        bag: &Arc<FactBag>,
        frame: &DiscoveryFrame,
    ) -> Result<Option<TypedInstance>, QueryError> {
        match self.discover_stream(target, bag, frame).await? {
            Some(mut values) => Ok(values.next().await),
            None => Ok(None),
        }
    }

    /// Facts first, then enum synonyms, then each strategy in priority order.
    /// The first strategy that yields at least one value wins.
    pub async fn discover_stream(
        self: &Arc<Self>,
        target: &DiscoveryTarget,
        bag: &Arc<FactBag>,
        frame: &DiscoveryFrame,
    ) -> Result<Option<BoxStream<'static, TypedInstance>>, QueryError> {
        self.check_cancelled()?;

        if let Some(fact) = self.find_fact(bag, target) {
            return Ok(Some(stream::once(async move { fact }).boxed()));
        }
        if let Some(mapped) = self.map_synonym(bag, &target.type_ref) {
            return Ok(Some(stream::once(async move { mapped }).boxed()));
        }
        if frame.is_discovering(&target.type_ref.name) || frame.depth > self.config.discovery.max_depth {
            tracing::debug!("Abandoning recursive discovery of {} at depth {}", target.type_ref, frame.depth);
            return Ok(None);
        }

        let mut aborted = false;
        for strategy in &self.strategies {
            match strategy.try_resolve(self, target, bag, frame).await? {
                StrategyOutcome::Resolved(values) => {
                    let (first, rest) = values.into_future().await;
                    if let Some(first) = first {
                        tracing::debug!("{} strategy resolved {}", strategy.name(), target.type_ref);
                        self.stats.record_strategy_win(strategy.name());
                        return Ok(Some(stream::once(async move { first }).chain(rest).boxed()));
                    }
                }
                StrategyOutcome::NotApplicable => {}
                StrategyOutcome::RecursiveDiscoveryAborted => aborted = true,
            }
        }

        if aborted {
            tracing::debug!("Every path to {} was circular", target.type_ref);
        }
        Ok(None)
    }

    /// Binds one operation parameter: contract constant, then a fact, then (when
    /// allowed) nested discovery, then null for optional parameters.
    pub async fn resolve_parameter(
        self: &Arc<Self>,
        parameter: &Parameter,
        bag: &Arc<FactBag>,
        frame: &DiscoveryFrame,
        bindings: &HashMap<String, Scalar>,
        allow_discovery: bool,
    ) -> Result<Option<TypedInstance>, QueryError> {
        if let Some(value) = bindings.get(&parameter.name) {
            return Ok(Some(TypedInstance::scalar(
                parameter.type_ref.name.clone(),
                value.clone(),
                DataSourceId::DEFINED_IN_SCHEMA,
            )));
        }
        let target = DiscoveryTarget::of(parameter.type_ref.clone());
        if let Some(fact) = self.find_fact(bag, &target) {
            return Ok(Some(fact));
        }
        if allow_discovery {
            if let Some(value) = self.discover(&target, bag, frame).await? {
                return Ok(Some(value));
            }
        }
        if parameter.nullable {
            return Ok(Some(TypedInstance::null(parameter.type_ref.clone(), DataSourceId::PROVIDED)));
        }
        Ok(None)
    }

    /// Invokes an operation at most once per distinct argument set within this
    /// query; concurrent callers with the same arguments await the first call.
    pub async fn invoke(
        &self,
        service: &Service,
        operation: &Operation,
        parameters: Vec<(Parameter, TypedInstance)>,
    ) -> Result<CallOutcome, QueryError> {
        self.check_cancelled()?;
        if !self.config.discovery.dedupe_invocations || operation.is_write() {
            let outcome = self.perform_call(service, operation, parameters).await?;
            if service.datasource {
                self.exclude_datasource(service);
            }
            return Ok(outcome);
        }

        let key = call_key(service, operation, &parameters);
        let cell = self.calls.entry(key.clone()).or_insert_with(|| Arc::new(OnceCell::new())).value().clone();
        let mut performed = false;
        let outcome = cell
            .get_or_try_init(|| {
                performed = true;
                self.perform_call(service, operation, parameters)
            })
            .await?
            .clone();
        if !performed {
            tracing::debug!("Invocation cache HIT for {}", key);
            self.stats.record_cache_hit();
        }
        if service.datasource {
            self.exclude_datasource(service);
        }
        Ok(outcome)
    }

    /// Once a `@Datasource` service has answered, graph searches stop routing
    /// through it and through the services it declares as excluded.
    fn exclude_datasource(&self, service: &Service) {
        if self.excluded_services.insert(service.name.clone()) {
            tracing::debug!("Excluding datasource {} from further searches", service.name);
        }
        for excluded in &service.excludes {
            self.excluded_services.insert(excluded.clone());
        }
    }

    pub fn excluded_services(&self) -> HashSet<QualifiedName> {
        self.excluded_services.iter().map(|s| s.key().clone()).collect()
    }

    async fn perform_call(
        &self,
        service: &Service,
        operation: &Operation,
        parameters: Vec<(Parameter, TypedInstance)>,
    ) -> Result<CallOutcome, QueryError> {
        let name = operation.qualified_name();
        let inputs = operation_inputs(&parameters);
        let request = request_payload(&parameters);
        let timestamp = Utc::now();

        let Some(invoker) = self.invokers.select(service, operation) else {
            let message = "no registered invoker supports this operation".to_string();
            tracing::warn!("Cannot invoke {}: {}", name, message);
            let call = failed_call(service, operation, request, 0, None, message.clone(), timestamp);
            let source = self.record_call(&name, inputs, call);
            let error = QueryError::OperationInvocationFailure { operation: name.to_string(), message };
            return Ok(CallOutcome::Failed { error, source });
        };

        tracing::debug!("Invoking {} with {} parameter(s)", name, parameters.len());
        let started = Instant::now();
        let mut cancellation = self.cancellation.clone();
        let response = tokio::select! {
            response = invoker.invoke(service, operation, parameters, &self.query_id) => response,
            _ = cancelled(&mut cancellation) => return Err(QueryError::Cancelled),
        };

        match response {
            Ok(response) => {
                let values: Vec<TypedInstance> = response.values.collect().await;
                let duration_ms = started.elapsed().as_millis() as u64;
                let call = RemoteCall {
                    service: service.name.clone(),
                    operation: operation.name.clone(),
                    address: response.address,
                    method: response.method,
                    request,
                    response: response.payload,
                    duration_ms,
                    status: CallStatus::Success,
                    timestamp,
                };
                let source = self.record_call(&name, inputs, call);
                let mut value = values
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| TypedInstance::null(operation.return_type.clone(), source));
                value.restamp(DataSourceId::PROVIDED, source);
                tracing::debug!("{} completed in {}ms", name, duration_ms);
                Ok(CallOutcome::Success { value, source })
            }
            Err(error) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                tracing::warn!("{} failed after {}ms: {}", name, duration_ms, error);
                let call =
                    failed_call(service, operation, request, duration_ms, error.status, error.message.clone(), timestamp);
                let source = self.record_call(&name, inputs, call);
                let error = QueryError::OperationInvocationFailure { operation: name.to_string(), message: error.message };
                Ok(CallOutcome::Failed { error, source })
            }
        }
    }

    /// Opens a streaming operation. Stream calls are never de-duplicated.
    pub async fn invoke_stream(
        &self,
        service: &Service,
        operation: &Operation,
        parameters: Vec<(Parameter, TypedInstance)>,
    ) -> Result<StreamOutcome, QueryError> {
        self.check_cancelled()?;
        let name = operation.qualified_name();
        let inputs = operation_inputs(&parameters);
        let request = request_payload(&parameters);
        let timestamp = Utc::now();
        let started = Instant::now();

        let response = match self.invokers.select(service, operation) {
            Some(invoker) => invoker.invoke(service, operation, parameters, &self.query_id).await,
            None => Err(vantage_common::InvocationError::new("no registered invoker supports this operation")),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match response {
            Ok(response) => {
                let call = RemoteCall {
                    service: service.name.clone(),
                    operation: operation.name.clone(),
                    address: response.address,
                    method: response.method,
                    request,
                    response: None,
                    duration_ms,
                    status: CallStatus::Success,
                    timestamp,
                };
                let source = self.record_call(&name, inputs, call);
                tracing::debug!("Opened stream {}", name);
                let values = response
                    .values
                    .map(move |mut value| {
                        value.restamp(DataSourceId::PROVIDED, source);
                        value
                    })
                    .boxed();
                Ok(StreamOutcome::Open(values))
            }
            Err(error) => {
                tracing::warn!("Stream {} failed to open: {}", name, error);
                let call =
                    failed_call(service, operation, request, duration_ms, error.status, error.message.clone(), timestamp);
                let source = self.record_call(&name, inputs, call);
                let error = QueryError::OperationInvocationFailure { operation: name.to_string(), message: error.message };
                Ok(StreamOutcome::Failed { error, source })
            }
        }
    }

    fn record_call(&self, operation: &QualifiedName, inputs: Vec<OperationInput>, call: RemoteCall) -> DataSourceId {
        let success = call.is_success();
        let duration_ms = call.duration_ms;
        let result = DataSource::OperationResult { operation: operation.clone(), inputs, call };
        let source = self.lineage.record(result.clone());
        self.dispatcher.report_remote_operation_invoked(&result, &self.query_id);
        self.stats
            .record_call(operation.as_str(), duration_ms, success, self.config.graph.invocation_edge_cost);
        source
    }

    /// A typed null explaining why discovery gave up.
    pub fn failed_search(&self, type_ref: &TypeRef, message: String, frame: &DiscoveryFrame) -> TypedInstance {
        self.stats.record_failed_search();
        let attempts = frame.failures().iter().map(|f| f.source).collect();
        let source = self.lineage.record(DataSource::FailedSearch { message, attempts });
        TypedInstance::null(type_ref.clone(), source)
    }
}

/// Shapes a discovered value to the requested cardinality.
pub fn fit_cardinality(value: TypedInstance, type_ref: &TypeRef) -> Option<TypedInstance> {
    match (type_ref.cardinality, value.is_collection()) {
        (Cardinality::One, true) => {
            let mut items = value.items().to_vec();
            if items.len() == 1 {
                items.pop()
            } else {
                None
            }
        }
        (Cardinality::One, false) => Some(value),
        (_, true) => Some(value),
        (_, false) => {
            let source = value.source;
            Some(TypedInstance::collection(type_ref.name.clone(), vec![value], source))
        }
    }
}

fn call_key(service: &Service, operation: &Operation, parameters: &[(Parameter, TypedInstance)]) -> String {
    if service.datasource {
        return operation.qualified_name().to_string();
    }
    let arguments: Vec<serde_json::Value> = parameters.iter().map(|(_, v)| v.to_json()).collect();
    format!("{}({})", operation.qualified_name(), serde_json::Value::Array(arguments))
}

fn operation_inputs(parameters: &[(Parameter, TypedInstance)]) -> Vec<OperationInput> {
    parameters
        .iter()
        .map(|(p, v)| OperationInput { name: p.name.clone(), value: v.to_json(), source: v.source })
        .collect()
}

fn request_payload(parameters: &[(Parameter, TypedInstance)]) -> serde_json::Value {
    serde_json::Value::Object(parameters.iter().map(|(p, v)| (p.name.clone(), v.to_json())).collect())
}

fn failed_call(
    service: &Service,
    operation: &Operation,
    request: serde_json::Value,
    duration_ms: u64,
    code: Option<u16>,
    message: String,
    timestamp: chrono::DateTime<Utc>,
) -> RemoteCall {
    RemoteCall {
        service: service.name.clone(),
        operation: operation.name.clone(),
        address: String::new(),
        method: operation.name.clone(),
        request,
        response: None,
        duration_ms,
        status: CallStatus::Failed { code, message },
        timestamp,
    }
}

/// Resolves once the query is cancelled; never resolves if the sender is gone.
async fn cancelled(receiver: &mut watch::Receiver<bool>) {
    loop {
        if *receiver.borrow() {
            return;
        }
        if receiver.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}
