use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vantage_common::{
    Cardinality, DataSource, DataSourceId, InvocationError, Operation, Parameter, Schema, Service, TypedInstance,
};

/// What an invoker hands back for one call. Values are typed by the operation's
/// return type; lineage is stamped by the engine afterwards.
pub struct OperationResponse {
    pub address: String,
    pub method: String,
    pub payload: Option<serde_json::Value>,
    pub values: BoxStream<'static, TypedInstance>,
}

#[async_trait]
pub trait OperationInvoker: Send + Sync {
    fn can_support(&self, service: &Service, operation: &Operation) -> bool;

    async fn invoke(
        &self,
        service: &Service,
        operation: &Operation,
        parameters: Vec<(Parameter, TypedInstance)>,
        query_id: &str,
    ) -> Result<OperationResponse, InvocationError>;
}

/// Receives one report per completed remote call.
pub trait QueryEventDispatcher: Send + Sync {
    fn report_remote_operation_invoked(&self, result: &DataSource, query_id: &str);
}

pub struct NoopEventDispatcher;

impl QueryEventDispatcher for NoopEventDispatcher {
    fn report_remote_operation_invoked(&self, _result: &DataSource, _query_id: &str) {}
}

#[derive(Clone, Default)]
pub struct InvokerRegistry {
    invokers: Vec<Arc<dyn OperationInvoker>>,
}

impl InvokerRegistry {
    pub fn register(&mut self, invoker: Arc<dyn OperationInvoker>) {
        self.invokers.push(invoker);
    }

    /// First registered invoker that supports the operation.
    pub fn select(&self, service: &Service, operation: &Operation) -> Option<Arc<dyn OperationInvoker>> {
        self.invokers.iter().find(|i| i.can_support(service, operation)).cloned()
    }

    pub fn len(&self) -> usize {
        self.invokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invokers.is_empty()
    }
}

type Handler = Arc<dyn Fn(&[serde_json::Value]) -> Result<serde_json::Value, InvocationError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub operation: String,
    pub parameters: Vec<serde_json::Value>,
}

/// Canned-response invoker. Supports exactly the operations it has a handler for
/// and records every call it receives.
pub struct StubInvoker {
    schema: Arc<Schema>,
    handlers: DashMap<String, Handler>,
    calls: Mutex<Vec<RecordedCall>>,
    latency: Option<Duration>,
}

impl StubInvoker {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self { schema, handlers: DashMap::new(), calls: Mutex::new(Vec::new()), latency: None }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// `operation` is `Service::op`.
    pub fn respond(&self, operation: &str, response: serde_json::Value) {
        self.respond_with(operation, move |_| Ok(response.clone()));
    }

    pub fn respond_with<F>(&self, operation: &str, handler: F)
    where
        F: Fn(&[serde_json::Value]) -> Result<serde_json::Value, InvocationError> + Send + Sync + 'static,
    {
        self.handlers.insert(operation.to_string(), Arc::new(handler));
    }

    pub fn fail(&self, operation: &str, error: InvocationError) {
        self.respond_with(operation, move |_| Err(error.clone()));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn calls_to(&self, operation: &str) -> Vec<Vec<serde_json::Value>> {
        self.calls().into_iter().filter(|c| c.operation == operation).map(|c| c.parameters).collect()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls_to(operation).len()
    }
}

#[async_trait]
impl OperationInvoker for StubInvoker {
    fn can_support(&self, _service: &Service, operation: &Operation) -> bool {
        self.handlers.contains_key(operation.qualified_name().as_str())
    }

    async fn invoke(
        &self,
        _service: &Service,
        operation: &Operation,
        parameters: Vec<(Parameter, TypedInstance)>,
        _query_id: &str,
    ) -> Result<OperationResponse, InvocationError> {
        let name = operation.qualified_name().to_string();
        let arguments: Vec<serde_json::Value> = parameters.iter().map(|(_, v)| v.to_json()).collect();
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedCall { operation: name.clone(), parameters: arguments.clone() });

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let handler = self
            .handlers
            .get(&name)
            .map(|h| h.value().clone())
            .ok_or_else(|| InvocationError::with_status(404, format!("no stub registered for {}", name)))?;
        let payload = handler(&arguments)?;

        let return_type = &operation.return_type;
        let values: Vec<TypedInstance> = if return_type.cardinality == Cardinality::Stream {
            let items = payload.as_array().cloned().unwrap_or_default();
            items
                .iter()
                .map(|item| TypedInstance::from_json(&self.schema, &return_type.member(), item, DataSourceId::PROVIDED))
                .collect::<Result<_, _>>()
                .map_err(|e| InvocationError::new(e.to_string()))?
        } else {
            vec![TypedInstance::from_json(&self.schema, return_type, &payload, DataSourceId::PROVIDED)
                .map_err(|e| InvocationError::new(e.to_string()))?]
        };

        Ok(OperationResponse {
            address: format!("stub://{}", operation.service),
            method: operation.name.clone(),
            payload: Some(payload),
            values: stream::iter(values).boxed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vantage_common::{Attribute, PrimitiveKind, Type, TypeRef};

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(
            vec![
                Type::scalar("FilmId", PrimitiveKind::Int),
                Type::model("Film", vec![Attribute::new("id", TypeRef::one("FilmId"))]),
            ],
            vec![Service::new(
                "FilmService",
                vec![Operation::new("getFilm", vec![Parameter::new("id", TypeRef::one("FilmId"))], TypeRef::one("Film"))],
            )],
        ))
    }

    #[tokio::test]
    async fn test_stub_records_calls_and_types_responses() {
        let schema = schema();
        let stub = StubInvoker::new(schema.clone());
        stub.respond_with("FilmService::getFilm", |args| Ok(json!({ "id": args[0] })));

        let (service, operation) = schema.operation(&"FilmService::getFilm".into()).expect("op");
        assert!(stub.can_support(service, operation));

        let param = operation.parameters[0].clone();
        let response = stub
            .invoke(service, operation, vec![(param, TypedInstance::scalar("FilmId", 5, DataSourceId::PROVIDED))], "q1")
            .await
            .expect("response");
        let values: Vec<_> = response.values.collect().await;
        assert_eq!(values[0].to_json(), json!({ "id": 5 }));
        assert_eq!(stub.calls_to("FilmService::getFilm"), vec![vec![json!(5)]]);
    }

    #[test]
    fn test_registry_picks_first_supporting_invoker() {
        let schema = schema();
        let (service, operation) = schema.operation(&"FilmService::getFilm".into()).expect("op");
        let unsupported = Arc::new(StubInvoker::new(schema.clone()));
        let supported = Arc::new(StubInvoker::new(schema.clone()));
        supported.respond("FilmService::getFilm", json!({ "id": 1 }));

        let mut registry = InvokerRegistry::default();
        registry.register(unsupported);
        registry.register(supported.clone());
        let selected = registry.select(service, operation).expect("invoker");
        assert!(selected.can_support(service, operation));
    }
}
