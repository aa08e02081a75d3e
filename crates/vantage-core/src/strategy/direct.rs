use super::{QueryStrategy, StrategyOutcome};
use crate::constraints::ConstraintEvaluator;
use crate::context::{CallOutcome, DiscoveryFrame, DiscoveryTarget, QueryContext, StreamOutcome};
use crate::facts::FactBag;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use vantage_common::{Cardinality, Operation, QueryError, Schema, TypeRef};

/// Calls an operation that returns the target outright, with every input
/// already at hand: facts, contract bindings, or nulls for optional inputs.
pub struct DirectOperationStrategy;

#[async_trait]
impl QueryStrategy for DirectOperationStrategy {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn try_resolve(
        &self,
        ctx: &Arc<QueryContext>,
        target: &DiscoveryTarget,
        bag: &Arc<FactBag>,
        frame: &DiscoveryFrame,
    ) -> Result<StrategyOutcome, QueryError> {
        let schema = ctx.schema.clone();
        let evaluator = ConstraintEvaluator::new(&schema);
        if answered_by_prefetch(ctx, target, bag) {
            tracing::debug!("{} is served by a pre-batched table, skipping direct calls", target.type_ref);
            return Ok(StrategyOutcome::NotApplicable);
        }

        for (service, operation) in schema.operations() {
            let name = operation.qualified_name();
            if !ctx.allows(operation)
                || frame.excluded_operations.contains(&name)
                || ctx.prefetch.is_prefetched(&name)
                || !returns_target(&schema, operation, &target.type_ref)
            {
                continue;
            }
            let bindings = if target.constraints.is_empty() {
                HashMap::new()
            } else {
                match evaluator.bind_contract(operation, &target.constraints) {
                    Some(bindings) => bindings,
                    None => continue,
                }
            };

            let mut parameters = Vec::with_capacity(operation.parameters.len());
            for parameter in &operation.parameters {
                match ctx.resolve_parameter(parameter, bag, frame, &bindings, false).await? {
                    Some(value) => parameters.push((parameter.clone(), value)),
                    None => break,
                }
            }
            if parameters.len() != operation.parameters.len() {
                continue;
            }

            if operation.return_type.cardinality == Cardinality::Stream {
                match ctx.invoke_stream(service, operation, parameters).await? {
                    StreamOutcome::Open(values) => {
                        let constraints = target.constraints.clone();
                        let filter_schema = schema.clone();
                        let values = values
                            .filter_map(move |value| {
                                let kept = ConstraintEvaluator::new(&filter_schema).filter(value, &constraints);
                                async move { kept }
                            })
                            .boxed();
                        return Ok(StrategyOutcome::Resolved(values));
                    }
                    StreamOutcome::Failed { error, source } => {
                        frame.record_failure(source, error);
                        continue;
                    }
                }
            }

            match ctx.invoke(service, operation, parameters).await? {
                CallOutcome::Success { value, .. } => {
                    if let Some(value) = evaluator.filter(value, &target.constraints).filter(|v| !v.is_null()) {
                        return Ok(StrategyOutcome::single(value));
                    }
                }
                CallOutcome::Failed { error, source } => frame.record_failure(source, error),
            }
        }
        Ok(StrategyOutcome::NotApplicable)
    }
}

/// A target whose key the prefetched table already holds an entry for is left
/// to the table strategy, hit or miss.
fn answered_by_prefetch(ctx: &QueryContext, target: &DiscoveryTarget, bag: &FactBag) -> bool {
    if !target.constraints.is_empty() || target.type_ref.is_collection() {
        return false;
    }
    ctx.prefetch.covers(&target.type_ref.name, |key_type| {
        ctx.find_fact(bag, &DiscoveryTarget::of(TypeRef::one(key_type.clone())))
            .and_then(|key| key.as_scalar().cloned())
    })
}

fn returns_target(schema: &Schema, operation: &Operation, target: &TypeRef) -> bool {
    let returned = &operation.return_type;
    if !schema.is_assignable(&returned.name, &target.name) {
        return false;
    }
    matches!(
        (returned.cardinality, target.cardinality),
        (Cardinality::One, Cardinality::One)
            | (Cardinality::Many, Cardinality::Many)
            | (Cardinality::Stream, Cardinality::Stream)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use vantage_common::{Attribute, Parameter, PrimitiveKind, Service, Type};

    #[test]
    fn test_return_type_must_match_cardinality() {
        let schema = Schema::new(
            vec![
                Type::scalar("FilmId", PrimitiveKind::Int),
                Type::model("Film", vec![Attribute::new("id", TypeRef::one("FilmId"))]),
                Type::model("Documentary", vec![]).inheriting("Film"),
            ],
            vec![Service::new("FilmService", vec![])],
        );
        let single = Operation::new("getFilm", vec![Parameter::new("id", TypeRef::one("FilmId"))], TypeRef::one("Documentary"));
        let all = Operation::new("allFilms", vec![], TypeRef::many("Film"));

        assert!(returns_target(&schema, &single, &TypeRef::one("Film")));
        assert!(!returns_target(&schema, &single, &TypeRef::many("Film")));
        assert!(returns_target(&schema, &all, &TypeRef::many("Film")));
        assert!(!returns_target(&schema, &all, &TypeRef::one("Documentary")));
    }
}
