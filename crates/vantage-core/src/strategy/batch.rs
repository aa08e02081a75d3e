use super::{QueryStrategy, StrategyOutcome};
use crate::context::{CallOutcome, DiscoveryFrame, DiscoveryTarget, QueryContext};
use crate::facts::FactBag;
use crate::projection::batch::TablePlan;
use async_trait::async_trait;
use std::sync::Arc;
use vantage_common::{OperationKind, QueryError, TypeRef, TypedInstance};

/// Answers from table operations (`op(K[]) -> R[]`): pre-batched rows when the
/// key was prefetched, otherwise a single-key bulk call.
pub struct TableLookupStrategy;

#[async_trait]
impl QueryStrategy for TableLookupStrategy {
    fn name(&self) -> &'static str {
        "table"
    }

    async fn try_resolve(
        &self,
        ctx: &Arc<QueryContext>,
        target: &DiscoveryTarget,
        bag: &Arc<FactBag>,
        frame: &DiscoveryFrame,
    ) -> Result<StrategyOutcome, QueryError> {
        if target.type_ref.is_collection() || !target.constraints.is_empty() {
            return Ok(StrategyOutcome::NotApplicable);
        }
        let schema = ctx.schema.clone();

        for (service, operation) in schema.operations().filter(|(_, op)| op.kind == OperationKind::Table) {
            if frame.excluded_operations.contains(&operation.qualified_name()) {
                continue;
            }
            let Some(plan) = TablePlan::for_target(&schema, operation, &target.type_ref.name) else {
                continue;
            };
            let key_target = DiscoveryTarget::of(TypeRef::one(plan.key_type.clone()));
            let Some(key) = ctx.find_fact(bag, &key_target) else {
                continue;
            };
            let Some(key_value) = key.as_scalar().cloned() else {
                continue;
            };

            match ctx.prefetch.lookup(&plan.operation, &key_value) {
                Some(Some(row)) => {
                    ctx.stats.record_cache_hit();
                    if let Some(value) = plan.extract(&row) {
                        tracing::debug!("Pre-batched {} answered {} for key {}", plan.operation, target.type_ref, key_value);
                        return Ok(StrategyOutcome::single(value));
                    }
                }
                Some(None) => {
                    tracing::debug!("{} omitted key {}, falling back to single lookup", plan.operation, key_value);
                    ctx.stats.record_batch_fallback();
                }
                None => {
                    let parameter = operation.parameters[0].clone();
                    let keys = TypedInstance::collection(key.type_name().clone(), vec![key.clone()], key.source);
                    match ctx.invoke(service, operation, vec![(parameter, keys)]).await? {
                        CallOutcome::Success { value, .. } => {
                            let rows = plan.index(&schema, &value);
                            if let Some(found) = rows.get(&key_value).and_then(|row| plan.extract(row)) {
                                return Ok(StrategyOutcome::single(found));
                            }
                        }
                        CallOutcome::Failed { error, source } => frame.record_failure(source, error),
                    }
                }
            }
        }
        Ok(StrategyOutcome::NotApplicable)
    }
}
