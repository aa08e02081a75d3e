// Pre-batching: before projecting a collection, collect the distinct keys each
// table operation would be called with and fetch them in one bulk call.

use crate::context::{CallOutcome, QueryContext};
use crate::facts::{FactBag, FactDiscoveryStrategy, TypeMatching};
use dashmap::{DashMap, DashSet};
use std::collections::HashMap;
use std::sync::Arc;
use vantage_common::{
    Cardinality, DataSourceId, FieldSource, Operation, OperationKind, Projection, ProjectionTarget, QualifiedName,
    QueryError, Scalar, Schema, TypeRef, TypedInstance,
};

/// How a table operation `op(K[]) -> R[]` answers requests for one type: either
/// the row itself or one of its attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct TablePlan {
    pub operation: QualifiedName,
    pub key_type: QualifiedName,
    pub row_type: QualifiedName,
    pub attribute: Option<String>,
}

impl TablePlan {
    pub fn for_target(schema: &Schema, operation: &Operation, target: &QualifiedName) -> Option<Self> {
        if operation.kind != OperationKind::Table
            || operation.return_type.cardinality != Cardinality::Many
            || operation.parameters.len() != 1
        {
            return None;
        }
        let key = &operation.parameters[0].type_ref;
        if !key.is_collection() {
            return None;
        }
        let row = schema.type_named(&operation.return_type.name)?;
        let keyed = row.id_attributes().any(|a| keys_compatible(schema, &a.type_ref.name, &key.name));
        if !keyed {
            return None;
        }
        let attribute = if schema.is_assignable(&row.name, target) {
            None
        } else {
            let attribute = row
                .attributes
                .iter()
                .find(|a| a.type_ref.cardinality == Cardinality::One && schema.is_assignable(&a.type_ref.name, target))?;
            Some(attribute.name.clone())
        };
        Some(Self {
            operation: operation.qualified_name(),
            key_type: key.name.clone(),
            row_type: row.name.clone(),
            attribute,
        })
    }

    pub fn extract(&self, row: &TypedInstance) -> Option<TypedInstance> {
        match &self.attribute {
            None => Some(row.clone()),
            Some(name) => row.attribute(name).filter(|v| !v.is_null()).cloned(),
        }
    }

    /// Rows keyed by every identity attribute compatible with the key type.
    pub fn index(&self, schema: &Schema, response: &TypedInstance) -> HashMap<Scalar, TypedInstance> {
        let mut rows = HashMap::new();
        let Some(row_type) = schema.type_named(&self.row_type) else {
            return rows;
        };
        let id_names: Vec<&str> = row_type
            .id_attributes()
            .filter(|a| keys_compatible(schema, &a.type_ref.name, &self.key_type))
            .map(|a| a.name.as_str())
            .collect();
        let items = if response.is_collection() { response.items().to_vec() } else { vec![response.clone()] };
        for row in items {
            for name in &id_names {
                if let Some(key) = row.attribute(name).and_then(|v| v.as_scalar()) {
                    rows.insert(key.clone(), row.clone());
                }
            }
        }
        rows
    }
}

fn keys_compatible(schema: &Schema, a: &QualifiedName, b: &QualifiedName) -> bool {
    schema.is_assignable(a, b) || schema.is_assignable(b, a)
}

/// Bulk results for one query. A `None` row records that the key was requested
/// but the response did not contain it.
#[derive(Debug, Default)]
pub struct PrefetchTable {
    rows: DashMap<(QualifiedName, Scalar), Option<TypedInstance>>,
    operations: DashSet<QualifiedName>,
    plans: DashMap<QualifiedName, Vec<TablePlan>>,
}

impl PrefetchTable {
    pub fn lookup(&self, operation: &QualifiedName, key: &Scalar) -> Option<Option<TypedInstance>> {
        self.rows.get(&(operation.clone(), key.clone())).map(|r| r.value().clone())
    }

    pub fn insert(&self, operation: &QualifiedName, key: Scalar, row: Option<TypedInstance>) {
        self.rows.insert((operation.clone(), key), row);
    }

    pub fn mark(&self, operation: &QualifiedName) {
        self.operations.insert(operation.clone());
    }

    pub fn is_prefetched(&self, operation: &QualifiedName) -> bool {
        self.operations.contains(operation)
    }

    /// Records that `plan` answers `target` from prefetched rows.
    pub fn register(&self, target: &QualifiedName, plan: TablePlan) {
        let mut plans = self.plans.entry(target.clone()).or_default();
        if !plans.contains(&plan) {
            plans.push(plan);
        }
    }

    pub fn plans_for(&self, target: &QualifiedName) -> Vec<TablePlan> {
        self.plans.get(target).map(|p| p.value().clone()).unwrap_or_default()
    }

    /// True when a prefetched plan for `target` holds an entry (found or
    /// known missing) for `key`.
    pub fn covers(&self, target: &QualifiedName, key_of: impl Fn(&QualifiedName) -> Option<Scalar>) -> bool {
        self.plans_for(target)
            .iter()
            .any(|plan| key_of(&plan.key_type).map_or(false, |key| self.lookup(&plan.operation, &key).is_some()))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Types a projection will try to discover for every element.
pub fn discoverable_field_types(schema: &Schema, projection: &Projection) -> Vec<TypeRef> {
    let mut types: Vec<TypeRef> = match &projection.target {
        ProjectionTarget::Shape(shape) => shape
            .fields
            .iter()
            .filter(|f| matches!(f.source, FieldSource::Discover))
            .map(|f| f.type_ref.clone())
            .collect(),
        ProjectionTarget::Type(name) => schema
            .type_named(name)
            .map(|t| t.attributes.iter().filter(|a| a.expression.is_none()).map(|a| a.type_ref.clone()).collect())
            .unwrap_or_default(),
    };
    types.retain(|t| t.cardinality == Cardinality::One);
    types.dedup();
    types
}

/// Issues one bulk call per table operation that can serve a projected field,
/// keyed by the distinct keys found across `elements`.
pub async fn prefetch(ctx: &Arc<QueryContext>, elements: &[TypedInstance], projection: &Projection) -> Result<(), QueryError> {
    if !ctx.config.projection.batching_enabled || elements.len() < 2 {
        return Ok(());
    }
    let schema = ctx.schema.clone();
    for field_type in discoverable_field_types(&schema, projection) {
        for (service, operation) in schema.operations() {
            let Some(plan) = TablePlan::for_target(&schema, operation, &field_type.name) else {
                continue;
            };
            if ctx.prefetch.is_prefetched(&plan.operation) {
                ctx.prefetch.register(&field_type.name, plan);
                continue;
            }

            let key_ref = TypeRef::one(plan.key_type.clone());
            let mut keys: Vec<TypedInstance> = Vec::new();
            for element in elements {
                let bag = FactBag::new(vec![element.clone()]);
                if bag.find(&schema, &field_type, TypeMatching::Exact, FactDiscoveryStrategy::AnyDepthExpectOneDistinct).is_some() {
                    continue;
                }
                let Some(key) = bag.find(
                    &schema,
                    &key_ref,
                    TypeMatching::AllowInherited,
                    FactDiscoveryStrategy::AnyDepthExpectOneDistinct,
                ) else {
                    continue;
                };
                if key.as_scalar().is_some() && !keys.iter().any(|k| k.as_scalar() == key.as_scalar()) {
                    keys.push(key);
                }
            }
            if keys.is_empty() {
                continue;
            }

            let key_values: Vec<Scalar> = keys.iter().filter_map(|k| k.as_scalar().cloned()).collect();
            let parameter = operation.parameters[0].clone();
            let request = TypedInstance::collection(plan.key_type.clone(), keys, DataSourceId::MIXED);
            tracing::debug!("Pre-batching {} key(s) into {}", key_values.len(), plan.operation);
            ctx.stats.record_batch_call();

            match ctx.invoke(service, operation, vec![(parameter, request)]).await? {
                CallOutcome::Success { value, .. } => {
                    let rows = plan.index(&schema, &value);
                    for key in key_values {
                        let row = rows.get(&key).cloned();
                        ctx.prefetch.insert(&plan.operation, key, row);
                    }
                    ctx.prefetch.mark(&plan.operation);
                    ctx.prefetch.register(&field_type.name, plan);
                }
                CallOutcome::Failed { error, .. } => {
                    tracing::warn!("Bulk call {} failed, elements will resolve individually: {}", plan.operation, error);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use vantage_common::{Attribute, Parameter, PrimitiveKind, Service, Type};

    fn schema() -> Schema {
        Schema::new(
            vec![
                Type::scalar("FilmId", PrimitiveKind::Int),
                Type::scalar("ReviewText", PrimitiveKind::String),
                Type::model(
                    "Review",
                    vec![
                        Attribute::new("filmId", TypeRef::one("FilmId")).identity(),
                        Attribute::new("text", TypeRef::one("ReviewText")),
                    ],
                ),
            ],
            vec![Service::new(
                "ReviewService",
                vec![Operation::new(
                    "getReviews",
                    vec![Parameter::new("ids", TypeRef::many("FilmId"))],
                    TypeRef::many("Review"),
                )
                .with_kind(OperationKind::Table)],
            )],
        )
    }

    fn review(id: i64, text: &str) -> TypedInstance {
        let mut fields = BTreeMap::new();
        fields.insert("filmId".to_string(), TypedInstance::scalar("FilmId", id, DataSourceId::PROVIDED));
        fields.insert("text".to_string(), TypedInstance::scalar("ReviewText", text, DataSourceId::PROVIDED));
        TypedInstance::object("Review", fields, DataSourceId::PROVIDED)
    }

    #[test]
    fn test_plan_serves_row_attribute_and_indexes_by_identity() {
        let schema = schema();
        let (_, operation) = schema.operation(&"ReviewService::getReviews".into()).expect("op");
        let plan = TablePlan::for_target(&schema, operation, &"ReviewText".into()).expect("plan");
        assert_eq!(plan.attribute.as_deref(), Some("text"));

        let response = TypedInstance::collection("Review", vec![review(1, "good"), review(2, "bad")], DataSourceId::PROVIDED);
        let rows = plan.index(&schema, &response);
        let text = plan.extract(&rows[&Scalar::Int(2)]).expect("text");
        assert_eq!(text.as_scalar(), Some(&Scalar::Text("bad".into())));
        assert!(TablePlan::for_target(&schema, operation, &"FilmId".into()).is_some());
    }

    #[test]
    fn test_prefetch_table_distinguishes_missing_rows() {
        let table = PrefetchTable::default();
        let op: QualifiedName = "ReviewService::getReviews".into();
        table.insert(&op, Scalar::Int(1), Some(review(1, "good")));
        table.insert(&op, Scalar::Int(3), None);
        table.mark(&op);

        assert!(table.is_prefetched(&op));
        assert!(matches!(table.lookup(&op, &Scalar::Int(1)), Some(Some(_))));
        assert_eq!(table.lookup(&op, &Scalar::Int(3)), Some(None));
        assert_eq!(table.lookup(&op, &Scalar::Int(4)), None);
    }

    #[test]
    fn test_registered_plan_covers_prefetched_keys_only() {
        let schema = schema();
        let (_, operation) = schema.operation(&"ReviewService::getReviews".into()).expect("op");
        let plan = TablePlan::for_target(&schema, operation, &"Review".into()).expect("plan");
        let table = PrefetchTable::default();
        table.insert(&plan.operation, Scalar::Int(1), Some(review(1, "good")));
        table.insert(&plan.operation, Scalar::Int(2), None);
        table.register(&"Review".into(), plan.clone());
        table.register(&"Review".into(), plan);

        assert_eq!(table.plans_for(&"Review".into()).len(), 1);
        assert!(table.covers(&"Review".into(), |_| Some(Scalar::Int(1))));
        assert!(table.covers(&"Review".into(), |_| Some(Scalar::Int(2))));
        assert!(!table.covers(&"Review".into(), |_| Some(Scalar::Int(3))));
        assert!(!table.covers(&"Review".into(), |_| None));
        assert!(!table.covers(&"ReviewText".into(), |_| Some(Scalar::Int(1))));
    }
}
