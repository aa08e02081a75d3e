// Projection: builds the requested output shape from each result element.
//
// A field carrying an expression or a nested shape is always computed, even
// when a value of its type is already in scope. Other fields copy an in-scope
// value of the exact type, and only then discover.
// Each element gets its own fact bag scoped to `this`, so discoveries made for
// one element never leak into another.

pub mod batch;
pub mod expression;
pub mod functions;

use crate::context::{fit_cardinality, DiscoveryFrame, DiscoveryTarget, QueryContext};
use crate::facts::{FactBag, FactDiscoveryStrategy, TypeMatching};
use async_recursion::async_recursion;
use expression::{EvalError, ExpressionEvaluator};
use std::collections::BTreeMap;
use std::sync::Arc;
use vantage_common::{
    Attribute, DataSource, DataSourceId, Expr, FieldSource, FieldSpec, Projection, ProjectionTarget, QualifiedName,
    QueryError, Shape, TypeRef, TypedInstance,
};

/// Type name carried by anonymous projection shapes.
pub const ANONYMOUS_TYPE: &str = "lang.Anonymous";

pub struct ProjectionBuilder {
    ctx: Arc<QueryContext>,
}

impl ProjectionBuilder {
    pub fn new(ctx: Arc<QueryContext>) -> Self {
        Self { ctx }
    }

    pub async fn project(&self, element: TypedInstance, projection: &Projection) -> Result<TypedInstance, QueryError> {
        self.ctx.check_cancelled()?;
        let named = projection.scope.iter().map(|s| (s.clone(), element.clone())).collect();
        let bag = Arc::new(FactBag::scoped(self.ctx.facts.clone(), Some(element), named));
        match &projection.target {
            ProjectionTarget::Shape(shape) => self.build_shape(shape, &bag, 0).await,
            ProjectionTarget::Type(name) => self.build_type(name, &bag, 0).await,
        }
    }

    #[async_recursion]
    async fn build_shape(&self, shape: &Shape, bag: &Arc<FactBag>, depth: usize) -> Result<TypedInstance, QueryError> {
        let mut fields = BTreeMap::new();
        for field in &shape.fields {
            let value = self.resolve_field(field, bag, false, depth).await?;
            fields.insert(field.name.clone(), value);
        }
        Ok(TypedInstance::object(ANONYMOUS_TYPE, fields, DataSourceId::MIXED))
    }

    #[async_recursion]
    async fn build_type(&self, type_name: &QualifiedName, bag: &Arc<FactBag>, depth: usize) -> Result<TypedInstance, QueryError> {
        let schema = self.ctx.schema.clone();
        let ty = schema.require_type(type_name)?;
        if !ty.is_model() {
            let field = FieldSpec::discover("value", TypeRef::one(type_name.clone()));
            return self.resolve_field(&field, bag, ty.closed, depth).await;
        }
        let mut fields = BTreeMap::new();
        for attribute in &ty.attributes {
            let spec = field_for(attribute);
            let value = self.resolve_field(&spec, bag, ty.closed, depth).await?;
            fields.insert(attribute.name.clone(), value);
        }
        Ok(TypedInstance::object(type_name.clone(), fields, DataSourceId::MIXED))
    }

    /// `closed` marks fields of a closed model: they are copied when present and
    /// otherwise left null without any discovery.
    #[async_recursion]
    async fn resolve_field(
        &self,
        field: &FieldSpec,
        bag: &Arc<FactBag>,
        closed: bool,
        depth: usize,
    ) -> Result<TypedInstance, QueryError> {
        match &field.source {
            FieldSource::Expression(expr) => return self.evaluate(expr, &field.type_ref, bag).await,
            FieldSource::Projection { source, scope, shape } => {
                return self.project_nested(field, source, scope.as_deref(), shape, bag, depth).await;
            }
            FieldSource::Discover => {}
        }

        if let Some(value) = self.copy_in_scope(&field.type_ref, bag) {
            return Ok(value);
        }
        if closed {
            tracing::debug!("{} left null: closed models are not discovered", field.name);
            let message = format!("{} is an attribute of a closed model", field.type_ref);
            return Ok(self.ctx.failed_search(&field.type_ref, message, &DiscoveryFrame::root()));
        }

        let frame = DiscoveryFrame::root();
        let target = DiscoveryTarget::of(field.type_ref.clone());
        if let Some(value) = self.ctx.discover(&target, bag, &frame).await? {
            if let Some(value) = fit_cardinality(value, &field.type_ref) {
                return Ok(value);
            }
        }

        let schema = self.ctx.schema.clone();
        let buildable = schema
            .type_named(&field.type_ref.name)
            .map_or(false, |t| t.is_model() && !t.closed && !field.type_ref.is_collection());
        if buildable && depth < self.ctx.config.projection.max_build_depth {
            let built = self.build_type(&field.type_ref.name, bag, depth + 1).await?;
            if built.fields().map_or(false, |f| f.values().any(|v| !v.is_null())) {
                return Ok(built);
            }
        }

        tracing::debug!("No value found for {} ({})", field.name, field.type_ref);
        Ok(self.ctx.failed_search(&field.type_ref, format!("no path to {}", field.type_ref), &frame))
    }

    fn copy_in_scope(&self, type_ref: &TypeRef, bag: &FactBag) -> Option<TypedInstance> {
        let strategy = if type_ref.is_collection() {
            FactDiscoveryStrategy::AnyDepthAllowMany
        } else {
            FactDiscoveryStrategy::AnyDepthExpectOneDistinct
        };
        let value = bag.find(&self.ctx.schema, type_ref, TypeMatching::Exact, strategy)?;
        if value.is_null() || (value.is_collection() && value.items().is_empty()) {
            return None;
        }
        Some(value)
    }

    async fn evaluate(&self, expr: &Expr, type_ref: &TypeRef, bag: &Arc<FactBag>) -> Result<TypedInstance, QueryError> {
        let evaluator = ExpressionEvaluator::new(self.ctx.clone());
        let mut inputs = Vec::new();
        match evaluator.evaluate(expr, bag, &mut inputs).await {
            Ok(value) => {
                let source =
                    self.ctx.lineage.record(DataSource::EvaluatedExpression { expression: expr.to_string(), inputs });
                Ok(TypedInstance { type_ref: type_ref.clone(), value: value.value, source })
            }
            Err(EvalError::Failed(message)) => {
                tracing::debug!("Evaluating {} failed: {}", expr, message);
                let source = self.ctx.lineage.record(DataSource::FailedEvaluatedExpression {
                    expression: expr.to_string(),
                    inputs,
                    error: message,
                });
                Ok(TypedInstance::null(type_ref.clone(), source))
            }
            Err(EvalError::Query(error)) => Err(error),
        }
    }

    async fn project_nested(
        &self,
        field: &FieldSpec,
        source: &TypeRef,
        scope: Option<&str>,
        shape: &Shape,
        bag: &Arc<FactBag>,
        depth: usize,
    ) -> Result<TypedInstance, QueryError> {
        let frame = DiscoveryFrame::root();
        let found = match self.copy_in_scope(source, bag) {
            Some(value) => Some(value),
            None => self.ctx.discover(&DiscoveryTarget::of(source.clone()), bag, &frame).await?,
        };
        let Some(found) = found else {
            return Ok(self.ctx.failed_search(&field.type_ref, format!("no path to {}", source), &frame));
        };

        let items = if found.is_collection() { found.items().to_vec() } else { vec![found] };
        let mut projected = Vec::with_capacity(items.len());
        for item in items {
            let named = scope.map(|s| vec![(s.to_string(), item.clone())]).unwrap_or_default();
            let child = Arc::new(FactBag::scoped(bag.clone(), Some(item), named));
            projected.push(self.build_shape(shape, &child, depth).await?);
        }

        if field.type_ref.is_collection() {
            return Ok(TypedInstance::collection(ANONYMOUS_TYPE, projected, DataSourceId::MIXED));
        }
        Ok(projected
            .into_iter()
            .next()
            .unwrap_or_else(|| TypedInstance::null(field.type_ref.clone(), DataSourceId::MIXED)))
    }
}

fn field_for(attribute: &Attribute) -> FieldSpec {
    match &attribute.expression {
        Some(expr) => FieldSpec::expression(&attribute.name, attribute.type_ref.clone(), expr.clone()),
        None => FieldSpec::discover(&attribute.name, attribute.type_ref.clone()),
    }
}
