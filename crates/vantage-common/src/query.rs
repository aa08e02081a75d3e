// Compiled query model. Parsing TaxiQL text is the query compiler's job; the
// engine only consumes this tree.

use crate::expression::Expr;
use crate::schema::{OperationKind, PropertyConstraint, QualifiedName, TypeRef};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Directive {
    Find,
    Stream,
    /// Transform each element of a given collection.
    Map,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GivenValue {
    Literal(serde_json::Value),
    /// A named argument supplied at execution time.
    Argument(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GivenClause {
    pub name: String,
    pub type_ref: TypeRef,
    pub value: GivenValue,
}

impl GivenClause {
    pub fn literal(name: &str, type_ref: TypeRef, value: serde_json::Value) -> Self {
        Self { name: name.to_string(), type_ref, value: GivenValue::Literal(value) }
    }

    pub fn argument(name: &str, type_ref: TypeRef) -> Self {
        Self { name: name.to_string(), type_ref, value: GivenValue::Argument(name.to_string()) }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub type_ref: TypeRef,
    #[serde(default)]
    pub constraints: Vec<PropertyConstraint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldSource {
    /// Copy from scope or discover by type.
    Discover,
    Expression(Expr),
    /// `field: Source[] as { ... }[]` - projects each element of `source` with it as `this`.
    Projection { source: TypeRef, scope: Option<String>, shape: Box<Shape> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub type_ref: TypeRef,
    pub source: FieldSource,
}

impl FieldSpec {
    pub fn discover(name: &str, type_ref: TypeRef) -> Self {
        Self { name: name.to_string(), type_ref, source: FieldSource::Discover }
    }

    pub fn expression(name: &str, type_ref: TypeRef, expr: Expr) -> Self {
        Self { name: name.to_string(), type_ref, source: FieldSource::Expression(expr) }
    }

    pub fn nested(name: &str, type_ref: TypeRef, source: TypeRef, shape: Shape) -> Self {
        Self { name: name.to_string(), type_ref, source: FieldSource::Projection { source, scope: None, shape: Box::new(shape) } }
    }
}

/// An anonymous projection type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    pub fields: Vec<FieldSpec>,
}

impl Shape {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProjectionTarget {
    Type(QualifiedName),
    Shape(Shape),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub target: ProjectionTarget,
    /// Source elements are projected one by one (`as X[]`).
    pub collection: bool,
    /// Scope name bound to each source element in addition to `this`.
    #[serde(default)]
    pub scope: Option<String>,
}

impl Projection {
    pub fn shape(fields: Vec<FieldSpec>) -> Self {
        Self { target: ProjectionTarget::Shape(Shape::new(fields)), collection: false, scope: None }
    }

    pub fn to_type(name: &str) -> Self {
        Self { target: ProjectionTarget::Type(name.into()), collection: false, scope: None }
    }

    pub fn collection(mut self) -> Self {
        self.collection = true;
        self
    }

    pub fn named_scope(mut self, scope: &str) -> Self {
        self.scope = Some(scope.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationReference {
    pub service: QualifiedName,
    pub operation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default)]
    pub given: Vec<GivenClause>,
    pub directive: Directive,
    pub target: TargetSpec,
    #[serde(default)]
    pub projection: Option<Projection>,
    /// `call Service::op` applied to each result element.
    #[serde(default)]
    pub call: Option<OperationReference>,
}

impl Query {
    pub fn find(type_ref: TypeRef) -> Self {
        Self::with_directive(Directive::Find, type_ref)
    }

    pub fn stream(type_ref: TypeRef) -> Self {
        Self::with_directive(Directive::Stream, type_ref)
    }

    pub fn map(type_ref: TypeRef) -> Self {
        Self::with_directive(Directive::Map, type_ref)
    }

    fn with_directive(directive: Directive, type_ref: TypeRef) -> Self {
        Self {
            given: Vec::new(),
            directive,
            target: TargetSpec { type_ref, constraints: Vec::new() },
            projection: None,
            call: None,
        }
    }

    pub fn given(mut self, clause: GivenClause) -> Self {
        self.given.push(clause);
        self
    }

    pub fn constrained(mut self, constraint: PropertyConstraint) -> Self {
        self.target.constraints.push(constraint);
        self
    }

    pub fn project(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn then_call(mut self, service: &str, operation: &str) -> Self {
        self.call = Some(OperationReference { service: service.into(), operation: operation.to_string() });
        self
    }

    /// Argument names the caller must supply.
    pub fn required_arguments(&self) -> impl Iterator<Item = &str> {
        self.given.iter().filter_map(|g| match &g.value {
            GivenValue::Argument(name) => Some(name.as_str()),
            GivenValue::Literal(_) => None,
        })
    }

    /// Operation kinds discovery may use for this directive. Writes are only ever
    /// invoked explicitly through `call`.
    pub fn allows(&self, kind: OperationKind) -> bool {
        match kind {
            OperationKind::Write => false,
            OperationKind::Stream => self.directive == Directive::Stream,
            _ => true,
        }
    }
}
