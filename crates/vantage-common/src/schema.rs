// Schema model - the immutable view of declared types, services and operations.
//
// The schema compiler is an external collaborator; this module only holds what it
// produces and answers structural questions (assignability, primitive bases,
// identity attributes) that discovery needs.

use crate::error::QueryError;
use crate::expression::Expr;
use crate::instance::Scalar;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedName(String);

impl QualifiedName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last segment of a dotted name, e.g. `films.FilmId` -> `FilmId`.
    pub fn short_name(&self) -> &str {
        self.0.rsplit(['.', ':']).next().unwrap_or(&self.0)
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for QualifiedName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for QualifiedName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cardinality {
    One,
    Many,
    Stream,
}

/// A reference to a declared type together with its cardinality (`T`, `T[]`, `Stream<T>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeRef {
    pub name: QualifiedName,
    pub cardinality: Cardinality,
}

impl TypeRef {
    pub fn one(name: impl Into<QualifiedName>) -> Self {
        Self { name: name.into(), cardinality: Cardinality::One }
    }

    pub fn many(name: impl Into<QualifiedName>) -> Self {
        Self { name: name.into(), cardinality: Cardinality::Many }
    }

    pub fn stream(name: impl Into<QualifiedName>) -> Self {
        Self { name: name.into(), cardinality: Cardinality::Stream }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.cardinality, Cardinality::Many | Cardinality::Stream)
    }

    /// The element type of a collection, or the type itself.
    pub fn member(&self) -> TypeRef {
        TypeRef::one(self.name.clone())
    }

    pub fn as_collection(&self) -> TypeRef {
        TypeRef::many(self.name.clone())
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cardinality {
            Cardinality::One => write!(f, "{}", self.name),
            Cardinality::Many => write!(f, "{}[]", self.name),
            Cardinality::Stream => write!(f, "Stream<{}>", self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveKind {
    String,
    Int,
    Decimal,
    Boolean,
    Any,
}

impl PrimitiveKind {
    pub const ALL: [PrimitiveKind; 5] = [
        PrimitiveKind::String,
        PrimitiveKind::Int,
        PrimitiveKind::Decimal,
        PrimitiveKind::Boolean,
        PrimitiveKind::Any,
    ];

    pub fn qualified_name(&self) -> QualifiedName {
        let name = match self {
            PrimitiveKind::String => "lang.String",
            PrimitiveKind::Int => "lang.Int",
            PrimitiveKind::Decimal => "lang.Decimal",
            PrimitiveKind::Boolean => "lang.Boolean",
            PrimitiveKind::Any => "lang.Any",
        };
        QualifiedName::from(name)
    }
}

/// One synonym link from an enum value to a value of another enum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnumSynonym {
    pub enum_type: QualifiedName,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumValue {
    pub name: String,
    #[serde(default)]
    pub synonyms: Vec<EnumSynonym>,
}

impl EnumValue {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), synonyms: Vec::new() }
    }

    pub fn synonym_of(mut self, enum_type: &str, value: &str) -> Self {
        self.synonyms.push(EnumSynonym { enum_type: enum_type.into(), value: value.to_string() });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeKind {
    Primitive(PrimitiveKind),
    /// A semantic scalar (e.g. `FilmId inherits Int`).
    Scalar,
    Model,
    Enum(Vec<EnumValue>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub type_ref: TypeRef,
    /// `@Id` - sufficient to key batched lookups for the owning type.
    #[serde(default)]
    pub id: bool,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub format: Option<String>,
    /// Calculated attribute (`by (expr)`), evaluated when the owning model is projected.
    #[serde(default)]
    pub expression: Option<Expr>,
}

fn default_true() -> bool {
    true
}

impl Attribute {
    pub fn new(name: &str, type_ref: TypeRef) -> Self {
        Self { name: name.to_string(), type_ref, id: false, nullable: true, format: None, expression: None }
    }

    pub fn identity(mut self) -> Self {
        self.id = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_format(mut self, format: &str) -> Self {
        self.format = Some(format.to_string());
        self
    }

    pub fn calculated(mut self, expression: Expr) -> Self {
        self.expression = Some(expression);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Type {
    pub name: QualifiedName,
    pub kind: TypeKind,
    #[serde(default)]
    pub inherits: Vec<QualifiedName>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    /// Closed models are never built or discovered; missing attributes resolve to typed nulls.
    #[serde(default)]
    pub closed: bool,
}

impl Type {
    pub fn primitive(kind: PrimitiveKind) -> Self {
        Self { name: kind.qualified_name(), kind: TypeKind::Primitive(kind), inherits: Vec::new(), attributes: Vec::new(), closed: false }
    }

    pub fn scalar(name: &str, base: PrimitiveKind) -> Self {
        Self { name: name.into(), kind: TypeKind::Scalar, inherits: vec![base.qualified_name()], attributes: Vec::new(), closed: false }
    }

    pub fn model(name: &str, attributes: Vec<Attribute>) -> Self {
        Self { name: name.into(), kind: TypeKind::Model, inherits: Vec::new(), attributes, closed: false }
    }

    pub fn enumeration(name: &str, values: Vec<EnumValue>) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Enum(values),
            inherits: vec![PrimitiveKind::String.qualified_name()],
            attributes: Vec::new(),
            closed: false,
        }
    }

    pub fn inheriting(mut self, base: &str) -> Self {
        self.inherits.push(base.into());
        self
    }

    pub fn closed(mut self) -> Self {
        self.closed = true;
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn id_attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter().filter(|a| a.id)
    }

    pub fn is_model(&self) -> bool {
        matches!(self.kind, TypeKind::Model)
    }

    pub fn is_enum(&self) -> bool {
        matches!(self.kind, TypeKind::Enum(_))
    }

    pub fn is_primitive(&self) -> bool {
        matches!(self.kind, TypeKind::Primitive(_))
    }

    pub fn enum_values(&self) -> &[EnumValue] {
        match &self.kind {
            TypeKind::Enum(values) => values,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOperator {
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
}

impl ComparisonOperator {
    pub fn symbol(&self) -> &'static str {
        match self {
            ComparisonOperator::Equal => "==",
            ComparisonOperator::NotEqual => "!=",
            ComparisonOperator::GreaterThan => ">",
            ComparisonOperator::GreaterThanOrEqual => ">=",
            ComparisonOperator::LessThan => "<",
            ComparisonOperator::LessThanOrEqual => "<=",
        }
    }
}

/// The left-hand side of a constraint: an attribute by name, or an attribute identified by its type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyRef {
    Attribute(String),
    Type(QualifiedName),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstraintValue {
    Constant(Scalar),
    /// Relative to an operation parameter, e.g. `ReturnAttr >= paramX`.
    Parameter(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyConstraint {
    pub property: PropertyRef,
    pub operator: ComparisonOperator,
    pub value: ConstraintValue,
}

impl PropertyConstraint {
    pub fn new(property: PropertyRef, operator: ComparisonOperator, value: ConstraintValue) -> Self {
        Self { property, operator, value }
    }

    /// `Type(PropertyType == constant)`
    pub fn type_equals(type_name: &str, value: Scalar) -> Self {
        Self::new(PropertyRef::Type(type_name.into()), ComparisonOperator::Equal, ConstraintValue::Constant(value))
    }
}

impl fmt::Display for PropertyConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let property = match &self.property {
            PropertyRef::Attribute(name) => name.clone(),
            PropertyRef::Type(name) => name.to_string(),
        };
        let value = match &self.value {
            ConstraintValue::Constant(scalar) => scalar.to_string(),
            ConstraintValue::Parameter(name) => name.clone(),
        };
        write!(f, "{} {} {}", property, self.operator.symbol(), value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Read,
    Write,
    Query,
    /// Bulk lookup keyed by identity attributes.
    Table,
    Stream,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub type_ref: TypeRef,
    #[serde(default)]
    pub id: bool,
    #[serde(default)]
    pub nullable: bool,
}

impl Parameter {
    pub fn new(name: &str, type_ref: TypeRef) -> Self {
        Self { name: name.to_string(), type_ref, id: false, nullable: false }
    }

    pub fn identity(mut self) -> Self {
        self.id = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.nullable = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    /// Owning service; filled in by [`Schema::new`].
    #[serde(default = "unbound_service")]
    pub service: QualifiedName,
    pub parameters: Vec<Parameter>,
    pub return_type: TypeRef,
    pub kind: OperationKind,
    #[serde(default)]
    pub contract: Vec<PropertyConstraint>,
}

fn unbound_service() -> QualifiedName {
    QualifiedName::from("")
}

impl Operation {
    pub fn new(name: &str, parameters: Vec<Parameter>, return_type: TypeRef) -> Self {
        let kind = if return_type.cardinality == Cardinality::Stream { OperationKind::Stream } else { OperationKind::Read };
        Self { name: name.to_string(), service: unbound_service(), parameters, return_type, kind, contract: Vec::new() }
    }

    pub fn with_kind(mut self, kind: OperationKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_contract(mut self, constraint: PropertyConstraint) -> Self {
        self.contract.push(constraint);
        self
    }

    pub fn qualified_name(&self) -> QualifiedName {
        QualifiedName::new(format!("{}::{}", self.service, self.name))
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn is_write(&self) -> bool {
        self.kind == OperationKind::Write
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub name: QualifiedName,
    pub operations: Vec<Operation>,
    /// `@Datasource` services are invoked once per query and their results reused.
    #[serde(default)]
    pub datasource: bool,
    /// Services searches stop using once this datasource has been invoked.
    #[serde(default)]
    pub excludes: Vec<QualifiedName>,
}

impl Service {
    pub fn new(name: &str, operations: Vec<Operation>) -> Self {
        Self { name: name.into(), operations, datasource: false, excludes: Vec::new() }
    }

    pub fn as_datasource(mut self) -> Self {
        self.datasource = true;
        self
    }

    pub fn excluding(mut self, service: &str) -> Self {
        self.excludes.push(service.into());
        self
    }

    pub fn operation(&self, name: &str) -> Option<&Operation> {
        self.operations.iter().find(|o| o.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    types: BTreeMap<QualifiedName, Type>,
    services: Vec<Service>,
}

impl Schema {
    pub fn new(types: Vec<Type>, services: Vec<Service>) -> Self {
        let mut by_name: BTreeMap<QualifiedName, Type> = PrimitiveKind::ALL
            .iter()
            .map(|kind| (kind.qualified_name(), Type::primitive(*kind)))
            .collect();
        for ty in types {
            by_name.insert(ty.name.clone(), ty);
        }
        let services = services
            .into_iter()
            .map(|mut service| {
                for operation in service.operations.iter_mut() {
                    operation.service = service.name.clone();
                }
                service
            })
            .collect();
        Self { types: by_name, services }
    }

    pub fn types(&self) -> impl Iterator<Item = &Type> {
        self.types.values()
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn type_named(&self, name: &QualifiedName) -> Option<&Type> {
        self.types.get(name)
    }

    pub fn require_type(&self, name: &QualifiedName) -> Result<&Type, QueryError> {
        self.types.get(name).ok_or_else(|| QueryError::UnknownType { type_name: name.to_string() })
    }

    pub fn service(&self, name: &QualifiedName) -> Option<&Service> {
        self.services.iter().find(|s| &s.name == name)
    }

    pub fn operations(&self) -> impl Iterator<Item = (&Service, &Operation)> {
        self.services.iter().flat_map(|s| s.operations.iter().map(move |o| (s, o)))
    }

    pub fn operation(&self, qualified: &QualifiedName) -> Option<(&Service, &Operation)> {
        self.operations().find(|(_, o)| &o.qualified_name() == qualified)
    }

    /// The type itself followed by every ancestor, breadth first.
    pub fn ancestors(&self, name: &QualifiedName) -> Vec<QualifiedName> {
        let mut seen = HashSet::new();
        let mut ordered = Vec::new();
        let mut queue = VecDeque::from([name.clone()]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(ty) = self.types.get(&current) {
                queue.extend(ty.inherits.iter().cloned());
            }
            ordered.push(current);
        }
        ordered
    }

    /// True when a value of `from` satisfies a request for `to` (same type or `to` is an ancestor).
    pub fn is_assignable(&self, from: &QualifiedName, to: &QualifiedName) -> bool {
        from == to || self.ancestors(from).iter().any(|a| a == to)
    }

    pub fn is_primitive(&self, name: &QualifiedName) -> bool {
        self.types.get(name).map_or(false, Type::is_primitive)
    }

    pub fn is_closed(&self, name: &QualifiedName) -> bool {
        self.types.get(name).map_or(false, |t| t.closed)
    }

    /// The primitive a type ultimately inherits from.
    pub fn primitive_kind(&self, name: &QualifiedName) -> Option<PrimitiveKind> {
        self.ancestors(name).iter().find_map(|ancestor| match self.types.get(ancestor).map(|t| &t.kind) {
            Some(TypeKind::Primitive(kind)) => Some(*kind),
            _ => None,
        })
    }

    /// SHA-256 over the canonical serialised schema; keys the schema graph cache.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn film_schema() -> Schema {
        Schema::new(
            vec![
                Type::scalar("FilmId", PrimitiveKind::Int),
                Type::scalar("ImdbId", PrimitiveKind::String).inheriting("FilmId"),
                Type::model("Film", vec![Attribute::new("id", TypeRef::one("FilmId")).identity()]),
            ],
            vec![Service::new(
                "FilmService",
                vec![Operation::new("getFilm", vec![Parameter::new("id", TypeRef::one("FilmId"))], TypeRef::one("Film"))],
            )],
        )
    }

    #[test]
    fn test_assignability_follows_inheritance() {
        let schema = film_schema();
        assert!(schema.is_assignable(&"ImdbId".into(), &"FilmId".into()));
        assert!(schema.is_assignable(&"FilmId".into(), &"lang.Int".into()));
        assert!(!schema.is_assignable(&"FilmId".into(), &"ImdbId".into()));
        assert_eq!(schema.primitive_kind(&"FilmId".into()), Some(PrimitiveKind::Int));
    }

    #[test]
    fn test_operations_are_bound_to_their_service() {
        let schema = film_schema();
        let (service, operation) = schema.operation(&"FilmService::getFilm".into()).expect("operation");
        assert_eq!(service.name.as_str(), "FilmService");
        assert_eq!(operation.qualified_name().as_str(), "FilmService::getFilm");
    }

    #[test]
    fn test_fingerprint_changes_with_schema() {
        let a = film_schema();
        let b = Schema::new(vec![Type::scalar("FilmId", PrimitiveKind::Int)], vec![]);
        assert_eq!(a.fingerprint(), film_schema().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
