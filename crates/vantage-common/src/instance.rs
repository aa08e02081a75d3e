// Typed values flowing through query execution.

use crate::error::QueryError;
use crate::lineage::DataSourceId;
use crate::schema::{Cardinality, PrimitiveKind, QualifiedName, Schema, TypeRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Decimal(f64),
    Text(String),
}

impl Scalar {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(i) => Some(*i as f64),
            Scalar::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Scalar::Bool(b) => serde_json::Value::Bool(*b),
            Scalar::Int(i) => serde_json::Value::from(*i),
            Scalar::Decimal(d) => serde_json::Value::from(*d),
            Scalar::Text(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Ordering across numeric kinds; `None` for incomparable pairs.
    pub fn compare(&self, other: &Scalar) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Scalar::Text(a), Scalar::Text(b)) => Some(a.cmp(b)),
            (Scalar::Bool(a), Scalar::Bool(b)) => Some(a.cmp(b)),
            (Scalar::Int(a), Scalar::Int(b)) => Some(a.cmp(b)),
            _ => self.as_f64()?.partial_cmp(&other.as_f64()?),
        }
    }
}

/// The integer a decimal holds exactly, if it holds one.
fn exact_int(d: f64) -> Option<i64> {
    const LIMIT: f64 = 9_223_372_036_854_775_808.0; // 2^63
    if d.fract() == 0.0 && d >= -LIMIT && d < LIMIT {
        Some(d as i64)
    } else {
        None
    }
}

/// Decimal bits with `-0.0` folded into `0.0`.
fn decimal_bits(d: f64) -> u64 {
    if d == 0.0 {
        0.0f64.to_bits()
    } else {
        d.to_bits()
    }
}

impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Scalar::Decimal(a), Scalar::Decimal(b)) => decimal_bits(*a) == decimal_bits(*b),
            (Scalar::Int(a), Scalar::Decimal(b)) | (Scalar::Decimal(b), Scalar::Int(a)) => exact_int(*b) == Some(*a),
            (Scalar::Int(a), Scalar::Int(b)) => a == b,
            (Scalar::Bool(a), Scalar::Bool(b)) => a == b,
            (Scalar::Text(a), Scalar::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Scalar {}

impl Hash for Scalar {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Scalar::Bool(b) => b.hash(state),
            // Integral decimals hash like the ints they equal.
            Scalar::Int(i) => i.hash(state),
            Scalar::Decimal(d) => match exact_int(*d) {
                Some(i) => i.hash(state),
                None => decimal_bits(*d).hash(state),
            },
            Scalar::Text(s) => s.hash(state),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Int(i) => write!(f, "{}", i),
            Scalar::Decimal(d) => write!(f, "{}", d),
            Scalar::Text(s) => write!(f, "\"{}\"", s),
        }
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Scalar::Int(v as i64)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Text(v.to_string())
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceValue {
    Scalar(Scalar),
    Object(BTreeMap<String, TypedInstance>),
    Collection(Vec<TypedInstance>),
    Null,
}

/// A value tagged with its declared type and the lineage entry that produced it.
///
/// Equality and hashing consider type and value only, never the source, so two
/// instances fetched along different paths compare equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypedInstance {
    pub type_ref: TypeRef,
    pub value: InstanceValue,
    pub source: DataSourceId,
}

impl PartialEq for TypedInstance {
    fn eq(&self, other: &Self) -> bool {
        self.type_ref == other.type_ref && self.value == other.value
    }
}

impl Eq for TypedInstance {}

impl Hash for TypedInstance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_ref.hash(state);
        self.value.hash(state);
    }
}

impl TypedInstance {
    pub fn scalar(type_name: impl Into<QualifiedName>, value: impl Into<Scalar>, source: DataSourceId) -> Self {
        Self { type_ref: TypeRef::one(type_name), value: InstanceValue::Scalar(value.into()), source }
    }

    pub fn object(type_name: impl Into<QualifiedName>, fields: BTreeMap<String, TypedInstance>, source: DataSourceId) -> Self {
        Self { type_ref: TypeRef::one(type_name), value: InstanceValue::Object(fields), source }
    }

    pub fn collection(member: impl Into<QualifiedName>, items: Vec<TypedInstance>, source: DataSourceId) -> Self {
        Self { type_ref: TypeRef::many(member), value: InstanceValue::Collection(items), source }
    }

    pub fn null(type_ref: TypeRef, source: DataSourceId) -> Self {
        Self { type_ref, value: InstanceValue::Null, source }
    }

    pub fn type_name(&self) -> &QualifiedName {
        &self.type_ref.name
    }

    pub fn is_null(&self) -> bool {
        matches!(self.value, InstanceValue::Null)
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.value, InstanceValue::Collection(_))
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match &self.value {
            InstanceValue::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&TypedInstance> {
        match &self.value {
            InstanceValue::Object(fields) => fields.get(name),
            _ => None,
        }
    }

    pub fn fields(&self) -> Option<&BTreeMap<String, TypedInstance>> {
        match &self.value {
            InstanceValue::Object(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn items(&self) -> &[TypedInstance] {
        match &self.value {
            InstanceValue::Collection(items) => items,
            _ => &[],
        }
    }

    pub fn with_source(mut self, source: DataSourceId) -> Self {
        self.source = source;
        self
    }

    /// Re-stamps this instance and every nested instance still carrying `from`.
    pub fn restamp(&mut self, from: DataSourceId, to: DataSourceId) {
        if self.source == from {
            self.source = to;
        }
        match &mut self.value {
            InstanceValue::Object(fields) => fields.values_mut().for_each(|f| f.restamp(from, to)),
            InstanceValue::Collection(items) => items.iter_mut().for_each(|i| i.restamp(from, to)),
            _ => {}
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match &self.value {
            InstanceValue::Scalar(s) => s.to_json(),
            InstanceValue::Object(fields) => {
                serde_json::Value::Object(fields.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            }
            InstanceValue::Collection(items) => serde_json::Value::Array(items.iter().map(|i| i.to_json()).collect()),
            InstanceValue::Null => serde_json::Value::Null,
        }
    }

    /// Reads a JSON payload as an instance of `type_ref`, typing nested attributes from the schema.
    pub fn from_json(
        schema: &Schema,
        type_ref: &TypeRef,
        json: &serde_json::Value,
        source: DataSourceId,
    ) -> Result<Self, QueryError> {
        if json.is_null() {
            return Ok(Self::null(type_ref.clone(), source));
        }
        if type_ref.cardinality != Cardinality::One {
            let array = json.as_array().ok_or_else(|| QueryError::InvalidValue {
                type_name: type_ref.to_string(),
                message: "expected an array".to_string(),
            })?;
            let member = type_ref.member();
            let items = array
                .iter()
                .map(|item| Self::from_json(schema, &member, item, source))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Self { type_ref: type_ref.clone(), value: InstanceValue::Collection(items), source });
        }

        let ty = schema.require_type(&type_ref.name)?;
        if ty.is_model() {
            let object = json.as_object().ok_or_else(|| QueryError::InvalidValue {
                type_name: type_ref.to_string(),
                message: "expected an object".to_string(),
            })?;
            let mut fields = BTreeMap::new();
            for attribute in &ty.attributes {
                let value = match object.get(&attribute.name) {
                    Some(v) => Self::from_json(schema, &attribute.type_ref, v, source)?,
                    None => Self::null(attribute.type_ref.clone(), source),
                };
                fields.insert(attribute.name.clone(), value);
            }
            return Ok(Self { type_ref: type_ref.clone(), value: InstanceValue::Object(fields), source });
        }

        let scalar = scalar_from_json(schema.primitive_kind(&type_ref.name), json).ok_or_else(|| {
            QueryError::InvalidValue { type_name: type_ref.to_string(), message: format!("cannot read {}", json) }
        })?;
        if ty.is_enum() {
            let name = scalar.as_str().unwrap_or_default();
            if !ty.enum_values().iter().any(|v| v.name == name) {
                return Err(QueryError::InvalidValue {
                    type_name: type_ref.to_string(),
                    message: format!("'{}' is not a declared value", name),
                });
            }
        }
        Ok(Self { type_ref: type_ref.clone(), value: InstanceValue::Scalar(scalar), source })
    }
}

fn scalar_from_json(kind: Option<PrimitiveKind>, json: &serde_json::Value) -> Option<Scalar> {
    use serde_json::Value;
    match (kind, json) {
        (Some(PrimitiveKind::String), Value::String(s)) => Some(Scalar::Text(s.clone())),
        (Some(PrimitiveKind::String), Value::Number(n)) => Some(Scalar::Text(n.to_string())),
        (Some(PrimitiveKind::Int), Value::Number(n)) => n.as_i64().map(Scalar::Int),
        (Some(PrimitiveKind::Int), Value::String(s)) => s.parse().ok().map(Scalar::Int),
        (Some(PrimitiveKind::Decimal), Value::Number(n)) => n.as_f64().map(Scalar::Decimal),
        (Some(PrimitiveKind::Decimal), Value::String(s)) => s.parse().ok().map(Scalar::Decimal),
        (Some(PrimitiveKind::Boolean), Value::Bool(b)) => Some(Scalar::Bool(*b)),
        (Some(PrimitiveKind::Any) | None, Value::Bool(b)) => Some(Scalar::Bool(*b)),
        (Some(PrimitiveKind::Any) | None, Value::String(s)) => Some(Scalar::Text(s.clone())),
        (Some(PrimitiveKind::Any) | None, Value::Number(n)) => {
            n.as_i64().map(Scalar::Int).or_else(|| n.as_f64().map(Scalar::Decimal))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Attribute, Type};
    use serde_json::json;

    #[test]
    fn test_equality_ignores_source() {
        let a = TypedInstance::scalar("FilmId", 1, DataSourceId::PROVIDED);
        let b = TypedInstance::scalar("FilmId", 1, DataSourceId::new(42));
        assert_eq!(a, b);
        assert_ne!(a, TypedInstance::scalar("ReviewId", 1, DataSourceId::PROVIDED));
    }

    #[test]
    fn test_numeric_equality_is_transitive() {
        use std::collections::HashSet;
        let two_pow_53 = 9_007_199_254_740_992i64;
        assert_eq!(Scalar::Int(two_pow_53), Scalar::Decimal(two_pow_53 as f64));
        assert_ne!(Scalar::Int(two_pow_53 + 1), Scalar::Decimal(two_pow_53 as f64));

        assert_eq!(Scalar::Decimal(0.0), Scalar::Decimal(-0.0));
        assert_eq!(Scalar::Int(0), Scalar::Decimal(-0.0));
        assert_ne!(Scalar::Int(1), Scalar::Decimal(1.5));
        assert_ne!(Scalar::Int(i64::MAX), Scalar::Decimal(i64::MAX as f64));

        let keys: HashSet<Scalar> =
            [Scalar::Int(0), Scalar::Decimal(0.0), Scalar::Decimal(-0.0), Scalar::Int(3), Scalar::Decimal(3.0)]
                .into_iter()
                .collect();
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn test_from_json_types_nested_attributes() {
        let schema = Schema::new(
            vec![
                Type::scalar("FilmId", PrimitiveKind::Int),
                Type::scalar("Title", PrimitiveKind::String),
                Type::model(
                    "Film",
                    vec![Attribute::new("id", TypeRef::one("FilmId")), Attribute::new("title", TypeRef::one("Title"))],
                ),
            ],
            vec![],
        );
        let film = TypedInstance::from_json(&schema, &TypeRef::one("Film"), &json!({"id": 7}), DataSourceId::PROVIDED)
            .expect("film");
        let id = film.attribute("id").expect("id");
        assert_eq!(id.type_name().as_str(), "FilmId");
        assert_eq!(id.as_scalar(), Some(&Scalar::Int(7)));
        assert!(film.attribute("title").expect("title").is_null());
        assert_eq!(film.to_json(), json!({"id": 7, "title": null}));
    }

    #[test]
    fn test_from_json_rejects_unknown_enum_value() {
        let schema = Schema::new(vec![Type::enumeration("Colour", vec![crate::schema::EnumValue::new("Red")])], vec![]);
        let err = TypedInstance::from_json(&schema, &TypeRef::one("Colour"), &json!("Blue"), DataSourceId::PROVIDED);
        assert!(matches!(err, Err(QueryError::InvalidValue { .. })));
    }
}
