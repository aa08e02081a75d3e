// Expression evaluation for calculated fields. Type references inside an
// expression go through the same discovery as projected fields.

use super::functions::plain_text;
use crate::context::{DiscoveryFrame, DiscoveryTarget, QueryContext};
use crate::facts::FactBag;
use async_recursion::async_recursion;
use std::cmp::Ordering;
use std::sync::Arc;
use vantage_common::{
    BinaryOp, CollectionOp, DataSourceId, Expr, Lambda, PrimitiveKind, QueryError, Scalar, TypeRef, TypedInstance,
};

#[derive(Debug)]
pub enum EvalError {
    /// The expression itself cannot produce a value; the field becomes null.
    Failed(String),
    /// The query cannot continue.
    Query(QueryError),
}

impl From<QueryError> for EvalError {
    fn from(error: QueryError) -> Self {
        EvalError::Query(error)
    }
}

type EvalResult = Result<TypedInstance, EvalError>;

pub struct ExpressionEvaluator {
    ctx: Arc<QueryContext>,
}

impl ExpressionEvaluator {
    pub fn new(ctx: Arc<QueryContext>) -> Self {
        Self { ctx }
    }

    /// Evaluates `expr` against `bag`, pushing the source of every value read
    /// into `inputs`.
    #[async_recursion]
    pub async fn evaluate(&self, expr: &Expr, bag: &Arc<FactBag>, inputs: &mut Vec<DataSourceId>) -> EvalResult {
        match expr {
            Expr::Literal(value) => Ok(primitive(value.clone(), DataSourceId::DEFINED_IN_SCHEMA)),
            Expr::Null => Ok(null()),
            Expr::Type(type_ref) => {
                let target = DiscoveryTarget::of(type_ref.clone());
                let found = match self.ctx.find_fact(bag, &target) {
                    Some(value) => Some(value),
                    None => self.ctx.discover(&target, bag, &DiscoveryFrame::root()).await?,
                };
                let value = found.unwrap_or_else(|| TypedInstance::null(type_ref.clone(), DataSourceId::MIXED));
                inputs.push(value.source);
                Ok(value)
            }
            Expr::Path { scope, path } => {
                let value = navigate(bag, scope.as_deref(), path)?;
                inputs.push(value.source);
                Ok(value)
            }
            Expr::Binary { op, left, right } if op.is_logical() => {
                let left = truthy(&self.evaluate(left, bag, inputs).await?)?;
                match (op, left) {
                    (BinaryOp::And, false) => return Ok(boolean(false)),
                    (BinaryOp::Or, true) => return Ok(boolean(true)),
                    _ => {}
                }
                let right = truthy(&self.evaluate(right, bag, inputs).await?)?;
                Ok(boolean(right))
            }
            Expr::Binary { op, left, right } => {
                let left = self.evaluate(left, bag, inputs).await?;
                let right = self.evaluate(right, bag, inputs).await?;
                apply(*op, &left, &right)
            }
            Expr::Not(inner) => {
                let value = self.evaluate(inner, bag, inputs).await?;
                Ok(boolean(!truthy(&value)?))
            }
            Expr::Call { function, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    let value = self.evaluate(arg, bag, inputs).await?;
                    values.push(value.as_scalar().cloned());
                }
                let result = self.ctx.functions.call(function, &values).map_err(EvalError::Failed)?;
                Ok(result.map(|s| primitive(s, DataSourceId::MIXED)).unwrap_or_else(null))
            }
            Expr::When(cases) => {
                for case in cases {
                    let matched = match &case.condition {
                        None => true,
                        Some(condition) => truthy(&self.evaluate(condition, bag, inputs).await?)?,
                    };
                    if matched {
                        return self.evaluate(&case.result, bag, inputs).await;
                    }
                }
                Ok(null())
            }
            Expr::Collection { op, source, lambda, key } => {
                let collection = self.evaluate(source, bag, inputs).await?;
                if collection.is_null() {
                    return Ok(null());
                }
                if !collection.is_collection() {
                    return Err(EvalError::Failed(format!("{} is not a collection", source)));
                }
                let items = collection.items().to_vec();
                match op {
                    CollectionOp::Map => {
                        let mut mapped = Vec::with_capacity(items.len());
                        for item in items {
                            mapped.push(self.apply_lambda(lambda, item, bag, inputs).await?);
                        }
                        let member = mapped
                            .first()
                            .map(|m| m.type_name().clone())
                            .unwrap_or_else(|| PrimitiveKind::Any.qualified_name());
                        Ok(TypedInstance::collection(member, mapped, DataSourceId::MIXED))
                    }
                    CollectionOp::FilterAll => {
                        let member = collection.type_name().clone();
                        let kept = self.matching(lambda, items, bag, inputs).await?;
                        Ok(TypedInstance::collection(member, kept, DataSourceId::MIXED))
                    }
                    CollectionOp::Single => {
                        let mut matches = self.matching(lambda, items, bag, inputs).await?;
                        if matches.len() != 1 {
                            return Err(EvalError::Failed(format!(
                                "single expected exactly one match, found {}",
                                matches.len()
                            )));
                        }
                        Ok(matches.remove(0))
                    }
                    CollectionOp::SingleBy => {
                        let key = key.as_ref().ok_or_else(|| EvalError::Failed("singleBy requires a key".into()))?;
                        let wanted = self.evaluate(key, bag, inputs).await?;
                        let mut matches = Vec::new();
                        for item in items {
                            let candidate = self.apply_lambda(lambda, item.clone(), bag, inputs).await?;
                            if !candidate.is_null() && candidate.as_scalar() == wanted.as_scalar() {
                                matches.push(item);
                            }
                        }
                        match matches.len() {
                            0 => Ok(null()),
                            1 => Ok(matches.remove(0)),
                            n => Err(EvalError::Failed(format!("singleBy matched {} items for {}", n, key))),
                        }
                    }
                }
            }
        }
    }

    async fn apply_lambda(
        &self,
        lambda: &Lambda,
        item: TypedInstance,
        bag: &Arc<FactBag>,
        inputs: &mut Vec<DataSourceId>,
    ) -> EvalResult {
        let scope = Arc::new(FactBag::scoped(bag.clone(), None, vec![(lambda.param.clone(), item)]));
        self.evaluate(&lambda.body, &scope, inputs).await
    }

    async fn matching(
        &self,
        lambda: &Lambda,
        items: Vec<TypedInstance>,
        bag: &Arc<FactBag>,
        inputs: &mut Vec<DataSourceId>,
    ) -> Result<Vec<TypedInstance>, EvalError> {
        let mut kept = Vec::new();
        for item in items {
            if truthy(&self.apply_lambda(lambda, item.clone(), bag, inputs).await?)? {
                kept.push(item);
            }
        }
        Ok(kept)
    }
}

/// Bare paths read attributes of `this` first, then a named scope.
fn navigate(bag: &FactBag, scope: Option<&str>, path: &[String]) -> EvalResult {
    let (mut current, rest) = match scope {
        Some(name) => {
            let value = bag.scope_value(name).ok_or_else(|| EvalError::Failed(format!("'{}' is not in scope", name)))?;
            (value, path)
        }
        None => {
            let Some((first, rest)) = path.split_first() else {
                return Err(EvalError::Failed("empty path".into()));
            };
            let from_this = bag.this().and_then(|this| this.attribute(first).cloned());
            match from_this.or_else(|| bag.scope_value(first)) {
                Some(value) => (value, rest),
                None => return Err(EvalError::Failed(format!("'{}' is not in scope", first))),
            }
        }
    };
    for segment in rest {
        if current.is_null() {
            return Ok(null());
        }
        current = current
            .attribute(segment)
            .cloned()
            .ok_or_else(|| EvalError::Failed(format!("no attribute '{}' on {}", segment, current.type_ref)))?;
    }
    Ok(current)
}

fn truthy(value: &TypedInstance) -> Result<bool, EvalError> {
    if value.is_null() {
        return Ok(false);
    }
    value
        .as_scalar()
        .and_then(|s| s.as_bool())
        .ok_or_else(|| EvalError::Failed(format!("expected a boolean, got {}", value.to_json())))
}

fn apply(op: BinaryOp, left: &TypedInstance, right: &TypedInstance) -> EvalResult {
    let (l, r) = match (left.as_scalar(), right.as_scalar()) {
        (Some(l), Some(r)) => (l, r),
        _ => {
            let both_null = left.is_null() && right.is_null();
            return Ok(match op {
                BinaryOp::Equal => boolean(both_null),
                BinaryOp::NotEqual => boolean(!both_null),
                BinaryOp::GreaterThan
                | BinaryOp::GreaterThanOrEqual
                | BinaryOp::LessThan
                | BinaryOp::LessThanOrEqual => boolean(false),
                _ => null(),
            });
        }
    };
    let incomparable = || EvalError::Failed(format!("cannot compare {} with {}", l, r));
    match op {
        BinaryOp::Equal => Ok(boolean(l == r)),
        BinaryOp::NotEqual => Ok(boolean(l != r)),
        BinaryOp::GreaterThan => Ok(boolean(l.compare(r).ok_or_else(incomparable)? == Ordering::Greater)),
        BinaryOp::GreaterThanOrEqual => Ok(boolean(l.compare(r).ok_or_else(incomparable)? != Ordering::Less)),
        BinaryOp::LessThan => Ok(boolean(l.compare(r).ok_or_else(incomparable)? == Ordering::Less)),
        BinaryOp::LessThanOrEqual => Ok(boolean(l.compare(r).ok_or_else(incomparable)? != Ordering::Greater)),
        BinaryOp::Add => match (l, r) {
            (Scalar::Text(_), _) | (_, Scalar::Text(_)) => {
                Ok(primitive(Scalar::Text(format!("{}{}", plain_text(l), plain_text(r))), DataSourceId::MIXED))
            }
            _ => arithmetic(op, l, r),
        },
        _ => arithmetic(op, l, r),
    }
}

fn arithmetic(op: BinaryOp, l: &Scalar, r: &Scalar) -> EvalResult {
    if let (Scalar::Int(a), Scalar::Int(b)) = (l, r) {
        let result = match op {
            BinaryOp::Add => a.checked_add(*b),
            BinaryOp::Subtract => a.checked_sub(*b),
            BinaryOp::Multiply => a.checked_mul(*b),
            BinaryOp::Divide if *b == 0 => return Err(EvalError::Failed("division by zero".into())),
            BinaryOp::Divide => match a.checked_rem(*b) {
                Some(0) => a.checked_div(*b),
                Some(_) => return Ok(number(*a as f64 / *b as f64)),
                None => None,
            },
            BinaryOp::Modulo if *b == 0 => return Err(EvalError::Failed("division by zero".into())),
            BinaryOp::Modulo => a.checked_rem(*b),
            _ => return Err(EvalError::Failed(format!("{} is not arithmetic", op.symbol()))),
        };
        return result
            .map(|v| primitive(Scalar::Int(v), DataSourceId::MIXED))
            .ok_or_else(|| EvalError::Failed(format!("integer overflow in {} {} {}", a, op.symbol(), b)));
    }

    let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
        return Err(EvalError::Failed(format!("cannot apply {} to {} and {}", op.symbol(), l, r)));
    };
    match op {
        BinaryOp::Add => Ok(number(a + b)),
        BinaryOp::Subtract => Ok(number(a - b)),
        BinaryOp::Multiply => Ok(number(a * b)),
        BinaryOp::Divide | BinaryOp::Modulo if b == 0.0 => Err(EvalError::Failed("division by zero".into())),
        BinaryOp::Divide => Ok(number(a / b)),
        BinaryOp::Modulo => Ok(number(a % b)),
        _ => Err(EvalError::Failed(format!("{} is not arithmetic", op.symbol()))),
    }
}

fn primitive(value: Scalar, source: DataSourceId) -> TypedInstance {
    let kind = match &value {
        Scalar::Bool(_) => PrimitiveKind::Boolean,
        Scalar::Int(_) => PrimitiveKind::Int,
        Scalar::Decimal(_) => PrimitiveKind::Decimal,
        Scalar::Text(_) => PrimitiveKind::String,
    };
    TypedInstance::scalar(kind.qualified_name(), value, source)
}

fn boolean(value: bool) -> TypedInstance {
    primitive(Scalar::Bool(value), DataSourceId::MIXED)
}

fn number(value: f64) -> TypedInstance {
    primitive(Scalar::Decimal(value), DataSourceId::MIXED)
}

fn null() -> TypedInstance {
    TypedInstance::null(TypeRef::one(PrimitiveKind::Any.qualified_name()), DataSourceId::MIXED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn film() -> TypedInstance {
        let mut fields = BTreeMap::new();
        fields.insert("score".to_string(), TypedInstance::scalar("Score", 7, DataSourceId::PROVIDED));
        fields.insert("title".to_string(), TypedInstance::scalar("Title", "Alien", DataSourceId::PROVIDED));
        TypedInstance::object("Film", fields, DataSourceId::PROVIDED)
    }

    #[test]
    fn test_navigate_prefers_this_then_named_scope() {
        let root = Arc::new(FactBag::new(vec![]));
        let bag = FactBag::scoped(root, Some(film()), vec![("movie".to_string(), film())]);

        let title = navigate(&bag, None, &["title".to_string()]).expect("title");
        assert_eq!(title.as_scalar(), Some(&Scalar::Text("Alien".into())));
        let score = navigate(&bag, None, &["movie".to_string(), "score".to_string()]).expect("score");
        assert_eq!(score.as_scalar(), Some(&Scalar::Int(7)));
        assert!(matches!(navigate(&bag, Some("other"), &[]), Err(EvalError::Failed(_))));
    }

    #[test]
    fn test_arithmetic_and_null_propagation() {
        let two = primitive(Scalar::Int(2), DataSourceId::MIXED);
        let four = primitive(Scalar::Int(4), DataSourceId::MIXED);
        let sum = apply(BinaryOp::Add, &two, &four).expect("sum");
        assert_eq!(sum.as_scalar(), Some(&Scalar::Int(6)));

        let half = apply(BinaryOp::Divide, &two, &four).expect("half");
        assert_eq!(half.as_scalar(), Some(&Scalar::Decimal(0.5)));

        assert!(apply(BinaryOp::Add, &two, &null()).expect("null").is_null());
        assert!(matches!(apply(BinaryOp::Divide, &two, &primitive(Scalar::Int(0), DataSourceId::MIXED)), Err(EvalError::Failed(_))));

        let eq = apply(BinaryOp::Equal, &null(), &null()).expect("eq");
        assert_eq!(eq.as_scalar(), Some(&Scalar::Bool(true)));
    }

    #[test]
    fn test_integer_overflow_is_an_evaluation_failure() {
        let min = primitive(Scalar::Int(i64::MIN), DataSourceId::MIXED);
        let minus_one = primitive(Scalar::Int(-1), DataSourceId::MIXED);
        assert!(matches!(apply(BinaryOp::Divide, &min, &minus_one), Err(EvalError::Failed(_))));
        assert!(matches!(apply(BinaryOp::Modulo, &min, &minus_one), Err(EvalError::Failed(_))));
        assert!(matches!(apply(BinaryOp::Multiply, &min, &minus_one), Err(EvalError::Failed(_))));

        let six = primitive(Scalar::Int(-6), DataSourceId::MIXED);
        let quotient = apply(BinaryOp::Divide, &six, &minus_one).expect("quotient");
        assert_eq!(quotient.as_scalar(), Some(&Scalar::Int(6)));
    }
}
