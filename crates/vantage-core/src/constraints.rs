// Constraint evaluation for target filters (`Film(FilmId == 1)`) and operation
// contracts (`ReturnAttr >= paramX`).

use std::cmp::Ordering;
use std::collections::HashMap;
use vantage_common::{
    ComparisonOperator, ConstraintValue, InstanceValue, Operation, PropertyConstraint, PropertyRef, Scalar,
    Schema, TypedInstance,
};

pub struct ConstraintEvaluator<'a> {
    schema: &'a Schema,
}

impl<'a> ConstraintEvaluator<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self { schema }
    }

    /// True when `instance` satisfies every constraint. Parameter-relative values
    /// are read from `parameters`; an unbound parameter fails the constraint.
    pub fn satisfies(
        &self,
        instance: &TypedInstance,
        constraints: &[PropertyConstraint],
        parameters: &HashMap<String, Scalar>,
    ) -> bool {
        constraints.iter().all(|constraint| {
            let Some(actual) = self.property_value(instance, &constraint.property) else {
                return false;
            };
            let expected = match &constraint.value {
                ConstraintValue::Constant(value) => value,
                ConstraintValue::Parameter(name) => match parameters.get(name) {
                    Some(value) => value,
                    None => return false,
                },
            };
            compare(&actual, constraint.operator, expected)
        })
    }

    /// Filters a result; collections are filtered element-wise.
    pub fn filter(&self, instance: TypedInstance, constraints: &[PropertyConstraint]) -> Option<TypedInstance> {
        if constraints.is_empty() {
            return Some(instance);
        }
        let no_parameters = HashMap::new();
        if let InstanceValue::Collection(items) = &instance.value {
            let kept = items.iter().filter(|i| self.satisfies(i, constraints, &no_parameters)).cloned().collect();
            return Some(TypedInstance {
                type_ref: instance.type_ref.clone(),
                value: InstanceValue::Collection(kept),
                source: instance.source,
            });
        }
        self.satisfies(&instance, constraints, &no_parameters).then_some(instance)
    }

    /// Binds operation parameters from a target's constant constraints through the
    /// operation's contract. `None` if any target constraint is not covered.
    pub fn bind_contract(
        &self,
        operation: &Operation,
        target_constraints: &[PropertyConstraint],
    ) -> Option<HashMap<String, Scalar>> {
        let mut bindings = HashMap::new();
        for wanted in target_constraints {
            let ConstraintValue::Constant(value) = &wanted.value else {
                return None;
            };
            let contract = operation.contract.iter().find(|c| {
                c.operator == wanted.operator && self.same_property(&c.property, &wanted.property)
            })?;
            let ConstraintValue::Parameter(param) = &contract.value else {
                return None;
            };
            operation.parameter(param)?;
            bindings.insert(param.clone(), value.clone());
        }
        Some(bindings)
    }

    fn same_property(&self, a: &PropertyRef, b: &PropertyRef) -> bool {
        match (a, b) {
            (PropertyRef::Attribute(x), PropertyRef::Attribute(y)) => x == y,
            (PropertyRef::Type(x), PropertyRef::Type(y)) => {
                self.schema.is_assignable(x, y) || self.schema.is_assignable(y, x)
            }
            _ => false,
        }
    }

    fn property_value(&self, instance: &TypedInstance, property: &PropertyRef) -> Option<Scalar> {
        match property {
            PropertyRef::Attribute(name) => instance.attribute(name)?.as_scalar().cloned(),
            PropertyRef::Type(type_name) => {
                if self.schema.is_assignable(instance.type_name(), type_name) {
                    return instance.as_scalar().cloned();
                }
                instance
                    .fields()?
                    .values()
                    .find(|f| self.schema.is_assignable(f.type_name(), type_name))
                    .and_then(|f| f.as_scalar().cloned())
            }
        }
    }
}

pub fn compare(actual: &Scalar, operator: ComparisonOperator, expected: &Scalar) -> bool {
    match operator {
        ComparisonOperator::Equal => actual == expected,
        ComparisonOperator::NotEqual => actual != expected,
        ComparisonOperator::GreaterThan => actual.compare(expected) == Some(Ordering::Greater),
        ComparisonOperator::GreaterThanOrEqual => {
            matches!(actual.compare(expected), Some(Ordering::Greater | Ordering::Equal))
        }
        ComparisonOperator::LessThan => actual.compare(expected) == Some(Ordering::Less),
        ComparisonOperator::LessThanOrEqual => {
            matches!(actual.compare(expected), Some(Ordering::Less | Ordering::Equal))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use vantage_common::{Attribute, DataSourceId, Parameter, PrimitiveKind, Type, TypeRef};

    fn schema() -> Schema {
        Schema::new(
            vec![
                Type::scalar("FilmId", PrimitiveKind::Int),
                Type::scalar("Year", PrimitiveKind::Int),
                Type::model("Film", vec![Attribute::new("id", TypeRef::one("FilmId")), Attribute::new("year", TypeRef::one("Year"))]),
            ],
            vec![],
        )
    }

    fn film(id: i64, year: i64) -> TypedInstance {
        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), TypedInstance::scalar("FilmId", id, DataSourceId::PROVIDED));
        fields.insert("year".to_string(), TypedInstance::scalar("Year", year, DataSourceId::PROVIDED));
        TypedInstance::object("Film", fields, DataSourceId::PROVIDED)
    }

    #[test]
    fn test_type_and_attribute_constraints() {
        let schema = schema();
        let evaluator = ConstraintEvaluator::new(&schema);
        let by_type = PropertyConstraint::type_equals("FilmId", Scalar::Int(1));
        let after = PropertyConstraint::new(
            PropertyRef::Attribute("year".into()),
            ComparisonOperator::GreaterThan,
            ConstraintValue::Constant(Scalar::Int(2000)),
        );
        assert!(evaluator.satisfies(&film(1, 2010), &[by_type.clone(), after.clone()], &HashMap::new()));
        assert!(!evaluator.satisfies(&film(2, 2010), &[by_type], &HashMap::new()));
        assert!(!evaluator.satisfies(&film(1, 1990), &[after], &HashMap::new()));
    }

    #[test]
    fn test_contract_binds_parameter_from_target() {
        let schema = schema();
        let evaluator = ConstraintEvaluator::new(&schema);
        let operation = vantage_common::Operation::new(
            "filmById",
            vec![Parameter::new("filmId", TypeRef::one("FilmId"))],
            TypeRef::one("Film"),
        )
        .with_contract(PropertyConstraint::new(
            PropertyRef::Type("FilmId".into()),
            ComparisonOperator::Equal,
            ConstraintValue::Parameter("filmId".into()),
        ));

        let bindings = evaluator
            .bind_contract(&operation, &[PropertyConstraint::type_equals("FilmId", Scalar::Int(3))])
            .expect("bound");
        assert_eq!(bindings.get("filmId"), Some(&Scalar::Int(3)));

        let year = PropertyConstraint::new(
            PropertyRef::Attribute("year".into()),
            ComparisonOperator::Equal,
            ConstraintValue::Constant(Scalar::Int(2000)),
        );
        assert!(evaluator.bind_contract(&operation, &[year]).is_none());
    }
}
