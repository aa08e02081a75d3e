// Enum synonym resolution: a breadth-first walk over (enum, value) links with
// cycle detection.

use std::collections::{HashMap, HashSet, VecDeque};
use vantage_common::{QualifiedName, Schema, SynonymMapping};

type EnumKey = (QualifiedName, String);

#[derive(Debug, Default)]
pub struct SynonymResolver {
    links: HashMap<EnumKey, Vec<EnumKey>>,
}

impl SynonymResolver {
    /// Indexes every declared synonym in both directions.
    pub fn new(schema: &Schema) -> Self {
        let mut links: HashMap<EnumKey, Vec<EnumKey>> = HashMap::new();
        for ty in schema.types() {
            for value in ty.enum_values() {
                let from = (ty.name.clone(), value.name.clone());
                for synonym in &value.synonyms {
                    let to = (synonym.enum_type.clone(), synonym.value.clone());
                    links.entry(from.clone()).or_default().push(to.clone());
                    links.entry(to).or_default().push(from.clone());
                }
            }
        }
        Self { links }
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// The value of `target` reachable from `(from_type, from_value)`, if any.
    pub fn resolve(&self, from_type: &QualifiedName, from_value: &str, target: &QualifiedName) -> Option<SynonymMapping> {
        let start = (from_type.clone(), from_value.to_string());
        let mut visited = HashSet::from([start.clone()]);
        let mut queue = VecDeque::from([start]);

        while let Some(current) = queue.pop_front() {
            for next in self.links.get(&current).into_iter().flatten() {
                if !visited.insert(next.clone()) {
                    continue;
                }
                if &next.0 == target {
                    return Some(SynonymMapping {
                        from_type: from_type.clone(),
                        from_value: from_value.to_string(),
                        to_type: next.0.clone(),
                        to_value: next.1.clone(),
                    });
                }
                queue.push_back(next.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vantage_common::{EnumValue, Type};

    fn schema() -> Schema {
        Schema::new(
            vec![
                Type::enumeration("IsoCountry", vec![EnumValue::new("NZ").synonym_of("CountryName", "NewZealand")]),
                Type::enumeration(
                    "CountryName",
                    vec![EnumValue::new("NewZealand").synonym_of("DialCode", "Plus64")],
                ),
                Type::enumeration("DialCode", vec![EnumValue::new("Plus64").synonym_of("IsoCountry", "NZ")]),
            ],
            vec![],
        )
    }

    #[test]
    fn test_resolves_transitively() {
        let resolver = SynonymResolver::new(&schema());
        let mapping = resolver.resolve(&"IsoCountry".into(), "NZ", &"DialCode".into()).expect("mapping");
        assert_eq!(mapping.to_value, "Plus64");
    }

    #[test]
    fn test_resolves_in_reverse_and_terminates_on_cycles() {
        let resolver = SynonymResolver::new(&schema());
        let mapping = resolver.resolve(&"CountryName".into(), "NewZealand", &"IsoCountry".into()).expect("mapping");
        assert_eq!(mapping.to_value, "NZ");
        assert!(resolver.resolve(&"IsoCountry".into(), "NZ", &"Missing".into()).is_none());
    }
}
