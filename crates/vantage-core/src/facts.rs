// Fact Bag
//
// Facts are held in a copy-on-write snapshot: readers clone the Arc and scan
// without holding the lock, writers swap in a new vector. Bags chain to a parent
// so nested projections see their own facts first and then the enclosing ones.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use vantage_common::{
    Cardinality, DataSourceId, InstanceValue, QualifiedName, Schema, TypeRef, TypedInstance,
};

/// Scope name bound to the element a projection is building from.
pub const THIS: &str = "this";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactDiscoveryStrategy {
    /// Only facts added directly to the bag.
    TopLevelOnly,
    /// Scans nested attributes; more than one match is ambiguous.
    AnyDepthExpectOne,
    /// Like `AnyDepthExpectOne` but equal values count once, then narrows to
    /// exact-type matches and finally to the single non-null match.
    AnyDepthExpectOneDistinct,
    /// Every match, returned as a collection.
    AnyDepthAllowMany,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeMatching {
    Exact,
    AllowInherited,
}

#[derive(Debug, Default)]
pub struct FactBag {
    facts: RwLock<Arc<Vec<TypedInstance>>>,
    scopes: RwLock<HashMap<String, TypedInstance>>,
    parent: Option<Arc<FactBag>>,
}

impl FactBag {
    pub fn new(facts: Vec<TypedInstance>) -> Self {
        Self { facts: RwLock::new(Arc::new(facts)), scopes: RwLock::new(HashMap::new()), parent: None }
    }

    /// A child bag with `this` bound to the element being projected.
    pub fn scoped(parent: Arc<FactBag>, this: Option<TypedInstance>, named: Vec<(String, TypedInstance)>) -> Self {
        let mut scopes = HashMap::new();
        let mut facts = Vec::new();
        if let Some(this) = this {
            scopes.insert(THIS.to_string(), this.clone());
            facts.push(this);
        }
        for (name, value) in named {
            facts.push(value.clone());
            scopes.insert(name, value);
        }
        Self { facts: RwLock::new(Arc::new(facts)), scopes: RwLock::new(scopes), parent: Some(parent) }
    }

    pub fn parent(&self) -> Option<&Arc<FactBag>> {
        self.parent.as_ref()
    }

    pub fn add_fact(&self, fact: TypedInstance) {
        let mut guard = self.facts.write().unwrap_or_else(|e| e.into_inner());
        Arc::make_mut(&mut guard).push(fact);
    }

    /// Adds a fact reachable by name as well as by type (a `given` variable).
    pub fn add_named(&self, name: &str, fact: TypedInstance) {
        self.scopes.write().unwrap_or_else(|e| e.into_inner()).insert(name.to_string(), fact.clone());
        self.add_fact(fact);
    }

    fn snapshot(&self) -> Arc<Vec<TypedInstance>> {
        self.facts.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Looks up a named scope, innermost first.
    pub fn scope_value(&self, name: &str) -> Option<TypedInstance> {
        let local = self.scopes.read().unwrap_or_else(|e| e.into_inner()).get(name).cloned();
        local.or_else(|| self.parent.as_ref().and_then(|p| p.scope_value(name)))
    }

    pub fn this(&self) -> Option<TypedInstance> {
        self.scope_value(THIS)
    }

    /// Facts of this bag followed by those of every ancestor bag.
    pub fn all_facts(&self) -> Vec<TypedInstance> {
        let mut facts: Vec<TypedInstance> = self.snapshot().iter().cloned().collect();
        if let Some(parent) = &self.parent {
            for fact in parent.all_facts() {
                if !facts.contains(&fact) {
                    facts.push(fact);
                }
            }
        }
        facts
    }

    pub fn find(
        &self,
        schema: &Schema,
        type_ref: &TypeRef,
        matching: TypeMatching,
        strategy: FactDiscoveryStrategy,
    ) -> Option<TypedInstance> {
        let local = find_in(&self.snapshot(), schema, type_ref, matching, strategy);
        if strategy == FactDiscoveryStrategy::AnyDepthAllowMany && type_ref.is_collection() {
            // Collections cascade: combine every level of the scope chain.
            let inherited = self.parent.as_ref().and_then(|p| p.find(schema, type_ref, matching, strategy));
            return merge_collections(type_ref, local, inherited);
        }
        local.or_else(|| self.parent.as_ref().and_then(|p| p.find(schema, type_ref, matching, strategy)))
    }

    /// Every match at any depth in this bag and its ancestors. Re-scans on each call.
    pub fn find_all(&self, schema: &Schema, type_name: &QualifiedName, matching: TypeMatching) -> Vec<TypedInstance> {
        let mut matches = Vec::new();
        for fact in self.snapshot().iter() {
            collect_matches(fact, schema, type_name, matching, true, &mut matches);
        }
        if let Some(parent) = &self.parent {
            matches.extend(parent.find_all(schema, type_name, matching));
        }
        matches
    }

    pub fn has_fact(&self, schema: &Schema, type_ref: &TypeRef) -> bool {
        self.find(schema, type_ref, TypeMatching::AllowInherited, FactDiscoveryStrategy::AnyDepthExpectOneDistinct)
            .is_some()
    }
}

fn type_matches(schema: &Schema, actual: &QualifiedName, wanted: &QualifiedName, matching: TypeMatching) -> bool {
    match matching {
        TypeMatching::Exact => actual == wanted,
        TypeMatching::AllowInherited => schema.is_assignable(actual, wanted),
    }
}

fn collect_matches(
    fact: &TypedInstance,
    schema: &Schema,
    wanted: &QualifiedName,
    matching: TypeMatching,
    any_depth: bool,
    out: &mut Vec<TypedInstance>,
) {
    match &fact.value {
        InstanceValue::Collection(items) => {
            if any_depth {
                for item in items {
                    collect_matches(item, schema, wanted, matching, any_depth, out);
                }
            }
        }
        value => {
            if type_matches(schema, fact.type_name(), wanted, matching) {
                out.push(fact.clone());
            }
            if let (true, InstanceValue::Object(fields)) = (any_depth, value) {
                for field in fields.values() {
                    collect_matches(field, schema, wanted, matching, any_depth, out);
                }
            }
        }
    }
}

fn distinct(values: Vec<TypedInstance>) -> Vec<TypedInstance> {
    let mut unique: Vec<TypedInstance> = Vec::new();
    for value in values {
        if !unique.contains(&value) {
            unique.push(value);
        }
    }
    unique
}

fn find_in(
    facts: &[TypedInstance],
    schema: &Schema,
    type_ref: &TypeRef,
    matching: TypeMatching,
    strategy: FactDiscoveryStrategy,
) -> Option<TypedInstance> {
    let wanted = &type_ref.name;

    if type_ref.cardinality != Cardinality::One {
        // A fact that is itself a collection of the wanted type.
        let whole = facts.iter().find(|f| f.is_collection() && type_matches(schema, f.type_name(), wanted, matching));
        if let Some(whole) = whole {
            return Some(whole.clone());
        }
        if strategy != FactDiscoveryStrategy::AnyDepthAllowMany {
            return None;
        }
    }

    let mut matches = Vec::new();
    let any_depth = strategy != FactDiscoveryStrategy::TopLevelOnly;
    for fact in facts {
        if any_depth {
            collect_matches(fact, schema, wanted, matching, true, &mut matches);
        } else if !fact.is_collection() && type_matches(schema, fact.type_name(), wanted, matching) {
            matches.push(fact.clone());
        }
    }

    match strategy {
        FactDiscoveryStrategy::TopLevelOnly => single(matches),
        FactDiscoveryStrategy::AnyDepthExpectOne => {
            if matches.len() > 1 {
                tracing::debug!("{} facts match {}; expected one", matches.len(), wanted);
            }
            single(matches)
        }
        FactDiscoveryStrategy::AnyDepthExpectOneDistinct => {
            let unique = distinct(matches);
            if unique.len() <= 1 {
                return unique.into_iter().next();
            }
            let exact: Vec<_> = unique.iter().filter(|f| f.type_name() == wanted).cloned().collect();
            if exact.len() == 1 {
                return exact.into_iter().next();
            }
            let populated: Vec<_> = unique.into_iter().filter(|f| !f.is_null()).collect();
            if populated.len() != 1 {
                tracing::debug!("{} distinct facts match {}; ambiguous", populated.len(), wanted);
            }
            single(populated)
        }
        FactDiscoveryStrategy::AnyDepthAllowMany => {
            let unique: Vec<_> = distinct(matches).into_iter().filter(|f| !f.is_null()).collect();
            if unique.is_empty() {
                None
            } else {
                Some(TypedInstance::collection(wanted.clone(), unique, DataSourceId::MIXED))
            }
        }
    }
}

fn single(mut matches: Vec<TypedInstance>) -> Option<TypedInstance> {
    if matches.len() == 1 {
        matches.pop()
    } else {
        None
    }
}

fn merge_collections(
    type_ref: &TypeRef,
    local: Option<TypedInstance>,
    inherited: Option<TypedInstance>,
) -> Option<TypedInstance> {
    match (local, inherited) {
        (Some(local), Some(inherited)) => {
            let items = distinct(local.items().iter().chain(inherited.items().iter()).cloned().collect());
            Some(TypedInstance::collection(type_ref.name.clone(), items, DataSourceId::MIXED))
        }
        (local, inherited) => local.or(inherited),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use vantage_common::{Attribute, PrimitiveKind, Type};

    fn schema() -> Schema {
        Schema::new(
            vec![
                Type::scalar("FilmId", PrimitiveKind::Int),
                Type::scalar("ImdbId", PrimitiveKind::Int).inheriting("FilmId"),
                Type::scalar("Title", PrimitiveKind::String),
                Type::model(
                    "Film",
                    vec![Attribute::new("id", TypeRef::one("FilmId")), Attribute::new("title", TypeRef::one("Title"))],
                ),
            ],
            vec![],
        )
    }

    fn film(id: i64, title: &str) -> TypedInstance {
        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), TypedInstance::scalar("FilmId", id, DataSourceId::PROVIDED));
        fields.insert("title".to_string(), TypedInstance::scalar("Title", title, DataSourceId::PROVIDED));
        TypedInstance::object("Film", fields, DataSourceId::PROVIDED)
    }

    #[test]
    fn test_top_level_only_ignores_nested_attributes() {
        let schema = schema();
        let bag = FactBag::new(vec![film(1, "A")]);
        let id = TypeRef::one("FilmId");
        assert!(bag.find(&schema, &id, TypeMatching::Exact, FactDiscoveryStrategy::TopLevelOnly).is_none());
        assert!(bag.find(&schema, &id, TypeMatching::Exact, FactDiscoveryStrategy::AnyDepthExpectOne).is_some());
    }

    #[test]
    fn test_expect_one_distinct_collapses_equal_values() {
        let schema = schema();
        let bag = FactBag::new(vec![film(1, "A"), TypedInstance::scalar("FilmId", 1, DataSourceId::new(7))]);
        let id = TypeRef::one("FilmId");
        assert!(bag.find(&schema, &id, TypeMatching::Exact, FactDiscoveryStrategy::AnyDepthExpectOne).is_none());
        let found = bag
            .find(&schema, &id, TypeMatching::Exact, FactDiscoveryStrategy::AnyDepthExpectOneDistinct)
            .expect("distinct");
        assert_eq!(found.as_scalar(), Some(&vantage_common::Scalar::Int(1)));
    }

    #[test]
    fn test_expect_one_distinct_prefers_exact_type() {
        let schema = schema();
        let bag = FactBag::new(vec![
            TypedInstance::scalar("FilmId", 1, DataSourceId::PROVIDED),
            TypedInstance::scalar("ImdbId", 2, DataSourceId::PROVIDED),
        ]);
        let found = bag
            .find(&schema, &TypeRef::one("FilmId"), TypeMatching::AllowInherited, FactDiscoveryStrategy::AnyDepthExpectOneDistinct)
            .expect("exact");
        assert_eq!(found.type_name().as_str(), "FilmId");
    }

    #[test]
    fn test_scoped_bag_searches_innermost_first() {
        let schema = schema();
        let root = Arc::new(FactBag::new(vec![TypedInstance::scalar("Title", "outer", DataSourceId::PROVIDED)]));
        let child = FactBag::scoped(root.clone(), Some(film(2, "inner")), vec![]);
        let title = child
            .find(&schema, &TypeRef::one("Title"), TypeMatching::Exact, FactDiscoveryStrategy::AnyDepthExpectOneDistinct)
            .expect("title");
        assert_eq!(title.as_scalar(), Some(&vantage_common::Scalar::Text("inner".into())));
        assert_eq!(child.this().expect("this").type_name().as_str(), "Film");
    }

    #[test]
    fn test_allow_many_combines_scope_levels() {
        let schema = schema();
        let root = Arc::new(FactBag::new(vec![film(1, "A")]));
        let child = FactBag::scoped(root, None, vec![("other".to_string(), film(2, "B"))]);
        let all = child
            .find(&schema, &TypeRef::many("Film"), TypeMatching::Exact, FactDiscoveryStrategy::AnyDepthAllowMany)
            .expect("films");
        assert_eq!(all.items().len(), 2);
        assert_eq!(child.scope_value("other").expect("named").attribute("id").is_some(), true);
    }

    #[test]
    fn test_concurrent_appends_are_all_kept() {
        let bag = Arc::new(FactBag::new(vec![]));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let bag = bag.clone();
                std::thread::spawn(move || bag.add_fact(TypedInstance::scalar("FilmId", i, DataSourceId::PROVIDED)))
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(bag.all_facts().len(), 8);
    }
}
