// Graph Builder
//
// The schema-derived part of the graph is built once per schema fingerprint and
// shared through the cache. Each discovery clones it and wires in one node per
// fact it can start from; that instance layer is never cached.

use super::element::{Edge, Element, Relationship};
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};
use vantage_common::config::GraphConfig;
use vantage_common::{Cardinality, InstanceValue, OperationKind, QualifiedName, Schema, TypedInstance};

#[derive(Debug, Clone, Copy)]
pub struct EdgeCosts {
    pub attribute: u32,
    pub invocation: u32,
}

impl From<&GraphConfig> for EdgeCosts {
    fn from(config: &GraphConfig) -> Self {
        Self { attribute: config.attribute_edge_cost, invocation: config.invocation_edge_cost }
    }
}

#[derive(Debug, Clone)]
pub struct SchemaGraph {
    pub(crate) graph: DiGraph<Element, Edge>,
    pub(crate) index: HashMap<Element, NodeIndex>,
    pub(crate) costs: EdgeCosts,
}

impl SchemaGraph {
    /// Builds the static graph. Operations only reachable through unqualified
    /// primitives, writes, streams and table lookups stay out of the search graph;
    /// the direct and batch strategies cover those.
    pub fn build(schema: &Schema, costs: EdgeCosts) -> Self {
        let mut builder = Self { graph: DiGraph::new(), index: HashMap::new(), costs };

        for ty in schema.types() {
            let type_node = builder.node(Element::Type(ty.name.clone()));
            if !ty.is_model() {
                continue;
            }
            for attribute in &ty.attributes {
                if attribute.type_ref.cardinality != Cardinality::One {
                    continue;
                }
                let member = builder.node(Element::Member { owner: ty.name.clone(), attribute: attribute.name.clone() });
                let attribute_type = builder.node(Element::Type(attribute.type_ref.name.clone()));
                builder.edge(type_node, member, Relationship::HasAttribute);
                builder.edge(member, type_node, Relationship::IsAttributeOf);
                builder.edge(member, attribute_type, Relationship::IsTypeOf);
            }
        }

        let mut parameter_types = HashSet::new();
        for (_, operation) in schema.operations() {
            if !matches!(operation.kind, OperationKind::Read | OperationKind::Query) {
                continue;
            }
            let semantic_params: Vec<_> = operation
                .parameters
                .iter()
                .filter(|p| p.type_ref.cardinality == Cardinality::One && !schema.is_primitive(&p.type_ref.name))
                .collect();
            if semantic_params.is_empty() {
                continue;
            }
            let op_node = builder.node(Element::Operation(operation.qualified_name()));
            for param in semantic_params {
                let param_node = builder.node(Element::Parameter(param.type_ref.name.clone()));
                builder.edge(param_node, op_node, Relationship::IsParameterOn);
                builder.edge(op_node, param_node, Relationship::RequiresParameter);
                parameter_types.insert(param.type_ref.name.clone());
            }
            let returned = builder.node(Element::Type(operation.return_type.name.clone()));
            builder.edge(op_node, returned, Relationship::Provides);
        }

        // Derived types populate parameters declared as any of their ancestors.
        for param_type in &parameter_types {
            let param_node = builder.node(Element::Parameter(param_type.clone()));
            let candidates: Vec<QualifiedName> = schema
                .types()
                .filter(|t| !t.is_primitive() && schema.is_assignable(&t.name, param_type))
                .map(|t| t.name.clone())
                .collect();
            for candidate in candidates {
                let type_node = builder.node(Element::Type(candidate));
                builder.edge(type_node, param_node, Relationship::CanPopulate);
            }
        }

        tracing::debug!(
            "Built schema graph: {} nodes, {} edges",
            builder.graph.node_count(),
            builder.graph.edge_count()
        );
        builder
    }

    fn node(&mut self, element: Element) -> NodeIndex {
        if let Some(index) = self.index.get(&element) {
            return *index;
        }
        let index = self.graph.add_node(element.clone());
        self.index.insert(element, index);
        index
    }

    fn edge(&mut self, from: NodeIndex, to: NodeIndex, relationship: Relationship) -> EdgeIndex {
        let cost = if relationship.is_invocation() { self.costs.invocation } else { self.costs.attribute };
        self.graph.add_edge(from, to, Edge { relationship, cost })
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, element: &Element) -> bool {
        self.index.contains_key(element)
    }

    /// Parameter types an operation needs, read from its REQUIRES_PARAMETER links.
    pub fn required_parameters(&self, operation: &QualifiedName) -> Vec<QualifiedName> {
        let Some(op_node) = self.index.get(&Element::Operation(operation.clone())) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(*op_node, Direction::Outgoing)
            .filter(|e| e.weight().relationship == Relationship::RequiresParameter)
            .filter_map(|e| match &self.graph[e.target()] {
                Element::Parameter(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Clones the static graph and adds one node per fact. Object facts also get
    /// a member node for every populated attribute.
    pub fn with_instances(&self, schema: &Schema, facts: &[TypedInstance]) -> QueryGraph {
        let mut graph = self.clone();
        for (i, fact) in facts.iter().enumerate() {
            if fact.is_null() || fact.is_collection() {
                continue;
            }
            let instance = graph.node(Element::TypeInstance(i));
            let type_node = graph.node(Element::Type(fact.type_name().clone()));
            graph.edge(instance, type_node, Relationship::IsInstanceOf);

            if let InstanceValue::Object(fields) = &fact.value {
                for (name, value) in fields {
                    if value.is_null() || value.is_collection() || schema.is_primitive(value.type_name()) {
                        continue;
                    }
                    let member = graph.node(Element::ProvidedInstanceMember { instance: i, attribute: name.clone() });
                    let member_type = graph.node(Element::Type(value.type_name().clone()));
                    graph.edge(instance, member, Relationship::HasAttribute);
                    graph.edge(member, member_type, Relationship::IsTypeOf);
                }
            }
        }
        QueryGraph { inner: graph, fact_count: facts.len() }
    }
}

/// A schema graph plus the instance layer for one discovery.
#[derive(Debug, Clone)]
pub struct QueryGraph {
    pub(crate) inner: SchemaGraph,
    fact_count: usize,
}

impl QueryGraph {
    pub fn element(&self, node: NodeIndex) -> &Element {
        &self.inner.graph[node]
    }

    pub fn edge(&self, edge: EdgeIndex) -> Option<(NodeIndex, NodeIndex, Edge)> {
        let (from, to) = self.inner.graph.edge_endpoints(edge)?;
        Some((from, to, self.inner.graph[edge]))
    }

    pub fn instance_nodes(&self) -> Vec<NodeIndex> {
        (0..self.fact_count)
            .filter_map(|i| self.inner.index.get(&Element::TypeInstance(i)).copied())
            .collect()
    }

    /// Type nodes whose values satisfy a request for `target`.
    pub fn goal_nodes(&self, schema: &Schema, target: &QualifiedName) -> HashSet<NodeIndex> {
        self.inner
            .index
            .iter()
            .filter_map(|(element, index)| match element {
                Element::Type(name) if schema.is_assignable(name, target) => Some(*index),
                _ => None,
            })
            .collect()
    }

    pub fn required_parameters(&self, operation: &QualifiedName) -> Vec<QualifiedName> {
        self.inner.required_parameters(operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vantage_common::{Attribute, DataSourceId, Operation, Parameter, PrimitiveKind, Service, Type, TypeRef};

    fn costs() -> EdgeCosts {
        EdgeCosts { attribute: 1, invocation: 10 }
    }

    fn schema() -> Schema {
        Schema::new(
            vec![
                Type::scalar("FilmId", PrimitiveKind::Int),
                Type::scalar("ImdbId", PrimitiveKind::Int).inheriting("FilmId"),
                Type::model("Film", vec![Attribute::new("id", TypeRef::one("FilmId")).identity()]),
            ],
            vec![Service::new(
                "FilmService",
                vec![
                    Operation::new("getFilm", vec![Parameter::new("id", TypeRef::one("FilmId"))], TypeRef::one("Film")),
                    Operation::new("search", vec![Parameter::new("q", TypeRef::one("lang.String"))], TypeRef::many("Film")),
                    Operation::new("all", vec![], TypeRef::many("Film")),
                ],
            )],
        )
    }

    #[test]
    fn test_primitive_only_operations_are_excluded() {
        let graph = SchemaGraph::build(&schema(), costs());
        assert!(graph.contains(&Element::Operation("FilmService::getFilm".into())));
        assert!(!graph.contains(&Element::Operation("FilmService::search".into())));
        assert!(!graph.contains(&Element::Operation("FilmService::all".into())));
    }

    #[test]
    fn test_derived_types_populate_ancestor_parameters() {
        let graph = SchemaGraph::build(&schema(), costs());
        let imdb = graph.index[&Element::Type("ImdbId".into())];
        let param = graph.index[&Element::Parameter("FilmId".into())];
        assert!(graph.graph.find_edge(imdb, param).is_some());
        assert_eq!(graph.required_parameters(&"FilmService::getFilm".into()), vec![QualifiedName::from("FilmId")]);
    }

    #[test]
    fn test_instance_layer_is_not_shared() {
        let schema = schema();
        let graph = SchemaGraph::build(&schema, costs());
        let before = graph.node_count();
        let fact = TypedInstance::scalar("FilmId", 1, DataSourceId::PROVIDED);
        let query_graph = graph.with_instances(&schema, &[fact]);
        assert_eq!(query_graph.instance_nodes().len(), 1);
        assert_eq!(graph.node_count(), before);
    }
}
