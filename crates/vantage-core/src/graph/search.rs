// Cost-ordered path search from known facts to a requested type.

use super::builder::QueryGraph;
use super::element::Element;
use petgraph::graph::{EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use vantage_common::QualifiedName;

/// Edges and operations a search must not use.
#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    pub operations: HashSet<QualifiedName>,
    pub services: HashSet<QualifiedName>,
    pub edges: HashSet<EdgeIndex>,
}

impl Exclusions {
    fn blocks(&self, graph: &QueryGraph, edge: EdgeIndex, target: NodeIndex) -> bool {
        if self.edges.contains(&edge) {
            return true;
        }
        match graph.element(target) {
            Element::Operation(name) => {
                self.operations.contains(name)
                    || self.services.iter().any(|s| name.as_str().starts_with(&format!("{}::", s)))
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPath {
    pub start: NodeIndex,
    pub edges: Vec<EdgeIndex>,
    pub cost: u32,
}

/// Identity of a path for collapsing equivalent routes: the operations it
/// invokes, or the raw edges when it invokes none.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSignature {
    Invocations(Vec<QualifiedName>),
    Navigation(Vec<EdgeIndex>),
}

impl SearchPath {
    pub fn operations(&self, graph: &QueryGraph) -> Vec<QualifiedName> {
        self.edges
            .iter()
            .filter_map(|e| graph.edge(*e))
            .filter(|(_, _, edge)| edge.relationship.is_invocation())
            .filter_map(|(_, to, _)| match graph.element(to) {
                Element::Operation(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn signature(&self, graph: &QueryGraph) -> PathSignature {
        let operations = self.operations(graph);
        if operations.is_empty() {
            PathSignature::Navigation(self.edges.clone())
        } else {
            PathSignature::Invocations(operations)
        }
    }

    pub fn first_invocation(&self, graph: &QueryGraph) -> Option<EdgeIndex> {
        self.edges
            .iter()
            .copied()
            .find(|e| graph.edge(*e).map_or(false, |(_, _, edge)| edge.relationship.is_invocation()))
    }

    pub fn describe(&self, graph: &QueryGraph) -> String {
        let mut parts = vec![graph.element(self.start).to_string()];
        for edge in &self.edges {
            if let Some((_, to, weight)) = graph.edge(*edge) {
                parts.push(format!("-[{}]-> {}", weight.relationship, graph.element(to)));
            }
        }
        parts.join(" ")
    }
}

/// Multi-source Dijkstra. Stops at the first goal popped from the frontier;
/// ties break on insertion order so results are stable for a given graph.
pub fn shortest_path(
    graph: &QueryGraph,
    sources: &[NodeIndex],
    goals: &HashSet<NodeIndex>,
    exclusions: &Exclusions,
) -> Option<SearchPath> {
    let mut distance: HashMap<NodeIndex, u32> = HashMap::new();
    let mut predecessor: HashMap<NodeIndex, (NodeIndex, EdgeIndex)> = HashMap::new();
    let mut origin: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut heap = BinaryHeap::new();
    let mut sequence = 0u64;

    for source in sources {
        distance.insert(*source, 0);
        origin.insert(*source, *source);
        heap.push(Reverse((0u32, sequence, *source)));
        sequence += 1;
    }

    while let Some(Reverse((cost, _, node))) = heap.pop() {
        if distance.get(&node).map_or(false, |best| cost > *best) {
            continue;
        }
        // A source that is itself a goal is a fact, not a path.
        if goals.contains(&node) && predecessor.contains_key(&node) {
            let mut edges = Vec::new();
            let mut current = node;
            while let Some((previous, edge)) = predecessor.get(&current) {
                edges.push(*edge);
                current = *previous;
            }
            edges.reverse();
            return Some(SearchPath { start: origin.get(&node).copied().unwrap_or(current), edges, cost });
        }

        for edge in graph.inner.graph.edges_directed(node, Direction::Outgoing) {
            let weight = edge.weight();
            if !weight.relationship.is_traversable() || exclusions.blocks(graph, edge.id(), edge.target()) {
                continue;
            }
            let next = edge.target();
            let next_cost = cost + weight.cost;
            if distance.get(&next).map_or(true, |best| next_cost < *best) {
                distance.insert(next, next_cost);
                predecessor.insert(next, (node, edge.id()));
                if let Some(root) = origin.get(&node).copied() {
                    origin.insert(next, root);
                }
                heap.push(Reverse((next_cost, sequence, next)));
                sequence += 1;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::builder::{EdgeCosts, SchemaGraph};
    use vantage_common::{
        Attribute, DataSourceId, Operation, Parameter, PrimitiveKind, Schema, Service, Type, TypeRef,
        TypedInstance,
    };

    fn schema() -> Schema {
        Schema::new(
            vec![
                Type::scalar("FilmId", PrimitiveKind::Int),
                Type::scalar("ReviewText", PrimitiveKind::String),
                Type::model("Review", vec![Attribute::new("text", TypeRef::one("ReviewText"))]),
            ],
            vec![Service::new(
                "ReviewService",
                vec![Operation::new("getReview", vec![Parameter::new("id", TypeRef::one("FilmId"))], TypeRef::one("Review"))],
            )],
        )
    }

    #[test]
    fn test_finds_path_through_invocation() {
        let schema = schema();
        let graph = SchemaGraph::build(&schema, EdgeCosts { attribute: 1, invocation: 10 })
            .with_instances(&schema, &[TypedInstance::scalar("FilmId", 1, DataSourceId::PROVIDED)]);
        let goals = graph.goal_nodes(&schema, &"ReviewText".into());
        let path = shortest_path(&graph, &graph.instance_nodes(), &goals, &Exclusions::default()).expect("path");
        assert_eq!(path.operations(&graph), vec![QualifiedName::from("ReviewService::getReview")]);
        assert_eq!(path.cost, 1 + 1 + 10 + 1 + 1 + 1 + 1);
    }

    #[test]
    fn test_excluded_operation_blocks_path() {
        let schema = schema();
        let graph = SchemaGraph::build(&schema, EdgeCosts { attribute: 1, invocation: 10 })
            .with_instances(&schema, &[TypedInstance::scalar("FilmId", 1, DataSourceId::PROVIDED)]);
        let goals = graph.goal_nodes(&schema, &"Review".into());
        let mut exclusions = Exclusions::default();
        exclusions.operations.insert("ReviewService::getReview".into());
        assert!(shortest_path(&graph, &graph.instance_nodes(), &goals, &exclusions).is_none());
    }

    #[test]
    fn test_excluded_service_blocks_its_operations() {
        let schema = schema();
        let graph = SchemaGraph::build(&schema, EdgeCosts { attribute: 1, invocation: 10 })
            .with_instances(&schema, &[TypedInstance::scalar("FilmId", 1, DataSourceId::PROVIDED)]);
        let goals = graph.goal_nodes(&schema, &"ReviewText".into());
        let mut exclusions = Exclusions::default();
        exclusions.services.insert("Review".into());
        assert!(shortest_path(&graph, &graph.instance_nodes(), &goals, &exclusions).is_some());

        exclusions.services.insert("ReviewService".into());
        assert!(shortest_path(&graph, &graph.instance_nodes(), &goals, &exclusions).is_none());
    }
}
