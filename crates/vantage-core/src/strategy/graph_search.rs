use super::{QueryStrategy, StrategyOutcome};
use crate::constraints::ConstraintEvaluator;
use crate::context::{fit_cardinality, CallOutcome, DiscoveryFrame, DiscoveryTarget, QueryContext};
use crate::facts::FactBag;
use crate::graph::{shortest_path, Element, Exclusions, QueryGraph, Relationship, SearchPath};
use async_trait::async_trait;
use petgraph::graph::EdgeIndex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use vantage_common::{Cardinality, QualifiedName, QueryError, TypeRef, TypedInstance};

/// Cost-ordered search over the schema graph, starting from every known fact.
/// Paths are evaluated edge by edge; a failing edge is excluded and the search
/// re-run until a path succeeds or the attempt budget is spent.
pub struct GraphSearchStrategy;

enum PathOutcome {
    Resolved(TypedInstance),
    Failed(EdgeIndex),
    Aborted(EdgeIndex),
}

enum StepOutcome {
    Value(TypedInstance),
    Failed,
    Aborted,
}

#[async_trait]
impl QueryStrategy for GraphSearchStrategy {
    fn name(&self) -> &'static str {
        "graph"
    }

    async fn try_resolve(
        &self,
        ctx: &Arc<QueryContext>,
        target: &DiscoveryTarget,
        bag: &Arc<FactBag>,
        frame: &DiscoveryFrame,
    ) -> Result<StrategyOutcome, QueryError> {
        let facts: Vec<TypedInstance> = bag.all_facts().into_iter().filter(|f| !f.is_null()).collect();
        if facts.is_empty() {
            return Ok(StrategyOutcome::NotApplicable);
        }
        let graph = ctx.query_graph(&facts);
        let sources = graph.instance_nodes();
        let goals = graph.goal_nodes(&ctx.schema, &target.type_ref.name);
        if sources.is_empty() || goals.is_empty() {
            return Ok(StrategyOutcome::NotApplicable);
        }

        let mut exclusions = Exclusions {
            operations: frame.excluded_operations.clone(),
            services: ctx.excluded_services(),
            ..Default::default()
        };
        let mut evaluated = HashSet::new();
        let mut aborted = false;

        for attempt in 0..ctx.config.graph.max_path_attempts {
            ctx.check_cancelled()?;
            let Some(path) = shortest_path(&graph, &sources, &goals, &exclusions) else {
                break;
            };
            if !evaluated.insert(path.signature(&graph)) {
                // Same operations as a path already tried: rule out its first call.
                match path.first_invocation(&graph).or_else(|| path.edges.last().copied()) {
                    Some(edge) => {
                        exclusions.edges.insert(edge);
                        continue;
                    }
                    None => break,
                }
            }

            tracing::debug!("Path attempt {} for {}: {}", attempt + 1, target.type_ref, path.describe(&graph));
            match evaluate_path(ctx, &graph, &facts, &path, target, bag, frame).await? {
                PathOutcome::Resolved(value) => {
                    bag.add_fact(value.clone());
                    return Ok(StrategyOutcome::single(value));
                }
                PathOutcome::Failed(edge) => {
                    exclusions.edges.insert(edge);
                }
                PathOutcome::Aborted(edge) => {
                    aborted = true;
                    exclusions.edges.insert(edge);
                }
            }
        }

        if aborted {
            return Ok(StrategyOutcome::RecursiveDiscoveryAborted);
        }
        Ok(StrategyOutcome::NotApplicable)
    }
}

async fn evaluate_path(
    ctx: &Arc<QueryContext>,
    graph: &QueryGraph,
    facts: &[TypedInstance],
    path: &SearchPath,
    target: &DiscoveryTarget,
    bag: &Arc<FactBag>,
    frame: &DiscoveryFrame,
) -> Result<PathOutcome, QueryError> {
    let Some(last) = path.edges.last().copied() else {
        return Ok(PathOutcome::Failed(EdgeIndex::end()));
    };
    let mut value = match graph.element(path.start) {
        Element::TypeInstance(i) => match facts.get(*i) {
            Some(fact) => fact.clone(),
            None => return Ok(PathOutcome::Failed(path.edges[0])),
        },
        _ => return Ok(PathOutcome::Failed(path.edges[0])),
    };

    for edge_index in &path.edges {
        let Some((_, to, edge)) = graph.edge(*edge_index) else {
            return Ok(PathOutcome::Failed(*edge_index));
        };
        match edge.relationship {
            Relationship::HasAttribute => {
                let attribute = match graph.element(to) {
                    Element::Member { attribute, .. } | Element::ProvidedInstanceMember { attribute, .. } => attribute,
                    _ => return Ok(PathOutcome::Failed(*edge_index)),
                };
                match value.attribute(attribute) {
                    Some(next) if !next.is_null() => value = next.clone(),
                    _ => return Ok(PathOutcome::Failed(*edge_index)),
                }
            }
            Relationship::IsParameterOn => {
                let Element::Operation(operation) = graph.element(to) else {
                    return Ok(PathOutcome::Failed(*edge_index));
                };
                match invoke_on_path(ctx, graph, operation, value, target, bag, frame).await? {
                    StepOutcome::Value(result) => value = result,
                    StepOutcome::Failed => return Ok(PathOutcome::Failed(*edge_index)),
                    StepOutcome::Aborted => return Ok(PathOutcome::Aborted(*edge_index)),
                }
            }
            _ => {}
        }
    }

    let Some(value) = fit_cardinality(value, &target.type_ref) else {
        return Ok(PathOutcome::Failed(last));
    };
    match ConstraintEvaluator::new(&ctx.schema).filter(value, &target.constraints) {
        Some(value) if !value.is_null() => Ok(PathOutcome::Resolved(value)),
        _ => Ok(PathOutcome::Failed(last)),
    }
}

async fn invoke_on_path(
    ctx: &Arc<QueryContext>,
    graph: &QueryGraph,
    operation_name: &QualifiedName,
    input: TypedInstance,
    target: &DiscoveryTarget,
    bag: &Arc<FactBag>,
    frame: &DiscoveryFrame,
) -> Result<StepOutcome, QueryError> {
    let schema = ctx.schema.clone();
    let Some((service, operation)) = schema.operation(operation_name) else {
        return Ok(StepOutcome::Failed);
    };
    let producing = &target.type_ref.name;

    // An input that is itself waiting on this discovery can never be satisfied.
    for required in graph.required_parameters(operation_name) {
        if schema.is_assignable(input.type_name(), &required) {
            continue;
        }
        let pending = frame.stack.iter().chain(std::iter::once(producing)).any(|t| schema.is_assignable(t, &required));
        if pending && ctx.find_fact(bag, &DiscoveryTarget::of(TypeRef::one(required.clone()))).is_none() {
            tracing::debug!("Abandoning {}: input {} is still being discovered", operation_name, required);
            return Ok(StepOutcome::Aborted);
        }
    }

    let child = frame.nested(producing, operation_name);
    let no_bindings = HashMap::new();
    let mut bound = false;
    let mut parameters = Vec::with_capacity(operation.parameters.len());
    for parameter in &operation.parameters {
        if !bound
            && parameter.type_ref.cardinality == Cardinality::One
            && schema.is_assignable(input.type_name(), &parameter.type_ref.name)
        {
            parameters.push((parameter.clone(), input.clone()));
            bound = true;
            continue;
        }
        match ctx.resolve_parameter(parameter, bag, &child, &no_bindings, true).await? {
            Some(value) => parameters.push((parameter.clone(), value)),
            None => {
                tracing::debug!("No value for parameter {} of {}", parameter.name, operation_name);
                return Ok(StepOutcome::Failed);
            }
        }
    }

    match ctx.invoke(service, operation, parameters).await? {
        CallOutcome::Success { value, .. } if !value.is_null() => {
            bag.add_fact(value.clone());
            Ok(StepOutcome::Value(value))
        }
        CallOutcome::Success { .. } => Ok(StepOutcome::Failed),
        CallOutcome::Failed { error, source } => {
            frame.record_failure(source, error);
            Ok(StepOutcome::Failed)
        }
    }
}
