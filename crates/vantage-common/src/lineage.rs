// Lineage: every produced value points at a DataSource entry in a per-query arena.
// Entries only ever reference ids allocated before them, so the graph is acyclic.

use crate::schema::QualifiedName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataSourceId(u32);

impl DataSourceId {
    pub const PROVIDED: DataSourceId = DataSourceId(0);
    pub const DEFINED_IN_SCHEMA: DataSourceId = DataSourceId(1);
    pub const MIXED: DataSourceId = DataSourceId(2);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallStatus {
    Success,
    Failed { code: Option<u16>, message: String },
}

/// The wire-level record of a remote operation invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCall {
    pub service: QualifiedName,
    pub operation: String,
    pub address: String,
    pub method: String,
    pub request: serde_json::Value,
    pub response: Option<serde_json::Value>,
    pub duration_ms: u64,
    pub status: CallStatus,
    pub timestamp: DateTime<Utc>,
}

impl RemoteCall {
    pub fn is_success(&self) -> bool {
        self.status == CallStatus::Success
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationInput {
    pub name: String,
    pub value: serde_json::Value,
    pub source: DataSourceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynonymMapping {
    pub from_type: QualifiedName,
    pub from_value: String,
    pub to_type: QualifiedName,
    pub to_value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataSource {
    Provided,
    DefinedInSchema,
    /// Values assembled from several sources (e.g. a built object).
    Mixed,
    OperationResult {
        operation: QualifiedName,
        inputs: Vec<OperationInput>,
        call: RemoteCall,
    },
    EvaluatedExpression {
        expression: String,
        inputs: Vec<DataSourceId>,
    },
    FailedEvaluatedExpression {
        expression: String,
        inputs: Vec<DataSourceId>,
        error: String,
    },
    MappedSynonym {
        mapping: SynonymMapping,
        source: DataSourceId,
    },
    FailedSearch {
        message: String,
        attempts: Vec<DataSourceId>,
    },
}

impl DataSource {
    pub fn upstream(&self) -> Vec<DataSourceId> {
        match self {
            DataSource::OperationResult { inputs, .. } => inputs.iter().map(|i| i.source).collect(),
            DataSource::EvaluatedExpression { inputs, .. } | DataSource::FailedEvaluatedExpression { inputs, .. } => {
                inputs.clone()
            }
            DataSource::MappedSynonym { source, .. } => vec![*source],
            DataSource::FailedSearch { attempts, .. } => attempts.clone(),
            DataSource::Provided | DataSource::DefinedInSchema | DataSource::Mixed => Vec::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DataSource::Provided => "Provided",
            DataSource::DefinedInSchema => "DefinedInSchema",
            DataSource::Mixed => "Mixed",
            DataSource::OperationResult { .. } => "OperationResult",
            DataSource::EvaluatedExpression { .. } => "EvaluatedExpression",
            DataSource::FailedEvaluatedExpression { .. } => "FailedEvaluatedExpression",
            DataSource::MappedSynonym { .. } => "MappedSynonym",
            DataSource::FailedSearch { .. } => "FailedSearch",
        }
    }
}

/// Append-only store of lineage entries for one query.
#[derive(Debug)]
pub struct LineageArena {
    entries: RwLock<Vec<DataSource>>,
}

impl Default for LineageArena {
    fn default() -> Self {
        Self::new()
    }
}

impl LineageArena {
    pub fn new() -> Self {
        Self { entries: RwLock::new(vec![DataSource::Provided, DataSource::DefinedInSchema, DataSource::Mixed]) }
    }

    /// Appends `source` and returns its id. Upstream references to ids not yet
    /// allocated are dropped so the arena never contains a forward edge.
    pub fn record(&self, source: DataSource) -> DataSourceId {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let next = entries.len() as u32;
        let source = match source {
            DataSource::EvaluatedExpression { expression, inputs } => DataSource::EvaluatedExpression {
                expression,
                inputs: inputs.into_iter().filter(|i| i.0 < next).collect(),
            },
            DataSource::FailedEvaluatedExpression { expression, inputs, error } => {
                DataSource::FailedEvaluatedExpression {
                    expression,
                    inputs: inputs.into_iter().filter(|i| i.0 < next).collect(),
                    error,
                }
            }
            DataSource::FailedSearch { message, attempts } => {
                DataSource::FailedSearch { message, attempts: attempts.into_iter().filter(|i| i.0 < next).collect() }
            }
            other => other,
        };
        entries.push(source);
        DataSourceId(next)
    }

    pub fn get(&self, id: DataSourceId) -> Option<DataSource> {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).get(id.index()).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every entry reachable from `id`, `id` first.
    pub fn walk(&self, id: DataSourceId) -> Vec<DataSourceId> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(entry) = entries.get(current.index()) {
                queue.extend(entry.upstream());
            }
            order.push(current);
        }
        order
    }

    /// The remote calls that contributed to `id`, in discovery order.
    pub fn remote_calls(&self, id: DataSourceId) -> Vec<RemoteCall> {
        self.walk(id)
            .into_iter()
            .filter_map(|i| match self.get(i) {
                Some(DataSource::OperationResult { call, .. }) => Some(call),
                _ => None,
            })
            .collect()
    }

    pub fn snapshot(&self) -> Vec<DataSource> {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_walk() {
        let arena = LineageArena::new();
        let expr = arena.record(DataSource::EvaluatedExpression {
            expression: "a + b".to_string(),
            inputs: vec![DataSourceId::PROVIDED],
        });
        let failed = arena.record(DataSource::FailedSearch { message: "nope".to_string(), attempts: vec![expr] });
        assert_eq!(arena.walk(failed), vec![failed, expr, DataSourceId::PROVIDED]);
    }

    #[test]
    fn test_forward_references_are_dropped() {
        let arena = LineageArena::new();
        let id = arena.record(DataSource::FailedSearch {
            message: "x".to_string(),
            attempts: vec![DataSourceId::new(99)],
        });
        assert!(arena.get(id).expect("entry").upstream().is_empty());
    }
}
