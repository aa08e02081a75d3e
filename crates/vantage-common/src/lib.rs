// Shared model for the Vantage query engine: schema, typed instances, lineage,
// compiled queries and configuration.

pub mod config;
pub mod error;
pub mod expression;
pub mod instance;
pub mod lineage;
pub mod query;
pub mod schema;

pub use config::EngineConfig;
pub use error::{InvocationError, QueryError};
pub use expression::{BinaryOp, CollectionOp, Expr, Lambda, WhenCase};
pub use instance::{InstanceValue, Scalar, TypedInstance};
pub use lineage::{
    CallStatus, DataSource, DataSourceId, LineageArena, OperationInput, RemoteCall, SynonymMapping,
};
pub use query::{
    Directive, FieldSource, FieldSpec, GivenClause, GivenValue, OperationReference, Projection,
    ProjectionTarget, Query, Shape, TargetSpec,
};
pub use schema::{
    Attribute, Cardinality, ComparisonOperator, ConstraintValue, EnumSynonym, EnumValue, Operation,
    OperationKind, Parameter, PrimitiveKind, PropertyConstraint, PropertyRef, QualifiedName, Schema,
    Service, Type, TypeKind, TypeRef,
};
