use thiserror::Error;

/// Errors surfaced to query callers.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueryError {
    #[error("no path could be found to type {type_name}")]
    UnresolvedType { type_name: String },

    #[error("operation {operation} failed: {message}")]
    OperationInvocationFailure { operation: String, message: String },

    #[error("failed to evaluate {expression}: {message}")]
    ExpressionEvaluationFailure { expression: String, message: String },

    #[error("missing argument: {name}")]
    MissingArgument { name: String },

    #[error("unknown type: {type_name}")]
    UnknownType { type_name: String },

    #[error("unknown operation: {operation}")]
    UnknownOperation { operation: String },

    #[error("invalid value for {type_name}: {message}")]
    InvalidValue { type_name: String, message: String },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("query cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl QueryError {
    pub fn unresolved(type_name: impl ToString) -> Self {
        QueryError::UnresolvedType { type_name: type_name.to_string() }
    }
}

/// Failure reported by an operation invoker.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct InvocationError {
    pub status: Option<u16>,
    pub message: String,
}

impl InvocationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { status: None, message: message.into() }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self { status: Some(status), message: message.into() }
    }
}
