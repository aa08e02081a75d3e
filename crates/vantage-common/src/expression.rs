// Expression tree used by calculated attributes, projection fields and `when` blocks.

use crate::instance::Scalar;
use crate::schema::TypeRef;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterThanOrEqual => ">=",
            BinaryOp::LessThan => "<",
            BinaryOp::LessThanOrEqual => "<=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionOp {
    Map,
    FilterAll,
    Single,
    SingleBy,
}

impl CollectionOp {
    fn name(&self) -> &'static str {
        match self {
            CollectionOp::Map => "map",
            CollectionOp::FilterAll => "filterAll",
            CollectionOp::Single => "single",
            CollectionOp::SingleBy => "singleBy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lambda {
    pub param: String,
    pub body: Box<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhenCase {
    /// `None` marks the `else` branch.
    pub condition: Option<Expr>,
    pub result: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Scalar),
    Null,
    /// A type reference resolves to a fact of that type, discovering it if needed.
    Type(TypeRef),
    /// `scope.a.b` or, with no scope, an attribute of `this`.
    Path { scope: Option<String>, path: Vec<String> },
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
    Not(Box<Expr>),
    Call { function: String, args: Vec<Expr> },
    When(Vec<WhenCase>),
    Collection {
        op: CollectionOp,
        source: Box<Expr>,
        lambda: Lambda,
        /// The key compared by `singleBy`.
        key: Option<Box<Expr>>,
    },
}

impl Expr {
    pub fn literal(value: impl Into<Scalar>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn type_ref(name: &str) -> Self {
        Expr::Type(TypeRef::one(name))
    }

    pub fn attr(name: &str) -> Self {
        Expr::Path { scope: None, path: vec![name.to_string()] }
    }

    pub fn scoped(scope: &str, path: &[&str]) -> Self {
        Expr::Path { scope: Some(scope.to_string()), path: path.iter().map(|p| p.to_string()).collect() }
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary { op, left: Box::new(left), right: Box::new(right) }
    }

    pub fn call(function: &str, args: Vec<Expr>) -> Self {
        Expr::Call { function: function.to_string(), args }
    }

    pub fn not(inner: Expr) -> Self {
        Expr::Not(Box::new(inner))
    }

    pub fn collection(op: CollectionOp, source: Expr, param: &str, body: Expr) -> Self {
        Expr::Collection {
            op,
            source: Box::new(source),
            lambda: Lambda { param: param.to_string(), body: Box::new(body) },
            key: None,
        }
    }

    pub fn single_by(source: Expr, param: &str, body: Expr, key: Expr) -> Self {
        Expr::Collection {
            op: CollectionOp::SingleBy,
            source: Box::new(source),
            lambda: Lambda { param: param.to_string(), body: Box::new(body) },
            key: Some(Box::new(key)),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(s) => write!(f, "{}", s),
            Expr::Null => write!(f, "null"),
            Expr::Type(t) => write!(f, "{}", t),
            Expr::Path { scope, path } => match scope {
                Some(scope) => write!(f, "{}.{}", scope, path.join(".")),
                None => write!(f, "{}", path.join(".")),
            },
            Expr::Binary { op, left, right } => write!(f, "({} {} {})", left, op.symbol(), right),
            Expr::Not(inner) => write!(f, "!{}", inner),
            Expr::Call { function, args } => {
                let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                write!(f, "{}({})", function, args.join(", "))
            }
            Expr::When(cases) => {
                write!(f, "when {{")?;
                for case in cases {
                    match &case.condition {
                        Some(c) => write!(f, " {} -> {};", c, case.result)?,
                        None => write!(f, " else -> {};", case.result)?,
                    }
                }
                write!(f, " }}")
            }
            Expr::Collection { op, source, lambda, key } => {
                write!(f, "{}.{}(({}) -> {}", source, op.name(), lambda.param, lambda.body)?;
                if let Some(key) = key {
                    write!(f, ", {}", key)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_renders_source_text() {
        let expr = Expr::binary(BinaryOp::Add, Expr::attr("price"), Expr::literal(1));
        assert_eq!(expr.to_string(), "(price + 1)");
        let mapped = Expr::collection(CollectionOp::Map, Expr::attr("films"), "f", Expr::scoped("f", &["title"]));
        assert_eq!(mapped.to_string(), "films.map((f) -> f.title)");
    }
}
