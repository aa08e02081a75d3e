// Function registry for calculated fields. Arguments arrive already evaluated;
// a null argument is `None`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use vantage_common::Scalar;

pub type FunctionResult = Result<Option<Scalar>, String>;

type Function = Arc<dyn Fn(&[Option<Scalar>]) -> FunctionResult + Send + Sync>;

pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, Function>>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        let registry = Self { functions: RwLock::new(HashMap::new()) };
        registry.register("concat", concat);
        registry.register("upper", |args| map_text(args, "upper", |s| s.to_uppercase()));
        registry.register("lower", |args| map_text(args, "lower", |s| s.to_lowercase()));
        registry.register("length", length);
        registry.register("coalesce", |args| Ok(args.iter().flatten().next().cloned()));
        registry.register("abs", abs);
        registry
    }
}

impl FunctionRegistry {
    pub fn register<F>(&self, name: &str, function: F)
    where
        F: Fn(&[Option<Scalar>]) -> FunctionResult + Send + Sync + 'static,
    {
        self.functions.write().unwrap_or_else(|e| e.into_inner()).insert(name.to_string(), Arc::new(function));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.read().unwrap_or_else(|e| e.into_inner()).contains_key(name)
    }

    pub fn call(&self, name: &str, args: &[Option<Scalar>]) -> FunctionResult {
        let function = self
            .functions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| format!("unknown function '{}'", name))?;
        function(args)
    }
}

/// Text form without the quoting `Display` adds.
pub fn plain_text(value: &Scalar) -> String {
    match value {
        Scalar::Text(s) => s.clone(),
        other => other.to_string(),
    }
}

fn concat(args: &[Option<Scalar>]) -> FunctionResult {
    Ok(Some(Scalar::Text(args.iter().flatten().map(plain_text).collect())))
}

fn map_text(args: &[Option<Scalar>], name: &str, f: impl Fn(&str) -> String) -> FunctionResult {
    match args {
        [None] => Ok(None),
        [Some(value)] => Ok(Some(Scalar::Text(f(&plain_text(value))))),
        _ => Err(format!("{} expects one argument, got {}", name, args.len())),
    }
}

fn length(args: &[Option<Scalar>]) -> FunctionResult {
    match args {
        [None] => Ok(None),
        [Some(value)] => Ok(Some(Scalar::Int(plain_text(value).chars().count() as i64))),
        _ => Err(format!("length expects one argument, got {}", args.len())),
    }
}

fn abs(args: &[Option<Scalar>]) -> FunctionResult {
    match args {
        [None] => Ok(None),
        [Some(Scalar::Int(i))] => i.checked_abs().map(|v| Some(Scalar::Int(v))).ok_or_else(|| "abs overflow".to_string()),
        [Some(Scalar::Decimal(d))] => Ok(Some(Scalar::Decimal(d.abs()))),
        [Some(other)] => Err(format!("abs expects a number, got {}", other)),
        _ => Err(format!("abs expects one argument, got {}", args.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins() {
        let registry = FunctionRegistry::default();
        let text = |s: &str| Some(Scalar::Text(s.into()));

        assert_eq!(registry.call("concat", &[text("a"), None, Some(Scalar::Int(1))]), Ok(text("a1")));
        assert_eq!(registry.call("upper", &[text("abc")]), Ok(text("ABC")));
        assert_eq!(registry.call("length", &[None]), Ok(None));
        assert_eq!(registry.call("coalesce", &[None, text("x")]), Ok(text("x")));
        assert_eq!(registry.call("abs", &[Some(Scalar::Int(-4))]), Ok(Some(Scalar::Int(4))));
        assert!(registry.call("abs", &[text("x")]).is_err());
        assert!(registry.call("missing", &[]).is_err());
    }

    #[test]
    fn test_custom_function() {
        let registry = FunctionRegistry::default();
        registry.register("double", |args| match args {
            [Some(Scalar::Int(i))] => Ok(Some(Scalar::Int(i * 2))),
            _ => Err("double expects an int".into()),
        });
        assert!(registry.contains("double"));
        assert_eq!(registry.call("double", &[Some(Scalar::Int(21))]), Ok(Some(Scalar::Int(42))));
    }
}
