//! Expression language for placeholders
//!
//! A deliberately small grammar: literals, paths, indexing, arithmetic,
//! comparisons, logic, ternaries and calls to whitelisted functions.
//! Results are `Option<Value>` where `None` is "undefined".

mod eval;
mod lexer;
mod parser;

use serde_json::{Number, Value};
use thiserror::Error;

pub use eval::{Builtin, Evaluator, Scope};
pub use parser::{parse, BinaryOp, Expr, UnaryOp};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExprError {
    #[error("Unexpected character at {0}")]
    Lex(usize),

    #[error("Unexpected {found}, expected {expected}")]
    Syntax { found: String, expected: String },

    #[error("Cannot read `{property}` of {base}")]
    NullAccess { property: String, base: &'static str },

    #[error("Unknown function `{0}`")]
    UnknownFunction(String),

    #[error("Function `{name}`: {message}")]
    Call { name: String, message: String },
}

/// JavaScript-flavoured truthiness.
pub fn is_truthy(value: &Option<Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

/// String form used when splicing a value into text.
pub fn display(value: &Option<Value>) -> String {
    match value {
        None => "undefined".to_string(),
        Some(value) => display_value(value),
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(display_value).collect::<Vec<_>>().join(","),
        Value::Object(_) => value.to_string(),
    }
}

/// Build a JSON number, keeping integral results integral so `1+1` prints `2`.
pub fn number(f: f64) -> Value {
    if f.fract() == 0.0 && f.is_finite() && f.abs() < i64::MAX as f64 {
        Value::from(f as i64)
    } else {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Numeric coercion; `NaN` when the value has no numeric reading.
pub fn to_number(value: &Option<Value>) -> f64 {
    match value {
        None => f64::NAN,
        Some(Value::Null) => 0.0,
        Some(Value::Bool(b)) => f64::from(u8::from(*b)),
        Some(Value::Number(n)) => n.as_f64().unwrap_or(f64::NAN),
        Some(Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() { 0.0 } else { s.parse().unwrap_or(f64::NAN) }
        }
        Some(Value::Array(_)) | Some(Value::Object(_)) => f64::NAN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&None));
        assert!(!is_truthy(&Some(Value::Null)));
        assert!(!is_truthy(&Some(json!(0))));
        assert!(!is_truthy(&Some(json!(""))));
        assert!(is_truthy(&Some(json!([]))));
        assert!(is_truthy(&Some(json!("false"))));
    }

    #[test]
    fn test_display() {
        assert_eq!(display(&None), "undefined");
        assert_eq!(display(&Some(Value::Null)), "null");
        assert_eq!(display(&Some(json!(["a", 1]))), "a,1");
        assert_eq!(display(&Some(number(2.0))), "2");
        assert_eq!(display(&Some(number(2.5))), "2.5");
    }
}
