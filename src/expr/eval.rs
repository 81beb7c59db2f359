//! Expression evaluator
//!
//! Walks the parsed tree against a [`Scope`]. Only functions registered on the
//! [`Evaluator`] are callable.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::rc::Rc;

use super::parser::{parse, BinaryOp, Expr, UnaryOp};
use super::{display, is_truthy, number, to_number, ExprError};

/// Variable lookup for evaluation.
pub trait Scope {
    fn lookup(&self, name: &str) -> Option<Value>;
}

impl Scope for Map<String, Value> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

/// A whitelisted function callable from expressions.
pub type Builtin = Rc<dyn Fn(&[Option<Value>]) -> Result<Option<Value>, ExprError>>;

#[derive(Clone)]
pub struct Evaluator {
    functions: HashMap<String, Builtin>,
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("Evaluator").field("functions", &names).finish()
    }
}

impl Evaluator {
    /// An evaluator without any callable functions.
    pub fn empty() -> Self {
        Self { functions: HashMap::new() }
    }

    pub fn new() -> Self {
        let mut evaluator = Self::empty();
        evaluator.register_fn("len", |args| {
            Ok(match arg(args, 0) {
                Some(Value::String(s)) => Some(Value::from(s.chars().count())),
                Some(Value::Array(items)) => Some(Value::from(items.len())),
                Some(Value::Object(map)) => Some(Value::from(map.len())),
                _ => Some(Value::from(0)),
            })
        });
        evaluator.register_fn("upper", |args| {
            Ok(Some(Value::String(display(&arg(args, 0).cloned()).to_uppercase())))
        });
        evaluator.register_fn("lower", |args| {
            Ok(Some(Value::String(display(&arg(args, 0).cloned()).to_lowercase())))
        });
        evaluator.register_fn("trim", |args| {
            Ok(Some(Value::String(display(&arg(args, 0).cloned()).trim().to_string())))
        });
        evaluator.register_fn("join", |args| {
            let separator = arg(args, 1).map_or(",".to_string(), |s| display(&Some(s.clone())));
            match arg(args, 0) {
                Some(Value::Array(items)) => Ok(Some(Value::String(
                    items
                        .iter()
                        .map(|item| display(&Some(item.clone())))
                        .collect::<Vec<_>>()
                        .join(&separator),
                ))),
                _ => Err(call_error("join", "first argument must be an array")),
            }
        });
        evaluator.register_fn("keys", |args| match arg(args, 0) {
            Some(Value::Object(map)) => Ok(Some(Value::Array(
                map.keys().cloned().map(Value::String).collect(),
            ))),
            _ => Ok(Some(Value::Array(Vec::new()))),
        });
        evaluator.register_fn("contains", |args| {
            let needle = args.get(1).cloned().flatten();
            let found = match (arg(args, 0), &needle) {
                (Some(Value::String(hay)), Some(needle)) => hay.contains(&display(&Some(needle.clone()))),
                (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                (Some(Value::Object(map)), Some(Value::String(key))) => map.contains_key(key),
                _ => false,
            };
            Ok(Some(Value::Bool(found)))
        });
        evaluator.register_fn("json", |args| {
            let value = arg(args, 0).cloned().unwrap_or(Value::Null);
            Ok(Some(Value::String(value.to_string())))
        });
        evaluator.register_fn("string", |args| {
            Ok(Some(Value::String(display(&args.first().cloned().flatten()))))
        });
        evaluator.register_fn("number", |args| {
            Ok(Some(number(to_number(&args.first().cloned().flatten()))))
        });
        evaluator.register_fn("defined", |args| {
            Ok(Some(Value::Bool(matches!(args.first(), Some(Some(_))))))
        });
        evaluator
    }

    /// Register a function; a later registration under the same name wins.
    pub fn register_fn(
        &mut self,
        name: impl Into<String>,
        f: impl Fn(&[Option<Value>]) -> Result<Option<Value>, ExprError> + 'static,
    ) {
        self.functions.insert(name.into(), Rc::new(f));
    }

    pub fn has_fn(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Parse and evaluate `source` against `scope`.
    pub fn evaluate(&self, source: &str, scope: &dyn Scope) -> Result<Option<Value>, ExprError> {
        let expr = parse(source)?;
        self.eval(&expr, scope)
    }

    pub fn eval(&self, expr: &Expr, scope: &dyn Scope) -> Result<Option<Value>, ExprError> {
        match expr {
            Expr::Literal(value) => Ok(Some(value.clone())),
            Expr::Undefined => Ok(None),
            Expr::Ident(name) => Ok(scope.lookup(name)),
            Expr::Member(base, property) => {
                let base = self.eval(base, scope)?;
                member(base, property)
            }
            Expr::Index(base, index) => {
                let base = self.eval(base, scope)?;
                let index = self.eval(index, scope)?;
                indexed(base, index)
            }
            Expr::Call(name, args) => {
                let f = self
                    .functions
                    .get(name)
                    .ok_or_else(|| ExprError::UnknownFunction(name.clone()))?;
                let args = args
                    .iter()
                    .map(|a| self.eval(a, scope))
                    .collect::<Result<Vec<_>, _>>()?;
                f(&args)
            }
            Expr::Unary(op, operand) => {
                let value = self.eval(operand, scope)?;
                Ok(Some(match op {
                    UnaryOp::Not => Value::Bool(!is_truthy(&value)),
                    UnaryOp::Neg => number(-to_number(&value)),
                }))
            }
            Expr::Binary(op, left, right) => self.eval_binary(*op, left, right, scope),
            Expr::Ternary(cond, then, otherwise) => {
                if is_truthy(&self.eval(cond, scope)?) {
                    self.eval(then, scope)
                } else {
                    self.eval(otherwise, scope)
                }
            }
            Expr::Array(items) => {
                let items = items
                    .iter()
                    .map(|item| Ok(self.eval(item, scope)?.unwrap_or(Value::Null)))
                    .collect::<Result<Vec<_>, ExprError>>()?;
                Ok(Some(Value::Array(items)))
            }
            Expr::Object(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    // undefined members are dropped, as JSON.stringify would
                    if let Some(value) = self.eval(value, scope)? {
                        map.insert(key.clone(), value);
                    }
                }
                Ok(Some(Value::Object(map)))
            }
        }
    }

    fn eval_binary(
        &self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        scope: &dyn Scope,
    ) -> Result<Option<Value>, ExprError> {
        // Short-circuit for and/or/??
        match op {
            BinaryOp::And => {
                let left = self.eval(left, scope)?;
                return if is_truthy(&left) { self.eval(right, scope) } else { Ok(left) };
            }
            BinaryOp::Or => {
                let left = self.eval(left, scope)?;
                return if is_truthy(&left) { Ok(left) } else { self.eval(right, scope) };
            }
            BinaryOp::Nullish => {
                let left = self.eval(left, scope)?;
                return match left {
                    None | Some(Value::Null) => self.eval(right, scope),
                    defined => Ok(defined),
                };
            }
            _ => {}
        }

        let left = self.eval(left, scope)?;
        let right = self.eval(right, scope)?;

        Ok(Some(match op {
            BinaryOp::Add => {
                if is_textual(&left) || is_textual(&right) {
                    Value::String(format!("{}{}", display(&left), display(&right)))
                } else {
                    number(to_number(&left) + to_number(&right))
                }
            }
            BinaryOp::Sub => number(to_number(&left) - to_number(&right)),
            BinaryOp::Mul => number(to_number(&left) * to_number(&right)),
            BinaryOp::Div => number(to_number(&left) / to_number(&right)),
            BinaryOp::Rem => number(to_number(&left) % to_number(&right)),
            BinaryOp::Eq => Value::Bool(loose_eq(&left, &right)),
            BinaryOp::Ne => Value::Bool(!loose_eq(&left, &right)),
            BinaryOp::StrictEq => Value::Bool(strict_eq(&left, &right)),
            BinaryOp::StrictNe => Value::Bool(!strict_eq(&left, &right)),
            BinaryOp::Lt => Value::Bool(compare(&left, &right, |o| o.is_lt())),
            BinaryOp::Le => Value::Bool(compare(&left, &right, |o| o.is_le())),
            BinaryOp::Gt => Value::Bool(compare(&left, &right, |o| o.is_gt())),
            BinaryOp::Ge => Value::Bool(compare(&left, &right, |o| o.is_ge())),
            BinaryOp::And | BinaryOp::Or | BinaryOp::Nullish => unreachable!("short-circuited above"),
        }))
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn arg(args: &[Option<Value>], index: usize) -> Option<&Value> {
    args.get(index).and_then(|a| a.as_ref())
}

fn call_error(name: &str, message: &str) -> ExprError {
    ExprError::Call {
        name: name.to_string(),
        message: message.to_string(),
    }
}

fn is_textual(value: &Option<Value>) -> bool {
    matches!(value, Some(Value::String(_)) | Some(Value::Array(_)) | Some(Value::Object(_)))
}

fn member(base: Option<Value>, property: &str) -> Result<Option<Value>, ExprError> {
    match base {
        None => Err(ExprError::NullAccess {
            property: property.to_string(),
            base: "undefined",
        }),
        Some(Value::Null) => Err(ExprError::NullAccess {
            property: property.to_string(),
            base: "null",
        }),
        Some(Value::Object(mut map)) => Ok(map.remove(property)),
        Some(Value::Array(items)) if property == "length" => Ok(Some(Value::from(items.len()))),
        Some(Value::String(s)) if property == "length" => Ok(Some(Value::from(s.chars().count()))),
        Some(_) => Ok(None),
    }
}

fn indexed(base: Option<Value>, index: Option<Value>) -> Result<Option<Value>, ExprError> {
    match (base, index) {
        (Some(Value::Array(mut items)), Some(Value::Number(n))) => {
            let position = n.as_f64().unwrap_or(-1.0);
            if position >= 0.0 && (position as usize) < items.len() {
                Ok(Some(items.swap_remove(position as usize)))
            } else {
                Ok(None)
            }
        }
        (Some(Value::String(s)), Some(Value::Number(n))) => Ok(n
            .as_u64()
            .and_then(|i| s.chars().nth(i as usize))
            .map(|c| Value::String(c.to_string()))),
        (base, Some(Value::String(key))) => member(base, &key),
        (base, index) => member(base, &display(&index)),
    }
}

fn loose_eq(left: &Option<Value>, right: &Option<Value>) -> bool {
    match (left, right) {
        (None | Some(Value::Null), None | Some(Value::Null)) => true,
        (None | Some(Value::Null), _) | (_, None | Some(Value::Null)) => false,
        (Some(Value::String(a)), Some(Value::String(b))) => a == b,
        (Some(Value::Number(_)), _)
        | (_, Some(Value::Number(_)))
        | (Some(Value::Bool(_)), _)
        | (_, Some(Value::Bool(_))) => to_number(left) == to_number(right),
        (a, b) => a == b,
    }
}

fn strict_eq(left: &Option<Value>, right: &Option<Value>) -> bool {
    match (left, right) {
        (Some(Value::Number(_)), Some(Value::Number(_))) => to_number(left) == to_number(right),
        (a, b) => a == b,
    }
}

fn compare(left: &Option<Value>, right: &Option<Value>, test: fn(std::cmp::Ordering) -> bool) -> bool {
    if let (Some(Value::String(a)), Some(Value::String(b))) = (left, right) {
        return test(a.cmp(b));
    }
    to_number(left)
        .partial_cmp(&to_number(right))
        .is_some_and(test)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn eval(source: &str, scope: Value) -> Result<Option<Value>, ExprError> {
        let Value::Object(map) = scope else { panic!("scope must be an object") };
        Evaluator::new().evaluate(source, &map)
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("1+1", json!({})).unwrap(), Some(json!(2)));
        assert_eq!(eval("7 % 4 * 2", json!({})).unwrap(), Some(json!(6)));
        assert_eq!(eval("1 / 4", json!({})).unwrap(), Some(json!(0.25)));
        assert_eq!(eval("-n + 1", json!({"n": 3})).unwrap(), Some(json!(-2)));
    }

    #[test]
    fn test_string_concatenation() {
        assert_eq!(eval("'a' + 1", json!({})).unwrap(), Some(json!("a1")));
        assert_eq!(eval("name + '!'", json!({"name": "x"})).unwrap(), Some(json!("x!")));
    }

    #[test]
    fn test_paths() {
        let scope = json!({"user": {"name": "ada", "tags": ["a", "b"]}});
        assert_eq!(eval("user.name", scope.clone()).unwrap(), Some(json!("ada")));
        assert_eq!(eval("user.tags[1]", scope.clone()).unwrap(), Some(json!("b")));
        assert_eq!(eval("user.tags.length", scope.clone()).unwrap(), Some(json!(2)));
        assert_eq!(eval("user['name']", scope.clone()).unwrap(), Some(json!("ada")));
        assert_eq!(eval("user.missing", scope).unwrap(), None);
    }

    #[test]
    fn test_member_of_undefined_is_an_error() {
        assert_eq!(
            eval("ghost.name", json!({})),
            Err(ExprError::NullAccess { property: "name".into(), base: "undefined" })
        );
    }

    #[test]
    fn test_comparisons_and_logic() {
        assert_eq!(eval("1 == '1'", json!({})).unwrap(), Some(json!(true)));
        assert_eq!(eval("1 === '1'", json!({})).unwrap(), Some(json!(false)));
        assert_eq!(eval("null == undefined", json!({})).unwrap(), Some(json!(true)));
        assert_eq!(eval("'b' > 'a' && 2 >= 2", json!({})).unwrap(), Some(json!(true)));
        assert_eq!(eval("missing || 'fallback'", json!({})).unwrap(), Some(json!("fallback")));
        assert_eq!(eval("zero ?? 5", json!({"zero": 0})).unwrap(), Some(json!(0)));
        assert_eq!(eval("flag ? 'on' : 'off'", json!({"flag": false})).unwrap(), Some(json!("off")));
    }

    #[test]
    fn test_whitelisted_calls() {
        assert_eq!(eval("len(items)", json!({"items": [1, 2, 3]})).unwrap(), Some(json!(3)));
        assert_eq!(eval("upper('ab')", json!({})).unwrap(), Some(json!("AB")));
        assert_eq!(eval("join(['a','b'], '-')", json!({})).unwrap(), Some(json!("a-b")));
        assert_eq!(
            eval("system('rm')", json!({})),
            Err(ExprError::UnknownFunction("system".into()))
        );
    }

    #[test]
    fn test_registered_function() {
        let mut evaluator = Evaluator::empty();
        evaluator.register_fn("double", |args| Ok(Some(number(to_number(&args[0].clone()) * 2.0))));
        let scope = Map::new();
        assert_eq!(evaluator.evaluate("double(21)", &scope).unwrap(), Some(json!(42)));
        assert!(evaluator.evaluate("len('x')", &scope).is_err());
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            eval("{a: 1, b: [true, null], c: undefined}", json!({})).unwrap(),
            Some(json!({"a": 1, "b": [true, null]}))
        );
    }
}
