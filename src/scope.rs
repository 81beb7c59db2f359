//! Scope Resolver - named data nodes chained toward a root
//!
//! Lookups walk self -> parent -> ... -> root and cache the hit on the
//! resolver that asked. Every chain shares one write epoch: any write bumps it,
//! which retires every cached entry in the chain.

use serde_json::{Map, Value};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::RenderError;
use crate::expr::{self, Evaluator, Scope};

/// Fallback for a resolution call, tagged present or absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DefaultValue(Option<Value>);

impl DefaultValue {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn of(value: impl Into<Value>) -> Self {
        Self(Some(value.into()))
    }

    pub fn is_present(&self) -> bool {
        self.0.is_some()
    }

    pub fn value(&self) -> Option<&Value> {
        self.0.as_ref()
    }

    fn into_resolved(self) -> Option<Value> {
        self.0
    }
}

/// A `${ [scope::] statement }` occurrence inside a text.
#[derive(Debug, Clone, PartialEq)]
struct Placeholder {
    start: usize,
    end: usize,
    escaped: bool,
    scope: Option<String>,
    statement: String,
}

impl Placeholder {
    fn literal<'a>(&self, text: &'a str) -> &'a str {
        &text[self.start..self.end]
    }
}

/// Finds the first placeholder at or after `from`, balancing braces and
/// skipping over quoted strings inside the statement.
fn find_placeholder(text: &str, from: usize) -> Option<Placeholder> {
    let bytes = text.as_bytes();
    let mut search = from;
    loop {
        let open = search + text.get(search..)?.find("${")?;
        let escaped = open > 0 && bytes[open - 1] == b'\\';
        let mut depth = 1usize;
        let mut quote: Option<u8> = None;
        let mut i = open + 2;
        let mut close = None;
        while i < bytes.len() {
            let b = bytes[i];
            match quote {
                Some(_) if b == b'\\' => i += 1,
                Some(q) if b == q => quote = None,
                Some(_) => {}
                None => match b {
                    b'\'' | b'"' => quote = Some(b),
                    b'{' => depth += 1,
                    b'}' => {
                        depth -= 1;
                        if depth == 0 {
                            close = Some(i);
                            break;
                        }
                    }
                    _ => {}
                },
            }
            i += 1;
        }
        let Some(close) = close else {
            // unterminated: nothing further can match either
            return None;
        };
        let inner = text[open + 2..close].trim();
        let (scope, statement) = split_scope(inner);
        if statement.is_empty() && scope.is_none() && !escaped {
            search = close + 1;
            continue;
        }
        return Some(Placeholder {
            start: if escaped { open - 1 } else { open },
            end: close + 1,
            escaped,
            scope,
            statement: statement.to_string(),
        });
    }
}

fn split_scope(inner: &str) -> (Option<String>, &str) {
    if let Some((prefix, rest)) = inner.split_once("::") {
        let prefix = prefix.trim();
        let is_name = !prefix.is_empty()
            && prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if is_name {
            return (Some(prefix.to_string()), rest.trim());
        }
    }
    (None, inner)
}

pub(crate) fn has_placeholder(text: &str) -> bool {
    find_placeholder(text, 0).is_some()
}

/// True when `text` is exactly one unescaped placeholder.
pub(crate) fn is_single_placeholder(text: &str) -> bool {
    let trimmed = text.trim();
    find_placeholder(trimmed, 0).is_some_and(|p| !p.escaped && p.start == 0 && p.end == trimmed.len())
}

struct ResolverNode {
    name: String,
    data: RefCell<Value>,
    parent: Option<Resolver>,
    cache: RefCell<HashMap<String, (u64, Option<Value>)>>,
    epoch: Rc<Cell<u64>>,
    evaluator: Rc<Evaluator>,
    eval_warn: Duration,
}

/// A named data node in a parent-linked chain. Cloning shares the node.
#[derive(Clone)]
pub struct Resolver(Rc<ResolverNode>);

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("name", &self.0.name)
            .field("data", &self.0.data.borrow())
            .field("parent", &self.0.parent.as_ref().map(|p| p.name().to_string()))
            .finish()
    }
}

impl Resolver {
    /// A root resolver with the default evaluator.
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self::root(name, data, Rc::new(Evaluator::new()), Duration::from_secs(1))
    }

    pub fn root(name: impl Into<String>, data: Value, evaluator: Rc<Evaluator>, eval_warn: Duration) -> Self {
        Resolver(Rc::new(ResolverNode {
            name: name.into(),
            data: RefCell::new(data),
            parent: None,
            cache: RefCell::new(HashMap::new()),
            epoch: Rc::new(Cell::new(0)),
            evaluator,
            eval_warn,
        }))
    }

    /// Layer a new resolver under this one.
    pub fn child(&self, name: impl Into<String>, data: Value) -> Self {
        Resolver(Rc::new(ResolverNode {
            name: name.into(),
            data: RefCell::new(data),
            parent: Some(self.clone()),
            cache: RefCell::new(HashMap::new()),
            epoch: self.0.epoch.clone(),
            evaluator: self.0.evaluator.clone(),
            eval_warn: self.0.eval_warn,
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn parent(&self) -> Option<&Resolver> {
        self.0.parent.as_ref()
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.0.evaluator
    }

    pub fn ptr_eq(&self, other: &Resolver) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// A copy of this resolver's own data.
    pub fn data(&self) -> Value {
        self.0.data.borrow().clone()
    }

    /// Replace this resolver's own data wholesale.
    pub fn set_data(&self, data: Value) {
        *self.0.data.borrow_mut() = data;
        self.invalidate();
    }

    fn invalidate(&self) {
        self.0.cache.borrow_mut().clear();
        self.0.epoch.set(self.0.epoch.get() + 1);
    }

    fn chain(&self) -> impl Iterator<Item = &Resolver> {
        std::iter::successors(Some(self), |r| r.parent())
    }

    fn own(&self, key: &str) -> Option<Value> {
        self.0.data.borrow().get(key).cloned()
    }

    fn defines(&self, key: &str) -> bool {
        self.0.data.borrow().get(key).is_some()
    }

    /// First resolver from self toward root named `scope`.
    pub fn find(&self, scope: &str) -> Option<Resolver> {
        self.chain().find(|r| r.name() == scope).cloned()
    }

    fn target(&self, scope: Option<&str>) -> Result<Resolver, RenderError> {
        match scope {
            None => Ok(self.clone()),
            Some(name) => self
                .find(name)
                .ok_or_else(|| RenderError::UnknownScope(name.to_string())),
        }
    }

    /// Chained lookup of a single key.
    pub fn get(&self, key: &str) -> Option<Value> {
        let epoch = self.0.epoch.get();
        if let Some((stamp, cached)) = self.0.cache.borrow().get(key) {
            if *stamp == epoch {
                return cached.clone();
            }
        }
        let found = self.chain().find_map(|r| r.own(key));
        self.0
            .cache
            .borrow_mut()
            .insert(key.to_string(), (epoch, found.clone()));
        found
    }

    pub fn has(&self, key: &str) -> bool {
        self.chain().any(|r| r.defines(key))
    }

    /// Write a key into this resolver's own data.
    pub fn set(&self, key: &str, value: Value) {
        {
            let mut data = self.0.data.borrow_mut();
            ensure_object(&mut data).insert(key.to_string(), value);
        }
        self.invalidate();
    }

    /// Property removal is not part of the resolver contract.
    pub fn delete(&self, _key: &str) -> Result<(), RenderError> {
        Err(RenderError::UnsupportedOperation("delete"))
    }

    /// Dotted-path read. Absent paths read as null.
    pub fn get_data(&self, path: &str, scope: Option<&str>) -> Value {
        let Some(target) = scope.map_or(Some(self.clone()), |name| self.find(name)) else {
            return Value::Null;
        };
        let mut segments = path.split('.').filter(|s| !s.is_empty());
        let Some(first) = segments.next() else {
            return target.data();
        };
        let mut current = match target.get(first) {
            Some(value) => value,
            None => return Value::Null,
        };
        for segment in segments {
            let next = match &current {
                Value::Object(map) => map.get(segment).cloned(),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i).cloned()),
                _ => None,
            };
            match next {
                Some(value) => current = value,
                None => return Value::Null,
            }
        }
        current
    }

    /// Dotted-path write, allocating missing intermediate mappings.
    ///
    /// A nested path whose head is defined further up the chain writes into
    /// that owner, so every resolver sharing it observes the change.
    pub fn update_data(&self, path: &str, value: Value, scope: Option<&str>) -> Result<(), RenderError> {
        let target = self.target(scope)?;
        let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
        let Some((last, parents)) = segments.split_last() else {
            return Err(RenderError::InvalidPath(path.to_string()));
        };
        let owner = match parents.first() {
            Some(head) => target
                .chain()
                .find(|r| r.defines(head))
                .cloned()
                .unwrap_or_else(|| target.clone()),
            None => target.clone(),
        };
        {
            let mut data = owner.0.data.borrow_mut();
            let mut map = ensure_object(&mut data);
            for segment in parents {
                map = ensure_object(
                    map.entry(segment.to_string())
                        .or_insert_with(|| Value::Object(Map::new())),
                );
            }
            map.insert(last.to_string(), value);
        }
        owner.invalidate();
        if !owner.ptr_eq(self) {
            self.invalidate();
        }
        Ok(())
    }

    /// Deep-merge a mapping into the target scope's data.
    pub fn merge_context(&self, data: Value, scope: Option<&str>) -> Result<(), RenderError> {
        let target = self.target(scope)?;
        {
            let mut own = target.0.data.borrow_mut();
            if !own.is_object() {
                *own = Value::Object(Map::new());
            }
            deep_merge(&mut own, data);
        }
        target.invalidate();
        Ok(())
    }

    /// Resolve the first placeholder in `expr`, or `expr` itself as a statement.
    pub fn resolve(&self, expr: &str, default: DefaultValue) -> Option<Value> {
        match find_placeholder(expr, 0) {
            Some(p) if p.escaped => Some(Value::String(p.literal(expr)[1..].to_string())),
            Some(p) => self.evaluate(p.scope.as_deref(), &p.statement, expr, default),
            None => self.evaluate(None, expr.trim(), expr, default),
        }
    }

    /// Replace every placeholder in `text` with its resolved string form.
    pub fn resolve_text(&self, text: &str, default: DefaultValue) -> String {
        let mut text = text.to_string();
        let mut cursor = 0;
        while let Some(p) = find_placeholder(&text, cursor) {
            let literal = p.literal(&text).to_string();
            if p.escaped {
                let unescaped = &literal[1..];
                text.replace_range(p.start..p.end, unescaped);
                cursor = p.start + unescaped.len();
                continue;
            }
            let value = self.evaluate(p.scope.as_deref(), &p.statement, &literal, default.clone());
            let replacement = expr::display(&value);
            let tail = text[p.start..].replace(&literal, &replacement);
            text.truncate(p.start);
            text.push_str(&tail);
            cursor = p.start + replacement.len();
        }
        text
    }

    fn evaluate(&self, scope: Option<&str>, statement: &str, literal: &str, default: DefaultValue) -> Option<Value> {
        let target = match scope {
            None => self.clone(),
            Some(name) => match self.find(name) {
                Some(found) => found,
                None => return default.into_resolved(),
            },
        };
        let started = Instant::now();
        let result = target.0.evaluator.evaluate(statement, &target);
        let elapsed = started.elapsed();
        if elapsed > self.0.eval_warn {
            warn!(expression = statement, elapsed_ms = elapsed.as_millis() as u64, "slow expression evaluation");
        }
        match result {
            Ok(None) if default.is_present() => default.into_resolved(),
            Ok(value) => value,
            Err(err) => {
                warn!(expression = statement, scope = target.name(), error = %err, "expression evaluation failed");
                if default.is_present() {
                    default.into_resolved()
                } else {
                    Some(Value::String(literal.to_string()))
                }
            }
        }
    }
}

impl Scope for Resolver {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name)
    }
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("replaced with an object above"),
    }
}

fn deep_merge(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => deep_merge(existing, value),
                    _ => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, source) => *target = source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn chain() -> (Resolver, Resolver, Resolver) {
        let root = Resolver::new("root", json!({"a": 1}));
        let middle = root.child("middle", json!({"b": 2}));
        let leaf = middle.child("leaf", json!({}));
        (root, middle, leaf)
    }

    #[test]
    fn test_chain_walk() {
        let (_root, _middle, leaf) = chain();
        assert_eq!(leaf.resolve("${a}", DefaultValue::none()), Some(json!(1)));
        assert_eq!(leaf.resolve("${b}", DefaultValue::none()), Some(json!(2)));
        assert_eq!(leaf.resolve("${zzz}", DefaultValue::of("dflt")), Some(json!("dflt")));
        assert_eq!(leaf.resolve("${zzz}", DefaultValue::none()), None);
    }

    #[test]
    fn test_scope_filter() {
        let (_root, middle, leaf) = chain();
        middle.set("a", json!("shadow"));
        assert_eq!(leaf.resolve("${a}", DefaultValue::none()), Some(json!("shadow")));
        assert_eq!(leaf.resolve("${root::a}", DefaultValue::none()), Some(json!(1)));
        // `b` is not visible from root
        assert_eq!(leaf.resolve("${root::b}", DefaultValue::of(0)), Some(json!(0)));
    }

    #[test]
    fn test_missing_scope_short_circuits() {
        let (_root, _middle, leaf) = chain();
        // would be an evaluation error if it were evaluated
        assert_eq!(leaf.resolve("${nowhere::a.b.c}", DefaultValue::of("d")), Some(json!("d")));
        assert_eq!(leaf.resolve("${nowhere::a}", DefaultValue::none()), None);
    }

    #[test]
    fn test_update_invalidates_cache() {
        let (_root, _middle, leaf) = chain();
        assert_eq!(leaf.resolve("${a}", DefaultValue::none()), Some(json!(1)));
        leaf.update_data("a", json!(5), None).unwrap();
        assert_eq!(leaf.resolve("${a}", DefaultValue::none()), Some(json!(5)));
    }

    #[test]
    fn test_write_upstream_visible_downstream() {
        let (root, _middle, leaf) = chain();
        assert_eq!(leaf.get("a"), Some(json!(1)));
        root.set("a", json!(9));
        assert_eq!(leaf.get("a"), Some(json!(9)));
    }

    #[test]
    fn test_nested_update_reaches_owner() {
        let root = Resolver::new("root", json!({"user": {"name": "ada"}}));
        let leaf = root.child("leaf", json!({}));
        leaf.update_data("user.age", json!(36), None).unwrap();
        assert_eq!(root.get_data("user.age", None), json!(36));
        assert_eq!(leaf.get_data("user.name", None), json!("ada"));
    }

    #[test]
    fn test_get_data_paths() {
        let resolver = Resolver::new("root", json!({"list": [{"x": 1}], "n": null}));
        assert_eq!(resolver.get_data("list.0.x", None), json!(1));
        assert_eq!(resolver.get_data("list.3.x", None), Value::Null);
        assert_eq!(resolver.get_data("absent.path", None), Value::Null);
        assert_eq!(resolver.get_data("list", Some("elsewhere")), Value::Null);
    }

    #[test]
    fn test_update_allocates_intermediates() {
        let resolver = Resolver::new("root", Value::Null);
        resolver.update_data("a.b.c", json!(true), None).unwrap();
        assert_eq!(resolver.data(), json!({"a": {"b": {"c": true}}}));
    }

    #[test]
    fn test_update_unknown_scope() {
        let resolver = Resolver::new("root", json!({}));
        assert!(matches!(
            resolver.update_data("x", json!(1), Some("page")),
            Err(RenderError::UnknownScope(_))
        ));
    }

    #[test]
    fn test_merge_context() {
        let root = Resolver::new("root", json!({"cfg": {"a": 1, "list": [1, 2]}, "keep": true}));
        let leaf = root.child("leaf", json!({}));
        leaf.merge_context(json!({"cfg": {"b": 2, "list": [3]}}), Some("root")).unwrap();
        assert_eq!(
            root.data(),
            json!({"cfg": {"a": 1, "b": 2, "list": [3]}, "keep": true})
        );
    }

    #[test]
    fn test_delete_fails_loudly() {
        let resolver = Resolver::new("root", json!({"a": 1}));
        assert!(matches!(resolver.delete("a"), Err(RenderError::UnsupportedOperation(_))));
    }

    #[test]
    fn test_resolve_text() {
        let resolver = Resolver::new("root", json!({"n": null, "name": "ada"}));
        assert_eq!(resolver.resolve_text("plain", DefaultValue::none()), "plain");
        assert_eq!(resolver.resolve_text("${1+1}", DefaultValue::none()), "2");
        assert_eq!(resolver.resolve_text("\\${1+1}", DefaultValue::none()), "${1+1}");
        assert_eq!(resolver.resolve_text("${n}/${u}", DefaultValue::none()), "null/undefined");
        assert_eq!(
            resolver.resolve_text("hi ${name}, bye ${name}", DefaultValue::none()),
            "hi ada, bye ada"
        );
    }

    #[test]
    fn test_resolve_text_failure_keeps_literal() {
        let resolver = Resolver::new("root", json!({}));
        assert_eq!(
            resolver.resolve_text("[${ghost.name}]", DefaultValue::none()),
            "[${ghost.name}]"
        );
        assert_eq!(resolver.resolve_text("[${ghost.name}]", DefaultValue::of("?")), "[?]");
    }

    #[test]
    fn test_escaped_resolve_returns_literal() {
        let resolver = Resolver::new("root", json!({}));
        assert_eq!(resolver.resolve("\\${1+1}", DefaultValue::none()), Some(json!("${1+1}")));
    }

    #[test]
    fn test_placeholder_with_braces_in_statement() {
        let resolver = Resolver::new("root", json!({}));
        assert_eq!(resolver.resolve("${ {a: '}'} }", DefaultValue::none()), Some(json!({"a": "}"})));
    }

    #[test]
    fn test_bare_statement() {
        let resolver = Resolver::new("root", json!({"names": ["a"]}));
        assert_eq!(resolver.resolve("names", DefaultValue::none()), Some(json!(["a"])));
    }

    #[test]
    fn test_placeholder_shapes() {
        assert!(is_single_placeholder(" ${flag} "));
        assert!(!is_single_placeholder("x ${flag}"));
        assert!(!is_single_placeholder("\\${flag}"));
        assert!(has_placeholder("a ${b} c"));
        assert!(!has_placeholder("a ${ unterminated"));
    }
}
