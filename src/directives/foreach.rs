use futures_util::future::LocalBoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::resolve;
use crate::context::{InsertMode, RenderContext};
use crate::directive::{Directive, Phase, PREFIX};
use crate::dom::NodeId;
use crate::error::RenderError;
use crate::expr::{self, is_truthy};
use crate::scope::DefaultValue;

/// `jstl-foreach`: renders a copy of the element, without its loop
/// attributes, once per item.
///
/// Options, each `jstl-foreach-<option>`: `var` (default `item`), `status`
/// (default `status`), `start`, `step`, `count`, `until`. With `count`, or a
/// number as the source, the loop counts; otherwise it walks the collection.
pub struct Foreach;

impl Directive for Foreach {
    fn name(&self) -> &'static str { "foreach" }
    fn rank(&self) -> u32 { 1000 }
    fn phase(&self) -> Phase { Phase::Template }

    fn execute<'a>(&'a self, ctx: &'a mut RenderContext) -> LocalBoxFuture<'a, Result<(), RenderError>> {
        iterate(ctx, "foreach").boxed_local()
    }
}

/// `jstl-repeat`: like `foreach`, but every iteration renders the original
/// element with `repeat` switched off for that iteration only.
pub struct Repeat;

impl Directive for Repeat {
    fn name(&self) -> &'static str { "repeat" }
    fn rank(&self) -> u32 { 1100 }
    fn phase(&self) -> Phase { Phase::Template }

    fn execute<'a>(&'a self, ctx: &'a mut RenderContext) -> LocalBoxFuture<'a, Result<(), RenderError>> {
        iterate(ctx, "repeat").boxed_local()
    }
}

struct Loop {
    source: Option<Value>,
    var: String,
    status: String,
    start: f64,
    step: f64,
    count: Option<f64>,
    until: Option<String>,
}

impl Loop {
    fn read(ctx: &RenderContext, name: &str) -> Result<Option<Self>, RenderError> {
        let Some(source) = ctx.directive_attribute(name) else { return Ok(None) };
        let option = |key: &str| ctx.directive_attribute(&format!("{name}-{key}"));
        let number = |key: &str| option(key).map(|expr| expr::to_number(&resolve(ctx, &expr)));

        let step = number("step").unwrap_or(1.0);
        if !(step.is_finite() && step > 0.0) {
            return Err(RenderError::InvalidLoop(format!("{name} step must be positive, got {step}")));
        }
        let start = number("start").unwrap_or(0.0);
        if !start.is_finite() || start < 0.0 {
            return Err(RenderError::InvalidLoop(format!("{name} start must be a non-negative number")));
        }

        Ok(Some(Loop {
            source: match source.trim() {
                "" => None,
                expr => resolve(ctx, expr),
            },
            var: option("var").map_or_else(|| "item".to_string(), |v| v.trim().to_string()),
            status: option("status").map_or_else(|| "status".to_string(), |v| v.trim().to_string()),
            start,
            step,
            count: number("count"),
            until: option("until"),
        }))
    }

    /// `(item, status)` per iteration.
    fn iterations(&self) -> Result<Vec<(Value, Value)>, RenderError> {
        let count = self.count.or(match &self.source {
            Some(Value::Number(n)) => n.as_f64(),
            _ => None,
        });

        if let Some(count) = count {
            let count = if count.is_finite() && count > 0.0 { count.floor() as u64 } else { 0 };
            return Ok((0..count)
                .map(|index| {
                    let item = expr::number(self.start + index as f64 * self.step);
                    let status = json!({
                        "index": index,
                        "number": index + 1,
                        "count": count,
                        "step": expr::number(self.step),
                    });
                    (item, status)
                })
                .collect());
        }

        let source = self.source.clone().unwrap_or(Value::Null);
        let items: Vec<Value> = match &source {
            Value::Array(items) => items.clone(),
            Value::Object(map) => map.keys().cloned().map(Value::String).collect(),
            Value::Null => Vec::new(),
            other => {
                return Err(RenderError::InvalidLoop(format!("cannot iterate over {other}")));
            }
        };
        let length = items.len();
        let stride = (self.step.floor() as usize).max(1);
        Ok(items
            .into_iter()
            .enumerate()
            .skip(self.start as usize)
            .step_by(stride)
            .map(|(index, item)| {
                let status = json!({
                    "index": index,
                    "number": index + 1,
                    "length": length,
                    "data": source,
                });
                (item, status)
            })
            .collect())
    }
}

async fn iterate(ctx: &mut RenderContext, name: &'static str) -> Result<(), RenderError> {
    let Some(node) = ctx.template_node() else { return Ok(()) };
    let Some(plan) = Loop::read(ctx, name)? else { return Ok(()) };
    let iterations = plan.iterations()?;
    debug!(context = ctx.id(), directive = name, iterations = iterations.len(), "iterating");

    let dom = ctx.dom();
    let template = if name == "repeat" { node } else { stripped(ctx, node, name) };
    let fragment = dom.borrow_mut().create_fragment();
    let renderer = ctx.renderer().clone();
    // Data the originating context bound is already in scope for every item.
    let bound: Vec<&'static str> = renderer
        .registry()
        .iter()
        .filter(|directive| directive.phase() == Phase::Data)
        .map(|directive| directive.name())
        .collect();

    for (item, status) in iterations {
        let mut data = Map::new();
        data.insert(plan.var.clone(), item);
        data.insert(plan.status.clone(), status);
        let resolver = ctx.resolver.child(name, Value::Object(data));
        if let Some(until) = &plan.until {
            if is_truthy(&resolver.resolve(until, DefaultValue::none())) {
                break;
            }
        }

        let mut child = ctx.child(vec![template], resolver);
        child.container = Some(fragment);
        child.mode = InsertMode::Append;
        if name == "repeat" {
            child.ignore_directive(name);
        }
        for directive in &bound {
            child.ignore_directive(directive);
        }
        renderer.render_context(&mut child).await?;
    }

    ctx.content = dom.borrow().children(fragment).to_vec();
    ctx.terminate();
    Ok(())
}

/// Deep copy of `node` without its `jstl-<name>*` attributes.
fn stripped(ctx: &RenderContext, node: NodeId, name: &str) -> NodeId {
    let dom = ctx.dom();
    let mut doc = dom.borrow_mut();
    let copy = doc.deep_clone(node);
    let prefix = format!("{PREFIX}{name}");
    let loop_attrs: Vec<String> = doc
        .attrs(copy)
        .iter()
        .filter(|(attr, _)| attr.starts_with(&prefix))
        .map(|(attr, _)| attr.clone())
        .collect();
    for attr in loop_attrs {
        doc.remove_attr(copy, &attr);
    }
    copy
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    use crate::directives::testing::{render, render_with};
    use crate::loader::MemoryFetch;
    use crate::renderer::Renderer;
    use pretty_assertions::assert_eq;

    fn counting(count: f64, start: f64, step: f64) -> Loop {
        Loop {
            source: None,
            var: "item".into(),
            status: "status".into(),
            start,
            step,
            count: Some(count),
            until: None,
        }
    }

    #[test]
    fn test_count_mode_status() {
        let iterations = counting(3.0, 10.0, 5.0).iterations().unwrap();
        let items: Vec<Value> = iterations.iter().map(|(item, _)| item.clone()).collect();
        assert_eq!(items, vec![json!(10), json!(15), json!(20)]);
        assert_eq!(iterations[2].1, json!({ "index": 2, "number": 3, "count": 3, "step": 5 }));
    }

    #[test]
    fn test_collection_mode_status() {
        let mut plan = counting(0.0, 1.0, 1.0);
        plan.count = None;
        plan.source = Some(json!(["a", "b", "c"]));
        let iterations = plan.iterations().unwrap();
        assert_eq!(iterations.len(), 2);
        assert_eq!(iterations[0].0, json!("b"));
        assert_eq!(
            iterations[0].1,
            json!({ "index": 1, "number": 2, "length": 3, "data": ["a", "b", "c"] })
        );
    }

    #[test]
    fn test_scalars_are_not_iterable() {
        let mut plan = counting(0.0, 0.0, 1.0);
        plan.count = None;
        plan.source = Some(json!("abc"));
        assert!(matches!(plan.iterations(), Err(RenderError::InvalidLoop(_))));
    }

    #[tokio::test]
    async fn test_count_renders_indexes() {
        let markup = r#"<ul><li jstl-foreach jstl-foreach-count="3">${status.index}</li></ul>"#;
        assert_eq!(render(markup, json!({})).await, "<ul><li>0</li><li>1</li><li>2</li></ul>");
    }

    #[tokio::test]
    async fn test_empty_collection_renders_nothing() {
        let markup = r#"<ul><li jstl-foreach="${items}">${item}</li></ul>"#;
        assert_eq!(render(markup, json!({ "items": [] })).await, "<ul></ul>");
    }

    #[tokio::test]
    async fn test_custom_var_and_until() {
        let markup = r#"<p><b jstl-foreach="${people}" jstl-foreach-var="p" jstl-foreach-until="${p.stop}">${p.name}</b></p>"#;
        let data = json!({ "people": [{ "name": "a" }, { "name": "b" }, { "name": "c", "stop": true }, { "name": "d" }] });
        assert_eq!(render(markup, data).await, "<p><b>a</b><b>b</b></p>");
    }

    #[tokio::test]
    async fn test_object_keys() {
        let markup = r#"<p><i jstl-foreach="${map}">${item}=${map[item]}</i></p>"#;
        let html = render(markup, json!({ "map": { "x": 1 } })).await;
        assert_eq!(html, "<p><i>x=1</i></p>");
    }

    #[tokio::test]
    async fn test_repeat_rerenders_original() {
        let markup = r#"<div><span jstl-repeat="${[1, 2]}" title="t${item}">${item}</span></div>"#;
        assert_eq!(
            render(markup, json!({})).await,
            r#"<div><span title="t1">1</span><span title="t2">2</span></div>"#
        );
    }

    #[tokio::test]
    async fn test_invalid_step_is_logged() {
        let markup = r#"<p jstl-foreach="${[1]}" jstl-foreach-step="0">x</p>"#;
        assert_eq!(render(markup, json!({})).await, "<p>x</p>");
    }

    #[tokio::test]
    async fn test_loop_data_is_loaded_once() {
        let fetch = Rc::new(MemoryFetch::new().with("/api", r#"["a", "b", "c"]"#));
        let renderer = Renderer::builder().fetch(fetch.clone()).build();
        let markup = r#"<li jstl-data="/api" jstl-data-mode="remote" jstl-data-var="rows" jstl-foreach="${rows}">${item}</li>"#;
        let container = render_with(&renderer, markup, json!({})).await;
        assert_eq!(renderer.dom().borrow().inner_html(container), "<li>a</li><li>b</li><li>c</li>");
        assert_eq!(fetch.hits(), 1);
    }
}
