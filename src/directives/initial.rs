use std::time::Duration;

use futures_util::future::LocalBoxFuture;
use futures_util::FutureExt;
use tracing::debug;

use crate::context::RenderContext;
use crate::directive::{Directive, Phase, MIN_RANK, PREFIX};
use crate::error::RenderError;
use crate::scope::DefaultValue;

const ASYNC_PLACEHOLDER: &str = "jstl-async";

/// Builds the output node for the template node: a verbatim copy for
/// character data and ignored elements, a placeholder for deferred elements,
/// and an empty element shell otherwise.
pub struct Initial;

impl Directive for Initial {
    fn name(&self) -> &'static str { "initial" }
    fn rank(&self) -> u32 { MIN_RANK }
    fn phase(&self) -> Phase { Phase::Init }

    fn execute<'a>(&'a self, ctx: &'a mut RenderContext) -> LocalBoxFuture<'a, Result<(), RenderError>> {
        shell(ctx).boxed_local()
    }
}

async fn shell(ctx: &mut RenderContext) -> Result<(), RenderError> {
    let Some(node) = ctx.template_node() else { return Ok(()) };
    let dom = ctx.dom();
    let tag = dom.borrow().tag(node).map(str::to_string);

    let Some(tag) = tag else {
        let copy = dom.borrow_mut().shallow_clone(node);
        ctx.content = vec![copy];
        ctx.ignore = true;
        return Ok(());
    };

    if ctx.has_attribute("jstl-ignore") {
        let copy = dom.borrow_mut().deep_clone(node);
        ctx.content = vec![copy];
        ctx.terminate();
        return Ok(());
    }

    if !ctx.is_deferred() {
        if let Some(delay) = ctx.directive_attribute("async") {
            let delay = delay
                .trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .unwrap_or_else(|_| ctx.renderer().config().async_delay());
            let placeholder = dom.borrow_mut().create_comment(ASYNC_PLACEHOLDER);
            debug!(context = ctx.id(), delay_ms = delay.as_millis() as u64, "deferring render");
            ctx.renderer()
                .render_deferred(node, ctx.resolver.clone(), placeholder, ctx.root, delay);
            ctx.content = vec![placeholder];
            ctx.terminate();
            return Ok(());
        }
    }

    if tag == "template" {
        let shell = {
            let mut doc = dom.borrow_mut();
            let shell = doc.shallow_clone(node);
            let reserved: Vec<String> = doc
                .attrs(shell)
                .iter()
                .filter(|(name, _)| name.starts_with(PREFIX))
                .map(|(name, _)| name.clone())
                .collect();
            for name in reserved {
                doc.remove_attr(shell, &name);
            }
            shell
        };
        ctx.content = vec![shell];
        let renderer = ctx.renderer().clone();
        renderer.render_children(ctx).await?;
        ctx.terminate();
        return Ok(());
    }

    let tag = match ctx.directive_attribute("tagname") {
        Some(expr) => {
            let resolved = ctx.resolver.resolve_text(&expr, DefaultValue::of(tag.clone()));
            match resolved.trim() {
                "" => tag,
                name => name.to_string(),
            }
        }
        None => tag,
    };
    let element = dom.borrow_mut().create_element(&tag);
    ctx.content = vec![element];
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::directives::testing::{render, render_with, renderer};
    use crate::loader::MemoryFetch;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_ignored_subtree_is_verbatim() {
        let html = render(r#"<div jstl-ignore><b title="${x}">${x}</b></div>"#, json!({ "x": 1 })).await;
        assert_eq!(html, r#"<div jstl-ignore=""><b title="${x}">${x}</b></div>"#);
    }

    #[tokio::test]
    async fn test_comments_are_copied() {
        let html = render("<p><!-- keep -->a</p>", json!({})).await;
        assert_eq!(html, "<p><!-- keep -->a</p>");
    }

    #[tokio::test]
    async fn test_tagname_is_resolved() {
        let html = render(r#"<div jstl-tagname="${level}">x</div>"#, json!({ "level": "h2" })).await;
        assert_eq!(html, "<h2>x</h2>");
    }

    #[tokio::test]
    async fn test_template_renders_into_shell() {
        let html = render(r#"<template jstl-if="true" id="t"><i>${n}</i></template>"#, json!({ "n": 4 })).await;
        assert_eq!(html, r#"<template id="t"><i>4</i></template>"#);
    }

    #[tokio::test]
    async fn test_async_renders_after_delay() {
        // No ambient LocalSet: deferred work runs on the renderer's own.
        let renderer = renderer(MemoryFetch::new());
        let container = render_with(&renderer, r#"<p jstl-async="5">${n}</p>"#, json!({ "n": 2 })).await;
        let html = renderer.dom().borrow().inner_html(container);
        assert_eq!(html, "<!--jstl-async-->");

        renderer.settle().await;
        let html = renderer.dom().borrow().inner_html(container);
        assert_eq!(html, "<p>2</p>");
    }

    #[tokio::test]
    async fn test_nested_template_keeps_table_parts() {
        let markup = r#"<table><template jstl-if="true"><tr><td>${n}</td></tr></template></table>"#;
        let html = render(markup, json!({ "n": 1 })).await;
        assert_eq!(html, "<table><template><tr><td>1</td></tr></template></table>");
    }
}
