use futures_util::future::LocalBoxFuture;
use tracing::debug;

use super::{ready, resolve};
use crate::context::RenderContext;
use crate::directive::{Directive, Phase};
use crate::error::RenderError;
use crate::expr::is_truthy;

/// `jstl-if`: a falsy guard drops the element and everything after it.
pub struct If;

impl Directive for If {
    fn name(&self) -> &'static str { "if" }
    fn rank(&self) -> u32 { 100 }
    fn phase(&self) -> Phase { Phase::Init }

    fn execute<'a>(&'a self, ctx: &'a mut RenderContext) -> LocalBoxFuture<'a, Result<(), RenderError>> {
        ready(guard(ctx))
    }
}

fn guard(ctx: &mut RenderContext) -> Result<(), RenderError> {
    let Some(expr) = ctx.directive_attribute("if") else { return Ok(()) };
    if !is_truthy(&resolve(ctx, &expr)) {
        debug!(context = ctx.id(), guard = %expr, "if guard is false");
        ctx.content.clear();
        ctx.terminate();
    }
    Ok(())
}

/// `jstl-choose`: of the children marked `jstl-when`, only the first truthy
/// one is rendered; `jstl-otherwise` children render only if none matched.
pub struct Choose;

impl Directive for Choose {
    fn name(&self) -> &'static str { "choose" }
    fn rank(&self) -> u32 { 500 }
    fn phase(&self) -> Phase { Phase::Template }

    fn execute<'a>(&'a self, ctx: &'a mut RenderContext) -> LocalBoxFuture<'a, Result<(), RenderError>> {
        ready(choose(ctx))
    }
}

fn choose(ctx: &mut RenderContext) -> Result<(), RenderError> {
    if !ctx.has_attribute("jstl-choose") {
        return Ok(());
    }
    let dom = ctx.dom();
    let mut matched = false;
    let mut keep = Vec::with_capacity(ctx.template_children.len());
    let mut otherwise = Vec::new();

    for child in ctx.template_children.clone() {
        let (when, is_otherwise) = {
            let doc = dom.borrow();
            (doc.attr(child, "jstl-when").map(str::to_string), doc.has_attr(child, "jstl-otherwise"))
        };
        match when {
            Some(expr) => {
                if !matched && is_truthy(&resolve(ctx, &expr)) {
                    matched = true;
                    keep.push(child);
                }
            }
            None if is_otherwise => {
                otherwise.push(child);
                keep.push(child);
            }
            None => keep.push(child),
        }
    }

    if matched {
        keep.retain(|child| !otherwise.contains(child));
    }
    ctx.template_children = keep;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::directives::testing::render;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_false_guard_renders_nothing() {
        let html = render(r#"<p jstl-if="${shown}" title="${never}">x</p><i>y</i>"#, json!({ "shown": false })).await;
        assert_eq!(html, "<i>y</i>");
    }

    #[tokio::test]
    async fn test_true_guard_renders() {
        let html = render(r#"<p jstl-if="${count > 1}">x</p>"#, json!({ "count": 2 })).await;
        assert_eq!(html, "<p>x</p>");
    }

    #[tokio::test]
    async fn test_choose_keeps_first_true_when() {
        let markup = r#"<div jstl-choose><b jstl-when="${n > 5}">big</b><b jstl-when="${n > 1}">mid</b><b jstl-when="${n > 0}">small</b><b jstl-otherwise>none</b></div>"#;
        assert_eq!(render(markup, json!({ "n": 3 })).await, "<div><b>mid</b></div>");
        assert_eq!(render(markup, json!({ "n": 0 })).await, "<div><b>none</b></div>");
    }
}
