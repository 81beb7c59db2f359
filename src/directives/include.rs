use futures_util::future::LocalBoxFuture;
use futures_util::FutureExt;
use tracing::debug;

use super::resolve_text;
use crate::context::{InsertMode, RenderContext};
use crate::directive::{Directive, Phase};
use crate::error::RenderError;
use crate::loader::TemplateDesignator;

/// `jstl-include`: renders a loaded template into the element.
///
/// `jstl-include-mode` defaults to `replace`. With `append` or `prepend` the
/// element's own children are rendered first.
pub struct Include;

impl Directive for Include {
    fn name(&self) -> &'static str { "include" }
    fn rank(&self) -> u32 { 2000 }
    fn phase(&self) -> Phase { Phase::Template }

    fn execute<'a>(&'a self, ctx: &'a mut RenderContext) -> LocalBoxFuture<'a, Result<(), RenderError>> {
        include(ctx).boxed_local()
    }
}

async fn include(ctx: &mut RenderContext) -> Result<(), RenderError> {
    let Some(url) = ctx.directive_attribute("include") else { return Ok(()) };
    let Some(element) = ctx.element() else { return Ok(()) };
    let mode = match ctx.directive_attribute("include-mode") {
        Some(mode) => mode.parse::<InsertMode>()?,
        None => InsertMode::Replace,
    };
    let url = resolve_text(ctx, &url).trim().to_string();
    if url.is_empty() {
        debug!(context = ctx.id(), "include resolved to an empty url");
        return Ok(());
    }

    let renderer = ctx.renderer().clone();
    let dom = ctx.dom();
    let source = renderer
        .loader()
        .load(TemplateDesignator::Url(url), &dom, renderer.config().cache_templates, None)
        .await?;
    let nodes = source.draw(&mut dom.borrow_mut());

    if mode != InsertMode::Replace {
        renderer.render_children(ctx).await?;
    }
    let resolver = ctx.resolver.clone();
    let mut child = ctx.child(nodes, resolver);
    child.container = Some(element);
    child.mode = mode;
    renderer.render_context(&mut child).await?;
    ctx.ignore = true;
    Ok(())
}
