use futures_util::future::LocalBoxFuture;

use super::{ready, resolve_text};
use crate::context::{FinishJob, RenderContext};
use crate::directive::{Directive, Phase, MAX_RANK};
use crate::error::RenderError;
use crate::renderer::FinishedEvent;

/// `jstl-on-finished`: queues a registered finish handler on the root
/// context. It runs once the whole render is ready, awaited unless
/// `jstl-on-finished-async` is present.
pub struct OnFinished;

impl Directive for OnFinished {
    fn name(&self) -> &'static str { "on-finished" }
    fn rank(&self) -> u32 { MAX_RANK }
    fn phase(&self) -> Phase { Phase::Finish }

    fn execute<'a>(&'a self, ctx: &'a mut RenderContext) -> LocalBoxFuture<'a, Result<(), RenderError>> {
        ready(queue(ctx))
    }
}

fn queue(ctx: &mut RenderContext) -> Result<(), RenderError> {
    let Some(name) = ctx.directive_attribute("on-finished") else { return Ok(()) };
    let name = resolve_text(ctx, &name);
    let name = name.trim();
    let handler = ctx
        .renderer()
        .finish_handler(name)
        .ok_or_else(|| RenderError::InvalidHandler(format!("no finish handler named `{name}`")))?;

    let job = FinishJob {
        handler,
        event: FinishedEvent {
            element: ctx.element(),
            root: ctx.root,
            template: ctx.template_node(),
            dom: ctx.dom(),
        },
        asynchronous: ctx.has_attribute("jstl-on-finished-async"),
    };
    ctx.renderer().queue_finish(ctx.root_key(), job);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use futures_util::FutureExt;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::directives::testing::{render_with, renderer};
    use crate::loader::MemoryFetch;

    #[tokio::test]
    async fn test_handlers_run_after_whole_tree() {
        let renderer = renderer(MemoryFetch::new());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        renderer.register_finish_handler("done", move |event| {
            let sink = sink.clone();
            async move {
                let doc = event.dom.borrow();
                let element = event.element.expect("finished element");
                // The root container already holds the complete output.
                sink.borrow_mut().push((doc.tag(element).map(str::to_string), doc.inner_html(event.root)));
            }
            .boxed_local()
        });

        let markup = r#"<p jstl-on-finished="done">a</p><i>b</i>"#;
        render_with(&renderer, markup, json!({})).await;
        assert_eq!(
            *seen.borrow(),
            vec![(Some("p".to_string()), "<p>a</p><i>b</i>".to_string())]
        );
    }

    #[tokio::test]
    async fn test_unknown_handler_is_logged() {
        let renderer = renderer(MemoryFetch::new());
        let container = render_with(&renderer, r#"<p jstl-on-finished="nope">a</p>"#, json!({})).await;
        assert_eq!(renderer.dom().borrow().inner_html(container), "<p>a</p>");
    }
}
