//! Built-in directives
//!
//! | directive     | phase    | rank     |
//! |---------------|----------|----------|
//! | `initial`     | init     | MIN_RANK |
//! | `if`          | init     | 100      |
//! | `data`        | data     | 1000     |
//! | `choose`      | template | 500      |
//! | `foreach`     | template | 1000     |
//! | `repeat`      | template | 1100     |
//! | `include`     | template | 2000     |
//! | `attributes`  | content  | 1000     |
//! | `text`        | content  | 2000     |
//! | `on-finished` | finish   | MAX_RANK |

mod attributes;
mod condition;
mod data;
mod foreach;
mod include;
mod initial;
mod on_finished;
mod text;

use std::rc::Rc;

use futures_util::future::LocalBoxFuture;
use futures_util::FutureExt;
use serde_json::Value;

pub use attributes::Attributes;
pub use condition::{Choose, If};
pub use data::Data;
pub use foreach::{Foreach, Repeat};
pub use include::Include;
pub use initial::Initial;
pub use on_finished::OnFinished;
pub use text::Text;

use crate::context::RenderContext;
use crate::directive::Directive;
use crate::error::RenderError;
use crate::scope::DefaultValue;

pub fn defaults() -> Vec<Rc<dyn Directive>> {
    vec![
        Rc::new(Initial),
        Rc::new(If),
        Rc::new(Data),
        Rc::new(Choose),
        Rc::new(Foreach),
        Rc::new(Repeat),
        Rc::new(Include),
        Rc::new(Attributes),
        Rc::new(Text),
        Rc::new(OnFinished),
    ]
}

fn ready<'a>(result: Result<(), RenderError>) -> LocalBoxFuture<'a, Result<(), RenderError>> {
    futures_util::future::ready(result).boxed_local()
}

/// Resolve an attribute expression against the context's scope, no fallback.
fn resolve(ctx: &RenderContext, expr: &str) -> Option<Value> {
    ctx.resolver.resolve(expr, DefaultValue::none())
}

fn resolve_text(ctx: &RenderContext, text: &str) -> String {
    ctx.resolver.resolve_text(text, DefaultValue::none())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::rc::Rc;

    use serde_json::Value;

    use crate::dom::NodeId;
    use crate::loader::MemoryFetch;
    use crate::renderer::{RenderRequest, Renderer};

    pub fn renderer(fetch: MemoryFetch) -> Renderer {
        Renderer::builder().fetch(Rc::new(fetch)).build()
    }

    /// Render `markup` into a fresh `<div>` and return the container.
    pub async fn render_with(renderer: &Renderer, markup: &str, data: Value) -> NodeId {
        let container = renderer.dom().borrow_mut().create_element("div");
        renderer
            .render(RenderRequest::new(container).template(markup).data(data))
            .await
            .unwrap();
        container
    }

    pub async fn render(markup: &str, data: Value) -> String {
        let renderer = renderer(MemoryFetch::new());
        let container = render_with(&renderer, markup, data).await;
        let html = renderer.dom().borrow().inner_html(container);
        html
    }
}
